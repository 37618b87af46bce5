//! Consensus and change-tracking logic for QuestionTree.
//!
//! This crate sits on top of the extractor: it repeats runs and merges them
//! into confidence-scored results, and it diffs tracked targets cycle over
//! cycle through a [`TrackingStore`].

pub mod consensus;
pub mod progress;
pub mod tracking;

pub use consensus::{
    ConsensusOutcome, ConsensusReport, RunAudit, RunSource, confidence, merge_runs, run_consensus,
};
pub use progress::{ProgressReporter, SilentProgress};
pub use tracking::{
    CycleReport, DiffResult, TrackingStore, apply_diff, reconcile, run_cycle, track_target,
};
