//! Shared types, error model, configuration, and text normalization for QuestionTree.
//!
//! This crate is the foundation depended on by all other QuestionTree crates.
//! It provides:
//! - [`QuestionTreeError`]: the unified error type
//! - Domain types ([`ExtractionParams`], [`QuestionItem`], [`RunResult`],
//!   [`ConsensusResult`], [`QuestionRecord`], [`ChangeRecord`])
//! - Configuration ([`AppConfig`], [`EngineConfig`], config loading)
//! - Question canonicalization ([`normalize()`], [`question_hash`])

pub mod config;
pub mod error;
pub mod normalize;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, EngineConfig, StorageConfig, config_dir, config_file_path, init_config,
    load_config, load_config_from, parse_proxy_pool,
};
pub use error::{QuestionTreeError, Result};
pub use normalize::{detect_question_type, fold_for_match, hash_normalized, normalize, question_hash};
pub use types::{
    ChangeKind, ChangeRecord, ConsensusResult, Device, Evidence, ExtractionParams,
    MAX_CONSENSUS_RUNS, MAX_ENGINE_DEPTH, MAX_REQUEST_DEPTH, QuestionItem, QuestionRecord,
    QuestionType, RunResult, Snapshot, StopReason, TargetId, TrackedTarget,
};
