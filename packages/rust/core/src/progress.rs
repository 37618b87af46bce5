//! Progress callbacks for long-running consensus requests and tracking cycles.

use questiontree_shared::RunResult;

/// Progress reporter trait (implemented by CLI with indicatif, or no-op for tests).
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called when one extraction run has finished (1-based `current`).
    fn run_finished(&self, current: usize, total: usize, result: &RunResult);
    /// Called after each tracked target in a cycle, whether it succeeded or not.
    fn target_checked(&self, keyword: &str, current: usize, total: usize);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn run_finished(&self, _current: usize, _total: usize, _result: &RunResult) {}
    fn target_checked(&self, _keyword: &str, _current: usize, _total: usize) {}
}
