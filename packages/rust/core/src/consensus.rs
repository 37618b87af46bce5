//! Multi-run consensus over independent extraction runs.
//!
//! K runs (1..=3) are executed against fresh sessions and merged by
//! normalized question text. The merge is a pure function so it can be
//! exercised without a rendering engine.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use questiontree_extractor::{NO_HASH, RunExecutor};
use questiontree_shared::{
    ConsensusResult, Evidence, ExtractionParams, MAX_CONSENSUS_RUNS, QuestionItem,
    QuestionTreeError, Result, RunResult, StopReason,
};

use crate::progress::ProgressReporter;

/// Weight of the appearance ratio in the confidence score.
const APPEARANCE_WEIGHT: f64 = 0.6;

/// Weight of the depth term in the confidence score.
const DEPTH_WEIGHT: f64 = 0.4;

// ---------------------------------------------------------------------------
// Run source
// ---------------------------------------------------------------------------

/// Anything that can perform one independent extraction run.
#[async_trait]
pub trait RunSource: Send + Sync {
    async fn run(&self, params: &ExtractionParams) -> Result<RunResult>;
}

#[async_trait]
impl RunSource for RunExecutor {
    async fn run(&self, params: &ExtractionParams) -> Result<RunResult> {
        self.run_single(params).await
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Audit data kept for each run, in run order.
#[derive(Debug, Clone)]
pub struct RunAudit {
    pub drift_hash: String,
    pub egress: Option<String>,
    pub stop_reason: StopReason,
    pub item_count: usize,
    pub elapsed_ms: u64,
    pub evidence: Evidence,
}

impl From<RunResult> for RunAudit {
    fn from(run: RunResult) -> Self {
        Self {
            drift_hash: run.drift_hash,
            egress: run.egress,
            stop_reason: run.stop_reason,
            item_count: run.items.len(),
            elapsed_ms: run.elapsed_ms,
            evidence: run.evidence,
        }
    }
}

/// Merged questions plus per-run audit data.
#[derive(Debug, Clone)]
pub struct ConsensusOutcome {
    pub results: Vec<ConsensusResult>,
    pub runs: Vec<RunAudit>,
}

impl ConsensusOutcome {
    /// Whether runs with a computed fingerprint rendered different pages.
    pub fn drift_detected(&self) -> bool {
        let hashes: HashSet<&str> = self
            .runs
            .iter()
            .map(|r| r.drift_hash.as_str())
            .filter(|h| *h != NO_HASH)
            .collect();
        hashes.len() > 1
    }
}

/// Serializable view of a consensus outcome (evidence omitted).
#[derive(Debug, Serialize)]
pub struct ConsensusReport<'a> {
    pub results: &'a [ConsensusResult],
    pub drift_hashes: Vec<&'a str>,
    pub drift_detected: bool,
}

impl<'a> From<&'a ConsensusOutcome> for ConsensusReport<'a> {
    fn from(outcome: &'a ConsensusOutcome) -> Self {
        Self {
            results: &outcome.results,
            drift_hashes: outcome.runs.iter().map(|r| r.drift_hash.as_str()).collect(),
            drift_detected: outcome.drift_detected(),
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestration
// ---------------------------------------------------------------------------

/// Execute `params.runs` runs (clamped to 1..=3) and merge them.
///
/// With `parallelism > 1` runs overlap on spawned tasks, at most
/// `parallelism` at a time; the merge waits for all of them. Any failed run
/// fails the whole request.
#[instrument(skip_all, fields(keyword = %params.keyword, runs = params.runs, parallelism = parallelism))]
pub async fn run_consensus(
    source: Arc<dyn RunSource>,
    params: &ExtractionParams,
    parallelism: usize,
    progress: &dyn ProgressReporter,
) -> Result<ConsensusOutcome> {
    let start = Instant::now();
    let k = params.runs.clamp(1, MAX_CONSENSUS_RUNS) as usize;
    let parallelism = parallelism.clamp(1, k);

    progress.phase(&format!("Running {k} extraction run(s)"));
    let runs = if parallelism == 1 {
        run_sequential(source.as_ref(), params, k, progress).await?
    } else {
        run_parallel(source, params, k, parallelism, progress).await?
    };

    progress.phase("Merging runs");
    let item_lists: Vec<Vec<QuestionItem>> = runs.iter().map(|r| r.items.clone()).collect();
    let results = merge_runs(&item_lists, k as u8, params.strict);
    let outcome = ConsensusOutcome {
        results,
        runs: runs.into_iter().map(RunAudit::from).collect(),
    };

    if outcome.drift_detected() {
        warn!("runs rendered different result pages");
    }
    info!(
        questions = outcome.results.len(),
        strict = params.strict,
        elapsed_ms = start.elapsed().as_millis(),
        "consensus complete"
    );

    Ok(outcome)
}

async fn run_sequential(
    source: &dyn RunSource,
    params: &ExtractionParams,
    k: usize,
    progress: &dyn ProgressReporter,
) -> Result<Vec<RunResult>> {
    let mut runs = Vec::with_capacity(k);
    for i in 0..k {
        let result = source.run(params).await?;
        debug!(run = i + 1, items = result.items.len(), "run finished");
        progress.run_finished(i + 1, k, &result);
        runs.push(result);
    }
    Ok(runs)
}

async fn run_parallel(
    source: Arc<dyn RunSource>,
    params: &ExtractionParams,
    k: usize,
    parallelism: usize,
    progress: &dyn ProgressReporter,
) -> Result<Vec<RunResult>> {
    let semaphore = Arc::new(Semaphore::new(parallelism));
    let mut handles = Vec::with_capacity(k);

    for i in 0..k {
        let source = source.clone();
        let params = params.clone();
        let sem = semaphore.clone();
        handles.push(tokio::spawn(async move {
            // The semaphore is never closed.
            let _permit = sem
                .acquire_owned()
                .await
                .map_err(|_| QuestionTreeError::Cancelled)?;
            debug!(run = i + 1, "run started");
            source.run(&params).await
        }));
    }

    // Barrier: collect every run, in run order, before reporting any failure.
    let mut collected = Vec::with_capacity(k);
    for (i, handle) in handles.into_iter().enumerate() {
        let result = handle.await.unwrap_or_else(|e| {
            Err(QuestionTreeError::Page(format!("run {} aborted: {e}", i + 1)))
        });
        if let Ok(run) = &result {
            progress.run_finished(i + 1, k, run);
        }
        collected.push(result);
    }

    collected.into_iter().collect()
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Accumulator {
    raws: Vec<String>,
    depths: Vec<u8>,
    parents: Vec<String>,
    orders: Vec<usize>,
    runs: HashSet<usize>,
}

/// Merge per-run item lists by normalized text.
///
/// `k` is the requested run count; it is raised to `runs.len()` if smaller so
/// confidence never exceeds 1.
pub fn merge_runs(runs: &[Vec<QuestionItem>], k: u8, strict: bool) -> Vec<ConsensusResult> {
    let k = usize::from(k.clamp(1, MAX_CONSENSUS_RUNS)).max(runs.len());
    let quorum = if strict { k.min(2) } else { 1 };

    let mut keys: Vec<&str> = Vec::new();
    let mut acc: HashMap<&str, Accumulator> = HashMap::new();

    for (run_index, items) in runs.iter().enumerate() {
        for item in items {
            let key = item.normalized.as_str();
            let entry = acc.entry(key).or_insert_with(|| {
                keys.push(key);
                Accumulator::default()
            });
            entry.raws.push(item.raw.clone());
            entry.depths.push(item.depth);
            entry.orders.push(item.order);
            if let Some(parent) = item.parent.as_ref().filter(|p| !p.is_empty()) {
                entry.parents.push(parent.clone());
            }
            entry.runs.insert(run_index);
        }
    }

    let mut results: Vec<ConsensusResult> = keys
        .into_iter()
        .filter_map(|key| {
            let entry = acc.remove(key)?;
            let appearances = entry.runs.len();
            if appearances < quorum {
                return None;
            }
            let depth = entry.depths.iter().copied().min().unwrap_or(0);
            Some(ConsensusResult {
                normalized: key.to_string(),
                raw: most_frequent(&entry.raws).unwrap_or(key).to_string(),
                depth,
                order: entry.orders.iter().copied().min().unwrap_or(0),
                parent: most_frequent(&entry.parents).map(String::from),
                appearances: appearances as u8,
                confidence: confidence(appearances, k, depth),
            })
        })
        .collect();

    results.sort_by(|a, b| {
        b.appearances
            .cmp(&a.appearances)
            .then(a.depth.cmp(&b.depth))
            .then_with(|| a.normalized.cmp(&b.normalized))
    });
    results
}

/// `round(0.6 * appearances / k + 0.4 / (1 + depth), 3)`.
pub fn confidence(appearances: usize, k: usize, depth: u8) -> f64 {
    let ratio = appearances as f64 / k.max(1) as f64;
    let score = APPEARANCE_WEIGHT * ratio + DEPTH_WEIGHT / (1.0 + f64::from(depth));
    (score * 1000.0).round() / 1000.0
}

/// Most frequent value; ties go to the first encountered.
fn most_frequent(values: &[String]) -> Option<&str> {
    let mut counts: Vec<(&str, usize)> = Vec::new();
    for value in values {
        match counts.iter_mut().find(|(v, _)| *v == value.as_str()) {
            Some((_, n)) => *n += 1,
            None => counts.push((value.as_str(), 1)),
        }
    }

    let mut best: Option<(&str, usize)> = None;
    for (value, n) in counts {
        if best.is_none_or(|(_, top)| n > top) {
            best = Some((value, n));
        }
    }
    best.map(|(value, _)| value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::SilentProgress;
    use questiontree_shared::{Device, normalize};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn item(raw: &str, depth: u8, parent: Option<&str>, order: usize) -> QuestionItem {
        QuestionItem {
            raw: raw.into(),
            normalized: normalize(raw),
            depth,
            parent: parent.map(String::from),
            path: String::new(),
            order,
        }
    }

    fn run(items: Vec<QuestionItem>, drift: &str) -> RunResult {
        RunResult {
            items,
            drift_hash: drift.into(),
            ..RunResult::default()
        }
    }

    fn params(runs: u8, strict: bool) -> ExtractionParams {
        ExtractionParams::new("x", "us", "en", Device::Mobile)
            .unwrap()
            .with_runs(runs)
            .with_strict(strict)
    }

    /// Hands out scripted results in call order and tracks concurrency.
    struct ScriptedSource {
        results: Mutex<VecDeque<(Duration, Result<RunResult>)>>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(results: Vec<(Duration, Result<RunResult>)>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results.into()),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            })
        }

        fn ok(runs: Vec<RunResult>) -> Arc<Self> {
            Self::new(runs.into_iter().map(|r| (Duration::ZERO, Ok(r))).collect())
        }
    }

    #[async_trait]
    impl RunSource for ScriptedSource {
        async fn run(&self, _params: &ExtractionParams) -> Result<RunResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let (delay, result) = self
                .results
                .lock()
                .unwrap()
                .pop_front()
                .expect("no scripted run left");
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    // -----------------------------------------------------------------------
    // Merge
    // -----------------------------------------------------------------------

    #[test]
    fn confidence_formula_is_exact() {
        assert_eq!(confidence(2, 2, 0), 1.0);
        assert_eq!(confidence(1, 2, 1), 0.5);
        assert_eq!(confidence(1, 3, 2), 0.333);
        assert_eq!(confidence(2, 3, 0), 0.8);
    }

    #[test]
    fn strict_quorum_drops_single_appearances() {
        let runs = vec![
            vec![item("What is X?", 0, None, 0), item("Why X?", 0, None, 1)],
            vec![item("What is X?", 0, None, 0)],
        ];

        let strict = merge_runs(&runs, 2, true);
        assert_eq!(strict.len(), 1);
        assert_eq!(strict[0].normalized, "what is x?");

        let lenient = merge_runs(&runs, 2, false);
        assert_eq!(lenient.len(), 2);
        assert_eq!(lenient[1].appearances, 1);
    }

    #[test]
    fn strict_with_single_run_keeps_everything() {
        let runs = vec![vec![item("A?", 0, None, 0), item("B?", 0, None, 1)]];
        assert_eq!(merge_runs(&runs, 1, true).len(), 2);
    }

    #[test]
    fn sorts_by_appearances_then_depth_then_text() {
        let runs = vec![
            vec![
                item("Deep shared?", 1, Some("top"), 0),
                item("Top shared?", 0, None, 1),
                item("Alone?", 0, None, 2),
            ],
            vec![item("Deep shared?", 1, Some("top"), 0), item("Top shared?", 0, None, 1)],
        ];
        let merged = merge_runs(&runs, 2, false);
        let summary: Vec<(u8, u8)> = merged.iter().map(|r| (r.appearances, r.depth)).collect();
        assert_eq!(summary, vec![(2, 0), (2, 1), (1, 0)]);
        assert_eq!(merged[0].normalized, "top shared?");
    }

    #[test]
    fn ties_sort_lexicographically() {
        let runs = vec![vec![item("b?", 0, None, 0), item("a?", 0, None, 1)]];
        let merged = merge_runs(&runs, 1, false);
        assert_eq!(merged[0].normalized, "a?");
        assert_eq!(merged[1].normalized, "b?");
    }

    #[test]
    fn representative_fields_follow_frequency_and_minimums() {
        let runs = vec![
            vec![item("What is X?", 1, Some("p1"), 4)],
            vec![item("what is x?", 0, None, 2)],
            vec![item("what is x?", 2, Some("p2"), 7)],
        ];
        let merged = merge_runs(&runs, 3, false);
        assert_eq!(merged.len(), 1);
        let r = &merged[0];
        assert_eq!(r.raw, "what is x?");
        assert_eq!(r.depth, 0);
        assert_eq!(r.order, 2);
        // p1 and p2 tie; the first encountered wins.
        assert_eq!(r.parent.as_deref(), Some("p1"));
        assert_eq!(r.appearances, 3);
        assert_eq!(r.confidence, 1.0);
    }

    #[test]
    fn surface_form_ties_go_to_first_seen() {
        let runs = vec![vec![item("What is X?", 0, None, 0)], vec![item("WHAT is x?", 0, None, 0)]];
        let merged = merge_runs(&runs, 2, false);
        assert_eq!(merged[0].raw, "What is X?");
        assert!(merged[0].parent.is_none());
    }

    #[test]
    fn appearances_and_confidence_stay_in_bounds() {
        let pool = ["a?", "b?", "c?", "d?"];
        for k in 1..=3u8 {
            let runs: Vec<Vec<QuestionItem>> = (0..k as usize)
                .map(|r| {
                    pool.iter()
                        .enumerate()
                        .filter(|(i, _)| (i + r) % 2 == 0 || *i == 0)
                        .map(|(i, q)| item(q, (i % 4) as u8, None, i))
                        .collect()
                })
                .collect();
            for strict in [false, true] {
                for r in merge_runs(&runs, k, strict) {
                    assert!(r.appearances >= 1 && r.appearances <= k);
                    assert!(r.confidence > 0.0 && r.confidence <= 1.0);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Orchestration
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn two_agreeing_runs_yield_full_confidence() {
        let source = ScriptedSource::ok(vec![
            run(vec![item("what is X", 0, None, 0)], "aaaa"),
            run(vec![item("what is X", 0, None, 0)], "aaaa"),
        ]);
        let outcome = run_consensus(source.clone(), &params(2, true), 1, &SilentProgress)
            .await
            .unwrap();

        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.results[0].appearances, 2);
        assert_eq!(outcome.results[0].confidence, 1.0);
        assert_eq!(outcome.runs.len(), 2);
        assert!(!outcome.drift_detected());
        assert_eq!(source.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_count_is_clamped() {
        let source = ScriptedSource::ok((0..5).map(|_| run(vec![], NO_HASH)).collect());
        let mut p = params(3, false);
        p.runs = 9;
        let outcome = run_consensus(source.clone(), &p, 1, &SilentProgress).await.unwrap();
        assert_eq!(outcome.runs.len(), 3);
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn any_failed_run_fails_the_request() {
        let source = ScriptedSource::new(vec![
            (Duration::ZERO, Ok(run(vec![item("a?", 0, None, 0)], "h1"))),
            (
                Duration::ZERO,
                Err(QuestionTreeError::SessionAcquisition("no browser".into())),
            ),
        ]);
        let err = run_consensus(source, &params(2, false), 1, &SilentProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, QuestionTreeError::SessionAcquisition(_)));
    }

    #[tokio::test]
    async fn parallel_runs_overlap_and_keep_run_order() {
        let source = ScriptedSource::new(vec![
            (Duration::from_millis(120), Ok(run(vec![item("a?", 0, None, 0)], "first"))),
            (Duration::from_millis(60), Ok(run(vec![item("a?", 0, None, 0)], "second"))),
            (Duration::from_millis(10), Ok(run(vec![item("b?", 0, None, 0)], "third"))),
        ]);
        let outcome = run_consensus(source.clone(), &params(3, false), 3, &SilentProgress)
            .await
            .unwrap();

        let drift: Vec<&str> = outcome.runs.iter().map(|r| r.drift_hash.as_str()).collect();
        assert_eq!(drift, vec!["first", "second", "third"]);
        assert!(outcome.drift_detected());
        assert!(source.peak.load(Ordering::SeqCst) > 1);
        assert_eq!(outcome.results[0].normalized, "a?");
        assert_eq!(outcome.results[0].appearances, 2);
    }

    #[tokio::test]
    async fn parallel_failure_waits_for_all_runs() {
        let source = ScriptedSource::new(vec![
            (Duration::ZERO, Err(QuestionTreeError::Navigation("blocked".into()))),
            (Duration::from_millis(30), Ok(run(vec![], "h"))),
        ]);
        let err = run_consensus(source.clone(), &params(2, false), 2, &SilentProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, QuestionTreeError::Navigation(_)));
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert_eq!(source.in_flight.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn report_omits_evidence() {
        let outcome = ConsensusOutcome {
            results: merge_runs(&[vec![item("a?", 0, None, 0)]], 1, false),
            runs: vec![RunAudit::from(run(vec![], NO_HASH))],
        };
        let json = serde_json::to_value(ConsensusReport::from(&outcome)).unwrap();
        assert_eq!(json["drift_hashes"][0], NO_HASH);
        assert_eq!(json["results"][0]["normalized"], "a?");
        assert!(json.get("evidence").is_none());
    }
}
