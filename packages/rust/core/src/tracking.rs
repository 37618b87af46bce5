//! Change tracking for monitored (keyword, region) targets.
//!
//! Each cycle takes one depth-0 run per target, diffs it against the
//! target's active question records, and persists the result through a
//! [`TrackingStore`]. The diff itself ([`reconcile`]) is pure; all writes for
//! one target are derived from one fully computed [`DiffResult`].

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use questiontree_shared::{
    ChangeKind, ChangeRecord, QuestionItem, QuestionRecord, QuestionTreeError, Result, Snapshot,
    StopReason, TargetId, TrackedTarget, detect_question_type, hash_normalized,
};

use crate::consensus::RunSource;
use crate::progress::ProgressReporter;

/// Smallest position shift reported as a real reordering.
const POSITION_CHANGE_THRESHOLD: u32 = 2;

// ---------------------------------------------------------------------------
// Storage collaborator
// ---------------------------------------------------------------------------

/// Persistence required by the tracking cycle.
#[async_trait]
pub trait TrackingStore: Send + Sync {
    async fn list_targets(&self) -> Result<Vec<TrackedTarget>>;

    /// Records for `target_id` with the current flag set.
    async fn active_questions(&self, target_id: &TargetId) -> Result<Vec<QuestionRecord>>;

    async fn snapshot_exists(&self, target_id: &TargetId, observed_at: DateTime<Utc>)
    -> Result<bool>;

    /// Persist every mutation in `diff` atomically.
    async fn commit_diff(&self, diff: &DiffResult) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Diff
// ---------------------------------------------------------------------------

/// Everything one tracking pass writes for one target.
#[derive(Debug, Clone)]
pub struct DiffResult {
    pub target_id: TargetId,
    pub observed_at: DateTime<Utc>,
    /// New records and updated retained records.
    pub upserts: Vec<QuestionRecord>,
    /// Records to mark as no longer current.
    pub removed: Vec<QuestionRecord>,
    pub changes: Vec<ChangeRecord>,
    pub snapshot: Snapshot,
}

impl DiffResult {
    pub fn changes_of(&self, kind: ChangeKind) -> Vec<&ChangeRecord> {
        self.changes.iter().filter(|c| c.kind == kind).collect()
    }

    pub fn count(&self, kind: ChangeKind) -> usize {
        self.changes.iter().filter(|c| c.kind == kind).count()
    }

    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }
}

/// Diff the current run against the target's active records.
///
/// Positions are 0-based indices into `current` after dropping repeated
/// questions. Retained records already updated at or after `observed_at` are
/// left untouched, which makes a repeated pass for the same cycle a no-op.
pub fn reconcile(
    target_id: &TargetId,
    current: &[QuestionItem],
    previous: &[QuestionRecord],
    observed_at: DateTime<Utc>,
) -> DiffResult {
    let mut seen = HashSet::new();
    let current: Vec<(String, &QuestionItem)> = current
        .iter()
        .map(|item| (hash_normalized(&item.normalized), item))
        .filter(|(hash, _)| seen.insert(hash.clone()))
        .collect();

    let previous_by_hash: HashMap<&str, &QuestionRecord> = previous
        .iter()
        .filter(|r| r.is_current)
        .map(|r| (r.hash.as_str(), r))
        .collect();
    let current_hashes: HashSet<&str> = current.iter().map(|(h, _)| h.as_str()).collect();

    let mut upserts = Vec::new();
    let mut changes = Vec::new();
    let change = |kind, raw: &str, hash: &str, old, new| ChangeRecord {
        target_id: target_id.clone(),
        kind,
        raw: raw.to_string(),
        hash: hash.to_string(),
        old_position: old,
        new_position: new,
        detected_at: observed_at,
    };

    for (position, (hash, item)) in current.iter().enumerate() {
        let position = position as u32;
        match previous_by_hash.get(hash.as_str()) {
            None => {
                upserts.push(QuestionRecord {
                    target_id: target_id.clone(),
                    hash: hash.clone(),
                    raw: item.raw.clone(),
                    question_type: detect_question_type(&item.raw),
                    first_seen: observed_at,
                    last_seen: observed_at,
                    times_seen: 1,
                    avg_position: f64::from(position),
                    last_position: position,
                    is_current: true,
                });
                changes.push(change(ChangeKind::Added, &item.raw, hash.as_str(), None, None));
            }
            Some(old) if old.last_seen >= observed_at => {}
            Some(old) => {
                let times_seen = old.times_seen + 1;
                let avg_position = (old.avg_position * f64::from(old.times_seen)
                    + f64::from(position))
                    / f64::from(times_seen);

                if old.last_position.abs_diff(position) >= POSITION_CHANGE_THRESHOLD {
                    changes.push(change(
                        ChangeKind::PositionChanged,
                        &item.raw,
                        hash.as_str(),
                        Some(old.last_position),
                        Some(position),
                    ));
                }

                upserts.push(QuestionRecord {
                    raw: item.raw.clone(),
                    last_seen: observed_at,
                    times_seen,
                    avg_position,
                    last_position: position,
                    is_current: true,
                    ..(*old).clone()
                });
            }
        }
    }

    let mut removed = Vec::new();
    for record in previous.iter().filter(|r| r.is_current) {
        if current_hashes.contains(record.hash.as_str()) {
            continue;
        }
        changes.push(change(ChangeKind::Removed, &record.raw, record.hash.as_str(), None, None));
        removed.push(QuestionRecord {
            is_current: false,
            ..record.clone()
        });
    }

    DiffResult {
        target_id: target_id.clone(),
        observed_at,
        upserts,
        removed,
        changes,
        snapshot: Snapshot {
            target_id: target_id.clone(),
            observed_at,
            questions: current.iter().map(|(_, item)| item.raw.clone()).collect(),
        },
    }
}

/// Persist `diff` unless this cycle was already recorded for the target.
///
/// Returns whether anything was written.
pub async fn apply_diff(store: &dyn TrackingStore, diff: &DiffResult) -> Result<bool> {
    if store
        .snapshot_exists(&diff.target_id, diff.observed_at)
        .await?
    {
        info!(target_id = %diff.target_id, "cycle already recorded, skipping");
        return Ok(false);
    }
    store.commit_diff(diff).await?;
    Ok(true)
}

// ---------------------------------------------------------------------------
// Cycle driver
// ---------------------------------------------------------------------------

/// Run, diff, and persist one tracked target.
///
/// A run cut short by its time budget or by cancellation is not a complete
/// view of the page, so it is rejected instead of reconciled.
#[instrument(skip_all, fields(target_id = %target.id, keyword = %target.keyword))]
pub async fn track_target(
    source: &dyn RunSource,
    store: &dyn TrackingStore,
    target: &TrackedTarget,
    now: DateTime<Utc>,
) -> Result<DiffResult> {
    let params = target.params()?.with_depth(0).with_runs(1);
    let run = source.run(&params).await?;
    match run.stop_reason {
        StopReason::TimeBudget => {
            return Err(QuestionTreeError::timeout(
                "tracking run",
                Duration::from_millis(run.elapsed_ms),
            ));
        }
        StopReason::Cancelled => return Err(QuestionTreeError::Cancelled),
        _ => {}
    }
    let previous = store.active_questions(&target.id).await?;

    let diff = reconcile(&target.id, &run.items, &previous, now);
    apply_diff(store, &diff).await?;

    info!(
        added = diff.count(ChangeKind::Added),
        removed = diff.count(ChangeKind::Removed),
        moved = diff.count(ChangeKind::PositionChanged),
        questions = diff.snapshot.questions.len(),
        "target checked"
    );
    Ok(diff)
}

/// Summary of one cycle over all tracked targets.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub checked: usize,
    pub failed: usize,
    pub added: usize,
    pub removed: usize,
    pub moved: usize,
    pub failures: Vec<QuestionTreeError>,
    pub elapsed: Duration,
}

/// Check every tracked target once, one at a time.
///
/// A failing target is logged and counted; the cycle carries on with the next.
#[instrument(skip_all)]
pub async fn run_cycle(
    source: &dyn RunSource,
    store: &dyn TrackingStore,
    now: DateTime<Utc>,
    progress: &dyn ProgressReporter,
) -> Result<CycleReport> {
    let start = Instant::now();
    let targets = store.list_targets().await?;
    let total = targets.len();
    let mut report = CycleReport::default();

    progress.phase(&format!("Checking {total} tracked target(s)"));

    for (i, target) in targets.iter().enumerate() {
        match track_target(source, store, target, now).await {
            Ok(diff) => {
                report.checked += 1;
                report.added += diff.count(ChangeKind::Added);
                report.removed += diff.count(ChangeKind::Removed);
                report.moved += diff.count(ChangeKind::PositionChanged);
            }
            Err(e) => {
                let failure = QuestionTreeError::TargetCheck {
                    target_id: target.id.to_string(),
                    message: e.to_string(),
                };
                warn!(error = %failure, "tracked target check failed, continuing");
                report.failed += 1;
                report.failures.push(failure);
            }
        }
        progress.target_checked(&target.keyword, i + 1, total);
    }

    report.elapsed = start.elapsed();
    info!(
        checked = report.checked,
        failed = report.failed,
        added = report.added,
        removed = report.removed,
        moved = report.moved,
        elapsed_ms = report.elapsed.as_millis(),
        "cycle complete"
    );
    Ok(report)
}
