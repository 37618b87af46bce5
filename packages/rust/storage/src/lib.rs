//! Turso Embedded / libSQL storage for tracked targets (offline mode).
//!
//! The [`Storage`] struct wraps a libSQL database holding tracked targets, the
//! per-target question records, the change feed, and per-cycle snapshots. It
//! implements [`TrackingStore`] so the tracking cycle can persist its diffs.
//!
//! **Access rules:**
//! - `track run` / `track add`: read-write via [`Storage::open`]
//! - listing commands: read-only via [`Storage::open_readonly`]

mod migrations;

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database, params};

use questiontree_core::{DiffResult, TrackingStore};
use questiontree_shared::{
    ChangeKind, ChangeRecord, Device, QuestionRecord, QuestionTreeError, Result, Snapshot,
    TargetId, TrackedTarget,
};

const TARGET_COLUMNS: &str = "id, keyword, country, language, device, city_bias, created_at";
const QUESTION_COLUMNS: &str = "target_id, hash, raw, question_type, first_seen, last_seen, \
     times_seen, avg_position, last_position, is_current";
const CHANGE_COLUMNS: &str =
    "target_id, kind, raw, hash, old_position, new_position, detected_at";

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| QuestionTreeError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path).build().await.map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` for reading only.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(QuestionTreeError::Storage(format!(
                "no tracking database at {}",
                path.display()
            )));
        }
        let db = libsql::Builder::new_local(path).build().await.map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    QuestionTreeError::Storage(format!(
                        "migration v{} failed: {e}",
                        migration.version
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Current schema version, or 0 before the first migration.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
                _ => 0,
            },
            Err(_) => 0,
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(QuestionTreeError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Tracked targets
    // -----------------------------------------------------------------------

    /// Register a new target. Fails if the same (keyword, region, device)
    /// is already tracked.
    pub async fn insert_target(&self, target: &TrackedTarget) -> Result<()> {
        self.check_writable()?;
        if let Some(existing) = self
            .find_target(&target.keyword, &target.country, &target.language, target.device)
            .await?
        {
            return Err(QuestionTreeError::validation(format!(
                "'{}' ({}-{}, {}) is already tracked as {}",
                target.keyword, target.language, target.country, target.device, existing.id
            )));
        }

        self.conn
            .execute(
                &format!("INSERT INTO tracked_targets ({TARGET_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
                params![
                    target.id.to_string(),
                    target.keyword.as_str(),
                    target.country.as_str(),
                    target.language.as_str(),
                    target.device.as_str(),
                    target.city_bias.as_deref(),
                    fmt_ts(target.created_at),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn get_target(&self, id: &TargetId) -> Result<Option<TrackedTarget>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {TARGET_COLUMNS} FROM tracked_targets WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_target(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn find_target(
        &self,
        keyword: &str,
        country: &str,
        language: &str,
        device: Device,
    ) -> Result<Option<TrackedTarget>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {TARGET_COLUMNS} FROM tracked_targets
                     WHERE keyword = ?1 AND country = ?2 AND language = ?3 AND device = ?4"
                ),
                params![keyword, country, language, device.as_str()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_target(&row)?)),
            None => Ok(None),
        }
    }

    /// All tracked targets, oldest first.
    pub async fn all_targets(&self) -> Result<Vec<TrackedTarget>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {TARGET_COLUMNS} FROM tracked_targets ORDER BY created_at, id"),
                params![],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_target(&row)?);
        }
        Ok(results)
    }

    /// Remove a target and all of its history. Returns whether it existed.
    pub async fn delete_target(&self, id: &TargetId) -> Result<bool> {
        self.check_writable()?;
        let id = id.to_string();
        let tx = self.conn.transaction().await.map_err(db_err)?;

        let result: Result<u64> = async {
            for table in ["question_changes", "snapshots", "questions"] {
                tx.execute(
                    &format!("DELETE FROM {table} WHERE target_id = ?1"),
                    params![id.as_str()],
                )
                .await
                .map_err(db_err)?;
            }
            tx.execute("DELETE FROM tracked_targets WHERE id = ?1", params![id.as_str()])
                .await
                .map_err(db_err)
        }
        .await;

        match result {
            Ok(deleted) => {
                tx.commit().await.map_err(db_err)?;
                Ok(deleted > 0)
            }
            Err(e) => {
                rollback(tx).await;
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Questions, changes, snapshots
    // -----------------------------------------------------------------------

    /// Question records for a target, current ones first, by last position.
    pub async fn questions(&self, target_id: &TargetId, current_only: bool) -> Result<Vec<QuestionRecord>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {QUESTION_COLUMNS} FROM questions
                     WHERE target_id = ?1 AND (is_current = 1 OR ?2 = 0)
                     ORDER BY is_current DESC, last_position, hash"
                ),
                params![target_id.to_string(), i64::from(current_only)],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_question(&row)?);
        }
        Ok(results)
    }

    /// Change feed, newest first, optionally filtered to one target.
    pub async fn list_changes(
        &self,
        target_id: Option<&TargetId>,
        limit: u32,
    ) -> Result<Vec<ChangeRecord>> {
        let target = target_id.map(ToString::to_string);
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {CHANGE_COLUMNS} FROM question_changes
                     WHERE ?1 IS NULL OR target_id = ?1
                     ORDER BY detected_at DESC, id DESC
                     LIMIT ?2"
                ),
                params![target, limit],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_change(&row)?);
        }
        Ok(results)
    }

    /// Most recent snapshot for a target, if any cycle has run.
    pub async fn latest_snapshot(&self, target_id: &TargetId) -> Result<Option<Snapshot>> {
        let mut rows = self
            .conn
            .query(
                "SELECT observed_at, questions_json FROM snapshots
                 WHERE target_id = ?1 ORDER BY observed_at DESC LIMIT 1",
                params![target_id.to_string()],
            )
            .await
            .map_err(db_err)?;

        let Some(row) = rows.next().await.map_err(db_err)? else {
            return Ok(None);
        };
        let observed_at = parse_ts(&row.get::<String>(0).map_err(db_err)?)?;
        let json: String = row.get(1).map_err(db_err)?;
        let questions = serde_json::from_str(&json)
            .map_err(|e| QuestionTreeError::Storage(format!("invalid snapshot: {e}")))?;

        Ok(Some(Snapshot {
            target_id: target_id.clone(),
            observed_at,
            questions,
        }))
    }
}

#[async_trait]
impl TrackingStore for Storage {
    async fn list_targets(&self) -> Result<Vec<TrackedTarget>> {
        self.all_targets().await
    }

    async fn active_questions(&self, target_id: &TargetId) -> Result<Vec<QuestionRecord>> {
        self.questions(target_id, true).await
    }

    async fn snapshot_exists(
        &self,
        target_id: &TargetId,
        observed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                "SELECT 1 FROM snapshots WHERE target_id = ?1 AND observed_at = ?2",
                params![target_id.to_string(), fmt_ts(observed_at)],
            )
            .await
            .map_err(db_err)?;
        Ok(rows.next().await.map_err(db_err)?.is_some())
    }

    async fn commit_diff(&self, diff: &DiffResult) -> Result<()> {
        self.check_writable()?;
        let tx = self.conn.transaction().await.map_err(db_err)?;

        match write_diff(&tx, diff).await {
            Ok(()) => {
                tx.commit().await.map_err(db_err)?;
                tracing::debug!(
                    target_id = %diff.target_id,
                    upserts = diff.upserts.len(),
                    removed = diff.removed.len(),
                    changes = diff.changes.len(),
                    "diff committed"
                );
                Ok(())
            }
            Err(e) => {
                rollback(tx).await;
                Err(e)
            }
        }
    }
}

/// All statements of one diff, run inside the caller's transaction.
async fn write_diff(conn: &Connection, diff: &DiffResult) -> Result<()> {
    // A question returning after removal starts over: first_seen and counters reset.
    let upsert = format!(
        "INSERT INTO questions ({QUESTION_COLUMNS})
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(target_id, hash) DO UPDATE SET
           raw = excluded.raw,
           first_seen = excluded.first_seen,
           question_type = excluded.question_type,
           last_seen = excluded.last_seen,
           times_seen = excluded.times_seen,
           avg_position = excluded.avg_position,
           last_position = excluded.last_position,
           is_current = excluded.is_current"
    );
    for record in &diff.upserts {
        conn.execute(
            &upsert,
            params![
                record.target_id.to_string(),
                record.hash.as_str(),
                record.raw.as_str(),
                record.question_type.as_str(),
                fmt_ts(record.first_seen),
                fmt_ts(record.last_seen),
                i64::from(record.times_seen),
                record.avg_position,
                i64::from(record.last_position),
                i64::from(record.is_current),
            ],
        )
        .await
        .map_err(db_err)?;
    }

    for record in &diff.removed {
        conn.execute(
            "UPDATE questions SET is_current = 0 WHERE target_id = ?1 AND hash = ?2",
            params![record.target_id.to_string(), record.hash.as_str()],
        )
        .await
        .map_err(db_err)?;
    }

    for change in &diff.changes {
        conn.execute(
            &format!("INSERT INTO question_changes ({CHANGE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
            params![
                change.target_id.to_string(),
                change.kind.as_str(),
                change.raw.as_str(),
                change.hash.as_str(),
                change.old_position.map(i64::from),
                change.new_position.map(i64::from),
                fmt_ts(change.detected_at),
            ],
        )
        .await
        .map_err(db_err)?;
    }

    let questions = serde_json::to_string(&diff.snapshot.questions)
        .map_err(|e| QuestionTreeError::Storage(e.to_string()))?;
    conn.execute(
        "INSERT INTO snapshots (target_id, observed_at, questions_json) VALUES (?1, ?2, ?3)
         ON CONFLICT(target_id, observed_at) DO NOTHING",
        params![
            diff.snapshot.target_id.to_string(),
            fmt_ts(diff.snapshot.observed_at),
            questions
        ],
    )
    .await
    .map_err(db_err)?;

    Ok(())
}

async fn rollback(tx: libsql::Transaction) {
    if let Err(e) = tx.rollback().await {
        tracing::warn!(error = %e, "rollback failed");
    }
}

// ---------------------------------------------------------------------------
// Row conversion
// ---------------------------------------------------------------------------

fn db_err(e: libsql::Error) -> QuestionTreeError {
    QuestionTreeError::Storage(e.to_string())
}

/// Fixed-width UTC timestamps so text comparison matches time order.
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| QuestionTreeError::Storage(format!("invalid date '{s}': {e}")))
}

fn parse_target_id(s: &str) -> Result<TargetId> {
    s.parse()
        .map_err(|e| QuestionTreeError::Storage(format!("invalid target id '{s}': {e}")))
}

fn row_to_target(row: &libsql::Row) -> Result<TrackedTarget> {
    Ok(TrackedTarget {
        id: parse_target_id(&row.get::<String>(0).map_err(db_err)?)?,
        keyword: row.get(1).map_err(db_err)?,
        country: row.get(2).map_err(db_err)?,
        language: row.get(3).map_err(db_err)?,
        device: row.get::<String>(4).map_err(db_err)?.parse()?,
        city_bias: row.get::<String>(5).ok(),
        created_at: parse_ts(&row.get::<String>(6).map_err(db_err)?)?,
    })
}

fn row_to_question(row: &libsql::Row) -> Result<QuestionRecord> {
    Ok(QuestionRecord {
        target_id: parse_target_id(&row.get::<String>(0).map_err(db_err)?)?,
        hash: row.get(1).map_err(db_err)?,
        raw: row.get(2).map_err(db_err)?,
        question_type: row.get::<String>(3).map_err(db_err)?.parse()?,
        first_seen: parse_ts(&row.get::<String>(4).map_err(db_err)?)?,
        last_seen: parse_ts(&row.get::<String>(5).map_err(db_err)?)?,
        times_seen: row.get::<i64>(6).map_err(db_err)? as u32,
        avg_position: row.get(7).map_err(db_err)?,
        last_position: row.get::<i64>(8).map_err(db_err)? as u32,
        is_current: row.get::<i64>(9).map_err(db_err)? != 0,
    })
}

fn row_to_change(row: &libsql::Row) -> Result<ChangeRecord> {
    Ok(ChangeRecord {
        target_id: parse_target_id(&row.get::<String>(0).map_err(db_err)?)?,
        kind: row.get::<String>(1).map_err(db_err)?.parse::<ChangeKind>()?,
        raw: row.get(2).map_err(db_err)?,
        hash: row.get(3).map_err(db_err)?,
        old_position: row.get::<i64>(4).ok().map(|v| v as u32),
        new_position: row.get::<i64>(5).ok().map(|v| v as u32),
        detected_at: parse_ts(&row.get::<String>(6).map_err(db_err)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use questiontree_core::{apply_diff, reconcile};
    use questiontree_shared::{QuestionItem, normalize};
    use uuid::Uuid;

    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("qt_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T06:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn target(keyword: &str) -> TrackedTarget {
        TrackedTarget {
            id: TargetId::new(),
            keyword: keyword.into(),
            country: "us".into(),
            language: "en".into(),
            device: Device::Mobile,
            city_bias: None,
            created_at: t0(),
        }
    }

    fn items(raws: &[&str]) -> Vec<QuestionItem> {
        raws.iter()
            .enumerate()
            .map(|(i, raw)| QuestionItem {
                raw: raw.to_string(),
                normalized: normalize(raw),
                depth: 0,
                parent: None,
                path: String::new(),
                order: i,
            })
            .collect()
    }

    /// Diff `raws` against what is stored and persist it.
    async fn cycle(storage: &Storage, target: &TrackedTarget, raws: &[&str], at: DateTime<Utc>) -> DiffResult {
        let previous = storage.active_questions(&target.id).await.unwrap();
        let diff = reconcile(&target.id, &items(raws), &previous, at);
        apply_diff(storage, &diff).await.unwrap();
        diff
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        assert_eq!(storage.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("qt_test_{}.db", Uuid::now_v7()));
        drop(Storage::open(&tmp).await.expect("first open"));
        let again = Storage::open(&tmp).await.expect("second open");
        assert_eq!(again.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn target_crud() {
        let storage = test_storage().await;
        let rust = TrackedTarget {
            city_bias: Some("w+CAIQICIGUGFyaXM".into()),
            ..target("rust")
        };
        storage.insert_target(&rust).await.expect("insert target");

        let found = storage.get_target(&rust.id).await.unwrap().expect("target exists");
        assert_eq!(found, rust);

        let dup = storage.insert_target(&TrackedTarget { id: TargetId::new(), ..rust.clone() }).await;
        assert!(dup.unwrap_err().to_string().contains("already tracked"));

        storage.insert_target(&target("tokio")).await.unwrap();
        assert_eq!(storage.all_targets().await.unwrap().len(), 2);

        assert!(storage.delete_target(&rust.id).await.unwrap());
        assert!(!storage.delete_target(&rust.id).await.unwrap());
        assert!(storage.get_target(&rust.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn diff_persists_records_changes_and_snapshot() {
        let storage = test_storage().await;
        let rust = target("rust");
        storage.insert_target(&rust).await.unwrap();

        cycle(&storage, &rust, &["What is A?", "How B?", "Why C?"], t0()).await;
        let active = storage.active_questions(&rust.id).await.unwrap();
        assert_eq!(active.len(), 3);
        assert_eq!(active[0].raw, "What is A?");
        assert_eq!(active[0].first_seen, t0());

        let next = t0() + Duration::days(1);
        let diff = cycle(&storage, &rust, &["How B?", "Why C?", "What is A?", "Is D?"], next).await;
        assert_eq!(diff.count(ChangeKind::Added), 1);
        assert_eq!(diff.count(ChangeKind::PositionChanged), 1);

        let moved = storage
            .questions(&rust.id, true)
            .await
            .unwrap()
            .into_iter()
            .find(|q| q.raw == "What is A?")
            .unwrap();
        assert_eq!(moved.times_seen, 2);
        assert_eq!(moved.avg_position, 1.0);
        assert_eq!(moved.last_position, 2);
        assert_eq!(moved.last_seen, next);

        let changes = storage.list_changes(Some(&rust.id), 50).await.unwrap();
        assert_eq!(changes.len(), 5);
        assert_eq!(changes[0].detected_at, next);
        let position = changes
            .iter()
            .find(|c| c.kind == ChangeKind::PositionChanged)
            .unwrap();
        assert_eq!((position.old_position, position.new_position), (Some(0), Some(2)));

        let snapshot = storage.latest_snapshot(&rust.id).await.unwrap().unwrap();
        assert_eq!(snapshot.observed_at, next);
        assert_eq!(snapshot.questions.len(), 4);
    }

    #[tokio::test]
    async fn removal_and_return() {
        let storage = test_storage().await;
        let rust = target("rust");
        storage.insert_target(&rust).await.unwrap();

        cycle(&storage, &rust, &["a?", "b?"], t0()).await;
        let diff = cycle(&storage, &rust, &["a?"], t0() + Duration::days(1)).await;
        assert_eq!(diff.count(ChangeKind::Removed), 1);
        assert_eq!(storage.active_questions(&rust.id).await.unwrap().len(), 1);
        assert_eq!(storage.questions(&rust.id, false).await.unwrap().len(), 2);

        let diff = cycle(&storage, &rust, &["a?", "b?"], t0() + Duration::days(2)).await;
        assert_eq!(diff.count(ChangeKind::Added), 1);
        let b = storage
            .active_questions(&rust.id)
            .await
            .unwrap()
            .into_iter()
            .find(|q| q.raw == "b?")
            .unwrap();
        assert!(b.is_current);
        // A returning question starts a fresh record.
        assert_eq!(b.first_seen, t0() + Duration::days(2));
        assert_eq!(b.last_seen, t0() + Duration::days(2));
        assert_eq!(b.times_seen, 1);
        assert_eq!(b.last_position, 1);
        assert_eq!(b.avg_position, 1.0);

        let a = storage
            .questions(&rust.id, true)
            .await
            .unwrap()
            .into_iter()
            .find(|q| q.raw == "a?")
            .unwrap();
        assert_eq!(a.first_seen, t0());
        assert_eq!(a.times_seen, 3);
    }

    #[tokio::test]
    async fn repeated_cycle_is_skipped() {
        let storage = test_storage().await;
        let rust = target("rust");
        storage.insert_target(&rust).await.unwrap();

        let previous = storage.active_questions(&rust.id).await.unwrap();
        let diff = reconcile(&rust.id, &items(&["a?", "b?"]), &previous, t0());
        assert!(apply_diff(&storage, &diff).await.unwrap());
        assert!(!apply_diff(&storage, &diff).await.unwrap());

        assert!(storage.snapshot_exists(&rust.id, t0()).await.unwrap());
        assert_eq!(storage.list_changes(None, 50).await.unwrap().len(), 2);
        let active = storage.active_questions(&rust.id).await.unwrap();
        assert!(active.iter().all(|q| q.times_seen == 1));
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("qt_test_{}.db", Uuid::now_v7()));
        let rw = Storage::open(&tmp).await.unwrap();
        rw.insert_target(&target("rust")).await.unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        assert_eq!(ro.all_targets().await.unwrap().len(), 1);
        let result = ro.insert_target(&target("tokio")).await;
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }

    #[tokio::test]
    async fn readonly_requires_existing_file() {
        let tmp = std::env::temp_dir().join(format!("qt_missing_{}.db", Uuid::now_v7()));
        assert!(Storage::open_readonly(&tmp).await.is_err());
    }
}
