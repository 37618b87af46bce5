//! SQL migration definitions for the QuestionTree tracking database.
//!
//! Migrations are applied in order on database open.

pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: tracked_targets, questions, question_changes, snapshots",
        sql: r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Monitored (keyword, region) pairs
CREATE TABLE IF NOT EXISTS tracked_targets (
    id          TEXT PRIMARY KEY,
    keyword     TEXT NOT NULL,
    country     TEXT NOT NULL,
    language    TEXT NOT NULL,
    device      TEXT NOT NULL,
    city_bias   TEXT,
    created_at  TEXT NOT NULL,
    UNIQUE(keyword, country, language, device)
);

-- One row per question ever seen for a target; is_current marks the live set
CREATE TABLE IF NOT EXISTS questions (
    target_id     TEXT NOT NULL REFERENCES tracked_targets(id) ON DELETE CASCADE,
    hash          TEXT NOT NULL,
    raw           TEXT NOT NULL,
    question_type TEXT NOT NULL,
    first_seen    TEXT NOT NULL,
    last_seen     TEXT NOT NULL,
    times_seen    INTEGER NOT NULL,
    avg_position  REAL NOT NULL,
    last_position INTEGER NOT NULL,
    is_current    INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (target_id, hash)
);

CREATE INDEX IF NOT EXISTS idx_questions_current ON questions(target_id, is_current);

-- Append-only change feed
CREATE TABLE IF NOT EXISTS question_changes (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    target_id    TEXT NOT NULL REFERENCES tracked_targets(id) ON DELETE CASCADE,
    kind         TEXT NOT NULL,
    raw          TEXT NOT NULL,
    hash         TEXT NOT NULL,
    old_position INTEGER,
    new_position INTEGER,
    detected_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_changes_target ON question_changes(target_id, detected_at);

-- Raw ordered list per cycle; the unique key makes a repeated cycle a no-op
CREATE TABLE IF NOT EXISTS snapshots (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    target_id      TEXT NOT NULL REFERENCES tracked_targets(id) ON DELETE CASCADE,
    observed_at    TEXT NOT NULL,
    questions_json TEXT NOT NULL,
    UNIQUE(target_id, observed_at)
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
