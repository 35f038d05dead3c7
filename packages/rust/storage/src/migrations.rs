//! SQL migration definitions for the postdigest database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: seen_posts, subscribers, pipeline_runs",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Every post ever seen; content is the dedup key
CREATE TABLE IF NOT EXISTS seen_posts (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    content       TEXT NOT NULL UNIQUE,
    content_hash  TEXT NOT NULL,
    source        TEXT NOT NULL,
    first_seen_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_seen_posts_source ON seen_posts(source);

-- Recipients that opted in to the daily digest
CREATE TABLE IF NOT EXISTS subscribers (
    recipient_id TEXT PRIMARY KEY,
    username     TEXT,
    first_name   TEXT,
    subscribed   INTEGER NOT NULL DEFAULT 0,
    created_at   TEXT NOT NULL
);

-- Pipeline run history
CREATE TABLE IF NOT EXISTS pipeline_runs (
    id          TEXT PRIMARY KEY,
    trigger_kind TEXT NOT NULL,
    started_at  TEXT NOT NULL,
    finished_at TEXT,
    stats_json  TEXT
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
