//! libSQL storage layer (local file database).
//!
//! The [`Storage`] struct wraps a libSQL database holding every post ever
//! seen, the subscriber directory, and the pipeline run journal.
//!
//! **Access rules:**
//! - pipeline runs and subscriber management: read-write via [`Storage::open`]
//! - inspection commands (`stats`, `export`): read-only via [`Storage::open_readonly`]
//!
//! Uniqueness of a post is enforced by the `seen_posts.content` UNIQUE
//! constraint; [`Storage::record`] is a single `INSERT .. ON CONFLICT DO NOTHING`,
//! so concurrent callers can never both observe an insertion.
//!
//! Pipeline runs are serialized across processes by the run lease taken in
//! [`Storage::claim_run`].

mod migrations;

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use libsql::{Connection, Database, Row, Rows, params};
use postdigest_shared::{
    ContentRecord, PostDigestError, RecipientId, Result, RunRecord, Subscriber, Trigger,
    content_hash,
};
use uuid::Uuid;

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

fn storage_err(e: impl std::fmt::Display) -> PostDigestError {
    PostDigestError::Storage(e.to_string())
}

/// Map every row; an error while stepping fails the whole read.
async fn collect_rows<T>(mut rows: Rows, mut map: impl FnMut(&Row) -> Result<T>) -> Result<Vec<T>> {
    let mut results = Vec::new();
    while let Some(row) = rows.next().await.map_err(storage_err)? {
        results.push(map(&row)?);
    }
    Ok(results)
}

/// Fixed-width UTC timestamp, so stored values compare correctly as text.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PostDigestError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;

        let conn = db.connect().map_err(storage_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(PostDigestError::Storage(format!(
                "database not found at {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;

        let conn = db.connect().map_err(storage_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        PostDigestError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(PostDigestError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Seen posts
    // -----------------------------------------------------------------------

    /// Whether a post with exactly this text was already recorded.
    pub async fn has(&self, text: &str) -> Result<bool> {
        let mut rows = self
            .conn
            .query("SELECT 1 FROM seen_posts WHERE content = ?1", params![text])
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(_)) => Ok(true),
            Ok(None) => Ok(false),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// Record a post if it is not already known.
    ///
    /// Returns `true` only for the call that actually inserted the row.
    pub async fn record(&self, text: &str, source: &str) -> Result<bool> {
        self.check_writable()?;
        let now = timestamp(Utc::now());
        let hash = content_hash(text);
        let changed = self
            .conn
            .execute(
                "INSERT INTO seen_posts (content, content_hash, source, first_seen_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(content) DO NOTHING",
                params![text, hash.as_str(), source, now.as_str()],
            )
            .await
            .map_err(storage_err)?;

        tracing::trace!(hash = &hash[..12], source, inserted = changed > 0, "record post");
        Ok(changed > 0)
    }

    /// The `limit` most recently recorded post texts, newest first.
    pub async fn recent_items(&self, limit: u32) -> Result<Vec<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT content FROM seen_posts ORDER BY id DESC LIMIT ?1",
                params![limit],
            )
            .await
            .map_err(storage_err)?;

        collect_rows(rows, |row| row.get::<String>(0).map_err(storage_err)).await
    }

    /// The `limit` most recently recorded posts with their metadata, newest first.
    pub async fn recent_records(&self, limit: u32) -> Result<Vec<ContentRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT content, source, first_seen_at FROM seen_posts
                 ORDER BY id DESC LIMIT ?1",
                params![limit],
            )
            .await
            .map_err(storage_err)?;

        collect_rows(rows, row_to_record).await
    }

    /// Every recorded post, oldest first.
    pub async fn all_records(&self) -> Result<Vec<ContentRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT content, source, first_seen_at FROM seen_posts ORDER BY id",
                params![],
            )
            .await
            .map_err(storage_err)?;

        collect_rows(rows, row_to_record).await
    }

    /// Total number of recorded posts.
    pub async fn count_posts(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM seen_posts", params![])
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).map_err(storage_err)? as u64),
            Ok(None) => Ok(0),
            Err(e) => Err(storage_err(e)),
        }
    }

    // -----------------------------------------------------------------------
    // Subscribers
    // -----------------------------------------------------------------------

    /// Insert a subscriber or refresh its name fields. Does not touch `subscribed`.
    pub async fn upsert_subscriber(
        &self,
        id: &RecipientId,
        username: Option<&str>,
        first_name: Option<&str>,
    ) -> Result<()> {
        self.check_writable()?;
        let now = timestamp(Utc::now());
        self.conn
            .execute(
                "INSERT INTO subscribers (recipient_id, username, first_name, subscribed, created_at)
                 VALUES (?1, ?2, ?3, 0, ?4)
                 ON CONFLICT(recipient_id) DO UPDATE SET
                   username = COALESCE(excluded.username, subscribers.username),
                   first_name = COALESCE(excluded.first_name, subscribers.first_name)",
                params![id.as_str(), username, first_name, now.as_str()],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Set the subscription flag. Returns `false` if the subscriber is unknown.
    pub async fn set_subscribed(&self, id: &RecipientId, subscribed: bool) -> Result<bool> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute(
                "UPDATE subscribers SET subscribed = ?1 WHERE recipient_id = ?2",
                params![i64::from(subscribed), id.as_str()],
            )
            .await
            .map_err(storage_err)?;
        Ok(changed > 0)
    }

    /// All known subscribers, opted in or not.
    pub async fn list_subscribers(&self) -> Result<Vec<Subscriber>> {
        let mut rows = self
            .conn
            .query(
                "SELECT recipient_id, username, first_name, subscribed
                 FROM subscribers ORDER BY created_at, recipient_id",
                params![],
            )
            .await
            .map_err(storage_err)?;

        collect_rows(rows, |row| {
            Ok(Subscriber {
                id: RecipientId(row.get::<String>(0).map_err(storage_err)?),
                username: row.get::<String>(1).ok(),
                first_name: row.get::<String>(2).ok(),
                subscribed: row.get::<i64>(3).map_err(storage_err)? != 0,
            })
        })
        .await
    }

    /// Recipients currently opted in to the digest.
    pub async fn list_subscribed(&self) -> Result<Vec<RecipientId>> {
        let mut rows = self
            .conn
            .query(
                "SELECT recipient_id FROM subscribers WHERE subscribed = 1
                 ORDER BY created_at, recipient_id",
                params![],
            )
            .await
            .map_err(storage_err)?;

        collect_rows(rows, |row| Ok(RecipientId(row.get::<String>(0).map_err(storage_err)?))).await
    }

    // -----------------------------------------------------------------------
    // Pipeline run journal
    // -----------------------------------------------------------------------

    /// Start a run unless another one holds the lease.
    ///
    /// An unfinished run started less than `lease` ago holds the lease, for
    /// every process sharing this database. The check and the insert are one
    /// statement. Returns the new run ID, or `None` while the lease is held.
    pub async fn claim_run(&self, trigger: Trigger, lease: Duration) -> Result<Option<String>> {
        self.check_writable()?;
        let id = Uuid::now_v7().to_string();
        let now = Utc::now();
        let lease = TimeDelta::from_std(lease).map_err(storage_err)?;
        let cutoff = timestamp(now - lease);
        let changed = self
            .conn
            .execute(
                "INSERT INTO pipeline_runs (id, trigger_kind, started_at)
                 SELECT ?1, ?2, ?3
                 WHERE NOT EXISTS (
                   SELECT 1 FROM pipeline_runs
                   WHERE finished_at IS NULL AND started_at > ?4
                 )",
                params![id.as_str(), trigger.as_str(), timestamp(now), cutoff],
            )
            .await
            .map_err(storage_err)?;

        if changed == 0 {
            tracing::debug!(%trigger, "run lease held by another run");
            return Ok(None);
        }
        Ok(Some(id))
    }

    /// Mark a run finished with its stats.
    pub async fn finish_run(&self, run_id: &str, stats_json: &str) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE pipeline_runs SET finished_at = ?1, stats_json = ?2 WHERE id = ?3",
                params![timestamp(Utc::now()), stats_json, run_id],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// The `limit` most recent runs, newest first.
    pub async fn recent_runs(&self, limit: u32) -> Result<Vec<RunRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, trigger_kind, started_at, finished_at, stats_json
                 FROM pipeline_runs ORDER BY id DESC LIMIT ?1",
                params![limit],
            )
            .await
            .map_err(storage_err)?;

        collect_rows(rows, |row| {
            let started: String = row.get(2).map_err(storage_err)?;
            let finished = match row.get::<String>(3) {
                Ok(s) => Some(parse_timestamp(&s)?),
                Err(_) => None,
            };
            Ok(RunRecord {
                id: row.get::<String>(0).map_err(storage_err)?,
                trigger: row.get::<String>(1).map_err(storage_err)?,
                started_at: parse_timestamp(&started)?,
                finished_at: finished,
                stats_json: row.get::<String>(4).ok(),
            })
        })
        .await
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| PostDigestError::Storage(format!("invalid date: {e}")))
}

/// Convert a database row to a [`ContentRecord`].
fn row_to_record(row: &Row) -> Result<ContentRecord> {
    let first_seen: String = row.get(2).map_err(storage_err)?;
    Ok(ContentRecord {
        text: row.get::<String>(0).map_err(storage_err)?,
        source: row.get::<String>(1).map_err(storage_err)?,
        first_seen_at: parse_timestamp(&first_seen)?,
    })
}
