//! Core domain types for postdigest.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::{PostDigestError, Result};

// ---------------------------------------------------------------------------
// SourceLocator
// ---------------------------------------------------------------------------

/// A configured endpoint polled for posts (e.g. `https://t.me/s/<channel>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceLocator(Url);

impl SourceLocator {
    /// Parse and validate a locator. Only `http` and `https` are accepted.
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw.trim())
            .map_err(|e| PostDigestError::validation(format!("invalid source URL '{raw}': {e}")))?;
        match url.scheme() {
            "http" | "https" => Ok(Self(url)),
            other => Err(PostDigestError::validation(format!(
                "unsupported scheme '{other}' in source URL '{raw}'"
            ))),
        }
    }

    pub fn as_url(&self) -> &Url {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl std::fmt::Display for SourceLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SourceLocator {
    type Err = PostDigestError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

// ---------------------------------------------------------------------------
// RecipientId
// ---------------------------------------------------------------------------

/// Opaque recipient identifier (a Telegram chat id or `@channel` handle).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecipientId(pub String);

impl RecipientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RecipientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecipientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// ContentRecord
// ---------------------------------------------------------------------------

/// A post that has been seen at least once. Append-only; `text` is unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentRecord {
    /// Exact post text, the deduplication key.
    pub text: String,
    /// Locator the post was first seen at.
    pub source: String,
    /// When the post was first recorded.
    pub first_seen_at: DateTime<Utc>,
}

/// SHA-256 of a post's text, hex encoded. Used as a short identity in logs.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// Subscriber
// ---------------------------------------------------------------------------

/// A row of the subscriber directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: RecipientId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    pub subscribed: bool,
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

/// What started a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Scheduled,
    Manual,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Scheduled => "scheduled",
            Trigger::Manual => "manual",
        }
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A journaled pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    /// UUID v7 run identifier.
    pub id: String,
    pub trigger: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// JSON-encoded run summary or failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats_json: Option<String>,
}
