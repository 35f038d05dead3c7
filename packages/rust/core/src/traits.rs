//! Seams between the pipeline and its collaborators.
//!
//! Infrastructure traits only. The pipeline holds them as `Arc<dyn ..>` so a
//! single store handle can be shared explicitly by every component, and tests
//! can substitute fakes.

use std::time::Duration;

use async_trait::async_trait;

use postdigest_fetcher::HttpFetcher;
use postdigest_shared::{RecipientId, Result, SourceLocator, Trigger};
use postdigest_storage::Storage;

/// Persistent set of previously seen posts. Sole arbiter of "is this new".
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// True iff a post with exactly this text exists.
    async fn has(&self, text: &str) -> Result<bool>;

    /// Atomic check-and-insert. Returns whether this call inserted the post.
    async fn record(&self, text: &str, source: &str) -> Result<bool>;

    /// The `limit` most recently recorded texts, newest first.
    async fn recent_items(&self, limit: u32) -> Result<Vec<String>>;
}

/// Read side of the subscriber directory.
#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    async fn list_subscribed_recipients(&self) -> Result<Vec<RecipientId>>;
}

/// Retrieves candidate post blocks from one source.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, locator: &SourceLocator) -> Result<Vec<String>>;
}

/// Delivers one message to one recipient.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, recipient: &RecipientId, text: &str) -> Result<()>;
}

/// History of pipeline runs, doubling as the cross-process run lease.
#[async_trait]
pub trait RunJournal: Send + Sync {
    /// Record a run start. `None` while an unfinished run younger than
    /// `lease` exists.
    async fn begin_run(&self, trigger: Trigger, lease: Duration) -> Result<Option<String>>;
    async fn finish_run(&self, run_id: &str, stats_json: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Storage / fetcher adapters
// ---------------------------------------------------------------------------

#[async_trait]
impl ContentStore for Storage {
    async fn has(&self, text: &str) -> Result<bool> {
        Storage::has(self, text).await
    }

    async fn record(&self, text: &str, source: &str) -> Result<bool> {
        Storage::record(self, text, source).await
    }

    async fn recent_items(&self, limit: u32) -> Result<Vec<String>> {
        Storage::recent_items(self, limit).await
    }
}

#[async_trait]
impl RecipientDirectory for Storage {
    async fn list_subscribed_recipients(&self) -> Result<Vec<RecipientId>> {
        self.list_subscribed().await
    }
}

#[async_trait]
impl RunJournal for Storage {
    async fn begin_run(&self, trigger: Trigger, lease: Duration) -> Result<Option<String>> {
        self.claim_run(trigger, lease).await
    }

    async fn finish_run(&self, run_id: &str, stats_json: &str) -> Result<()> {
        Storage::finish_run(self, run_id, stats_json).await
    }
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn fetch(&self, locator: &SourceLocator) -> Result<Vec<String>> {
        HttpFetcher::fetch(self, locator).await
    }
}
