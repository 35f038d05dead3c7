//! [`ContentStore`] for dry runs: reads through, keeps writes in memory.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use postdigest_shared::Result;

use crate::traits::ContentStore;

/// Answers "is this new" against a real store without ever writing to it.
///
/// Posts recorded during the run are remembered here, so in-run duplicates
/// are still suppressed. Dropping the store discards them.
pub struct DryRunStore {
    inner: Arc<dyn ContentStore>,
    staged: Mutex<HashSet<String>>,
}

impl DryRunStore {
    pub fn new(inner: Arc<dyn ContentStore>) -> Self {
        Self {
            inner,
            staged: Mutex::new(HashSet::new()),
        }
    }
}

#[async_trait]
impl ContentStore for DryRunStore {
    async fn has(&self, text: &str) -> Result<bool> {
        if self.staged.lock().await.contains(text) {
            return Ok(true);
        }
        self.inner.has(text).await
    }

    async fn record(&self, text: &str, _source: &str) -> Result<bool> {
        if self.inner.has(text).await? {
            return Ok(false);
        }
        Ok(self.staged.lock().await.insert(text.to_string()))
    }

    /// History only; staged posts are never part of it.
    async fn recent_items(&self, limit: u32) -> Result<Vec<String>> {
        self.inner.recent_items(limit).await
    }
}
