//! Source polling and deduplication.
//!
//! Sources may be fetched concurrently, but their blocks are consumed strictly
//! in configured order, so store writes happen one source at a time.

use std::sync::Arc;

use futures::StreamExt;
use futures::stream;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use postdigest_shared::{PostDigestError, Result, SourceLocator};

use crate::pipeline::ProgressReporter;
use crate::traits::{ContentStore, SourceFetcher};

/// A per-source failure that was skipped.
#[derive(Debug, Clone, Serialize)]
pub struct SourceError {
    pub source: String,
    pub message: String,
}

/// Result of polling every source once.
#[derive(Debug, Default)]
pub struct IngestOutcome {
    /// Posts recorded for the first time by this run, in processing order.
    pub new_items: Vec<String>,
    /// Sources that could not be fetched.
    pub fetch_errors: Vec<SourceError>,
    /// Sources whose processing stopped on a store failure.
    pub store_errors: Vec<SourceError>,
    /// Sources whose fetch result was processed.
    pub sources_polled: usize,
}

/// Polls sources through a fetcher and filters blocks through a content store.
pub struct Ingestor {
    fetcher: Arc<dyn SourceFetcher>,
    store: Arc<dyn ContentStore>,
    fetch_concurrency: usize,
}

impl Ingestor {
    pub fn new(fetcher: Arc<dyn SourceFetcher>, store: Arc<dyn ContentStore>) -> Self {
        Self {
            fetcher,
            store,
            fetch_concurrency: 1,
        }
    }

    /// Allow up to `n` source fetches in flight.
    pub fn with_fetch_concurrency(mut self, n: usize) -> Self {
        self.fetch_concurrency = n.max(1);
        self
    }

    /// Poll every locator and return the posts that were new.
    ///
    /// A fetch or store failure affects only its own source. The token is
    /// checked before each source; once cancelled, no further source is
    /// processed and `Cancelled` is returned.
    #[instrument(skip_all, fields(sources = locators.len()))]
    pub async fn poll_all(
        &self,
        locators: &[SourceLocator],
        cancel: &CancellationToken,
        progress: &dyn ProgressReporter,
    ) -> Result<IngestOutcome> {
        let mut outcome = IngestOutcome::default();
        let total = locators.len();

        // Owned items keep the stream, and so every caller's future, `Send`
        let fetcher = self.fetcher.clone();
        let mut fetches = stream::iter(locators.to_vec())
            .map(move |locator| {
                let fetcher = fetcher.clone();
                async move {
                    let fetched = fetcher.fetch(&locator).await;
                    (locator, fetched)
                }
            })
            .buffered(self.fetch_concurrency);

        let mut current = 0;
        loop {
            if cancel.is_cancelled() {
                info!(processed = current, total, "shutdown requested, stopping ingestion");
                return Err(PostDigestError::Cancelled);
            }
            let Some((locator, fetched)) = fetches.next().await else {
                break;
            };
            current += 1;

            let blocks = match fetched {
                Ok(blocks) => blocks,
                Err(e) => {
                    warn!(source = %locator, error = %e, "fetch failed, skipping source");
                    outcome.fetch_errors.push(SourceError {
                        source: locator.to_string(),
                        message: e.to_string(),
                    });
                    progress.source_polled(locator.as_str(), 0, current, total);
                    continue;
                }
            };
            outcome.sources_polled += 1;

            let before = outcome.new_items.len();
            if let Err(e) = self.accept_new(&locator, blocks, &mut outcome.new_items).await {
                warn!(source = %locator, error = %e, "store failed, skipping rest of source");
                outcome.store_errors.push(SourceError {
                    source: locator.to_string(),
                    message: e.to_string(),
                });
            }
            let added = outcome.new_items.len() - before;
            debug!(source = %locator, new = added, "source processed");
            progress.source_polled(locator.as_str(), added, current, total);
        }

        info!(
            new_items = outcome.new_items.len(),
            fetch_errors = outcome.fetch_errors.len(),
            store_errors = outcome.store_errors.len(),
            "ingestion finished"
        );
        Ok(outcome)
    }

    /// Record each unseen block; push the ones this call inserted.
    async fn accept_new(
        &self,
        locator: &SourceLocator,
        blocks: Vec<String>,
        new_items: &mut Vec<String>,
    ) -> Result<()> {
        for text in blocks {
            if self.store.has(&text).await? {
                continue;
            }
            if self.store.record(&text, locator.as_str()).await? {
                new_items.push(text);
            }
        }
        Ok(())
    }
}
