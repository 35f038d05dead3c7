//! One end-to-end digest cycle: ingest → choose digest → chunk → dispatch.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use postdigest_shared::{PipelineConfig, PostDigestError, RecipientId, Result, Trigger};

use crate::digest::DigestBuilder;
use crate::dispatch::Dispatcher;
use crate::ingest::{Ingestor, SourceError};
use crate::traits::{ContentStore, RecipientDirectory, RunJournal, SourceFetcher, Transport};

/// Outcome of a single pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Journal id, when the run was journaled.
    pub run_id: Option<String>,
    pub trigger: Trigger,
    /// Posts seen for the first time in this run.
    pub new_items: usize,
    /// Whether the digest was built from recent history instead of new posts.
    pub used_fallback: bool,
    /// Items that went into the digest.
    pub digest_items: usize,
    pub chunks: usize,
    pub recipients: usize,
    /// Messages accepted by the transport.
    pub sent: usize,
    /// Recipients that got every chunk.
    pub notified: usize,
    pub failed: Vec<RecipientId>,
    /// Recipients not attempted because of shutdown.
    pub skipped: usize,
    pub fetch_errors: Vec<SourceError>,
    pub elapsed_ms: u64,
}

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called after each source has been fetched and filtered.
    fn source_polled(&self, source: &str, new_items: usize, current: usize, total: usize);
    /// Called when the run completes.
    fn done(&self, summary: &RunSummary);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn source_polled(&self, _source: &str, _new_items: usize, _current: usize, _total: usize) {}
    fn done(&self, _summary: &RunSummary) {}
}

/// Wires the ingestor, digest builder and dispatcher around shared collaborators.
pub struct Pipeline {
    config: PipelineConfig,
    ingestor: Ingestor,
    store: Arc<dyn ContentStore>,
    directory: Arc<dyn RecipientDirectory>,
    builder: DigestBuilder,
    dispatcher: Dispatcher,
    journal: Option<Arc<dyn RunJournal>>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        fetcher: Arc<dyn SourceFetcher>,
        store: Arc<dyn ContentStore>,
        directory: Arc<dyn RecipientDirectory>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let ingestor = Ingestor::new(fetcher, store.clone()).with_fetch_concurrency(config.fetch_concurrency);
        let builder = DigestBuilder::new(config.max_chunk_chars)
            .with_entry_format(config.bullet.clone(), config.separator.clone());
        let dispatcher = Dispatcher::new(transport)
            .with_send_timeout(config.send_timeout)
            .with_send_delay(config.send_delay)
            .with_concurrency(config.send_concurrency);

        Self {
            config,
            ingestor,
            store,
            directory,
            builder,
            dispatcher,
            journal: None,
        }
    }

    /// Record each run's start and summary in `journal`.
    pub fn with_journal(mut self, journal: Arc<dyn RunJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run one full cycle.
    ///
    /// 1. Poll every source and keep the posts never seen before
    /// 2. Fall back to the most recent stored posts when nothing is new
    /// 3. Pack the chosen items into chunks
    /// 4. Send the chunks to every subscribed recipient
    ///
    /// Fetch and send failures are reported in the summary. A store failure
    /// during ingestion fails the run before anything is sent.
    ///
    /// With a journal, the run first claims the run lease and fails with
    /// `Busy` while another run, in any process, holds it.
    #[instrument(skip_all, fields(%trigger, sources = self.config.sources.len()))]
    pub async fn run(
        &self,
        trigger: Trigger,
        cancel: &CancellationToken,
        progress: &dyn ProgressReporter,
    ) -> Result<RunSummary> {
        let run_id = self.begin_journal(trigger).await?;
        info!(run_id = run_id.as_deref().unwrap_or("-"), "starting pipeline run");

        let result = self.execute(trigger, run_id.clone(), cancel, progress).await;

        if let Some(run_id) = &run_id {
            let stats = match &result {
                Ok(summary) => serde_json::to_value(summary),
                Err(e) => Ok(serde_json::json!({ "error": e.to_string() })),
            };
            match stats {
                Ok(stats) => self.finish_journal(run_id, &stats.to_string()).await,
                Err(e) => warn!(error = %e, "could not serialize run summary"),
            }
        }

        if let Ok(summary) = &result {
            info!(
                new_items = summary.new_items,
                used_fallback = summary.used_fallback,
                chunks = summary.chunks,
                notified = summary.notified,
                failed = summary.failed.len(),
                elapsed_ms = summary.elapsed_ms,
                "pipeline run complete"
            );
            progress.done(summary);
        }
        result
    }

    async fn execute(
        &self,
        trigger: Trigger,
        run_id: Option<String>,
        cancel: &CancellationToken,
        progress: &dyn ProgressReporter,
    ) -> Result<RunSummary> {
        let start = Instant::now();

        // --- Phase 1: Ingest ---
        progress.phase("Polling sources");
        let outcome = self
            .ingestor
            .poll_all(&self.config.sources, cancel, progress)
            .await?;

        if !outcome.store_errors.is_empty() {
            let detail = outcome
                .store_errors
                .iter()
                .map(|e| format!("{}: {}", e.source, e.message))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(PostDigestError::Storage(format!(
                "ingestion incomplete, nothing dispatched ({detail})"
            )));
        }

        // --- Phase 2: Choose digest ---
        let new_items = outcome.new_items.len();
        let (header, items, used_fallback) = if outcome.new_items.is_empty() {
            let recent = self.store.recent_items(self.config.fallback_limit).await?;
            info!(recent = recent.len(), "no new posts, using recent history");
            (&self.config.header_fallback, recent, true)
        } else {
            (&self.config.header_new, outcome.new_items, false)
        };

        // --- Phase 3: Chunk ---
        progress.phase("Building digest");
        let chunks = self.builder.build(header, &items);

        // --- Phase 4: Dispatch ---
        progress.phase("Sending digest");
        let recipients = self.directory.list_subscribed_recipients().await?;
        let report = self
            .dispatcher
            .dispatch_all(&chunks, &recipients, cancel)
            .await;

        Ok(RunSummary {
            run_id,
            trigger,
            new_items,
            used_fallback,
            digest_items: items.len(),
            chunks: chunks.len(),
            recipients: recipients.len(),
            sent: report.sent,
            notified: report.notified,
            failed: report.failed,
            skipped: report.skipped,
            fetch_errors: outcome.fetch_errors,
            elapsed_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// A journal failure leaves the run unjournaled; a held lease is `Busy`.
    async fn begin_journal(&self, trigger: Trigger) -> Result<Option<String>> {
        let Some(journal) = &self.journal else {
            return Ok(None);
        };
        match journal.begin_run(trigger, self.config.run_lease).await {
            Ok(Some(id)) => Ok(Some(id)),
            Ok(None) => {
                warn!("another run holds the run lease");
                Err(PostDigestError::Busy)
            }
            Err(e) => {
                warn!(error = %e, "could not journal run start");
                Ok(None)
            }
        }
    }

    async fn finish_journal(&self, run_id: &str, stats: &str) {
        let Some(journal) = &self.journal else {
            return;
        };
        if let Err(e) = journal.finish_run(run_id, stats).await {
            warn!(%run_id, error = %e, "could not journal run finish");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use postdigest_shared::{AppConfig, SourceLocator};
    use postdigest_storage::Storage;

    use crate::dry_run::DryRunStore;

    use crate::dispatch::tests::RecordingTransport;
    use crate::ingest::tests::{StaticFetcher, loc, temp_storage};

    const CHAN: &str = "https://t.me/s/jobs";

    fn config(sources: &[&str]) -> PipelineConfig {
        let mut config = PipelineConfig::try_from(&AppConfig::default()).unwrap();
        config.sources = sources.iter().map(|s| loc(s)).collect::<Vec<SourceLocator>>();
        config.header_new = "New:\n".into();
        config.header_fallback = "Recent:\n".into();
        config.bullet = String::new();
        config.separator = "\n".into();
        config.send_delay = Duration::ZERO;
        config
    }

    async fn subscribed(storage: &Storage, ids: &[&str]) {
        for id in ids {
            let id = RecipientId::from(*id);
            storage.upsert_subscriber(&id, None, None).await.unwrap();
            storage.set_subscribed(&id, true).await.unwrap();
        }
    }

    fn pipeline(
        sources: &[&str],
        fetcher: StaticFetcher,
        storage: Arc<Storage>,
        transport: Arc<RecordingTransport>,
    ) -> Pipeline {
        Pipeline::new(
            config(sources),
            Arc::new(fetcher),
            storage.clone(),
            storage.clone(),
            transport,
        )
        .with_journal(storage)
    }

    #[tokio::test]
    async fn new_posts_are_sent_to_every_subscriber() {
        let storage = temp_storage().await;
        subscribed(&storage, &["100", "200"]).await;
        let transport = Arc::new(RecordingTransport::default());
        let fetcher = StaticFetcher::new(vec![(CHAN, vec!["job a", "job b"])]);
        let pipeline = pipeline(&[CHAN], fetcher, storage.clone(), transport.clone());

        let summary = pipeline
            .run(Trigger::Manual, &CancellationToken::new(), &SilentProgress)
            .await
            .unwrap();

        assert_eq!(summary.new_items, 2);
        assert!(!summary.used_fallback);
        assert_eq!(summary.notified, 2);
        assert_eq!(transport.messages_for("100"), vec!["New:\njob a\njob b\n"]);
        assert_eq!(transport.messages_for("200"), transport.messages_for("100"));
    }

    #[tokio::test]
    async fn nothing_new_falls_back_to_recent_posts() {
        let storage = temp_storage().await;
        for text in ["old 1", "old 2", "old 3"] {
            storage.record(text, CHAN).await.unwrap();
        }
        subscribed(&storage, &["100"]).await;
        let transport = Arc::new(RecordingTransport::default());
        let fetcher = StaticFetcher::new(vec![(CHAN, vec!["old 1"])]);
        let pipeline = pipeline(&[CHAN], fetcher, storage.clone(), transport.clone());

        let summary = pipeline
            .run(Trigger::Scheduled, &CancellationToken::new(), &SilentProgress)
            .await
            .unwrap();

        assert_eq!(summary.new_items, 0);
        assert!(summary.used_fallback);
        assert_eq!(summary.digest_items, 3);
        assert_eq!(transport.messages_for("100"), vec!["Recent:\nold 3\nold 2\nold 1\n"]);
    }

    #[tokio::test]
    async fn empty_store_and_no_posts_sends_nothing() {
        let storage = temp_storage().await;
        subscribed(&storage, &["100"]).await;
        let transport = Arc::new(RecordingTransport::default());
        let fetcher = StaticFetcher::new(vec![(CHAN, vec![])]);
        let pipeline = pipeline(&[CHAN], fetcher, storage, transport.clone());

        let summary = pipeline
            .run(Trigger::Manual, &CancellationToken::new(), &SilentProgress)
            .await
            .unwrap();

        assert_eq!(summary.chunks, 0);
        assert_eq!(summary.sent, 0);
        assert_eq!(transport.total(), 0);
    }

    #[tokio::test]
    async fn unsubscribed_users_are_not_sent_to() {
        let storage = temp_storage().await;
        subscribed(&storage, &["100"]).await;
        storage.upsert_subscriber(&RecipientId::from("300"), Some("lurker"), None).await.unwrap();
        let transport = Arc::new(RecordingTransport::default());
        let fetcher = StaticFetcher::new(vec![(CHAN, vec!["job"])]);
        let pipeline = pipeline(&[CHAN], fetcher, storage, transport.clone());

        let summary = pipeline
            .run(Trigger::Manual, &CancellationToken::new(), &SilentProgress)
            .await
            .unwrap();

        assert_eq!(summary.recipients, 1);
        assert!(transport.messages_for("300").is_empty());
    }

    #[tokio::test]
    async fn fetch_and_send_failures_are_reported_not_raised() {
        let storage = temp_storage().await;
        subscribed(&storage, &["100", "200"]).await;
        let transport = Arc::new(RecordingTransport::rejecting(&["200"]));
        let fetcher = StaticFetcher::new(vec![(CHAN, vec!["job"])]);
        let down = "https://t.me/s/down";
        let pipeline = pipeline(&[down, CHAN], fetcher, storage, transport.clone());

        let summary = pipeline
            .run(Trigger::Manual, &CancellationToken::new(), &SilentProgress)
            .await
            .unwrap();

        assert_eq!(summary.fetch_errors.len(), 1);
        assert_eq!(summary.fetch_errors[0].source, down);
        assert_eq!(summary.notified, 1);
        assert_eq!(summary.failed, vec![RecipientId::from("200")]);
    }

    #[tokio::test]
    async fn run_is_journaled_with_its_summary() {
        let storage = temp_storage().await;
        let transport = Arc::new(RecordingTransport::default());
        let fetcher = StaticFetcher::new(vec![(CHAN, vec!["job"])]);
        let pipeline = pipeline(&[CHAN], fetcher, storage.clone(), transport);

        let summary = pipeline
            .run(Trigger::Manual, &CancellationToken::new(), &SilentProgress)
            .await
            .unwrap();

        let runs = storage.recent_runs(5).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(Some(&runs[0].id), summary.run_id.as_ref());
        assert_eq!(runs[0].trigger, "manual");
        let stats: serde_json::Value =
            serde_json::from_str(runs[0].stats_json.as_deref().unwrap()).unwrap();
        assert_eq!(stats["new_items"], 1);
    }

    #[tokio::test]
    async fn cancelled_run_is_journaled_as_error() {
        let storage = temp_storage().await;
        let transport = Arc::new(RecordingTransport::default());
        let fetcher = StaticFetcher::new(vec![(CHAN, vec!["job"])]);
        let pipeline = pipeline(&[CHAN], fetcher, storage.clone(), transport);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = pipeline.run(Trigger::Scheduled, &cancel, &SilentProgress).await;
        assert!(matches!(result, Err(PostDigestError::Cancelled)));

        let runs = storage.recent_runs(5).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert!(runs[0].finished_at.is_some());
        assert!(runs[0].stats_json.as_deref().unwrap().contains("cancelled"));
    }

    /// Store whose history query fails.
    struct NoHistoryStore(Arc<Storage>);

    #[async_trait]
    impl ContentStore for NoHistoryStore {
        async fn has(&self, text: &str) -> Result<bool> {
            self.0.has(text).await
        }
        async fn record(&self, text: &str, source: &str) -> Result<bool> {
            self.0.record(text, source).await
        }
        async fn recent_items(&self, _limit: u32) -> Result<Vec<String>> {
            Err(PostDigestError::Storage("no such table: seen_posts".into()))
        }
    }

    struct BrokenDirectory;

    #[async_trait]
    impl RecipientDirectory for BrokenDirectory {
        async fn list_subscribed_recipients(&self) -> Result<Vec<RecipientId>> {
            Err(PostDigestError::Storage("database is locked".into()))
        }
    }

    #[tokio::test]
    async fn fallback_is_built_even_with_no_subscribers() {
        let storage = temp_storage().await;
        for text in ["old 1", "old 2"] {
            storage.record(text, CHAN).await.unwrap();
        }
        let transport = Arc::new(RecordingTransport::default());
        let fetcher = StaticFetcher::new(vec![(CHAN, vec![])]);
        let pipeline = pipeline(&[CHAN], fetcher, storage, transport.clone());

        let summary = pipeline
            .run(Trigger::Scheduled, &CancellationToken::new(), &SilentProgress)
            .await
            .unwrap();

        assert!(summary.used_fallback);
        assert_eq!(summary.digest_items, 2);
        assert_eq!(summary.chunks, 1);
        assert_eq!(summary.recipients, 0);
        assert_eq!(summary.sent, 0);
        assert_eq!(transport.total(), 0);
    }

    #[tokio::test]
    async fn fallback_query_failure_fails_the_run() {
        let storage = temp_storage().await;
        subscribed(&storage, &["100"]).await;
        let transport = Arc::new(RecordingTransport::default());
        let pipeline = Pipeline::new(
            config(&[CHAN]),
            Arc::new(StaticFetcher::new(vec![(CHAN, vec![])])),
            Arc::new(NoHistoryStore(storage.clone())),
            storage.clone(),
            transport.clone(),
        )
        .with_journal(storage.clone());

        let result = pipeline
            .run(Trigger::Scheduled, &CancellationToken::new(), &SilentProgress)
            .await;

        assert!(matches!(result, Err(PostDigestError::Storage(_))));
        assert_eq!(transport.total(), 0);
        let runs = storage.recent_runs(1).await.unwrap();
        assert!(runs[0].stats_json.as_deref().unwrap().contains("seen_posts"));
    }

    #[tokio::test]
    async fn recipient_listing_failure_fails_the_run() {
        let storage = temp_storage().await;
        let transport = Arc::new(RecordingTransport::default());
        let pipeline = Pipeline::new(
            config(&[CHAN]),
            Arc::new(StaticFetcher::new(vec![(CHAN, vec!["job"])])),
            storage.clone(),
            Arc::new(BrokenDirectory),
            transport.clone(),
        );

        let result = pipeline
            .run(Trigger::Manual, &CancellationToken::new(), &SilentProgress)
            .await;

        assert!(matches!(result, Err(PostDigestError::Storage(_))));
        assert_eq!(transport.total(), 0);
    }

    #[tokio::test]
    async fn dry_run_leaves_posts_new_for_the_real_run() {
        let storage = temp_storage().await;
        subscribed(&storage, &["100"]).await;
        let pages = || StaticFetcher::new(vec![(CHAN, vec!["job a", "job b"])]);

        let preview = Arc::new(RecordingTransport::default());
        let dry = Pipeline::new(
            config(&[CHAN]),
            Arc::new(pages()),
            Arc::new(DryRunStore::new(storage.clone())),
            storage.clone(),
            preview.clone(),
        );
        let dry_summary = dry
            .run(Trigger::Manual, &CancellationToken::new(), &SilentProgress)
            .await
            .unwrap();
        assert_eq!(dry_summary.new_items, 2);
        assert_eq!(storage.count_posts().await.unwrap(), 0);
        assert!(storage.recent_runs(1).await.unwrap().is_empty());

        let transport = Arc::new(RecordingTransport::default());
        let real = pipeline(&[CHAN], pages(), storage.clone(), transport.clone());
        let summary = real
            .run(Trigger::Manual, &CancellationToken::new(), &SilentProgress)
            .await
            .unwrap();

        assert_eq!(summary.new_items, 2);
        assert!(!summary.used_fallback);
        assert_eq!(transport.messages_for("100"), vec!["New:\njob a\njob b\n"]);
    }

    #[tokio::test]
    async fn held_run_lease_makes_the_run_busy() {
        let storage = temp_storage().await;
        subscribed(&storage, &["100"]).await;
        storage
            .claim_run(Trigger::Scheduled, Duration::from_secs(3600))
            .await
            .unwrap()
            .unwrap();
        let transport = Arc::new(RecordingTransport::default());
        let fetcher = StaticFetcher::new(vec![(CHAN, vec!["job"])]);
        let pipeline = pipeline(&[CHAN], fetcher, storage.clone(), transport.clone());

        let result = pipeline
            .run(Trigger::Manual, &CancellationToken::new(), &SilentProgress)
            .await;

        assert!(matches!(result, Err(PostDigestError::Busy)));
        assert_eq!(storage.count_posts().await.unwrap(), 0);
        assert_eq!(transport.total(), 0);
    }
}
