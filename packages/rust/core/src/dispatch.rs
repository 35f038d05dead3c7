//! Fan-out of digest chunks to subscribed recipients.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use postdigest_shared::{PostDigestError, RecipientId, Result};

use crate::traits::Transport;

/// Per-run delivery tally.
#[derive(Debug, Default, Clone, Serialize)]
pub struct DispatchReport {
    /// Messages accepted by the transport.
    pub sent: usize,
    /// Recipients with at least one failed message.
    pub failed: Vec<RecipientId>,
    /// Recipients that received every chunk.
    pub notified: usize,
    /// Recipients not attempted because of shutdown.
    pub skipped: usize,
}

/// Spaces the start of consecutive sends, whichever worker makes them.
#[derive(Default)]
struct Pacer {
    last_send: Mutex<Option<Instant>>,
}

impl Pacer {
    async fn wait_turn(&self, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        let mut last = self.last_send.lock().await;
        if let Some(prev) = *last {
            tokio::time::sleep_until(prev + delay).await;
        }
        *last = Some(Instant::now());
    }
}

/// Sends the same ordered chunks to every recipient.
///
/// Chunks for one recipient go out sequentially and in order. Recipients are
/// processed independently; a failure for one never stops the others.
#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    send_timeout: Duration,
    send_delay: Duration,
    concurrency: usize,
    pacer: Arc<Pacer>,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            send_timeout: Duration::from_secs(15),
            send_delay: Duration::ZERO,
            concurrency: 1,
            pacer: Arc::new(Pacer::default()),
        }
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Minimum pause between any two sends, across all recipients.
    pub fn with_send_delay(mut self, delay: Duration) -> Self {
        self.send_delay = delay;
        self
    }

    /// Number of recipients served at once.
    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self
    }

    /// Deliver `chunks` to each of `recipients`.
    ///
    /// Recipients not yet started when `cancel` fires are counted as
    /// skipped; a recipient already in progress finishes its chunks.
    #[instrument(skip_all, fields(chunks = chunks.len(), recipients = recipients.len()))]
    pub async fn dispatch_all(
        &self,
        chunks: &[String],
        recipients: &[RecipientId],
        cancel: &CancellationToken,
    ) -> DispatchReport {
        let mut report = DispatchReport::default();
        if chunks.is_empty() || recipients.is_empty() {
            return report;
        }

        let chunks: Arc<[String]> = chunks.into();
        let this = self.clone();
        let cancel = cancel.clone();
        let mut deliveries = stream::iter(recipients.to_vec())
            .map(move |recipient| {
                let this = this.clone();
                let chunks = chunks.clone();
                let cancel = cancel.clone();
                async move {
                    if cancel.is_cancelled() {
                        return (recipient, None);
                    }
                    let result = this.deliver(&recipient, &chunks).await;
                    (recipient, Some(result))
                }
            })
            .buffered(self.concurrency);

        while let Some((recipient, result)) = deliveries.next().await {
            match result {
                None => report.skipped += 1,
                Some((sent, Ok(()))) => {
                    report.sent += sent;
                    report.notified += 1;
                }
                Some((sent, Err(_))) => {
                    report.sent += sent;
                    report.failed.push(recipient);
                }
            }
        }

        info!(
            sent = report.sent,
            notified = report.notified,
            failed = report.failed.len(),
            skipped = report.skipped,
            "dispatch finished"
        );
        report
    }

    /// Send every chunk to one recipient. Returns the number sent and the
    /// last failure; a failed chunk does not stop the ones after it.
    async fn deliver(&self, recipient: &RecipientId, chunks: &[String]) -> (usize, Result<()>) {
        let mut sent = 0;
        let mut outcome = Ok(());
        for (i, chunk) in chunks.iter().enumerate() {
            self.pacer.wait_turn(self.send_delay).await;

            let attempt = tokio::time::timeout(self.send_timeout, self.transport.send(recipient, chunk)).await;
            let result = match attempt {
                Ok(r) => r,
                Err(_) => Err(PostDigestError::send(
                    recipient.as_str(),
                    format!("timed out after {:?}", self.send_timeout),
                )),
            };

            match result {
                Ok(()) => {
                    sent += 1;
                    debug!(%recipient, chunk = i + 1, of = chunks.len(), "chunk sent");
                }
                Err(e) => {
                    warn!(%recipient, chunk = i + 1, of = chunks.len(), error = %e, "chunk not delivered");
                    outcome = Err(e);
                }
            }
        }
        (sent, outcome)
    }
}
