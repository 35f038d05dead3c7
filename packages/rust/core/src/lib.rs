//! Pipeline orchestration and domain logic for postdigest.
//!
//! This crate ties together source polling, deduplication, digest building,
//! and delivery into one run ([`Pipeline`]), and fires that run daily or on
//! demand ([`Scheduler`]).

pub mod digest;
pub mod dispatch;
pub mod dry_run;
pub mod ingest;
pub mod pipeline;
pub mod scheduler;
pub mod telegram;
pub mod traits;

pub use digest::DigestBuilder;
pub use dispatch::{DispatchReport, Dispatcher};
pub use dry_run::DryRunStore;
pub use ingest::{IngestOutcome, Ingestor, SourceError};
pub use pipeline::{Pipeline, ProgressReporter, RunSummary, SilentProgress};
pub use scheduler::{LastRun, Scheduler, SchedulerState, SchedulerStatus, next_fire_after};
pub use telegram::TelegramTransport;
pub use traits::{ContentStore, RecipientDirectory, RunJournal, SourceFetcher, Transport};
