//! Daily and on-demand pipeline triggering.
//!
//! ```text
//! run_daily (cron job, local zone)  trigger_now (CLI / caller)
//!        │ waits for guard                 │ guard held → Busy
//!        └──────────────┬──────────────────┘
//!                       ▼
//!               Pipeline::run ── run lease held elsewhere → Busy
//! ```
//!
//! The guard serializes runs within one process; the journal's run lease
//! serializes them across processes sharing a database. The fire schedule
//! is not persisted.

use std::sync::Arc;

use chrono::{DateTime, LocalResult, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, TimeZone, Timelike, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use postdigest_shared::{PostDigestError, Result, Trigger};

use crate::pipeline::{Pipeline, ProgressReporter, RunSummary, SilentProgress};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    Running,
}

/// How the most recent run ended.
#[derive(Debug, Clone, Serialize)]
pub struct LastRun {
    pub trigger: Trigger,
    pub finished_at: DateTime<Utc>,
    pub succeeded: bool,
    /// Short human-readable outcome.
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    pub last_run: Option<LastRun>,
}

/// Serializes pipeline runs and fires them daily or on demand.
#[derive(Clone)]
pub struct Scheduler {
    pipeline: Arc<Pipeline>,
    guard: Arc<Mutex<()>>,
    status: Arc<RwLock<SchedulerStatus>>,
    cancel: CancellationToken,
}

impl Scheduler {
    /// `cancel` stops the daily loop and is passed to every run.
    pub fn new(pipeline: Arc<Pipeline>, cancel: CancellationToken) -> Self {
        Self {
            pipeline,
            guard: Arc::new(Mutex::new(())),
            status: Arc::new(RwLock::new(SchedulerStatus {
                state: SchedulerState::Idle,
                last_run: None,
            })),
            cancel,
        }
    }

    pub async fn status(&self) -> SchedulerStatus {
        self.status.read().await.clone()
    }

    /// Run one cycle now, or fail with `Busy` if a run is in progress here
    /// or in another process using the same database.
    pub async fn trigger_now(&self, progress: &dyn ProgressReporter) -> Result<RunSummary> {
        let Ok(_guard) = self.guard.try_lock() else {
            warn!("manual trigger rejected, a run is in progress");
            return Err(PostDigestError::Busy);
        };
        self.execute(Trigger::Manual, progress).await
    }

    /// Fire once per day at `at` local time until cancelled.
    ///
    /// A scheduled fire that lands while a manual run in this process is
    /// active waits for it to finish, then runs. One that finds the run
    /// lease held by another process is skipped.
    pub async fn run_daily(&self, at: NaiveTime) -> Result<()> {
        let mut cron = JobScheduler::new().await.map_err(scheduler_err)?;

        let scheduler = self.clone();
        let job = Job::new_async_tz(daily_cron(at).as_str(), Local, move |_id, _lock| {
            let scheduler = scheduler.clone();
            Box::pin(async move { scheduler.fire_scheduled(at).await })
        })
        .map_err(scheduler_err)?;

        cron.add(job).await.map_err(scheduler_err)?;
        cron.start().await.map_err(scheduler_err)?;
        log_next_fire(at);

        self.cancel.cancelled().await;
        cron.shutdown().await.map_err(scheduler_err)?;
        info!("daily scheduler stopped");
        Ok(())
    }

    async fn fire_scheduled(&self, at: NaiveTime) {
        let _guard = tokio::select! {
            _ = self.cancel.cancelled() => return,
            guard = self.guard.lock() => guard,
        };
        match self.execute(Trigger::Scheduled, &SilentProgress).await {
            Ok(_) => {}
            Err(PostDigestError::Busy) => warn!("scheduled run skipped, another process holds the run lease"),
            Err(e) => error!(error = %e, "scheduled run failed"),
        }
        log_next_fire(at);
    }

    /// Caller must hold the guard.
    async fn execute(&self, trigger: Trigger, progress: &dyn ProgressReporter) -> Result<RunSummary> {
        self.status.write().await.state = SchedulerState::Running;

        let result = self.pipeline.run(trigger, &self.cancel, progress).await;
        if matches!(result, Err(PostDigestError::Busy)) {
            // Never started here, so the last run is unchanged
            self.status.write().await.state = SchedulerState::Idle;
            return result;
        }

        let (succeeded, detail) = match &result {
            Ok(summary) => (
                true,
                format!(
                    "{} new, {} chunks, {} notified, {} failed",
                    summary.new_items,
                    summary.chunks,
                    summary.notified,
                    summary.failed.len()
                ),
            ),
            Err(e) => (false, e.to_string()),
        };
        let mut status = self.status.write().await;
        status.state = SchedulerState::Idle;
        status.last_run = Some(LastRun {
            trigger,
            finished_at: Utc::now(),
            succeeded,
            detail,
        });
        result
    }
}

fn scheduler_err(e: impl std::fmt::Display) -> PostDigestError {
    PostDigestError::Scheduler(e.to_string())
}

/// Six-field cron expression (seconds first) firing daily at `at`.
fn daily_cron(at: NaiveTime) -> String {
    format!("{} {} {} * * *", at.second(), at.minute(), at.hour())
}

fn log_next_fire(at: NaiveTime) {
    let next = next_fire_after(&Local::now(), at);
    info!(next = %next.format("%Y-%m-%d %H:%M:%S %:z"), "next digest scheduled");
}

/// The first instant strictly after `now` whose local time is `at`.
///
/// An ambiguous local time resolves to its earlier instant; a local time
/// skipped by a DST gap fires one hour later.
pub fn next_fire_after<Tz: TimeZone>(now: &DateTime<Tz>, at: NaiveTime) -> DateTime<Tz> {
    let tz = now.timezone();
    let today = now.date_naive();

    let candidate = resolve_local(&tz, today.and_time(at));
    if candidate > *now {
        return candidate;
    }
    let tomorrow = today.succ_opt().unwrap_or(NaiveDate::MAX);
    resolve_local(&tz, tomorrow.and_time(at))
}

fn resolve_local<Tz: TimeZone>(tz: &Tz, local: NaiveDateTime) -> DateTime<Tz> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(t) => t,
        LocalResult::Ambiguous(earliest, _) => earliest,
        LocalResult::None => tz
            .from_local_datetime(&(local + TimeDelta::hours(1)))
            .earliest()
            .unwrap_or_else(|| tz.from_utc_datetime(&local)),
    }
}
