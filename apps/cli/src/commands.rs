//! CLI command definitions, routing, and tracing setup.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use postdigest_core::{
    ContentStore, DryRunStore, Pipeline, ProgressReporter, RecipientDirectory, RunSummary,
    Scheduler, SilentProgress, TelegramTransport, Transport,
};
use postdigest_fetcher::HttpFetcher;
use postdigest_shared::{
    AppConfig, ContentRecord, PipelineConfig, RecipientId, SourceLocator, bot_token,
    config_file_path, database_path, init_config_at, load_config, load_config_from,
};
use postdigest_storage::Storage;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// postdigest: a daily digest of new channel posts, delivered by bot.
#[derive(Parser)]
#[command(
    name = "postdigest",
    version,
    about = "Poll public channels, keep only posts never seen before, and send subscribers a daily digest.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.postdigest/postdigest.toml).
    #[arg(long, global = true, env = "POSTDIGEST_CONFIG")]
    pub config: Option<PathBuf>,

    /// Database file, overriding `[storage] database_path`.
    #[arg(long, global = true, env = "POSTDIGEST_DB")]
    pub db: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run one digest cycle now.
    Run {
        /// Print the digest instead of sending it. Nothing is recorded.
        #[arg(long)]
        dry_run: bool,

        /// Poll these sources instead of the configured channels (repeatable).
        #[arg(long = "source")]
        sources: Vec<String>,
    },

    /// Run as a daemon, sending the digest once a day until Ctrl-C.
    Serve {
        /// Also run one cycle immediately on startup.
        #[arg(long)]
        run_on_start: bool,
    },

    /// Manage the subscriber directory.
    Subscribers {
        #[command(subcommand)]
        action: SubscriberAction,
    },

    /// Show subscribers, recent posts, and recent runs.
    Stats,

    /// Export every recorded post for spreadsheets or scripts.
    Export {
        /// Output file (defaults to stdout).
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Output format.
        #[arg(long, value_enum, default_value = "csv")]
        format: ExportFormat,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Export file format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub(crate) enum ExportFormat {
    Csv,
    Json,
}

/// Subscriber subcommands.
#[derive(Subcommand)]
pub(crate) enum SubscriberAction {
    /// Subscribe a chat id or @channel handle.
    Add {
        id: String,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        first_name: Option<String>,
    },
    /// Unsubscribe a recipient. The directory entry is kept.
    Remove { id: String },
    /// List every known subscriber.
    List,
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "postdigest=info,postdigest_core=info,postdigest_fetcher=warn",
        1 => "postdigest=debug,postdigest_core=debug,postdigest_fetcher=debug,postdigest_storage=debug",
        _ => "postdigest=trace,postdigest_core=trace,postdigest_fetcher=trace,postdigest_storage=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    let load = || resolve_config(config_path, cli.db.as_deref());

    match cli.command {
        Command::Run { dry_run, sources } => cmd_run(&load()?, dry_run, &sources).await,
        Command::Serve { run_on_start } => cmd_serve(&load()?, run_on_start).await,
        Command::Subscribers { action } => cmd_subscribers(&load()?, action).await,
        Command::Stats => cmd_stats(&load()?).await,
        Command::Export { out, format } => cmd_export(&load()?, out.as_deref(), format).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(config_path),
            ConfigAction::Show => cmd_config_show(&load()?),
        },
    }
}

/// Load the config file and apply global flag overrides.
fn resolve_config(path: Option<&Path>, db: Option<&Path>) -> Result<AppConfig> {
    let mut config = match path {
        Some(p) => load_config_from(p)?,
        None => load_config()?,
    };
    if let Some(db) = db {
        config.storage.database_path = Some(db.to_string_lossy().to_string());
    }
    Ok(config)
}

/// Fire `cancel` on Ctrl-C so runs stop at the next source or recipient.
fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested, finishing the current step");
            cancel.cancel();
        }
    });
}

/// Assemble a pipeline over one shared store handle.
///
/// A dry run reads through a [`DryRunStore`] and is not journaled, so it
/// leaves the database untouched and never takes the run lease.
fn build_pipeline(
    config: &AppConfig,
    pipeline_config: PipelineConfig,
    storage: Arc<Storage>,
    dry_run: Option<Arc<DryRunTransport>>,
) -> Result<Pipeline> {
    let fetcher = Arc::new(HttpFetcher::new(
        pipeline_config.fetch_timeout,
        &pipeline_config.block_selector,
    )?);

    if let Some(printer) = dry_run {
        let store = Arc::new(DryRunStore::new(storage)) as Arc<dyn ContentStore>;
        return Ok(Pipeline::new(
            pipeline_config,
            fetcher,
            store,
            Arc::new(DryRunDirectory) as Arc<dyn RecipientDirectory>,
            printer as Arc<dyn Transport>,
        ));
    }

    let token = bot_token(config)?;
    let transport = TelegramTransport::new(
        &config.telegram.api_base,
        token,
        pipeline_config.send_timeout,
    )?;
    Ok(Pipeline::new(
        pipeline_config,
        fetcher,
        storage.clone() as Arc<dyn ContentStore>,
        storage.clone() as Arc<dyn RecipientDirectory>,
        Arc::new(transport) as Arc<dyn Transport>,
    )
    .with_journal(storage))
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(config: &AppConfig, dry_run: bool, sources: &[String]) -> Result<()> {
    let mut pipeline_config = PipelineConfig::try_from(config)?;
    if !sources.is_empty() {
        pipeline_config.sources = sources
            .iter()
            .map(|s| SourceLocator::parse(s))
            .collect::<postdigest_shared::Result<Vec<_>>>()?;
    }
    if pipeline_config.sources.is_empty() {
        return Err(eyre!(
            "no sources configured: add channels under [sources] or pass --source <url>"
        ));
    }
    if dry_run {
        pipeline_config.send_delay = Duration::ZERO;
    }

    let db_path = database_path(config)?;
    let storage = Arc::new(Storage::open(&db_path).await?);
    let printer = dry_run.then(|| Arc::new(DryRunTransport::default()));
    let pipeline = build_pipeline(config, pipeline_config, storage, printer.clone())?;

    info!(
        sources = pipeline.config().sources.len(),
        dry_run,
        db = %db_path.display(),
        "running digest cycle"
    );

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());
    let scheduler = Scheduler::new(Arc::new(pipeline), cancel);

    let reporter = CliProgress::new();
    let summary = scheduler.trigger_now(&reporter).await;
    reporter.clear();
    let summary = summary?;

    if let Some(printer) = printer {
        for (i, chunk) in printer.take().await.iter().enumerate() {
            println!("----- message {} -----", i + 1);
            println!("{chunk}");
        }
    }
    print_summary(&summary);
    Ok(())
}

async fn cmd_serve(config: &AppConfig, run_on_start: bool) -> Result<()> {
    let pipeline_config = PipelineConfig::try_from(config)?;
    if pipeline_config.sources.is_empty() {
        return Err(eyre!("no sources configured: add channels under [sources]"));
    }
    let at = config.schedule.fire_time()?;

    let storage = Arc::new(Storage::open(&database_path(config)?).await?);
    let pipeline = build_pipeline(config, pipeline_config, storage, None)?;

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());
    let scheduler = Scheduler::new(Arc::new(pipeline), cancel);

    info!(daily_at = %at.format("%H:%M"), "digest daemon started");

    if run_on_start {
        match scheduler.trigger_now(&SilentProgress).await {
            Ok(summary) => info!(
                new_items = summary.new_items,
                notified = summary.notified,
                failed = summary.failed.len(),
                "startup run complete"
            ),
            Err(e) => error!(error = %e, "startup run failed"),
        }
    }

    scheduler.run_daily(at).await?;

    if let Some(last) = scheduler.status().await.last_run {
        info!(
            trigger = %last.trigger,
            finished_at = %last.finished_at,
            succeeded = last.succeeded,
            detail = %last.detail,
            "last run before shutdown"
        );
    }
    Ok(())
}

async fn cmd_subscribers(config: &AppConfig, action: SubscriberAction) -> Result<()> {
    let storage = Storage::open(&database_path(config)?).await?;

    match action {
        SubscriberAction::Add {
            id,
            username,
            first_name,
        } => {
            let id = RecipientId::new(id);
            storage
                .upsert_subscriber(&id, username.as_deref(), first_name.as_deref())
                .await?;
            storage.set_subscribed(&id, true).await?;
            println!("Subscribed {id}");
        }
        SubscriberAction::Remove { id } => {
            let id = RecipientId::new(id);
            if storage.set_subscribed(&id, false).await? {
                println!("Unsubscribed {id}");
            } else {
                warn!(%id, "unknown subscriber");
                println!("No subscriber {id}");
            }
        }
        SubscriberAction::List => {
            let subscribers = storage.list_subscribers().await?;
            if subscribers.is_empty() {
                println!("No subscribers.");
            }
            for s in subscribers {
                println!(
                    "  {:<16} {:<20} {:<16} {}",
                    s.id.as_str(),
                    s.username.as_deref().map(|u| format!("@{u}")).unwrap_or_default(),
                    s.first_name.as_deref().unwrap_or(""),
                    if s.subscribed { "subscribed" } else { "unsubscribed" },
                );
            }
        }
    }
    Ok(())
}

async fn cmd_stats(config: &AppConfig) -> Result<()> {
    let storage = Storage::open_readonly(&database_path(config)?).await?;

    let subscribers = storage.list_subscribers().await?;
    let active = subscribers.iter().filter(|s| s.subscribed).count();
    println!();
    println!("  Subscribers: {active} subscribed, {} known", subscribers.len());
    for s in subscribers.iter().filter(|s| s.subscribed) {
        let name = s
            .username
            .as_deref()
            .map(|u| format!("@{u}"))
            .or_else(|| s.first_name.clone())
            .unwrap_or_default();
        println!("    {} {name}", s.id);
    }

    println!();
    println!("  Posts seen:  {}", storage.count_posts().await?);
    for record in storage.recent_records(5).await? {
        println!(
            "    {}  {}",
            record.first_seen_at.format("%Y-%m-%d %H:%M"),
            preview(&record.text, 60)
        );
    }

    println!();
    println!("  Recent runs:");
    let runs = storage.recent_runs(5).await?;
    if runs.is_empty() {
        println!("    none");
    }
    for run in runs {
        let status = match &run.finished_at {
            Some(at) => format!("finished {}", at.format("%Y-%m-%d %H:%M")),
            None => "unfinished".to_string(),
        };
        println!(
            "    {}  {:<9}  {status}",
            run.started_at.format("%Y-%m-%d %H:%M"),
            run.trigger
        );
    }
    println!();
    Ok(())
}

async fn cmd_export(config: &AppConfig, out: Option<&Path>, format: ExportFormat) -> Result<()> {
    let storage = Storage::open_readonly(&database_path(config)?).await?;
    let records = storage.all_records().await?;
    let rendered = render_export(&records, format)?;

    match out {
        Some(path) => {
            std::fs::write(path, rendered)
                .map_err(|e| eyre!("failed to write {}: {e}", path.display()))?;
            info!(records = records.len(), path = %path.display(), ?format, "export written");
            println!("Exported {} posts to {}", records.len(), path.display());
        }
        None => std::io::stdout().write_all(&rendered)?,
    }
    Ok(())
}

/// One row or object per post: `text`, `source`, `first_seen_at`, oldest first.
fn render_export(records: &[ContentRecord], format: ExportFormat) -> Result<Vec<u8>> {
    match format {
        ExportFormat::Json => {
            let mut json = serde_json::to_vec_pretty(records)?;
            json.push(b'\n');
            Ok(json)
        }
        ExportFormat::Csv => {
            let mut writer = csv::Writer::from_writer(Vec::new());
            for record in records {
                writer.serialize(record)?;
            }
            writer
                .into_inner()
                .map_err(|e| eyre!("failed to finish CSV export: {}", e.error()))
        }
    }
}

fn cmd_config_init(path: Option<&Path>) -> Result<()> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => config_file_path()?,
    };
    if path.exists() {
        return Err(eyre!("config already exists at {}", path.display()));
    }
    init_config_at(&path)?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(config: &AppConfig) -> Result<()> {
    let toml_str = toml::to_string_pretty(config)?;
    println!("{toml_str}");
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("  Digest cycle complete");
    if let Some(id) = &summary.run_id {
        println!("  Run:        {id}");
    }
    println!("  New posts:  {}", summary.new_items);
    if summary.used_fallback {
        println!("  Fallback:   yes ({} recent posts)", summary.digest_items);
    }
    println!("  Messages:   {}", summary.chunks);
    println!(
        "  Recipients: {} notified, {} failed of {}",
        summary.notified,
        summary.failed.len(),
        summary.recipients
    );
    for failed in &summary.failed {
        println!("    failed: {failed}");
    }
    for e in &summary.fetch_errors {
        println!("  Unreachable: {} ({})", e.source, e.message);
    }
    if summary.skipped > 0 {
        println!("  Skipped:    {} (shutdown)", summary.skipped);
    }
    println!("  Time:       {:.1}s", summary.elapsed_ms as f64 / 1000.0);
    println!();
}

fn preview(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        flat
    } else {
        let cut: String = flat.chars().take(max_chars).collect();
        format!("{cut}…")
    }
}

// ---------------------------------------------------------------------------
// Dry run
// ---------------------------------------------------------------------------

/// Collects chunks instead of sending them; printed after the run.
#[derive(Default)]
struct DryRunTransport {
    chunks: Mutex<Vec<String>>,
}

impl DryRunTransport {
    async fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.chunks.lock().await)
    }
}

#[async_trait]
impl Transport for DryRunTransport {
    async fn send(&self, _recipient: &RecipientId, text: &str) -> postdigest_shared::Result<()> {
        self.chunks.lock().await.push(text.to_string());
        Ok(())
    }
}

/// A single stand-in recipient so the digest is rendered exactly once.
struct DryRunDirectory;

#[async_trait]
impl RecipientDirectory for DryRunDirectory {
    async fn list_subscribed_recipients(&self) -> postdigest_shared::Result<Vec<RecipientId>> {
        Ok(vec![RecipientId::new("dry-run")])
    }
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
            spinner.set_style(
                style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
            );
        }
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }

    fn clear(&self) {
        self.spinner.finish_and_clear();
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn source_polled(&self, source: &str, new_items: usize, current: usize, total: usize) {
        self.spinner.set_message(format!(
            "Polling [{current}/{total}] {source} ({new_items} new)"
        ));
    }

    fn done(&self, _summary: &RunSummary) {
        self.spinner.finish_and_clear();
    }
}
