//! Application configuration for postdigest.
//!
//! User config lives at `~/.postdigest/postdigest.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use crate::error::{PostDigestError, Result};
use crate::types::SourceLocator;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "postdigest.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".postdigest";

/// Default database file name inside the config directory.
const DB_FILE_NAME: &str = "postdigest.db";

// ---------------------------------------------------------------------------
// Config structs (matching postdigest.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Channels to poll.
    #[serde(default)]
    pub sources: SourcesConfig,

    /// Digest formatting.
    #[serde(default)]
    pub digest: DigestConfig,

    /// Daily schedule.
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Timeouts, pacing and concurrency.
    #[serde(default)]
    pub network: NetworkConfig,

    /// Telegram Bot API settings.
    #[serde(default)]
    pub telegram: TelegramConfig,

    /// Database location.
    #[serde(default)]
    pub storage: StorageConfig,
}

/// `[sources]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcesConfig {
    /// Channel preview URLs, polled in this order.
    #[serde(default)]
    pub channels: Vec<String>,

    /// CSS selector for one post's text block.
    #[serde(default = "default_block_selector")]
    pub block_selector: String,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            channels: Vec::new(),
            block_selector: default_block_selector(),
        }
    }
}

fn default_block_selector() -> String {
    "div.tgme_widget_message_text".into()
}

/// `[digest]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigestConfig {
    /// Character budget for a single message.
    #[serde(default = "default_max_chunk_chars")]
    pub max_chunk_chars: usize,

    /// How many recent posts to resend when nothing is new.
    #[serde(default = "default_fallback_limit")]
    pub fallback_limit: u32,

    /// Header of a digest of new posts.
    #[serde(default = "default_header_new")]
    pub header_new: String,

    /// Header of the fallback digest.
    #[serde(default = "default_header_fallback")]
    pub header_fallback: String,

    /// Prefix of every entry.
    #[serde(default = "default_bullet")]
    pub bullet: String,

    /// Suffix of every entry.
    #[serde(default = "default_separator")]
    pub separator: String,
}

impl Default for DigestConfig {
    fn default() -> Self {
        Self {
            max_chunk_chars: default_max_chunk_chars(),
            fallback_limit: default_fallback_limit(),
            header_new: default_header_new(),
            header_fallback: default_header_fallback(),
            bullet: default_bullet(),
            separator: default_separator(),
        }
    }
}

fn default_max_chunk_chars() -> usize {
    4000
}
fn default_fallback_limit() -> u32 {
    10
}
fn default_header_new() -> String {
    "📢 Today's Freshers Jobs:\n\n".into()
}
fn default_header_fallback() -> String {
    "🔁 No new job updates found. Here are recent jobs:\n\n".into()
}
fn default_bullet() -> String {
    "• ".into()
}
fn default_separator() -> String {
    "\n\n".into()
}

/// `[schedule]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Local time of day for the daily run, `HH:MM`.
    #[serde(default = "default_daily_at")]
    pub daily_at: String,

    /// How long an unfinished run blocks other runs on the same database.
    /// A run older than this is treated as crashed.
    #[serde(default = "default_run_lease")]
    pub run_lease_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            daily_at: default_daily_at(),
            run_lease_secs: default_run_lease(),
        }
    }
}

fn default_daily_at() -> String {
    "18:00".into()
}
fn default_run_lease() -> u64 {
    3600
}

impl ScheduleConfig {
    /// Parse `daily_at` into a time of day.
    pub fn fire_time(&self) -> Result<NaiveTime> {
        parse_time_of_day(&self.daily_at)
    }
}

/// Parse an `HH:MM` (or `HH:MM:SS`) time of day.
pub fn parse_time_of_day(raw: &str) -> Result<NaiveTime> {
    let raw = raw.trim();
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .map_err(|e| PostDigestError::validation(format!("invalid time of day '{raw}': {e}")))
}

/// `[network]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Per-source HTTP timeout.
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    /// Sources fetched in parallel.
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,

    /// Per-message send timeout.
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,

    /// Minimum pause between any two consecutive sends.
    #[serde(default = "default_send_delay")]
    pub send_delay_ms: u64,

    /// Recipients served in parallel.
    #[serde(default = "default_send_concurrency")]
    pub send_concurrency: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: default_fetch_timeout(),
            fetch_concurrency: default_fetch_concurrency(),
            send_timeout_secs: default_send_timeout(),
            send_delay_ms: default_send_delay(),
            send_concurrency: default_send_concurrency(),
        }
    }
}

fn default_fetch_timeout() -> u64 {
    10
}
fn default_fetch_concurrency() -> usize {
    4
}
fn default_send_timeout() -> u64 {
    15
}
fn default_send_delay() -> u64 {
    1000
}
fn default_send_concurrency() -> usize {
    1
}

/// `[telegram]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Name of the env var holding the bot token (never store the token itself).
    #[serde(default = "default_bot_token_env")]
    pub bot_token_env: String,

    /// Bot API base URL.
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token_env: default_bot_token_env(),
            api_base: default_api_base(),
        }
    }
}

fn default_bot_token_env() -> String {
    "BOT_TOKEN".into()
}
fn default_api_base() -> String {
    "https://api.telegram.org".into()
}

/// `[storage]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database path. Defaults to `~/.postdigest/postdigest.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<String>,
}

// ---------------------------------------------------------------------------
// Pipeline config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime pipeline configuration, merged from config file + CLI flags.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Validated sources in polling order.
    pub sources: Vec<SourceLocator>,
    /// CSS selector for post blocks.
    pub block_selector: String,
    pub max_chunk_chars: usize,
    pub fallback_limit: u32,
    pub header_new: String,
    pub header_fallback: String,
    pub bullet: String,
    pub separator: String,
    pub fetch_timeout: Duration,
    pub fetch_concurrency: usize,
    pub send_timeout: Duration,
    pub send_delay: Duration,
    pub send_concurrency: usize,
    /// Age after which an unfinished run no longer blocks new ones.
    pub run_lease: Duration,
}

impl TryFrom<&AppConfig> for PipelineConfig {
    type Error = PostDigestError;

    fn try_from(config: &AppConfig) -> Result<Self> {
        let sources = config
            .sources
            .channels
            .iter()
            .filter(|c| !c.trim().is_empty())
            .map(|c| SourceLocator::parse(c))
            .collect::<Result<Vec<_>>>()?;

        if config.digest.max_chunk_chars == 0 {
            return Err(PostDigestError::config("digest.max_chunk_chars must be positive"));
        }
        if config.network.fetch_timeout_secs == 0 {
            return Err(PostDigestError::config("network.fetch_timeout_secs must be positive"));
        }
        if config.network.send_timeout_secs == 0 {
            return Err(PostDigestError::config("network.send_timeout_secs must be positive"));
        }
        if config.schedule.run_lease_secs == 0 {
            return Err(PostDigestError::config("schedule.run_lease_secs must be positive"));
        }

        Ok(Self {
            sources,
            block_selector: config.sources.block_selector.clone(),
            max_chunk_chars: config.digest.max_chunk_chars,
            fallback_limit: config.digest.fallback_limit,
            header_new: config.digest.header_new.clone(),
            header_fallback: config.digest.header_fallback.clone(),
            bullet: config.digest.bullet.clone(),
            separator: config.digest.separator.clone(),
            fetch_timeout: Duration::from_secs(config.network.fetch_timeout_secs),
            fetch_concurrency: config.network.fetch_concurrency.max(1),
            send_timeout: Duration::from_secs(config.network.send_timeout_secs),
            send_delay: Duration::from_millis(config.network.send_delay_ms),
            send_concurrency: config.network.send_concurrency.max(1),
            run_lease: Duration::from_secs(config.schedule.run_lease_secs),
        })
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.postdigest/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| PostDigestError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.postdigest/postdigest.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Resolve the database path: explicit config value, else the config dir default.
pub fn database_path(config: &AppConfig) -> Result<PathBuf> {
    match &config.storage.database_path {
        Some(p) => Ok(PathBuf::from(p)),
        None => Ok(config_dir()?.join(DB_FILE_NAME)),
    }
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| PostDigestError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| PostDigestError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let path = config_file_path()?;
    init_config_at(&path)?;
    Ok(path)
}

/// Write a default config file at `path`, creating parent directories.
pub fn init_config_at(path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| PostDigestError::io(dir, e))?;
    }

    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| PostDigestError::config(e.to_string()))?;

    std::fs::write(path, content).map_err(|e| PostDigestError::io(path, e))?;
    tracing::info!(?path, "created default config file");
    Ok(())
}

/// Read the bot token from the env var named in the config.
pub fn bot_token(config: &AppConfig) -> Result<String> {
    let var_name = &config.telegram.bot_token_env;
    match std::env::var(var_name) {
        Ok(val) if !val.trim().is_empty() => Ok(val.trim().to_string()),
        _ => Err(PostDigestError::config(format!(
            "Telegram bot token not found. Set the {var_name} environment variable."
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("max_chunk_chars"));
        assert!(toml_str.contains("BOT_TOKEN"));
        assert!(toml_str.contains("18:00"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.digest.max_chunk_chars, 4000);
        assert_eq!(parsed.digest.fallback_limit, 10);
        assert_eq!(parsed.digest.bullet, "• ");
        assert_eq!(parsed.telegram.bot_token_env, "BOT_TOKEN");
    }

    #[test]
    fn config_with_channels() {
        let toml_str = r#"
[sources]
channels = ["https://t.me/s/freshers_jobs", "https://t.me/s/remote_jobs"]

[schedule]
daily_at = "07:30"

[network]
send_delay_ms = 0
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.sources.channels.len(), 2);
        assert_eq!(config.sources.block_selector, "div.tgme_widget_message_text");
        assert_eq!(
            config.schedule.fire_time().unwrap(),
            NaiveTime::from_hms_opt(7, 30, 0).unwrap()
        );

        let pipeline = PipelineConfig::try_from(&config).expect("pipeline config");
        assert_eq!(pipeline.sources.len(), 2);
        assert_eq!(pipeline.sources[1].as_str(), "https://t.me/s/remote_jobs");
        assert_eq!(pipeline.send_delay, Duration::ZERO);
        assert_eq!(pipeline.fetch_timeout, Duration::from_secs(10));
    }

    #[test]
    fn pipeline_config_rejects_bad_source() {
        let mut config = AppConfig::default();
        config.sources.channels = vec!["ftp://example.com/".into()];
        assert!(PipelineConfig::try_from(&config).is_err());
    }

    #[test]
    fn pipeline_config_clamps_concurrency() {
        let mut config = AppConfig::default();
        config.network.fetch_concurrency = 0;
        config.network.send_concurrency = 0;
        let pipeline = PipelineConfig::try_from(&config).unwrap();
        assert_eq!(pipeline.fetch_concurrency, 1);
        assert_eq!(pipeline.send_concurrency, 1);
    }

    #[test]
    fn pipeline_config_rejects_zero_timeouts() {
        let mut config = AppConfig::default();
        config.network.fetch_timeout_secs = 0;
        let err = PipelineConfig::try_from(&config).unwrap_err();
        assert!(err.to_string().contains("fetch_timeout_secs"));

        let mut config = AppConfig::default();
        config.network.send_timeout_secs = 0;
        let err = PipelineConfig::try_from(&config).unwrap_err();
        assert!(err.to_string().contains("send_timeout_secs"));

        let mut config = AppConfig::default();
        config.schedule.run_lease_secs = 0;
        assert!(PipelineConfig::try_from(&config).is_err());
    }

    #[test]
    fn time_of_day_parsing() {
        assert!(parse_time_of_day("18:00").is_ok());
        assert!(parse_time_of_day("06:15:30").is_ok());
        assert!(parse_time_of_day("25:00").is_err());
        assert!(parse_time_of_day("six pm").is_err());
    }

    #[test]
    fn explicit_database_path_wins() {
        let mut config = AppConfig::default();
        config.storage.database_path = Some("/tmp/pd.db".into());
        assert_eq!(database_path(&config).unwrap(), PathBuf::from("/tmp/pd.db"));
    }

    #[test]
    fn bot_token_missing() {
        let mut config = AppConfig::default();
        // Use a unique env var name to avoid interfering with other tests
        config.telegram.bot_token_env = "PD_TEST_NONEXISTENT_TOKEN_12345".into();
        let result = bot_token(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("bot token not found"));
    }

    #[test]
    fn init_config_at_writes_loadable_defaults() {
        let dir = std::env::temp_dir().join(format!("pd_cfg_{}", std::process::id()));
        let path = dir.join("nested").join("postdigest.toml");

        init_config_at(&path).expect("init config");
        let loaded = load_config_from(&path).expect("load config");
        assert_eq!(loaded.schedule.daily_at, "18:00");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
