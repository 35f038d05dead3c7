//! Shared types, error model, and configuration for postdigest.
//!
//! This crate is the foundation depended on by all other postdigest crates.
//! It provides:
//! - [`PostDigestError`], the unified error type
//! - Domain types ([`ContentRecord`], [`RecipientId`], [`SourceLocator`], [`Trigger`])
//! - Configuration ([`AppConfig`], [`PipelineConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DigestConfig, NetworkConfig, PipelineConfig, ScheduleConfig, SourcesConfig,
    StorageConfig, TelegramConfig, bot_token, config_dir, config_file_path, database_path,
    init_config, init_config_at, load_config, load_config_from, parse_time_of_day,
};
pub use error::{PostDigestError, Result};
pub use types::{
    ContentRecord, RecipientId, RunRecord, SourceLocator, Subscriber, Trigger, content_hash,
};
