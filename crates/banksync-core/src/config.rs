//! Sync configuration
//!
//! Loaded from TOML with a two-layer lookup:
//! 1. An explicit path, or `~/.local/share/banksync/config/banksync.toml` if it exists
//! 2. The embedded default (`config/banksync.toml`)
//!
//! Environment variables are applied last so credentials never have to live
//! in a file:
//! - `BANKSYNC_API_URL` - aggregator base URL
//! - `BANKSYNC_CLIENT_ID` / `BANKSYNC_CLIENT_SECRET` - aggregator app credentials
//! - `BANKSYNC_API_VERSION` - aggregator API version header

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::lifecycle::LifecyclePolicy;

/// Embedded default configuration
const DEFAULT_CONFIG: &str = include_str!("../../../config/banksync.toml");

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub base_url: String,
    pub api_version: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub token_timeout: Duration,
    pub accounts_timeout: Duration,
    pub transactions_timeout: Duration,
    pub item_timeout: Duration,
    /// Inline retries per HTTP call
    pub max_retries: u32,
    /// Fixed pause between inline retries
    pub retry_backoff: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.bridgeapi.io".to_string(),
            api_version: "2025-01-15".to_string(),
            client_id: None,
            client_secret: None,
            token_timeout: Duration::from_secs(30),
            accounts_timeout: Duration::from_secs(60),
            transactions_timeout: Duration::from_secs(120),
            item_timeout: Duration::from_secs(30),
            max_retries: 1,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImportConfig {
    /// Trailing window of transactions fetched per account
    pub window_days: i64,
    /// Page size for the single transactions request per account
    pub page_size: u32,
    pub convert_on_import: bool,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            window_days: 90,
            page_size: 500,
            convert_on_import: false,
        }
    }
}

/// Queue-level retry settings for one job kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobSettings {
    pub attempts: u32,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct JobsConfig {
    pub workers: usize,
    pub retry_backoff: Duration,
    pub sync: JobSettings,
    pub webhook: JobSettings,
    pub categorize: JobSettings,
    pub convert: JobSettings,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            retry_backoff: Duration::from_secs(10),
            sync: JobSettings {
                attempts: 3,
                timeout: Duration::from_secs(300),
            },
            webhook: JobSettings {
                attempts: 3,
                timeout: Duration::from_secs(120),
            },
            categorize: JobSettings {
                attempts: 2,
                timeout: Duration::from_secs(600),
            },
            convert: JobSettings {
                attempts: 2,
                timeout: Duration::from_secs(600),
            },
        }
    }
}

/// Complete runtime configuration
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub aggregator: AggregatorConfig,
    pub token_refresh_margin: Duration,
    pub import: ImportConfig,
    pub lifecycle: LifecyclePolicy,
    pub default_sync_frequency_hours: u32,
    pub jobs: JobsConfig,
    pub conversion_chunk_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            aggregator: AggregatorConfig::default(),
            token_refresh_margin: Duration::from_secs(300),
            import: ImportConfig::default(),
            lifecycle: LifecyclePolicy::default(),
            default_sync_frequency_hours: 24,
            jobs: JobsConfig::default(),
            conversion_chunk_size: 100,
        }
    }
}

impl SyncConfig {
    /// Load configuration (override file first, then embedded default) and apply env
    pub fn load(override_path: Option<&Path>) -> Result<Self> {
        let content = match override_path {
            Some(path) if path.exists() => fs::read_to_string(path)
                .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?,
            Some(path) => {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    path.display()
                )))
            }
            None => match default_config_path() {
                Some(path) if path.exists() => fs::read_to_string(&path).map_err(|e| {
                    Error::Config(format!("Failed to read {}: {}", path.display(), e))
                })?,
                _ => DEFAULT_CONFIG.to_string(),
            },
        };

        let mut config = parse_config(&content)?;
        config.apply_env();
        Ok(config)
    }

    /// Apply deployment overrides from the environment
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("BANKSYNC_API_URL") {
            if !url.trim().is_empty() {
                self.aggregator.base_url = url;
            }
        }
        if let Ok(version) = std::env::var("BANKSYNC_API_VERSION") {
            if !version.trim().is_empty() {
                self.aggregator.api_version = version;
            }
        }
        self.aggregator.client_id = std::env::var("BANKSYNC_CLIENT_ID")
            .ok()
            .filter(|s| !s.is_empty())
            .or(self.aggregator.client_id.take());
        self.aggregator.client_secret = std::env::var("BANKSYNC_CLIENT_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .or(self.aggregator.client_secret.take());
    }
}

/// Default config override path
pub fn default_config_path() -> Option<PathBuf> {
    dirs::data_local_dir().map(|d| d.join("banksync").join("config").join("banksync.toml"))
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    aggregator: Option<RawAggregator>,
    token: Option<RawToken>,
    import: Option<RawImport>,
    lifecycle: Option<RawLifecycle>,
    jobs: Option<RawJobs>,
    conversion: Option<RawConversion>,
}

#[derive(Debug, Deserialize)]
struct RawAggregator {
    base_url: Option<String>,
    api_version: Option<String>,
    token_timeout_secs: Option<u64>,
    accounts_timeout_secs: Option<u64>,
    transactions_timeout_secs: Option<u64>,
    item_timeout_secs: Option<u64>,
    max_retries: Option<u32>,
    retry_backoff_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawToken {
    refresh_margin_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawImport {
    window_days: Option<i64>,
    page_size: Option<u32>,
    convert_on_import: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawLifecycle {
    error_threshold: Option<u32>,
    disable_threshold: Option<u32>,
    default_sync_frequency_hours: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawJobs {
    workers: Option<usize>,
    retry_backoff_secs: Option<u64>,
    sync: Option<RawJobSettings>,
    webhook: Option<RawJobSettings>,
    categorize: Option<RawJobSettings>,
    convert: Option<RawJobSettings>,
}

#[derive(Debug, Deserialize)]
struct RawJobSettings {
    attempts: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawConversion {
    chunk_size: Option<usize>,
}

fn merge_job(target: &mut JobSettings, raw: Option<RawJobSettings>) {
    if let Some(raw) = raw {
        if let Some(attempts) = raw.attempts {
            target.attempts = attempts.max(1);
        }
        if let Some(secs) = raw.timeout_secs {
            target.timeout = Duration::from_secs(secs);
        }
    }
}

/// Parse config from TOML content, starting from defaults
pub fn parse_config(content: &str) -> Result<SyncConfig> {
    let raw: RawConfig = toml::from_str(content)
        .map_err(|e| Error::Config(format!("Invalid config TOML: {}", e)))?;

    let mut config = SyncConfig::default();

    if let Some(agg) = raw.aggregator {
        let target = &mut config.aggregator;
        if let Some(url) = agg.base_url {
            target.base_url = url;
        }
        if let Some(version) = agg.api_version {
            target.api_version = version;
        }
        if let Some(secs) = agg.token_timeout_secs {
            target.token_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = agg.accounts_timeout_secs {
            target.accounts_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = agg.transactions_timeout_secs {
            target.transactions_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = agg.item_timeout_secs {
            target.item_timeout = Duration::from_secs(secs);
        }
        if let Some(retries) = agg.max_retries {
            target.max_retries = retries;
        }
        if let Some(ms) = agg.retry_backoff_ms {
            target.retry_backoff = Duration::from_millis(ms);
        }
    }

    if let Some(margin) = raw.token.and_then(|t| t.refresh_margin_secs) {
        config.token_refresh_margin = Duration::from_secs(margin);
    }

    if let Some(import) = raw.import {
        if let Some(days) = import.window_days {
            config.import.window_days = days;
        }
        if let Some(size) = import.page_size {
            config.import.page_size = size;
        }
        if let Some(convert) = import.convert_on_import {
            config.import.convert_on_import = convert;
        }
    }

    if let Some(lifecycle) = raw.lifecycle {
        if let Some(threshold) = lifecycle.error_threshold {
            config.lifecycle.error_threshold = threshold;
        }
        if let Some(threshold) = lifecycle.disable_threshold {
            config.lifecycle.disable_threshold = threshold;
        }
        if let Some(hours) = lifecycle.default_sync_frequency_hours {
            config.default_sync_frequency_hours = hours;
        }
    }

    if let Some(jobs) = raw.jobs {
        if let Some(workers) = jobs.workers {
            config.jobs.workers = workers.max(1);
        }
        if let Some(secs) = jobs.retry_backoff_secs {
            config.jobs.retry_backoff = Duration::from_secs(secs);
        }
        merge_job(&mut config.jobs.sync, jobs.sync);
        merge_job(&mut config.jobs.webhook, jobs.webhook);
        merge_job(&mut config.jobs.categorize, jobs.categorize);
        merge_job(&mut config.jobs.convert, jobs.convert);
    }

    if let Some(size) = raw.conversion.and_then(|c| c.chunk_size) {
        config.conversion_chunk_size = size.max(1);
    }

    if config.lifecycle.disable_threshold < config.lifecycle.error_threshold {
        return Err(Error::Config(format!(
            "disable_threshold ({}) must not be lower than error_threshold ({})",
            config.lifecycle.disable_threshold, config.lifecycle.error_threshold
        )));
    }

    Ok(config)
}
