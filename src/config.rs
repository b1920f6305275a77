//! TOML configuration.
//!
//! Every section except `[source]` is optional and falls back to the
//! defaults below. See `config/swatch.example.toml` for a complete file.
//!
//! | Section | Purpose |
//! |---------|---------|
//! | `[source]` | Schedule page URL, legacy encoding, fetch timeout |
//! | `[scheduler]` | Poll interval and first-run delay |
//! | `[storage]` | Snapshot and user directories, history limit |
//! | `[transport]` | Telegram token, API base, send timeout, concurrency |
//! | `[bot]` | Anti-spam window and long-poll timeout |
//! | `[server]` | Dashboard bind address |
//! | `[logging]` | Log directory, file name, default level |
//! | `[labels]` | Placeholder names written into lesson records |
//!
//! The transport token may also be supplied through the
//! `SWATCH_BOT_TOKEN` environment variable, which takes precedence.

use anyhow::{Context, Result};
use encoding_rs::Encoding;
use schedule_watch_core::extract::Labels;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding `transport.token`.
pub const TOKEN_ENV: &str = "SWATCH_BOT_TOKEN";

/// Lower bound of the poll interval, in seconds.
pub const MIN_INTERVAL_SECS: u64 = 300;
/// Upper bound of the poll interval, in seconds.
pub const MAX_INTERVAL_SECS: u64 = 86_400;
/// Delay before retrying after a failed cycle, in seconds.
pub const FALLBACK_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub source: SourceConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub bot: BotConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub labels: LabelsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub url: String,
    /// Fixed page encoding. The body is never sniffed.
    #[serde(default = "default_encoding")]
    pub encoding: String,
    #[serde(default = "default_fetch_timeout")]
    pub timeout_secs: u64,
}

fn default_encoding() -> String {
    "windows-1251".to_string()
}
fn default_fetch_timeout() -> u64 {
    10
}

impl SourceConfig {
    /// The configured encoding. Validated by [`load_config`].
    pub fn encoding(&self) -> Result<&'static Encoding> {
        resolve_encoding(&self.encoding)
    }
}

/// Looks up an encoding by its WHATWG label (`windows-1251`, `utf-8`, `koi8-r`, …).
pub fn resolve_encoding(label: &str) -> Result<&'static Encoding> {
    Encoding::for_label(label.trim().as_bytes())
        .with_context(|| format!("Unknown encoding label: '{}'", label))
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_first_delay")]
    pub first_delay_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            first_delay_secs: default_first_delay(),
        }
    }
}

fn default_interval() -> u64 {
    1800
}
fn default_first_delay() -> u64 {
    10
}

impl SchedulerConfig {
    /// The poll interval, clamped to `[MIN_INTERVAL_SECS, MAX_INTERVAL_SECS]`.
    ///
    /// Out-of-range values are clamped with a warning rather than rejected.
    pub fn interval(&self) -> Duration {
        let clamped = clamp_interval(self.interval_secs);
        if clamped != self.interval_secs {
            tracing::warn!(
                configured = self.interval_secs,
                effective = clamped,
                "scheduler.interval_secs out of range, clamped"
            );
        }
        Duration::from_secs(clamped)
    }

    pub fn first_delay(&self) -> Duration {
        Duration::from_secs(self.first_delay_secs)
    }
}

pub fn clamp_interval(secs: u64) -> u64 {
    secs.clamp(MIN_INTERVAL_SECS, MAX_INTERVAL_SECS)
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_snapshots_dir")]
    pub snapshots_dir: PathBuf,
    #[serde(default = "default_users_dir")]
    pub users_dir: PathBuf,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            snapshots_dir: default_snapshots_dir(),
            users_dir: default_users_dir(),
            history_limit: default_history_limit(),
        }
    }
}

fn default_snapshots_dir() -> PathBuf {
    PathBuf::from("./data/schedules")
}
fn default_users_dir() -> PathBuf {
    PathBuf::from("./data/users")
}
fn default_history_limit() -> usize {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct TransportConfig {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_send_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            token: None,
            api_base: default_api_base(),
            timeout_secs: default_send_timeout(),
            concurrency: default_concurrency(),
        }
    }
}

fn default_api_base() -> String {
    "https://api.telegram.org".to_string()
}
fn default_send_timeout() -> u64 {
    10
}
fn default_concurrency() -> usize {
    4
}

impl TransportConfig {
    pub fn is_configured(&self) -> bool {
        self.token.as_deref().is_some_and(|t| !t.trim().is_empty())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BotConfig {
    #[serde(default = "default_rate_limit_requests")]
    pub rate_limit_requests: usize,
    #[serde(default = "default_rate_limit_window")]
    pub rate_limit_window_secs: u64,
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            rate_limit_requests: default_rate_limit_requests(),
            rate_limit_window_secs: default_rate_limit_window(),
            poll_timeout_secs: default_poll_timeout(),
        }
    }
}

fn default_rate_limit_requests() -> usize {
    15
}
fn default_rate_limit_window() -> u64 {
    10
}
fn default_poll_timeout() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:5000".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_log_file")]
    pub file: String,
    /// Default filter directive. `RUST_LOG` overrides it.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
            file: default_log_file(),
            level: default_log_level(),
        }
    }
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("./logs")
}
fn default_log_file() -> String {
    "swatch.log".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl LoggingConfig {
    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.file)
    }
}

/// Overrides for [`Labels`]. Unset fields keep the defaults.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct LabelsConfig {
    pub free_slot: Option<String>,
    pub unrecognized: Option<String>,
    pub subgroup_prefix: Option<String>,
}

impl LabelsConfig {
    pub fn labels(&self) -> Labels {
        let defaults = Labels::default();
        Labels {
            free_slot: self.free_slot.clone().unwrap_or(defaults.free_slot),
            unrecognized: self.unrecognized.clone().unwrap_or(defaults.unrecognized),
            subgroup_prefix: self
                .subgroup_prefix
                .clone()
                .unwrap_or(defaults.subgroup_prefix),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let mut config = parse_config(&content)?;

    if let Ok(token) = std::env::var(TOKEN_ENV) {
        if !token.trim().is_empty() {
            config.transport.token = Some(token);
        }
    }

    Ok(config)
}

/// Parses and validates configuration text. No environment lookup.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    // Validate source
    let url = config.source.url.trim();
    if url.is_empty() {
        anyhow::bail!("source.url must not be empty");
    }
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        anyhow::bail!("source.url must be an http(s) URL, got '{}'", url);
    }
    config.source.encoding()?;
    if config.source.timeout_secs == 0 {
        anyhow::bail!("source.timeout_secs must be > 0");
    }

    // Validate storage
    if config.storage.history_limit == 0 {
        anyhow::bail!("storage.history_limit must be >= 1");
    }

    // Validate transport
    if config.transport.concurrency == 0 {
        anyhow::bail!("transport.concurrency must be >= 1");
    }
    if config.transport.timeout_secs == 0 {
        anyhow::bail!("transport.timeout_secs must be > 0");
    }

    // Validate bot
    if config.bot.rate_limit_requests == 0 || config.bot.rate_limit_window_secs == 0 {
        anyhow::bail!("bot.rate_limit_requests and bot.rate_limit_window_secs must be > 0");
    }

    Ok(config)
}
