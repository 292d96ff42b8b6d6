//! Router configuration - TOML file with every field defaulted.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use super::defaults;
use crate::ledger::RetryPolicy;
use crate::types::{Model, Policy, Provider};

pub const CONFIG_ENV: &str = "ROUTER_CONFIG";
pub const ADDR_ENV: &str = "ROUTER_SERVER_ADDR";
pub const LOCAL_CONFIG_FILE: &str = "router.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error ({0}): {1}")]
    Io(PathBuf, #[source] std::io::Error),
    #[error("config parse error ({0}): {1}")]
    Parse(PathBuf, #[source] toml::de::Error),
    #[error("config validation failed:\n  - {}", .0.join("\n  - "))]
    Validation(Vec<String>),
}

/// Root configuration.
///
/// Load with `RouterConfig::load()` which searches:
/// 1. `$ROUTER_CONFIG`
/// 2. `./router.toml`
/// 3. Built-in defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub capacity: CapacityConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    /// Catalog entries applied at startup
    #[serde(default)]
    pub catalog: CatalogSeed,
}

impl RouterConfig {
    /// Load using the standard search order. A file that fails to load is
    /// logged and skipped.
    pub fn load() -> Self {
        let mut config = Self::search();
        config.apply_env();
        config
    }

    fn search() -> Self {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), "Loaded router config from {CONFIG_ENV}");
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from {CONFIG_ENV}, falling back");
                    }
                }
            } else {
                warn!(path = %path, "{CONFIG_ENV} points to non-existent file, falling back");
            }
        }

        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!("Loaded router config from ./{LOCAL_CONFIG_FILE}");
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./{LOCAL_CONFIG_FILE}, using defaults");
                }
            }
        }

        info!("No {LOCAL_CONFIG_FILE} found, using built-in defaults");
        Self::default()
    }

    /// Load from a specific file. Unknown keys warn; range errors fail.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Self::from_toml(&contents).map_err(|e| match e {
            ConfigError::Parse(_, inner) => ConfigError::Parse(path.to_path_buf(), inner),
            other => other,
        })
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        for w in super::validation::validate_unknown_keys(contents) {
            warn!("{}", w);
        }
        let config: Self =
            toml::from_str(contents).map_err(|e| ConfigError::Parse(PathBuf::new(), e))?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(addr) = std::env::var(ADDR_ENV) {
            info!(addr = %addr, "Server address overridden by {ADDR_ENV}");
            self.server.addr = addr;
        }
    }

    /// Collect every range error at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.server.addr.parse::<SocketAddr>().is_err() {
            errors.push(format!("server.addr = '{}' is not a socket address", self.server.addr));
        }
        if self.storage.snapshot_retention_days == 0 {
            errors.push("storage.snapshot_retention_days must be >= 1".into());
        }

        let s = &self.scheduler;
        if s.default_timeout_secs == 0 {
            errors.push("scheduler.default_timeout_secs must be >= 1".into());
        }
        if s.aging_step_secs == 0 {
            errors.push("scheduler.aging_step_secs must be >= 1".into());
        }
        if s.aging_max_boost < 0 {
            errors.push(format!("scheduler.aging_max_boost = {} cannot be negative", s.aging_max_boost));
        }
        if s.retry_tick_secs == 0 || s.aging_sweep_interval_secs == 0 {
            errors.push("scheduler tick intervals must be >= 1 second".into());
        }
        if s.failover.enabled && s.failover.max_attempts < 2 {
            errors.push(format!(
                "scheduler.failover.max_attempts = {} must be >= 2 when failover is enabled",
                s.failover.max_attempts
            ));
        }

        let c = &self.capacity;
        if c.poll_interval_secs == 0 || c.quota_poll_interval_secs == 0 {
            errors.push("capacity poll intervals must be >= 1 second".into());
        }
        if c.stale_after_secs <= 0 {
            errors.push("capacity.stale_after_secs must be > 0".into());
        }

        if self.ledger.retry_max_attempts == 0 {
            errors.push("ledger.retry_max_attempts must be >= 1".into());
        }
        if self.ledger.retry_base_ms > self.ledger.retry_max_ms {
            errors.push(format!(
                "ledger.retry_base_ms ({}) must be <= ledger.retry_max_ms ({})",
                self.ledger.retry_base_ms, self.ledger.retry_max_ms
            ));
        }

        if self.feed.latest_interval_ms == 0 || self.feed.capacity_interval_ms == 0 {
            errors.push("feed intervals must be > 0".into());
        }
        if self.feed.batch_limit == 0 {
            errors.push("feed.batch_limit must be >= 1".into());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_addr")]
    pub addr: String,
    /// Allowed CORS origins; empty means same-origin only
    #[serde(default)]
    pub cors_origins: Vec<String>,
    #[serde(default = "default_body_limit")]
    pub request_body_limit_kb: usize,
}

fn default_addr() -> String {
    defaults::SERVER_ADDR.to_string()
}
fn default_body_limit() -> usize {
    defaults::REQUEST_BODY_LIMIT_KB
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            cors_origins: Vec::new(),
            request_body_limit_kb: default_body_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_retention_days")]
    pub snapshot_retention_days: u32,
    #[serde(default = "default_prune_interval")]
    pub prune_interval_secs: u64,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(defaults::DATA_DIR)
}
fn default_retention_days() -> u32 {
    defaults::SNAPSHOT_RETENTION_DAYS
}
fn default_prune_interval() -> u64 {
    defaults::SNAPSHOT_PRUNE_INTERVAL_SECS
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            snapshot_retention_days: default_retention_days(),
            prune_interval_secs: default_prune_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_timeout")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_aging_step")]
    pub aging_step_secs: u64,
    #[serde(default = "default_aging_max_boost")]
    pub aging_max_boost: i32,
    #[serde(default = "default_aging_sweep")]
    pub aging_sweep_interval_secs: u64,
    #[serde(default = "default_retry_tick")]
    pub retry_tick_secs: u64,
    #[serde(default = "default_debounce")]
    pub trigger_debounce_ms: u64,
    #[serde(default)]
    pub failover: FailoverConfig,
}

fn default_timeout() -> u64 {
    defaults::DEFAULT_TIMEOUT_SECS
}
fn default_aging_step() -> u64 {
    defaults::AGING_STEP_SECS
}
fn default_aging_max_boost() -> i32 {
    defaults::AGING_MAX_BOOST
}
fn default_aging_sweep() -> u64 {
    defaults::AGING_SWEEP_INTERVAL_SECS
}
fn default_retry_tick() -> u64 {
    defaults::RETRY_TICK_SECS
}
fn default_debounce() -> u64 {
    defaults::TRIGGER_DEBOUNCE_MS
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout(),
            aging_step_secs: default_aging_step(),
            aging_max_boost: default_aging_max_boost(),
            aging_sweep_interval_secs: default_aging_sweep(),
            retry_tick_secs: default_retry_tick(),
            trigger_debounce_ms: default_debounce(),
            failover: FailoverConfig::default(),
        }
    }
}

/// Automatic retry on the next-ranked candidate. Off unless enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_failover_attempts")]
    pub max_attempts: u32,
}

fn default_failover_attempts() -> u32 {
    defaults::FAILOVER_MAX_ATTEMPTS
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: default_failover_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacityConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_quota_poll_interval")]
    pub quota_poll_interval_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: i64,
    /// Headroom required for a cold start when the footprint is unknown
    #[serde(default = "default_margin")]
    pub unknown_footprint_margin_mb: u64,
    #[serde(default = "default_reconcile")]
    pub reconcile_interval_secs: u64,
}

fn default_poll_interval() -> u64 {
    defaults::CAPACITY_POLL_INTERVAL_SECS
}
fn default_quota_poll_interval() -> u64 {
    defaults::QUOTA_POLL_INTERVAL_SECS
}
fn default_probe_timeout() -> u64 {
    defaults::PROBE_TIMEOUT_SECS
}
fn default_stale_after() -> i64 {
    defaults::SNAPSHOT_STALE_AFTER_SECS
}
fn default_margin() -> u64 {
    defaults::UNKNOWN_FOOTPRINT_MARGIN_MB
}
fn default_reconcile() -> u64 {
    defaults::MONITOR_RECONCILE_INTERVAL_SECS
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            quota_poll_interval_secs: default_quota_poll_interval(),
            probe_timeout_secs: default_probe_timeout(),
            stale_after_secs: default_stale_after(),
            unknown_footprint_margin_mb: default_margin(),
            reconcile_interval_secs: default_reconcile(),
        }
    }
}

impl CapacityConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_retry_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_retry_base")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_max")]
    pub retry_max_ms: u64,
    #[serde(default = "default_latest_limit")]
    pub latest_limit_max: usize,
}

fn default_retry_attempts() -> u32 {
    defaults::LEDGER_RETRY_MAX_ATTEMPTS
}
fn default_retry_base() -> u64 {
    defaults::LEDGER_RETRY_BASE_MS
}
fn default_retry_max() -> u64 {
    defaults::LEDGER_RETRY_MAX_MS
}
fn default_latest_limit() -> usize {
    defaults::LATEST_LIMIT_MAX
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            retry_max_attempts: default_retry_attempts(),
            retry_base_ms: default_retry_base(),
            retry_max_ms: default_retry_max(),
            latest_limit_max: default_latest_limit(),
        }
    }
}

impl LedgerConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            base_delay: Duration::from_millis(self.retry_base_ms),
            max_delay: Duration::from_millis(self.retry_max_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    #[serde(default = "default_latest_interval")]
    pub latest_interval_ms: u64,
    #[serde(default = "default_capacity_interval")]
    pub capacity_interval_ms: u64,
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,
}

fn default_latest_interval() -> u64 {
    defaults::FEED_LATEST_INTERVAL_MS
}
fn default_capacity_interval() -> u64 {
    defaults::FEED_CAPACITY_INTERVAL_MS
}
fn default_batch_limit() -> usize {
    defaults::FEED_BATCH_LIMIT
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            latest_interval_ms: default_latest_interval(),
            capacity_interval_ms: default_capacity_interval(),
            batch_limit: default_batch_limit(),
        }
    }
}

/// Catalog entries declared in the config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogSeed {
    #[serde(default)]
    pub providers: Vec<Provider>,
    #[serde(default)]
    pub models: Vec<Model>,
    #[serde(default)]
    pub policies: Vec<Policy>,
}

impl CatalogSeed {
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty() && self.models.is_empty() && self.policies.is_empty()
    }
}
