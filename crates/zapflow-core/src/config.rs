//! Zapflow configuration system.
//!
//! Loaded from `~/.zapflow/config.toml` (or an explicit path), then
//! environment overrides are applied on top. Every field has a default so an
//! empty file is a valid config.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, ZapflowError};

/// Poll intervals below this are clamped to prevent runaway polling.
pub const MIN_POLL_INTERVAL_SECS: u64 = 5;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ZapflowConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub debounce: DebounceConfig,
}

impl ZapflowConfig {
    /// Load config from the default path (~/.zapflow/config.toml), falling
    /// back to defaults when the file does not exist.
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ZapflowError::Config(format!("Failed to read config: {e}")))?;
        Self::parse(&content)
    }

    /// Parse config from TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| ZapflowError::Config(format!("Failed to parse config: {e}")))
    }

    /// Apply `ZAPFLOW_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("ZAPFLOW_POLL_INTERVAL_SECS") {
            self.scheduler.poll_interval_secs = parse_num("ZAPFLOW_POLL_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("ZAPFLOW_BATCH_LIMIT") {
            self.scheduler.batch_limit = parse_num("ZAPFLOW_BATCH_LIMIT", &v)?;
        }
        if let Some(v) = lookup("ZAPFLOW_STALE_WINDOW_SECS") {
            self.scheduler.stale_window_secs = parse_num("ZAPFLOW_STALE_WINDOW_SECS", &v)?;
        }
        if let Some(v) = lookup("ZAPFLOW_BACKOFF_BASE_MINUTES") {
            self.scheduler.backoff_base_minutes = parse_num("ZAPFLOW_BACKOFF_BASE_MINUTES", &v)?;
        }
        if let Some(v) = lookup("ZAPFLOW_WORKER_ID") {
            self.scheduler.worker_id = Some(v);
        }
        if let Some(v) = lookup("ZAPFLOW_DISPATCH_URL") {
            self.dispatch.url = v;
        }
        if let Some(v) = lookup("ZAPFLOW_DISPATCH_TOKEN") {
            self.dispatch.token = Some(v);
        }
        if let Some(v) = lookup("ZAPFLOW_DB_PATH") {
            self.store.db_path = v;
        }
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Zapflow home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".zapflow")
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ZapflowError::Config(format!("{key} must be a number, got '{value}'")))
}

/// Scheduler loop tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,
    #[serde(default = "default_stale_window_secs")]
    pub stale_window_secs: u64,
    #[serde(default = "default_backoff_base_minutes")]
    pub backoff_base_minutes: u64,
    #[serde(default = "default_startup_delay_ms")]
    pub startup_delay_ms: u64,
    /// Lease owner id. Derived from hostname + pid when unset.
    #[serde(default)]
    pub worker_id: Option<String>,
}

fn default_poll_interval_secs() -> u64 { 60 }
fn default_batch_limit() -> usize { 10 }
fn default_stale_window_secs() -> u64 { 600 }
fn default_backoff_base_minutes() -> u64 { 15 }
fn default_startup_delay_ms() -> u64 { 2_000 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            batch_limit: default_batch_limit(),
            stale_window_secs: default_stale_window_secs(),
            backoff_base_minutes: default_backoff_base_minutes(),
            startup_delay_ms: default_startup_delay_ms(),
            worker_id: None,
        }
    }
}

impl SchedulerConfig {
    /// Poll interval with the minimum floor applied.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(MIN_POLL_INTERVAL_SECS))
    }

    pub fn stale_window(&self) -> Duration {
        Duration::from_secs(self.stale_window_secs)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }

    /// Configured worker id, or `<hostname>-<pid>`.
    pub fn resolved_worker_id(&self) -> String {
        if let Some(id) = self.worker_id.as_ref().filter(|id| !id.is_empty()) {
            return id.clone();
        }
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "worker".into());
        format!("{}-{}", host, std::process::id())
    }
}

/// Outbound dispatch transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Endpoint receiving `POST` send requests.
    #[serde(default = "default_dispatch_url")]
    pub url: String,
    /// Optional bearer token.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_dispatch_timeout_secs")]
    pub timeout_secs: u64,
    /// Automation name sent as `name` in every request.
    #[serde(default = "default_automation_name")]
    pub automation_name: String,
}

fn default_dispatch_url() -> String { "http://127.0.0.1:8787/dispatch".into() }
fn default_dispatch_timeout_secs() -> u64 { 30 }
fn default_automation_name() -> String { "followup".into() }

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            url: default_dispatch_url(),
            token: None,
            timeout_secs: default_dispatch_timeout_secs(),
            automation_name: default_automation_name(),
        }
    }
}

/// Job store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// How long a connection waits on a locked database before failing.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_db_path() -> String { "~/.zapflow/followups.db".into() }
fn default_busy_timeout_ms() -> u64 { 5_000 }

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl StoreConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Inbound burst coalescing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebounceConfig {
    #[serde(default = "default_debounce_delay_ms")]
    pub delay_ms: u64,
}

fn default_debounce_delay_ms() -> u64 { 10_000 }

impl Default for DebounceConfig {
    fn default() -> Self {
        Self { delay_ms: default_debounce_delay_ms() }
    }
}

impl DebounceConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}
