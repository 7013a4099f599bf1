use std::path::Path;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::retry::RetryPolicy;

pub const DEFAULT_HOLD_DOWN_MS: u64 = 2_000;
pub const DEFAULT_PROBE_INTERVAL_MS: u64 = 15_000;
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;
pub const DEFAULT_BACKOFF_CAP_MS: u64 = 60_000;
pub const DEFAULT_BACKGROUND_SYNC_MS: u64 = 30_000;

/// Policy knobs for the sync engine (fieldsync.toml + FIELDSYNC_* env overrides).
///
/// All durations are milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How long reachability must hold before the device counts as online.
    #[serde(default = "default_hold_down_ms")]
    pub hold_down_ms: u64,
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    /// Per remote call. An expired call is a connectivity failure.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    #[serde(default = "bool_true")]
    pub jitter: bool,
    #[serde(default = "default_background_sync_ms")]
    pub background_sync_interval_ms: u64,
    /// Drain automatically on reconnect and on the background interval.
    #[serde(default = "bool_true")]
    pub auto_sync: bool,
    /// Start a drain right after an offline action when already online.
    #[serde(default = "bool_true")]
    pub sync_on_enqueue: bool,
    /// Re-download assigned work orders after a clean drain.
    #[serde(default)]
    pub refresh_after_sync: bool,
}

fn default_hold_down_ms() -> u64 {
    DEFAULT_HOLD_DOWN_MS
}
fn default_probe_interval_ms() -> u64 {
    DEFAULT_PROBE_INTERVAL_MS
}
fn default_call_timeout_ms() -> u64 {
    DEFAULT_CALL_TIMEOUT_MS
}
fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}
fn default_backoff_base_ms() -> u64 {
    DEFAULT_BACKOFF_BASE_MS
}
fn default_backoff_cap_ms() -> u64 {
    DEFAULT_BACKOFF_CAP_MS
}
fn default_background_sync_ms() -> u64 {
    DEFAULT_BACKGROUND_SYNC_MS
}
fn bool_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hold_down_ms: DEFAULT_HOLD_DOWN_MS,
            probe_interval_ms: DEFAULT_PROBE_INTERVAL_MS,
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            backoff_cap_ms: DEFAULT_BACKOFF_CAP_MS,
            jitter: true,
            background_sync_interval_ms: DEFAULT_BACKGROUND_SYNC_MS,
            auto_sync: true,
            sync_on_enqueue: true,
            refresh_after_sync: false,
        }
    }
}

impl EngineConfig {
    /// Defaults, then the TOML file if given, then `FIELDSYNC_*` variables
    /// (`FIELDSYNC_CALL_TIMEOUT_MS=5000`).
    pub fn load(path: Option<&Path>) -> Result<Self, EngineError> {
        let mut figment = Figment::from(Serialized::defaults(EngineConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment
            .merge(Env::prefixed("FIELDSYNC_"))
            .extract()
            .map_err(|e| EngineError::Config(e.to_string()))
    }

    pub fn hold_down(&self) -> Duration {
        Duration::from_millis(self.hold_down_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms.max(1))
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn background_sync_interval(&self) -> Duration {
        Duration::from_millis(self.background_sync_interval_ms.max(1))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new()
            .with_base_backoff_ms(self.backoff_base_ms)
            .with_max_backoff_ms(self.backoff_cap_ms)
            .with_jitter_enabled(self.jitter)
            .with_max_attempts(self.max_attempts)
    }
}
