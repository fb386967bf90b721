use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// 60 Hz: the minimum interval between two ticks, in milliseconds.
pub const DEFAULT_FRAME_DELAY_MS: f64 = 1000.0 / 60.0;
/// Cadence of the built-in interval tick source. Faster than the frame delay so
/// the pacer, not the timer, decides when a tick runs.
pub const DEFAULT_WAKEUP_INTERVAL_MS: f64 = 1000.0 / 240.0;
pub const DEFAULT_LOG_FILTER: &str = "framepace=info,framepace_scheduler=info";

/// Top-level config (framepace.toml + FRAMEPACE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FramepaceConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Minimum wall-clock interval between ticks. Zero ticks on every wake-up.
    #[serde(default = "default_frame_delay_ms")]
    pub frame_delay_ms: f64,
    /// Period of the interval tick source used by `Scheduler::start`.
    #[serde(default = "default_wakeup_interval_ms")]
    pub wakeup_interval_ms: f64,
}

impl SchedulerConfig {
    pub fn frame_delay(&self) -> Duration {
        millis_to_duration(self.frame_delay_ms)
    }

    pub fn wakeup_interval(&self) -> Duration {
        millis_to_duration(self.wakeup_interval_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            frame_delay_ms: DEFAULT_FRAME_DELAY_MS,
            wakeup_interval_ms: DEFAULT_WAKEUP_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive, used when RUST_LOG is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_frame_delay_ms() -> f64 {
    DEFAULT_FRAME_DELAY_MS
}
fn default_wakeup_interval_ms() -> f64 {
    DEFAULT_WAKEUP_INTERVAL_MS
}
fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

/// Convert a millisecond count from config into a `Duration`.
///
/// Negative, NaN and infinite values clamp to zero rather than panicking in
/// `Duration::from_secs_f64`.
pub fn millis_to_duration(ms: f64) -> Duration {
    if !ms.is_finite() || ms <= 0.0 {
        if ms != 0.0 {
            tracing::warn!(value = ms, "invalid millisecond value in config, using 0");
        }
        return Duration::ZERO;
    }
    Duration::from_secs_f64(ms / 1000.0)
}

impl FramepaceConfig {
    /// Load config from a TOML file with FRAMEPACE_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. FRAMEPACE_CONFIG
    ///   3. ~/.framepace/framepace.toml
    ///
    /// A missing file is not an error; every field has a default. Nested keys
    /// use a double underscore: `FRAMEPACE_SCHEDULER__FRAME_DELAY_MS=8`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("FRAMEPACE_CONFIG").ok())
            .unwrap_or_else(default_config_path);

        let config: FramepaceConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("FRAMEPACE_").ignore(&["config"]).split("__"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.framepace/framepace.toml", home)
}
