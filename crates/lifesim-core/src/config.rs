//! Configuration loading and typed config structures for the kernel.
//!
//! The configuration lives in `lifesim-config.yaml`. This module defines
//! strongly-typed structs that mirror the YAML structure, a loader, and the
//! validation the controller relies on (speed range, non-zero intervals).

use std::path::Path;
use std::time::Duration;

use chrono::NaiveDate;
use lifesim_types::TimeUnit;
use serde::Deserialize;

/// Slowest accepted speed factor.
pub const MIN_SPEED: f64 = 0.1;

/// Fastest accepted speed factor.
pub const MAX_SPEED: f64 = 10.0;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// A value parsed but is out of range.
    #[error("invalid configuration: {reason}")]
    Invalid {
        /// Explanation of what is wrong.
        reason: String,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level kernel configuration.
///
/// Mirrors the structure of `lifesim-config.yaml`. Every field has a default.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct KernelConfig {
    /// Calendar settings.
    #[serde(default)]
    pub clock: ClockConfig,

    /// Ticker pacing and control settings.
    #[serde(default)]
    pub controller: ControllerConfig,

    /// How the engine binary drives a run.
    #[serde(default)]
    pub run: RunConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl KernelConfig {
    /// Load configuration from a YAML file at the given path.
    ///
    /// `LIFESIM_LOG_LEVEL` overrides `logging.level` when set.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read,
    /// [`ConfigError::Yaml`] if the content is not valid YAML, or
    /// [`ConfigError::Invalid`] if a value is out of range.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML, or
    /// [`ConfigError::Invalid`] if a value is out of range.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_yml::from_str(yaml)?;
        config.logging.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Check every value the kernel depends on.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.controller.validate()
    }
}

/// Calendar configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ClockConfig {
    /// First simulated date (`YYYY-MM-DD`).
    #[serde(default = "default_start_date")]
    pub start_date: NaiveDate,

    /// Increment applied per tick: `day`, `month`, or `year`.
    #[serde(default = "default_time_unit")]
    pub time_unit: TimeUnit,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            start_date: default_start_date(),
            time_unit: default_time_unit(),
        }
    }
}

/// Ticker pacing and control configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ControllerConfig {
    /// Initial speed factor, within [`MIN_SPEED`, `MAX_SPEED`].
    #[serde(default = "default_speed")]
    pub speed: f64,

    /// Wall-clock milliseconds per tick at speed 1.0 when the unit is a day.
    #[serde(default = "default_day_interval_ms")]
    pub day_interval_ms: u64,

    /// Wall-clock milliseconds per tick at speed 1.0 when the unit is a month.
    #[serde(default = "default_month_interval_ms")]
    pub month_interval_ms: u64,

    /// Wall-clock milliseconds per tick at speed 1.0 when the unit is a year.
    #[serde(default = "default_year_interval_ms")]
    pub year_interval_ms: u64,

    /// How long `stop()` waits for the ticker before aborting it.
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// Ticks performed between two progress reports during a seek.
    #[serde(default = "default_seek_chunk_size")]
    pub seek_chunk_size: u32,
}

impl ControllerConfig {
    /// Tick interval at speed 1.0 for `unit`.
    pub const fn base_interval(&self, unit: TimeUnit) -> Duration {
        let ms = match unit {
            TimeUnit::Day => self.day_interval_ms,
            TimeUnit::Month => self.month_interval_ms,
            TimeUnit::Year => self.year_interval_ms,
        };
        Duration::from_millis(ms)
    }

    /// Tick interval for `unit` at `speed`, never shorter than 1ms.
    pub fn tick_period(&self, unit: TimeUnit, speed: f64) -> Duration {
        let clamped = if speed.is_finite() {
            speed.clamp(MIN_SPEED, MAX_SPEED)
        } else {
            1.0
        };
        self.base_interval(unit)
            .div_f64(clamped)
            .max(Duration::from_millis(1))
    }

    /// How long `stop()` waits for the ticker.
    pub const fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// Check the controller settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_speed(self.speed) {
            return Err(ConfigError::Invalid {
                reason: format!(
                    "controller.speed must be within [{MIN_SPEED}, {MAX_SPEED}], got {}",
                    self.speed
                ),
            });
        }
        for unit in TimeUnit::ALL {
            if self.base_interval(unit).is_zero() {
                return Err(ConfigError::Invalid {
                    reason: format!("controller.{unit}_interval_ms must be at least 1"),
                });
            }
        }
        if self.seek_chunk_size == 0 {
            return Err(ConfigError::Invalid {
                reason: "controller.seek_chunk_size must be at least 1".to_owned(),
            });
        }
        Ok(())
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            speed: default_speed(),
            day_interval_ms: default_day_interval_ms(),
            month_interval_ms: default_month_interval_ms(),
            year_interval_ms: default_year_interval_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            seek_chunk_size: default_seek_chunk_size(),
        }
    }
}

/// Whether `speed` is an accepted speed factor.
pub fn is_valid_speed(speed: f64) -> bool {
    speed.is_finite() && (MIN_SPEED..=MAX_SPEED).contains(&speed)
}

/// Run configuration for the engine binary.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RunConfig {
    /// Start the ticker immediately after startup.
    #[serde(default = "default_true")]
    pub autostart: bool,

    /// Stop after this many wall-clock seconds (0 = until interrupted).
    #[serde(default)]
    pub max_real_time_seconds: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            autostart: true,
            max_real_time_seconds: 0,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error). `RUST_LOG` wins when set.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl LoggingConfig {
    /// Override the level with `LIFESIM_LOG_LEVEL` when set.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("LIFESIM_LOG_LEVEL") {
            self.level = val;
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

fn default_start_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 1, 1).unwrap_or_default()
}

const fn default_time_unit() -> TimeUnit {
    TimeUnit::Year
}

const fn default_speed() -> f64 {
    1.0
}

const fn default_day_interval_ms() -> u64 {
    100
}

const fn default_month_interval_ms() -> u64 {
    500
}

const fn default_year_interval_ms() -> u64 {
    1000
}

const fn default_stop_timeout_ms() -> u64 {
    5000
}

const fn default_seek_chunk_size() -> u32 {
    10
}

fn default_log_level() -> String {
    "info".to_owned()
}

const fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = KernelConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.clock.time_unit, TimeUnit::Year);
        assert_eq!(config.controller.base_interval(TimeUnit::Day), Duration::from_millis(100));
        assert_eq!(config.controller.base_interval(TimeUnit::Month), Duration::from_millis(500));
        assert_eq!(config.controller.base_interval(TimeUnit::Year), Duration::from_millis(1000));
        assert_eq!(config.controller.stop_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn parse_full_yaml() {
        let yaml = r#"
clock:
  start_date: "1990-06-01"
  time_unit: month

controller:
  speed: 2.5
  day_interval_ms: 50
  month_interval_ms: 250
  year_interval_ms: 800
  stop_timeout_ms: 1000
  seek_chunk_size: 12

run:
  autostart: false
  max_real_time_seconds: 30

logging:
  level: "debug"
"#;

        let config = KernelConfig::parse(yaml);
        assert!(config.is_ok(), "{config:?}");
        let config = config.ok().unwrap_or_default();

        assert_eq!(config.clock.start_date, NaiveDate::from_ymd_opt(1990, 6, 1).unwrap_or_default());
        assert_eq!(config.clock.time_unit, TimeUnit::Month);
        assert!((config.controller.speed - 2.5).abs() < f64::EPSILON);
        assert_eq!(config.controller.seek_chunk_size, 12);
        assert!(!config.run.autostart);
        assert_eq!(config.run.max_real_time_seconds, 30);
    }

    #[test]
    fn parse_minimal_yaml() {
        let yaml = "clock:\n  time_unit: day\n";
        let config = KernelConfig::parse(yaml).ok().unwrap_or_default();

        assert_eq!(config.clock.time_unit, TimeUnit::Day);
        assert_eq!(config.controller.day_interval_ms, 100);
        assert!(config.run.autostart);
    }

    #[test]
    fn parse_empty_yaml() {
        assert!(KernelConfig::parse("").is_ok());
    }

    #[test]
    fn out_of_range_speed_is_rejected() {
        let result = KernelConfig::parse("controller:\n  speed: 20.0\n");
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let result = KernelConfig::parse("controller:\n  month_interval_ms: 0\n");
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn unknown_time_unit_is_a_yaml_error() {
        let result = KernelConfig::parse("clock:\n  time_unit: fortnight\n");
        assert!(matches!(result, Err(ConfigError::Yaml { .. })));
    }

    #[test]
    fn speed_scales_tick_period() {
        let controller = ControllerConfig::default();
        assert_eq!(controller.tick_period(TimeUnit::Year, 2.0), Duration::from_millis(500));
        assert_eq!(controller.tick_period(TimeUnit::Day, 0.5), Duration::from_millis(200));
        assert_eq!(controller.tick_period(TimeUnit::Day, 10.0), Duration::from_millis(10));
    }

    #[test]
    fn speed_bounds_are_inclusive() {
        assert!(is_valid_speed(MIN_SPEED));
        assert!(is_valid_speed(MAX_SPEED));
        assert!(!is_valid_speed(0.05));
        assert!(!is_valid_speed(15.0));
        assert!(!is_valid_speed(f64::NAN));
    }
}
