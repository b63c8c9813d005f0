//! Tracking cadence and hardening knobs.

use std::time::Duration;

use course_core::model::Percent;
use serde::Deserialize;

use crate::error::ConfigError;

/// Timer periods, thresholds and write bounds for watch sessions.
///
/// Every field has a default, so an empty TOML document is a valid config.
///
/// ```
/// # use services::config::TrackingConfig;
/// let config = TrackingConfig::from_toml_str("flush_interval_ms = 10000").unwrap();
/// assert_eq!(config.flush_interval_ms, 10_000);
/// assert_eq!(config.sample_interval_ms, 1_000);
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrackingConfig {
    pub sample_interval_ms: u64,
    pub flush_interval_ms: u64,
    /// Minimum position change, in seconds, before a periodic flush writes.
    pub flush_epsilon_secs: f64,
    pub completion_threshold: u8,
    pub final_flush_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub embed_reply_timeout_ms: u64,
    pub completion_retry_attempts: u32,
    /// Base delay; doubled after every failed attempt.
    pub completion_retry_backoff_ms: u64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 1_000,
            flush_interval_ms: 5_000,
            flush_epsilon_secs: 3.0,
            completion_threshold: Percent::COMPLETION_THRESHOLD.value(),
            final_flush_timeout_ms: 2_000,
            write_timeout_ms: 2_000,
            embed_reply_timeout_ms: 1_500,
            completion_retry_attempts: 3,
            completion_retry_backoff_ms: 200,
        }
    }
}

impl TrackingConfig {
    /// Parse and validate a TOML document.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` for malformed TOML or unknown keys, and
    /// `ConfigError::Invalid` when a value is out of range.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason| Err(ConfigError::Invalid { field, reason });

        for (field, value) in [
            ("sample_interval_ms", self.sample_interval_ms),
            ("flush_interval_ms", self.flush_interval_ms),
            ("final_flush_timeout_ms", self.final_flush_timeout_ms),
            ("write_timeout_ms", self.write_timeout_ms),
            ("embed_reply_timeout_ms", self.embed_reply_timeout_ms),
        ] {
            if value == 0 {
                return invalid(field, "must be greater than zero");
            }
        }
        if !self.flush_epsilon_secs.is_finite() || self.flush_epsilon_secs < 0.0 {
            return invalid("flush_epsilon_secs", "must be a non-negative number");
        }
        if !(1..=100).contains(&self.completion_threshold) {
            return invalid("completion_threshold", "must be within 1..=100");
        }
        if self.completion_retry_attempts == 0 {
            return invalid("completion_retry_attempts", "must be at least 1");
        }
        Ok(())
    }

    #[must_use]
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    #[must_use]
    pub fn final_flush_timeout(&self) -> Duration {
        Duration::from_millis(self.final_flush_timeout_ms)
    }

    #[must_use]
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    #[must_use]
    pub fn embed_reply_timeout(&self) -> Duration {
        Duration::from_millis(self.embed_reply_timeout_ms)
    }

    #[must_use]
    pub fn completion_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.completion_retry_backoff_ms)
    }

    /// Falls back to the default threshold if the field was never validated.
    #[must_use]
    pub fn threshold(&self) -> Percent {
        Percent::new(self.completion_threshold).unwrap_or(Percent::COMPLETION_THRESHOLD)
    }
}
