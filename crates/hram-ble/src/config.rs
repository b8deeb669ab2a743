//! Configuration types for the heart-rate driver
//!
//! Timing knobs for scanning, reconnection and link tracking. Every field has
//! a default, so an empty JSON object is a valid configuration. Durations are
//! written as humantime strings (`"5s"`, `"500ms"`).

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{HramError, Result};

/// Default length of a user-initiated scan
pub const DEFAULT_SCAN_DURATION_MS: u64 = 5000;

/// Default number of retries after a reconnectable failure
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 3;

/// Default delay before each retry
pub const DEFAULT_RETRY_DELAY_MS: u64 = 2000;

/// Default debounce window applied to a disconnected link
pub const DEFAULT_DEBOUNCE_MS: u64 = 500;

/// Main configuration for the driver
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HramConfig {
    /// Device discovery settings
    #[serde(default)]
    pub scan: ScanConfig,

    /// Reconnection settings
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Link tracking settings
    #[serde(default)]
    pub tracker: TrackerConfig,
}

impl HramConfig {
    /// Parse a configuration from JSON
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: HramConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Reject values the driver cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.scan.duration.is_zero() {
            return Err(HramError::InvalidConfig(
                "scan.duration must be greater than zero".to_string(),
            ));
        }
        if self.reconnect.scan_timeout.is_zero() {
            return Err(HramError::InvalidConfig(
                "reconnect.scan_timeout must be greater than zero".to_string(),
            ));
        }
        if self.tracker.debounce.is_zero() {
            return Err(HramError::InvalidConfig(
                "tracker.debounce must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Device discovery configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanConfig {
    /// How long a user-initiated scan runs before completing
    #[serde(with = "humantime_serde", default = "default_scan_duration")]
    pub duration: Duration,
}

fn default_scan_duration() -> Duration {
    Duration::from_millis(DEFAULT_SCAN_DURATION_MS)
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            duration: default_scan_duration(),
        }
    }
}

/// Reconnection behavior configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Retries allowed after a reconnectable failure (0 = fail on first error)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before each retry
    #[serde(with = "humantime_serde", default = "default_retry_delay")]
    pub retry_delay: Duration,

    /// How long to look for the device's advertisement on each attempt
    #[serde(with = "humantime_serde", default = "default_scan_duration")]
    pub scan_timeout: Duration,

    /// Restore the full retry budget after each successful connection
    ///
    /// Off by default: the budget covers the whole session.
    #[serde(default)]
    pub replenish_after_success: bool,
}

fn default_max_attempts() -> u32 {
    DEFAULT_RECONNECT_ATTEMPTS
}

fn default_retry_delay() -> Duration {
    Duration::from_millis(DEFAULT_RETRY_DELAY_MS)
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            retry_delay: default_retry_delay(),
            scan_timeout: default_scan_duration(),
            replenish_after_success: false,
        }
    }
}

/// Link tracking configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// A disconnected link must stay disconnected this long before it counts
    #[serde(with = "humantime_serde", default = "default_debounce")]
    pub debounce: Duration,
}

fn default_debounce() -> Duration {
    Duration::from_millis(DEFAULT_DEBOUNCE_MS)
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            debounce: default_debounce(),
        }
    }
}

/// Builder for HramConfig
#[derive(Debug, Default)]
pub struct HramConfigBuilder {
    config: HramConfig,
}

impl HramConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the user-initiated scan duration
    pub fn scan_duration(mut self, duration: Duration) -> Self {
        self.config.scan.duration = duration;
        self
    }

    /// Set the retry budget
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.reconnect.max_attempts = attempts;
        self
    }

    /// Set the delay before each retry
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.reconnect.retry_delay = delay;
        self
    }

    /// Set the per-attempt scan timeout
    pub fn scan_timeout(mut self, timeout: Duration) -> Self {
        self.config.reconnect.scan_timeout = timeout;
        self
    }

    /// Restore the retry budget after every successful connection
    pub fn replenish_after_success(mut self, replenish: bool) -> Self {
        self.config.reconnect.replenish_after_success = replenish;
        self
    }

    /// Set the disconnect debounce window
    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.config.tracker.debounce = debounce;
        self
    }

    /// Build the configuration
    pub fn build(self) -> HramConfig {
        self.config
    }
}

// Custom serde module for Duration with humantime
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
