//! Pipeline configuration.
//!
//! Defaults match the acceptor controller's fixed parameters; a TOML file
//! and/or `PULSE_`-prefixed environment variables can override them through
//! the `config` crate. Durations are expressed in humantime form
//! (`"100ms"`, `"5s"`); the retention window is a plain day count.

use crate::error::PulseResult;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Serial line settings for the acceptor controller port.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Line speed. The controller board is fixed at 115200.
    pub baud_rate: u32,
    /// Read timeout treated as "no data yet" by the read loop.
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            read_timeout: Duration::from_millis(100),
        }
    }
}

/// Top-level configuration for the ingestion pipeline.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PulseConfig {
    /// Serial transport settings.
    pub serial: SerialConfig,
    /// Fixed interval between retry-queue drain passes.
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,
    /// Maximum retained persistence-retry items. Failures past this cap are
    /// dropped with an error log; this is the documented data-loss boundary
    /// for sustained storage outages.
    pub retry_capacity: usize,
    /// Retention window for processed-id records, in days.
    pub retention_days: i64,
    /// Capacity of the bounded decoded-event channel between the device
    /// client and the orchestrator.
    pub event_channel_capacity: usize,
    /// Capacity of the credit broadcast channel to subscribers.
    pub credit_channel_capacity: usize,
    /// How recently data must have arrived for the port to be considered
    /// live. A liveness heuristic for health checks, not a correctness
    /// mechanism.
    #[serde(with = "humantime_serde")]
    pub stale_after: Duration,
}

impl Default for PulseConfig {
    fn default() -> Self {
        Self {
            serial: SerialConfig::default(),
            retry_interval: Duration::from_secs(5),
            retry_capacity: 100,
            retention_days: 30,
            event_channel_capacity: 64,
            credit_channel_capacity: 64,
            stale_after: Duration::from_secs(60),
        }
    }
}

impl PulseConfig {
    /// Load configuration from a TOML file, layered under `PULSE_`-prefixed
    /// environment variables (e.g. `PULSE_RETRY_CAPACITY=50`).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or a value fails to parse.
    pub fn load(path: &Path) -> PulseResult<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.to_path_buf()))
            .add_source(config::Environment::with_prefix("PULSE").separator("__"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_controller_parameters() {
        let cfg = PulseConfig::default();
        assert_eq!(cfg.serial.baud_rate, 115_200);
        assert_eq!(cfg.serial.read_timeout, Duration::from_millis(100));
        assert_eq!(cfg.retry_interval, Duration::from_secs(5));
        assert_eq!(cfg.retry_capacity, 100);
        assert_eq!(cfg.retention_days, 30);
        assert_eq!(cfg.stale_after, Duration::from_secs(60));
    }

    #[test]
    fn test_load_partial_toml_keeps_defaults() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(file, "retry_capacity = 10\n\n[serial]\nread_timeout = \"50ms\"").unwrap();

        let cfg = PulseConfig::load(file.path()).unwrap();
        assert_eq!(cfg.retry_capacity, 10);
        assert_eq!(cfg.serial.read_timeout, Duration::from_millis(50));
        // Untouched fields keep their defaults.
        assert_eq!(cfg.serial.baud_rate, 115_200);
        assert_eq!(cfg.retention_days, 30);
    }
}
