// Timeouts, topics, bus and calibration configuration
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::motor::{MotorRegistry, Preset};

// Serial port for the Feetech bus adapter
pub const MOTOR_PORT: &str = "/dev/ttyACM0";
pub const MOTOR_BAUDRATE: u32 = 1_000_000;

// Upper bound for a single bus exchange
pub const BUS_TIMEOUT: Duration = Duration::from_millis(100);

// Position polling during homing and range capture
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

// Time to reach the parked pose before torque is released
pub const PARK_DURATION: Duration = Duration::from_millis(1500);

// Wait after releasing torque before a joint is considered backdrivable.
// Hand-tuned; needs checking against settling telemetry.
pub const SETTLE_DELAY: Duration = Duration::from_millis(3500);

// A joint whose observed range is below this many ticks never moved
pub const MIN_MOTION_TICKS: u16 = 20;

// Supply voltage the fixture runs from, and the plausible band for targets
pub const TARGET_VOLTAGE: f32 = 12.0;
pub const VOLTAGE_BAND: (f32, f32) = (4.5, 14.0);

pub const CALIBRATION_FILE: &str = "calibration.json";

// Zenoh topics
pub const TOPIC_PHASE: &str = "fixture/calibration/phase";
pub const TOPIC_POSITIONS: &str = "fixture/calibration/positions";

/// Error loading a config file
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Deployment configuration; every field falls back to the constants above
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FixtureConfig {
    pub port: String,
    pub baudrate: u32,
    pub bus_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub park_duration_ms: u64,
    pub settle_delay_ms: u64,
    pub min_motion_ticks: u16,
    pub target_voltage: f32,
    pub voltage_band: (f32, f32),
    pub calibration_file: PathBuf,
    pub preset: Preset,
    pub motors: MotorRegistry,
}

impl Default for FixtureConfig {
    fn default() -> Self {
        Self {
            port: MOTOR_PORT.to_string(),
            baudrate: MOTOR_BAUDRATE,
            bus_timeout_ms: BUS_TIMEOUT.as_millis() as u64,
            poll_interval_ms: POLL_INTERVAL.as_millis() as u64,
            park_duration_ms: PARK_DURATION.as_millis() as u64,
            settle_delay_ms: SETTLE_DELAY.as_millis() as u64,
            min_motion_ticks: MIN_MOTION_TICKS,
            target_voltage: TARGET_VOLTAGE,
            voltage_band: VOLTAGE_BAND,
            calibration_file: PathBuf::from(CALIBRATION_FILE),
            preset: Preset::default(),
            motors: MotorRegistry::default(),
        }
    }
}

impl FixtureConfig {
    /// Load from a JSON file; missing fields keep their defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the bus layer or the sampler cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bus_timeout_ms == 0 {
            return Err(ConfigError::Invalid("bus_timeout_ms must be greater than zero".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be greater than zero".into()));
        }
        if self.baudrate == 0 {
            return Err(ConfigError::Invalid("baudrate must be greater than zero".into()));
        }
        let (low, high) = self.voltage_band;
        if low.is_nan() || high.is_nan() || low >= high {
            return Err(ConfigError::Invalid(format!(
                "voltage_band ({}, {}) is empty",
                low, high
            )));
        }
        if self.motors.is_empty() {
            return Err(ConfigError::Invalid("motors must not be empty".into()));
        }
        Ok(())
    }

    pub fn bus_timeout(&self) -> Duration {
        Duration::from_millis(self.bus_timeout_ms)
    }

    /// Session timing and thresholds derived from this config
    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            park_duration: Duration::from_millis(self.park_duration_ms),
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            min_motion_ticks: self.min_motion_ticks,
            preset: self.preset,
        }
    }
}

/// Timing knobs for a calibration session
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub poll_interval: Duration,
    pub park_duration: Duration,
    pub settle_delay: Duration,
    pub min_motion_ticks: u16,
    /// Caps the torque limit while the fixture moves to its parked pose
    pub preset: Preset,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: POLL_INTERVAL,
            park_duration: PARK_DURATION,
            settle_delay: SETTLE_DELAY,
            min_motion_ticks: MIN_MOTION_TICKS,
            preset: Preset::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: FixtureConfig =
            serde_json::from_str(r#"{"port": "/dev/ttyUSB1", "settle_delay_ms": 2000}"#).unwrap();
        assert_eq!(config.port, "/dev/ttyUSB1");
        assert_eq!(config.baudrate, MOTOR_BAUDRATE);
        assert_eq!(config.session().settle_delay, Duration::from_millis(2000));
        assert_eq!(config.motors.len(), 5);
    }

    #[test]
    fn test_load_reports_missing_file() {
        let err = FixtureConfig::load(Path::new("/nonexistent/fixture.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_load_rejects_zero_poll_interval() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fixture.json");
        std::fs::write(&path, r#"{"poll_interval_ms": 0}"#).unwrap();

        let err = FixtureConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref msg) if msg.contains("poll_interval_ms")));
    }

    #[test]
    fn test_validate_rejects_unusable_values() {
        let config = FixtureConfig {
            bus_timeout_ms: 0,
            ..FixtureConfig::default()
        };
        assert!(config.validate().is_err());

        let config = FixtureConfig {
            voltage_band: (14.0, 4.5),
            ..FixtureConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(FixtureConfig::default().validate().is_ok());
    }

    #[test]
    fn test_session_carries_configured_preset() {
        let config: FixtureConfig = serde_json::from_str(r#"{"preset": "normal"}"#).unwrap();
        assert_eq!(config.session().preset, Preset::Normal);
        assert_eq!(SessionConfig::default().preset, Preset::Gentle);
    }
}
