//! Durable calibration file
//!
//! Written through a temporary file in the same directory and renamed over
//! the previous one, so a power cut mid-write leaves either the old or the
//! new calibration, never a mix.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use super::CalibrationResult;
use crate::motor::MotorRegistry;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Malformed calibration file {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Refusing to store calibration: {0}")]
    Invalid(String),
}

/// One persisted row per registry slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotorCalibration {
    pub id: u8,
    pub name: String,
    pub center: u16,
    pub min: u16,
    pub max: u16,
    pub range_invalid: bool,
}

impl From<&MotorCalibration> for CalibrationResult {
    fn from(row: &MotorCalibration) -> Self {
        Self {
            motor_id: row.id,
            center: row.center,
            min: row.min,
            max: row.max,
            range_invalid: row.range_invalid,
        }
    }
}

/// On-disk layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationFile {
    pub motors_enabled: bool,
    #[serde(default)]
    pub motors: Vec<MotorCalibration>,
}

pub struct CalibrationStore {
    path: PathBuf,
    registry: MotorRegistry,
}

impl CalibrationStore {
    pub fn new(path: impl Into<PathBuf>, registry: MotorRegistry) -> Self {
        Self {
            path: path.into(),
            registry,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Replace the stored calibration with `results`.
    ///
    /// Every registry slot needs exactly one row and `min <= max`; otherwise
    /// nothing is written.
    pub fn write(&self, results: &[CalibrationResult]) -> Result<(), StoreError> {
        let mut rows = Vec::with_capacity(self.registry.len());
        for motor in self.registry.motors() {
            let mut matching = results.iter().filter(|r| r.motor_id == motor.id);
            let result = match (matching.next(), matching.next()) {
                (Some(result), None) => result,
                (None, _) => {
                    return Err(StoreError::Invalid(format!(
                        "no result for motor {} ({})",
                        motor.id, motor.name
                    )));
                }
                (Some(_), Some(_)) => {
                    return Err(StoreError::Invalid(format!(
                        "duplicate results for motor {}",
                        motor.id
                    )));
                }
            };
            if result.min > result.max {
                return Err(StoreError::Invalid(format!(
                    "motor {} has min {} above max {}",
                    motor.id, result.min, result.max
                )));
            }
            rows.push(MotorCalibration {
                id: motor.id,
                name: motor.name.clone(),
                center: result.center,
                min: result.min,
                max: result.max,
                range_invalid: result.range_invalid,
            });
        }
        if results.len() != rows.len() {
            return Err(StoreError::Invalid(format!(
                "{} results for {} registry slots",
                results.len(),
                rows.len()
            )));
        }

        self.commit(&CalibrationFile {
            motors_enabled: true,
            motors: rows,
        })?;
        info!("Stored calibration for {} motors in {}", results.len(), self.path.display());
        Ok(())
    }

    /// Record that calibration was skipped and the motors stay disabled
    pub fn write_disabled_marker(&self) -> Result<(), StoreError> {
        self.commit(&CalibrationFile {
            motors_enabled: false,
            motors: Vec::new(),
        })?;
        info!("Stored motors-disabled marker in {}", self.path.display());
        Ok(())
    }

    /// The stored file, `None` if calibration never ran
    pub fn load(&self) -> Result<Option<CalibrationFile>, StoreError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(e)),
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|source| StoreError::Json {
                path: self.path.clone(),
                source,
            })
    }

    /// Stored results; empty when missing or when motors are disabled
    pub fn read(&self) -> Result<Vec<CalibrationResult>, StoreError> {
        Ok(self
            .load()?
            .map(|file| file.motors.iter().map(CalibrationResult::from).collect())
            .unwrap_or_default())
    }

    fn commit(&self, file: &CalibrationFile) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(file).map_err(|source| StoreError::Json {
            path: self.path.clone(),
            source,
        })?;

        let mut temp_name = self.path.file_name().unwrap_or_default().to_os_string();
        temp_name.push(".tmp");
        let temp_path = self.path.with_file_name(temp_name);

        let mut temp = File::create(&temp_path).map_err(|e| self.io_error(e))?;
        temp.write_all(json.as_bytes())
            .and_then(|_| temp.sync_all())
            .map_err(|e| self.io_error(e))?;
        drop(temp);

        fs::rename(&temp_path, &self.path).map_err(|e| self.io_error(e))?;
        self.sync_parent_dir()
    }

    /// Make the rename itself durable
    #[cfg(unix)]
    fn sync_parent_dir(&self) -> Result<(), StoreError> {
        match self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(dir) => File::open(dir)
                .and_then(|d| d.sync_all())
                .map_err(|e| self.io_error(e)),
            None => Ok(()),
        }
    }

    #[cfg(not(unix))]
    fn sync_parent_dir(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::CENTER_POSITION;

    fn results() -> Vec<CalibrationResult> {
        (1..=5)
            .map(|id| CalibrationResult {
                motor_id: id,
                center: CENTER_POSITION,
                min: 1500 + id as u16,
                max: 2500,
                range_invalid: false,
            })
            .collect()
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = CalibrationStore::new(dir.path().join("cal.json"), MotorRegistry::reference_arm());

        store.write(&results()).unwrap();
        assert_eq!(store.read().unwrap(), results());

        let file = store.load().unwrap().unwrap();
        assert!(file.motors_enabled);
        assert_eq!(file.motors[2].name, "elbow_pitch");
        assert!(!dir.path().join("cal.json.tmp").exists());
    }

    #[test]
    fn test_rewrite_overwrites_without_merge() {
        let dir = tempfile::tempdir().unwrap();
        let store = CalibrationStore::new(dir.path().join("cal.json"), MotorRegistry::reference_arm());

        store.write(&results()).unwrap();
        let mut second = results();
        second[0].min = 100;
        store.write(&second).unwrap();
        assert_eq!(store.read().unwrap()[0].min, 100);
    }

    #[test]
    fn test_incomplete_or_inverted_rows_leave_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = CalibrationStore::new(dir.path().join("cal.json"), MotorRegistry::reference_arm());
        store.write(&results()).unwrap();

        let mut missing = results();
        missing.pop();
        assert!(matches!(store.write(&missing), Err(StoreError::Invalid(_))));

        let mut inverted = results();
        inverted[1].min = 3000;
        assert!(matches!(store.write(&inverted), Err(StoreError::Invalid(_))));

        assert_eq!(store.read().unwrap(), results());
    }

    #[test]
    fn test_disabled_marker() {
        let dir = tempfile::tempdir().unwrap();
        let store = CalibrationStore::new(dir.path().join("cal.json"), MotorRegistry::reference_arm());

        store.write_disabled_marker().unwrap();
        let file = store.load().unwrap().unwrap();
        assert!(!file.motors_enabled);
        assert!(store.read().unwrap().is_empty());
    }

    #[test]
    fn test_missing_file_reads_as_uncalibrated() {
        let dir = tempfile::tempdir().unwrap();
        let store = CalibrationStore::new(dir.path().join("none.json"), MotorRegistry::reference_arm());
        assert!(store.load().unwrap().is_none());
        assert!(store.read().unwrap().is_empty());
    }
}
