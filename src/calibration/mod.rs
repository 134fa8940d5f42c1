//! Homing and range-of-motion calibration
//!
//! A [`CalibrationSession`] walks the fixture through homing and range
//! capture; the outcome lands in a [`CalibrationStore`] that motion
//! execution reads later.

mod center;
mod range;
mod session;
mod store;

use serde::{Deserialize, Serialize};

pub use center::{set_center, CenterTarget};
pub use range::{ObservedRange, RangeTracker};
pub use session::{CalibrationSession, CancelHandle, SessionObserver};
pub use store::{CalibrationFile, CalibrationStore, MotorCalibration, StoreError};

/// Where a calibration session stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationPhase {
    Idle,
    Connecting,
    Homing,
    RangeCapture,
    Finalizing,
    Done,
    Error,
    Skipped,
}

impl CalibrationPhase {
    /// Phases during which the session holds the bus
    pub fn is_active(self) -> bool {
        matches!(
            self,
            CalibrationPhase::Connecting
                | CalibrationPhase::Homing
                | CalibrationPhase::RangeCapture
                | CalibrationPhase::Finalizing
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CalibrationPhase::Done | CalibrationPhase::Error | CalibrationPhase::Skipped
        )
    }
}

/// One polled position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationSample {
    pub motor_id: u8,
    pub position: u16,
}

/// Calibration outcome for one motor.
///
/// Positions are in the re-centred frame where the home sample reads
/// `center`; `min <= max` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationResult {
    pub motor_id: u8,
    pub center: u16,
    pub min: u16,
    pub max: u16,
    /// The joint did not move during range capture
    pub range_invalid: bool,
}

const POSITION_MODULO: i32 = 4096;
const MAX_POSITION: i32 = POSITION_MODULO - 1;

/// Largest magnitude the 11-bit homing offset register holds
const MAX_HOMING_OFFSET: i32 = 2047;

/// Undo the motor's current homing offset: present = raw - offset
fn to_raw(present: u16, offset: i16) -> u16 {
    (present as i32 + offset as i32).rem_euclid(POSITION_MODULO) as u16
}

/// Offset that makes `home_raw` read back as the center position.
///
/// Raw 0 would need -2048, one past what the register encodes; that home
/// reads back as 2047 instead.
fn homing_offset_for(home_raw: u16) -> i16 {
    (home_raw as i32 - crate::motor::CENTER_POSITION as i32)
        .clamp(-MAX_HOMING_OFFSET, MAX_HOMING_OFFSET) as i16
}

/// What the motor reports for `raw` once `offset` is written
fn to_frame(raw: u16, offset: i16) -> u16 {
    (raw as i32 - offset as i32).rem_euclid(POSITION_MODULO) as u16
}

/// Express a raw position in the frame of `offset`, clamped to the encoder range
fn recentre(raw: u16, offset: i16) -> u16 {
    (raw as i32 - offset as i32).clamp(0, MAX_POSITION) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_home_sample_reads_as_center() {
        for home in [1u16, 1000, 2000, 2048, 4095] {
            let offset = homing_offset_for(home);
            assert_eq!(to_frame(home, offset), 2048);
            assert_eq!(recentre(home, offset), 2048);
        }
    }

    #[test]
    fn test_home_at_zero_saturates_offset() {
        let offset = homing_offset_for(0);
        assert_eq!(offset, -2047);
        assert_eq!(to_frame(0, offset), 2047);
    }

    #[test]
    fn test_travel_across_encoder_wrap_stays_ordered() {
        // Home at raw 100, joint swept back through raw 0 to 4000
        let offset = homing_offset_for(100);
        assert_eq!(to_frame(4000, offset), 1852);
        assert_eq!(to_frame(100, offset), 2048);
        assert_eq!(to_frame(300, offset), 2248);
    }

    #[test]
    fn test_to_raw_wraps() {
        assert_eq!(to_raw(2048, -48), 2000);
        assert_eq!(to_raw(10, -20), 4086);
        assert_eq!(to_raw(4090, 10), 4);
    }

    #[test]
    fn test_phase_classification() {
        assert!(CalibrationPhase::RangeCapture.is_active());
        assert!(!CalibrationPhase::Idle.is_active());
        assert!(CalibrationPhase::Skipped.is_terminal());
        assert!(!CalibrationPhase::Homing.is_terminal());
    }
}
