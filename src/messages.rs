// Payloads published for passive observers of a calibration run

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::calibration::CalibrationPhase;

/// Published whenever the session changes phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseUpdate {
    pub phase: CalibrationPhase,
    pub seq: u64,
}

/// One motor's latest raw position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JointPosition {
    pub id: u8,
    pub raw: u16,
}

/// Published after every polling sweep
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionsUpdate {
    pub phase: CalibrationPhase,
    pub positions: Vec<JointPosition>,
}

impl PositionsUpdate {
    pub fn new(phase: CalibrationPhase, positions: &BTreeMap<u8, u16>) -> Self {
        Self {
            phase,
            positions: positions
                .iter()
                .map(|(&id, &raw)| JointPosition { id, raw })
                .collect(),
        }
    }
}
