// Running min/max per joint while the operator moves it by hand

use std::collections::BTreeMap;

use super::CalibrationSample;

/// Extremes seen so far for one joint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservedRange {
    pub min: u16,
    pub max: u16,
}

impl ObservedRange {
    pub fn span(&self) -> u16 {
        self.max - self.min
    }
}

/// Accumulates samples into per-motor ranges that only ever widen.
///
/// A motor with no sample yet has no range; a dropped sample is simply
/// never observed.
#[derive(Debug, Clone, Default)]
pub struct RangeTracker {
    ranges: BTreeMap<u8, ObservedRange>,
    samples: u64,
}

impl RangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, sample: CalibrationSample) {
        self.samples += 1;
        self.ranges
            .entry(sample.motor_id)
            .and_modify(|range| {
                range.min = range.min.min(sample.position);
                range.max = range.max.max(sample.position);
            })
            .or_insert(ObservedRange {
                min: sample.position,
                max: sample.position,
            });
    }

    pub fn range(&self, motor_id: u8) -> Option<ObservedRange> {
        self.ranges.get(&motor_id).copied()
    }

    pub fn ranges(&self) -> &BTreeMap<u8, ObservedRange> {
        &self.ranges
    }

    /// Total samples observed across all motors
    pub fn sample_count(&self) -> u64 {
        self.samples
    }
}
