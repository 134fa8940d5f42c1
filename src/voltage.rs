//! Supply-voltage limit reconciliation
//!
//! Each motor keeps a maximum input voltage in EEPROM (0.1 V units). A motor
//! configured for a lower supply than the fixture provides faults with an
//! over-voltage error as soon as torque is enabled.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::motor::{BusTransport, FeetechError, MotorRegistry, Register};

/// Voltage limit as read from one motor
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VoltageLimitInfo {
    pub motor_id: u8,
    pub configured_volts: f32,
    pub matches_target: bool,
}

pub struct VoltageLimitService {
    bus: BusTransport,
    registry: MotorRegistry,
    target_volts: f32,
    band: (f32, f32),
}

/// Register encoding of a voltage, `None` if it does not fit
fn to_register(volts: f32) -> Option<u8> {
    let tenths = (volts * 10.0).round();
    (volts.is_finite() && tenths > 0.0 && tenths <= u8::MAX as f32).then_some(tenths as u8)
}

fn to_volts(register: u16) -> f32 {
    register as f32 / 10.0
}

impl VoltageLimitService {
    pub fn new(bus: BusTransport, registry: MotorRegistry, target_volts: f32, band: (f32, f32)) -> Self {
        Self {
            bus,
            registry,
            target_volts,
            band,
        }
    }

    fn check_target(&self, volts: f32) -> Result<u8> {
        let (low, high) = self.band;
        let encoded = to_register(volts).ok_or_else(|| {
            Error::Validation(format!("{} V does not fit the voltage limit register", volts))
        })?;
        if !(low..=high).contains(&volts) {
            return Err(Error::Validation(format!(
                "{} V is outside the supported band {}..={} V",
                volts, low, high
            )));
        }
        Ok(encoded)
    }

    /// Read the limit of every reachable registry motor, compared against
    /// the configured target
    pub async fn read_all(&self) -> Result<BTreeMap<u8, VoltageLimitInfo>> {
        let target = self.check_target(self.target_volts)?;
        let present = self.bus.scan(&self.registry.ids()).await?;

        let mut limits = BTreeMap::new();
        for id in present {
            let raw = self.bus.read_register(id, Register::MaxVoltageLimit).await?;
            limits.insert(
                id,
                VoltageLimitInfo {
                    motor_id: id,
                    configured_volts: to_volts(raw),
                    matches_target: raw == target as u16,
                },
            );
        }
        Ok(limits)
    }

    /// Rewrite the limit on every motor that differs from `target_volts`.
    ///
    /// Returns the ids actually written; a second call with the same target
    /// writes nothing. Without `force` every registry motor must answer.
    pub async fn fix(&self, target_volts: f32, force: bool) -> Result<BTreeSet<u8>> {
        let target = self.check_target(target_volts)?;
        let expected = self.registry.ids();
        let present = self.bus.scan(&expected).await?;

        let missing: Vec<u8> = expected
            .iter()
            .copied()
            .filter(|id| !present.contains(id))
            .collect();
        if !missing.is_empty() {
            if !force {
                return Err(Error::Validation(format!(
                    "motors {:?} are not on the bus; connect them or use force",
                    missing
                )));
            }
            warn!("Skipping unreachable motors {:?}", missing);
        }

        let mut modified = BTreeSet::new();
        for id in present {
            let current = self.bus.read_register(id, Register::MaxVoltageLimit).await?;
            if current == target as u16 {
                continue;
            }

            info!(
                "Motor {}: voltage limit {} V -> {} V",
                id,
                to_volts(current),
                to_volts(target as u16)
            );
            self.bus
                .write_register(id, Register::MaxVoltageLimit, target as u16)
                .await?;

            let written = self.bus.read_register(id, Register::MaxVoltageLimit).await?;
            if written != target as u16 {
                return Err(Error::communication(
                    [id],
                    FeetechError::InvalidResponse {
                        id,
                        reason: format!(
                            "voltage limit reads back {} after writing {}",
                            written, target
                        ),
                    },
                ));
            }
            modified.insert(id);
        }
        Ok(modified)
    }
}
