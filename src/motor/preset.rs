// Named torque/speed presets applied to a freshly identified motor

use serde::{Deserialize, Serialize};
use tracing::info;

use super::feetech::Register;
use super::transport::BusTransport;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    /// Conservative profile: half torque, slow ramps, soft position loop
    #[default]
    Gentle,
    /// Factory-like profile for normal operation
    Normal,
}

/// Register values a preset writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresetValues {
    pub max_torque: u16,   // 0..1000, EEPROM ceiling
    pub torque_limit: u16, // 0..1000, RAM
    pub acceleration: u8,
    pub p_coefficient: u8,
}

impl Preset {
    pub fn values(self) -> PresetValues {
        match self {
            Preset::Gentle => PresetValues {
                max_torque: 500,
                torque_limit: 500,
                acceleration: 20,
                p_coefficient: 16,
            },
            Preset::Normal => PresetValues {
                max_torque: 1000,
                torque_limit: 1000,
                acceleration: 254,
                p_coefficient: 32,
            },
        }
    }

    /// Write the preset to one motor
    pub async fn apply(self, bus: &BusTransport, id: u8) -> Result<()> {
        let values = self.values();
        info!("Applying {:?} preset to motor {}", self, id);

        bus.write_register(id, Register::MaxTorqueLimit, values.max_torque)
            .await?;
        bus.write_register(id, Register::PCoefficient, values.p_coefficient as u16)
            .await?;
        bus.write_register(id, Register::TorqueLimit, values.torque_limit)
            .await?;
        bus.write_register(id, Register::Acceleration, values.acceleration as u16)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::sim::{SimMotor, SimulatedBus};
    use std::time::Duration;

    #[test]
    fn test_gentle_is_softer_than_normal() {
        let gentle = Preset::Gentle.values();
        let normal = Preset::Normal.values();
        assert!(gentle.torque_limit < normal.torque_limit);
        assert!(gentle.acceleration < normal.acceleration);
        assert_eq!(Preset::default(), Preset::Gentle);
    }

    #[tokio::test]
    async fn test_apply_writes_all_registers() {
        let sim = SimulatedBus::new();
        sim.add_motor(SimMotor::new(2, 2048));
        let bus = BusTransport::new(sim.clone(), Duration::from_millis(100));

        Preset::Gentle.apply(&bus, 2).await.unwrap();

        assert_eq!(sim.register(2, Register::MaxTorqueLimit), Some(500));
        assert_eq!(sim.register(2, Register::PCoefficient), Some(16));
        assert_eq!(sim.register(2, Register::TorqueLimit), Some(500));
        assert_eq!(sim.register(2, Register::Acceleration), Some(20));
    }
}
