// Expected motor slots for the fixture
//
// Ids are assigned 1..=N in chain order; the registry is the single source of
// which ids must be present and what each joint is called.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Raw position every joint reports at its home once calibrated
pub const CENTER_POSITION: u16 = 2048;

/// Axis a joint rotates about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JointRole {
    Yaw,
    Pitch,
    Roll,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Motor {
    pub id: u8,
    pub name: String,
    pub role: JointRole,
    /// Raw goal used for the safe parked pose before torque is released
    #[serde(default = "default_park_position")]
    pub park_position: u16,
}

fn default_park_position() -> u16 {
    CENTER_POSITION
}

impl Motor {
    pub fn new(id: u8, name: &str, role: JointRole) -> Self {
        Self {
            id,
            name: name.to_string(),
            role,
            park_position: CENTER_POSITION,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Motor>", into = "Vec<Motor>")]
pub struct MotorRegistry {
    motors: Vec<Motor>,
}

impl MotorRegistry {
    /// Build a registry, checking ids run 1..=N in order without gaps
    pub fn new(motors: Vec<Motor>) -> Result<Self> {
        if motors.is_empty() {
            return Err(Error::Validation("registry has no motors".to_string()));
        }
        for (slot, motor) in motors.iter().enumerate() {
            let expected = slot + 1;
            if motor.id as usize != expected {
                return Err(Error::Validation(format!(
                    "registry slot {} holds id {} ({}), expected {}",
                    slot, motor.id, motor.name, expected
                )));
            }
        }
        Ok(Self { motors })
    }

    /// The five-joint arm the fixture ships with
    pub fn reference_arm() -> Self {
        Self {
            motors: vec![
                Motor::new(1, "base_yaw", JointRole::Yaw),
                Motor::new(2, "base_pitch", JointRole::Pitch),
                Motor::new(3, "elbow_pitch", JointRole::Pitch),
                Motor::new(4, "wrist_roll", JointRole::Roll),
                Motor::new(5, "wrist_pitch", JointRole::Pitch),
            ],
        }
    }

    pub fn len(&self) -> usize {
        self.motors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.motors.is_empty()
    }

    pub fn motors(&self) -> &[Motor] {
        &self.motors
    }

    /// Expected ids, ascending
    pub fn ids(&self) -> Vec<u8> {
        self.motors.iter().map(|m| m.id).collect()
    }

    pub fn get(&self, id: u8) -> Option<&Motor> {
        self.motors.iter().find(|m| m.id == id)
    }

    /// Look up a slot, rejecting ids outside the registry
    pub fn slot(&self, id: u8) -> Result<&Motor> {
        self.get(id).ok_or_else(|| {
            Error::Validation(format!(
                "id {} is not a registry slot (expected 1..={})",
                id,
                self.len()
            ))
        })
    }
}

impl Default for MotorRegistry {
    fn default() -> Self {
        Self::reference_arm()
    }
}

impl TryFrom<Vec<Motor>> for MotorRegistry {
    type Error = Error;

    fn try_from(motors: Vec<Motor>) -> Result<Self> {
        Self::new(motors)
    }
}

impl From<MotorRegistry> for Vec<Motor> {
    fn from(registry: MotorRegistry) -> Self {
        registry.motors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_arm_layout() {
        let registry = MotorRegistry::reference_arm();
        assert_eq!(registry.ids(), vec![1, 2, 3, 4, 5]);
        assert_eq!(registry.slot(3).unwrap().name, "elbow_pitch");
        assert_eq!(registry.slot(4).unwrap().role, JointRole::Roll);
    }

    #[test]
    fn test_slot_rejects_out_of_range_ids() {
        let registry = MotorRegistry::reference_arm();
        assert!(matches!(registry.slot(0), Err(Error::Validation(_))));
        assert!(matches!(registry.slot(6), Err(Error::Validation(_))));
    }

    #[test]
    fn test_gapped_registry_is_rejected() {
        let motors = vec![
            Motor::new(1, "a", JointRole::Yaw),
            Motor::new(3, "b", JointRole::Pitch),
        ];
        assert!(MotorRegistry::new(motors).is_err());
    }

    #[test]
    fn test_registry_from_json() {
        let json = r#"[
            {"id": 1, "name": "pan", "role": "yaw"},
            {"id": 2, "name": "tilt", "role": "pitch", "park_position": 1500}
        ]"#;
        let registry: MotorRegistry = serde_json::from_str(json).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.slot(1).unwrap().park_position, CENTER_POSITION);
        assert_eq!(registry.slot(2).unwrap().park_position, 1500);

        let bad = r#"[{"id": 2, "name": "tilt", "role": "pitch"}]"#;
        assert!(serde_json::from_str::<MotorRegistry>(bad).is_err());
    }
}
