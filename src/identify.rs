//! Bus scanning and one-at-a-time id assignment
//!
//! Motors leave the factory sharing a default id, so each one is connected
//! alone and given its registry id. Nothing here retries: a failed attempt
//! is reported once and the operator decides what to do next, since blind
//! retries on a mis-wired bus can command the wrong motor.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::motor::feetech::BROADCAST_ID;
use crate::motor::{BusTransport, FeetechError, Motor, MotorRegistry, Preset};

/// Registry ids split into those that answered and those that did not.
///
/// `found_ids ∪ missing_ids` is always the full registry and the two never
/// overlap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BusScanResult {
    pub found_ids: BTreeSet<u8>,
    pub missing_ids: BTreeSet<u8>,
}

impl BusScanResult {
    pub fn partition(expected: &[u8], responders: &BTreeSet<u8>) -> Self {
        let (found_ids, missing_ids) = expected.iter().partition(|id| responders.contains(id));
        Self {
            found_ids,
            missing_ids,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.missing_ids.is_empty()
    }
}

pub struct IdentificationService {
    bus: BusTransport,
    registry: MotorRegistry,
    preset: Preset,
}

impl IdentificationService {
    pub fn new(bus: BusTransport, registry: MotorRegistry) -> Self {
        Self {
            bus,
            registry,
            preset: Preset::default(),
        }
    }

    /// Use a different preset after identification
    pub fn with_preset(mut self, preset: Preset) -> Self {
        self.preset = preset;
        self
    }

    /// Scan the registry ids. Read-only: only pings go on the wire.
    pub async fn check_ids(&self) -> Result<BusScanResult> {
        let expected = self.registry.ids();
        let responders = self.bus.scan(&expected).await?;
        let result = BusScanResult::partition(&expected, &responders);
        if result.is_complete() {
            info!("All {} expected ids answer", expected.len());
        } else {
            info!(
                "Found ids {:?}, missing {:?}",
                result.found_ids, result.missing_ids
            );
        }
        Ok(result)
    }

    /// Give the single exposed motor the id `target_id`.
    ///
    /// With `force`, a motor already answering at `target_id` does not block
    /// the assignment. The new id is only reported once a fresh scan sees a
    /// motor answering at it.
    pub async fn assign_id(&self, target_id: u8, force: bool) -> Result<Motor> {
        let motor = self.registry.slot(target_id)?.clone();

        let scan = self.check_ids().await?;
        if scan.found_ids.contains(&target_id) {
            if !force {
                warn!("Id {} already answers on the bus", target_id);
                return Err(Error::Conflict { id: target_id });
            }
            warn!("Id {} already answers on the bus, forcing", target_id);
        }

        let current_id = self.sole_responder().await?;
        if current_id != target_id {
            info!("Reassigning motor at id {} to id {}", current_id, target_id);
            self.bus.write_id(current_id, target_id).await?;
        }

        // Never trust the write alone
        let verified = self.bus.scan(&[target_id]).await?;
        if !verified.contains(&target_id) {
            warn!("Motor did not come back at id {}", target_id);
            if let Err(e) = self.bus.lock_eeprom(current_id).await {
                warn!("Could not relock motor at id {}: {}", current_id, e);
            }
            return Err(Error::IdNotVerified { id: target_id });
        }
        self.bus.lock_eeprom(target_id).await?;

        self.preset.apply(&self.bus, target_id).await?;
        info!("Motor {} ({}) identified", target_id, motor.name);
        Ok(motor)
    }

    /// Id of the one motor answering a broadcast ping
    async fn sole_responder(&self) -> Result<u8> {
        let responders = match self.bus.broadcast_ping().await {
            Ok(responders) => responders,
            Err(Error::Communication {
                source: FeetechError::Collision { .. },
                ..
            }) => {
                return Err(Error::AmbiguousBus {
                    responders: Vec::new(),
                });
            }
            Err(e) => return Err(e),
        };

        match responders.as_slice() {
            [] => Err(Error::communication(
                Vec::new(),
                FeetechError::Timeout { id: BROADCAST_ID },
            )),
            [only] => Ok(*only),
            _ => Err(Error::AmbiguousBus { responders }),
        }
    }
}
