// Serialized, timeout-bounded access to the motor bus
//
// The register primitive is blocking (serial port reads). BusTransport runs
// every operation on the blocking pool behind one mutex, so exactly one
// request is on the wire at a time, and bounds it with a timeout so a stuck
// exchange surfaces as a communication error instead of hanging the caller.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use super::feetech::{
    decode_sign_magnitude, encode_sign_magnitude, FeetechError, Register, Result as BusResult,
};
use crate::error::{Error, Result};

/// Sign bit of the homing offset register
const HOMING_OFFSET_SIGN_BIT: u8 = 11;

/// Register width on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Byte,
    Word,
}

impl Width {
    pub fn bytes(self) -> u8 {
        match self {
            Width::Byte => 1,
            Width::Word => 2,
        }
    }
}

/// Blocking per-id register primitive provided by the hardware collaborator
pub trait RegisterBus: Send {
    /// Ping one id. `Ok(false)` means nobody answered.
    fn ping(&mut self, id: u8) -> BusResult<bool>;

    /// Ping the broadcast id and return every id that answered
    fn broadcast_ping(&mut self) -> BusResult<Vec<u8>>;

    fn read(&mut self, id: u8, addr: u8, width: Width) -> BusResult<u16>;

    fn write(&mut self, id: u8, addr: u8, width: Width, value: u16) -> BusResult<()>;

    /// Write the same register on several motors in one broadcast packet.
    /// Nobody acknowledges it.
    fn sync_write(&mut self, addr: u8, width: Width, data: &[(u8, u16)]) -> BusResult<()>;
}

/// Shared handle to the motor bus
#[derive(Clone)]
pub struct BusTransport {
    bus: Arc<Mutex<Box<dyn RegisterBus>>>,
    timeout: Duration,
    session_active: Arc<AtomicBool>,
}

/// Held by the one calibration session allowed on a bus at a time
#[derive(Debug)]
pub struct SessionLease {
    flag: Arc<AtomicBool>,
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

impl BusTransport {
    pub fn new(bus: impl RegisterBus + 'static, timeout: Duration) -> Self {
        Self {
            bus: Arc::new(Mutex::new(Box::new(bus))),
            timeout,
            session_active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Claim the bus for a calibration session, `None` if one is already active
    pub fn try_claim_session(&self) -> Option<SessionLease> {
        self.session_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SessionLease {
                flag: Arc::clone(&self.session_active),
            })
    }

    /// Run one bus operation under the lock and the timeout.
    ///
    /// `ids` names the motors the operation addresses and is attached to any
    /// error; `budget` scales the timeout for multi-exchange operations.
    async fn run<T, F>(&self, ids: &[u8], budget: u32, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn RegisterBus) -> BusResult<T> + Send + 'static,
    {
        let bus = Arc::clone(&self.bus);
        let first_id = ids.first().copied().unwrap_or(0);
        let task = tokio::task::spawn_blocking(move || {
            let mut guard = bus.lock().map_err(|_| FeetechError::InvalidResponse {
                id: first_id,
                reason: "bus lock poisoned by a panicked operation".to_string(),
            })?;
            op(guard.as_mut())
        });

        let limit = self.timeout * budget.max(1);
        let outcome = match tokio::time::timeout(limit, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(FeetechError::Io(std::io::Error::other(join_err))),
            Err(_) => {
                warn!("Bus operation on {:?} exceeded {:?}", ids, limit);
                Err(FeetechError::Timeout { id: first_id })
            }
        };

        outcome.map_err(|source| Error::Communication {
            ids: ids.to_vec(),
            source,
        })
    }

    /// Ping every id in `ids` and return the ones that answered.
    ///
    /// A garbled answer from several motors sharing an id still counts as
    /// that id being occupied.
    pub async fn scan(&self, ids: &[u8]) -> Result<BTreeSet<u8>> {
        let targets = ids.to_vec();
        let found = self
            .run(ids, ids.len() as u32 + 1, move |bus| {
                let mut found = BTreeSet::new();
                for id in targets {
                    match bus.ping(id) {
                        Ok(true) => {
                            found.insert(id);
                        }
                        Ok(false) => {}
                        Err(FeetechError::Collision { .. }) => {
                            warn!("Id {} answered by more than one motor", id);
                            found.insert(id);
                        }
                        Err(e) => return Err(e),
                    }
                }
                Ok(found)
            })
            .await?;
        debug!("Scan of {:?} found {:?}", ids, found);
        Ok(found)
    }

    pub async fn broadcast_ping(&self) -> Result<Vec<u8>> {
        // Responses trickle in until the read times out
        self.run(&[], 4, |bus| bus.broadcast_ping()).await
    }

    pub async fn read_register(&self, id: u8, register: Register) -> Result<u16> {
        self.run(&[id], 1, move |bus| {
            bus.read(id, register.addr(), register.width())
        })
        .await
    }

    /// Write one register; EEPROM registers are unlocked and relocked around it
    pub async fn write_register(&self, id: u8, register: Register, value: u16) -> Result<()> {
        if register.is_eeprom() {
            return self.write_eeprom(id, register, value).await;
        }
        self.run(&[id], 1, move |bus| {
            bus.write(id, register.addr(), register.width(), value)
        })
        .await
    }

    async fn write_eeprom(&self, id: u8, register: Register, value: u16) -> Result<()> {
        self.run(&[id], 3, move |bus| {
            let lock = Register::Lock;
            bus.write(id, lock.addr(), lock.width(), 0)?;
            bus.write(id, register.addr(), register.width(), value)?;
            bus.write(id, lock.addr(), lock.width(), 1)
        })
        .await
    }

    /// Unlock the motor at `current_id` and write `new_id` to its id register.
    ///
    /// The EEPROM is left unlocked: the motor has to be found at its new id
    /// before it can be relocked with [`BusTransport::lock_eeprom`].
    pub async fn write_id(&self, current_id: u8, new_id: u8) -> Result<()> {
        self.run(&[current_id], 2, move |bus| {
            let lock = Register::Lock;
            bus.write(current_id, lock.addr(), lock.width(), 0)?;
            bus.write(
                current_id,
                Register::Id.addr(),
                Register::Id.width(),
                new_id as u16,
            )
        })
        .await
    }

    /// Write one RAM register on several motors at once.
    ///
    /// The write is not acknowledged, so a missing motor goes unnoticed;
    /// scan first when that matters.
    pub async fn sync_write(&self, register: Register, data: Vec<(u8, u16)>) -> Result<()> {
        let ids: Vec<u8> = data.iter().map(|&(id, _)| id).collect();
        if register.is_eeprom() {
            return Err(Error::Validation(format!(
                "{:?} is an EEPROM register and cannot be sync written",
                register
            )));
        }
        if data.is_empty() {
            return Ok(());
        }
        self.run(&ids, 1, move |bus| {
            bus.sync_write(register.addr(), register.width(), &data)
        })
        .await
    }

    pub async fn lock_eeprom(&self, id: u8) -> Result<()> {
        self.write_register(id, Register::Lock, 1).await
    }

    pub async fn read_position(&self, id: u8) -> Result<u16> {
        self.read_register(id, Register::PresentPosition).await
    }

    pub async fn read_homing_offset(&self, id: u8) -> Result<i16> {
        let raw = self.read_register(id, Register::HomingOffset).await?;
        Ok(decode_sign_magnitude(raw, HOMING_OFFSET_SIGN_BIT))
    }

    pub async fn write_homing_offset(&self, id: u8, offset: i16) -> Result<()> {
        let raw = encode_sign_magnitude(offset, HOMING_OFFSET_SIGN_BIT);
        self.write_eeprom(id, Register::HomingOffset, raw).await
    }

    pub async fn set_torque(&self, id: u8, enabled: bool) -> Result<()> {
        self.write_register(id, Register::TorqueEnable, enabled as u16)
            .await
    }

    /// Re-enable torque holding the joint where it currently is
    pub async fn hold_in_place(&self, id: u8) -> Result<()> {
        self.run(&[id], 3, move |bus| {
            let present = bus.read(
                id,
                Register::PresentPosition.addr(),
                Register::PresentPosition.width(),
            )?;
            bus.write(
                id,
                Register::GoalPosition.addr(),
                Register::GoalPosition.width(),
                present,
            )?;
            bus.write(
                id,
                Register::TorqueEnable.addr(),
                Register::TorqueEnable.width(),
                1,
            )
        })
        .await
    }
}
