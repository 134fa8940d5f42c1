//! In-memory motor bus for tests and `--simulate` runs
//!
//! Models just enough of an STS3215 chain to exercise identification,
//! voltage configuration and calibration: per-motor register files, EEPROM
//! lock semantics, homing offsets applied to the reported position, id
//! collisions and scripted hand motion.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::feetech::{decode_sign_magnitude, FeetechError, Register, Result, BROADCAST_ID};
use super::transport::{RegisterBus, Width};

const MODEL_STS3215: u16 = 777;
const POSITION_MODULO: i32 = 4096;

/// One simulated servo
#[derive(Debug, Clone)]
pub struct SimMotor {
    id: u8,
    raw_position: u16,
    registers: HashMap<u8, u16>,
    script: VecDeque<Option<u16>>,
    offline: bool,
    rejects_id_write: bool,
}

impl SimMotor {
    /// Motor at `id` resting at `raw_position`, torque on, EEPROM locked
    pub fn new(id: u8, raw_position: u16) -> Self {
        let registers = HashMap::from([
            (Register::ModelNumber.addr(), MODEL_STS3215),
            (Register::Id.addr(), id as u16),
            (Register::MaxVoltageLimit.addr(), 80),
            (Register::MinVoltageLimit.addr(), 40),
            (Register::MaxTorqueLimit.addr(), 1000),
            (Register::PCoefficient.addr(), 32),
            (Register::HomingOffset.addr(), 0),
            (Register::TorqueEnable.addr(), 1),
            (Register::Acceleration.addr(), 0),
            (Register::GoalPosition.addr(), raw_position),
            (Register::TorqueLimit.addr(), 1000),
            (Register::Lock.addr(), 1),
        ]);
        Self {
            id,
            raw_position,
            registers,
            script: VecDeque::new(),
            offline: false,
            rejects_id_write: false,
        }
    }

    pub fn with_max_voltage(mut self, tenths_of_volt: u8) -> Self {
        self.registers
            .insert(Register::MaxVoltageLimit.addr(), tenths_of_volt as u16);
        self
    }

    /// Motor silently ignores id writes (for verification failures)
    pub fn rejecting_id_writes(mut self) -> Self {
        self.rejects_id_write = true;
        self
    }

    fn homing_offset(&self) -> i32 {
        decode_sign_magnitude(self.register(Register::HomingOffset), 11) as i32
    }

    fn reported_position(&self) -> u16 {
        (self.raw_position as i32 - self.homing_offset()).rem_euclid(POSITION_MODULO) as u16
    }

    /// Goal positions share the reported frame
    fn goal_to_raw(&self, goal: u16) -> u16 {
        (goal as i32 + self.homing_offset()).rem_euclid(POSITION_MODULO) as u16
    }

    fn register(&self, register: Register) -> u16 {
        self.registers
            .get(&register.addr())
            .copied()
            .unwrap_or_default()
    }

    fn apply_write(&mut self, addr: u8, value: u16) {
        let locked = self.register(Register::Lock) != 0;
        if addr < Register::TorqueEnable.addr() && locked {
            // EEPROM writes are dropped while locked, as on the real part
            return;
        }
        if addr == Register::Id.addr() {
            if self.rejects_id_write {
                return;
            }
            self.id = value as u8;
        }
        self.registers.insert(addr, value);
        // A powered joint snaps to its goal
        let goal_changed = addr == Register::GoalPosition.addr();
        let torque_enabled = addr == Register::TorqueEnable.addr() && value != 0;
        if (goal_changed || torque_enabled) && self.register(Register::TorqueEnable) != 0 {
            self.raw_position = self.goal_to_raw(self.register(Register::GoalPosition));
        }
    }
}

/// A write the simulated bus accepted, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRecord {
    pub id: u8,
    pub addr: u8,
    pub value: u16,
}

#[derive(Default)]
struct SimState {
    motors: Vec<SimMotor>,
    writes: Vec<WriteRecord>,
    sync_writes: usize,
    response_delay: Duration,
}

/// Shared simulated bus; clones observe and steer the same chain
#[derive(Clone, Default)]
pub struct SimulatedBus {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fully identified chain with ids `1..=count`, every joint centred
    pub fn fixture(count: u8) -> Self {
        let sim = Self::new();
        for id in 1..=count {
            sim.add_motor(SimMotor::new(id, 2048));
        }
        sim
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_motor(&self, motor: SimMotor) {
        self.state().motors.push(motor);
    }

    /// Unplug every motor currently answering at `id`
    pub fn remove_motor(&self, id: u8) {
        self.state().motors.retain(|m| m.id != id);
    }

    pub fn set_offline(&self, id: u8, offline: bool) {
        for motor in self.state().motors.iter_mut().filter(|m| m.id == id) {
            motor.offline = offline;
        }
    }

    pub fn set_response_delay(&self, delay: Duration) {
        self.state().response_delay = delay;
    }

    /// Move a joint by hand to a raw position
    pub fn move_joint(&self, id: u8, raw_position: u16) {
        for motor in self.state().motors.iter_mut().filter(|m| m.id == id) {
            motor.raw_position = raw_position;
        }
    }

    /// Queue raw positions returned by successive position reads.
    ///
    /// `None` makes that read time out, like a dropped frame.
    pub fn script_positions(&self, id: u8, positions: impl IntoIterator<Item = Option<u16>>) {
        let positions: Vec<_> = positions.into_iter().collect();
        for motor in self.state().motors.iter_mut().filter(|m| m.id == id) {
            motor.script.extend(positions.iter().copied());
        }
    }

    /// Number of scripted reads not yet consumed for `id`
    pub fn pending_script(&self, id: u8) -> usize {
        self.state()
            .motors
            .iter()
            .filter(|m| m.id == id)
            .map(|m| m.script.len())
            .sum()
    }

    pub fn register(&self, id: u8, register: Register) -> Option<u16> {
        self.state()
            .motors
            .iter()
            .find(|m| m.id == id)
            .map(|m| m.register(register))
    }

    pub fn motor_ids(&self) -> Vec<u8> {
        self.state().motors.iter().map(|m| m.id).collect()
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.state().writes.clone()
    }

    pub fn writes_to(&self, register: Register) -> usize {
        self.state()
            .writes
            .iter()
            .filter(|w| w.addr == register.addr())
            .count()
    }

    pub fn clear_writes(&self) {
        let mut state = self.state();
        state.writes.clear();
        state.sync_writes = 0;
    }

    /// Sync write packets seen since the last `clear_writes`
    pub fn sync_writes(&self) -> usize {
        self.state().sync_writes
    }

    fn settle(&self) {
        let delay = self.state().response_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }
}

impl SimState {
    fn single(&mut self, id: u8) -> Result<&mut SimMotor> {
        let mut matching = self.motors.iter_mut().filter(|m| m.id == id && !m.offline);
        match (matching.next(), matching.next()) {
            (Some(motor), None) => Ok(motor),
            (None, _) => Err(FeetechError::Timeout { id }),
            (Some(_), Some(_)) => Err(FeetechError::Collision { id }),
        }
    }
}

impl RegisterBus for SimulatedBus {
    fn ping(&mut self, id: u8) -> Result<bool> {
        self.settle();
        match self.state().single(id) {
            Ok(_) => Ok(true),
            Err(FeetechError::Timeout { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn broadcast_ping(&mut self) -> Result<Vec<u8>> {
        self.settle();
        Ok(self
            .state()
            .motors
            .iter()
            .filter(|m| !m.offline)
            .map(|m| m.id)
            .collect())
    }

    fn read(&mut self, id: u8, addr: u8, width: Width) -> Result<u16> {
        self.settle();
        let mut state = self.state();
        let motor = state.single(id)?;

        let value = if addr == Register::PresentPosition.addr() {
            if let Some(next) = motor.script.pop_front() {
                match next {
                    Some(raw) => motor.raw_position = raw,
                    None => return Err(FeetechError::Timeout { id }),
                }
            }
            motor.reported_position()
        } else {
            motor.registers.get(&addr).copied().unwrap_or_default()
        };

        Ok(match width {
            Width::Byte => value & 0xFF,
            Width::Word => value,
        })
    }

    fn write(&mut self, id: u8, addr: u8, width: Width, value: u16) -> Result<()> {
        self.settle();
        let value = match width {
            Width::Byte => value & 0xFF,
            Width::Word => value,
        };
        let mut state = self.state();
        if id == BROADCAST_ID {
            for motor in state.motors.iter_mut().filter(|m| !m.offline) {
                motor.apply_write(addr, value);
            }
        } else {
            state.single(id)?.apply_write(addr, value);
        }
        state.writes.push(WriteRecord { id, addr, value });
        Ok(())
    }

    fn sync_write(&mut self, addr: u8, width: Width, data: &[(u8, u16)]) -> Result<()> {
        self.settle();
        let mut state = self.state();
        state.sync_writes += 1;
        for &(id, value) in data {
            let value = match width {
                Width::Byte => value & 0xFF,
                Width::Word => value,
            };
            // Unacknowledged: absent motors just miss it
            for motor in state.motors.iter_mut().filter(|m| m.id == id && !m.offline) {
                motor.apply_write(addr, value);
            }
            state.writes.push(WriteRecord { id, addr, value });
        }
        Ok(())
    }
}
