// Motor bus layer for the fixture
//
// Provides:
// - Feetech STS3215 serial protocol implementation
// - Serialized, timeout-bounded bus access shared by every service
// - The expected motor registry and named torque presets
// - A simulated bus for tests and dry runs

pub mod feetech;
mod preset;
mod registry;
pub mod sim;
mod transport;

pub use feetech::{FeetechBus, FeetechError, Register};
pub use preset::{Preset, PresetValues};
pub use registry::{JointRole, Motor, MotorRegistry, CENTER_POSITION};
pub use transport::{BusTransport, RegisterBus, SessionLease, Width};
