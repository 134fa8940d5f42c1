//! Commissioning for a daisy-chained Feetech servo fixture
//!
//! Motor identification, supply-voltage limit configuration and homing plus
//! range calibration over one shared serial bus.

pub mod calibration;
pub mod config;
pub mod error;
pub mod identify;
pub mod messages;
pub mod motor;
pub mod telemetry;
pub mod voltage;

pub use error::{Error, Result};
