//! Error types shared by the commissioning services

use crate::calibration::{CalibrationPhase, StoreError};
use crate::motor::FeetechError;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No or unusable response. The caller may retry after checking power
    /// and wiring; nothing in this crate retries on its own.
    #[error("Communication with motor(s) {ids:?} failed: {source}")]
    Communication {
        ids: Vec<u8>,
        #[source]
        source: FeetechError,
    },

    /// The target id already answers on the bus
    #[error("Id {id} is already taken by a motor on the bus; disconnect it first")]
    Conflict { id: u8 },

    /// More than one motor answered the identification broadcast
    #[error("Several motors answered the identification broadcast {responders:?}; connect exactly one")]
    AmbiguousBus { responders: Vec<u8> },

    /// The id write went out but the motor does not answer at its new id
    #[error("Motor did not answer at id {id} after the id write; re-run check-ids")]
    IdNotVerified { id: u8 },

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Another calibration session is already active")]
    SessionBusy,

    #[error("`{operation}` is not valid while the session is {phase:?}")]
    InvalidPhase {
        operation: &'static str,
        phase: CalibrationPhase,
    },

    #[error("Calibration was cancelled")]
    Cancelled,

    #[error("Calibration store error: {0}")]
    Store(#[from] StoreError),

    /// The background position poller died, so the captured ranges are incomplete
    #[error("Position sampling stopped unexpectedly: {0}")]
    SamplerFailed(String),
}

impl Error {
    pub(crate) fn communication(ids: impl Into<Vec<u8>>, source: FeetechError) -> Self {
        Error::Communication {
            ids: ids.into(),
            source,
        }
    }

    /// Whether the operator can simply try again once the physical cause is fixed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Communication { .. }
                | Error::Conflict { .. }
                | Error::AmbiguousBus { .. }
                | Error::IdNotVerified { .. }
                | Error::SessionBusy
        )
    }

    /// Motor ids the error is about, if any
    pub fn motor_ids(&self) -> Vec<u8> {
        match self {
            Error::Communication { ids, .. } => ids.clone(),
            Error::Conflict { id } | Error::IdNotVerified { id } => vec![*id],
            Error::AmbiguousBus { responders } => responders.clone(),
            _ => Vec::new(),
        }
    }
}
