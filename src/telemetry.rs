// Forward a calibration session's phase and live positions over Zenoh
//
// Observers (a dashboard, a logger) subscribe to the topics and never talk
// back: the session does not wait for anybody to be listening.

use tracing::{debug, info};

use crate::calibration::{CalibrationPhase, SessionObserver};
use crate::config::{TOPIC_PHASE, TOPIC_POSITIONS};
use crate::messages::{PhaseUpdate, PositionsUpdate};

pub struct Telemetry {
    phase: Option<CalibrationPhase>,
    seq: u64,
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            phase: None,
            seq: 0,
        }
    }

    /// Update for a phase change; `None` if nothing changed since the last one
    fn on_phase(&mut self, phase: CalibrationPhase) -> Option<PhaseUpdate> {
        if self.phase == Some(phase) {
            return None;
        }
        self.phase = Some(phase);
        self.seq += 1;
        Some(PhaseUpdate {
            phase,
            seq: self.seq,
        })
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

/// Publish until the session is dropped
pub async fn publish(observer: SessionObserver) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;
    let pub_phase = session.declare_publisher(TOPIC_PHASE).await?;
    let pub_positions = session.declare_publisher(TOPIC_POSITIONS).await?;
    info!("Publishing to: {}, {}", TOPIC_PHASE, TOPIC_POSITIONS);

    let mut phases = observer.clone();
    let mut sweeps = observer;
    let mut current = phases.phase();

    let mut telemetry = Telemetry::new();
    if let Some(update) = telemetry.on_phase(current) {
        pub_phase.put(serde_json::to_string(&update)?).await?;
    }

    loop {
        tokio::select! {
            phase = phases.phase_changed() => {
                let Some(phase) = phase else { break };
                current = phase;
                if let Some(update) = telemetry.on_phase(phase) {
                    pub_phase.put(serde_json::to_string(&update)?).await?;
                }
            }
            positions = sweeps.positions_changed() => {
                let Some(positions) = positions else { break };
                let update = PositionsUpdate::new(current, &positions);
                pub_positions.put(serde_json::to_string(&update)?).await?;
            }
        }
    }
    debug!("Session gone, telemetry stopped");
    Ok(())
}
