// Calibration session state machine
//
// Idle -> Connecting -> Homing -> RangeCapture -> Finalizing -> Done
//
// The session owns its phase; presentation layers observe it through
// SessionObserver and drive it through the command methods. Any failure
// lands in Error, cancel() returns to Idle, skip() goes straight from Idle
// to Skipped without touching the bus.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{
    homing_offset_for, to_frame, to_raw, CalibrationPhase, CalibrationResult, CalibrationSample,
    CalibrationStore, ObservedRange, RangeTracker,
};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::motor::{BusTransport, FeetechError, MotorRegistry, Register, SessionLease};

type Positions = BTreeMap<u8, u16>;

/// Current phase plus the data that phase owns
enum State {
    Idle,
    Connecting,
    Homing(Run),
    RangeCapture {
        run: Run,
        home: Positions,
    },
    Finalizing {
        run: Run,
        offsets: BTreeMap<u8, i16>,
        results: Vec<CalibrationResult>,
    },
    Done(Vec<CalibrationResult>),
    Error {
        failed_ids: Vec<u8>,
    },
    Skipped,
}

impl State {
    fn phase(&self) -> CalibrationPhase {
        match self {
            State::Idle => CalibrationPhase::Idle,
            State::Connecting => CalibrationPhase::Connecting,
            State::Homing(_) => CalibrationPhase::Homing,
            State::RangeCapture { .. } => CalibrationPhase::RangeCapture,
            State::Finalizing { .. } => CalibrationPhase::Finalizing,
            State::Done(_) => CalibrationPhase::Done,
            State::Error { .. } => CalibrationPhase::Error,
            State::Skipped => CalibrationPhase::Skipped,
        }
    }
}

/// What Connecting changed on the motors, so it can be put back
#[derive(Default)]
struct Connection {
    prior_offsets: BTreeMap<u8, i16>,
    torque_limits: BTreeMap<u8, u16>,
}

/// Bus ownership and background polling for one attempt
struct Run {
    _lease: SessionLease,
    connection: Connection,
    sampler: Sampler,
}

/// Ranges being accumulated, each motor in the frame its new offset creates.
///
/// Home reads 2048 there and travel stays within ±2047 of it, so a sweep
/// across the encoder's 4095/0 seam stays one contiguous interval.
struct Capture {
    offsets: BTreeMap<u8, i16>,
    tracker: RangeTracker,
}

/// Background position poller
struct Sampler {
    halt: watch::Sender<bool>,
    capture: Arc<Mutex<Option<Capture>>>,
    task: Option<JoinHandle<()>>,
}

fn lock_capture(capture: &Mutex<Option<Capture>>) -> MutexGuard<'_, Option<Capture>> {
    capture.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Sampler {
    fn spawn(
        bus: BusTransport,
        offsets: BTreeMap<u8, i16>,
        period: Duration,
        cancel: watch::Receiver<bool>,
        positions: Arc<watch::Sender<Positions>>,
    ) -> Self {
        let (halt, halt_rx) = watch::channel(false);
        let capture = Arc::new(Mutex::new(None));
        let task = tokio::spawn(poll_positions(
            bus,
            offsets,
            period,
            halt_rx,
            cancel,
            Arc::clone(&capture),
            positions,
        ));
        Self {
            halt,
            capture,
            task: Some(task),
        }
    }

    /// Start accumulating ranges from the next poll on, relative to `offsets`
    fn begin_capture(&self, offsets: BTreeMap<u8, i16>) {
        *lock_capture(&self.capture) = Some(Capture {
            offsets,
            tracker: RangeTracker::new(),
        });
    }

    fn ranges(&self) -> Option<BTreeMap<u8, ObservedRange>> {
        lock_capture(&self.capture)
            .as_ref()
            .map(|capture| capture.tracker.ranges().clone())
    }

    /// Stop polling and hand back whatever was accumulated.
    ///
    /// A poller that died early saw only part of the motion, so its ranges
    /// are not handed back.
    async fn stop(&mut self) -> Result<Option<RangeTracker>> {
        self.halt.send_replace(true);
        if let Some(task) = self.task.take() {
            task.await.map_err(|e| Error::SamplerFailed(e.to_string()))?;
        }
        Ok(lock_capture(&self.capture).take().map(|capture| capture.tracker))
    }
}

async fn poll_positions(
    bus: BusTransport,
    offsets: BTreeMap<u8, i16>,
    period: Duration,
    mut halt: watch::Receiver<bool>,
    mut cancel: watch::Receiver<bool>,
    capture: Arc<Mutex<Option<Capture>>>,
    positions: Arc<watch::Sender<Positions>>,
) {
    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut latest = Positions::new();

    loop {
        let closed = tokio::select! {
            _ = tick.tick() => false,
            changed = halt.changed() => changed.is_err(),
            changed = cancel.changed() => changed.is_err(),
        };
        if closed || *halt.borrow() || *cancel.borrow() {
            break;
        }

        for (&id, &offset) in &offsets {
            // Cancellation is honoured between every read
            if *halt.borrow() || *cancel.borrow() {
                debug!("Position poller stopping mid-sweep");
                return;
            }
            match bus.read_position(id).await {
                Ok(present) => {
                    let raw = to_raw(present, offset);
                    latest.insert(id, raw);
                    if let Some(capture) = lock_capture(&capture).as_mut() {
                        if let Some(&home_offset) = capture.offsets.get(&id) {
                            capture.tracker.observe(CalibrationSample {
                                motor_id: id,
                                position: to_frame(raw, home_offset),
                            });
                        }
                    }
                }
                // A missed sample is skipped, never replaced
                Err(e) => debug!("Sample from motor {} skipped: {}", id, e),
            }
        }
        positions.send_replace(latest.clone());
    }
    debug!("Position poller stopped");
}

/// Requests cancellation from another task.
///
/// The session notices between polls, during the connect waits, and at its
/// next command.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        info!("Calibration cancel requested");
        self.tx.send_replace(true);
    }
}

/// Read-only view of a session for presentation layers
#[derive(Clone)]
pub struct SessionObserver {
    phase: watch::Receiver<CalibrationPhase>,
    positions: watch::Receiver<Positions>,
}

impl SessionObserver {
    pub fn phase(&self) -> CalibrationPhase {
        *self.phase.borrow()
    }

    /// Latest raw position per motor
    pub fn positions(&self) -> Positions {
        self.positions.borrow().clone()
    }

    /// Wait for the next phase change; `None` once the session is gone
    pub async fn phase_changed(&mut self) -> Option<CalibrationPhase> {
        self.phase.changed().await.ok()?;
        Some(*self.phase.borrow_and_update())
    }

    /// Wait for the next position sweep; `None` once the session is gone
    pub async fn positions_changed(&mut self) -> Option<Positions> {
        self.positions.changed().await.ok()?;
        Some(self.positions.borrow_and_update().clone())
    }
}

pub struct CalibrationSession {
    bus: BusTransport,
    registry: MotorRegistry,
    store: CalibrationStore,
    config: SessionConfig,
    state: State,
    phase_tx: watch::Sender<CalibrationPhase>,
    positions_tx: Arc<watch::Sender<Positions>>,
    cancel_tx: Arc<watch::Sender<bool>>,
}

impl CalibrationSession {
    pub fn new(
        bus: BusTransport,
        registry: MotorRegistry,
        store: CalibrationStore,
        config: SessionConfig,
    ) -> Self {
        let (phase_tx, _) = watch::channel(CalibrationPhase::Idle);
        let (positions_tx, _) = watch::channel(Positions::new());
        let (cancel_tx, _) = watch::channel(false);
        Self {
            bus,
            registry,
            store,
            config,
            state: State::Idle,
            phase_tx,
            positions_tx: Arc::new(positions_tx),
            cancel_tx: Arc::new(cancel_tx),
        }
    }

    pub fn phase(&self) -> CalibrationPhase {
        self.state.phase()
    }

    pub fn observe(&self) -> SessionObserver {
        SessionObserver {
            phase: self.phase_tx.subscribe(),
            positions: self.positions_tx.subscribe(),
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: Arc::clone(&self.cancel_tx),
        }
    }

    /// Latest raw position per motor while homing or capturing ranges
    pub fn live_positions(&self) -> Result<Positions> {
        match self.phase() {
            CalibrationPhase::Homing | CalibrationPhase::RangeCapture => {
                Ok(self.positions_tx.borrow().clone())
            }
            phase => Err(Error::InvalidPhase {
                operation: "live_positions",
                phase,
            }),
        }
    }

    /// Ranges accumulated so far, in the frame where home reads center
    pub fn live_ranges(&self) -> Option<BTreeMap<u8, ObservedRange>> {
        match &self.state {
            State::RangeCapture { run, .. } => run.sampler.ranges(),
            _ => None,
        }
    }

    /// Rows computed by capture_ranges, and persisted once Done
    pub fn results(&self) -> Option<&[CalibrationResult]> {
        match &self.state {
            State::Finalizing { results, .. } | State::Done(results) => Some(results),
            _ => None,
        }
    }

    /// Motors blamed for the failure that put the session in Error
    pub fn failed_ids(&self) -> Option<&[u8]> {
        match &self.state {
            State::Error { failed_ids } => Some(failed_ids),
            _ => None,
        }
    }

    fn set_state(&mut self, state: State) {
        let phase = state.phase();
        self.state = state;
        self.phase_tx.send_replace(phase);
        debug!("Calibration phase: {:?}", phase);
    }

    fn cancel_requested(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// Sleep unless cancelled first
    async fn pause(&self, duration: Duration) -> Result<()> {
        let mut cancel = self.cancel_tx.subscribe();
        if *cancel.borrow_and_update() {
            return Err(Error::Cancelled);
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = cancel.wait_for(|cancelled| *cancelled) => Err(Error::Cancelled),
        }
    }

    /// Park the fixture and release it for manual positioning
    pub async fn start(&mut self) -> Result<()> {
        match self.phase() {
            CalibrationPhase::Idle => {}
            phase if phase.is_terminal() => {
                return Err(Error::InvalidPhase {
                    operation: "start",
                    phase,
                });
            }
            _ => return Err(Error::SessionBusy),
        }
        if self.config.poll_interval.is_zero() {
            return Err(Error::Validation(
                "position poll interval must be greater than zero".to_string(),
            ));
        }
        let lease = self.bus.try_claim_session().ok_or(Error::SessionBusy)?;
        self.cancel_tx.send_replace(false);
        self.set_state(State::Connecting);
        info!("Connecting to {} motors", self.registry.len());

        let mut connection = Connection::default();
        match self.connect(&mut connection).await {
            Ok(()) => {
                let sampler = Sampler::spawn(
                    self.bus.clone(),
                    connection.prior_offsets.clone(),
                    self.config.poll_interval,
                    self.cancel_tx.subscribe(),
                    Arc::clone(&self.positions_tx),
                );
                self.set_state(State::Homing(Run {
                    _lease: lease,
                    connection,
                    sampler,
                }));
                info!("Joints released; place the fixture in its home pose");
                Ok(())
            }
            Err(Error::Cancelled) => {
                self.restore(&connection).await;
                self.cancel_tx.send_replace(false);
                self.set_state(State::Idle);
                info!("Calibration cancelled while connecting");
                Err(Error::Cancelled)
            }
            Err(e) => {
                warn!("Connecting failed: {}", e);
                self.restore(&connection).await;
                self.set_state(State::Error {
                    failed_ids: e.motor_ids(),
                });
                Err(e)
            }
        }
    }

    async fn connect(&self, connection: &mut Connection) -> Result<()> {
        let ids = self.registry.ids();
        let present = self.bus.scan(&ids).await?;
        let missing: Vec<u8> = ids
            .iter()
            .copied()
            .filter(|id| !present.contains(id))
            .collect();
        if let Some(&first) = missing.first() {
            return Err(Error::communication(missing, FeetechError::Timeout { id: first }));
        }

        for &id in &ids {
            let offset = self.bus.read_homing_offset(id).await?;
            connection.prior_offsets.insert(id, offset);
        }
        if self.cancel_requested() {
            return Err(Error::Cancelled);
        }

        // Move to the parked pose under reduced torque
        let cap = self.config.preset.values().torque_limit;
        let mut parked = Vec::with_capacity(ids.len());
        for motor in self.registry.motors() {
            let limit = self.bus.read_register(motor.id, Register::TorqueLimit).await?;
            connection.torque_limits.insert(motor.id, limit);
            self.bus
                .write_register(motor.id, Register::TorqueLimit, cap.min(limit))
                .await?;
            parked.push((motor.id, motor.park_position));
        }
        self.bus.sync_write(Register::GoalPosition, parked).await?;
        self.bus.sync_write(Register::TorqueEnable, all(&ids, 1)).await?;
        self.pause(self.config.park_duration).await?;

        self.bus.sync_write(Register::TorqueEnable, all(&ids, 0)).await?;
        info!(
            "Torque released, waiting {:?} for joints to settle",
            self.config.settle_delay
        );
        self.pause(self.config.settle_delay).await
    }

    /// Capture every motor's current raw position as its home
    pub async fn record_homing(&mut self) -> Result<Positions> {
        let run = match std::mem::replace(&mut self.state, State::Idle) {
            State::Homing(run) => run,
            other => return self.reject(other, "record_homing"),
        };
        if self.cancel_requested() {
            return self.abandon(run).await;
        }

        match self.capture_home(&run).await {
            Ok(home) => {
                let offsets = home
                    .iter()
                    .map(|(&id, &raw)| (id, homing_offset_for(raw)))
                    .collect();
                run.sampler.begin_capture(offsets);
                info!("Home recorded: {:?}", home);
                self.set_state(State::RangeCapture {
                    run,
                    home: home.clone(),
                });
                Ok(home)
            }
            Err(e) => self.fail(run, e).await,
        }
    }

    async fn capture_home(&self, run: &Run) -> Result<Positions> {
        let mut home = Positions::new();
        for (&id, &offset) in &run.connection.prior_offsets {
            let present = self.bus.read_position(id).await?;
            home.insert(id, to_raw(present, offset));
        }
        // Stay compliant for range capture
        for &id in home.keys() {
            self.bus.set_torque(id, false).await?;
        }
        Ok(home)
    }

    /// Stop sampling and compute the calibration rows
    pub async fn capture_ranges(&mut self) -> Result<Vec<CalibrationResult>> {
        let (mut run, home) = match std::mem::replace(&mut self.state, State::Idle) {
            State::RangeCapture { run, home } => (run, home),
            other => return self.reject(other, "capture_ranges"),
        };
        if self.cancel_requested() {
            return self.abandon(run).await;
        }

        let tracker = match run.sampler.stop().await {
            Ok(tracker) => tracker.unwrap_or_default(),
            Err(e) => return self.fail(run, e).await,
        };
        info!("Range capture stopped after {} samples", tracker.sample_count());

        let mut offsets = BTreeMap::new();
        let mut results = Vec::with_capacity(home.len());
        for (&id, &home_raw) in &home {
            let offset = homing_offset_for(home_raw);
            offsets.insert(id, offset);

            // Samples are already in the new frame
            let center = to_frame(home_raw, offset);
            let (min, max) = match tracker.range(id) {
                Some(range) => (range.min, range.max),
                None => (center, center),
            };
            let range_invalid = max - min < self.config.min_motion_ticks;
            if range_invalid {
                warn!("Motor {} did not move during range capture", id);
            }
            results.push(CalibrationResult {
                motor_id: id,
                center,
                min,
                max,
                range_invalid,
            });
        }

        self.set_state(State::Finalizing {
            run,
            offsets,
            results: results.clone(),
        });
        Ok(results)
    }

    /// Write the new homing offsets and persist every row, or nothing
    pub async fn finalize(&mut self) -> Result<Vec<CalibrationResult>> {
        let (run, offsets, results) = match std::mem::replace(&mut self.state, State::Idle) {
            State::Finalizing {
                run,
                offsets,
                results,
            } => (run, offsets, results),
            other => return self.reject(other, "finalize"),
        };

        // A timed-out write may still land, so it is rolled back too
        let mut written = Vec::new();
        for (&id, &offset) in &offsets {
            written.push(id);
            if let Err(e) = self.bus.write_homing_offset(id, offset).await {
                self.rollback_offsets(&run.connection, &written).await;
                return self.fail(run, e).await;
            }
        }

        if let Err(e) = self.store.write(&results) {
            self.rollback_offsets(&run.connection, &written).await;
            return self.fail(run, e.into()).await;
        }

        self.restore(&run.connection).await;
        drop(run);
        self.set_state(State::Done(results.clone()));
        info!("Calibration complete");
        Ok(results)
    }

    /// Abort the attempt and hand the motors back under torque
    pub async fn cancel(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Homing(run) | State::RangeCapture { run, .. } => {
                self.cancel_tx.send_replace(true);
                self.abandon::<()>(run).await.or_else(|e| match e {
                    Error::Cancelled => Ok(()),
                    other => Err(other),
                })
            }
            other => self.reject(other, "cancel"),
        }
    }

    /// Bypass calibration and leave the motors disabled
    pub fn skip(&mut self) -> Result<()> {
        if self.phase() != CalibrationPhase::Idle {
            return Err(Error::InvalidPhase {
                operation: "skip",
                phase: self.phase(),
            });
        }
        let _lease = self.bus.try_claim_session().ok_or(Error::SessionBusy)?;

        match self.store.write_disabled_marker() {
            Ok(()) => {
                self.set_state(State::Skipped);
                info!("Calibration skipped, motors disabled");
                Ok(())
            }
            Err(e) => {
                self.set_state(State::Error {
                    failed_ids: Vec::new(),
                });
                Err(e.into())
            }
        }
    }

    /// Put back a state taken for a command that is not valid in it
    fn reject<T>(&mut self, state: State, operation: &'static str) -> Result<T> {
        let phase = state.phase();
        self.state = state;
        Err(Error::InvalidPhase { operation, phase })
    }

    /// Cancellation path: discard the attempt and return to Idle
    async fn abandon<T>(&mut self, mut run: Run) -> Result<T> {
        if let Err(e) = run.sampler.stop().await {
            warn!("{}", e);
        }
        self.restore(&run.connection).await;
        drop(run);
        self.positions_tx.send_replace(Positions::new());
        self.cancel_tx.send_replace(false);
        self.set_state(State::Idle);
        info!("Calibration cancelled, samples discarded");
        Err(Error::Cancelled)
    }

    async fn fail<T>(&mut self, mut run: Run, error: Error) -> Result<T> {
        warn!("Calibration failed: {}", error);
        if let Err(e) = run.sampler.stop().await {
            warn!("{}", e);
        }
        self.restore(&run.connection).await;
        drop(run);
        self.set_state(State::Error {
            failed_ids: error.motor_ids(),
        });
        Err(error)
    }

    async fn rollback_offsets(&self, connection: &Connection, written: &[u8]) {
        for &id in written {
            let Some(&prior) = connection.prior_offsets.get(&id) else {
                continue;
            };
            if let Err(e) = self.bus.write_homing_offset(id, prior).await {
                warn!("Could not restore homing offset on motor {}: {}", id, e);
            }
        }
    }

    /// Best effort: one unreachable motor must not strand the others limp
    async fn restore(&self, connection: &Connection) {
        for (&id, &limit) in &connection.torque_limits {
            if let Err(e) = self
                .bus
                .write_register(id, Register::TorqueLimit, limit)
                .await
            {
                warn!("Could not restore torque limit on motor {}: {}", id, e);
            }
            if let Err(e) = self.bus.hold_in_place(id).await {
                warn!("Could not re-enable torque on motor {}: {}", id, e);
            }
        }
    }
}

/// The same value for every id, as sync write data
fn all(ids: &[u8], value: u16) -> Vec<(u8, u16)> {
    ids.iter().map(|&id| (id, value)).collect()
}

impl Drop for CalibrationSession {
    fn drop(&mut self) {
        if self.phase().is_active() {
            warn!(
                "Calibration session dropped while {:?}; motors may still be compliant",
                self.phase()
            );
        }
    }
}
