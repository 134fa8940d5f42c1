// End-to-end commissioning against the simulated fixture

use std::time::Duration;

use fixture_commission::calibration::{
    set_center, CalibrationPhase, CalibrationSession, CalibrationStore, CenterTarget,
};
use fixture_commission::config::SessionConfig;
use fixture_commission::motor::sim::SimulatedBus;
use fixture_commission::motor::{BusTransport, MotorRegistry, Register};
use fixture_commission::voltage::VoltageLimitService;
use fixture_commission::Error;

fn quick() -> SessionConfig {
    SessionConfig {
        poll_interval: Duration::from_millis(5),
        park_duration: Duration::ZERO,
        settle_delay: Duration::ZERO,
        min_motion_ticks: 20,
        ..SessionConfig::default()
    }
}

struct Fixture {
    sim: SimulatedBus,
    bus: BusTransport,
    dir: tempfile::TempDir,
}

impl Fixture {
    fn new() -> Self {
        let sim = SimulatedBus::fixture(5);
        let bus = BusTransport::new(sim.clone(), Duration::from_millis(100));
        Self {
            sim,
            bus,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn store(&self) -> CalibrationStore {
        CalibrationStore::new(self.dir.path().join("calibration.json"), MotorRegistry::reference_arm())
    }

    fn session(&self) -> CalibrationSession {
        CalibrationSession::new(
            self.bus.clone(),
            MotorRegistry::reference_arm(),
            self.store(),
            quick(),
        )
    }

    /// Block until the sampler has consumed every scripted reading
    async fn drain_script(&self, id: u8) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.sim.pending_script(id) > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("sampler never consumed the scripted positions");
    }
}

#[tokio::test]
async fn calibration_happy_path() {
    let fixture = Fixture::new();
    let mut session = fixture.session();

    session.start().await.unwrap();
    assert_eq!(session.phase(), CalibrationPhase::Homing);

    fixture.sim.move_joint(1, 2000);
    let home = session.record_homing().await.unwrap();
    assert_eq!(home[&1], 2000);
    assert_eq!(home[&3], 2048);
    assert_eq!(session.phase(), CalibrationPhase::RangeCapture);

    fixture
        .sim
        .script_positions(3, [1800, 2000, 2300, 2100, 2048].map(Some));
    fixture.drain_script(3).await;
    assert_eq!(session.live_ranges().unwrap()[&3].span(), 500);

    let rows = session.capture_ranges().await.unwrap();
    assert_eq!(session.phase(), CalibrationPhase::Finalizing);
    assert_eq!(rows.len(), 5);

    let elbow = rows.iter().find(|r| r.motor_id == 3).unwrap();
    assert_eq!((elbow.center, elbow.min, elbow.max), (2048, 1800, 2300));
    assert!(!elbow.range_invalid);
    for row in rows.iter().filter(|r| r.motor_id != 3) {
        assert!(row.range_invalid, "motor {} never moved", row.motor_id);
        assert_eq!((row.min, row.max), (2048, 2048));
    }

    let stored = session.finalize().await.unwrap();
    assert_eq!(session.phase(), CalibrationPhase::Done);
    assert_eq!(fixture.store().read().unwrap(), stored);

    // Homing pose now reads as center, and the joints hold again
    assert_eq!(fixture.bus.read_position(1).await.unwrap(), 2048);
    assert_eq!(fixture.bus.read_homing_offset(1).await.unwrap(), -48);
    for id in 1..=5 {
        assert_eq!(fixture.sim.register(id, Register::TorqueEnable), Some(1));
        assert_eq!(fixture.sim.register(id, Register::TorqueLimit), Some(1000));
    }
}

#[tokio::test]
async fn dropped_samples_are_skipped() {
    let fixture = Fixture::new();
    let mut session = fixture.session();
    session.start().await.unwrap();
    session.record_homing().await.unwrap();

    fixture
        .sim
        .script_positions(2, [Some(1900), None, Some(2200), None, Some(2048)]);
    fixture.drain_script(2).await;

    let rows = session.capture_ranges().await.unwrap();
    let shoulder = rows.iter().find(|r| r.motor_id == 2).unwrap();
    assert_eq!((shoulder.min, shoulder.max), (1900, 2200));
    assert!(!shoulder.range_invalid);
    session.finalize().await.unwrap();
}

#[tokio::test]
async fn range_capture_across_encoder_wrap() {
    let fixture = Fixture::new();
    let mut session = fixture.session();
    session.start().await.unwrap();

    // Home just above raw 0; the sweep passes back through 4095
    fixture.sim.move_joint(3, 100);
    session.record_homing().await.unwrap();
    fixture
        .sim
        .script_positions(3, [4000, 300, 100].map(Some));
    fixture.drain_script(3).await;

    let rows = session.capture_ranges().await.unwrap();
    let elbow = rows.iter().find(|r| r.motor_id == 3).unwrap();
    assert_eq!((elbow.center, elbow.min, elbow.max), (2048, 1852, 2248));
    assert!(!elbow.range_invalid);

    session.finalize().await.unwrap();
    assert_eq!(fixture.bus.read_position(3).await.unwrap(), 2048);
}

#[tokio::test]
async fn home_at_encoder_zero_reads_back_as_stored_center() {
    let fixture = Fixture::new();
    let mut session = fixture.session();
    session.start().await.unwrap();

    fixture.sim.move_joint(2, 0);
    session.record_homing().await.unwrap();
    session.capture_ranges().await.unwrap();
    let rows = session.finalize().await.unwrap();

    let shoulder = rows.iter().find(|r| r.motor_id == 2).unwrap();
    assert_eq!(fixture.bus.read_homing_offset(2).await.unwrap(), -2047);
    assert_eq!(fixture.bus.read_position(2).await.unwrap(), shoulder.center);
    assert_eq!((shoulder.min, shoulder.max), (shoulder.center, shoulder.center));
    assert_eq!(fixture.store().read().unwrap(), rows);
}

#[tokio::test]
async fn timed_out_offset_write_is_rolled_back() {
    let fixture = Fixture::new();
    let bus = BusTransport::new(fixture.sim.clone(), Duration::from_millis(30));
    let mut session =
        CalibrationSession::new(bus, MotorRegistry::reference_arm(), fixture.store(), quick());

    session.start().await.unwrap();
    fixture.sim.move_joint(1, 2000);
    session.record_homing().await.unwrap();
    session.capture_ranges().await.unwrap();

    // Every exchange now outlasts the timeout but still completes on the bus
    fixture.sim.set_response_delay(Duration::from_millis(40));
    let err = session.finalize().await.unwrap_err();
    assert_eq!(err.motor_ids(), vec![1]);
    assert_eq!(session.phase(), CalibrationPhase::Error);
    assert!(fixture.store().load().unwrap().is_none());

    // The late offset write lands first, then its rollback
    fixture.sim.set_response_delay(Duration::ZERO);
    tokio::time::timeout(Duration::from_secs(5), async {
        while fixture.sim.register(1, Register::HomingOffset) != Some(0) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("homing offset on motor 1 was never restored");
}

#[tokio::test]
async fn cancel_from_each_phase_persists_nothing() {
    let fixture = Fixture::new();

    let mut session = fixture.session();
    session.start().await.unwrap();
    session.cancel().await.unwrap();
    assert_eq!(session.phase(), CalibrationPhase::Idle);

    session.start().await.unwrap();
    fixture.sim.move_joint(4, 2500);
    session.record_homing().await.unwrap();
    fixture.sim.script_positions(4, [2600, 2400].map(Some));
    fixture.drain_script(4).await;
    session.cancel().await.unwrap();

    assert_eq!(session.phase(), CalibrationPhase::Idle);
    assert!(session.live_ranges().is_none());
    assert!(fixture.store().load().unwrap().is_none());
    assert_eq!(fixture.sim.writes_to(Register::HomingOffset), 0);
    for id in 1..=5 {
        assert_eq!(fixture.sim.register(id, Register::TorqueEnable), Some(1));
    }
}

#[tokio::test]
async fn cancel_handle_is_honoured_at_next_command() {
    let fixture = Fixture::new();
    let mut session = fixture.session();
    session.start().await.unwrap();

    session.cancel_handle().cancel();
    assert!(matches!(session.record_homing().await, Err(Error::Cancelled)));
    assert_eq!(session.phase(), CalibrationPhase::Idle);
    assert!(fixture.store().load().unwrap().is_none());
}

#[tokio::test]
async fn store_failure_rolls_back_offsets() {
    let fixture = Fixture::new();
    let store = CalibrationStore::new(
        fixture.dir.path().join("missing-dir").join("calibration.json"),
        MotorRegistry::reference_arm(),
    );
    let mut session =
        CalibrationSession::new(fixture.bus.clone(), MotorRegistry::reference_arm(), store, quick());

    session.start().await.unwrap();
    fixture.sim.move_joint(1, 2000);
    session.record_homing().await.unwrap();
    session.capture_ranges().await.unwrap();

    assert!(matches!(session.finalize().await, Err(Error::Store(_))));
    assert_eq!(session.phase(), CalibrationPhase::Error);
    assert_eq!(fixture.bus.read_homing_offset(1).await.unwrap(), 0);
    assert_eq!(fixture.bus.read_position(1).await.unwrap(), 2000);
}

#[tokio::test]
async fn motor_lost_during_homing_fails_the_session() {
    let fixture = Fixture::new();
    let mut session = fixture.session();
    session.start().await.unwrap();

    fixture.sim.set_offline(5, true);
    let err = session.record_homing().await.unwrap_err();
    assert_eq!(err.motor_ids(), vec![5]);
    assert_eq!(session.phase(), CalibrationPhase::Error);
    assert_eq!(session.failed_ids(), Some(&[5u8][..]));

    // The lease is released with the failed attempt
    fixture.sim.set_offline(5, false);
    let mut retry = fixture.session();
    retry.start().await.unwrap();
    retry.cancel().await.unwrap();
}

#[tokio::test]
async fn voltage_then_calibration_then_recentre() {
    let fixture = Fixture::new();
    let voltage = VoltageLimitService::new(
        fixture.bus.clone(),
        MotorRegistry::reference_arm(),
        12.0,
        (4.5, 14.0),
    );

    let fixed = voltage.fix(12.0, false).await.unwrap();
    assert_eq!(fixed.len(), 5);
    assert!(voltage.read_all().await.unwrap().values().all(|v| v.matches_target));

    let mut session = fixture.session();
    session.start().await.unwrap();
    session.record_homing().await.unwrap();
    fixture.sim.script_positions(5, [1500, 2600].map(Some));
    fixture.drain_script(5).await;
    session.capture_ranges().await.unwrap();
    session.finalize().await.unwrap();

    // Shift the wrist by hand and re-centre it alone
    fixture.bus.set_torque(5, false).await.unwrap();
    fixture.sim.move_joint(5, 2148);
    let rows = set_center(
        &fixture.bus,
        &MotorRegistry::reference_arm(),
        &fixture.store(),
        CenterTarget::Motor(5),
    )
    .await
    .unwrap();

    let wrist = rows.iter().find(|r| r.motor_id == 5).unwrap();
    assert_eq!((wrist.min, wrist.max), (1400, 2500));
    assert_eq!(fixture.bus.read_position(5).await.unwrap(), 2048);
}
