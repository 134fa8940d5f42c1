// One-shot re-centring without a range capture

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use tracing::{info, warn};

use super::{homing_offset_for, recentre, to_frame, to_raw, CalibrationResult, CalibrationStore};
use crate::error::{Error, Result};
use crate::motor::{BusTransport, MotorRegistry, CENTER_POSITION};

/// Which motors `set_center` re-centres
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CenterTarget {
    All,
    Motor(u8),
}

impl FromStr for CenterTarget {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("all") {
            return Ok(CenterTarget::All);
        }
        s.parse()
            .map(CenterTarget::Motor)
            .map_err(|_| format!("expected a motor id or \"all\", got {:?}", s))
    }
}

impl fmt::Display for CenterTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CenterTarget::All => write!(f, "all"),
            CenterTarget::Motor(id) => write!(f, "{}", id),
        }
    }
}

/// Shift a stored position from the `old` offset frame into the `new` one
fn shift(position: u16, old: i16, new: i16) -> u16 {
    recentre(to_raw(position, old), new)
}

/// Homing offset change for one motor
#[derive(Debug, Clone, Copy)]
struct Shift {
    prior: i16,
    offset: i16,
    /// What the current pose reads once `offset` is written
    center: u16,
}

/// Make the current pose of the selected motors read as center.
///
/// Writes each motor's new homing offset, then rewrites the calibration
/// file: existing rows keep their range moved into the new frame, motors
/// without a row get a centred row flagged `range_invalid`. Takes the
/// session lease, so it cannot run alongside a calibration session.
pub async fn set_center(
    bus: &BusTransport,
    registry: &MotorRegistry,
    store: &CalibrationStore,
    target: CenterTarget,
) -> Result<Vec<CalibrationResult>> {
    let ids = match target {
        CenterTarget::All => registry.ids(),
        CenterTarget::Motor(id) => vec![registry.slot(id)?.id],
    };
    let _lease = bus.try_claim_session().ok_or(Error::SessionBusy)?;

    let mut existing: BTreeMap<u8, CalibrationResult> = store
        .read()?
        .into_iter()
        .map(|row| (row.motor_id, row))
        .collect();

    // Read everything before writing anything
    let mut shifts = BTreeMap::new();
    for &id in &ids {
        let prior = bus.read_homing_offset(id).await?;
        let raw = to_raw(bus.read_position(id).await?, prior);
        let offset = homing_offset_for(raw);
        shifts.insert(
            id,
            Shift {
                prior,
                offset,
                center: to_frame(raw, offset),
            },
        );
    }

    // A timed-out write may still land, so it is rolled back too
    let mut written = Vec::new();
    for (&id, s) in &shifts {
        written.push(id);
        if let Err(e) = bus.write_homing_offset(id, s.offset).await {
            rollback(bus, &shifts, &written).await;
            return Err(e);
        }
        info!("Motor {} re-centred (homing offset {} -> {})", id, s.prior, s.offset);

        if let Some(row) = existing.get_mut(&id) {
            row.min = shift(row.min, s.prior, s.offset);
            row.max = shift(row.max, s.prior, s.offset);
            row.center = s.center;
        }
    }

    let results: Vec<CalibrationResult> = registry
        .ids()
        .into_iter()
        .map(|id| {
            let center = shifts.get(&id).map_or(CENTER_POSITION, |s| s.center);
            existing.remove(&id).unwrap_or(CalibrationResult {
                motor_id: id,
                center,
                min: center,
                max: center,
                range_invalid: true,
            })
        })
        .collect();

    if let Err(e) = store.write(&results) {
        rollback(bus, &shifts, &written).await;
        return Err(e.into());
    }
    Ok(results)
}

async fn rollback(bus: &BusTransport, shifts: &BTreeMap<u8, Shift>, written: &[u8]) {
    for &id in written {
        if let Some(s) = shifts.get(&id) {
            if let Err(e) = bus.write_homing_offset(id, s.prior).await {
                warn!("Could not restore homing offset on motor {}: {}", id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::sim::SimulatedBus;
    use std::time::Duration;

    fn setup() -> (SimulatedBus, BusTransport, tempfile::TempDir, CalibrationStore) {
        let sim = SimulatedBus::fixture(5);
        let bus = BusTransport::new(sim.clone(), Duration::from_millis(100));
        let dir = tempfile::tempdir().unwrap();
        let store = CalibrationStore::new(dir.path().join("cal.json"), MotorRegistry::reference_arm());
        (sim, bus, dir, store)
    }

    #[test]
    fn test_target_parsing() {
        assert_eq!("all".parse::<CenterTarget>(), Ok(CenterTarget::All));
        assert_eq!("3".parse::<CenterTarget>(), Ok(CenterTarget::Motor(3)));
        assert!("elbow".parse::<CenterTarget>().is_err());
    }

    #[tokio::test]
    async fn test_single_motor_without_stored_rows() {
        let (sim, bus, _dir, store) = setup();
        let registry = MotorRegistry::reference_arm();
        sim.move_joint(2, 2148);

        let rows = set_center(&bus, &registry, &store, CenterTarget::Motor(2))
            .await
            .unwrap();

        assert_eq!(bus.read_position(2).await.unwrap(), CENTER_POSITION);
        assert_eq!(bus.read_homing_offset(2).await.unwrap(), 100);
        assert_eq!(rows.len(), 5);
        assert!(rows.iter().all(|r| r.range_invalid && r.min == 2048 && r.max == 2048));
        assert_eq!(store.read().unwrap(), rows);
    }

    #[tokio::test]
    async fn test_existing_range_moves_into_new_frame() {
        let (sim, bus, _dir, store) = setup();
        let registry = MotorRegistry::reference_arm();
        let stored: Vec<CalibrationResult> = (1..=5)
            .map(|id| CalibrationResult {
                motor_id: id,
                center: CENTER_POSITION,
                min: 1500,
                max: 2600,
                range_invalid: false,
            })
            .collect();
        store.write(&stored).unwrap();

        sim.move_joint(4, 1948);
        let rows = set_center(&bus, &registry, &store, CenterTarget::Motor(4))
            .await
            .unwrap();

        let moved = rows.iter().find(|r| r.motor_id == 4).unwrap();
        assert_eq!((moved.min, moved.max), (1600, 2700));
        assert!(!moved.range_invalid);
        let untouched = rows.iter().find(|r| r.motor_id == 1).unwrap();
        assert_eq!((untouched.min, untouched.max), (1500, 2600));
    }

    #[tokio::test]
    async fn test_all_motors() {
        let (sim, bus, _dir, store) = setup();
        let registry = MotorRegistry::reference_arm();
        for id in 1..=5u8 {
            sim.move_joint(id, 1000 + id as u16 * 300);
        }

        set_center(&bus, &registry, &store, CenterTarget::All)
            .await
            .unwrap();
        for id in 1..=5u8 {
            assert_eq!(bus.read_position(id).await.unwrap(), CENTER_POSITION);
        }
    }

    #[tokio::test]
    async fn test_store_failure_restores_offsets() {
        let (sim, bus, dir, _) = setup();
        let registry = MotorRegistry::reference_arm();
        let store = CalibrationStore::new(dir.path().join("missing").join("cal.json"), registry.clone());
        sim.move_joint(2, 2148);

        let err = set_center(&bus, &registry, &store, CenterTarget::Motor(2))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Store(_)));
        assert_eq!(bus.read_homing_offset(2).await.unwrap(), 0);
        assert_eq!(bus.read_position(2).await.unwrap(), 2148);
    }

    #[tokio::test]
    async fn test_pose_at_encoder_zero_stores_reachable_center() {
        let (sim, bus, _dir, store) = setup();
        let registry = MotorRegistry::reference_arm();
        sim.move_joint(1, 0);

        let rows = set_center(&bus, &registry, &store, CenterTarget::Motor(1))
            .await
            .unwrap();
        let base = rows.iter().find(|r| r.motor_id == 1).unwrap();
        assert_eq!(base.center, 2047);
        assert_eq!(bus.read_position(1).await.unwrap(), base.center);
    }

    #[tokio::test]
    async fn test_unknown_motor_and_busy_bus() {
        let (_sim, bus, _dir, store) = setup();
        let registry = MotorRegistry::reference_arm();

        assert!(matches!(
            set_center(&bus, &registry, &store, CenterTarget::Motor(9)).await,
            Err(Error::Validation(_))
        ));

        let _lease = bus.try_claim_session().unwrap();
        assert!(matches!(
            set_center(&bus, &registry, &store, CenterTarget::All).await,
            Err(Error::SessionBusy)
        ));
        assert!(store.load().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unreachable_motor_changes_nothing() {
        let (sim, bus, _dir, store) = setup();
        let registry = MotorRegistry::reference_arm();
        sim.set_offline(5, true);

        let err = set_center(&bus, &registry, &store, CenterTarget::All)
            .await
            .unwrap_err();
        assert_eq!(err.motor_ids(), vec![5]);
        assert_eq!(sim.writes_to(crate::motor::Register::HomingOffset), 0);
        assert!(store.load().unwrap().is_none());
    }
}
