// Interactive calibration: Enter advances, Esc/q cancels
//
// Ctrl-C cancels while connecting (the terminal is in cooked mode then).
// A failed attempt is reported and the operator decides whether to retry;
// every retry gets a fresh session.

use std::collections::BTreeMap;
use std::io::Write;
use std::time::{Duration, Instant};

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use tracing::warn;

use fixture_commission::calibration::{CalibrationResult, CalibrationSession, CalibrationStore};
use fixture_commission::config::FixtureConfig;
use fixture_commission::motor::{BusTransport, MotorRegistry};
use fixture_commission::{telemetry, Error};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const REDRAW_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Key {
    Advance,
    Cancel,
}

pub fn new_session(bus: BusTransport, registry: MotorRegistry, config: &FixtureConfig) -> CalibrationSession {
    let store = CalibrationStore::new(&config.calibration_file, registry.clone());
    CalibrationSession::new(bus, registry, store, config.session())
}

pub async fn run(
    bus: BusTransport,
    registry: MotorRegistry,
    config: &FixtureConfig,
    publish: bool,
) -> Result<(), BoxError> {
    loop {
        let mut session = new_session(bus.clone(), registry.clone(), config);
        if publish {
            let observer = session.observe();
            tokio::spawn(async move {
                if let Err(e) = telemetry::publish(observer).await {
                    warn!("Telemetry stopped: {}", e);
                }
            });
        }

        match attempt(&mut session, &registry).await {
            Ok(Some(results)) => {
                print_results(&registry, &results);
                println!("Calibration stored in {}", config.calibration_file.display());
                return Ok(());
            }
            Ok(None) | Err(Error::Cancelled) => {
                println!("Calibration cancelled; nothing was stored");
                return Ok(());
            }
            Err(e) => {
                println!("Calibration failed: {}", e);
                if !e.is_retryable() && !matches!(e, Error::Store(_)) {
                    return Err(e.into());
                }
                println!("Fix the cause, then press Enter to retry or Esc to quit");
                if prompt(None).await? == Key::Cancel {
                    return Err(e.into());
                }
            }
        }
    }
}

/// One full pass; `Ok(None)` when the operator cancelled from the keyboard
async fn attempt(
    session: &mut CalibrationSession,
    registry: &MotorRegistry,
) -> Result<Option<Vec<CalibrationResult>>, Error> {
    let handle = session.cancel_handle();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.cancel();
        }
    });
    println!("Parking the fixture and releasing torque (Ctrl-C cancels)...");
    let started = session.start().await;
    ctrl_c.abort();
    started?;

    println!("Move every joint to its home pose, then press Enter (Esc cancels)");
    if !advance(session, registry).await? {
        return Ok(None);
    }
    session.record_homing().await?;

    println!("Move every joint through its full range, then press Enter (Esc cancels)");
    if !advance(session, registry).await? {
        return Ok(None);
    }
    session.capture_ranges().await?;
    session.finalize().await.map(Some)
}

/// Wait for the operator; cancels the session unless they chose to advance
async fn advance(session: &mut CalibrationSession, registry: &MotorRegistry) -> Result<bool, Error> {
    match prompt(Some((&*session, registry))).await {
        Ok(Key::Advance) => Ok(true),
        Ok(Key::Cancel) => {
            session.cancel().await?;
            Ok(false)
        }
        Err(e) => {
            session.cancel().await?;
            Err(io_failure(e))
        }
    }
}

fn io_failure(e: std::io::Error) -> Error {
    Error::Validation(format!("terminal error: {}", e))
}

/// Wait for Enter or Esc/q, redrawing live positions if a session is given
async fn prompt(live: Option<(&CalibrationSession, &MotorRegistry)>) -> std::io::Result<Key> {
    enable_raw_mode()?;
    let key = read_key(live).await;
    disable_raw_mode()?;
    println!();
    key
}

async fn read_key(live: Option<(&CalibrationSession, &MotorRegistry)>) -> std::io::Result<Key> {
    let mut last_draw: Option<Instant> = None;
    loop {
        if event::poll(Duration::from_millis(20))? {
            if let Event::Key(KeyEvent { code, kind, .. }) = event::read()? {
                if kind == KeyEventKind::Press {
                    match code {
                        KeyCode::Enter => return Ok(Key::Advance),
                        KeyCode::Esc | KeyCode::Char('q') => return Ok(Key::Cancel),
                        _ => {}
                    }
                }
            }
        }

        if let Some((session, registry)) = live {
            if last_draw.is_none_or(|at| at.elapsed() >= REDRAW_INTERVAL) {
                draw(session, registry)?;
                last_draw = Some(Instant::now());
            }
        }
        // Let the position poller run between key polls
        tokio::task::yield_now().await;
    }
}

fn draw(session: &CalibrationSession, registry: &MotorRegistry) -> std::io::Result<()> {
    let positions = session.live_positions().unwrap_or_default();
    let ranges = session.live_ranges().unwrap_or_default();

    let mut line = String::new();
    for motor in registry.motors() {
        let pos = positions
            .get(&motor.id)
            .map_or_else(|| "----".to_string(), |p| p.to_string());
        line.push_str(&format!("{}={}", motor.name, pos));
        if let Some(range) = ranges.get(&motor.id) {
            line.push_str(&format!("[{}..{}]", range.min, range.max));
        }
        line.push_str("  ");
    }

    let mut stdout = std::io::stdout();
    write!(stdout, "\r{}", line)?;
    stdout.flush()
}

fn print_results(registry: &MotorRegistry, results: &[CalibrationResult]) {
    let by_id: BTreeMap<u8, &CalibrationResult> = results.iter().map(|r| (r.motor_id, r)).collect();
    for motor in registry.motors() {
        let Some(row) = by_id.get(&motor.id) else {
            continue;
        };
        let note = if row.range_invalid { "  (joint did not move)" } else { "" };
        println!(
            "{:>3}  {:<12} center {:>4}  range {:>4}..{:<4}{}",
            motor.id, motor.name, row.center, row.min, row.max, note
        );
    }
}
