mod wizard;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use fixture_commission::calibration::{set_center, CalibrationStore, CenterTarget};
use fixture_commission::config::FixtureConfig;
use fixture_commission::identify::IdentificationService;
use fixture_commission::motor::sim::SimulatedBus;
use fixture_commission::motor::{BusTransport, FeetechBus};
use fixture_commission::voltage::VoltageLimitService;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Commission a daisy-chained servo fixture: ids, voltage limits, calibration
#[derive(Parser)]
#[command(version)]
struct Cli {
    /// Serial device of the bus adapter
    #[arg(long, global = true)]
    port: Option<String>,

    #[arg(long, global = true)]
    baud: Option<u32>,

    /// JSON fixture configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Calibration file to read and write
    #[arg(long, global = true)]
    calibration: Option<PathBuf>,

    /// Run against an in-memory fixture instead of hardware
    #[arg(long, global = true)]
    simulate: bool,

    /// Publish calibration phase and positions over Zenoh
    #[arg(long, global = true)]
    publish: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Report which expected motor ids answer
    CheckIds,
    /// Give the single connected motor an id from the registry
    AssignId {
        id: u8,
        /// Assign even if the id already answers
        #[arg(long)]
        force: bool,
    },
    /// Make the current pose of a motor (or all) read as center
    SetCenter { target: CenterTarget },
    /// Inspect or fix the motors' maximum input voltage
    Voltage {
        #[command(subcommand)]
        action: VoltageAction,
    },
    /// Interactive homing and range calibration
    Calibrate,
    /// Skip calibration and mark the motors disabled
    Skip,
    /// Print the stored calibration
    Show,
}

#[derive(Subcommand)]
enum VoltageAction {
    Read,
    Fix {
        /// Target in volts; defaults to the configured supply voltage
        volts: Option<f32>,
        /// Fix reachable motors even if some are missing
        #[arg(long)]
        force: bool,
    },
}

fn load_config(cli: &Cli) -> Result<FixtureConfig, BoxError> {
    let mut config = match &cli.config {
        Some(path) => FixtureConfig::load(path)?,
        None => FixtureConfig::default(),
    };
    if let Some(port) = &cli.port {
        config.port = port.clone();
    }
    if let Some(baud) = cli.baud {
        config.baudrate = baud;
    }
    if let Some(path) = &cli.calibration {
        config.calibration_file = path.clone();
    }
    config.validate()?;
    Ok(config)
}

fn open_bus(simulate: bool, config: &FixtureConfig) -> Result<BusTransport, BoxError> {
    if simulate {
        info!("Using simulated fixture");
        let count = u8::try_from(config.motors.len())?;
        return Ok(BusTransport::new(SimulatedBus::fixture(count), config.bus_timeout()));
    }
    let bus = FeetechBus::open_with_timeout(&config.port, config.baudrate, config.bus_timeout())?;
    info!("Opened {} at {} baud", config.port, config.baudrate);
    Ok(BusTransport::new(bus, config.bus_timeout()))
}

async fn run(cli: Cli) -> Result<(), BoxError> {
    let config = load_config(&cli)?;
    let registry = config.motors.clone();
    let store = CalibrationStore::new(&config.calibration_file, registry.clone());

    let simulate = cli.simulate;
    let connect = || open_bus(simulate, &config);

    match cli.command {
        Command::Show => show(&store)?,
        Command::CheckIds => {
            let bus = connect()?;
            let scan = IdentificationService::new(bus, registry).check_ids().await?;
            println!("found:   {:?}", scan.found_ids);
            if scan.is_complete() {
                println!("every expected motor answers");
            } else {
                println!("missing: {:?}", scan.missing_ids);
            }
        }
        Command::AssignId { id, force } => {
            let bus = connect()?;
            let motor = IdentificationService::new(bus, registry)
                .with_preset(config.preset)
                .assign_id(id, force)
                .await?;
            println!("Motor {} is now {}", motor.id, motor.name);
        }
        Command::SetCenter { target } => {
            let bus = connect()?;
            let rows = set_center(&bus, &registry, &store, target).await?;
            println!("Re-centred {}; {} rows stored", target, rows.len());
        }
        Command::Voltage { action } => {
            let service =
                VoltageLimitService::new(connect()?, registry, config.target_voltage, config.voltage_band);
            match action {
                VoltageAction::Read => {
                    for info in service.read_all().await?.values() {
                        let flag = if info.matches_target { "ok" } else { "MISMATCH" };
                        println!("{:>3}  {:>5.1} V  {}", info.motor_id, info.configured_volts, flag);
                    }
                }
                VoltageAction::Fix { volts, force } => {
                    let target = volts.unwrap_or(config.target_voltage);
                    let modified = service.fix(target, force).await?;
                    println!("Set {} V on {:?}", target, modified);
                }
            }
        }
        Command::Calibrate => {
            wizard::run(connect()?, registry, &config, cli.publish).await?;
        }
        Command::Skip => {
            let mut session = wizard::new_session(connect()?, registry, &config);
            session.skip()?;
            println!("Calibration skipped; motors disabled");
        }
    }
    Ok(())
}

fn show(store: &CalibrationStore) -> Result<(), BoxError> {
    let Some(file) = store.load()? else {
        println!("No calibration stored in {}", store.path().display());
        return Ok(());
    };
    if !file.motors_enabled {
        println!("Calibration skipped; motors disabled");
        return Ok(());
    }
    println!("{:>3}  {:<12} {:>6} {:>6} {:>6}", "id", "name", "center", "min", "max");
    for row in &file.motors {
        let note = if row.range_invalid { "  (no range)" } else { "" };
        println!(
            "{:>3}  {:<12} {:>6} {:>6} {:>6}{}",
            row.id, row.name, row.center, row.min, row.max, note
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    if let Err(e) = run(Cli::parse()).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
