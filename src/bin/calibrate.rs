// Operator-attended calibration workflow.
//
// Records each motor's zero reference and range of motion, programs the
// hardware, and persists the records for later sessions. Run this offline,
// with the robot attended; the serving process only ever loads the result.
//
// Usage: lekiwi-calibrate [--port /dev/ttyACM0] [--output config/calibration.json]

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use lekiwi_robot::config::{DEFAULT_CALIBRATION_PATH, DEFAULT_PORT};
use lekiwi_robot::motor::{
    CalibrationProcedure, FeetechBus, JsonCalibrationStore, MotorBus, StdinConsole,
};
use lekiwi_robot::robot::default_motors;

#[derive(Parser)]
#[command(name = "lekiwi-calibrate", about = "Record and persist LeKiwi motor calibration")]
struct Args {
    /// Serial port of the motor bus
    #[arg(long, default_value = DEFAULT_PORT)]
    port: String,

    /// Where to write the calibration records
    #[arg(long, default_value = DEFAULT_CALIBRATION_PATH)]
    output: PathBuf,

    /// Normalize arm joints in degrees instead of percentages
    #[arg(long)]
    use_degrees: bool,
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let motors = default_motors(args.use_degrees);
    let arm_motors: Vec<String> = motors
        .iter()
        .filter(|motor| motor.name.starts_with("arm"))
        .map(|motor| motor.name.clone())
        .collect();
    let base_motors: Vec<String> = motors
        .iter()
        .filter(|motor| motor.name.starts_with("base"))
        .map(|motor| motor.name.clone())
        .collect();

    let mut bus = FeetechBus::new(&args.port, motors);
    bus.connect()?;

    let store = JsonCalibrationStore::new(&args.output);
    let mut console = StdinConsole::new();
    let records = CalibrationProcedure::new(&mut bus, &arm_motors, &base_motors)
        .run(&mut console, &store)?;

    let mut summary: Vec<_> = records.iter().collect();
    summary.sort_by_key(|(_, cal)| cal.id);
    println!("Calibrated {} motors:", summary.len());
    for (name, cal) in summary {
        println!(
            "  {:>2} {name}: homing={:>5}  range=[{:>4}, {:>4}]",
            cal.id, cal.homing_offset, cal.range_min, cal.range_max
        );
    }

    bus.disconnect(true)?;
    Ok(())
}

fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("Calibration failed: {e}");
        std::process::exit(1);
    }
}
