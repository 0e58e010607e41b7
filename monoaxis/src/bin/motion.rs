//! Trapezoidal point-to-point move on a CiA 402 servo axis.
//!
//! ```bash
//! monoaxis-motion eth0 360 180
//! ```

use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use tracing::error;

use monoaxis::bus::ethercat::{BusOptions, EthercatBus};
use monoaxis::{AxisError, ControlMode, Controller, ControllerConfig, MotionCommand};
use monoaxis_shared::COUNTS_PER_DEGREE;

#[derive(Parser)]
#[command(name = "monoaxis-motion", about = "Run a trapezoidal move on the drive")]
struct Args {
    /// Network interface the drive is attached to (e.g. eth0)
    ifname: String,

    /// Target angle in degrees, relative to the current position
    angle_deg: f64,

    /// Maximum speed in degrees per second
    speed_dps: f64,

    /// Acceleration in degrees per second squared
    #[arg(long, default_value_t = 360.0)]
    accel: f64,

    /// Cyclic synchronous mode to run the drive in
    #[arg(long, value_enum, default_value_t = Mode::Csp)]
    mode: Mode,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    /// Cyclic synchronous position
    Csp,
    /// Cyclic synchronous velocity
    Csv,
}

fn main() -> ExitCode {
    monoaxis::logging::init();
    let args = Args::parse();

    if args.speed_dps <= 0.0 || args.accel <= 0.0 {
        error!("speed and acceleration must be positive");
        return ExitCode::FAILURE;
    }

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), AxisError> {
    let mode = match args.mode {
        Mode::Csp => ControlMode::Position,
        Mode::Csv => ControlMode::Velocity,
    };

    let config = ControllerConfig::new(mode);
    let bus = EthercatBus::connect(
        &args.ifname,
        BusOptions::cyclic(mode.operation_mode(), config.cycle),
    )?;

    let command = MotionCommand::MoveTo {
        target_counts: (args.angle_deg * COUNTS_PER_DEGREE) as i64,
        max_velocity: args.speed_dps * COUNTS_PER_DEGREE,
        acceleration: args.accel * COUNTS_PER_DEGREE,
    };

    Controller::new(bus, config).run(command)?;
    Ok(())
}
