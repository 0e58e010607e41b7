//! Continuous constant-velocity run in cyclic synchronous velocity mode.
//!
//! ```bash
//! monoaxis-velocity eth0 90
//! ```

use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use monoaxis::bus::ethercat::{BusOptions, EthercatBus};
use monoaxis::{AxisError, ControlMode, Controller, ControllerConfig, MotionCommand};
use monoaxis_shared::COUNTS_PER_DEGREE;

#[derive(Parser)]
#[command(
    name = "monoaxis-velocity",
    about = "Spin the drive at a constant velocity until interrupted"
)]
struct Args {
    /// Network interface the drive is attached to (e.g. eth0)
    ifname: String,

    /// Target speed in degrees per second; negative runs in reverse
    speed_dps: f64,
}

fn main() -> ExitCode {
    monoaxis::logging::init();
    let args = Args::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), AxisError> {
    let mode = ControlMode::Velocity;
    let config = ControllerConfig::new(mode);
    let bus = EthercatBus::connect(
        &args.ifname,
        BusOptions::cyclic(mode.operation_mode(), config.cycle),
    )?;

    let command = MotionCommand::RunAt {
        velocity: args.speed_dps * COUNTS_PER_DEGREE,
    };

    Controller::new(bus, config).run(command)?;
    Ok(())
}
