//! One-shot SDO read against an arbitrary object dictionary entry.
//!
//! ```bash
//! monoaxis-sdo-read eth0 0x6041 0
//! ```

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use monoaxis::bus::ethercat::{BusOptions, EthercatBus};
use monoaxis::bus::{AlState, Fieldbus, DRIVE_POSITION};
use monoaxis::cli::parse_int;
use monoaxis::AxisError;

#[derive(Parser)]
#[command(name = "monoaxis-sdo-read", about = "Read one object from the drive")]
struct Args {
    /// Network interface the drive is attached to (e.g. eth0)
    ifname: String,

    /// Object index, hex (0x...) or decimal
    #[arg(value_parser = parse_int)]
    index: u32,

    /// Object subindex, hex (0x...) or decimal
    #[arg(value_parser = parse_int)]
    subindex: u32,
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
    let index = args.index as u16;
    let subindex = args.subindex as u8;

    let mut bus = EthercatBus::connect(&args.ifname, BusOptions::diagnostic())?;

    let mut buf = [0u8; 4];
    let size = bus.sdo_read(DRIVE_POSITION, index, subindex, &mut buf)?;
    let value = match size {
        1 => buf[0] as u32,
        2 => u16::from_le_bytes([buf[0], buf[1]]) as u32,
        _ => u32::from_le_bytes(buf),
    };

    info!("{index:#06x}:{subindex:#04x} = {value:#x} ({value}, {size} bytes)");

    bus.request_state(AlState::Init)?;
    let _ = bus.wait_for_state(AlState::Init, Duration::from_secs(1));

    Ok(())
}
