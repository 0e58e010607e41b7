//! One-shot SDO write against an arbitrary object dictionary entry.
//!
//! ```bash
//! monoaxis-sdo-write eth0 0x3413 0 0x0D000000 32
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
#[command(name = "monoaxis-sdo-write", about = "Write one object on the drive")]
struct Args {
    /// Network interface the drive is attached to (e.g. eth0)
    ifname: String,

    /// Object index, hex (0x...) or decimal
    #[arg(value_parser = parse_int)]
    index: u32,

    /// Object subindex, hex (0x...) or decimal
    #[arg(value_parser = parse_int)]
    subindex: u32,

    /// Value to write, hex (0x...) or decimal
    #[arg(value_parser = parse_int)]
    value: u32,

    /// Width of the object in bits: 8, 16 or 32
    #[arg(value_parser = clap::value_parser!(u32))]
    size_bits: u32,
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

    let bytes = args.value.to_le_bytes();
    let data: &[u8] = match args.size_bits {
        8 => &bytes[..1],
        16 => &bytes[..2],
        32 => &bytes[..4],
        other => {
            return Err(AxisError::Internal(format!(
                "size must be 8, 16 or 32 bits, got {other}"
            )))
        }
    };

    let mut bus = EthercatBus::connect(&args.ifname, BusOptions::diagnostic())?;

    info!(
        "Writing {:#x} to {index:#06x}:{subindex:#04x} ({} bits)...",
        args.value, args.size_bits
    );
    bus.sdo_write(DRIVE_POSITION, index, subindex, data)?;
    info!("SDO write completed");

    bus.request_state(AlState::Init)?;
    let _ = bus.wait_for_state(AlState::Init, Duration::from_secs(1));

    Ok(())
}
