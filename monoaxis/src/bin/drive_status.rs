//! Periodic read of a drive status object, with an optional fault reset
//! on the way in.
//!
//! ```bash
//! monoaxis-drive-status eth0            # poll 0x3C13:0xD5 every 500 ms
//! monoaxis-drive-status eth0 --clear    # write 0x80 to 0x6040 first
//! ```

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};

use monoaxis::bus::ethercat::{BusOptions, EthercatBus};
use monoaxis::bus::{AlState, Fieldbus, DRIVE_POSITION};
use monoaxis::cli::parse_int;
use monoaxis::AxisError;
use monoaxis_shared::cia402::{objects, CW_FAULT_RESET};

#[derive(Parser)]
#[command(
    name = "monoaxis-drive-status",
    about = "Poll a drive status object over SDO"
)]
struct Args {
    /// Network interface the drive is attached to (e.g. eth0)
    ifname: String,

    /// Object index, hex (0x...) or decimal
    #[arg(value_parser = parse_int, default_value = "0x3C13")]
    index: u32,

    /// Object subindex, hex (0x...) or decimal
    #[arg(value_parser = parse_int, default_value = "0xD5")]
    subindex: u32,

    /// Write a Fault Reset (0x80) to the control word before polling.
    /// Note the first read may still observe the pre-reset status.
    #[arg(long)]
    clear: bool,
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

    let stop = Arc::new(AtomicBool::new(false));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&stop));

    let mut bus = EthercatBus::connect(&args.ifname, BusOptions::diagnostic())?;

    if args.clear {
        info!("Writing Fault Reset to the control word");
        bus.sdo_write(
            DRIVE_POSITION,
            objects::CONTROL_WORD.0,
            objects::CONTROL_WORD.1,
            &CW_FAULT_RESET.to_le_bytes(),
        )?;
    }

    while !stop.load(Ordering::Relaxed) {
        // SDOs ride the same frames as process data; keep the cyclic
        // exchange alive or the mailbox (and the slave's watchdog) starves
        // during a long poll. The working counter is irrelevant here.
        if let Err(e) = bus.exchange() {
            warn!("Cyclic exchange failed: {e}");
        }

        let mut buf = [0u8; 4];
        match bus.sdo_read(DRIVE_POSITION, index, subindex, &mut buf) {
            Ok(size) => {
                let value = match size {
                    1 => buf[0] as u32,
                    2 => u16::from_le_bytes([buf[0], buf[1]]) as u32,
                    _ => u32::from_le_bytes(buf),
                };
                info!("{index:#06x}:{subindex:#04x} = {value:#06x}");
            }
            Err(e) => warn!("SDO read failed: {e}"),
        }

        thread::sleep(Duration::from_millis(500));
    }

    info!("Requesting INIT state for all slaves");
    bus.request_state(AlState::Init)?;
    let _ = bus.wait_for_state(AlState::Init, Duration::from_secs(1));

    Ok(())
}
