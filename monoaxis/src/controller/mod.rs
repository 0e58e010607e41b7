//! Two-thread controller: a realtime cyclic loop and the supervisor that
//! owns startup, operator reporting, and shutdown.

mod realtime;
pub mod shared;
pub mod timing;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use monoaxis_shared::cia402::objects;
use monoaxis_shared::COUNTS_PER_DEGREE;

use crate::bus::{AlState, Fieldbus};
use crate::drive::ControlMode;
use crate::error::AxisError;
use crate::trajectory::MotionPhase;
use realtime::RealtimeLoop;
use shared::{MotionCommand, SharedState};
use timing::CycleTimer;

/// Supervisor-side tuning. The defaults match the drive's documented
/// bring-up behaviour and should rarely change.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub mode: ControlMode,

    /// Cyclic exchange period.
    pub cycle: Duration,

    /// How long the drive may take from bus-cyclic to Operation Enabled.
    pub drive_timeout: Duration,

    /// Cadence of the supervisor's status reporting.
    pub status_period: Duration,
}

impl ControllerConfig {
    pub fn new(mode: ControlMode) -> Self {
        Self {
            mode,
            cycle: Duration::from_millis(2),
            drive_timeout: Duration::from_secs(5),
            status_period: Duration::from_millis(100),
        }
    }
}

/// Owns the bus session and the shared state, and threads them through
/// the realtime loop for the duration of a run.
pub struct Controller<B: Fieldbus> {
    bus: B,
    config: ControllerConfig,
    shared: Arc<SharedState>,
}

impl<B: Fieldbus + 'static> Controller<B> {
    pub fn new(bus: B, config: ControllerConfig) -> Self {
        Self {
            bus,
            config,
            shared: Arc::new(SharedState::default()),
        }
    }

    pub fn shared(&self) -> Arc<SharedState> {
        Arc::clone(&self.shared)
    }

    /// Run the controller until the move completes and the operator stops
    /// it (or a fatal error stops it first). Blocks the calling thread as
    /// the supervisor; returns the bus session, already back in INIT,
    /// after the realtime thread has been joined.
    pub fn run(self, command: MotionCommand) -> Result<B, AxisError> {
        let Controller {
            bus,
            config,
            shared,
        } = self;

        // SIGINT lands on a plain flag which the supervisor folds into
        // the shared stop flag on its next tick.
        let sigint = Arc::new(AtomicBool::new(false));
        let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&sigint));

        // The session is shared with the realtime thread: the loop takes
        // the lock once per cycle, the supervisor takes it only for its
        // fault-code SDO read below. Mailbox traffic rides alongside the
        // cyclic exchange, as on the wire.
        let bus = Arc::new(Mutex::new(bus));

        let timer = CycleTimer::new(config.cycle);
        let rt = RealtimeLoop::new(
            Arc::clone(&bus),
            config.mode,
            Arc::clone(&shared),
            config.cycle.as_secs_f64(),
        )?;

        let handle = thread::Builder::new()
            .name("rt-cycle".to_owned())
            .spawn(move || rt.run(timer))
            .map_err(|e| AxisError::Internal(format!("cannot spawn realtime thread: {e}")))?;

        let started = Instant::now();
        let mut command_posted = false;
        let mut seen_moving = false;
        let mut move_reported_done = false;
        let mut last_underruns = 0u32;
        let mut last_error = 0u16;

        while !shared.stop_requested() {
            if sigint.load(Ordering::Relaxed) {
                info!("SIGINT received, shutting down");
                shared.request_stop();
                break;
            }
            if handle.is_finished() {
                break;
            }

            if shared.drive_operational() {
                if !command_posted {
                    info!("Drive reached Operation Enabled, committing motion command");
                    shared.post_command(command);
                    command_posted = true;
                }

                report_running(&shared, &command);

                let phase = shared.motion_phase();
                if phase != MotionPhase::Idle {
                    seen_moving = true;
                } else if seen_moving && !move_reported_done {
                    info!("Move complete, holding position (Ctrl-C to exit)");
                    move_reported_done = true;
                }
            } else {
                // One SDO read when a fault is first observed, while the
                // cyclic loop keeps running. The drive is not following
                // setpoints in fault, so a briefly contended cycle is
                // harmless.
                if shared.fault_detected() && last_error == 0 {
                    last_error = read_last_error(&bus);
                }

                report_waiting(&shared, last_error);

                if command_posted && shared.fault_detected() {
                    warn!(
                        "Drive dropped out of Operation Enabled (status {:#06x})",
                        shared.status_word()
                    );
                }

                if !command_posted && started.elapsed() > config.drive_timeout {
                    error!("Drive did not become operational, giving up");
                    let status_word = shared.status_word();
                    let _ = join_realtime(handle, &shared);
                    if last_error == 0 && shared.fault_detected() {
                        last_error = read_last_error(&bus);
                    }
                    let mut bus = reclaim_bus(bus)?;
                    shutdown_bus(&mut bus);
                    return Err(AxisError::DriveTimeout {
                        status_word,
                        last_error,
                    });
                }
            }

            let underruns = shared.wkc_underruns();
            if underruns != last_underruns {
                warn!("Working counter underruns: {underruns}");
                last_underruns = underruns;
            }

            thread::sleep(config.status_period);
        }

        let rt_result = join_realtime(handle, &shared);

        if shared.fault_detected() && last_error == 0 {
            last_error = read_last_error(&bus);
        }
        if last_error != 0 {
            warn!("Drive last error code: {last_error:#06x}");
        }

        let mut bus = reclaim_bus(bus)?;
        shutdown_bus(&mut bus);

        match rt_result {
            Ok(()) => {
                info!("Shutdown complete");
                Ok(bus)
            }
            Err(e) => {
                error!("Realtime loop terminated: {e}");
                Err(e)
            }
        }
    }
}

fn join_realtime(
    handle: thread::JoinHandle<Result<(), AxisError>>,
    shared: &SharedState,
) -> Result<(), AxisError> {
    shared.request_stop();
    handle
        .join()
        .map_err(|_| AxisError::Internal("realtime thread panicked".to_owned()))?
}

/// Take the session back from the shared handle once the realtime thread
/// is gone.
fn reclaim_bus<B: Fieldbus>(bus: Arc<Mutex<B>>) -> Result<B, AxisError> {
    Arc::try_unwrap(bus)
        .map_err(|_| AxisError::Internal("bus session still shared after join".to_owned()))
        .map(|mutex| mutex.into_inner().unwrap_or_else(PoisonError::into_inner))
}

/// Fetch the drive's manufacturer-specific last error code over the
/// shared session. Returns 0 when the read fails; the caller retries on
/// the next fault observation.
fn read_last_error<B: Fieldbus>(bus: &Arc<Mutex<B>>) -> u16 {
    let mut bus = bus.lock().unwrap_or_else(PoisonError::into_inner);
    let mut buf = [0u8; 4];
    match bus.sdo_read(
        crate::bus::DRIVE_POSITION,
        objects::LAST_ERROR_CODE.0,
        objects::LAST_ERROR_CODE.1,
        &mut buf,
    ) {
        Ok(_) => u16::from_le_bytes([buf[0], buf[1]]),
        Err(e) => {
            warn!("Could not read last error code: {e}");
            0
        }
    }
}

/// Request INIT and drop the session, mirroring the original shutdown
/// order: the bus must be back in INIT before the socket closes.
fn shutdown_bus<B: Fieldbus>(bus: &mut B) {
    info!("Requesting INIT state for all slaves");
    if let Err(e) = bus.request_state(AlState::Init) {
        warn!("INIT request failed during shutdown: {e}");
    }
}

fn report_waiting(shared: &SharedState, last_error: u16) {
    info!(
        "Waiting for drive... bus: {} | status: {:#06x} | control: {:#06x} | last error: {:#06x}",
        if shared.bus_operational() {
            "OPERATIONAL"
        } else {
            "INITIALIZING"
        },
        shared.status_word(),
        shared.control_word(),
        last_error,
    );
}

fn report_running(shared: &SharedState, command: &MotionCommand) {
    match command {
        MotionCommand::MoveTo { .. } => {
            info!(
                "Target: {:9} | Actual: {:9} | Phase: {:12} | Status: {:#06x}",
                shared.target_position(),
                shared.actual_position(),
                shared.motion_phase().to_string(),
                shared.status_word(),
            );
        }
        MotionCommand::RunAt { velocity } => {
            let actual_dps = shared.actual_velocity() as f64 / COUNTS_PER_DEGREE;
            info!(
                "Target: {:7.2} dps | Actual: {:7.2} dps | Status: {:#06x} | Control: {:#06x}",
                velocity / COUNTS_PER_DEGREE,
                actual_dps,
                shared.status_word(),
                shared.control_word(),
            );
        }
    }
}
