//! The 2 ms cyclic loop: exchange process data, advance whichever state
//! machine is not done yet, stage the next output frame.
//!
//! Nothing on this path logs, allocates, or blocks beyond the bounded
//! cyclic receive; operator-facing reporting happens on the supervisor
//! thread from the shared atomics. The bus session sits behind a mutex
//! taken once per cycle; the supervisor contends for it only to issue
//! its one fault-code SDO read.

use std::sync::{Arc, Mutex, PoisonError};

use byte_struct::*;

use monoaxis_shared::{CyclicInputs, CyclicOutputs};

use super::shared::{MotionCommand, SharedState};
use super::timing::CycleTimer;
use crate::bus::{AlState, Fieldbus};
use crate::drive::{ControlMode, DriveController};
use crate::error::AxisError;
use crate::trajectory::{MotionPhase, TrapezoidalProfile};

pub(crate) struct RealtimeLoop<B: Fieldbus> {
    bus: Arc<Mutex<B>>,
    drive: DriveController,
    profile: TrapezoidalProfile,
    shared: Arc<SharedState>,

    outputs: CyclicOutputs,
    dt: f64,
    expected_wkc: u16,

    dc_seen: bool,
    op_requested: bool,

    /// CSV-only constant velocity command, in counts/s.
    constant_velocity: Option<f64>,
}

impl<B: Fieldbus> RealtimeLoop<B> {
    pub(crate) fn new(
        bus: Arc<Mutex<B>>,
        mode: ControlMode,
        shared: Arc<SharedState>,
        dt: f64,
    ) -> Result<Self, AxisError> {
        // The first frame on the wire is all zeroes apart from the mode of
        // operation.
        let outputs = CyclicOutputs {
            mode_of_operation: mode.operation_mode(),
            ..Default::default()
        };

        {
            let mut bus = bus.lock().unwrap_or_else(PoisonError::into_inner);
            if bus.outputs().len() < CyclicOutputs::BYTE_LEN
                || bus.inputs().len() < CyclicInputs::BYTE_LEN
            {
                return Err(AxisError::Fieldbus(format!(
                    "mapped process image too small: {} out / {} in bytes",
                    bus.outputs().len(),
                    bus.inputs().len()
                )));
            }
            outputs.write_bytes(&mut bus.outputs()[..CyclicOutputs::BYTE_LEN]);
        }

        let expected_wkc = bus
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .expected_wkc();

        Ok(Self {
            bus,
            drive: DriveController::new(mode),
            profile: TrapezoidalProfile::idle_at(0.0),
            shared,
            outputs,
            dt,
            expected_wkc,
            dc_seen: false,
            op_requested: false,
            constant_velocity: None,
        })
    }

    /// Drive the loop at the timer's cadence until the stop flag is set or
    /// a cycle fails. The session lock is released between cycles; the
    /// supervisor returns the bus to INIT after joining this thread.
    pub(crate) fn run(mut self, mut timer: CycleTimer) -> Result<(), AxisError> {
        elevate_scheduling();

        loop {
            if self.shared.stop_requested() {
                break Ok(());
            }
            timer.wait();
            if let Err(e) = self.step() {
                self.shared.request_stop();
                break Err(e);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn bus(&self) -> std::sync::MutexGuard<'_, B> {
        self.bus.lock().unwrap()
    }

    /// One cycle body, everything except the deadline sleep.
    pub(crate) fn step(&mut self) -> Result<(), AxisError> {
        let bus = Arc::clone(&self.bus);
        let mut bus = bus.lock().unwrap_or_else(PoisonError::into_inner);

        // Send the frame staged last cycle, receive the fresh inputs.
        self.outputs
            .write_bytes(&mut bus.outputs()[..CyclicOutputs::BYTE_LEN]);
        let wkc = bus.exchange()?;

        if self.shared.bus_operational() && wkc < self.expected_wkc {
            // Transient underruns happen; record and carry on.
            self.shared.count_wkc_underrun();
        }

        let inputs = CyclicInputs::read_bytes(&bus.inputs()[..CyclicInputs::BYTE_LEN]);

        self.shared.publish_cycle(
            inputs.status_word,
            self.outputs.control_word,
            inputs.position_actual,
            inputs.velocity_actual,
        );

        if !self.shared.bus_operational() {
            return self.advance_bus_bringup(&mut bus);
        }

        if let Some(seed) = self.drive.update(&inputs, &mut self.outputs) {
            self.profile = TrapezoidalProfile::idle_at(seed as f64);
            self.shared.set_target_position(seed as i64);
        }
        self.shared.set_fault_detected(self.drive.fault());
        self.shared.set_drive_operational(self.drive.operational());

        if self.drive.operational() {
            if let Some(command) = self.shared.take_command() {
                self.apply_command(command, &inputs);
            }
            self.advance_trajectory(&inputs);
        } else {
            self.shared.set_motion_phase(MotionPhase::Idle);
        }

        Ok(())
    }

    /// Continue bring-up while cyclic traffic keeps the sync manager
    /// watchdog fed: wait for the clocks, request OP once, then poll until
    /// the slave reports OP or flags an error.
    fn advance_bus_bringup(&mut self, bus: &mut B) -> Result<(), AxisError> {
        if !self.dc_seen {
            if !bus.dc_synced() {
                return Ok(());
            }
            self.dc_seen = true;
        }

        if !self.op_requested {
            bus.request_state(AlState::Op)?;
            self.op_requested = true;
            return Ok(());
        }

        match bus.read_state()? {
            AlState::Op => self.shared.set_bus_operational(true),
            AlState::Error => {
                let code = bus.drive()?.al_status_code;
                self.shared.set_al_status_code(code);
                return Err(AxisError::SlaveError {
                    al_status_code: code,
                });
            }
            _ => {}
        }

        Ok(())
    }

    fn apply_command(&mut self, command: MotionCommand, inputs: &CyclicInputs) {
        match command {
            MotionCommand::MoveTo {
                target_counts,
                max_velocity,
                acceleration,
            } => {
                // The model restarts from the measured position; the
                // target is relative to it.
                let start = inputs.position_actual as f64;
                let target = start + target_counts as f64;

                // Limits were validated by the supervisor before posting;
                // a bad profile leaves the axis parked instead of
                // dividing by zero mid-cycle.
                self.profile = TrapezoidalProfile::commit(start, target, max_velocity, acceleration)
                    .unwrap_or_else(|_| TrapezoidalProfile::idle_at(start));
                self.constant_velocity = None;
                self.shared.set_target_position(target as i64);
            }
            MotionCommand::RunAt { velocity } => {
                self.constant_velocity = Some(velocity);
            }
        }
    }

    fn advance_trajectory(&mut self, inputs: &CyclicInputs) {
        match self.drive.mode() {
            ControlMode::Position => {
                let phase = self.profile.advance(self.dt);
                self.outputs.target_position = if phase == MotionPhase::Idle {
                    // Parked: follow the measured position.
                    inputs.position_actual
                } else {
                    self.profile.position_counts()
                };
            }
            ControlMode::Velocity => {
                if let Some(velocity) = self.constant_velocity {
                    self.outputs.target_velocity = velocity as i32;
                } else {
                    let phase = self.profile.advance(self.dt);
                    self.outputs.target_velocity = if phase == MotionPhase::Idle {
                        0
                    } else {
                        self.profile.velocity_counts()
                    };
                }
            }
        }

        self.shared.set_motion_phase(self.profile.phase());
    }
}

/// Pin the cyclic thread to the first core and raise its priority.
/// Best-effort: not every platform or privilege level allows it.
fn elevate_scheduling() {
    let core_ids = core_affinity::get_core_ids().unwrap_or_default();
    if let Some(core) = core_ids.first() {
        let _ = core_affinity::set_for_current(*core);
    }

    if let Err(e) = thread_priority::set_current_thread_priority(thread_priority::ThreadPriority::Max)
    {
        tracing::warn!("could not raise cyclic thread priority: {e:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::sim::SimBus;
    use monoaxis_shared::cia402::DriveState;
    use monoaxis_shared::{COUNTS_PER_DEGREE, CYCLE_TIME_S};

    fn new_loop(bus: SimBus, mode: ControlMode) -> (RealtimeLoop<SimBus>, Arc<SharedState>) {
        let shared = Arc::new(SharedState::default());
        let bus = Arc::new(Mutex::new(bus));
        let rt = RealtimeLoop::new(bus, mode, Arc::clone(&shared), CYCLE_TIME_S).unwrap();
        (rt, shared)
    }

    fn step_until(rt: &mut RealtimeLoop<SimBus>, limit: usize, done: impl Fn(&SharedState) -> bool) {
        for _ in 0..limit {
            rt.step().unwrap();
            if done(&rt.shared) {
                return;
            }
        }
        panic!("condition not reached within {limit} cycles");
    }

    #[test]
    fn brings_bus_then_drive_to_operational() {
        let (mut rt, shared) = new_loop(SimBus::starting_at(500), ControlMode::Position);

        step_until(&mut rt, 50, |s| s.bus_operational());
        assert!(!shared.drive_operational());

        step_until(&mut rt, 50, |s| s.drive_operational());

        // Shutdown -> Switch On -> Enable Operation, in that order.
        let sequence = rt.bus().control_word_sequence();
        let tail: Vec<u16> = sequence.iter().copied().filter(|&w| w != 0).collect();
        assert_eq!(tail, vec![0x06, 0x07, 0x0F]);
    }

    #[test]
    fn holds_measured_position_while_not_operational() {
        let (mut rt, _shared) = new_loop(SimBus::starting_at(7_777), ControlMode::Position);

        step_until(&mut rt, 50, |s| s.bus_operational());
        let frames_before_op = rt.bus().outputs_log().len();
        step_until(&mut rt, 50, |s| s.drive_operational());

        // Every frame sent after the bus went cyclic but before Operation
        // Enabled holds the measured position.
        let bus = rt.bus();
        // The frame staged on the cycle the drive controller first ran is
        // sent one exchange later, so skip one.
        for frame in bus.outputs_log().iter().skip(frames_before_op + 1) {
            assert_eq!(frame.target_position, 7_777);
        }
    }

    #[test]
    fn fault_on_startup_is_reset_then_bringup_resumes() {
        let mut bus = SimBus::starting_at(0);
        bus.inject_fault();
        let (mut rt, shared) = new_loop(bus, ControlMode::Position);

        step_until(&mut rt, 50, |s| s.bus_operational());
        step_until(&mut rt, 10, |s| s.fault_detected());

        step_until(&mut rt, 50, |s| s.drive_operational());
        assert!(!shared.fault_detected());

        let sequence = rt.bus().control_word_sequence();
        let tail: Vec<u16> = sequence.iter().copied().filter(|&w| w != 0).collect();
        assert_eq!(tail, vec![0x80, 0x06, 0x07, 0x0F]);
    }

    #[test]
    fn underruns_are_counted_but_not_fatal() {
        let (mut rt, shared) = new_loop(SimBus::new(), ControlMode::Position);
        step_until(&mut rt, 100, |s| s.drive_operational());

        rt.bus().inject_underruns(5);
        for _ in 0..5 {
            rt.step().unwrap();
        }

        assert_eq!(shared.wkc_underruns(), 5);
        assert!(shared.bus_operational());
        assert!(shared.drive_operational());
        assert_eq!(
            DriveState::classify(shared.status_word()),
            DriveState::OperationEnabled
        );
    }

    #[test]
    fn executes_a_full_move_through_all_phases() {
        let (mut rt, shared) = new_loop(SimBus::starting_at(0), ControlMode::Position);
        step_until(&mut rt, 100, |s| s.drive_operational());

        let target = (360.0 * COUNTS_PER_DEGREE) as i64;
        shared.post_command(MotionCommand::MoveTo {
            target_counts: target,
            max_velocity: 180.0 * COUNTS_PER_DEGREE,
            acceleration: 360.0 * COUNTS_PER_DEGREE,
        });

        let mut seen = Vec::new();
        for _ in 0..3_000 {
            rt.step().unwrap();
            let phase = shared.motion_phase();
            if seen.last() != Some(&phase) {
                seen.push(phase);
            }
            if phase == MotionPhase::Idle && seen.len() > 1 {
                break;
            }
        }

        assert_eq!(
            seen,
            vec![
                MotionPhase::Accelerating,
                MotionPhase::Cruising,
                MotionPhase::Decelerating,
                MotionPhase::Idle,
            ]
        );

        // The modelled position snaps onto the target; the commanded
        // position can stop short of it by up to half a cycle of travel at
        // the velocity limit, which is where the following axis parks.
        let landed = rt.bus().position() as i64;
        let cycle_travel = (180.0 * COUNTS_PER_DEGREE * CYCLE_TIME_S) as i64;
        assert!(
            (landed - target).abs() <= cycle_travel,
            "landed {landed}, target {target}"
        );
    }

    #[test]
    fn zero_distance_move_stays_idle_and_echoes_position() {
        let (mut rt, shared) = new_loop(SimBus::starting_at(4_242), ControlMode::Position);
        step_until(&mut rt, 100, |s| s.drive_operational());

        shared.post_command(MotionCommand::MoveTo {
            target_counts: 0,
            max_velocity: 1000.0,
            acceleration: 1000.0,
        });

        for _ in 0..10 {
            rt.step().unwrap();
            assert_eq!(shared.motion_phase(), MotionPhase::Idle);
        }

        let last = *rt.bus().outputs_log().last().unwrap();
        assert_eq!(last.target_position, 4_242);
    }

    #[test]
    fn reverse_move_lands_below_the_start() {
        let start = 1_000_000;
        let (mut rt, shared) = new_loop(SimBus::starting_at(start), ControlMode::Position);
        step_until(&mut rt, 100, |s| s.drive_operational());

        let delta = (-90.0 * COUNTS_PER_DEGREE) as i64;
        shared.post_command(MotionCommand::MoveTo {
            target_counts: delta,
            max_velocity: 180.0 * COUNTS_PER_DEGREE,
            acceleration: 360.0 * COUNTS_PER_DEGREE,
        });

        for _ in 0..2_000 {
            rt.step().unwrap();
            if shared.motion_phase() == MotionPhase::Idle && shared.actual_position() != start {
                break;
            }
        }

        let landed = rt.bus().position() as i64;
        let expected = start as i64 + delta;
        let cycle_travel = (180.0 * COUNTS_PER_DEGREE * CYCLE_TIME_S) as i64;
        assert!(
            (landed - expected).abs() <= cycle_travel,
            "landed {landed}, expected {expected}"
        );
    }

    #[test]
    fn csv_constant_velocity_streams_setpoints_without_toggle() {
        let (mut rt, shared) = new_loop(SimBus::new(), ControlMode::Velocity);
        step_until(&mut rt, 100, |s| s.drive_operational());

        shared.post_command(MotionCommand::RunAt { velocity: 52_428.8 });
        for _ in 0..10 {
            rt.step().unwrap();
        }

        let last = *rt.bus().outputs_log().last().unwrap();
        assert_eq!(last.target_velocity, 52_428);
        assert_eq!(last.control_word, 0x0F);
        assert!(shared.actual_velocity() > 0);
    }
}
