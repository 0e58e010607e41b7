//! Cross-thread state: a fixed set of atomic scalars with acquire-release
//! ordering.
//!
//! Ownership is split by writer: the realtime loop is the sole writer of
//! every status field, the supervisor is the sole writer of the command
//! mailbox and the stop flag (the signal handler also sets the stop
//! flag). Nothing here allocates or locks.

use std::sync::atomic::{
    AtomicBool, AtomicI32, AtomicI64, AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering,
};

use crate::trajectory::MotionPhase;

/// Status snapshot published by the realtime loop, command mailbox filled
/// by the supervisor.
#[derive(Default)]
pub struct SharedState {
    // Process-wide stop flag, set by the signal handler or by either
    // thread on a fatal error.
    stop: AtomicBool,

    // Status fields: realtime loop writes, supervisor reads.
    bus_operational: AtomicBool,
    drive_operational: AtomicBool,
    fault_detected: AtomicBool,
    status_word: AtomicU16,
    control_word: AtomicU16,
    actual_position: AtomicI32,
    actual_velocity: AtomicI32,
    al_status_code: AtomicU16,
    wkc_underruns: AtomicU32,
    motion_phase: AtomicU8,
    target_position_counts: AtomicI64,

    // Command mailbox: supervisor writes, realtime loop consumes.
    // Float parameters travel as bit patterns; they are only meaningful
    // while `command_pending` is set, which is stored with release
    // ordering after the payload.
    command_kind: AtomicU8,
    command_target: AtomicI64,
    command_max_velocity: AtomicU64,
    command_acceleration: AtomicU64,
    command_pending: AtomicBool,
}

/// What the supervisor asked the realtime loop to do.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MotionCommand {
    /// Trapezoidal move to an absolute position in counts.
    MoveTo {
        target_counts: i64,
        max_velocity: f64,
        acceleration: f64,
    },
    /// Constant velocity in counts/s (CSV only).
    RunAt { velocity: f64 },
}

impl SharedState {
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Handle to the raw stop flag, for registering with the signal hook.
    pub fn stop_flag(&self) -> &AtomicBool {
        &self.stop
    }

    // --- status, written by the realtime loop ---

    pub fn publish_cycle(
        &self,
        status_word: u16,
        control_word: u16,
        actual_position: i32,
        actual_velocity: i32,
    ) {
        self.status_word.store(status_word, Ordering::Release);
        self.control_word.store(control_word, Ordering::Release);
        self.actual_position.store(actual_position, Ordering::Release);
        self.actual_velocity.store(actual_velocity, Ordering::Release);
    }

    pub fn set_bus_operational(&self, value: bool) {
        self.bus_operational.store(value, Ordering::Release);
    }

    pub fn set_drive_operational(&self, value: bool) {
        self.drive_operational.store(value, Ordering::Release);
    }

    pub fn set_fault_detected(&self, value: bool) {
        self.fault_detected.store(value, Ordering::Release);
    }

    pub fn set_al_status_code(&self, code: u16) {
        self.al_status_code.store(code, Ordering::Release);
    }

    pub fn count_wkc_underrun(&self) {
        self.wkc_underruns.fetch_add(1, Ordering::AcqRel);
    }

    pub fn set_motion_phase(&self, phase: MotionPhase) {
        self.motion_phase.store(phase as u8, Ordering::Release);
    }

    pub fn set_target_position(&self, counts: i64) {
        self.target_position_counts.store(counts, Ordering::Release);
    }

    // --- status, read by the supervisor ---

    pub fn bus_operational(&self) -> bool {
        self.bus_operational.load(Ordering::Acquire)
    }

    pub fn drive_operational(&self) -> bool {
        self.drive_operational.load(Ordering::Acquire)
    }

    pub fn fault_detected(&self) -> bool {
        self.fault_detected.load(Ordering::Acquire)
    }

    pub fn status_word(&self) -> u16 {
        self.status_word.load(Ordering::Acquire)
    }

    pub fn control_word(&self) -> u16 {
        self.control_word.load(Ordering::Acquire)
    }

    pub fn actual_position(&self) -> i32 {
        self.actual_position.load(Ordering::Acquire)
    }

    pub fn actual_velocity(&self) -> i32 {
        self.actual_velocity.load(Ordering::Acquire)
    }

    pub fn al_status_code(&self) -> u16 {
        self.al_status_code.load(Ordering::Acquire)
    }

    pub fn wkc_underruns(&self) -> u32 {
        self.wkc_underruns.load(Ordering::Acquire)
    }

    pub fn motion_phase(&self) -> MotionPhase {
        MotionPhase::from_discriminant(self.motion_phase.load(Ordering::Acquire))
    }

    pub fn target_position(&self) -> i64 {
        self.target_position_counts.load(Ordering::Acquire)
    }

    // --- command mailbox ---

    /// Post a command for the realtime loop; overwrites any command it has
    /// not consumed yet.
    pub fn post_command(&self, command: MotionCommand) {
        match command {
            MotionCommand::MoveTo {
                target_counts,
                max_velocity,
                acceleration,
            } => {
                self.command_kind.store(0, Ordering::Relaxed);
                self.command_target.store(target_counts, Ordering::Relaxed);
                self.command_max_velocity
                    .store(max_velocity.to_bits(), Ordering::Relaxed);
                self.command_acceleration
                    .store(acceleration.to_bits(), Ordering::Relaxed);
            }
            MotionCommand::RunAt { velocity } => {
                self.command_kind.store(1, Ordering::Relaxed);
                self.command_max_velocity
                    .store(velocity.to_bits(), Ordering::Relaxed);
            }
        }
        self.command_pending.store(true, Ordering::Release);
    }

    /// Consume the pending command, if any. Called once per cycle by the
    /// realtime loop.
    pub fn take_command(&self) -> Option<MotionCommand> {
        if !self.command_pending.swap(false, Ordering::AcqRel) {
            return None;
        }
        let command = match self.command_kind.load(Ordering::Relaxed) {
            0 => MotionCommand::MoveTo {
                target_counts: self.command_target.load(Ordering::Relaxed),
                max_velocity: f64::from_bits(self.command_max_velocity.load(Ordering::Relaxed)),
                acceleration: f64::from_bits(self.command_acceleration.load(Ordering::Relaxed)),
            },
            _ => MotionCommand::RunAt {
                velocity: f64::from_bits(self.command_max_velocity.load(Ordering::Relaxed)),
            },
        };
        Some(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_mailbox_roundtrips() {
        let shared = SharedState::default();
        assert_eq!(shared.take_command(), None);

        shared.post_command(MotionCommand::MoveTo {
            target_counts: -42,
            max_velocity: 1234.5,
            acceleration: 6789.0,
        });
        assert_eq!(
            shared.take_command(),
            Some(MotionCommand::MoveTo {
                target_counts: -42,
                max_velocity: 1234.5,
                acceleration: 6789.0,
            })
        );

        // Consumed exactly once.
        assert_eq!(shared.take_command(), None);
    }

    #[test]
    fn later_commands_overwrite_earlier_ones() {
        let shared = SharedState::default();
        shared.post_command(MotionCommand::RunAt { velocity: 1.0 });
        shared.post_command(MotionCommand::RunAt { velocity: 2.0 });
        assert_eq!(
            shared.take_command(),
            Some(MotionCommand::RunAt { velocity: 2.0 })
        );
    }

    #[test]
    fn motion_phase_roundtrips_through_the_discriminant() {
        let shared = SharedState::default();
        for phase in [
            MotionPhase::Idle,
            MotionPhase::Accelerating,
            MotionPhase::Cruising,
            MotionPhase::Decelerating,
        ] {
            shared.set_motion_phase(phase);
            assert_eq!(shared.motion_phase(), phase);
        }
    }
}
