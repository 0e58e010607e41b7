//! CiA 402 power state machine, driven one cycle at a time.
//!
//! The controller classifies each fresh status word and emits the control
//! word that walks the drive toward Operation Enabled, holding the
//! commanded position at the measured position the whole way so that
//! nothing jumps the instant the drive starts following setpoints.

use monoaxis_shared::cia402::{
    CW_ENABLE_OPERATION, CW_FAULT_RESET, CW_SETPOINT_TOGGLE, DriveState, OperationMode,
};
use monoaxis_shared::{CyclicInputs, CyclicOutputs};

/// Which cyclic synchronous mode the drive is commanded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMode {
    /// Cyclic Synchronous Position: one position setpoint per cycle, with
    /// the new-setpoint bit toggled so the drive latches each one.
    Position,
    /// Cyclic Synchronous Velocity: one velocity setpoint per cycle, no
    /// latch toggle.
    Velocity,
}

impl ControlMode {
    pub fn operation_mode(self) -> OperationMode {
        match self {
            Self::Position => OperationMode::CyclicSynchronousPosition,
            Self::Velocity => OperationMode::CyclicSynchronousVelocity,
        }
    }
}

pub struct DriveController {
    mode: ControlMode,
    operational: bool,
    fault: bool,
    setpoint_toggle: bool,
}

impl DriveController {
    pub fn new(mode: ControlMode) -> Self {
        Self {
            mode,
            operational: false,
            fault: false,
            setpoint_toggle: false,
        }
    }

    pub fn mode(&self) -> ControlMode {
        self.mode
    }

    /// The drive has reached Operation Enabled and is consuming setpoints.
    pub fn operational(&self) -> bool {
        self.operational
    }

    /// The fault bit was set in the last classified status word.
    pub fn fault(&self) -> bool {
        self.fault
    }

    /// Run one cycle of the power state machine against freshly received
    /// inputs, writing the control word (and, until the drive is
    /// operational, the held position) into the next output frame.
    ///
    /// Returns the measured position to seed the trajectory from on the
    /// cycle Operation Enabled is first reached.
    pub fn update(&mut self, inputs: &CyclicInputs, outputs: &mut CyclicOutputs) -> Option<i32> {
        let state = DriveState::classify(inputs.status_word);

        if state == DriveState::Fault {
            self.fault = true;
            self.operational = false;
            outputs.control_word = CW_FAULT_RESET;
            // Track the measured position so the drive does not jump when
            // the fault clears.
            outputs.target_position = inputs.position_actual;
            outputs.target_velocity = 0;
            return None;
        }
        self.fault = false;

        if !self.operational {
            outputs.target_position = inputs.position_actual;
            outputs.target_velocity = 0;

            if let Some(control_word) = state.next_control_word() {
                outputs.control_word = control_word;
            }

            if state == DriveState::OperationEnabled {
                self.operational = true;
                return Some(inputs.position_actual);
            }
            return None;
        }

        // Operation Enabled hold: base word 0x0F, with bit 4 toggled every
        // cycle in CSP so each fresh target is latched.
        let mut control_word = CW_ENABLE_OPERATION;
        if self.mode == ControlMode::Position {
            self.setpoint_toggle = !self.setpoint_toggle;
            if self.setpoint_toggle {
                control_word |= CW_SETPOINT_TOGGLE;
            }
        }
        outputs.control_word = control_word;

        // The drive dropped out of Operation Enabled (e.g. an external
        // disable); fall back to transition handling next cycle.
        if state != DriveState::OperationEnabled {
            self.operational = false;
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(status_word: u16, position_actual: i32) -> CyclicInputs {
        CyclicInputs {
            status_word,
            position_actual,
            ..Default::default()
        }
    }

    #[test]
    fn walks_toward_operation_enabled() {
        let mut drive = DriveController::new(ControlMode::Position);
        let mut out = CyclicOutputs::default();

        assert_eq!(drive.update(&inputs(0x0040, 500), &mut out), None);
        assert_eq!(out.control_word, 0x06);
        assert_eq!(out.target_position, 500);

        assert_eq!(drive.update(&inputs(0x0021, 500), &mut out), None);
        assert_eq!(out.control_word, 0x07);

        assert_eq!(drive.update(&inputs(0x0023, 500), &mut out), None);
        assert_eq!(out.control_word, 0x0F);

        let seed = drive.update(&inputs(0x0027, 512), &mut out);
        assert_eq!(seed, Some(512));
        assert!(drive.operational());
        assert_eq!(out.target_position, 512);
    }

    #[test]
    fn fault_emits_reset_and_holds_position() {
        let mut drive = DriveController::new(ControlMode::Position);
        let mut out = CyclicOutputs::default();

        drive.update(&inputs(0x0008, -1234), &mut out);
        assert!(drive.fault());
        assert_eq!(out.control_word, 0x80);
        assert_eq!(out.target_position, -1234);

        // Fault bit wins even when other bits look operational.
        drive.update(&inputs(0x0027 | 0x0008, 0), &mut out);
        assert!(drive.fault());
        assert_eq!(out.control_word, 0x80);

        // Once cleared, the normal sequence resumes.
        drive.update(&inputs(0x0040, 0), &mut out);
        assert!(!drive.fault());
        assert_eq!(out.control_word, 0x06);
    }

    #[test]
    fn csp_toggles_the_new_setpoint_bit_every_cycle() {
        let mut drive = DriveController::new(ControlMode::Position);
        let mut out = CyclicOutputs::default();

        drive.update(&inputs(0x0027, 0), &mut out);
        assert!(drive.operational());

        let mut toggles = Vec::new();
        for _ in 0..4 {
            drive.update(&inputs(0x0027, 0), &mut out);
            assert_eq!(out.control_word & 0x0F, 0x0F);
            toggles.push(out.control_word & CW_SETPOINT_TOGGLE != 0);
        }
        assert_eq!(toggles, vec![true, false, true, false]);
    }

    #[test]
    fn csv_never_sets_the_toggle_bit() {
        let mut drive = DriveController::new(ControlMode::Velocity);
        let mut out = CyclicOutputs::default();

        drive.update(&inputs(0x0027, 0), &mut out);
        for _ in 0..4 {
            drive.update(&inputs(0x0027, 0), &mut out);
            assert_eq!(out.control_word, 0x0F);
        }
    }

    #[test]
    fn holds_measured_position_until_operational() {
        let mut drive = DriveController::new(ControlMode::Position);
        let mut out = CyclicOutputs::default();

        for (status, position) in [(0x0040, 10), (0x0021, 20), (0x0023, 30)] {
            drive.update(&inputs(status, position), &mut out);
            assert_eq!(out.target_position, position);
            assert!(!drive.operational());
        }
    }
}
