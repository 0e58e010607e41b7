//! Software drive for hardware-out-of-the-loop runs and tests.
//!
//! The simulated drive mirrors CiA 402 control-word transitions onto its
//! status word one exchange at a time, tracks commanded position and
//! velocity as a perfectly-following axis, and can inject faults and
//! working-counter underruns on demand.

use byte_struct::*;
use std::time::Duration;

use monoaxis_shared::cia402::{
    CW_ENABLE_OPERATION, CW_FAULT_RESET, CW_SETPOINT_TOGGLE, CW_SHUTDOWN, CW_SWITCH_ON,
    DriveState, OperationMode,
};
use monoaxis_shared::{CyclicInputs, CyclicOutputs, CYCLE_TIME_S};

use super::{AlState, Fieldbus, SlaveInfo};
use crate::error::AxisError;

/// Status word patterns the simulated drive settles into.
const SW_SWITCH_ON_DISABLED: u16 = 0x0040;
const SW_READY_TO_SWITCH_ON: u16 = 0x0021;
const SW_SWITCHED_ON: u16 = 0x0023;
const SW_OPERATION_ENABLED: u16 = 0x0027;
const SW_FAULT: u16 = 0x0008;

/// Exchanges after which the simulated segment reports its clocks synced.
const DC_SYNC_AFTER: u32 = 5;

pub struct SimBus {
    al_state: AlState,
    exchanges: u32,
    expected_wkc: u16,
    underruns_left: u32,

    status_word: u16,
    fault_active: bool,
    position: f64,
    velocity: f64,

    out_image: [u8; CyclicOutputs::BYTE_LEN],
    in_image: [u8; CyclicInputs::BYTE_LEN],

    /// Every output frame the drive has seen, oldest first.
    outputs_log: Vec<CyclicOutputs>,
}

impl SimBus {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// A drive whose encoder reads `position` counts at power-on.
    pub fn starting_at(position: i32) -> Self {
        let mut sim = Self {
            al_state: AlState::SafeOp,
            exchanges: 0,
            expected_wkc: 3,
            underruns_left: 0,

            status_word: SW_SWITCH_ON_DISABLED,
            fault_active: false,
            position: position as f64,
            velocity: 0.0,

            out_image: [0; CyclicOutputs::BYTE_LEN],
            in_image: [0; CyclicInputs::BYTE_LEN],

            outputs_log: Vec::new(),
        };
        sim.publish_inputs();
        sim
    }

    /// Put the drive into fault; it stays there until a Fault Reset (0x80)
    /// arrives on the control word.
    pub fn inject_fault(&mut self) {
        self.fault_active = true;
        self.status_word = SW_FAULT;
        self.publish_inputs();
    }

    /// Answer the next `count` exchanges with one working-counter increment
    /// missing.
    pub fn inject_underruns(&mut self, count: u32) {
        self.underruns_left = count;
    }

    pub fn status_word(&self) -> u16 {
        self.status_word
    }

    pub fn position(&self) -> i32 {
        self.position as i32
    }

    pub fn al_state(&self) -> AlState {
        self.al_state
    }

    pub fn outputs_log(&self) -> &[CyclicOutputs] {
        &self.outputs_log
    }

    /// Control words observed since power-on, with the CSP new-setpoint
    /// toggle bit masked off and consecutive repeats collapsed.
    pub fn control_word_sequence(&self) -> Vec<u16> {
        let mut seq = Vec::new();
        for frame in &self.outputs_log {
            let cmd = frame.control_word & !CW_SETPOINT_TOGGLE;
            if seq.last() != Some(&cmd) {
                seq.push(cmd);
            }
        }
        seq
    }

    fn publish_inputs(&mut self) {
        let inputs = CyclicInputs {
            status_word: self.status_word,
            position_actual: self.position as i32,
            velocity_actual: self.velocity as i32,
            ..Default::default()
        };
        inputs.write_bytes(&mut self.in_image);
    }

    /// Advance the power state machine one exchange given a control word.
    fn step_power_state(&mut self, control_word: u16) {
        let cmd = control_word & !CW_SETPOINT_TOGGLE;

        if self.fault_active {
            if cmd == CW_FAULT_RESET {
                self.fault_active = false;
                self.status_word = SW_SWITCH_ON_DISABLED;
            }
            return;
        }

        self.status_word = match (DriveState::classify(self.status_word), cmd) {
            (DriveState::SwitchOnDisabled, CW_SHUTDOWN) => SW_READY_TO_SWITCH_ON,
            (DriveState::ReadyToSwitchOn, CW_SWITCH_ON) => SW_SWITCHED_ON,
            (DriveState::SwitchedOn, CW_ENABLE_OPERATION) => SW_OPERATION_ENABLED,
            (DriveState::OperationEnabled, CW_ENABLE_OPERATION) => SW_OPERATION_ENABLED,
            // Dropping the enable bits while running disables the drive.
            (DriveState::OperationEnabled, CW_SHUTDOWN) => SW_READY_TO_SWITCH_ON,
            _ => self.status_word,
        };
    }

    /// Track setpoints as a perfectly-following axis.
    fn step_motion(&mut self, frame: &CyclicOutputs) {
        if DriveState::classify(self.status_word) != DriveState::OperationEnabled {
            self.velocity = 0.0;
            return;
        }

        match frame.mode_of_operation {
            OperationMode::CyclicSynchronousPosition => {
                let target = frame.target_position as f64;
                self.velocity = (target - self.position) / CYCLE_TIME_S;
                self.position = target;
            }
            OperationMode::CyclicSynchronousVelocity => {
                self.velocity = frame.target_velocity as f64;
                self.position += self.velocity * CYCLE_TIME_S;
            }
            _ => {}
        }
    }
}

impl Default for SimBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Fieldbus for SimBus {
    fn slave_count(&self) -> usize {
        1
    }

    fn drive(&mut self) -> Result<SlaveInfo, AxisError> {
        Ok(SlaveInfo {
            name: "sim-drive".to_owned(),
            state: self.al_state,
            al_status_code: 0,
            has_dc: true,
            outputs_len: CyclicOutputs::BYTE_LEN,
            inputs_len: CyclicInputs::BYTE_LEN,
        })
    }

    fn expected_wkc(&self) -> u16 {
        self.expected_wkc
    }

    fn request_state(&mut self, state: AlState) -> Result<(), AxisError> {
        // The simulated segment acknowledges AL requests instantly; the
        // caller still observes the change through `read_state`.
        self.al_state = state;
        Ok(())
    }

    fn read_state(&mut self) -> Result<AlState, AxisError> {
        Ok(self.al_state)
    }

    fn wait_for_state(&mut self, state: AlState, _timeout: Duration) -> Result<(), AxisError> {
        self.al_state = state;
        Ok(())
    }

    fn dc_synced(&mut self) -> bool {
        self.exchanges >= DC_SYNC_AFTER
    }

    fn exchange(&mut self) -> Result<u16, AxisError> {
        self.exchanges += 1;

        let frame = CyclicOutputs::read_bytes(&self.out_image);
        self.outputs_log.push(frame);

        self.step_power_state(frame.control_word);
        self.step_motion(&frame);
        self.publish_inputs();

        if self.underruns_left > 0 {
            self.underruns_left -= 1;
            Ok(self.expected_wkc - 1)
        } else {
            Ok(self.expected_wkc)
        }
    }

    fn outputs(&mut self) -> &mut [u8] {
        &mut self.out_image
    }

    fn inputs(&self) -> &[u8] {
        &self.in_image
    }

    fn sdo_read(
        &mut self,
        _slave: u16,
        index: u16,
        subindex: u8,
        buf: &mut [u8],
    ) -> Result<usize, AxisError> {
        use monoaxis_shared::cia402::objects;
        match (index, subindex) {
            (i, s) if (i, s) == objects::STATUS_WORD => {
                buf[..2].copy_from_slice(&self.status_word.to_le_bytes());
                Ok(2)
            }
            (i, s) if (i, s) == objects::LAST_ERROR_CODE => {
                let code: u16 = if self.fault_active { 0x7500 } else { 0 };
                buf[..2].copy_from_slice(&code.to_le_bytes());
                Ok(2)
            }
            (i, s) if (i, s) == objects::DRIVER_STATUS => {
                let status: u16 = if self.fault_active { 0x0001 } else { 0x0000 };
                buf[..2].copy_from_slice(&status.to_le_bytes());
                Ok(2)
            }
            _ => Err(AxisError::SdoFailure {
                index,
                subindex,
                detail: "object not modelled by the simulated drive".to_owned(),
            }),
        }
    }

    fn sdo_write(
        &mut self,
        _slave: u16,
        index: u16,
        subindex: u8,
        data: &[u8],
    ) -> Result<(), AxisError> {
        use monoaxis_shared::cia402::objects;
        if (index, subindex) == objects::CONTROL_WORD && data.len() >= 2 {
            let word = u16::from_le_bytes([data[0], data[1]]);
            self.step_power_state(word);
            self.publish_inputs();
            return Ok(());
        }
        if (index, subindex) == objects::MODE_OF_OPERATION {
            return Ok(());
        }
        Err(AxisError::SdoFailure {
            index,
            subindex,
            detail: "object not writable on the simulated drive".to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn send(sim: &mut SimBus, frame: CyclicOutputs) -> CyclicInputs {
        frame.write_bytes(sim.outputs());
        sim.exchange().unwrap();
        CyclicInputs::read_bytes(sim.inputs())
    }

    #[test]
    fn walks_the_power_state_machine_one_exchange_per_step() {
        let mut sim = SimBus::new();
        assert_eq!(DriveState::classify(sim.status_word()), DriveState::SwitchOnDisabled);

        let mut frame = CyclicOutputs {
            control_word: CW_SHUTDOWN,
            ..Default::default()
        };
        let inputs = send(&mut sim, frame);
        assert_eq!(DriveState::classify(inputs.status_word), DriveState::ReadyToSwitchOn);

        frame.control_word = CW_SWITCH_ON;
        let inputs = send(&mut sim, frame);
        assert_eq!(DriveState::classify(inputs.status_word), DriveState::SwitchedOn);

        frame.control_word = CW_ENABLE_OPERATION;
        let inputs = send(&mut sim, frame);
        assert_eq!(DriveState::classify(inputs.status_word), DriveState::OperationEnabled);
    }

    #[test]
    fn fault_holds_until_reset() {
        let mut sim = SimBus::new();
        sim.inject_fault();

        let mut frame = CyclicOutputs {
            control_word: CW_SHUTDOWN,
            ..Default::default()
        };
        let inputs = send(&mut sim, frame);
        assert_eq!(DriveState::classify(inputs.status_word), DriveState::Fault);

        frame.control_word = CW_FAULT_RESET;
        let inputs = send(&mut sim, frame);
        assert_eq!(DriveState::classify(inputs.status_word), DriveState::SwitchOnDisabled);
    }

    #[test]
    fn underruns_are_injected_then_clear() {
        let mut sim = SimBus::new();
        sim.inject_underruns(2);
        assert_eq!(sim.exchange().unwrap(), sim.expected_wkc() - 1);
        assert_eq!(sim.exchange().unwrap(), sim.expected_wkc() - 1);
        assert_eq!(sim.exchange().unwrap(), sim.expected_wkc());
    }
}
