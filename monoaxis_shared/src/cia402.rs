//! CiA 402 drive profile: operation modes, power-state classification,
//! and the control words that drive transitions between power states.

use byte_struct::*;

use crate::enum_with_unknown;

/// Control word (0x6040) that acknowledges a fault and returns the drive
/// to Switch-on Disabled.
pub const CW_FAULT_RESET: u16 = 0x80;

/// Control word (0x6040) for the Shutdown command:
/// Switch-on Disabled -> Ready to Switch On.
pub const CW_SHUTDOWN: u16 = 0x06;

/// Control word (0x6040) for the Switch On command:
/// Ready to Switch On -> Switched On.
pub const CW_SWITCH_ON: u16 = 0x07;

/// Control word (0x6040) for the Enable Operation command, also the hold
/// word while the drive is in Operation Enabled.
pub const CW_ENABLE_OPERATION: u16 = 0x0F;

/// Bit 4 of the control word. In cyclic synchronous position mode this is
/// toggled every cycle so the drive latches each fresh target.
pub const CW_SETPOINT_TOGGLE: u16 = 0x10;

/// Bit 3 of the status word (0x6041): fault active.
pub const SW_FAULT_BIT: u16 = 0x08;

/// Object dictionary addresses consumed over SDO.
pub mod objects {
    /// Control word.
    pub const CONTROL_WORD: (u16, u8) = (0x6040, 0);
    /// Status word.
    pub const STATUS_WORD: (u16, u8) = (0x6041, 0);
    /// Mode of operation.
    pub const MODE_OF_OPERATION: (u16, u8) = (0x6060, 0);
    /// Manufacturer-specific last error code.
    pub const LAST_ERROR_CODE: (u16, u8) = (0x3C13, 0x84);
    /// Manufacturer-specific driver status.
    pub const DRIVER_STATUS: (u16, u8) = (0x3C13, 0xD5);
}

enum_with_unknown!(
    /// Mode of operation (0x6060) / mode of operation display (0x6061).
    ///
    /// Only the cyclic synchronous modes are commanded by this controller;
    /// the rest exist so a mode readback never needs a fallible decode.
    #[derive(Default)]
    #[non_exhaustive]
    pub enum OperationMode(i8) {
        #[default]
        None = 0,
        ProfilePosition = 1,
        Velocity = 2,
        ProfileVelocity = 3,
        ProfileTorque = 4,
        Homing = 6,
        InterpolatedPosition = 7,
        CyclicSynchronousPosition = 8,
        CyclicSynchronousVelocity = 9,
        CyclicSynchronousTorque = 10,
    }
);

impl ByteStructLen for OperationMode {
    const BYTE_LEN: usize = 1;
}

impl ByteStruct for OperationMode {
    fn read_bytes(bytes: &[u8]) -> Self {
        Self::from(bytes[0] as i8)
    }

    fn write_bytes(&self, bytes: &mut [u8]) {
        bytes[0] = i8::from(*self) as u8;
    }
}

/// Power state of the drive, derived purely from the low bits of the
/// status word.
///
/// The bitmask tests come straight from the CiA 402 state machine table;
/// `Transitioning` covers "not ready to switch on", "quick stop active",
/// and any in-between pattern, during which the controller holds its last
/// command and waits for the drive to settle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveState {
    Fault,
    SwitchOnDisabled,
    ReadyToSwitchOn,
    SwitchedOn,
    OperationEnabled,
    Transitioning,
}

impl DriveState {
    /// Classify a status word. Tests are applied in order; first match wins,
    /// and the fault bit dominates everything else.
    pub fn classify(status_word: u16) -> Self {
        if status_word & SW_FAULT_BIT != 0 {
            Self::Fault
        } else if status_word & 0x4F == 0x40 {
            Self::SwitchOnDisabled
        } else if status_word & 0x6F == 0x21 {
            Self::ReadyToSwitchOn
        } else if status_word & 0x6F == 0x23 {
            Self::SwitchedOn
        } else if status_word & 0x6F == 0x27 {
            Self::OperationEnabled
        } else {
            Self::Transitioning
        }
    }

    /// The control word that moves the drive one step toward Operation
    /// Enabled from this state, or `None` when there is nothing useful to
    /// command (the drive is mid-transition).
    pub fn next_control_word(self) -> Option<u16> {
        match self {
            Self::Fault => Some(CW_FAULT_RESET),
            Self::SwitchOnDisabled => Some(CW_SHUTDOWN),
            Self::ReadyToSwitchOn => Some(CW_SWITCH_ON),
            Self::SwitchedOn | Self::OperationEnabled => Some(CW_ENABLE_OPERATION),
            Self::Transitioning => None,
        }
    }
}
