//! Cyclic process data frames exchanged with the drive every cycle.
//!
//! Both frames are packed little-endian with no padding; the byte layout
//! here must match the drive's PDO mapping (0x1600 / 0x1A00) exactly, so
//! they are encoded and decoded explicitly rather than cast from memory.

use byte_struct::*;

use crate::cia402::OperationMode;

/// Master -> drive frame (RxPDO from the drive's point of view), 17 bytes.
#[derive(ByteStruct, Clone, Copy, Debug, Default, PartialEq)]
#[byte_struct_le]
pub struct CyclicOutputs {
    /// CiA 402 control word (0x6040).
    pub control_word: u16,

    /// Commanded position in encoder counts (0x607A), consumed in CSP mode.
    pub target_position: i32,

    /// Commanded velocity in counts/s (0x60FF), consumed in CSV mode.
    pub target_velocity: i32,

    /// Commanded torque in per-mille of rated torque (0x6071).
    pub target_torque: i16,

    /// Mode of operation (0x6060); preset before the first exchange and
    /// never changed mid-run.
    pub mode_of_operation: OperationMode,

    /// Additive velocity feed-forward in counts/s (0x60B1).
    pub velocity_offset: i32,
}

/// Drive -> master frame (TxPDO from the drive's point of view), 23 bytes.
#[derive(ByteStruct, Clone, Copy, Debug, Default, PartialEq)]
#[byte_struct_le]
pub struct CyclicInputs {
    /// CiA 402 status word (0x6041).
    pub status_word: u16,

    /// Measured position in encoder counts (0x6064).
    pub position_actual: i32,

    /// Measured velocity in counts/s (0x606C).
    pub velocity_actual: i32,

    /// Measured torque in per-mille of rated torque (0x6077).
    pub torque_actual: i16,

    /// Position loop following error in counts (0x60F4).
    pub following_error: i32,

    /// Mode of operation display (0x6061).
    pub mode_of_operation_display: OperationMode,

    /// Touch probe status (0x60B9).
    pub touch_probe_status: u16,

    /// Touch probe 1 latched position (0x60BA).
    pub touch_probe_pos1: i32,
}

// The drive rejects SAFE-OP if the mapped sizes disagree with 0x1600/0x1A00.
const _: () = assert!(CyclicOutputs::BYTE_LEN == 17);
const _: () = assert!(CyclicInputs::BYTE_LEN == 23);
