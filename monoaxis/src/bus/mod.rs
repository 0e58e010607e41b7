//! Fieldbus seam: the synchronous bus-session interface the controller
//! drives, with an EtherCAT implementation for real hardware and a
//! software drive for tests and hardware-out-of-the-loop runs.

pub mod ethercat;
pub mod sim;

use core::fmt;
use std::time::Duration;

use crate::error::AxisError;

/// Station position of the single drive on the segment, 1-based as in AL
/// addressing. Multi-slave segments are out of scope.
pub const DRIVE_POSITION: u16 = 1;

/// EtherCAT application-layer state of a slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlState {
    Init,
    PreOp,
    SafeOp,
    Op,
    /// The slave has flagged an AL error; the status code says why.
    Error,
}

impl fmt::Display for AlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "INIT",
            Self::PreOp => "PRE-OP",
            Self::SafeOp => "SAFE-OP",
            Self::Op => "OP",
            Self::Error => "ERROR",
        };
        write!(f, "{name}")
    }
}

/// Snapshot of the drive's bus-level identity and state.
#[derive(Debug, Clone)]
pub struct SlaveInfo {
    pub name: String,
    pub state: AlState,
    pub al_status_code: u16,
    pub has_dc: bool,
    /// Mapped cyclic output/input image sizes in bytes.
    pub outputs_len: usize,
    pub inputs_len: usize,
}

/// One bus session bound to a network interface, from the controller's
/// point of view.
///
/// The cyclic path stages process data in buffers owned by the session:
/// the loop writes `outputs()`, calls `exchange()` once per cycle, then
/// reads `inputs()`. During cyclic operation the session lives behind a
/// mutex shared with the supervisor, which takes it between cycles for
/// acyclic SDO traffic; one SDO in flight alongside the cyclic exchange
/// is the intended operating mode.
pub trait Fieldbus: Send {
    /// Number of slaves discovered during enumeration.
    fn slave_count(&self) -> usize;

    /// Bus-level snapshot of the drive.
    fn drive(&mut self) -> Result<SlaveInfo, AxisError>;

    /// Group working counter expected for a fully answered cyclic exchange.
    fn expected_wkc(&self) -> u16;

    /// Request an AL state for all slaves without waiting for it.
    fn request_state(&mut self, state: AlState) -> Result<(), AxisError>;

    /// Read back the drive's current AL state.
    fn read_state(&mut self) -> Result<AlState, AxisError>;

    /// Request an AL state and poll until it is observed or the timeout
    /// elapses, in which case `AxisError::StateTimeout` is returned.
    fn wait_for_state(&mut self, state: AlState, timeout: Duration) -> Result<(), AxisError>;

    /// Whether distributed clocks are configured and a nonzero DC time has
    /// been observed on the segment.
    fn dc_synced(&mut self) -> bool;

    /// One paired cyclic send + receive. Returns the working counter of
    /// the exchange; the caller compares it against `expected_wkc`.
    fn exchange(&mut self) -> Result<u16, AxisError>;

    /// Staged cyclic output image (master -> drive), written before
    /// `exchange`.
    fn outputs(&mut self) -> &mut [u8];

    /// Cyclic input image (drive -> master) as of the last `exchange`.
    fn inputs(&self) -> &[u8];

    /// Acyclic object-dictionary read. Returns the number of bytes the
    /// drive answered with (1, 2 or 4); `buf` must hold at least 4 bytes.
    fn sdo_read(
        &mut self,
        slave: u16,
        index: u16,
        subindex: u8,
        buf: &mut [u8],
    ) -> Result<usize, AxisError>;

    /// Acyclic object-dictionary write of `data.len()` bytes.
    fn sdo_write(
        &mut self,
        slave: u16,
        index: u16,
        subindex: u8,
        data: &[u8],
    ) -> Result<(), AxisError>;
}

/// Human-readable description for the AL status codes a drive commonly
/// reports, for ERROR-state diagnostics.
pub fn al_status_description(code: u16) -> &'static str {
    match code {
        0x0000 => "no error",
        0x0001 => "unspecified error",
        0x0011 => "invalid requested state change",
        0x0012 => "unknown requested state",
        0x0013 => "bootstrap not supported",
        0x0016 => "invalid mailbox configuration",
        0x0017 => "invalid sync manager configuration",
        0x001A => "synchronization error",
        0x001B => "sync manager watchdog",
        0x001D => "invalid output configuration",
        0x001E => "invalid input configuration",
        0x001F => "invalid watchdog configuration",
        0x0021 => "waiting for init state",
        0x0022 => "waiting for pre-op state",
        0x0023 => "waiting for safe-op state",
        0x002C => "fatal sync error",
        0x002D => "no sync error",
        0x0030 => "invalid DC sync configuration",
        0x0032 => "DC PLL sync error",
        0x0036 => "DC cycle time too small",
        _ => "unknown AL status code",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn al_states_format_like_the_wire_names() {
        assert_eq!(AlState::SafeOp.to_string(), "SAFE-OP");
        assert_eq!(AlState::Op.to_string(), "OP");
    }

    #[test]
    fn common_al_status_codes_have_descriptions() {
        assert_eq!(al_status_description(0x001B), "sync manager watchdog");
        assert_eq!(al_status_description(0xFFFF), "unknown AL status code");
    }
}
