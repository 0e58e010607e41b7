//! Error taxonomy for bus setup and cyclic operation.
//!
//! Setup errors are fatal and propagate out of the binaries as a nonzero
//! exit; runtime errors set the stop flag and let the cooperative shutdown
//! path return the bus to INIT before the process exits.

use core::fmt;
use std::time::Duration;

use crate::bus::{al_status_description, AlState};

#[derive(Debug)]
pub enum AxisError {
    /// The raw-Ethernet socket could not be bound to the named NIC.
    LinkOpen { interface: String, detail: String },

    /// Enumeration found no slaves on the segment.
    NoSlaves,

    /// An SDO exchange failed or was aborted by the drive.
    SdoFailure {
        index: u16,
        subindex: u8,
        detail: String,
    },

    /// A requested AL state was not reached before the timeout elapsed.
    StateTimeout {
        requested: AlState,
        observed: AlState,
        timeout: Duration,
    },

    /// The slave entered AL ERROR; the code comes from its AL status register.
    SlaveError { al_status_code: u16 },

    /// The drive never reached Operation Enabled after the bus went cyclic.
    DriveTimeout { status_word: u16, last_error: u16 },

    /// Failure reported by the underlying fieldbus library.
    Fieldbus(String),

    /// Controller-side failure unrelated to the bus (thread spawn, join).
    Internal(String),
}

impl fmt::Display for AxisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LinkOpen { interface, detail } => {
                write!(f, "cannot open EtherCAT link on {interface}: {detail}")
            }
            Self::NoSlaves => write!(f, "no slaves found on the segment"),
            Self::SdoFailure {
                index,
                subindex,
                detail,
            } => {
                write!(f, "SDO exchange {index:#06x}:{subindex:#04x} failed: {detail}")
            }
            Self::StateTimeout {
                requested,
                observed,
                timeout,
            } => write!(
                f,
                "slaves did not reach {requested} within {timeout:?} (stuck in {observed})"
            ),
            Self::SlaveError { al_status_code } => write!(
                f,
                "slave in AL ERROR, status code {al_status_code:#06x} ({})",
                al_status_description(*al_status_code)
            ),
            Self::DriveTimeout {
                status_word,
                last_error,
            } => {
                if status_word & monoaxis_shared::cia402::SW_FAULT_BIT != 0 {
                    write!(
                        f,
                        "drive timed out in FAULT (status {status_word:#06x}, last error \
                         {last_error:#06x}); check the physical setup"
                    )
                } else {
                    write!(
                        f,
                        "drive did not become operational (final status {status_word:#06x})"
                    )
                }
            }
            Self::Fieldbus(detail) => write!(f, "fieldbus error: {detail}"),
            Self::Internal(detail) => write!(f, "internal error: {detail}"),
        }
    }
}

impl std::error::Error for AxisError {}
