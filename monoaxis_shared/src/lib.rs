#![doc = include_str!("../README.md")]
#![cfg_attr(not(feature = "std"), no_std)]

pub mod cia402;
pub mod pdo;

pub use pdo::{CyclicInputs, CyclicOutputs};

/// Encoder resolution of the drive, from object 0x608F:01 (2^21).
pub const COUNTS_PER_REVOLUTION: f64 = 2_097_152.0;

/// Encoder counts per degree of shaft rotation.
pub const COUNTS_PER_DEGREE: f64 = COUNTS_PER_REVOLUTION / 360.0;

/// Cyclic exchange period in nanoseconds. The drive's SYNC0 event is
/// programmed to the same period, so this must not change at runtime.
pub const CYCLE_TIME_NS: u64 = 2_000_000;

/// Cyclic exchange period in seconds, for trajectory integration.
pub const CYCLE_TIME_S: f64 = 0.002;

/// Derive To/From with an added "Unknown" variant catch-all, so decoding
/// a wire value that matches no variant neither panics nor forces error
/// handling onto every read.
///
/// Adapted from smoltcp's macro of the same name.
#[macro_export]
macro_rules! enum_with_unknown {
    (
        $( #[$enum_attr:meta] )*
        pub enum $name:ident($ty:ty) {
            $(
              $( #[$variant_attr:meta] )*
              $variant:ident = $value:expr
            ),+ $(,)?
        }
    ) => {
        #[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
        $( #[$enum_attr] )*
        pub enum $name {
            $(
              $( #[$variant_attr] )*
              $variant
            ),*,
            /// Catch-all for values that do not match a variant
            Unknown($ty)
        }

        impl ::core::convert::From<$ty> for $name {
            fn from(value: $ty) -> Self {
                match value {
                    $( $value => $name::$variant ),*,
                    other => $name::Unknown(other)
                }
            }
        }

        impl ::core::convert::From<$name> for $ty {
            fn from(value: $name) -> Self {
                match value {
                    $( $name::$variant => $value ),*,
                    $name::Unknown(other) => other
                }
            }
        }
    }
}
