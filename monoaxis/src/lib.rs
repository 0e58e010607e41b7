#![doc = include_str!("../README.md")]

pub mod bus;
pub mod cli;
pub mod controller;
pub mod drive;
pub mod error;
pub mod logging;
pub mod trajectory;

pub use controller::{Controller, ControllerConfig};
pub use controller::shared::MotionCommand;
pub use drive::ControlMode;
pub use error::AxisError;
