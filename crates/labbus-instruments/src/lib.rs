//! Instrument drivers built on the labbus transport stack.
//!
//! Each driver wraps either a [`labbus_core::GpibInterface`] address or
//! a shared serial port, speaks its device's command language, and maps
//! the device's own error reporting onto the shared taxonomy.

pub mod als_robot;
pub mod keithley428;
pub mod ortec974;
pub mod sim900;
pub mod soft_changer;

#[cfg(test)]
mod testutil;

pub use als_robot::AlsRobot;
pub use keithley428::Keithley428;
pub use ortec974::Ortec974;
pub use sim900::{Sim900, Sim900Port};
pub use soft_changer::SoftChanger;
