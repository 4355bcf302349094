//! Core types and traits for the labbus instrument-control stack.
//!
//! A GPIB bus is reached through a [`bus::GpibBus`] adapter (one per
//! controller product) wrapped in an [`interface::GpibInterface`], which
//! adds per-address open reference counting and ASCII line conveniences.
//! Adapter crates plug in through [`registry::BusFactory`]; instrument
//! drivers sit on top of the interface and speak their device's command
//! language.
//!
//! The crate also carries the two small device superclasses shared by
//! higher-level drivers: [`changer::SampleChanger`] and
//! [`operation::Operation`].

pub mod address;
pub mod bus;
pub mod changer;
pub mod config;
pub mod error;
pub mod interface;
pub mod operation;
pub mod registry;
pub mod serial;

pub use address::{GpibAddress, Termination, TransferFlags, PRIMARY_ADDRESS_COUNT};
pub use bus::GpibBus;
pub use config::{AddressState, GpibSettings};
pub use error::{GpibError, GpibErrorKind, Result};
pub use interface::GpibInterface;
pub use registry::{BusFactory, BusRegistry};
