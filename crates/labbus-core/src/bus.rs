//! The bus-adapter contract every GPIB controller driver implements.

use crate::address::{GpibAddress, TransferFlags};
use crate::config::AddressState;
use crate::error::{GpibError, Result};
use async_trait::async_trait;
use std::time::Duration;

/// Operations a GPIB bus controller exposes.
///
/// One implementation exists per controller product (a plug-in board, a
/// serial bridge, a kernel character device, a remote proxy). The generic
/// dispatcher in [`crate::interface::GpibInterface`] layers open/close
/// reference counting and ASCII line conveniences on top of this trait.
///
/// Operations a controller cannot perform keep their default bodies, which
/// fail with [`GpibErrorKind::Unsupported`](crate::error::GpibErrorKind);
/// callers probe support by calling and matching on the error kind instead
/// of consulting a capability table.
///
/// `open_device`/`close_device` default to no-ops because most bridge-style
/// controllers address devices per transaction and have nothing to open.
/// `read` and `write` receive the caller's per-address [`AddressState`] so
/// adapters can honor the configured terminators, EOI mode, and timeout
/// without holding their own copy of the table.
#[async_trait]
pub trait GpibBus: Send + Sync {
    /// Interface name used in error messages and logs.
    fn name(&self) -> &str;

    /// Prepare a device at `address` for use. Called only on the first
    /// open reference.
    async fn open_device(&self, address: GpibAddress, state: &AddressState) -> Result<()> {
        let _ = (address, state);
        Ok(())
    }

    /// Release a device at `address`. Called only when the last open
    /// reference goes away. Adapters that query the controller on close
    /// may write refreshed configuration back into `state`.
    async fn close_device(&self, address: GpibAddress, state: &mut AddressState) -> Result<()> {
        let _ = (address, state);
        Ok(())
    }

    /// Read up to `max_len` bytes from the device at `address`.
    async fn read(
        &self,
        address: GpibAddress,
        max_len: usize,
        flags: TransferFlags,
        state: &AddressState,
    ) -> Result<Vec<u8>>;

    /// Write `data` to the device at `address`, returning the number of
    /// bytes transferred (including any terminator the adapter appended).
    async fn write(
        &self,
        address: GpibAddress,
        data: &[u8],
        flags: TransferFlags,
        state: &AddressState,
    ) -> Result<usize>;

    /// Pulse the IFC line, resetting the bus.
    async fn interface_clear(&self) -> Result<()> {
        Err(GpibError::unsupported(self.name(), "interface clear"))
    }

    /// Clear every device on the bus (DCL).
    async fn device_clear(&self) -> Result<()> {
        Err(GpibError::unsupported(self.name(), "device clear"))
    }

    /// Clear one device (SDC).
    async fn selective_device_clear(&self, address: GpibAddress) -> Result<()> {
        let _ = address;
        Err(GpibError::unsupported(self.name(), "selective device clear"))
    }

    /// Assert local lockout (LLO) so front panels stop accepting input.
    async fn local_lockout(&self) -> Result<()> {
        Err(GpibError::unsupported(self.name(), "local lockout"))
    }

    /// Put a device under remote control (REN).
    async fn remote_enable(&self, address: GpibAddress) -> Result<()> {
        let _ = address;
        Err(GpibError::unsupported(self.name(), "remote enable"))
    }

    /// Return a device to front-panel control (GTL).
    async fn go_to_local(&self, address: GpibAddress) -> Result<()> {
        let _ = address;
        Err(GpibError::unsupported(self.name(), "go to local"))
    }

    /// Send a group execute trigger to a device (GET).
    async fn trigger(&self, address: GpibAddress) -> Result<()> {
        let _ = address;
        Err(GpibError::unsupported(self.name(), "trigger"))
    }

    /// Block until some device asserts SRQ, or the timeout expires.
    async fn wait_for_service_request(&self, timeout: Duration) -> Result<()> {
        let _ = timeout;
        Err(GpibError::unsupported(
            self.name(),
            "wait for service request",
        ))
    }

    /// Serial-poll one device and return its status byte.
    async fn serial_poll(&self, address: GpibAddress) -> Result<u8> {
        let _ = address;
        Err(GpibError::unsupported(self.name(), "serial poll"))
    }

    /// End a serial-poll sequence (SPD).
    async fn serial_poll_disable(&self) -> Result<()> {
        Err(GpibError::unsupported(self.name(), "serial poll disable"))
    }
}
