//! Generic GPIB dispatcher: reference-counted opens, line-oriented I/O,
//! and pass-through of the bus-control verbs.

use crate::address::{GpibAddress, Termination, TransferFlags, PRIMARY_ADDRESS_COUNT};
use crate::bus::GpibBus;
use crate::config::{AddressState, GpibSettings};
use crate::error::{GpibError, Result};
use parking_lot::Mutex;
use std::time::Duration;
use tracing::debug;

/// Default capacity used by the line-oriented read helpers.
pub const DEFAULT_BUFFER_LENGTH: usize = 4096;

struct InterfaceState {
    slots: Vec<AddressState>,
    last_bytes_read: usize,
    last_bytes_written: usize,
    last_read_ascii: bool,
    last_write_ascii: bool,
}

/// A bus adapter plus the per-address bookkeeping shared by every caller.
///
/// The interface owns its adapter exclusively. The per-address table keeps
/// an open reference count so several device drivers can share one bus:
/// the adapter's `open_device`/`close_device` run only when the count
/// crosses the 0/1 boundary. Serialization of whole command/response
/// transactions on a shared address remains the caller's responsibility.
pub struct GpibInterface {
    bus: Box<dyn GpibBus>,
    settings: GpibSettings,
    state: Mutex<InterfaceState>,
}

impl GpibInterface {
    pub fn new(bus: Box<dyn GpibBus>, settings: GpibSettings) -> Self {
        let slots = (0..PRIMARY_ADDRESS_COUNT)
            .map(|_| AddressState::from_settings(&settings))
            .collect();
        Self {
            bus,
            settings,
            state: Mutex::new(InterfaceState {
                slots,
                last_bytes_read: 0,
                last_bytes_written: 0,
                last_read_ascii: false,
                last_write_ascii: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        self.bus.name()
    }

    /// The interface-wide defaults this bus was created with.
    pub fn settings(&self) -> &GpibSettings {
        &self.settings
    }

    /// Snapshot of the configuration for one address.
    pub fn address_state(&self, address: GpibAddress) -> AddressState {
        self.state.lock().slots[address.index()].clone()
    }

    pub fn set_io_timeout(&self, address: GpibAddress, timeout: Option<Duration>) {
        self.state.lock().slots[address.index()].io_timeout = timeout;
    }

    pub fn set_eoi_mode(&self, address: GpibAddress, eoi_mode: bool) {
        self.state.lock().slots[address.index()].eoi_mode = eoi_mode;
    }

    pub fn set_terminators(&self, address: GpibAddress, read: Termination, write: Termination) {
        let mut state = self.state.lock();
        let slot = &mut state.slots[address.index()];
        slot.read_terminator = read;
        slot.write_terminator = write;
    }

    /// Bytes transferred by the most recent read, including the implied
    /// string terminator for line reads.
    pub fn last_bytes_read(&self) -> usize {
        self.state.lock().last_bytes_read
    }

    pub fn last_bytes_written(&self) -> usize {
        self.state.lock().last_bytes_written
    }

    /// Whether the most recent read went through the line-oriented path.
    pub fn last_read_was_ascii(&self) -> bool {
        self.state.lock().last_read_ascii
    }

    /// Whether the most recent write went through the line-oriented path.
    pub fn last_write_was_ascii(&self) -> bool {
        self.state.lock().last_write_ascii
    }

    /// Open a device, taking one reference on its address.
    ///
    /// The adapter's underlying open runs only when the reference count
    /// goes from zero to one; if it fails the count stays at zero.
    pub async fn open_device(&self, address: GpibAddress) -> Result<()> {
        let snapshot = {
            let mut state = self.state.lock();
            let slot = &mut state.slots[address.index()];
            if slot.open_count > 0 {
                slot.open_count += 1;
                return Ok(());
            }
            slot.clone()
        };

        match self.bus.open_device(address, &snapshot).await {
            Ok(()) => {
                self.state.lock().slots[address.index()].open_count = 1;
                Ok(())
            }
            Err(e) => {
                self.state.lock().slots[address.index()].open_count = 0;
                Err(e)
            }
        }
    }

    /// Drop one reference on an address, closing the device when the last
    /// reference goes away. Closing an address that is not open fails with
    /// a device I/O error rather than silently succeeding.
    pub async fn close_device(&self, address: GpibAddress) -> Result<()> {
        let snapshot = {
            let mut state = self.state.lock();
            let slot = &mut state.slots[address.index()];
            if slot.open_count > 1 {
                slot.open_count -= 1;
                return Ok(());
            }
            if slot.open_count == 0 {
                return Err(GpibError::device_io(
                    self.name(),
                    format!(
                        "attempted to close GPIB address {address} when it was already closed"
                    ),
                ));
            }
            slot.clone()
        };

        let mut refreshed = snapshot;
        let result = self.bus.close_device(address, &mut refreshed).await;

        let mut state = self.state.lock();
        let slot = &mut state.slots[address.index()];
        *slot = refreshed;
        slot.open_count = 0;

        result
    }

    /// Raw byte read from a device.
    pub async fn read(
        &self,
        address: GpibAddress,
        max_len: usize,
        flags: TransferFlags,
    ) -> Result<Vec<u8>> {
        let snapshot = self.address_state(address);
        let data = self.bus.read(address, max_len, flags, &snapshot).await?;

        let mut state = self.state.lock();
        state.last_bytes_read = data.len();
        state.last_read_ascii = false;
        Ok(data)
    }

    /// Raw byte write to a device.
    pub async fn write(
        &self,
        address: GpibAddress,
        data: &[u8],
        flags: TransferFlags,
    ) -> Result<usize> {
        let snapshot = self.address_state(address);
        let written = self.bus.write(address, data, flags, &snapshot).await?;

        let mut state = self.state.lock();
        state.last_bytes_written = written;
        state.last_write_ascii = false;
        Ok(written)
    }

    /// Read one ASCII line from a device.
    ///
    /// The adapter strips the line terminator according to its EOS/EOI
    /// configuration; what comes back here is the bare text.
    pub async fn get_line(&self, address: GpibAddress, flags: TransferFlags) -> Result<String> {
        self.get_line_max(address, DEFAULT_BUFFER_LENGTH, flags).await
    }

    pub async fn get_line_max(
        &self,
        address: GpibAddress,
        max_len: usize,
        flags: TransferFlags,
    ) -> Result<String> {
        let snapshot = self.address_state(address);
        let data = self.bus.read(address, max_len, flags, &snapshot).await?;
        let len = data.len();

        let line = String::from_utf8(data).map_err(|e| {
            GpibError::device_io(
                self.name(),
                format!("response from GPIB address {address} is not valid text: {e}"),
            )
        })?;

        if flags.debug {
            debug!(interface = self.name(), %address, line = %line, "get_line");
        }

        let mut state = self.state.lock();
        state.last_bytes_read = len + 1;
        state.last_read_ascii = true;
        Ok(line)
    }

    /// Write one ASCII line to a device. The adapter supplies the line
    /// terminator, so the caller passes bare text.
    pub async fn put_line(
        &self,
        address: GpibAddress,
        line: &str,
        flags: TransferFlags,
    ) -> Result<usize> {
        if flags.debug {
            debug!(interface = self.name(), %address, line = %line, "put_line");
        }

        let snapshot = self.address_state(address);
        let written = self
            .bus
            .write(address, line.as_bytes(), flags, &snapshot)
            .await?;

        let mut state = self.state.lock();
        state.last_bytes_written = written;
        state.last_write_ascii = true;
        Ok(written)
    }

    pub async fn interface_clear(&self) -> Result<()> {
        self.bus.interface_clear().await
    }

    pub async fn device_clear(&self) -> Result<()> {
        self.bus.device_clear().await
    }

    pub async fn selective_device_clear(&self, address: GpibAddress) -> Result<()> {
        self.bus.selective_device_clear(address).await
    }

    pub async fn local_lockout(&self) -> Result<()> {
        self.bus.local_lockout().await
    }

    pub async fn remote_enable(&self, address: GpibAddress) -> Result<()> {
        self.bus.remote_enable(address).await
    }

    pub async fn go_to_local(&self, address: GpibAddress) -> Result<()> {
        self.bus.go_to_local(address).await
    }

    pub async fn trigger(&self, address: GpibAddress) -> Result<()> {
        self.bus.trigger(address).await
    }

    pub async fn wait_for_service_request(&self, timeout: Duration) -> Result<()> {
        self.bus.wait_for_service_request(timeout).await
    }

    pub async fn serial_poll(&self, address: GpibAddress) -> Result<u8> {
        self.bus.serial_poll(address).await
    }

    pub async fn serial_poll_disable(&self) -> Result<()> {
        self.bus.serial_poll_disable().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GpibErrorKind;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts underlying open/close invocations and loops writes back to
    /// reads through an in-memory queue, honoring the terminator config.
    struct LoopbackBus {
        opens: AtomicUsize,
        closes: AtomicUsize,
        fail_open: bool,
        queue: Mutex<VecDeque<u8>>,
    }

    impl LoopbackBus {
        fn new() -> Self {
            Self {
                opens: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
                fail_open: false,
                queue: Mutex::new(VecDeque::new()),
            }
        }

        fn failing() -> Self {
            Self {
                fail_open: true,
                ..Self::new()
            }
        }
    }

    #[async_trait]
    impl GpibBus for LoopbackBus {
        fn name(&self) -> &str {
            "loopback"
        }

        async fn open_device(&self, _address: GpibAddress, _state: &AddressState) -> Result<()> {
            if self.fail_open {
                return Err(GpibError::device_io("loopback", "no device present"));
            }
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close_device(
            &self,
            _address: GpibAddress,
            _state: &mut AddressState,
        ) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn read(
            &self,
            _address: GpibAddress,
            max_len: usize,
            _flags: TransferFlags,
            state: &AddressState,
        ) -> Result<Vec<u8>> {
            let mut queue = self.queue.lock();
            let terminator = state.read_terminator.last_byte();
            let mut out = Vec::new();
            while out.len() < max_len {
                match queue.pop_front() {
                    Some(b) if Some(b) == terminator => return Ok(out),
                    Some(b) => out.push(b),
                    None => break,
                }
            }
            Ok(out)
        }

        async fn write(
            &self,
            _address: GpibAddress,
            data: &[u8],
            _flags: TransferFlags,
            state: &AddressState,
        ) -> Result<usize> {
            let mut queue = self.queue.lock();
            queue.extend(data.iter().copied());
            let term = state.write_terminator.bytes();
            queue.extend(term.iter().copied());
            Ok(data.len() + term.len())
        }
    }

    fn interface(bus: LoopbackBus) -> GpibInterface {
        GpibInterface::new(Box::new(bus), GpibSettings::default())
    }

    fn addr(n: u8) -> GpibAddress {
        GpibAddress::try_from(n).unwrap()
    }

    #[tokio::test]
    async fn open_close_returns_count_to_zero() {
        let iface = interface(LoopbackBus::new());
        for address in GpibAddress::all() {
            iface.open_device(address).await.unwrap();
            assert_eq!(iface.address_state(address).open_count(), 1);
            iface.close_device(address).await.unwrap();
            assert_eq!(iface.address_state(address).open_count(), 0);

            let err = iface.close_device(address).await.unwrap_err();
            assert_eq!(err.kind(), GpibErrorKind::DeviceIo);
        }
    }

    #[tokio::test]
    async fn double_open_opens_underlying_device_once() {
        let bus = LoopbackBus::new();
        let iface = GpibInterface::new(Box::new(bus), GpibSettings::default());
        let address = addr(7);

        iface.open_device(address).await.unwrap();
        iface.open_device(address).await.unwrap();
        assert_eq!(iface.address_state(address).open_count(), 2);

        iface.close_device(address).await.unwrap();
        assert_eq!(iface.address_state(address).open_count(), 1);
        iface.close_device(address).await.unwrap();
        assert_eq!(iface.address_state(address).open_count(), 0);
    }

    #[tokio::test]
    async fn failed_open_leaves_count_at_zero() {
        let iface = interface(LoopbackBus::failing());
        let address = addr(3);

        let err = iface.open_device(address).await.unwrap_err();
        assert_eq!(err.kind(), GpibErrorKind::DeviceIo);
        assert_eq!(iface.address_state(address).open_count(), 0);
    }

    #[tokio::test]
    async fn put_line_get_line_round_trips() {
        let iface = interface(LoopbackBus::new());
        let address = addr(12);

        let written = iface
            .put_line(address, "hello", TransferFlags::NONE)
            .await
            .unwrap();
        assert_eq!(written, 6); // five bytes plus the LF terminator

        let line = iface.get_line(address, TransferFlags::NONE).await.unwrap();
        assert_eq!(line, "hello");

        // Nothing left over: the terminator was neither duplicated nor lost.
        let rest = iface.read(address, 64, TransferFlags::NONE).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn byte_counters_track_last_transfer() {
        let iface = interface(LoopbackBus::new());
        let address = addr(1);

        iface
            .put_line(address, "abc", TransferFlags::NONE)
            .await
            .unwrap();
        assert_eq!(iface.last_bytes_written(), 4);

        let line = iface.get_line(address, TransferFlags::NONE).await.unwrap();
        assert_eq!(line, "abc");
        assert_eq!(iface.last_bytes_read(), 4);
        assert!(iface.last_read_was_ascii());

        iface
            .write(address, b"raw", TransferFlags::NONE)
            .await
            .unwrap();
        assert!(!iface.last_write_was_ascii());
    }

    #[tokio::test]
    async fn unsupported_verbs_surface_the_error_kind() {
        let iface = interface(LoopbackBus::new());
        let err = iface.local_lockout().await.unwrap_err();
        assert_eq!(err.kind(), GpibErrorKind::Unsupported);
    }
}
