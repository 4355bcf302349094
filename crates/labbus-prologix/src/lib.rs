//! Prologix GPIB-USB / GPIB-Ethernet controller driver.
//!
//! The Prologix controllers expose a GPIB bus through a serial stream
//! using `++`-prefixed controller commands; anything not starting with
//! `++` is forwarded to the currently addressed instrument. This driver
//! runs the controller in System Controller mode with automatic
//! Read-After-Write, so a plain line read returns the addressed
//! instrument's response.
//!
//! Reference: Prologix GPIB-USB controller user manual, rev 6.0.

use async_trait::async_trait;
use futures::future::BoxFuture;
use labbus_core::serial::{
    drain_serial_buffer, open_serial_async, read_line, wrap_shared, write_line, SerialError,
    SharedPort,
};
use labbus_core::{
    AddressState, BusFactory, GpibAddress, GpibBus, GpibError, GpibInterface, GpibSettings,
    Result, Termination, TransferFlags,
};
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

const ESC: u8 = 0x1b;
const CR: u8 = 0x0d;
const LF: u8 = 0x0a;

/// Longest read timeout the controller's `++read_tmo_ms` register accepts.
const MAX_READ_TIMEOUT_MS: u64 = 4000;

/// Pause between SRQ line polls.
const SRQ_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Configuration for a Prologix controller.
#[derive(Debug, Clone, Deserialize)]
pub struct PrologixConfig {
    /// Serial device path (e.g. "/dev/ttyUSB0").
    pub device: String,
    /// Baud rate; the USB controller ignores it but the setting must be
    /// valid for the OS to open the port.
    #[serde(default = "default_baud")]
    pub baud: u32,
    /// Interface name used in errors and logs.
    #[serde(default = "default_name")]
    pub name: String,
    /// Bus-wide GPIB defaults.
    #[serde(default)]
    pub gpib: GpibSettings,
}

fn default_baud() -> u32 {
    115200
}

fn default_name() -> String {
    "prologix".to_string()
}

/// Factory for [`PrologixBus`] interfaces.
pub struct PrologixFactory;

impl BusFactory for PrologixFactory {
    fn bus_type(&self) -> &'static str {
        "prologix"
    }

    fn name(&self) -> &'static str {
        "Prologix GPIB-USB/GPIB-Ethernet controller"
    }

    fn validate(&self, config: &toml::Value) -> anyhow::Result<()> {
        let _: PrologixConfig = config.clone().try_into()?;
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, anyhow::Result<Arc<GpibInterface>>> {
        Box::pin(async move {
            let cfg: PrologixConfig = config.try_into()?;
            let port = open_serial_async(&cfg.device, cfg.baud, "Prologix").await?;
            let bus =
                PrologixBus::open(cfg.name.clone(), wrap_shared(Box::new(port)), &cfg.gpib).await?;
            Ok(Arc::new(GpibInterface::new(Box::new(bus), cfg.gpib)))
        })
    }
}

/// Bus adapter for a Prologix controller in System Controller mode.
pub struct PrologixBus {
    name: String,
    port: SharedPort,
    read_timeout: Option<Duration>,
    /// Address most recently selected with `++addr`, so consecutive
    /// transactions with one instrument skip the reselect.
    current_address: Mutex<Option<GpibAddress>>,
}

impl std::fmt::Debug for PrologixBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrologixBus")
            .field("name", &self.name)
            .field("read_timeout", &self.read_timeout)
            .finish_non_exhaustive()
    }
}

impl PrologixBus {
    /// Run the controller initialization sequence over an already open
    /// port and return the ready adapter.
    pub async fn open(name: String, port: SharedPort, settings: &GpibSettings) -> Result<Self> {
        let bus = Self {
            name,
            port,
            read_timeout: settings.io_timeout,
            current_address: Mutex::new(None),
        };

        {
            let mut guard = bus.port.lock().await;
            let discarded = drain_serial_buffer(guard.get_mut(), 50).await;
            if discarded > 0 {
                debug!(interface = %bus.name, discarded, "discarded stale input");
            }
        }

        // Become the System Controller and let the controller read the
        // instrument's answer back to us after every write.
        bus.controller_command("++mode 1").await?;
        bus.controller_command("++auto 1").await?;

        let timeout_ms = settings
            .io_timeout
            .map(|t| t.as_millis() as u64)
            .unwrap_or(MAX_READ_TIMEOUT_MS);
        if timeout_ms > MAX_READ_TIMEOUT_MS {
            return Err(GpibError::would_exceed_limit(
                &bus.name,
                format!(
                    "the requested default I/O timeout of {timeout_ms} ms exceeds the \
                     controller maximum of {MAX_READ_TIMEOUT_MS} ms"
                ),
            ));
        }
        bus.controller_command(&format!("++read_tmo_ms {timeout_ms}"))
            .await?;

        if settings.eoi_mode {
            bus.controller_command("++eoi 1").await?;
        } else {
            bus.controller_command("++eoi 0").await?;
        }

        // Do not append a character when EOI is detected during a read,
        // and terminate outgoing GPIB messages with LF.
        bus.controller_command("++eot_enable 0").await?;
        bus.controller_command("++eos 2").await?;

        {
            let mut guard = bus.port.lock().await;
            drain_serial_buffer(guard.get_mut(), 50).await;
        }

        let version = bus.controller_query("++ver").await?;
        if !version.starts_with("Prologix") {
            return Err(GpibError::configuration(
                &bus.name,
                format!(
                    "the attached device is not a Prologix controller; \
                     its response to '++ver' was '{version}'"
                ),
            ));
        }
        debug!(interface = %bus.name, version = %version, "controller identified");

        Ok(bus)
    }

    fn map_serial(&self, e: SerialError) -> GpibError {
        match e {
            SerialError::TimedOut => GpibError::timed_out(&self.name, "serial read timed out"),
            other => GpibError::interface_io(&self.name, other.to_string()),
        }
    }

    async fn controller_command(&self, command: &str) -> Result<()> {
        let mut guard = self.port.lock().await;
        write_line(guard.get_mut(), Termination::CRLF, command)
            .await
            .map_err(|e| self.map_serial(e))?;
        Ok(())
    }

    async fn controller_query(&self, command: &str) -> Result<String> {
        let mut guard = self.port.lock().await;
        write_line(guard.get_mut(), Termination::CRLF, command)
            .await
            .map_err(|e| self.map_serial(e))?;
        read_line(&mut guard, Termination::CRLF, self.read_timeout)
            .await
            .map_err(|e| self.map_serial(e))
    }

    /// Select `address` as the current talker/listener, skipping the
    /// command when the controller is already pointed there.
    async fn update_address(&self, address: GpibAddress) -> Result<()> {
        let already_current = *self.current_address.lock() == Some(address);
        if !already_current {
            self.controller_command(&format!("++addr {address}")).await?;
        }
        *self.current_address.lock() = Some(address);
        Ok(())
    }

    /// Escape ESC, CR, and LF bytes so the controller forwards them as
    /// data instead of treating them as command framing.
    fn escape_payload(data: &[u8]) -> Vec<u8> {
        let mut escaped = Vec::with_capacity(data.len());
        for &byte in data {
            if matches!(byte, ESC | CR | LF) {
                escaped.push(ESC);
            }
            escaped.push(byte);
        }
        escaped
    }
}

#[async_trait]
impl GpibBus for PrologixBus {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(
        &self,
        address: GpibAddress,
        max_len: usize,
        flags: TransferFlags,
        state: &AddressState,
    ) -> Result<Vec<u8>> {
        self.update_address(address).await?;

        let timeout = state.io_timeout.or(self.read_timeout);
        let line = {
            let mut guard = self.port.lock().await;
            read_line(&mut guard, state.read_terminator, timeout)
                .await
                .map_err(|e| self.map_serial(e))?
        };

        if flags.debug {
            debug!(interface = %self.name, %address, line = %line, "read");
        }

        let mut bytes = line.into_bytes();
        bytes.truncate(max_len);
        Ok(bytes)
    }

    async fn write(
        &self,
        address: GpibAddress,
        data: &[u8],
        flags: TransferFlags,
        _state: &AddressState,
    ) -> Result<usize> {
        if flags.debug {
            debug!(
                interface = %self.name,
                %address,
                payload = %String::from_utf8_lossy(data),
                "write"
            );
        }

        self.update_address(address).await?;

        let escaped = Self::escape_payload(data);
        let mut guard = self.port.lock().await;
        guard
            .get_mut()
            .write_all(&escaped)
            .await
            .map_err(|e| GpibError::interface_io(&self.name, e.to_string()))?;
        write_line(guard.get_mut(), Termination::CRLF, "")
            .await
            .map_err(|e| self.map_serial(e))?;

        Ok(escaped.len() + 2)
    }

    async fn interface_clear(&self) -> Result<()> {
        *self.current_address.lock() = None;
        self.controller_command("++ifc").await
    }

    async fn device_clear(&self) -> Result<()> {
        // The controller has no bus-wide clear, so sweep a selective
        // clear across every address, ignoring per-address failures.
        for address in GpibAddress::all() {
            let _ = self.selective_device_clear(address).await;
        }
        Ok(())
    }

    async fn selective_device_clear(&self, address: GpibAddress) -> Result<()> {
        self.update_address(address).await?;
        self.controller_command("++clr").await
    }

    async fn go_to_local(&self, address: GpibAddress) -> Result<()> {
        self.update_address(address).await?;
        self.controller_command("++loc").await
    }

    async fn trigger(&self, address: GpibAddress) -> Result<()> {
        self.controller_command(&format!("++trg {address}")).await
    }

    async fn wait_for_service_request(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let response = self.controller_query("++srq").await?;
            let srq_asserted: i32 = response.trim().parse().map_err(|_| {
                GpibError::interface_io(
                    &self.name,
                    format!("the SRQ status was not found in the '++srq' response '{response}'"),
                )
            })?;

            if srq_asserted != 0 {
                return Ok(());
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(GpibError::timed_out(
                    &self.name,
                    format!(
                        "timed out after waiting {:.3} seconds for the SRQ line to be asserted",
                        timeout.as_secs_f64()
                    ),
                ));
            }

            tokio::time::sleep(SRQ_POLL_INTERVAL).await;
        }
    }

    async fn serial_poll(&self, address: GpibAddress) -> Result<u8> {
        let command = format!("++spoll {address}");
        let response = self.controller_query(&command).await?;
        let value: u16 = response.trim().parse().map_err(|_| {
            GpibError::device_io(
                &self.name,
                format!("serial poll byte not seen in response '{response}' to '{command}'"),
            )
        })?;
        Ok((value & 0xff) as u8)
    }

    async fn serial_poll_disable(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labbus_core::GpibErrorKind;
    use std::sync::Arc as StdArc;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    /// Simulated controller on the far end of a duplex stream. Records
    /// every line it receives and answers the commands that expect a
    /// response.
    fn spawn_controller(host: DuplexStream, log: StdArc<Mutex<Vec<String>>>) {
        tokio::spawn(async move {
            let (read_half, mut write_half) = tokio::io::split(host);
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();

            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                let trimmed = line.trim_end_matches(['\r', '\n']).to_string();
                log.lock().push(trimmed.clone());

                // Controller responses end CR LF; instrument data comes
                // back with the configured GPIB terminator (LF).
                let reply: Option<String> = if trimmed == "++ver" {
                    Some("Prologix GPIB-USB version 6.107\r\n".to_string())
                } else if trimmed == "++srq" {
                    Some("0\r\n".to_string())
                } else if trimmed.starts_with("++spoll") {
                    Some("72\r\n".to_string())
                } else if trimmed.starts_with("++") || trimmed.is_empty() {
                    None
                } else {
                    // Addressed instrument: answer any payload.
                    Some("MOCK,INSTR,0,1\n".to_string())
                };

                if let Some(reply) = reply {
                    let _ = write_half.write_all(reply.as_bytes()).await;
                }
            }
        });
    }

    async fn open_test_bus() -> (PrologixBus, StdArc<Mutex<Vec<String>>>) {
        let (host, device) = tokio::io::duplex(4096);
        let log = StdArc::new(Mutex::new(Vec::new()));
        spawn_controller(host, log.clone());

        let settings = GpibSettings {
            io_timeout: Some(Duration::from_millis(500)),
            ..GpibSettings::default()
        };
        let bus = PrologixBus::open("prologix0".into(), wrap_shared(Box::new(device)), &settings)
            .await
            .unwrap();
        (bus, log)
    }

    fn addr(n: u8) -> GpibAddress {
        GpibAddress::try_from(n).unwrap()
    }

    fn state() -> AddressState {
        AddressState::new(&GpibSettings {
            io_timeout: Some(Duration::from_millis(500)),
            ..GpibSettings::default()
        })
    }

    #[tokio::test]
    async fn open_runs_the_initialization_sequence() {
        let (_bus, log) = open_test_bus().await;
        let log = log.lock().clone();
        assert_eq!(
            log,
            vec![
                "++mode 1",
                "++auto 1",
                "++read_tmo_ms 500",
                "++eoi 1",
                "++eot_enable 0",
                "++eos 2",
                "++ver",
            ]
        );
    }

    #[tokio::test]
    async fn open_rejects_overlong_timeout() {
        let (host, device) = tokio::io::duplex(4096);
        let log = StdArc::new(Mutex::new(Vec::new()));
        spawn_controller(host, log);

        let settings = GpibSettings {
            io_timeout: Some(Duration::from_secs(10)),
            ..GpibSettings::default()
        };
        let err = PrologixBus::open("prologix0".into(), wrap_shared(Box::new(device)), &settings)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), GpibErrorKind::WouldExceedLimit);
    }

    #[tokio::test]
    async fn address_select_is_sent_only_on_change() {
        let (bus, log) = open_test_bus().await;
        let st = state();

        bus.write(addr(5), b"*IDN?", TransferFlags::NONE, &st)
            .await
            .unwrap();
        let response = bus.read(addr(5), 256, TransferFlags::NONE, &st).await.unwrap();
        assert_eq!(response, b"MOCK,INSTR,0,1");

        bus.write(addr(5), b"*IDN?", TransferFlags::NONE, &st)
            .await
            .unwrap();
        bus.write(addr(9), b"*IDN?", TransferFlags::NONE, &st)
            .await
            .unwrap();

        let selects: Vec<_> = log
            .lock()
            .iter()
            .filter(|l| l.starts_with("++addr"))
            .cloned()
            .collect();
        assert_eq!(selects, vec!["++addr 5", "++addr 9"]);
    }

    #[tokio::test]
    async fn interface_clear_invalidates_the_address_cache() {
        let (bus, log) = open_test_bus().await;
        let st = state();

        bus.write(addr(4), b"*CLS", TransferFlags::NONE, &st)
            .await
            .unwrap();
        bus.interface_clear().await.unwrap();
        bus.write(addr(4), b"*CLS", TransferFlags::NONE, &st)
            .await
            .unwrap();

        let selects = log
            .lock()
            .iter()
            .filter(|l| l.as_str() == "++addr 4")
            .count();
        assert_eq!(selects, 2);
    }

    #[tokio::test]
    async fn srq_wait_times_out() {
        let (bus, _log) = open_test_bus().await;

        let err = bus
            .wait_for_service_request(Duration::from_millis(40))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), GpibErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn serial_poll_parses_the_status_byte() {
        let (bus, _log) = open_test_bus().await;
        let byte = bus.serial_poll(addr(11)).await.unwrap();
        assert_eq!(byte, 72);
    }

    #[tokio::test]
    async fn payload_escaping_protects_framing_bytes() {
        let escaped = PrologixBus::escape_payload(b"A\rB\nC\x1bD");
        assert_eq!(escaped, b"A\x1b\rB\x1b\nC\x1b\x1bD");
    }

    #[tokio::test]
    async fn local_lockout_is_unsupported() {
        let (bus, _log) = open_test_bus().await;
        let err = bus.local_lockout().await.unwrap_err();
        assert_eq!(err.kind(), GpibErrorKind::Unsupported);
    }
}
