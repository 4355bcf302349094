//! IOTech Micro 488/EX RS-232 to GPIB bridge driver.
//!
//! The Micro 488/EX uses plain-English command words over its serial
//! side (`ENTER 05`, `OUTPUT 05;...`, `REMOTE`, `SPOLL 05`) and reports
//! failures through a numeric error register polled with `STATUS 2`.
//! Unless error checking is disabled, every exchange is followed by a
//! status poll and the returned code is translated through the bridge's
//! documented error table.

use async_trait::async_trait;
use futures::future::BoxFuture;
use labbus_core::serial::{
    drain_serial_buffer, open_serial_async, read_line, wrap_shared, write_line, SerialError,
    SharedPort,
};
use labbus_core::{
    AddressState, BusFactory, GpibAddress, GpibBus, GpibError, GpibErrorKind, GpibInterface,
    GpibSettings, Result, Termination, TransferFlags,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// The bridge's error-code table, indexed by the `STATUS 2` register
/// value. Codes 4 and 5 are reserved by the vendor.
const ERROR_TABLE: [(GpibErrorKind, &str); 21] = [
    (GpibErrorKind::DeviceIo, "OK"),
    (GpibErrorKind::IllegalArgument, "Invalid address"),
    (GpibErrorKind::InterfaceIo, "Invalid command"),
    (GpibErrorKind::NotReady, "Wrong mode"),
    (GpibErrorKind::InterfaceIo, "Unassigned - Reserved"),
    (GpibErrorKind::InterfaceIo, "Unassigned - Reserved"),
    (GpibErrorKind::InterfaceIo, "No macro"),
    (GpibErrorKind::WouldExceedLimit, "Macro overflow"),
    (GpibErrorKind::WouldExceedLimit, "Command overflow"),
    (GpibErrorKind::WouldExceedLimit, "Address overflow"),
    (GpibErrorKind::WouldExceedLimit, "Message overflow"),
    (GpibErrorKind::NotReady, "Not a talker"),
    (GpibErrorKind::NotReady, "Not a listener"),
    (GpibErrorKind::HardwareFault, "Bus error"),
    (GpibErrorKind::TimedOut, "Timeout - Write"),
    (GpibErrorKind::TimedOut, "Timeout - Read"),
    (GpibErrorKind::WouldExceedLimit, "Out of memory"),
    (GpibErrorKind::NotReady, "Macro recursion"),
    (GpibErrorKind::ControllerInternal, "NVRAM failure"),
    (GpibErrorKind::NotReady, "Logging error"),
    (GpibErrorKind::NotReady, "Timer in use"),
];

/// Configuration for a Micro 488/EX bridge.
#[derive(Debug, Clone, Deserialize)]
pub struct Micro488ExConfig {
    /// Serial device path.
    pub device: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default = "default_name")]
    pub name: String,
    /// Skip the `STATUS 2` poll after each command.
    #[serde(default)]
    pub disable_error_checking: bool,
    /// Issue `FACTORY` + `SAVE` during open. Useful for units whose
    /// battery-backed configuration memory has run down.
    #[serde(default)]
    pub restore_factory_defaults: bool,
    #[serde(default)]
    pub gpib: GpibSettings,
}

fn default_baud() -> u32 {
    9600
}

fn default_name() -> String {
    "micro488ex".to_string()
}

/// Factory for [`Micro488ExBus`] interfaces.
pub struct Micro488ExFactory;

impl BusFactory for Micro488ExFactory {
    fn bus_type(&self) -> &'static str {
        "micro488ex"
    }

    fn name(&self) -> &'static str {
        "IOTech Micro 488/EX RS-232/GPIB bridge"
    }

    fn validate(&self, config: &toml::Value) -> anyhow::Result<()> {
        let _: Micro488ExConfig = config.clone().try_into()?;
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, anyhow::Result<Arc<GpibInterface>>> {
        Box::pin(async move {
            let cfg: Micro488ExConfig = config.try_into()?;
            let port = open_serial_async(&cfg.device, cfg.baud, "Micro 488/EX").await?;
            let bus = Micro488ExBus::open(
                cfg.name.clone(),
                wrap_shared(Box::new(port)),
                cfg.disable_error_checking,
                cfg.restore_factory_defaults,
                &cfg.gpib,
            )
            .await?;
            Ok(Arc::new(GpibInterface::new(Box::new(bus), cfg.gpib)))
        })
    }
}

/// Bus adapter for the IOTech Micro 488/EX.
pub struct Micro488ExBus {
    name: String,
    port: SharedPort,
    check_errors: bool,
    read_timeout: Option<Duration>,
}

impl Micro488ExBus {
    /// Run the bridge initialization sequence over an already open port.
    pub async fn open(
        name: String,
        port: SharedPort,
        disable_error_checking: bool,
        restore_factory_defaults: bool,
        settings: &GpibSettings,
    ) -> Result<Self> {
        let bus = Self {
            name,
            port,
            check_errors: !disable_error_checking,
            read_timeout: settings.io_timeout,
        };

        // Select numeric error reporting (or none), before anything that
        // could trip the error register.
        if bus.check_errors {
            bus.send_line("ERROR NUMBER").await?;
        } else {
            bus.send_line("ERROR OFF").await?;
        }
        {
            let mut guard = bus.port.lock().await;
            drain_serial_buffer(guard.get_mut(), 50).await;
        }

        if restore_factory_defaults {
            bus.command("FACTORY", false).await?;
            bus.command("SAVE", false).await?;
        }

        let hello = bus.command("HELLO", true).await?.unwrap_or_default();
        debug!(interface = %bus.name, version = %hello, "bridge identified");

        Ok(bus)
    }

    fn map_serial(&self, e: SerialError) -> GpibError {
        match e {
            SerialError::TimedOut => GpibError::timed_out(&self.name, "serial read timed out"),
            other => GpibError::interface_io(&self.name, other.to_string()),
        }
    }

    async fn send_line(&self, command: &str) -> Result<()> {
        let mut guard = self.port.lock().await;
        write_line(guard.get_mut(), Termination::CRLF, command)
            .await
            .map_err(|e| self.map_serial(e))?;
        Ok(())
    }

    async fn receive_line(&self, timeout: Option<Duration>) -> Result<String> {
        let mut guard = self.port.lock().await;
        read_line(&mut guard, Termination::CRLF, timeout.or(self.read_timeout))
            .await
            .map_err(|e| self.map_serial(e))
    }

    /// Poll the error register and translate a non-zero code.
    async fn check_for_error(&self, command: &str) -> Result<()> {
        self.send_line("STATUS 2").await?;
        let response = self.receive_line(None).await?;

        let code: usize = response
            .split_whitespace()
            .next()
            .and_then(|token| token.parse().ok())
            .ok_or_else(|| {
                GpibError::interface_io(
                    &self.name,
                    format!(
                        "did not find a status code in the 'STATUS 2' response '{response}' \
                         after command '{command}'"
                    ),
                )
            })?;

        if code == 0 {
            return Ok(());
        }

        if code >= ERROR_TABLE.len() {
            return Err(GpibError::interface_io(
                &self.name,
                format!(
                    "the controller returned unrecognized error code {code} \
                     in response to command '{command}'"
                ),
            ));
        }

        let (kind, message) = ERROR_TABLE[code];
        Err(GpibError::new(
            &self.name,
            kind,
            format!(
                "the controller returned error code {code} ({message}) \
                 in response to command '{command}'"
            ),
        ))
    }

    /// Send a command word, optionally read one response line, then poll
    /// the error register unless checking is disabled.
    async fn command(&self, command: &str, want_response: bool) -> Result<Option<String>> {
        self.send_line(command).await?;

        let response = if want_response {
            Some(self.receive_line(None).await?)
        } else {
            None
        };

        if self.check_errors {
            self.check_for_error(command).await?;
        }

        Ok(response)
    }
}

#[async_trait]
impl GpibBus for Micro488ExBus {
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
        let command = format!("ENTER {:02}", address.as_u8());
        self.send_line(&command).await?;

        let line = self.receive_line(state.io_timeout).await?;
        if flags.debug {
            debug!(interface = %self.name, %address, line = %line, "read");
        }

        if self.check_errors {
            self.check_for_error(&command).await?;
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

        let prefix = format!("OUTPUT {:02};", address.as_u8());

        {
            let mut guard = self.port.lock().await;
            guard
                .get_mut()
                .write_all(prefix.as_bytes())
                .await
                .map_err(|e| GpibError::interface_io(&self.name, e.to_string()))?;
            guard
                .get_mut()
                .write_all(data)
                .await
                .map_err(|e| GpibError::interface_io(&self.name, e.to_string()))?;
            guard
                .get_mut()
                .write_all(b"\r\n")
                .await
                .map_err(|e| GpibError::interface_io(&self.name, e.to_string()))?;
            guard
                .get_mut()
                .flush()
                .await
                .map_err(|e| GpibError::interface_io(&self.name, e.to_string()))?;
        }

        if self.check_errors {
            self.check_for_error(&String::from_utf8_lossy(data)).await?;
        }

        Ok(prefix.len() + data.len() + 2)
    }

    async fn interface_clear(&self) -> Result<()> {
        self.command("ABORT", false).await.map(|_| ())
    }

    async fn device_clear(&self) -> Result<()> {
        self.command("CLEAR", false).await.map(|_| ())
    }

    async fn selective_device_clear(&self, address: GpibAddress) -> Result<()> {
        self.command(&format!("CLEAR {:02}", address.as_u8()), false)
            .await
            .map(|_| ())
    }

    async fn local_lockout(&self) -> Result<()> {
        self.command("LOCAL LOCKOUT", false).await.map(|_| ())
    }

    async fn remote_enable(&self, address: GpibAddress) -> Result<()> {
        self.command(&format!("REMOTE {:02}", address.as_u8()), false)
            .await
            .map(|_| ())
    }

    async fn go_to_local(&self, address: GpibAddress) -> Result<()> {
        self.command(&format!("LOCAL {:02}", address.as_u8()), false)
            .await
            .map(|_| ())
    }

    async fn trigger(&self, address: GpibAddress) -> Result<()> {
        self.command(&format!("TRIGGER {:02}", address.as_u8()), false)
            .await
            .map(|_| ())
    }

    async fn wait_for_service_request(&self, _timeout: Duration) -> Result<()> {
        Err(GpibError::not_implemented(
            &self.name,
            "wait for service request",
        ))
    }

    async fn serial_poll(&self, address: GpibAddress) -> Result<u8> {
        let command = format!("SPOLL {:02}", address.as_u8());
        let response = self
            .command(&command, true)
            .await?
            .unwrap_or_default();
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
    use parking_lot::Mutex;
    use std::sync::Arc as StdArc;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    struct BridgeState {
        log: Vec<String>,
        /// Code the mock returns to the next `STATUS 2` polls.
        status_code: u32,
    }

    fn spawn_bridge(host: DuplexStream, state: StdArc<Mutex<BridgeState>>) {
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
                let trimmed = line.trim_matches(|c| c == '\r' || c == '\n').to_string();
                if trimmed.is_empty() {
                    continue;
                }

                let reply: Option<String> = {
                    let mut state = state.lock();
                    state.log.push(trimmed.clone());
                    if trimmed == "STATUS 2" {
                        Some(format!("{} 0 0", state.status_code))
                    } else if trimmed == "HELLO" {
                        Some("Micro 488/EX Rev 3.1".to_string())
                    } else if trimmed.starts_with("ENTER") {
                        Some("DATA42".to_string())
                    } else if trimmed.starts_with("SPOLL") {
                        Some("80".to_string())
                    } else {
                        None
                    }
                };

                if let Some(reply) = reply {
                    let _ = write_half
                        .write_all(format!("{reply}\r\n").as_bytes())
                        .await;
                }
            }
        });
    }

    async fn open_test_bus(check_errors: bool) -> (Micro488ExBus, StdArc<Mutex<BridgeState>>) {
        let (host, device) = tokio::io::duplex(4096);
        let state = StdArc::new(Mutex::new(BridgeState {
            log: Vec::new(),
            status_code: 0,
        }));
        spawn_bridge(host, state.clone());

        let settings = GpibSettings {
            io_timeout: Some(Duration::from_millis(200)),
            ..GpibSettings::default()
        };
        let bus = Micro488ExBus::open(
            "m488".into(),
            wrap_shared(Box::new(device)),
            !check_errors,
            false,
            &settings,
        )
        .await
        .unwrap();
        (bus, state)
    }

    fn addr(n: u8) -> GpibAddress {
        GpibAddress::try_from(n).unwrap()
    }

    fn addr_state() -> AddressState {
        AddressState::new(&GpibSettings {
            io_timeout: Some(Duration::from_millis(200)),
            ..GpibSettings::default()
        })
    }

    #[tokio::test]
    async fn open_selects_error_reporting_and_greets() {
        let (_bus, state) = open_test_bus(true).await;
        let log = state.lock().log.clone();
        assert_eq!(log, vec!["ERROR NUMBER", "HELLO", "STATUS 2"]);
    }

    #[tokio::test]
    async fn read_enters_the_device_and_checks_status() {
        let (bus, state) = open_test_bus(true).await;
        let data = bus
            .read(addr(5), 256, TransferFlags::NONE, &addr_state())
            .await
            .unwrap();
        assert_eq!(data, b"DATA42");

        let log = state.lock().log.clone();
        assert!(log.contains(&"ENTER 05".to_string()));
        assert_eq!(log.last().unwrap(), "STATUS 2");
    }

    #[tokio::test]
    async fn timeout_codes_map_to_timed_out() {
        let (bus, state) = open_test_bus(true).await;
        state.lock().status_code = 15; // "Timeout - Read"

        let err = bus
            .read(addr(5), 256, TransferFlags::NONE, &addr_state())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), GpibErrorKind::TimedOut);
        assert!(err.to_string().contains("error code 15"));
    }

    #[tokio::test]
    async fn unknown_codes_are_bounds_checked() {
        let (bus, state) = open_test_bus(true).await;
        state.lock().status_code = 99;

        let err = bus.trigger(addr(1)).await.unwrap_err();
        assert_eq!(err.kind(), GpibErrorKind::InterfaceIo);
        assert!(err.to_string().contains("unrecognized error code 99"));
    }

    #[tokio::test]
    async fn error_checking_can_be_disabled() {
        let (bus, state) = open_test_bus(false).await;
        state.lock().status_code = 13;

        // With checking off the bad status register is never consulted.
        bus.trigger(addr(1)).await.unwrap();
        let log = state.lock().log.clone();
        assert!(!log.contains(&"STATUS 2".to_string()));
    }

    #[tokio::test]
    async fn write_uses_the_output_prefix() {
        let (bus, state) = open_test_bus(true).await;
        let written = bus
            .write(addr(9), b"*RST", TransferFlags::NONE, &addr_state())
            .await
            .unwrap();
        assert_eq!(written, "OUTPUT 09;".len() + 4 + 2);

        let log = state.lock().log.clone();
        assert!(log.contains(&"OUTPUT 09;*RST".to_string()));
    }

    #[tokio::test]
    async fn serial_poll_parses_the_status_byte() {
        let (bus, _state) = open_test_bus(true).await;
        assert_eq!(bus.serial_poll(addr(2)).await.unwrap(), 80);
    }
}
