//! Keithley 500-SERIAL RS-232 to GPIB bridge driver.
//!
//! The 500-SERIAL speaks a terse two-letter command language over its
//! serial side: `EN;05` addresses device 5 to talk and returns its
//! message, `OA;05;<data>` addresses it to listen and forwards `<data>`,
//! and single letters drive the bus management lines. Serial and GPIB
//! line terminators are limited to the four CR/LF combinations the
//! bridge's `TC`/`TB` registers understand.

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
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Serial flow control used between host and bridge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowControl {
    #[default]
    None,
    Hardware,
    Software,
    Both,
}

/// Configuration for a 500-SERIAL bridge.
#[derive(Debug, Clone, Deserialize)]
pub struct K500SerialConfig {
    /// Serial device path.
    pub device: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub flow_control: FlowControl,
    /// Terminator on the serial side of the bridge (read and write must
    /// be identical, so there is only one setting).
    #[serde(default = "default_serial_terminator")]
    pub serial_terminator: Termination,
    #[serde(default)]
    pub gpib: GpibSettings,
}

fn default_baud() -> u32 {
    9600
}

fn default_name() -> String {
    "k500serial".to_string()
}

fn default_serial_terminator() -> Termination {
    Termination::CRLF
}

/// Factory for [`K500SerialBus`] interfaces.
pub struct K500SerialFactory;

impl BusFactory for K500SerialFactory {
    fn bus_type(&self) -> &'static str {
        "k500serial"
    }

    fn name(&self) -> &'static str {
        "Keithley 500-SERIAL RS-232/GPIB bridge"
    }

    fn validate(&self, config: &toml::Value) -> anyhow::Result<()> {
        let cfg: K500SerialConfig = config.clone().try_into()?;
        terminator_code(&cfg.name, cfg.serial_terminator)?;
        terminator_code(&cfg.name, cfg.gpib.read_terminator)?;
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, anyhow::Result<Arc<GpibInterface>>> {
        Box::pin(async move {
            let cfg: K500SerialConfig = config.try_into()?;
            let port = open_serial_async(&cfg.device, cfg.baud, "500-SERIAL").await?;
            let bus = K500SerialBus::open(
                cfg.name.clone(),
                wrap_shared(Box::new(port)),
                cfg.serial_terminator,
                cfg.flow_control,
                &cfg.gpib,
            )
            .await?;
            Ok(Arc::new(GpibInterface::new(Box::new(bus), cfg.gpib)))
        })
    }
}

/// Map a CR/LF terminator pattern onto the bridge's 1..=4 register codes.
fn terminator_code(name: &str, terminator: Termination) -> Result<u8> {
    match terminator {
        Termination::LF => Ok(1),
        Termination::CR => Ok(2),
        Termination::LFCR => Ok(3),
        Termination::CRLF => Ok(4),
        other => Err(GpibError::illegal_argument(
            name,
            format!(
                "line terminator {:#x} is not compatible with a 500-SERIAL interface",
                other.pattern()
            ),
        )),
    }
}

/// Bus adapter for the Keithley 500-SERIAL bridge.
pub struct K500SerialBus {
    name: String,
    port: SharedPort,
    serial_terminator: Termination,
    read_timeout: Option<Duration>,
}

impl std::fmt::Debug for K500SerialBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("K500SerialBus")
            .field("name", &self.name)
            .field("serial_terminator", &self.serial_terminator)
            .field("read_timeout", &self.read_timeout)
            .finish_non_exhaustive()
    }
}

impl K500SerialBus {
    /// Run the bridge initialization sequence over an already open port.
    pub async fn open(
        name: String,
        port: SharedPort,
        serial_terminator: Termination,
        flow_control: FlowControl,
        settings: &GpibSettings,
    ) -> Result<Self> {
        let bus = Self {
            name,
            port,
            serial_terminator,
            read_timeout: settings.io_timeout,
        };

        let serial_code = terminator_code(&bus.name, serial_terminator)?;

        if settings.read_terminator != settings.write_terminator {
            return Err(GpibError::illegal_argument(
                &bus.name,
                "the GPIB read and write EOS characters must be the same \
                 for a 500-SERIAL interface",
            ));
        }
        let gpib_code = terminator_code(&bus.name, settings.read_terminator)?;

        {
            let mut guard = bus.port.lock().await;
            drain_serial_buffer(guard.get_mut(), 50).await;

            // Let the bridge lock onto our baud rate: five carriage
            // returns separated by 0.1 second gaps.
            tokio::time::sleep(Duration::from_millis(100)).await;
            for _ in 0..5 {
                guard
                    .get_mut()
                    .write_all(b"\r")
                    .await
                    .map_err(|e| GpibError::interface_io(&bus.name, e.to_string()))?;
                guard
                    .get_mut()
                    .flush()
                    .await
                    .map_err(|e| GpibError::interface_io(&bus.name, e.to_string()))?;
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            drain_serial_buffer(guard.get_mut(), 50).await;
        }

        bus.bridge_command("I").await?;
        bus.bridge_command("EC;0").await?;

        match flow_control {
            FlowControl::Hardware | FlowControl::Both => bus.bridge_command("H;1").await?,
            _ => bus.bridge_command("H;0").await?,
        }
        match flow_control {
            FlowControl::Software | FlowControl::Both => bus.bridge_command("X;1").await?,
            _ => bus.bridge_command("X;0").await?,
        }

        bus.bridge_command(&format!("TC;{serial_code}")).await?;
        bus.bridge_command(&format!("TB;{gpib_code}")).await?;

        if settings.eoi_mode {
            bus.bridge_command("EO;1").await?;
        } else {
            bus.bridge_command("EO;0").await?;
        }

        // Give the bridge time to act on the configuration, then throw
        // away anything it echoed.
        tokio::time::sleep(Duration::from_millis(500)).await;
        {
            let mut guard = bus.port.lock().await;
            drain_serial_buffer(guard.get_mut(), 50).await;
        }

        Ok(bus)
    }

    fn map_serial(&self, e: SerialError) -> GpibError {
        match e {
            SerialError::TimedOut => GpibError::timed_out(&self.name, "serial read timed out"),
            other => GpibError::interface_io(&self.name, other.to_string()),
        }
    }

    async fn bridge_command(&self, command: &str) -> Result<()> {
        let mut guard = self.port.lock().await;
        write_line(guard.get_mut(), self.serial_terminator, command)
            .await
            .map_err(|e| self.map_serial(e))?;
        Ok(())
    }

    async fn bridge_query(&self, command: &str) -> Result<String> {
        let mut guard = self.port.lock().await;
        write_line(guard.get_mut(), self.serial_terminator, command)
            .await
            .map_err(|e| self.map_serial(e))?;
        read_line(&mut guard, self.serial_terminator, self.read_timeout)
            .await
            .map_err(|e| self.map_serial(e))
    }
}

#[async_trait]
impl GpibBus for K500SerialBus {
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
        let command = format!("EN;{:02}", address.as_u8());

        let mut guard = self.port.lock().await;
        write_line(guard.get_mut(), self.serial_terminator, &command)
            .await
            .map_err(|e| self.map_serial(e))?;

        let timeout = state.io_timeout.or(self.read_timeout);
        let line = read_line(&mut guard, self.serial_terminator, timeout)
            .await
            .map_err(|e| self.map_serial(e))?;

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

        // Output-address prefix, then the payload as one serial line.
        let prefix = format!("OA;{:02};", address.as_u8());

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
        let term = self.serial_terminator.bytes();
        guard
            .get_mut()
            .write_all(&term)
            .await
            .map_err(|e| GpibError::interface_io(&self.name, e.to_string()))?;
        guard
            .get_mut()
            .flush()
            .await
            .map_err(|e| GpibError::interface_io(&self.name, e.to_string()))?;

        Ok(prefix.len() + data.len() + term.len())
    }

    async fn interface_clear(&self) -> Result<()> {
        self.bridge_command("I").await
    }

    async fn device_clear(&self) -> Result<()> {
        self.bridge_command("C").await
    }

    async fn selective_device_clear(&self, address: GpibAddress) -> Result<()> {
        self.bridge_command(&format!("C;{:02}", address.as_u8()))
            .await
    }

    async fn local_lockout(&self) -> Result<()> {
        self.bridge_command("LL").await
    }

    async fn remote_enable(&self, address: GpibAddress) -> Result<()> {
        self.bridge_command(&format!("RE;{:02}", address.as_u8()))
            .await
    }

    async fn go_to_local(&self, address: GpibAddress) -> Result<()> {
        self.bridge_command(&format!("L;{:02}", address.as_u8()))
            .await
    }

    async fn trigger(&self, address: GpibAddress) -> Result<()> {
        self.bridge_command(&format!("TR;{:02}", address.as_u8()))
            .await
    }

    async fn wait_for_service_request(&self, _timeout: Duration) -> Result<()> {
        Err(GpibError::not_implemented(
            &self.name,
            "wait for service request",
        ))
    }

    async fn serial_poll(&self, address: GpibAddress) -> Result<u8> {
        let command = format!("SP;{:02}", address.as_u8());
        let response = self.bridge_query(&command).await?;
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
    use parking_lot::Mutex;
    use std::sync::Arc as StdArc;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    fn spawn_bridge(host: DuplexStream, log: StdArc<Mutex<Vec<String>>>) {
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
                log.lock().push(trimmed.clone());

                let reply: Option<&str> = if trimmed.starts_with("EN;") {
                    Some("+1.234E-6")
                } else if trimmed.starts_with("SP;") {
                    Some("64")
                } else {
                    None
                };
                if let Some(reply) = reply {
                    let _ = write_half
                        .write_all(format!("{reply}\r\n").as_bytes())
                        .await;
                }
            }
        });
    }

    async fn open_test_bus() -> (K500SerialBus, StdArc<Mutex<Vec<String>>>) {
        let (host, device) = tokio::io::duplex(4096);
        let log = StdArc::new(Mutex::new(Vec::new()));
        spawn_bridge(host, log.clone());

        let settings = GpibSettings {
            io_timeout: Some(Duration::from_millis(200)),
            ..GpibSettings::default()
        };
        let bus = K500SerialBus::open(
            "k500".into(),
            wrap_shared(Box::new(device)),
            Termination::CRLF,
            FlowControl::None,
            &settings,
        )
        .await
        .unwrap();
        (bus, log)
    }

    fn addr(n: u8) -> GpibAddress {
        GpibAddress::try_from(n).unwrap()
    }

    fn state() -> AddressState {
        AddressState::new(&GpibSettings {
            io_timeout: Some(Duration::from_millis(200)),
            ..GpibSettings::default()
        })
    }

    #[tokio::test]
    async fn open_runs_the_initialization_sequence() {
        let (_bus, log) = open_test_bus().await;
        let log = log.lock().clone();
        assert_eq!(
            log,
            vec!["I", "EC;0", "H;0", "X;0", "TC;4", "TB;1", "EO;1"]
        );
    }

    #[tokio::test]
    async fn mismatched_gpib_terminators_are_rejected() {
        let (host, device) = tokio::io::duplex(4096);
        let log = StdArc::new(Mutex::new(Vec::new()));
        spawn_bridge(host, log);

        let settings = GpibSettings {
            read_terminator: Termination::LF,
            write_terminator: Termination::CR,
            ..GpibSettings::default()
        };
        let err = K500SerialBus::open(
            "k500".into(),
            wrap_shared(Box::new(device)),
            Termination::CRLF,
            FlowControl::None,
            &settings,
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), GpibErrorKind::IllegalArgument);
    }

    #[tokio::test]
    async fn read_addresses_the_talker_first() {
        let (bus, log) = open_test_bus().await;
        let data = bus
            .read(addr(5), 256, TransferFlags::NONE, &state())
            .await
            .unwrap();
        assert_eq!(data, b"+1.234E-6");
        assert_eq!(log.lock().last().unwrap(), "EN;05");
    }

    #[tokio::test]
    async fn write_sends_output_address_prefix_and_payload() {
        let (bus, log) = open_test_bus().await;
        let written = bus
            .write(addr(7), b"F0X", TransferFlags::NONE, &state())
            .await
            .unwrap();
        // "OA;07;" + payload + CR LF
        assert_eq!(written, 6 + 3 + 2);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(log.lock().last().unwrap(), "OA;07;F0X");
    }

    #[tokio::test]
    async fn bus_management_commands_use_two_letter_codes() {
        let (bus, log) = open_test_bus().await;

        bus.device_clear().await.unwrap();
        bus.selective_device_clear(addr(3)).await.unwrap();
        bus.local_lockout().await.unwrap();
        bus.remote_enable(addr(3)).await.unwrap();
        bus.go_to_local(addr(3)).await.unwrap();
        bus.trigger(addr(3)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let log = log.lock();
        let tail: Vec<_> = log[log.len() - 6..].to_vec();
        assert_eq!(tail, vec!["C", "C;03", "LL", "RE;03", "L;03", "TR;03"]);
    }

    #[tokio::test]
    async fn serial_poll_parses_the_status_byte() {
        let (bus, _log) = open_test_bus().await;
        assert_eq!(bus.serial_poll(addr(9)).await.unwrap(), 64);
    }

    #[tokio::test]
    async fn srq_wait_is_not_implemented() {
        let (bus, _log) = open_test_bus().await;
        let err = bus
            .wait_for_service_request(Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), GpibErrorKind::NotImplemented);
    }
}
