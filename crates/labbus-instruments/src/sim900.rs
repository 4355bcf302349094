//! SRS SIM900 mainframe and its multiplexed module ports.
//!
//! The mainframe routes traffic to up to twelve plug-in modules. Bytes
//! for a module go out as `SNDT p,'...'` (with embedded quotes
//! doubled), and come back through `GETN? p,n`, whose response carries
//! a `#3aaa` prefix: the literal `#3` followed by the three-digit
//! decimal length of the body. Port configuration (`BAUD`, `PARI`,
//! `FLOW`) is passed through to the module slot.

use labbus_core::{GpibAddress, GpibError, GpibInterface, Result, TransferFlags};
use std::sync::Arc;

/// Length of the `#3aaa` prefix on `GETN?` responses.
const GETN_PREFIX_LENGTH: usize = 5;

/// Driver for the SIM900 mainframe itself.
pub struct Sim900 {
    name: String,
    interface: Arc<GpibInterface>,
    address: GpibAddress,
}

impl Sim900 {
    /// Attach to the mainframe, taking an open reference on its address.
    pub async fn open(
        name: impl Into<String>,
        interface: Arc<GpibInterface>,
        address: GpibAddress,
    ) -> Result<Self> {
        interface.open_device(address).await?;
        Ok(Self {
            name: name.into(),
            interface,
            address,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send one command to the mainframe.
    pub async fn command(&self, command: &str) -> Result<()> {
        self.interface
            .put_line(self.address, command, TransferFlags::NONE)
            .await
            .map(|_| ())
    }

    /// Send a query and read its one-line response.
    pub async fn query(&self, command: &str) -> Result<String> {
        self.interface
            .put_line(self.address, command, TransferFlags::NONE)
            .await?;
        self.interface
            .get_line(self.address, TransferFlags::NONE)
            .await
    }

    /// Open one of the mainframe's module ports.
    pub fn port(self: &Arc<Self>, port_name: char) -> Result<Sim900Port> {
        Sim900Port::new(Arc::clone(self), port_name)
    }
}

/// One multiplexed module port on a SIM900.
pub struct Sim900Port {
    mainframe: Arc<Sim900>,
    port_name: char,
    name: String,
}

impl std::fmt::Debug for Sim900Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sim900Port")
            .field("port_name", &self.port_name)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Sim900Port {
    pub fn new(mainframe: Arc<Sim900>, port_name: char) -> Result<Self> {
        if !matches!(port_name, '1'..='9' | 'A'..='D') {
            return Err(GpibError::illegal_argument(
                mainframe.name(),
                format!("'{port_name}' is not a valid SIM900 port name"),
            ));
        }
        let name = format!("{}:{}", mainframe.name(), port_name);
        Ok(Self {
            mainframe,
            port_name,
            name,
        })
    }

    /// Double every single quote so the payload survives the `SNDT`
    /// quoting.
    fn escape(payload: &str) -> String {
        let mut escaped = String::with_capacity(payload.len());
        for c in payload.chars() {
            escaped.push(c);
            if c == '\'' {
                escaped.push('\'');
            }
        }
        escaped
    }

    /// Send one line to the module behind this port.
    pub async fn put_line(&self, line: &str) -> Result<usize> {
        let command = format!("SNDT {},'{}'", self.port_name, Self::escape(line));
        self.mainframe.command(&command).await?;
        Ok(line.len() + 1)
    }

    /// Read one line from the module behind this port.
    pub async fn get_line(&self, max_len: usize) -> Result<String> {
        if max_len < GETN_PREFIX_LENGTH {
            return Err(GpibError::would_exceed_limit(
                &self.name,
                format!("the read buffer must be at least {GETN_PREFIX_LENGTH} bytes long"),
            ));
        }

        let command = format!("GETN? {},{}", self.port_name, max_len - GETN_PREFIX_LENGTH);
        let response = self.mainframe.query(&command).await?;

        // The message header is '#3' followed by a three digit length.
        if response.len() < GETN_PREFIX_LENGTH || !response.starts_with("#3") {
            return Err(GpibError::device_io(
                &self.name,
                format!("response to '{command}' is missing the #3 length prefix: '{response}'"),
            ));
        }

        let length: usize = response[2..GETN_PREFIX_LENGTH].parse().map_err(|_| {
            GpibError::device_io(
                &self.name,
                format!("unparseable length field in response '{response}'"),
            )
        })?;

        let body = &response[GETN_PREFIX_LENGTH..];
        if body.len() < length {
            return Err(GpibError::device_io(
                &self.name,
                format!(
                    "response to '{command}' advertises {length} bytes but \
                     carries only {}",
                    body.len()
                ),
            ));
        }

        Ok(body[..length].to_string())
    }

    /// Baud rate configured for this module slot.
    pub async fn baud(&self) -> Result<u32> {
        let command = format!("BAUD? {}", self.port_name);
        let response = self.mainframe.query(&command).await?;
        response.trim().parse().map_err(|_| {
            GpibError::device_io(
                &self.name,
                format!("unparseable baud rate in response '{response}'"),
            )
        })
    }

    pub async fn set_baud(&self, baud: u32) -> Result<()> {
        self.mainframe
            .command(&format!("BAUD {},{}", self.port_name, baud))
            .await
    }

    /// Parity setting: 0 = none, 1 = odd, 2 = even.
    pub async fn set_parity(&self, parity: u8) -> Result<()> {
        self.mainframe
            .command(&format!("PARI {},{}", self.port_name, parity))
            .await
    }

    /// Flow control: 0 = none, 1 = hardware.
    pub async fn set_flow_control(&self, flow: u8) -> Result<()> {
        self.mainframe
            .command(&format!("FLOW {},{}", self.port_name, flow))
            .await
    }
}
