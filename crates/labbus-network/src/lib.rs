//! GPIB over the network: a client bus that forwards every operation to
//! a remote labbus server, and the matching per-connection server loop.
//!
//! The wire protocol is one JSON object per line in each direction (see
//! [`protocol`]); errors cross the link as (kind label, message) pairs
//! and are re-hydrated into the local taxonomy, so a timeout on the far
//! machine still matches `GpibErrorKind::TimedOut` here.

pub mod protocol;
pub mod server;

use async_trait::async_trait;
use futures::future::BoxFuture;
use labbus_core::{
    AddressState, BusFactory, GpibAddress, GpibBus, GpibError, GpibInterface, GpibSettings,
    Result, TransferFlags,
};
use protocol::{kind_from_label, Op, Request, Response};
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

/// Configuration for a remote GPIB interface.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkGpibConfig {
    /// Server address, e.g. "10.0.0.7:9780".
    pub server: String,
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub gpib: GpibSettings,
}

fn default_name() -> String {
    "network_gpib".to_string()
}

/// Factory for [`RemoteGpibBus`] interfaces.
pub struct NetworkGpibFactory;

impl BusFactory for NetworkGpibFactory {
    fn bus_type(&self) -> &'static str {
        "network_gpib"
    }

    fn name(&self) -> &'static str {
        "Remote labbus GPIB server"
    }

    fn validate(&self, config: &toml::Value) -> anyhow::Result<()> {
        let _: NetworkGpibConfig = config.clone().try_into()?;
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, anyhow::Result<Arc<GpibInterface>>> {
        Box::pin(async move {
            let cfg: NetworkGpibConfig = config.try_into()?;
            let bus = RemoteGpibBus::connect(cfg.name.clone(), &cfg.server).await?;
            Ok(Arc::new(GpibInterface::new(Box::new(bus), cfg.gpib)))
        })
    }
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// Client bus forwarding every verb to a remote server.
pub struct RemoteGpibBus {
    name: String,
    connection: Mutex<Connection>,
    next_id: AtomicU64,
}

impl RemoteGpibBus {
    /// Connect to a labbus GPIB server.
    pub async fn connect(name: String, server: &str) -> Result<Self> {
        let stream = TcpStream::connect(server).await.map_err(|e| {
            GpibError::interface_io(&name, format!("cannot connect to GPIB server {server}: {e}"))
        })?;
        debug!(interface = %name, server, "connected");
        Ok(Self::from_stream(name, stream))
    }

    pub fn from_stream(name: String, stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            name,
            connection: Mutex::new(Connection {
                reader: BufReader::new(read_half),
                writer: write_half,
            }),
            next_id: AtomicU64::new(1),
        }
    }

    fn request(&self, op: Op) -> Request {
        Request {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            op,
            address: None,
            data: None,
            max_len: None,
            timeout_ms: None,
        }
    }

    async fn round_trip(&self, request: Request) -> Result<Response> {
        let mut line = serde_json::to_string(&request)
            .map_err(|e| GpibError::interface_io(&self.name, format!("encode failed: {e}")))?;
        line.push('\n');

        let mut connection = self.connection.lock().await;
        connection
            .writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| GpibError::interface_io(&self.name, format!("send failed: {e}")))?;

        let mut response_line = String::new();
        let n = connection
            .reader
            .read_line(&mut response_line)
            .await
            .map_err(|e| GpibError::interface_io(&self.name, format!("receive failed: {e}")))?;
        if n == 0 {
            return Err(GpibError::interface_io(
                &self.name,
                "the GPIB server closed the connection",
            ));
        }

        let response: Response = serde_json::from_str(&response_line).map_err(|e| {
            GpibError::interface_io(&self.name, format!("malformed server response: {e}"))
        })?;

        if response.id != request.id {
            return Err(GpibError::interface_io(
                &self.name,
                format!(
                    "response id {} does not match request id {}",
                    response.id, request.id
                ),
            ));
        }

        if response.ok {
            Ok(response)
        } else {
            let kind = kind_from_label(response.error_kind.as_deref().unwrap_or(""));
            let message = response
                .message
                .unwrap_or_else(|| "remote operation failed".to_string());
            Err(GpibError::new(&self.name, kind, message))
        }
    }
}

#[async_trait]
impl GpibBus for RemoteGpibBus {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open_device(&self, address: GpibAddress, _state: &AddressState) -> Result<()> {
        let mut request = self.request(Op::OpenDevice);
        request.address = Some(address.as_u8());
        self.round_trip(request).await.map(|_| ())
    }

    async fn close_device(&self, address: GpibAddress, _state: &mut AddressState) -> Result<()> {
        let mut request = self.request(Op::CloseDevice);
        request.address = Some(address.as_u8());
        self.round_trip(request).await.map(|_| ())
    }

    async fn read(
        &self,
        address: GpibAddress,
        max_len: usize,
        _flags: TransferFlags,
        _state: &AddressState,
    ) -> Result<Vec<u8>> {
        let mut request = self.request(Op::Read);
        request.address = Some(address.as_u8());
        request.max_len = Some(max_len);
        let response = self.round_trip(request).await?;
        Ok(response.data.unwrap_or_default())
    }

    async fn write(
        &self,
        address: GpibAddress,
        data: &[u8],
        _flags: TransferFlags,
        _state: &AddressState,
    ) -> Result<usize> {
        let mut request = self.request(Op::Write);
        request.address = Some(address.as_u8());
        request.data = Some(data.to_vec());
        let response = self.round_trip(request).await?;
        Ok(response.bytes.unwrap_or(data.len()))
    }

    async fn interface_clear(&self) -> Result<()> {
        self.round_trip(self.request(Op::InterfaceClear))
            .await
            .map(|_| ())
    }

    async fn device_clear(&self) -> Result<()> {
        self.round_trip(self.request(Op::DeviceClear))
            .await
            .map(|_| ())
    }

    async fn selective_device_clear(&self, address: GpibAddress) -> Result<()> {
        let mut request = self.request(Op::SelectiveDeviceClear);
        request.address = Some(address.as_u8());
        self.round_trip(request).await.map(|_| ())
    }

    async fn local_lockout(&self) -> Result<()> {
        self.round_trip(self.request(Op::LocalLockout))
            .await
            .map(|_| ())
    }

    async fn remote_enable(&self, address: GpibAddress) -> Result<()> {
        let mut request = self.request(Op::RemoteEnable);
        request.address = Some(address.as_u8());
        self.round_trip(request).await.map(|_| ())
    }

    async fn go_to_local(&self, address: GpibAddress) -> Result<()> {
        let mut request = self.request(Op::GoToLocal);
        request.address = Some(address.as_u8());
        self.round_trip(request).await.map(|_| ())
    }

    async fn trigger(&self, address: GpibAddress) -> Result<()> {
        let mut request = self.request(Op::Trigger);
        request.address = Some(address.as_u8());
        self.round_trip(request).await.map(|_| ())
    }

    async fn wait_for_service_request(&self, timeout: Duration) -> Result<()> {
        let mut request = self.request(Op::WaitForServiceRequest);
        request.timeout_ms = Some(timeout.as_millis() as u64);
        self.round_trip(request).await.map(|_| ())
    }

    async fn serial_poll(&self, address: GpibAddress) -> Result<u8> {
        let mut request = self.request(Op::SerialPoll);
        request.address = Some(address.as_u8());
        let response = self.round_trip(request).await?;
        response.status_byte.ok_or_else(|| {
            GpibError::interface_io(&self.name, "serial poll response carried no status byte")
        })
    }

    async fn serial_poll_disable(&self) -> Result<()> {
        self.round_trip(self.request(Op::SerialPollDisable))
            .await
            .map(|_| ())
    }
}
