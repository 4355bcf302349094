//! Server side of the GPIB proxy: accept connections and execute each
//! request against a local interface.

use crate::protocol::{Op, Request, Response};
use labbus_core::{GpibAddress, GpibError, GpibInterface, Result, TransferFlags};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

/// Accept connections forever, serving each one on its own task.
pub async fn serve(listener: TcpListener, interface: Arc<GpibInterface>) -> std::io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!(interface = interface.name(), %peer, "client connected");
        let interface = Arc::clone(&interface);
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, interface).await {
                warn!(%peer, error = %e, "connection ended with error");
            }
        });
    }
}

/// Run the request/response loop for one client until it disconnects.
pub async fn serve_connection(
    stream: TcpStream,
    interface: Arc<GpibInterface>,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(trimmed) {
            Ok(request) => {
                let id = request.id;
                match execute(&interface, request).await {
                    Ok(response) => response,
                    Err(error) => Response::failure(id, &error),
                }
            }
            Err(e) => Response::failure(
                0,
                &GpibError::illegal_argument(
                    interface.name(),
                    format!("malformed request: {e}"),
                ),
            ),
        };

        let mut encoded = serde_json::to_string(&response)
            .unwrap_or_else(|_| r#"{"id":0,"ok":false}"#.to_string());
        encoded.push('\n');
        write_half.write_all(encoded.as_bytes()).await?;
    }
}

fn required_address(interface: &GpibInterface, request: &Request) -> Result<GpibAddress> {
    let raw = request.address.ok_or_else(|| {
        GpibError::illegal_argument(
            interface.name(),
            format!("operation {:?} requires an address", request.op),
        )
    })?;
    GpibAddress::try_from(raw)
}

async fn execute(interface: &Arc<GpibInterface>, request: Request) -> Result<Response> {
    let id = request.id;
    let flags = TransferFlags::NONE;

    let response = match request.op {
        Op::OpenDevice => {
            interface.open_device(required_address(interface, &request)?).await?;
            Response::success(id)
        }
        Op::CloseDevice => {
            interface.close_device(required_address(interface, &request)?).await?;
            Response::success(id)
        }
        Op::Read => {
            let address = required_address(interface, &request)?;
            let max_len = request.max_len.unwrap_or(4096);
            let data = interface.read(address, max_len, flags).await?;
            Response {
                data: Some(data),
                ..Response::success(id)
            }
        }
        Op::Write => {
            let address = required_address(interface, &request)?;
            let data = request.data.unwrap_or_default();
            let bytes = interface.write(address, &data, flags).await?;
            Response {
                bytes: Some(bytes),
                ..Response::success(id)
            }
        }
        Op::InterfaceClear => {
            interface.interface_clear().await?;
            Response::success(id)
        }
        Op::DeviceClear => {
            interface.device_clear().await?;
            Response::success(id)
        }
        Op::SelectiveDeviceClear => {
            interface
                .selective_device_clear(required_address(interface, &request)?)
                .await?;
            Response::success(id)
        }
        Op::LocalLockout => {
            interface.local_lockout().await?;
            Response::success(id)
        }
        Op::RemoteEnable => {
            interface
                .remote_enable(required_address(interface, &request)?)
                .await?;
            Response::success(id)
        }
        Op::GoToLocal => {
            interface
                .go_to_local(required_address(interface, &request)?)
                .await?;
            Response::success(id)
        }
        Op::Trigger => {
            interface.trigger(required_address(interface, &request)?).await?;
            Response::success(id)
        }
        Op::WaitForServiceRequest => {
            let timeout = Duration::from_millis(request.timeout_ms.unwrap_or(1000));
            interface.wait_for_service_request(timeout).await?;
            Response::success(id)
        }
        Op::SerialPoll => {
            let byte = interface
                .serial_poll(required_address(interface, &request)?)
                .await?;
            Response {
                status_byte: Some(byte),
                ..Response::success(id)
            }
        }
        Op::SerialPollDisable => {
            interface.serial_poll_disable().await?;
            Response::success(id)
        }
    };

    Ok(response)
}
