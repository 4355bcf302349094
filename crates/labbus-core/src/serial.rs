//! Shared async serial-port plumbing for the RS-232 bridge adapters and
//! serial instruments.
//!
//! Everything here is written against `AsyncRead + AsyncWrite` trait
//! objects so that tests substitute `tokio::io::duplex` streams for real
//! hardware.
//!
//! # Types
//!
//! - [`SerialPortIO`]: trait alias combining the async I/O traits
//! - [`DynSerial`]: type-erased boxed serial port
//! - [`SharedPort`]: thread-safe shared port with buffered reading
//!
//! # Utilities
//!
//! - [`open_serial_async`]: open a real port without blocking the runtime
//! - [`drain_serial_buffer`]: throw away stale input before a transaction
//! - [`write_line`] / [`read_line`]: terminator-aware line I/O

use crate::address::Termination;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

/// Trait alias for async serial port I/O.
///
/// Satisfied by `tokio_serial::SerialStream`, `tokio::io::DuplexStream`,
/// and any mock implementing the async I/O traits.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Thread-safe shared serial port with buffered reading, the primary type
/// for line-oriented command/response protocols.
pub type SharedPort = Arc<Mutex<BufReader<DynSerial>>>;

/// Wrap a port for shared line-oriented use.
pub fn wrap_shared(port: DynSerial) -> SharedPort {
    Arc::new(Mutex::new(BufReader::new(port)))
}

/// Failures from the serial line helpers, separated so adapters can map
/// timeouts onto their own timeout error kind.
#[derive(Error, Debug)]
pub enum SerialError {
    #[error("serial read timed out")]
    TimedOut,
    #[error("serial port closed")]
    Closed,
    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Open a serial port asynchronously using `spawn_blocking`, with the
/// standard instrument settings (8N1, no flow control).
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
    device_name: &str,
) -> anyhow::Result<tokio_serial::SerialStream> {
    use anyhow::Context;
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let port_path_owned = port_path.to_string();
    let device_name_owned = device_name.to_string();

    spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .context(format!(
                "Failed to open {} serial port: {}",
                device_name_owned, port_path_owned
            ))
    })
    .await
    .context("spawn_blocking for serial port opening failed")?
}

/// Read and discard whatever is sitting in the port's input buffer until
/// no more data arrives within `timeout_ms`. Returns the number of bytes
/// thrown away. Used by bridge adapters before their initialization
/// sequences and after protocol errors.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin>(port: &mut R, timeout_ms: u64) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    let mut total_discarded = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }

        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total_discarded += n,
            Ok(Err(_)) => break,
            Err(_) => break,
        }
    }

    total_discarded
}

/// Write `line` followed by the terminator pattern, then flush.
/// Returns the number of bytes put on the wire.
pub async fn write_line<W: AsyncWrite + Unpin>(
    port: &mut W,
    terminator: Termination,
    line: &str,
) -> std::result::Result<usize, SerialError> {
    port.write_all(line.as_bytes()).await?;
    let term = terminator.bytes();
    if !term.is_empty() {
        port.write_all(&term).await?;
    }
    port.flush().await?;
    Ok(line.len() + term.len())
}

/// Read one line, delimited by the final byte of `terminator`, trimming
/// the whole terminator pattern off the result. `None` for the timeout
/// waits forever.
pub async fn read_line<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    terminator: Termination,
    timeout: Option<Duration>,
) -> std::result::Result<String, SerialError> {
    let delimiter = terminator.last_byte().unwrap_or(b'\n');
    let mut raw = Vec::new();

    let read = reader.read_until(delimiter, &mut raw);
    let n = match timeout {
        Some(t) => tokio::time::timeout(t, read)
            .await
            .map_err(|_| SerialError::TimedOut)??,
        None => read.await?,
    };

    if n == 0 {
        return Err(SerialError::Closed);
    }

    let term = terminator.bytes();
    if raw.ends_with(&term) {
        raw.truncate(raw.len() - term.len());
    } else if raw.last() == Some(&delimiter) {
        raw.pop();
    }

    String::from_utf8(raw).map_err(|e| {
        SerialError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("response is not valid text: {e}"),
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn line_round_trip_through_duplex() {
        let (host, device) = tokio::io::duplex(256);
        let mut host = BufReader::new(host);
        let mut device = device;

        write_line(&mut device, Termination::CRLF, "IDN?")
            .await
            .unwrap();

        let line = read_line(&mut host, Termination::CRLF, Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(line, "IDN?");
    }

    #[tokio::test]
    async fn read_line_times_out_when_nothing_arrives() {
        let (host, _device) = tokio::io::duplex(64);
        let mut host = BufReader::new(host);

        let err = read_line(&mut host, Termination::LF, Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, SerialError::TimedOut));
    }

    #[tokio::test]
    async fn read_line_reports_closed_port() {
        let (host, device) = tokio::io::duplex(64);
        drop(device);
        let mut host = BufReader::new(host);

        let err = read_line(&mut host, Termination::LF, Some(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, SerialError::Closed));
    }

    #[tokio::test]
    async fn drain_discards_stale_bytes() {
        let (mut host, mut device) = tokio::io::duplex(64);
        host.write_all(b"stale data 12345").await.unwrap();

        let discarded = drain_serial_buffer(&mut device, 50).await;
        assert_eq!(discarded, 16);
    }
}
