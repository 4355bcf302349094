//! Linux `usbtmc` character-device driver.
//!
//! The kernel's usbtmc class driver exposes each USB Test & Measurement
//! instrument as `/dev/usbtmcN`: plain `read`/`write` carry message
//! payloads, and the IEEE-488 style bus controls (device clear, serial
//! poll, REN/GTL/LLO, trigger) are ioctls on the same file descriptor.
//! One device file is one instrument, so this adapter is a
//! single-instrument bus; the GPIB address is bookkeeping only.
//!
//! On non-Linux targets the crate compiles, but the ioctl-backed verbs
//! report `Unsupported`.

use async_trait::async_trait;
use futures::future::BoxFuture;
use labbus_core::{
    AddressState, BusFactory, GpibAddress, GpibBus, GpibError, GpibInterface, GpibSettings,
    Result, TransferFlags,
};
use parking_lot::Mutex;
use serde::Deserialize;
use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
mod ioctl {
    //! Wrappers over the `include/uapi/linux/usb/tmc.h` ioctl set.

    use nix::{ioctl_none, ioctl_read, ioctl_write_ptr};

    const USBTMC_IOC_NR: u8 = 91;

    ioctl_none!(usbtmc_clear, USBTMC_IOC_NR, 2);
    ioctl_read!(usbtmc488_read_stb, USBTMC_IOC_NR, 18, u8);
    ioctl_write_ptr!(usbtmc488_ren_control, USBTMC_IOC_NR, 19, u8);
    ioctl_none!(usbtmc488_goto_local, USBTMC_IOC_NR, 20);
    ioctl_none!(usbtmc488_local_lockout, USBTMC_IOC_NR, 21);
    ioctl_none!(usbtmc488_trigger, USBTMC_IOC_NR, 22);
}

/// Configuration for a usbtmc device interface.
#[derive(Debug, Clone, Deserialize)]
pub struct UsbtmcConfig {
    /// Character device path, e.g. "/dev/usbtmc0".
    pub device: PathBuf,
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub gpib: GpibSettings,
}

fn default_name() -> String {
    "usbtmc".to_string()
}

/// Factory for [`UsbtmcBus`] interfaces.
pub struct UsbtmcFactory;

impl BusFactory for UsbtmcFactory {
    fn bus_type(&self) -> &'static str {
        "usbtmc"
    }

    fn name(&self) -> &'static str {
        "Linux usbtmc character device"
    }

    fn validate(&self, config: &toml::Value) -> anyhow::Result<()> {
        let _: UsbtmcConfig = config.clone().try_into()?;
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, anyhow::Result<Arc<GpibInterface>>> {
        Box::pin(async move {
            let cfg: UsbtmcConfig = config.try_into()?;
            let bus = UsbtmcBus::new(cfg.name.clone(), cfg.device.clone());
            Ok(Arc::new(GpibInterface::new(Box::new(bus), cfg.gpib)))
        })
    }
}

/// Bus adapter for one `/dev/usbtmcN` instrument.
pub struct UsbtmcBus {
    name: String,
    device_path: PathBuf,
    file: Mutex<Option<Arc<File>>>,
}

impl UsbtmcBus {
    pub fn new(name: String, device_path: PathBuf) -> Self {
        Self {
            name,
            device_path,
            file: Mutex::new(None),
        }
    }

    fn map_io(&self, e: std::io::Error, context: &str) -> GpibError {
        match e.kind() {
            std::io::ErrorKind::TimedOut => {
                GpibError::timed_out(&self.name, format!("{context} timed out"))
            }
            _ => GpibError::device_io(&self.name, format!("{context} failed: {e}")),
        }
    }

    async fn ensure_open(&self) -> Result<Arc<File>> {
        if let Some(file) = self.file.lock().clone() {
            return Ok(file);
        }

        let path = self.device_path.clone();
        let name = self.name.clone();
        let file = tokio::task::spawn_blocking(move || {
            std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
        })
        .await
        .map_err(|e| GpibError::interface_io(&self.name, format!("open task failed: {e}")))?
        .map_err(|e| {
            GpibError::new(
                name,
                labbus_core::GpibErrorKind::Io,
                format!("cannot open usbtmc device: {e}"),
            )
        })?;

        let file = Arc::new(file);
        *self.file.lock() = Some(Arc::clone(&file));
        debug!(interface = %self.name, path = %self.device_path.display(), "device opened");
        Ok(file)
    }

    #[cfg(target_os = "linux")]
    async fn with_fd<F>(&self, operation: &'static str, f: F) -> Result<i32>
    where
        F: FnOnce(std::os::fd::RawFd) -> nix::Result<i32> + Send + 'static,
    {
        use std::os::fd::AsRawFd;

        let file = self.ensure_open().await?;
        let name = self.name.clone();
        tokio::task::spawn_blocking(move || {
            let fd = file.as_raw_fd();
            f(fd).map_err(|e| {
                GpibError::device_io(name, format!("{operation} ioctl failed: {e}"))
            })
        })
        .await
        .map_err(|e| GpibError::interface_io(&self.name, format!("ioctl task failed: {e}")))?
    }
}

#[async_trait]
impl GpibBus for UsbtmcBus {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open_device(&self, _address: GpibAddress, _state: &AddressState) -> Result<()> {
        self.ensure_open().await.map(|_| ())
    }

    async fn close_device(&self, _address: GpibAddress, _state: &mut AddressState) -> Result<()> {
        *self.file.lock() = None;
        Ok(())
    }

    async fn read(
        &self,
        address: GpibAddress,
        max_len: usize,
        flags: TransferFlags,
        state: &AddressState,
    ) -> Result<Vec<u8>> {
        let file = self.ensure_open().await?;
        let mut data = tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; max_len];
            let n = (&*file).read(&mut buf)?;
            buf.truncate(n);
            Ok::<_, std::io::Error>(buf)
        })
        .await
        .map_err(|e| GpibError::interface_io(&self.name, format!("read task failed: {e}")))?
        .map_err(|e| self.map_io(e, "read"))?;

        if let Some(terminator) = state.read_terminator.last_byte() {
            if data.last() == Some(&terminator) {
                data.pop();
            }
        }

        if flags.debug {
            debug!(
                interface = %self.name,
                %address,
                response = %String::from_utf8_lossy(&data),
                "read"
            );
        }
        Ok(data)
    }

    async fn write(
        &self,
        address: GpibAddress,
        data: &[u8],
        flags: TransferFlags,
        state: &AddressState,
    ) -> Result<usize> {
        let terminator = state
            .write_terminator
            .single_byte()
            .map_err(|e| GpibError::illegal_argument(&self.name, e.message))?;

        let mut payload = data.to_vec();
        if let Some(byte) = terminator {
            payload.push(byte);
        }
        let len = payload.len();

        if flags.debug {
            debug!(
                interface = %self.name,
                %address,
                payload = %String::from_utf8_lossy(data),
                "write"
            );
        }

        let file = self.ensure_open().await?;
        tokio::task::spawn_blocking(move || (&*file).write_all(&payload))
            .await
            .map_err(|e| GpibError::interface_io(&self.name, format!("write task failed: {e}")))?
            .map_err(|e| self.map_io(e, "write"))?;

        Ok(len)
    }

    #[cfg(target_os = "linux")]
    #[allow(unsafe_code)]
    async fn selective_device_clear(&self, _address: GpibAddress) -> Result<()> {
        self.with_fd("device clear", |fd| unsafe { ioctl::usbtmc_clear(fd) })
            .await
            .map(|_| ())
    }

    #[cfg(target_os = "linux")]
    #[allow(unsafe_code)]
    async fn local_lockout(&self) -> Result<()> {
        self.with_fd("local lockout", |fd| unsafe {
            ioctl::usbtmc488_local_lockout(fd)
        })
        .await
        .map(|_| ())
    }

    #[cfg(target_os = "linux")]
    #[allow(unsafe_code)]
    async fn remote_enable(&self, _address: GpibAddress) -> Result<()> {
        self.with_fd("remote enable", |fd| {
            let enable: u8 = 1;
            unsafe { ioctl::usbtmc488_ren_control(fd, &enable) }
        })
        .await
        .map(|_| ())
    }

    #[cfg(target_os = "linux")]
    #[allow(unsafe_code)]
    async fn go_to_local(&self, _address: GpibAddress) -> Result<()> {
        self.with_fd("go to local", |fd| unsafe {
            ioctl::usbtmc488_goto_local(fd)
        })
        .await
        .map(|_| ())
    }

    #[cfg(target_os = "linux")]
    #[allow(unsafe_code)]
    async fn trigger(&self, _address: GpibAddress) -> Result<()> {
        self.with_fd("trigger", |fd| unsafe { ioctl::usbtmc488_trigger(fd) })
            .await
            .map(|_| ())
    }

    #[cfg(target_os = "linux")]
    #[allow(unsafe_code)]
    async fn serial_poll(&self, _address: GpibAddress) -> Result<u8> {
        use std::os::fd::AsRawFd;

        let file = self.ensure_open().await?;
        let name = self.name.clone();
        let stb = tokio::task::spawn_blocking(move || {
            let mut stb: u8 = 0;
            unsafe { ioctl::usbtmc488_read_stb(file.as_raw_fd(), &mut stb) }
                .map(|_| stb)
                .map_err(|e| {
                    GpibError::device_io(name, format!("read status byte ioctl failed: {e}"))
                })
        })
        .await
        .map_err(|e| GpibError::interface_io(&self.name, format!("ioctl task failed: {e}")))??;
        Ok(stb)
    }

    async fn serial_poll_disable(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labbus_core::GpibErrorKind;
    use std::io::Write as _;

    fn addr(n: u8) -> GpibAddress {
        GpibAddress::try_from(n).unwrap()
    }

    fn state() -> AddressState {
        AddressState::new(&GpibSettings::default())
    }

    #[tokio::test]
    async fn open_of_a_missing_device_reports_io_error() {
        let bus = UsbtmcBus::new("tmc0".into(), PathBuf::from("/nonexistent/usbtmc99"));
        let err = bus.open_device(addr(0), &state()).await.unwrap_err();
        assert_eq!(err.kind(), GpibErrorKind::Io);
    }

    #[tokio::test]
    async fn write_then_read_round_trips_through_a_file() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let bus = UsbtmcBus::new("tmc0".into(), tmp.path().to_path_buf());

        let written = bus
            .write(addr(0), b"*IDN?", TransferFlags::NONE, &state())
            .await
            .unwrap();
        assert_eq!(written, 6); // payload plus LF terminator

        // Reads continue from the shared cursor, so reopen to observe
        // what landed in the file.
        let mut contents = String::new();
        std::io::Read::read_to_string(&mut std::fs::File::open(tmp.path()).unwrap(), &mut contents)
            .unwrap();
        assert_eq!(contents, "*IDN?\n");
    }

    #[tokio::test]
    async fn read_strips_the_trailing_terminator() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"RESPONSE\n").unwrap();
        tmp.flush().unwrap();

        let bus = UsbtmcBus::new("tmc0".into(), tmp.path().to_path_buf());
        let data = bus
            .read(addr(0), 64, TransferFlags::NONE, &state())
            .await
            .unwrap();
        assert_eq!(data, b"RESPONSE");
    }

    #[tokio::test]
    async fn close_device_drops_the_handle() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let bus = UsbtmcBus::new("tmc0".into(), tmp.path().to_path_buf());

        bus.open_device(addr(0), &state()).await.unwrap();
        assert!(bus.file.lock().is_some());
        bus.close_device(addr(0), &mut state()).await.unwrap();
        assert!(bus.file.lock().is_none());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn ioctls_on_a_regular_file_fail_with_device_io() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let bus = UsbtmcBus::new("tmc0".into(), tmp.path().to_path_buf());

        let err = bus.trigger(addr(0)).await.unwrap_err();
        assert_eq!(err.kind(), GpibErrorKind::DeviceIo);
    }

    #[cfg(not(target_os = "linux"))]
    #[tokio::test]
    async fn bus_controls_are_unsupported_off_linux() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let bus = UsbtmcBus::new("tmc0".into(), tmp.path().to_path_buf());

        let err = bus.trigger(addr(0)).await.unwrap_err();
        assert_eq!(err.kind(), GpibErrorKind::Unsupported);
    }
}
