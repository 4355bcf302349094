//! National Instruments NI-488.2 / linux-gpib board driver.
//!
//! Talks to a plug-in GPIB controller board through the vendor C
//! library's `ib*()` call surface, held behind the [`api::Ni488Api`]
//! seam. Device descriptors are cached per address and opened lazily,
//! timeouts are bucketed into the vendor's 18-step geometric ladder, and
//! every vendor status word is translated into the shared error
//! taxonomy at the point of failure.

pub mod api;

#[cfg(feature = "linux-gpib")]
pub mod ffi;

use api::{error_text, IbResult, Ni488Api, NO_SAD, REOS, XEOS};
use async_trait::async_trait;
use labbus_core::{
    AddressState, GpibAddress, GpibBus, GpibError, GpibInterface, GpibSettings, Result,
    Termination, TransferFlags, PRIMARY_ADDRESS_COUNT,
};
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[cfg(feature = "linux-gpib")]
use futures::future::BoxFuture;
#[cfg(feature = "linux-gpib")]
use labbus_core::BusFactory;

/// Bucket a floating-point timeout (seconds) into the vendor's
/// time-duration code. Code 0 disables the timeout; codes 1..=17 form a
/// 1-3-10 geometric ladder from 10 microseconds to 1000 seconds, with
/// the mantissa split at sqrt(3) and sqrt(30).
pub fn time_duration_code(io_timeout: f64) -> i32 {
    if io_timeout < 1.0e-12 {
        // Zero or negative timeouts mean "do not time out at all".
        return 0;
    }

    let log_io_timeout = io_timeout.log10();
    let exponent = log_io_timeout.floor() as i32;
    let log_mantissa = log_io_timeout - f64::from(exponent);

    let mut code = 11 + 2 * exponent;

    if log_mantissa <= 3.0_f64.sqrt().log10() {
        // Round down to the 1x step.
    } else if log_mantissa <= 30.0_f64.sqrt().log10() {
        code += 1;
    } else {
        code += 2;
    }

    code.clamp(0, 17)
}

/// Inverse of [`time_duration_code`]: the timeout in seconds one code
/// stands for. Code 0 maps to the negative "no timeout" sentinel.
pub fn io_timeout_seconds(code: i32) -> f64 {
    match code {
        0 => -1.0,
        1 => 10.0e-6,
        2 => 30.0e-6,
        3 => 100.0e-6,
        4 => 300.0e-6,
        5 => 1.0e-3,
        6 => 3.0e-3,
        7 => 10.0e-3,
        8 => 30.0e-3,
        9 => 100.0e-3,
        10 => 300.0e-3,
        11 => 1.0,
        12 => 3.0,
        13 => 10.0,
        14 => 30.0,
        15 => 100.0,
        16 => 300.0,
        17 => 1.0e3,
        _ => 0.0,
    }
}

/// Configuration for an NI-488 board interface.
#[derive(Debug, Clone, Deserialize)]
pub struct Ni488Config {
    /// Board index (the N of `/dev/gpibN`).
    #[serde(default)]
    pub board: i32,
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub gpib: GpibSettings,
}

fn default_name() -> String {
    "ni488".to_string()
}

/// Factory for [`Ni488Bus`] interfaces backed by the linked vendor
/// library.
#[cfg(feature = "linux-gpib")]
pub struct Ni488Factory;

#[cfg(feature = "linux-gpib")]
impl BusFactory for Ni488Factory {
    fn bus_type(&self) -> &'static str {
        "ni488"
    }

    fn name(&self) -> &'static str {
        "National Instruments / linux-gpib controller board"
    }

    fn validate(&self, config: &toml::Value) -> anyhow::Result<()> {
        let _: Ni488Config = config.clone().try_into()?;
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, anyhow::Result<Arc<GpibInterface>>> {
        Box::pin(async move {
            let cfg: Ni488Config = config.try_into()?;
            let bus = Ni488Bus::new(
                cfg.name.clone(),
                cfg.board,
                Arc::new(ffi::LinuxGpib),
                &cfg.gpib,
            );
            Ok(Arc::new(GpibInterface::new(Box::new(bus), cfg.gpib)))
        })
    }
}

/// Bus adapter for one controller board.
pub struct Ni488Bus {
    name: String,
    board_number: i32,
    /// The board's own unit descriptor. The vendor library guarantees
    /// the board index doubles as its descriptor.
    board_descriptor: i32,
    api: Arc<dyn Ni488Api>,
    /// Open device descriptors per primary address.
    descriptors: Mutex<[Option<i32>; PRIMARY_ADDRESS_COUNT]>,
    /// Defaults used when a transfer lazily opens an address.
    default_state: AddressState,
}

impl Ni488Bus {
    pub fn new(
        name: String,
        board_number: i32,
        api: Arc<dyn Ni488Api>,
        settings: &GpibSettings,
    ) -> Self {
        Self {
            name,
            board_number,
            board_descriptor: board_number,
            api,
            descriptors: Mutex::new([None; PRIMARY_ADDRESS_COUNT]),
            default_state: AddressState::new(settings),
        }
    }

    fn vendor_error(&self, result: &IbResult, context: String) -> GpibError {
        GpibError::device_io(
            &self.name,
            format!("{context}.  GPIB error = '{}'", error_text(result)),
        )
    }

    /// Combine the per-address terminators into the vendor EOS word.
    fn compute_eos_word(&self, state: &AddressState) -> Result<u32> {
        let read = state
            .read_terminator
            .single_byte()
            .map_err(|e| GpibError::illegal_argument(&self.name, e.message))?;
        let write = state
            .write_terminator
            .single_byte()
            .map_err(|e| GpibError::illegal_argument(&self.name, e.message))?;

        if let (Some(r), Some(w)) = (read, write) {
            if r != w {
                return Err(GpibError::illegal_argument(
                    &self.name,
                    format!(
                        "if the read terminator ({r:#x}) and the write terminator ({w:#x}) \
                         are both nonzero then they must be equal"
                    ),
                ));
            }
        }

        let mut eos = match read {
            Some(r) => REOS | u32::from(r),
            None => write.map(u32::from).unwrap_or(0),
        };
        if write.is_some() {
            eos |= XEOS;
        }
        Ok(eos)
    }

    fn open_descriptor(&self, address: GpibAddress, state: &AddressState) -> Result<i32> {
        let tmo = time_duration_code(state.io_timeout_seconds());
        let eos = self.compute_eos_word(state)?;

        let (dev, result) = self.api.ibdev(
            self.board_number,
            i32::from(address.as_u8()),
            0,
            tmo,
            i32::from(state.eoi_mode),
            eos as i32,
        );

        if dev == -1 || result.is_err() {
            return Err(self.vendor_error(
                &result,
                format!("cannot open GPIB address {address}"),
            ));
        }

        // Is there an actual device at this address?
        let (present, result) =
            self.api
                .ibln(self.board_descriptor, i32::from(address.as_u8()), NO_SAD);
        if result.is_err() {
            return Err(self.vendor_error(
                &result,
                format!("presence check failed for GPIB address {address}"),
            ));
        }

        if !present {
            let result = self.api.ibonl(dev, 0);
            if result.is_err() {
                warn!(
                    interface = %self.name,
                    %address,
                    error = %error_text(&result),
                    "could not close descriptor for absent device"
                );
            }
            return Err(GpibError::device_io(
                &self.name,
                format!("there is no device present at GPIB address {address}"),
            ));
        }

        debug!(interface = %self.name, %address, dev, "device opened");
        Ok(dev)
    }

    /// Descriptor for `address`, opening it lazily with `state` (or the
    /// interface defaults for control verbs that carry no state).
    fn descriptor(&self, address: GpibAddress, state: Option<&AddressState>) -> Result<i32> {
        if let Some(dev) = self.descriptors.lock()[address.index()] {
            return Ok(dev);
        }
        let dev = self.open_descriptor(address, state.unwrap_or(&self.default_state))?;
        self.descriptors.lock()[address.index()] = Some(dev);
        Ok(dev)
    }
}

#[async_trait]
impl GpibBus for Ni488Bus {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open_device(&self, address: GpibAddress, state: &AddressState) -> Result<()> {
        let dev = self.open_descriptor(address, state)?;
        self.descriptors.lock()[address.index()] = Some(dev);
        Ok(())
    }

    async fn close_device(&self, address: GpibAddress, state: &mut AddressState) -> Result<()> {
        let dev = match self.descriptors.lock()[address.index()] {
            Some(dev) => dev,
            None => return Ok(()),
        };

        // Read the configuration back before the descriptor goes away.
        let (sad, result) = self.api.ibask(dev, api::option::SAD);
        if result.is_err() {
            return Err(self.vendor_error(
                &result,
                format!("cannot read secondary address for GPIB address {address}"),
            ));
        }
        state.secondary_address = sad as u8;

        let (tmo_code, result) = self.api.ibask(dev, api::option::TMO);
        if result.is_err() {
            return Err(self.vendor_error(
                &result,
                format!("cannot read I/O timeout for GPIB address {address}"),
            ));
        }
        let seconds = io_timeout_seconds(tmo_code);
        state.io_timeout = if seconds < 0.0 {
            None
        } else {
            Some(Duration::from_secs_f64(seconds))
        };

        let (eot, result) = self.api.ibask(dev, api::option::EOT);
        if result.is_err() {
            return Err(self.vendor_error(
                &result,
                format!("cannot read EOI handling mode for GPIB address {address}"),
            ));
        }
        state.eoi_mode = eot != 0;

        let (eos_read, result) = self.api.ibask(dev, api::option::EOS_READ);
        if result.is_err() {
            return Err(self.vendor_error(
                &result,
                format!("cannot read the read EOS character for GPIB address {address}"),
            ));
        }
        state.read_terminator = Termination::from_pattern(eos_read as u32 & 0xff)?;

        let (eos_write, result) = self.api.ibask(dev, api::option::EOS_WRITE);
        if result.is_err() {
            return Err(self.vendor_error(
                &result,
                format!("cannot read the write EOS character for GPIB address {address}"),
            ));
        }
        state.write_terminator = Termination::from_pattern(eos_write as u32 & 0xff)?;

        let result = self.api.ibonl(dev, 0);
        if result.is_err() {
            return Err(self.vendor_error(
                &result,
                format!("cannot close GPIB address {address}"),
            ));
        }

        self.descriptors.lock()[address.index()] = None;
        Ok(())
    }

    async fn read(
        &self,
        address: GpibAddress,
        max_len: usize,
        flags: TransferFlags,
        state: &AddressState,
    ) -> Result<Vec<u8>> {
        let dev = self.descriptor(address, Some(state))?;

        let api = Arc::clone(&self.api);
        let nowait = flags.nowait;
        let (mut data, result) = tokio::task::spawn_blocking(move || {
            if nowait {
                api.ibrda(dev, max_len)
            } else {
                api.ibrd(dev, max_len)
            }
        })
        .await
        .map_err(|e| GpibError::interface_io(&self.name, format!("read task failed: {e}")))?;

        if result.is_err() {
            return Err(self.vendor_error(
                &result,
                format!("read for GPIB address {address} was unsuccessful"),
            ));
        }

        // Strip one trailing read terminator; the library leaves it in.
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
        let dev = self.descriptor(address, Some(state))?;

        // The library does not append the EOS character on writes, so a
        // configured write terminator goes onto an owned copy; the
        // caller's buffer is never extended in place.
        let terminator = state
            .write_terminator
            .single_byte()
            .map_err(|e| GpibError::illegal_argument(&self.name, e.message))?;
        let mut payload = data.to_vec();
        if let Some(byte) = terminator {
            payload.push(byte);
        }

        if flags.debug {
            debug!(
                interface = %self.name,
                %address,
                payload = %String::from_utf8_lossy(data),
                "write"
            );
        }

        let api = Arc::clone(&self.api);
        let nowait = flags.nowait;
        let result = tokio::task::spawn_blocking(move || {
            if nowait {
                api.ibwrta(dev, &payload)
            } else {
                api.ibwrt(dev, &payload)
            }
        })
        .await
        .map_err(|e| GpibError::interface_io(&self.name, format!("write task failed: {e}")))?;

        if result.is_err() {
            return Err(self.vendor_error(
                &result,
                format!("write for GPIB address {address} was unsuccessful"),
            ));
        }

        Ok(result.ibcntl.max(0) as usize)
    }

    async fn interface_clear(&self) -> Result<()> {
        let result = self.api.ibsic(self.board_descriptor);
        if result.is_err() {
            return Err(self.vendor_error(&result, "cannot do an interface clear".to_string()));
        }
        Ok(())
    }

    async fn device_clear(&self) -> Result<()> {
        let result = self.api.dev_clear(self.board_number);
        if result.is_err() {
            return Err(self.vendor_error(&result, "cannot clear the GPIB bus".to_string()));
        }
        Ok(())
    }

    async fn selective_device_clear(&self, address: GpibAddress) -> Result<()> {
        let dev = self.descriptor(address, None)?;
        let result = self.api.ibclr(dev);
        if result.is_err() {
            return Err(self.vendor_error(
                &result,
                format!("cannot clear GPIB address {address}"),
            ));
        }
        Ok(())
    }

    async fn local_lockout(&self) -> Result<()> {
        let result = self.api.send_llo(self.board_number);
        if result.is_err() {
            return Err(self.vendor_error(&result, "cannot set local lockout".to_string()));
        }
        Ok(())
    }

    async fn remote_enable(&self, address: GpibAddress) -> Result<()> {
        let result = self.api.ibsre(self.board_descriptor, 1);
        if result.is_err() {
            return Err(self.vendor_error(
                &result,
                format!("cannot perform remote enable for GPIB address {address}"),
            ));
        }
        Ok(())
    }

    async fn go_to_local(&self, address: GpibAddress) -> Result<()> {
        let dev = self.descriptor(address, None)?;
        let result = self.api.ibloc(dev);
        if result.is_err() {
            return Err(self.vendor_error(
                &result,
                format!("cannot go to local for GPIB address {address}"),
            ));
        }
        Ok(())
    }

    async fn trigger(&self, address: GpibAddress) -> Result<()> {
        let dev = self.descriptor(address, None)?;
        let result = self.api.ibtrg(dev);
        if result.is_err() {
            return Err(self.vendor_error(
                &result,
                format!("cannot trigger GPIB address {address}"),
            ));
        }
        Ok(())
    }

    /// Blocks in the vendor library until the board reports an event;
    /// the board's own timeout configuration bounds the wait, so the
    /// caller-supplied duration is not used here.
    async fn wait_for_service_request(&self, _timeout: Duration) -> Result<()> {
        let api = Arc::clone(&self.api);
        let board = self.board_descriptor;
        let result = tokio::task::spawn_blocking(move || api.ibwait(board, 0))
            .await
            .map_err(|e| GpibError::interface_io(&self.name, format!("wait task failed: {e}")))?;

        if result.is_err() {
            return Err(self.vendor_error(
                &result,
                "wait for service request failed".to_string(),
            ));
        }
        Ok(())
    }

    async fn serial_poll(&self, address: GpibAddress) -> Result<u8> {
        let dev = self.descriptor(address, None)?;
        let (poll_byte, result) = self.api.ibrsp(dev);
        if result.is_err() {
            return Err(self.vendor_error(
                &result,
                format!("serial poll of address {address} failed"),
            ));
        }
        Ok(poll_byte)
    }

    async fn serial_poll_disable(&self) -> Result<()> {
        Ok(())
    }
}
