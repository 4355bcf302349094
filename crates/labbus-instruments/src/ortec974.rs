//! EG&G Ortec 974 quad counter/timer.
//!
//! Protocol: spelled-out command words (`CLEAR_COUNTERS`,
//! `SET_COUNT_PRESET`, `START`, `STOP`, `SHOW_COUNTS`). Every command
//! is acknowledged with a percent-prefixed status line; `%000` is
//! success and anything else is reported verbatim. Preset durations are
//! expressed as a single significant digit times a power of ten, which
//! is all the preset register can hold.

use labbus_core::{GpibAddress, GpibError, GpibInterface, Result, TransferFlags};
use std::sync::Arc;

/// Counter resolution in seconds-preset mode.
pub const SECONDS_PER_TICK: f64 = 0.1;

/// Encode a preset duration as (multiplier, exponent) with
/// `duration == multiplier * 10^exponent` and a 1..=9 multiplier.
///
/// Durations whose mantissa carries more than one significant digit do
/// not fit the preset register and are rejected rather than silently
/// rounded.
pub fn encode_preset(seconds: f64) -> Result<(u32, i32)> {
    if seconds <= 0.0 {
        return Err(GpibError::illegal_argument(
            "",
            format!("count preset {seconds} must be positive"),
        ));
    }

    let exponent = seconds.log10().floor() as i32;
    let mantissa = seconds / 10.0_f64.powi(exponent);
    let multiplier = mantissa.round();

    if (mantissa - multiplier).abs() > 1.0e-6 * mantissa {
        return Err(GpibError::illegal_argument(
            "",
            format!(
                "count preset {seconds} has more than one significant digit; \
                 the preset register holds a single digit times a power of ten"
            ),
        ));
    }

    if multiplier >= 10.0 {
        Ok((1, exponent + 1))
    } else {
        Ok((multiplier as u32, exponent))
    }
}

/// Driver for one Ortec 974 on a GPIB interface.
pub struct Ortec974 {
    name: String,
    interface: Arc<GpibInterface>,
    address: GpibAddress,
}

impl Ortec974 {
    /// Attach to the counter, taking an open reference on its address.
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

    fn check_status_line(&self, command: &str, status: &str) -> Result<()> {
        if status.starts_with("%000") {
            Ok(())
        } else {
            Err(GpibError::device_io(
                &self.name,
                format!("command '{command}' failed with status '{status}'"),
            ))
        }
    }

    /// Send one command and verify its `%`-status acknowledgement.
    pub async fn command(&self, command: &str) -> Result<()> {
        self.interface
            .put_line(self.address, command, TransferFlags::NONE)
            .await?;
        let status = self
            .interface
            .get_line(self.address, TransferFlags::NONE)
            .await?;
        self.check_status_line(command, &status)
    }

    /// Send a query: one data line comes back before the status line.
    pub async fn query(&self, command: &str) -> Result<String> {
        self.interface
            .put_line(self.address, command, TransferFlags::NONE)
            .await?;
        let data = self
            .interface
            .get_line(self.address, TransferFlags::NONE)
            .await?;
        let status = self
            .interface
            .get_line(self.address, TransferFlags::NONE)
            .await?;
        self.check_status_line(command, &status)?;
        Ok(data)
    }

    pub async fn clear_counters(&self) -> Result<()> {
        self.command("CLEAR_COUNTERS").await
    }

    pub async fn start(&self) -> Result<()> {
        self.command("START").await
    }

    pub async fn stop(&self) -> Result<()> {
        self.command("STOP").await
    }

    /// Program the count preset register directly.
    pub async fn set_count_preset(&self, multiplier: u32, exponent: i32) -> Result<()> {
        if !(1..=9).contains(&multiplier) {
            return Err(GpibError::illegal_argument(
                &self.name,
                format!("preset multiplier {multiplier} must be a single digit 1-9"),
            ));
        }
        self.command(&format!("SET_COUNT_PRESET {multiplier},{exponent}"))
            .await
    }

    /// Program a preset measured in seconds (0.1 s resolution).
    pub async fn set_preset_time(&self, seconds: f64) -> Result<()> {
        if seconds > 0.0 && seconds < SECONDS_PER_TICK {
            return Err(GpibError::illegal_argument(
                &self.name,
                format!(
                    "count time {seconds} is below the {SECONDS_PER_TICK} second \
                     resolution of the timer"
                ),
            ));
        }
        let (multiplier, exponent) = encode_preset(seconds)
            .map_err(|e| GpibError::illegal_argument(&self.name, e.message))?;
        self.set_count_preset(multiplier, exponent).await
    }

    /// Read all four counters.
    pub async fn show_counts(&self) -> Result<[u64; 4]> {
        let data = self.query("SHOW_COUNTS").await?;

        let values: Vec<u64> = data
            .split_whitespace()
            .map(|field| field.parse())
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| {
                GpibError::device_io(
                    &self.name,
                    format!("unparseable SHOW_COUNTS response '{data}'"),
                )
            })?;

        values.try_into().map_err(|_| {
            GpibError::device_io(
                &self.name,
                format!("expected four counter values in SHOW_COUNTS response '{data}'"),
            )
        })
    }
}
