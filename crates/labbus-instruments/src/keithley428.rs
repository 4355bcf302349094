//! Keithley 428 programmable current amplifier.
//!
//! Protocol: single-letter device-dependent commands with a trailing
//! execute character over GPIB ("R7X" sets the gain range, "U0X"
//! queries the machine status word, "U1X" the error status word). The
//! instrument always talks back after a command; unwanted responses are
//! read and discarded so the bus stays in step. Unless bypassed, every
//! command is followed by a `U1X` error-status query whose digit flags
//! are translated through the documented error list.

use labbus_core::{
    GpibAddress, GpibError, GpibErrorKind, GpibInterface, Result, TransferFlags,
};
use std::sync::Arc;
use tracing::warn;

/// Offset of the `P<n>R` filter-enable field in the U0 status word.
const FILTER_ENABLE_OFFSET: usize = 22;
/// Offset of the `R<n>S` gain field in the U0 status word.
const GAIN_CHAR_OFFSET: usize = 24;
/// Offset of the `T<n>W` rise-time field in the U0 status word.
const TIME_CONSTANT_CHAR_OFFSET: usize = 30;

/// U1 error-status word reporting no errors.
const CLEAN_ERROR_STATUS: &str = "42800000000000";

/// Index of the overload flag, which is tolerated with a warning when
/// transient.
const OVERLOAD_INDEX: usize = 9;

/// One entry per digit position of the U1 error status word.
const ERROR_FLAGS: [(GpibErrorKind, &str); 11] = [
    (GpibErrorKind::IllegalArgument, "Invalid Device-dependent Command received."),
    (GpibErrorKind::IllegalArgument, "Invalid Device-dependent Command Option received."),
    (GpibErrorKind::InterfaceIo, "Remote line was false."),
    (GpibErrorKind::ControllerInternal, "Self-test failed."),
    (GpibErrorKind::IllegalArgument, "Suppression range/value conflict."),
    (GpibErrorKind::WouldExceedLimit, "Input current too large to suppress."),
    (GpibErrorKind::IllegalArgument, "Auto-suppression requested with zero check on."),
    (GpibErrorKind::DeviceIo, "Zero correct failed."),
    (GpibErrorKind::ControllerInternal, "EEPROM checksum error."),
    (GpibErrorKind::WouldExceedLimit, "Overload condition."),
    (GpibErrorKind::IllegalArgument, "Gain/rise time conflict."),
];

/// Filter rise times selectable with `T<n>X`, in seconds.
const RISE_TIMES: [f64; 10] = [
    1.0e-5, 3.0e-5, 1.0e-4, 3.0e-4, 1.0e-3, 3.0e-3, 1.0e-2, 3.0e-2, 0.1, 0.3,
];

fn relative_difference(a: f64, b: f64) -> f64 {
    let scale = a.abs().max(b.abs());
    if scale == 0.0 {
        0.0
    } else {
        (a - b).abs() / scale
    }
}

/// Driver for one Keithley 428 on a GPIB interface.
pub struct Keithley428 {
    name: String,
    interface: Arc<GpibInterface>,
    address: GpibAddress,
    /// Skip the U1X error-status query after each command.
    pub bypass_error_check: bool,
}

impl Keithley428 {
    /// Attach to the amplifier, taking an open reference on its address.
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
            bypass_error_check: false,
        })
    }

    /// Send one command and return its response line (the 428 always
    /// sends one; it is read and discarded when not wanted).
    pub async fn command(&self, command: &str, want_response: bool) -> Result<Option<String>> {
        self.interface
            .put_line(self.address, command, TransferFlags::NONE)
            .await?;

        let response = self
            .interface
            .get_line(self.address, TransferFlags::NONE)
            .await?;

        if !self.bypass_error_check {
            self.check_error_status(command).await?;
        }

        Ok(want_response.then_some(response))
    }

    /// Query the U1 error-status word and translate any raised flag.
    async fn check_error_status(&self, command: &str) -> Result<()> {
        self.interface
            .put_line(self.address, "U1X", TransferFlags::NONE)
            .await?;
        let error_status = self
            .interface
            .get_line(self.address, TransferFlags::NONE)
            .await?;

        if error_status == CLEAN_ERROR_STATUS {
            return Ok(());
        }

        // Without the model-number prefix the instrument is probably
        // not connected or powered.
        if !error_status.starts_with("428") {
            return Err(GpibError::device_io(
                &self.name,
                format!(
                    "attempt to contact the Keithley 428 at GPIB address {} failed.  \
                     Is it turned on?  error_status = '{error_status}'",
                    self.address
                ),
            ));
        }

        let flags: Vec<char> = error_status.chars().skip(3).collect();
        for (index, (kind, message)) in ERROR_FLAGS.iter().enumerate() {
            if flags.get(index).copied().unwrap_or('0') == '0' {
                continue;
            }
            if index == OVERLOAD_INDEX {
                warn!(
                    device = %self.name,
                    address = %self.address,
                    "Keithley overload detected"
                );
                if flags.get(index + 1).copied().unwrap_or('0') == '0' {
                    return Ok(());
                }
                continue;
            }
            return Err(GpibError::new(
                &self.name,
                *kind,
                format!("command '{command}' failed.  Reason = '{message}'"),
            ));
        }

        Err(GpibError::device_io(
            &self.name,
            format!(
                "the command '{command}' failed, but the U1 error status word \
                 returned was unrecognizable.  U1 error status word = '{error_status}'"
            ),
        ))
    }

    /// Fetch the U0 machine status word, verifying it is long enough to
    /// parse.
    pub async fn machine_status_word(&self) -> Result<String> {
        let word = self
            .command("U0X", true)
            .await?
            .unwrap_or_default();

        if word.len() < 14 {
            return Err(GpibError::device_io(
                &self.name,
                format!("machine status word '{word}' returned was truncated"),
            ));
        }
        Ok(word)
    }

    fn parse_status_digit(&self, word: &str, offset: usize, prefix: char, suffix: char) -> Result<i32> {
        let malformed = || {
            GpibError::device_io(
                &self.name,
                format!("incorrectly formatted machine status word.  Contents = '{word}'"),
            )
        };

        let field = word.get(offset..).ok_or_else(malformed)?;
        let mut chars = field.chars();
        if chars.next() != Some(prefix) {
            return Err(malformed());
        }
        let digits: String = chars.clone().take_while(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() {
            return Err(malformed());
        }
        if chars.nth(digits.len()) != Some(suffix) {
            return Err(malformed());
        }
        digits.parse().map_err(|_| malformed())
    }

    /// Current gain in volts per ampere, decoded from the `R<n>S` field
    /// of the status word.
    pub async fn gain(&self) -> Result<f64> {
        let word = self.machine_status_word().await?;
        let setting = self.parse_status_digit(&word, GAIN_CHAR_OFFSET, 'R', 'S')?;
        Ok(10.0_f64.powi(setting))
    }

    /// Set the gain, which must be a decade in the 1e3..=1e10 range.
    /// The current-suppression offset survives the range change.
    pub async fn set_gain(&self, gain: f64) -> Result<f64> {
        let setting = gain.log10().round() as i32;
        let rounded_gain = 10.0_f64.powi(setting);

        if !(3..=10).contains(&setting) {
            return Err(GpibError::illegal_argument(
                &self.name,
                format!(
                    "illegal gain setting {rounded_gain:e}.  Allowed range is 1.0e3 to 1.0e10.  \
                     Specify gain multipliers like 1.0e4 rather than gain ranges like 4"
                ),
            ));
        }

        // Changing the range invalidates the suppression setting, so
        // save it first and restore it afterwards.
        let offset = self.offset().await?;

        self.command(&format!("R{setting}X"), false).await?;
        self.set_offset(offset).await?;

        Ok(rounded_gain)
    }

    /// Current offset in volts, derived from the current-suppression
    /// setting and the gain.
    pub async fn offset(&self) -> Result<f64> {
        let response = self.command("UX", true).await?.unwrap_or_default();

        let suppress: f64 = response
            .get(4..)
            .and_then(|s| {
                let number: String = s
                    .chars()
                    .take_while(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '.' | 'E' | 'e'))
                    .collect();
                number.parse().ok()
            })
            .ok_or_else(|| {
                GpibError::device_io(
                    &self.name,
                    format!("current suppression value not found in response '{response}'"),
                )
            })?;

        let gain = self.gain().await?;
        Ok(-(suppress * gain))
    }

    /// Program the current suppression so the output sits at `offset`
    /// volts, using auto-ranging.
    pub async fn set_offset(&self, offset: f64) -> Result<()> {
        let gain = self.gain().await?;
        let suppression = -(offset / gain);

        self.command("S,0X", false).await?;
        self.command(&format!("S{suppression:e},X"), false).await?;
        self.command("N1X", false).await
            .map(|_| ())
    }

    /// Filter time constant in seconds; zero when the filter is off.
    pub async fn time_constant(&self) -> Result<f64> {
        let word = self.machine_status_word().await?;

        let filter_enabled =
            self.parse_status_digit(&word, FILTER_ENABLE_OFFSET, 'P', 'R')?;
        if filter_enabled == 0 {
            return Ok(0.0);
        }

        let setting = self.parse_status_digit(&word, TIME_CONSTANT_CHAR_OFFSET, 'T', 'W')?;
        RISE_TIMES
            .get(setting as usize)
            .copied()
            .ok_or_else(|| {
                GpibError::device_io(
                    &self.name,
                    format!(
                        "illegal rise time setting {setting} found in machine \
                         status word '{word}'"
                    ),
                )
            })
    }

    /// Select the nearest filter rise time, or disable the filter for a
    /// time constant of zero.
    pub async fn set_time_constant(&self, time_constant: f64) -> Result<()> {
        let mut enable_filter = true;
        let mut range: Option<usize> = None;

        if relative_difference(time_constant, 0.0) < 0.5 {
            enable_filter = false;
        } else {
            for (index, nominal) in RISE_TIMES.iter().enumerate().rev() {
                if relative_difference(time_constant, *nominal) < 0.5 {
                    range = Some(index);
                    break;
                }
            }
            if range.is_none() {
                return Err(GpibError::illegal_argument(
                    &self.name,
                    format!(
                        "illegal Keithley filter rise time {time_constant:e}.  The legal \
                         range is 1e-5 to 0.3 sec, or 0 to disable the filter"
                    ),
                ));
            }
        }

        if let Some(range) = range {
            match self.command(&format!("T{range}X"), false).await {
                Ok(_) => {}
                Err(e) if e.kind() == GpibErrorKind::IllegalArgument => {
                    warn!(device = %self.name, "Keithley rise time filter disabled");
                    enable_filter = false;
                }
                Err(e) => return Err(e),
            }
        }

        if enable_filter {
            self.command("P1X", false).await.map(|_| ())
        } else {
            self.command("P0X", false).await.map(|_| ())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::scripted_interface;

    fn addr(n: u8) -> GpibAddress {
        GpibAddress::try_from(n).unwrap()
    }

    /// A plausible U0 status word: filter field `P1R` at offset 22,
    /// gain field `R<nn>S` at offset 24, rise time `T<n>W` at offset 30.
    fn status_word(gain: u32, filter: u8, rise_time: u8) -> String {
        format!(
            "4281000000000000000000P{filter}R{gain:02}S00T{rise_time}W000",
        )
    }

    async fn amp() -> (Keithley428, Arc<crate::testutil::Script>) {
        let (interface, script) = scripted_interface();
        let amp = Keithley428::open("k428", interface, addr(15)).await.unwrap();
        (amp, script)
    }

    #[tokio::test]
    async fn gain_is_decoded_from_the_status_word() {
        let (amp, script) = amp().await;
        script.push_response(&status_word(7, 1, 0));
        script.push_response(CLEAN_ERROR_STATUS);

        assert_eq!(amp.gain().await.unwrap(), 1.0e7);
        assert_eq!(script.sent_lines(), vec!["U0X", "U1X"]);
    }

    #[tokio::test]
    async fn truncated_status_word_is_a_device_error() {
        let (amp, script) = amp().await;
        script.push_response("428R7");
        script.push_response(CLEAN_ERROR_STATUS);

        let err = amp.machine_status_word().await.unwrap_err();
        assert_eq!(err.kind(), GpibErrorKind::DeviceIo);
        assert!(err.to_string().contains("truncated"));
    }

    #[tokio::test]
    async fn malformed_gain_field_is_a_device_error() {
        let (amp, script) = amp().await;
        // Long enough, but garbage where the gain field should be.
        script.push_response("42810000000000000000000000000000000");
        script.push_response(CLEAN_ERROR_STATUS);

        let err = amp.gain().await.unwrap_err();
        assert_eq!(err.kind(), GpibErrorKind::DeviceIo);
    }

    #[tokio::test]
    async fn out_of_range_gain_is_rejected_without_io() {
        let (amp, _script) = amp().await;
        let err = amp.set_gain(100.0).await.unwrap_err();
        assert_eq!(err.kind(), GpibErrorKind::IllegalArgument);
    }

    #[tokio::test]
    async fn error_status_flags_are_translated() {
        let (amp, script) = amp().await;
        script.push_response("OK");
        // Flag 3 (self-test failed) raised.
        script.push_response("42800010000000");

        let err = amp.command("R5X", false).await.unwrap_err();
        assert_eq!(err.kind(), GpibErrorKind::ControllerInternal);
        assert!(err.to_string().contains("Self-test failed"));
    }

    #[tokio::test]
    async fn transient_overload_is_tolerated_with_a_warning() {
        let (amp, script) = amp().await;
        script.push_response("OK");
        // Only the overload flag (position 9) is set.
        script.push_response("42800000000100");

        amp.command("R5X", false).await.unwrap();
    }

    #[tokio::test]
    async fn missing_model_prefix_means_instrument_absent() {
        let (amp, script) = amp().await;
        script.push_response("OK");
        script.push_response("junk");

        let err = amp.command("R5X", false).await.unwrap_err();
        assert_eq!(err.kind(), GpibErrorKind::DeviceIo);
        assert!(err.to_string().contains("turned on"));
    }

    #[tokio::test]
    async fn time_constant_reads_zero_when_filter_is_off() {
        let (amp, script) = amp().await;
        script.push_response(&status_word(5, 0, 4));
        script.push_response(CLEAN_ERROR_STATUS);

        assert_eq!(amp.time_constant().await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn time_constant_maps_the_rise_time_table() {
        let (amp, script) = amp().await;
        script.push_response(&status_word(5, 1, 9));
        script.push_response(CLEAN_ERROR_STATUS);

        assert_eq!(amp.time_constant().await.unwrap(), 0.3);
    }
}
