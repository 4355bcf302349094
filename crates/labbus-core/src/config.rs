//! Interface-wide settings and per-address state.

use crate::address::Termination;
use serde::Deserialize;
use std::time::Duration;

fn default_io_timeout() -> Option<Duration> {
    Some(Duration::from_secs(5))
}

fn default_true() -> bool {
    true
}

/// Interface-wide defaults for every address on the bus.
///
/// These seed the per-address [`AddressState`] table when an interface is
/// created; individual addresses can be reconfigured afterwards.
#[derive(Debug, Clone, Deserialize)]
pub struct GpibSettings {
    /// Default I/O timeout. `None` disables the deadline entirely.
    #[serde(with = "humantime_serde", default = "default_io_timeout")]
    pub io_timeout: Option<Duration>,
    /// Assert EOI with the last byte of each transfer.
    #[serde(default = "default_true")]
    pub eoi_mode: bool,
    /// Terminator expected at the end of incoming messages.
    #[serde(default)]
    pub read_terminator: Termination,
    /// Terminator appended to outgoing messages.
    #[serde(default)]
    pub write_terminator: Termination,
}

impl Default for GpibSettings {
    fn default() -> Self {
        Self {
            io_timeout: default_io_timeout(),
            eoi_mode: true,
            read_terminator: Termination::LF,
            write_terminator: Termination::LF,
        }
    }
}

/// Mutable per-address configuration and bookkeeping.
///
/// One of these exists for each of the 31 primary addresses. The open
/// reference count is private to the address table; everything else is
/// plain configuration handed to adapters at call time.
#[derive(Debug, Clone)]
pub struct AddressState {
    pub(crate) open_count: u32,
    pub io_timeout: Option<Duration>,
    pub eoi_mode: bool,
    pub read_terminator: Termination,
    pub write_terminator: Termination,
    pub secondary_address: u8,
}

impl AddressState {
    /// A fresh state slot seeded from interface-wide defaults.
    pub fn new(settings: &GpibSettings) -> Self {
        Self::from_settings(settings)
    }

    pub(crate) fn from_settings(settings: &GpibSettings) -> Self {
        Self {
            open_count: 0,
            io_timeout: settings.io_timeout,
            eoi_mode: settings.eoi_mode,
            read_terminator: settings.read_terminator,
            write_terminator: settings.write_terminator,
            secondary_address: 0,
        }
    }

    /// Number of open references currently held on this address.
    pub fn open_count(&self) -> u32 {
        self.open_count
    }

    /// The timeout expressed as floating-point seconds, negative when
    /// disabled. This is the form vendor timeout ladders work in.
    pub fn io_timeout_seconds(&self) -> f64 {
        match self.io_timeout {
            Some(t) => t.as_secs_f64(),
            None => -1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_seed_address_state() {
        let settings = GpibSettings {
            io_timeout: Some(Duration::from_millis(100)),
            eoi_mode: false,
            read_terminator: Termination::CR,
            write_terminator: Termination::CR,
        };
        let state = AddressState::from_settings(&settings);
        assert_eq!(state.open_count(), 0);
        assert_eq!(state.read_terminator, Termination::CR);
        assert!(!state.eoi_mode);
        assert!((state.io_timeout_seconds() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn disabled_timeout_is_negative_seconds() {
        let state = AddressState {
            open_count: 0,
            io_timeout: None,
            eoi_mode: true,
            read_terminator: Termination::LF,
            write_terminator: Termination::LF,
            secondary_address: 0,
        };
        assert!(state.io_timeout_seconds() < 0.0);
    }

    #[test]
    fn settings_parse_from_toml() {
        let settings: GpibSettings = toml::from_str(
            r#"
            io_timeout = "250ms"
            eoi_mode = true
            read_terminator = 0x0a
            write_terminator = 0x0d0a
            "#,
        )
        .unwrap();
        assert_eq!(settings.io_timeout, Some(Duration::from_millis(250)));
        assert_eq!(settings.write_terminator, Termination::CRLF);
    }
}
