//! Error types shared by every bus adapter and instrument driver.
//!
//! The stack uses a single flat taxonomy ([`GpibErrorKind`]) so that vendor
//! and bridge specific status codes from every adapter land in one common
//! set of categories, the same way all drivers share one generic error
//! enumeration in the control systems this crate is modeled on. Adapters
//! translate their native codes (vendor `iberr` values, bridge status
//! numbers, instrument error words) into a kind plus a message that always
//! names the interface and, where applicable, the literal command that
//! failed.

use thiserror::Error;

/// Category of a GPIB failure.
///
/// Mirrors the generic error enumeration of the surrounding control
/// framework: transport failures, device failures, timeouts, and the
/// various flavors of "you asked for something this adapter cannot do".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpibErrorKind {
    /// Out-of-range or malformed parameter (bad address, bad terminator).
    IllegalArgument,
    /// The device answered, but with something malformed or unexpected.
    DeviceIo,
    /// The transport underneath the bus failed (serial line, socket, PV).
    InterfaceIo,
    /// An I/O deadline expired.
    TimedOut,
    /// The device is in a state where the request cannot be honored.
    NotReady,
    /// The operation exists in the protocol but is not written yet.
    NotImplemented,
    /// The adapter has no way to perform this bus operation at all.
    Unsupported,
    /// The device is in local/lockout mode and refused remote control.
    PermissionDenied,
    /// The controller reported a hardware failure.
    HardwareFault,
    /// A buffer, range, or device limit would be exceeded.
    WouldExceedLimit,
    /// The controller reported an internal fault (self test, NVRAM, ...).
    ControllerInternal,
    /// The attached hardware is not the device the configuration claims.
    ConfigurationError,
    /// An operating-system I/O error.
    Io,
}

impl GpibErrorKind {
    /// Snake-case label used in rendered messages and logs.
    pub fn label(&self) -> &'static str {
        match self {
            GpibErrorKind::IllegalArgument => "illegal_argument",
            GpibErrorKind::DeviceIo => "device_io",
            GpibErrorKind::InterfaceIo => "interface_io",
            GpibErrorKind::TimedOut => "timed_out",
            GpibErrorKind::NotReady => "not_ready",
            GpibErrorKind::NotImplemented => "not_implemented",
            GpibErrorKind::Unsupported => "unsupported",
            GpibErrorKind::PermissionDenied => "permission_denied",
            GpibErrorKind::HardwareFault => "hardware_fault",
            GpibErrorKind::WouldExceedLimit => "would_exceed_limit",
            GpibErrorKind::ControllerInternal => "controller_internal",
            GpibErrorKind::ConfigurationError => "configuration_error",
            GpibErrorKind::Io => "io",
        }
    }
}

impl std::fmt::Display for GpibErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

fn render(interface: &str, kind: &GpibErrorKind, message: &str) -> String {
    if interface.is_empty() {
        format!("GPIB {kind} error: {message}")
    } else {
        format!("GPIB interface '{interface}' {kind} error: {message}")
    }
}

/// A categorized failure from a bus adapter or instrument driver.
///
/// Carries the interface (or device) name so that an error surfaced many
/// layers up still says which piece of hardware it came from.
#[derive(Error, Debug, Clone)]
#[error("{}", render(.interface, .kind, .message))]
pub struct GpibError {
    /// Name of the interface or device record the failure belongs to.
    pub interface: String,
    /// Failure category.
    pub kind: GpibErrorKind,
    /// Human-readable detail, including the offending command where known.
    pub message: String,
}

impl GpibError {
    pub fn new(
        interface: impl Into<String>,
        kind: GpibErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            interface: interface.into(),
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> GpibErrorKind {
        self.kind
    }

    pub fn illegal_argument(interface: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(interface, GpibErrorKind::IllegalArgument, message)
    }

    pub fn device_io(interface: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(interface, GpibErrorKind::DeviceIo, message)
    }

    pub fn interface_io(interface: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(interface, GpibErrorKind::InterfaceIo, message)
    }

    pub fn timed_out(interface: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(interface, GpibErrorKind::TimedOut, message)
    }

    pub fn not_ready(interface: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(interface, GpibErrorKind::NotReady, message)
    }

    pub fn not_implemented(interface: impl Into<String>, operation: &str) -> Self {
        Self::new(
            interface,
            GpibErrorKind::NotImplemented,
            format!("{operation} is not yet implemented"),
        )
    }

    pub fn unsupported(interface: impl Into<String>, operation: &str) -> Self {
        Self::new(
            interface,
            GpibErrorKind::Unsupported,
            format!("{operation} is not supported by this interface"),
        )
    }

    pub fn permission_denied(interface: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(interface, GpibErrorKind::PermissionDenied, message)
    }

    pub fn hardware_fault(interface: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(interface, GpibErrorKind::HardwareFault, message)
    }

    pub fn would_exceed_limit(interface: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(interface, GpibErrorKind::WouldExceedLimit, message)
    }

    pub fn controller_internal(interface: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(interface, GpibErrorKind::ControllerInternal, message)
    }

    pub fn configuration(interface: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(interface, GpibErrorKind::ConfigurationError, message)
    }

    pub fn io(interface: impl Into<String>, source: &std::io::Error) -> Self {
        Self::new(interface, GpibErrorKind::Io, source.to_string())
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, GpibError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_includes_interface_and_kind() {
        let err = GpibError::device_io("gpib0", "truncated response to 'U0X'");
        assert_eq!(
            err.to_string(),
            "GPIB interface 'gpib0' device_io error: truncated response to 'U0X'"
        );
    }

    #[test]
    fn error_display_without_interface() {
        let err = GpibError::illegal_argument("", "address 42 out of range");
        assert_eq!(
            err.to_string(),
            "GPIB illegal_argument error: address 42 out of range"
        );
    }

    #[test]
    fn kind_accessor() {
        let err = GpibError::timed_out("gpib0", "no SRQ within 2s");
        assert_eq!(err.kind(), GpibErrorKind::TimedOut);
    }
}
