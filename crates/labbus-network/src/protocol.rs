//! Wire format for proxied GPIB operations: one JSON object per line in
//! each direction, matched up by request id.

use labbus_core::{GpibError, GpibErrorKind};
use serde::{Deserialize, Serialize};

/// The proxied operation vocabulary, mirroring the bus trait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    OpenDevice,
    CloseDevice,
    Read,
    Write,
    InterfaceClear,
    DeviceClear,
    SelectiveDeviceClear,
    LocalLockout,
    RemoteEnable,
    GoToLocal,
    Trigger,
    WaitForServiceRequest,
    SerialPoll,
    SerialPollDisable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub op: Op,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_len: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_byte: Option<u8>,
}

impl Response {
    pub fn success(id: u64) -> Self {
        Self {
            id,
            ok: true,
            error_kind: None,
            message: None,
            data: None,
            bytes: None,
            status_byte: None,
        }
    }

    pub fn failure(id: u64, error: &GpibError) -> Self {
        Self {
            id,
            ok: false,
            error_kind: Some(error.kind().label().to_string()),
            message: Some(error.message.clone()),
            data: None,
            bytes: None,
            status_byte: None,
        }
    }
}

/// Re-hydrate a remote error kind from its wire label. Unknown labels
/// land in `InterfaceIo`, since by definition something on the link is
/// out of step.
pub fn kind_from_label(label: &str) -> GpibErrorKind {
    match label {
        "illegal_argument" => GpibErrorKind::IllegalArgument,
        "device_io" => GpibErrorKind::DeviceIo,
        "interface_io" => GpibErrorKind::InterfaceIo,
        "timed_out" => GpibErrorKind::TimedOut,
        "not_ready" => GpibErrorKind::NotReady,
        "not_implemented" => GpibErrorKind::NotImplemented,
        "unsupported" => GpibErrorKind::Unsupported,
        "permission_denied" => GpibErrorKind::PermissionDenied,
        "hardware_fault" => GpibErrorKind::HardwareFault,
        "would_exceed_limit" => GpibErrorKind::WouldExceedLimit,
        "controller_internal" => GpibErrorKind::ControllerInternal,
        "configuration_error" => GpibErrorKind::ConfigurationError,
        "io" => GpibErrorKind::Io,
        _ => GpibErrorKind::InterfaceIo,
    }
}
