//! Error types for the BLE DFU protocol engine.

use thiserror::Error;

use crate::config::DfuResponseStatus;

/// Result type alias for DFU operations.
pub type DfuResult<T> = Result<T, DfuError>;

/// Errors that can occur during a firmware update.
///
/// Variants fall into four categories: pre-flight (package or target
/// rejected before any protocol traffic), connection, transient protocol
/// errors (retried at part granularity), and peer-reported failures.
#[derive(Debug, Error)]
pub enum DfuError {
    /// Standard I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// ZIP archive error.
    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// JSON parsing error for manifest.json.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// No firmware package locator was supplied.
    #[error("No firmware package specified")]
    FileNotSpecified,

    /// Required file missing from the firmware archive.
    #[error("Missing file in firmware archive: {filename}")]
    MissingFile { filename: String },

    /// Invalid or malformed manifest.json.
    #[error("Invalid manifest: {reason}")]
    InvalidManifest { reason: String },

    /// Declared image size does not match the actual image bytes.
    #[error("Image size mismatch for {role}: manifest says {declared}, archive has {actual}")]
    ImageSizeMismatch {
        role: String,
        declared: usize,
        actual: usize,
    },

    /// A part is missing its init packet.
    #[error("Init packet required for {role}")]
    InitPacketRequired { role: String },

    /// The init packet lacks the extended metadata the target requires.
    #[error("Extended init packet required for {role}")]
    ExtendedInitPacketRequired { role: String },

    /// No transport is available to reach the device.
    #[error("No transport available")]
    TransportUnavailable,

    /// The device address is not a valid UUID or MAC-48 string.
    #[error("Invalid device address: {address}")]
    InvalidDeviceAddress { address: String },

    /// No device with the given address could be found.
    #[error("Could not find device {address}")]
    DeviceNotFound { address: String },

    /// Another session is already running against this device.
    #[error("A DFU session is already active for {address}")]
    SessionAlreadyActive { address: String },

    /// The transport could not establish a connection.
    #[error("Failed to connect to {address}")]
    FailedToConnect { address: String },

    /// Device was disconnected during an operation.
    #[error("Device disconnected during {operation}")]
    DeviceDisconnected { operation: String },

    /// A characteristic write was rejected by the link.
    #[error("Writing characteristic failed: {reason}")]
    WritingCharacteristicFailed { reason: String },

    /// No notification arrived within the bounded wait.
    #[error("Receiving notification failed during {operation}")]
    ReceivingNotificationFailed { operation: String },

    /// Local and peer checksums disagree.
    #[error("CRC mismatch: expected 0x{expected:04X}, got 0x{actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// Peer-reported byte count trails the bytes actually sent.
    #[error("Bytes lost: peer received {reported} of {sent} bytes")]
    BytesLost { reported: u32, sent: u32 },

    /// The device cannot perform this update.
    #[error("Device not supported")]
    DeviceNotSupported,

    /// The peer sent a notification this engine cannot interpret.
    #[error("Unsupported response: opcode 0x{opcode:02X}")]
    UnsupportedResponse { opcode: u8 },

    /// The peer reported a protocol failure. The raw status code is
    /// preserved even when it is not a known status.
    #[error("Peer reported failure for opcode 0x{:02X}: {}", .operation, remote_status_text(.status))]
    RemoteFailure { operation: u8, status: u8 },

    /// Operation was cancelled by the caller.
    #[error("Operation cancelled")]
    Cancelled,
}

fn remote_status_text(status: &u8) -> String {
    match DfuResponseStatus::from_byte(*status) {
        Some(known) => known.description().to_string(),
        None => format!("unknown status 0x{:02X}", status),
    }
}

impl DfuError {
    /// Check if this error is retriable within a part's retry budget.
    ///
    /// Only transfer-level transients qualify; peer-reported failures and
    /// pre-flight errors never do.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            DfuError::CrcMismatch { .. }
                | DfuError::BytesLost { .. }
                | DfuError::ReceivingNotificationFailed { .. }
        )
    }

    /// Check if this error was raised before any protocol traffic.
    pub fn is_pre_flight(&self) -> bool {
        matches!(
            self,
            DfuError::Io(_)
                | DfuError::Zip(_)
                | DfuError::Json(_)
                | DfuError::FileNotSpecified
                | DfuError::MissingFile { .. }
                | DfuError::InvalidManifest { .. }
                | DfuError::ImageSizeMismatch { .. }
                | DfuError::InitPacketRequired { .. }
                | DfuError::ExtendedInitPacketRequired { .. }
                | DfuError::TransportUnavailable
                | DfuError::InvalidDeviceAddress { .. }
                | DfuError::DeviceNotFound { .. }
                | DfuError::SessionAlreadyActive { .. }
        )
    }

    /// Get a user-friendly error code for support purposes.
    pub fn error_code(&self) -> &'static str {
        match self {
            DfuError::Io(_) => "DFU-001",
            DfuError::Zip(_) => "DFU-002",
            DfuError::Json(_) => "DFU-003",
            DfuError::FileNotSpecified => "DFU-010",
            DfuError::MissingFile { .. } => "DFU-011",
            DfuError::InvalidManifest { .. } => "DFU-012",
            DfuError::ImageSizeMismatch { .. } => "DFU-013",
            DfuError::InitPacketRequired { .. } => "DFU-014",
            DfuError::ExtendedInitPacketRequired { .. } => "DFU-015",
            DfuError::TransportUnavailable => "DFU-020",
            DfuError::InvalidDeviceAddress { .. } => "DFU-021",
            DfuError::DeviceNotFound { .. } => "DFU-022",
            DfuError::SessionAlreadyActive { .. } => "DFU-023",
            DfuError::FailedToConnect { .. } => "DFU-030",
            DfuError::DeviceDisconnected { .. } => "DFU-031",
            DfuError::WritingCharacteristicFailed { .. } => "DFU-032",
            DfuError::ReceivingNotificationFailed { .. } => "DFU-033",
            DfuError::CrcMismatch { .. } => "DFU-040",
            DfuError::BytesLost { .. } => "DFU-041",
            DfuError::DeviceNotSupported => "DFU-050",
            DfuError::UnsupportedResponse { .. } => "DFU-051",
            DfuError::RemoteFailure { .. } => "DFU-060",
            DfuError::Cancelled => "DFU-099",
        }
    }
}
