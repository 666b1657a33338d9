//! External event surface.
//!
//! Maps internal states and errors to the named event codes an embedding
//! application layer forwards verbatim, and defines the serializable
//! payloads that accompany them. Payload keys are camelCase to match the
//! event-bridge convention of host applications.

use serde::Serialize;

use crate::config::DfuResponseStatus;
use crate::error::DfuError;
use crate::progress::ProgressSample;
use crate::protocol::DfuState;

/// Name of the state-changed event stream.
pub const STATE_CHANGED_EVENT: &str = "DFUStateChanged";

/// Name of the progress event stream.
pub const PROGRESS_EVENT: &str = "DFUProgress";

/// Severity of a protocol log line delivered to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// External name for a session state.
///
/// The external surface is coarser than the internal state machine:
/// several protocol steps surface as one name.
pub fn state_event_name(state: DfuState) -> &'static str {
    match state {
        DfuState::Connecting => "CONNECTING",
        DfuState::EnablingDfuMode => "ENABLING_DFU_MODE",
        DfuState::Starting | DfuState::CreatingObject => "DFU_PROCESS_STARTING",
        DfuState::Uploading => "DFU_STATE_UPLOADING",
        DfuState::Validating => "FIRMWARE_VALIDATING",
        DfuState::Activating => "DEVICE_DISCONNECTING",
        DfuState::Completed => "DFU_COMPLETED",
        DfuState::Aborted => "DFU_ABORTED",
        DfuState::Failed => "DFU_FAILED",
        DfuState::Idle => "UNKNOWN_STATE",
    }
}

/// Rejection code for a failed session.
///
/// Pre-flight failures use lower-case codes; protocol failures use the
/// `DFUError*` naming shared with other platform bindings. Unknown peer
/// status codes map to `UNKNOWN_ERROR`, never to a guessed variant.
pub fn rejection_code(error: &DfuError) -> &'static str {
    match error {
        DfuError::TransportUnavailable => "nil_central_manager",
        DfuError::InvalidDeviceAddress { .. } => "invalid_device_address",
        DfuError::DeviceNotFound { .. } => "unable_to_find_device",
        DfuError::SessionAlreadyActive { .. } => "session_already_active",
        DfuError::Cancelled => "dfu_aborted",

        DfuError::FileNotSpecified => "DFUErrorFileNotSpecified",
        DfuError::Io(_)
        | DfuError::Zip(_)
        | DfuError::Json(_)
        | DfuError::MissingFile { .. }
        | DfuError::InvalidManifest { .. }
        | DfuError::ImageSizeMismatch { .. } => "DFUErrorFileInvalid",
        DfuError::InitPacketRequired { .. } => "DFUErrorInitPacketRequired",
        DfuError::ExtendedInitPacketRequired { .. } => "DFUErrorExtendedInitPacketRequired",

        DfuError::FailedToConnect { .. } => "DFUErrorFailedToConnect",
        DfuError::DeviceDisconnected { .. } => "DFUErrorDeviceDisconnected",
        DfuError::WritingCharacteristicFailed { .. } => "DFUErrorWritingCharacteristicFailed",
        DfuError::ReceivingNotificationFailed { .. } => "DFUErrorReceivingNotificationFailed",

        DfuError::CrcMismatch { .. } => "DFUErrorCrcError",
        DfuError::BytesLost { .. } => "DFUErrorBytesLost",
        DfuError::DeviceNotSupported => "DFUErrorDeviceNotSupported",
        DfuError::UnsupportedResponse { .. } => "DFUErrorUnsupportedResponse",

        DfuError::RemoteFailure { status, .. } => match DfuResponseStatus::from_byte(*status) {
            Some(DfuResponseStatus::Success) => "DFUErrorRemoteLegacyDFUSuccess",
            Some(DfuResponseStatus::InvalidState) => "DFUErrorRemoteLegacyDFUInvalidState",
            Some(DfuResponseStatus::NotSupported) => "DFUErrorRemoteLegacyDFUNotSupported",
            Some(DfuResponseStatus::DataSizeExceedsLimit) => {
                "DFUErrorRemoteLegacyDFUDataExceedsLimit"
            }
            Some(DfuResponseStatus::CrcError) => "DFUErrorRemoteLegacyDFUCrcError",
            Some(DfuResponseStatus::OperationFailed) => "DFUErrorRemoteLegacyDFUOperationFailed",
            None => "UNKNOWN_ERROR",
        },
    }
}

/// Payload of a state-changed event.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChangedEvent {
    pub device_address: String,
    pub state: &'static str,
}

impl StateChangedEvent {
    pub fn new(device_address: &str, state: DfuState) -> Self {
        Self {
            device_address: device_address.to_string(),
            state: state_event_name(state),
        }
    }
}

/// Payload of a progress event.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub device_address: String,
    pub current_part: usize,
    pub parts_total: usize,
    pub speed: f64,
    pub avg_speed: f64,
}

impl ProgressEvent {
    pub fn new(device_address: &str, sample: &ProgressSample) -> Self {
        Self {
            device_address: device_address.to_string(),
            current_part: sample.part,
            parts_total: sample.total_parts,
            speed: sample.speed_bps,
            avg_speed: sample.avg_speed_bps,
        }
    }
}

/// Payload of an error event, emitted before the terminal `DFU_FAILED`
/// state change.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    pub device_address: String,
    pub error_code: &'static str,
    pub message: String,
}

impl ErrorEvent {
    pub fn new(device_address: &str, error: &DfuError) -> Self {
        Self {
            device_address: device_address.to_string(),
            error_code: rejection_code(error),
            message: error.to_string(),
        }
    }
}
