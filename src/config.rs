//! Configuration constants for the BLE DFU protocol engine.

use std::time::Duration;

// ============================================================================
// Transfer Parameters
// ============================================================================

/// Payload size for firmware data packets on the data channel.
///
/// The legacy DFU service accepts 20-byte writes (ATT default MTU minus
/// the 3-byte header), so chunking never depends on MTU negotiation.
pub const DFU_PACKET_SIZE: usize = 20;

/// Default packet receipt notification interval (packets per receipt).
///
/// 0 disables receipt notifications entirely.
pub const DEFAULT_PRN_INTERVAL: u16 = 10;

// ============================================================================
// Protocol Timeouts
// ============================================================================

/// Timeout waiting for a control-point response notification.
///
/// Covers the worst case of a full-bank flash erase after StartDfu.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Timeout waiting for a packet receipt notification during upload.
pub const RECEIPT_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Timeout for re-establishing the link after a peer-side reset.
pub const RECONNECT_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Settle time before reconnecting to a peer that has just reset.
pub const RESET_SETTLE_TIME: Duration = Duration::from_millis(400);

// ============================================================================
// Retry Configuration
// ============================================================================

/// Transfer attempts per part (first attempt plus transient-error retries).
pub const MAX_TRANSFER_ATTEMPTS: u8 = 3;

/// Validation attempts per part. A checksum mismatch at validation earns
/// exactly one part restart before becoming fatal.
pub const MAX_VALIDATE_ATTEMPTS: u8 = 2;

// ============================================================================
// DFU Opcodes (Legacy DFU Protocol v0.5)
// ============================================================================

/// Legacy DFU operation opcodes.
///
/// Single-byte opcodes written to the control point characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DfuOpcode {
    /// Start DFU with image type; sizes follow on the data channel
    StartDfu = 0x01,
    /// Initialize DFU parameters (init packet begin/complete)
    InitDfuParams = 0x02,
    /// Receive firmware image (data chunks follow)
    ReceiveFirmwareImage = 0x03,
    /// Validate the received firmware
    ValidateFirmware = 0x04,
    /// Activate firmware and reset device
    ActivateAndReset = 0x05,
    /// System reset without activation
    SystemReset = 0x06,
    /// Report received image size and checksum
    ReportReceivedImageSize = 0x07,
    /// Request packet receipt notification interval
    PacketReceiptNotificationRequest = 0x08,
    /// Response notification from the peer
    Response = 0x10,
    /// Packet receipt notification from the peer
    PacketReceiptNotification = 0x11,
}

impl DfuOpcode {
    /// Parse an opcode from a byte value.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(DfuOpcode::StartDfu),
            0x02 => Some(DfuOpcode::InitDfuParams),
            0x03 => Some(DfuOpcode::ReceiveFirmwareImage),
            0x04 => Some(DfuOpcode::ValidateFirmware),
            0x05 => Some(DfuOpcode::ActivateAndReset),
            0x06 => Some(DfuOpcode::SystemReset),
            0x07 => Some(DfuOpcode::ReportReceivedImageSize),
            0x08 => Some(DfuOpcode::PacketReceiptNotificationRequest),
            0x10 => Some(DfuOpcode::Response),
            0x11 => Some(DfuOpcode::PacketReceiptNotification),
            _ => None,
        }
    }
}

/// Init packet transfer phases (parameter byte for InitDfuParams).
pub const INIT_PACKET_RECEIVE_START: u8 = 0x00;

/// Init packet complete marker.
pub const INIT_PACKET_RECEIVE_COMPLETE: u8 = 0x01;

/// Buttonless jump command: enter bootloader and re-advertise with the
/// DFU service. Written to the control point while in application mode.
pub const ENTER_BOOTLOADER_COMMAND: &[u8] = &[0x01, 0x04];

/// Buttonless command to set the name advertised after the jump. Followed
/// by a length byte and the UTF-8 name. Only valid before the jump.
pub const SET_ADVERTISED_NAME_OPCODE: u8 = 0x02;

// ============================================================================
// DFU Image Types
// ============================================================================

/// DFU image type (which firmware component is being updated).
///
/// Sent as a single byte in the StartDfu command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DfuImageType {
    SoftDevice = 0x01,
    Bootloader = 0x02,
    Application = 0x04,
}

// ============================================================================
// DFU Response Status Codes
// ============================================================================

/// DFU response status codes reported by the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DfuResponseStatus {
    Success = 0x01,
    InvalidState = 0x02,
    NotSupported = 0x03,
    DataSizeExceedsLimit = 0x04,
    CrcError = 0x05,
    OperationFailed = 0x06,
}

impl DfuResponseStatus {
    /// Parse a status code from a byte value.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(DfuResponseStatus::Success),
            0x02 => Some(DfuResponseStatus::InvalidState),
            0x03 => Some(DfuResponseStatus::NotSupported),
            0x04 => Some(DfuResponseStatus::DataSizeExceedsLimit),
            0x05 => Some(DfuResponseStatus::CrcError),
            0x06 => Some(DfuResponseStatus::OperationFailed),
            _ => None,
        }
    }

    /// Get a human-readable description.
    pub fn description(&self) -> &'static str {
        match self {
            DfuResponseStatus::Success => "Operation successful",
            DfuResponseStatus::InvalidState => "Invalid state for this operation",
            DfuResponseStatus::NotSupported => "Operation not supported",
            DfuResponseStatus::DataSizeExceedsLimit => "Data size exceeds limit",
            DfuResponseStatus::CrcError => "CRC validation failed",
            DfuResponseStatus::OperationFailed => "Operation failed",
        }
    }
}
