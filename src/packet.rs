//! Control-point command encoding and notification parsing.
//!
//! The legacy DFU service carries single-byte opcodes (plus parameters) on
//! the control point characteristic and raw image bytes on the data
//! characteristic. GATT frames each write, so no additional link framing is
//! applied here.

use crc16::{State, CCITT_FALSE};

use crate::config::{
    DfuImageType, DfuOpcode, INIT_PACKET_RECEIVE_COMPLETE, INIT_PACKET_RECEIVE_START,
};
use crate::error::{DfuError, DfuResult};

// ============================================================================
// CRC16 (CCITT-FALSE)
// ============================================================================

/// Calculate the CRC-16 of a complete byte slice.
pub fn image_crc16(data: &[u8]) -> u16 {
    State::<CCITT_FALSE>::calculate(data)
}

/// Incrementally updated CRC-16 over streamed bytes.
///
/// The upload path feeds each chunk as it is written so the final value
/// covers exactly what went over the air.
pub struct StreamingCrc {
    state: State<CCITT_FALSE>,
}

impl StreamingCrc {
    pub fn new() -> Self {
        Self {
            state: State::<CCITT_FALSE>::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.state.update(data);
    }

    pub fn value(&self) -> u16 {
        self.state.get()
    }
}

impl Default for StreamingCrc {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Command Builders
// ============================================================================

/// Build a StartDfu command for the given image type.
///
/// The 12-byte image size prelude follows separately on the data channel.
pub fn build_start_dfu(image_type: DfuImageType) -> Vec<u8> {
    vec![DfuOpcode::StartDfu as u8, image_type as u8]
}

/// Build the image size prelude (softdevice, bootloader, application
/// sizes as little-endian u32, in that order).
pub fn build_image_size_prelude(
    softdevice_size: u32,
    bootloader_size: u32,
    app_size: u32,
) -> Vec<u8> {
    let mut data = Vec::with_capacity(12);
    data.extend_from_slice(&softdevice_size.to_le_bytes());
    data.extend_from_slice(&bootloader_size.to_le_bytes());
    data.extend_from_slice(&app_size.to_le_bytes());
    data
}

/// Build the InitDfuParams begin marker.
pub fn build_init_params_start() -> Vec<u8> {
    vec![DfuOpcode::InitDfuParams as u8, INIT_PACKET_RECEIVE_START]
}

/// Build the InitDfuParams complete marker.
pub fn build_init_params_complete() -> Vec<u8> {
    vec![DfuOpcode::InitDfuParams as u8, INIT_PACKET_RECEIVE_COMPLETE]
}

/// Build a ReceiveFirmwareImage command.
pub fn build_receive_firmware_image() -> Vec<u8> {
    vec![DfuOpcode::ReceiveFirmwareImage as u8]
}

/// Build a ValidateFirmware command.
pub fn build_validate_firmware() -> Vec<u8> {
    vec![DfuOpcode::ValidateFirmware as u8]
}

/// Build an ActivateAndReset command.
pub fn build_activate_and_reset() -> Vec<u8> {
    vec![DfuOpcode::ActivateAndReset as u8]
}

/// Build a SystemReset command.
pub fn build_system_reset() -> Vec<u8> {
    vec![DfuOpcode::SystemReset as u8]
}

/// Build a ReportReceivedImageSize command.
pub fn build_report_received_image_size() -> Vec<u8> {
    vec![DfuOpcode::ReportReceivedImageSize as u8]
}

/// Build a PacketReceiptNotificationRequest with the given interval.
///
/// Interval 0 turns receipt notifications off.
pub fn build_prn_request(interval: u16) -> Vec<u8> {
    let mut data = Vec::with_capacity(3);
    data.push(DfuOpcode::PacketReceiptNotificationRequest as u8);
    data.extend_from_slice(&interval.to_le_bytes());
    data
}

// ============================================================================
// Notification Parsing
// ============================================================================

/// A response notification from the peer.
#[derive(Debug, Clone)]
pub struct DfuResponse {
    /// The opcode this response answers.
    pub request: u8,
    /// The raw status code.
    pub status: u8,
    /// Trailing payload, if any.
    pub payload: Vec<u8>,
}

impl DfuResponse {
    /// Check if the response indicates success.
    pub fn is_success(&self) -> bool {
        self.status == crate::config::DfuResponseStatus::Success as u8
    }

    /// Convert a non-success response into a peer-reported failure.
    pub fn into_result(self) -> DfuResult<DfuResponse> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(DfuError::RemoteFailure {
                operation: self.request,
                status: self.status,
            })
        }
    }
}

/// A packet receipt notification carrying the peer's received byte count.
#[derive(Debug, Clone, Copy)]
pub struct PacketReceipt {
    pub bytes_received: u32,
}

/// The received-image report: how many bytes the peer holds and their
/// checksum, carried in the ReportReceivedImageSize response payload.
#[derive(Debug, Clone, Copy)]
pub struct ImageReport {
    pub received_size: u32,
    pub crc: u16,
}

impl ImageReport {
    /// Parse a report from a response payload.
    pub fn parse(payload: &[u8]) -> DfuResult<Self> {
        if payload.len() < 6 {
            return Err(DfuError::UnsupportedResponse {
                opcode: DfuOpcode::ReportReceivedImageSize as u8,
            });
        }

        let received_size = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let crc = u16::from_le_bytes([payload[4], payload[5]]);

        Ok(Self { received_size, crc })
    }
}

/// A parsed notification from the control point.
#[derive(Debug, Clone)]
pub enum DfuNotification {
    Response(DfuResponse),
    PacketReceipt(PacketReceipt),
}

impl DfuNotification {
    /// Parse a raw notification.
    pub fn parse(data: &[u8]) -> DfuResult<Self> {
        let opcode = data
            .first()
            .and_then(|&byte| DfuOpcode::from_byte(byte))
            .ok_or(DfuError::UnsupportedResponse {
                opcode: data.first().copied().unwrap_or(0),
            })?;

        match opcode {
            DfuOpcode::Response => {
                if data.len() < 3 {
                    return Err(DfuError::UnsupportedResponse {
                        opcode: opcode as u8,
                    });
                }
                Ok(DfuNotification::Response(DfuResponse {
                    request: data[1],
                    status: data[2],
                    payload: data[3..].to_vec(),
                }))
            }
            DfuOpcode::PacketReceiptNotification => {
                if data.len() < 5 {
                    return Err(DfuError::UnsupportedResponse {
                        opcode: opcode as u8,
                    });
                }
                Ok(DfuNotification::PacketReceipt(PacketReceipt {
                    bytes_received: u32::from_le_bytes([data[1], data[2], data[3], data[4]]),
                }))
            }
            _ => Err(DfuError::UnsupportedResponse {
                opcode: opcode as u8,
            }),
        }
    }
}
