//! DFU protocol state machine.
//!
//! Drives a complete firmware update over a `DfuTransport`:
//! 1. Bootloader jump - when the peer boots in application mode
//! 2. StartDfu - announce image type and sizes for the current part
//! 3. Init packet - transfer the part's metadata
//! 4. Upload - stream the image with receipt-notification flow control
//! 5. Validation - compare peer-reported size/checksum to local values
//! 6. Activation - execute the part, reconnecting across peer resets
//!
//! Transient transfer errors restart the failing part from the init-packet
//! step within a fixed budget; peer-reported protocol failures surface
//! immediately with their raw status code.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{
    DfuOpcode, DFU_PACKET_SIZE, ENTER_BOOTLOADER_COMMAND, MAX_TRANSFER_ATTEMPTS,
    MAX_VALIDATE_ATTEMPTS, RECEIPT_TIMEOUT, RECONNECT_TIMEOUT, RESET_SETTLE_TIME,
    RESPONSE_TIMEOUT, SET_ADVERTISED_NAME_OPCODE,
};
use crate::error::{DfuError, DfuResult};
use crate::events::LogLevel;
use crate::package::{FirmwarePackage, FirmwarePart, PartRole};
use crate::packet::{
    build_activate_and_reset, build_image_size_prelude, build_init_params_complete,
    build_init_params_start, build_prn_request, build_receive_firmware_image,
    build_report_received_image_size, build_start_dfu, build_system_reset,
    build_validate_firmware, DfuNotification, DfuResponse, ImageReport, PacketReceipt,
    StreamingCrc,
};
use crate::progress::{ProgressSample, ProgressTracker};
use crate::target::DeviceTarget;
use crate::transport::DfuTransport;

/// States of a DFU session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuState {
    Idle,
    Connecting,
    EnablingDfuMode,
    Starting,
    CreatingObject,
    Uploading,
    Validating,
    Activating,
    Completed,
    Aborted,
    Failed,
}

impl DfuState {
    /// Terminal states end the session; nothing may be emitted after one.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DfuState::Completed | DfuState::Aborted | DfuState::Failed
        )
    }
}

/// Events emitted by the protocol driver while it runs.
///
/// The session layer bridges these to registered observers.
#[derive(Debug, Clone)]
pub enum ProtocolEvent {
    StateChanged(DfuState),
    Progress(ProgressSample),
    Log(LogLevel, String),
}

/// DFU protocol driver for one transfer session.
pub struct DfuProtocol<T: DfuTransport, E: FnMut(ProtocolEvent)> {
    transport: T,
    target: DeviceTarget,
    package: FirmwarePackage,
    cancel: Arc<AtomicBool>,
    emit: E,
    state: DfuState,
    tracker: ProgressTracker,
}

impl<T: DfuTransport, E: FnMut(ProtocolEvent)> DfuProtocol<T, E> {
    /// Create a driver for the given package and target.
    ///
    /// `cancel` is polled at every state transition and between data
    /// chunks; setting it aborts the session at the next checkpoint.
    pub fn new(
        transport: T,
        target: DeviceTarget,
        package: FirmwarePackage,
        cancel: Arc<AtomicBool>,
        emit: E,
    ) -> Self {
        let tracker = ProgressTracker::new(package.part_count());
        Self {
            transport,
            target,
            package,
            cancel,
            emit,
            state: DfuState::Idle,
            tracker,
        }
    }

    /// Run the update to completion.
    ///
    /// Returns `Ok(())` only after the last part has been activated. The
    /// `Completed` state is emitted before returning; `Aborted`/`Failed`
    /// are left to the caller, which knows how the outcome is delivered.
    pub fn run(mut self) -> DfuResult<()> {
        let result = self.drive();

        if matches!(result, Err(DfuError::Cancelled)) {
            // Best effort: get the peer out of the half-finished transfer.
            let _ = self.transport.write_control(&build_system_reset());
        }

        result
    }

    fn drive(&mut self) -> DfuResult<()> {
        self.set_state(DfuState::Connecting)?;
        if !self.transport.is_connected() {
            return Err(DfuError::FailedToConnect {
                address: self.target.address.clone(),
            });
        }

        self.log(
            LogLevel::Info,
            format!(
                "Starting DFU for {}: {} part(s), {} bytes, package sha256 {}",
                self.target.address,
                self.package.part_count(),
                self.package.total_image_size(),
                self.package.archive_sha256,
            ),
        );

        if !self.transport.in_dfu_mode() {
            self.set_state(DfuState::EnablingDfuMode)?;
            self.enable_dfu_mode()?;
        }

        for index in 0..self.package.part_count() {
            let part = self.package.parts()[index].clone();
            self.run_part(index, &part)?;
        }

        self.set_state(DfuState::Completed)?;
        Ok(())
    }

    /// Run one part, restarting it on transient errors within the budget.
    fn run_part(&mut self, index: usize, part: &FirmwarePart) -> DfuResult<()> {
        let mut transfer_attempts: u8 = 0;
        let mut validate_attempts: u8 = 0;

        loop {
            // A failure during Starting redoes the whole part; anything
            // later restarts at the init-packet step.
            let fresh = (transfer_attempts == 0 && validate_attempts == 0)
                || self.state == DfuState::Starting;

            match self.attempt_part(index, part, fresh) {
                Ok(()) => return Ok(()),
                Err(error) if error.is_retriable() => {
                    let budget_left = if matches!(error, DfuError::CrcMismatch { .. }) {
                        validate_attempts += 1;
                        validate_attempts < MAX_VALIDATE_ATTEMPTS
                    } else {
                        transfer_attempts += 1;
                        transfer_attempts < MAX_TRANSFER_ATTEMPTS
                    };

                    if !budget_left {
                        return Err(error);
                    }

                    self.log(
                        LogLevel::Warning,
                        format!("{} on {} part; restarting part", error, part.role),
                    );
                    self.transport.drain_notifications();
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// One attempt at transferring, validating and activating a part.
    fn attempt_part(&mut self, index: usize, part: &FirmwarePart, fresh: bool) -> DfuResult<()> {
        if fresh {
            self.set_state(DfuState::Starting)?;
            self.transport.drain_notifications();
            self.transport
                .write_control(&build_prn_request(self.target.prn_interval))?;
            self.transport
                .write_control(&build_start_dfu(part.role.image_type()))?;
            let prelude = self.size_prelude(part);
            self.transport.write_data(&prelude)?;
            self.await_response(DfuOpcode::StartDfu, "start")?;
        }

        self.set_state(DfuState::CreatingObject)?;
        self.transport.write_control(&build_init_params_start())?;
        for chunk in part.init_packet.chunks(DFU_PACKET_SIZE) {
            self.transport.write_data(chunk)?;
        }
        self.transport.write_control(&build_init_params_complete())?;
        self.await_response(DfuOpcode::InitDfuParams, "init packet")?;

        self.set_state(DfuState::Uploading)?;
        let image_crc = self.upload_image(index, part)?;

        self.set_state(DfuState::Validating)?;
        self.transport
            .write_control(&build_report_received_image_size())?;
        let response = self.await_response(DfuOpcode::ReportReceivedImageSize, "image report")?;
        let report = ImageReport::parse(&response.payload)?;
        if report.received_size != part.image_size as u32 {
            return Err(DfuError::BytesLost {
                reported: report.received_size,
                sent: part.image_size as u32,
            });
        }
        if report.crc != image_crc {
            return Err(DfuError::CrcMismatch {
                expected: image_crc,
                actual: report.crc,
            });
        }
        self.transport.write_control(&build_validate_firmware())?;
        self.await_response(DfuOpcode::ValidateFirmware, "validate")?;

        self.set_state(DfuState::Activating)?;
        self.transport.write_control(&build_activate_and_reset())?;

        let last_part = index + 1 == self.package.part_count();
        if part.role.activation_resets_peer() && !last_part {
            // The peer reboots into a fresh bootloader session; pick the
            // link back up before the next part.
            self.log(
                LogLevel::Info,
                format!("{} activated; reconnecting for next part", part.role),
            );
            std::thread::sleep(RESET_SETTLE_TIME);
            self.reconnect()?;
        }

        Ok(())
    }

    /// Image size prelude with this part's size in its role slot.
    fn size_prelude(&self, part: &FirmwarePart) -> Vec<u8> {
        let size = part.image_size as u32;
        match part.role {
            PartRole::SoftDevice => build_image_size_prelude(size, 0, 0),
            PartRole::Bootloader => build_image_size_prelude(0, size, 0),
            PartRole::Application => build_image_size_prelude(0, 0, size),
        }
    }

    /// Stream the image with receipt-notification flow control.
    ///
    /// At most `prn_interval` chunks are ever in flight unacknowledged;
    /// each receipt is checked against the bytes actually sent. Returns
    /// the CRC of the streamed bytes.
    fn upload_image(&mut self, index: usize, part: &FirmwarePart) -> DfuResult<u16> {
        let prn = self.target.prn_interval;
        self.transport
            .write_control(&build_receive_firmware_image())?;
        self.tracker
            .start_part(index + 1, part.image_size, Instant::now());

        let mut crc = StreamingCrc::new();
        let mut sent: u32 = 0;
        let mut unacked: u16 = 0;
        let mut batch_bytes: usize = 0;

        for chunk in part.image.chunks(DFU_PACKET_SIZE) {
            self.check_cancelled()?;
            self.transport.write_data(chunk)?;
            crc.update(chunk);
            sent += chunk.len() as u32;
            batch_bytes += chunk.len();

            if prn > 0 {
                unacked += 1;
                if unacked == prn {
                    let receipt = self.await_packet_receipt()?;
                    if receipt.bytes_received != sent {
                        return Err(DfuError::BytesLost {
                            reported: receipt.bytes_received,
                            sent,
                        });
                    }
                    unacked = 0;
                    self.emit_progress(batch_bytes);
                    batch_bytes = 0;
                }
            } else {
                self.emit_progress(batch_bytes);
                batch_bytes = 0;
            }
        }

        if batch_bytes > 0 {
            self.emit_progress(batch_bytes);
        }

        self.await_response(DfuOpcode::ReceiveFirmwareImage, "image transfer")?;
        Ok(crc.value())
    }

    fn emit_progress(&mut self, bytes: usize) {
        let sample = self.tracker.record(bytes, Instant::now());
        (self.emit)(ProtocolEvent::Progress(sample));
    }

    /// Jump an application-mode peer into its bootloader.
    fn enable_dfu_mode(&mut self) -> DfuResult<()> {
        if let Some(name) = self.target.alternative_advertising_name.clone() {
            let mut command = Vec::with_capacity(2 + name.len());
            command.push(SET_ADVERTISED_NAME_OPCODE);
            command.push(name.len() as u8);
            command.extend_from_slice(name.as_bytes());
            self.transport.write_control(&command)?;
        }

        self.transport.write_control(ENTER_BOOTLOADER_COMMAND)?;

        // The peer resets and re-advertises with the DFU service.
        std::thread::sleep(RESET_SETTLE_TIME);
        self.reconnect()?;

        if !self.transport.in_dfu_mode() {
            return Err(DfuError::DeviceNotSupported);
        }

        Ok(())
    }

    fn reconnect(&mut self) -> DfuResult<()> {
        self.transport
            .reconnect(RECONNECT_TIMEOUT)
            .map_err(|_| DfuError::FailedToConnect {
                address: self.target.address.clone(),
            })?;
        self.transport.drain_notifications();
        Ok(())
    }

    /// Wait for the response to `expected`, skipping stale receipts.
    fn await_response(&mut self, expected: DfuOpcode, operation: &str) -> DfuResult<DfuResponse> {
        let deadline = Instant::now() + RESPONSE_TIMEOUT;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining == Duration::ZERO {
                return Err(DfuError::ReceivingNotificationFailed {
                    operation: operation.to_string(),
                });
            }

            let Some(bytes) = self.transport.receive_notification(remaining)? else {
                return Err(DfuError::ReceivingNotificationFailed {
                    operation: operation.to_string(),
                });
            };

            match DfuNotification::parse(&bytes)? {
                DfuNotification::Response(response) if response.request == expected as u8 => {
                    return response.into_result();
                }
                DfuNotification::Response(response) => {
                    return Err(DfuError::UnsupportedResponse {
                        opcode: response.request,
                    });
                }
                // Stale receipt from a previous batch; keep waiting.
                DfuNotification::PacketReceipt(_) => continue,
            }
        }
    }

    fn await_packet_receipt(&mut self) -> DfuResult<PacketReceipt> {
        let Some(bytes) = self.transport.receive_notification(RECEIPT_TIMEOUT)? else {
            return Err(DfuError::ReceivingNotificationFailed {
                operation: "packet receipt".to_string(),
            });
        };

        match DfuNotification::parse(&bytes)? {
            DfuNotification::PacketReceipt(receipt) => Ok(receipt),
            DfuNotification::Response(response) => {
                // An error response mid-upload outranks the missing receipt.
                let response = response.into_result()?;
                Err(DfuError::UnsupportedResponse {
                    opcode: response.request,
                })
            }
        }
    }

    fn set_state(&mut self, state: DfuState) -> DfuResult<()> {
        if !state.is_terminal() {
            self.check_cancelled()?;
        }
        self.state = state;
        (self.emit)(ProtocolEvent::StateChanged(state));
        Ok(())
    }

    fn check_cancelled(&self) -> DfuResult<()> {
        if self.cancel.load(Ordering::SeqCst) {
            Err(DfuError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn log(&mut self, level: LogLevel, message: String) {
        (self.emit)(ProtocolEvent::Log(level, message));
    }
}
