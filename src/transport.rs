//! Transport abstraction for DFU communication.
//!
//! Provides a trait-based abstraction over a connected BLE link, enabling
//! both real stacks and mock testing. The underlying stack owns scanning,
//! pairing and GATT discovery; the engine only needs the DFU service's two
//! channels and its notifications.

use std::time::Duration;

use crate::error::DfuResult;

/// Trait for DFU transport operations.
///
/// Implementations expose the DFU service's control point (write with
/// response) and data channel (write without response), and deliver the
/// peer's notifications in arrival order.
#[cfg_attr(test, mockall::automock)]
pub trait DfuTransport: Send {
    /// Write a command to the control point characteristic.
    ///
    /// Blocks until the link accepts the write.
    fn write_control(&mut self, data: &[u8]) -> DfuResult<()>;

    /// Write a packet to the data characteristic (no response expected).
    fn write_data(&mut self, data: &[u8]) -> DfuResult<()>;

    /// Receive the next notification.
    ///
    /// # Returns
    /// - `Ok(Some(bytes))` - a notification arrived
    /// - `Ok(None)` - no notification within the timeout
    /// - `Err(DeviceDisconnected)` - the link dropped; a disconnect is
    ///   always surfaced as an error, never as a silent stall
    fn receive_notification(&mut self, timeout: Duration) -> DfuResult<Option<Vec<u8>>>;

    /// Discard any queued notifications from a previous protocol step.
    fn drain_notifications(&mut self);

    /// Re-establish the link after a peer-side reset.
    ///
    /// Used after bootloader jumps and after activating a part that
    /// restarts the peer mid-package.
    fn reconnect(&mut self, timeout: Duration) -> DfuResult<()>;

    /// Check whether the link is currently established.
    fn is_connected(&self) -> bool;

    /// Whether the peer currently exposes the DFU service.
    ///
    /// False means the peer is in application mode and needs the
    /// bootloader jump before the transfer can start.
    fn in_dfu_mode(&self) -> bool;
}
