//! BLE DFU protocol engine for nRF52-class devices.
//!
//! This crate implements the device firmware update protocol itself -
//! package parsing, the transfer state machine, flow control, progress
//! tracking and session orchestration - on top of a caller-supplied
//! transport. The BLE stack (scanning, pairing, GATT discovery) stays
//! outside, behind the [`DfuTransport`] trait.
//!
//! # Update Overview
//!
//! An update of one firmware part proceeds through:
//! 1. **Bootloader Jump** - buttonless switch when the peer boots into
//!    application mode
//! 2. **StartDfu** - announce the image type and sizes
//! 3. **Init Transfer** - send the part's init packet
//! 4. **Upload** - stream the image with packet-receipt flow control
//! 5. **Validation** - compare the peer's size/checksum report against
//!    what was sent
//! 6. **Activation** - the device applies the part, resetting mid-package
//!    when a softdevice or bootloader was flashed
//!
//! Packages may chain several parts (softdevice, bootloader, application);
//! the session reconnects across peer resets and resumes at the next part.
//!
//! # Example
//!
//! ```ignore
//! use ble_dfu_engine::{
//!     read_firmware_package, DeviceTarget, DfuObserver, SessionController,
//! };
//!
//! let package = read_firmware_package("firmware.zip")?;
//! let target = DeviceTarget::new("01234567-89ab-cdef-0123-456789abcdef")?;
//!
//! let controller = SessionController::new();
//! let handle = controller.start(transport, target, package, observer)?;
//! let completion = handle.wait()?;
//! println!("updated {}", completion.device_address);
//! ```

mod config;
mod error;
mod events;
mod package;
mod packet;
mod progress;
mod protocol;
mod session;
mod target;
mod transport;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export the public surface.

// Errors
pub use error::{DfuError, DfuResult};

// Firmware packages
pub use package::{read_firmware_package, FirmwarePackage, FirmwarePart, PartRole};

// Transport boundary
pub use transport::DfuTransport;

// Targets and sessions
pub use session::{DfuCompletion, DfuObserver, SessionController, SessionHandle};
pub use target::DeviceTarget;

// Protocol states and progress reporting
pub use progress::{ProgressSample, ProgressTracker};
pub use protocol::{DfuProtocol, DfuState, ProtocolEvent};

// External event surface
pub use events::{
    rejection_code, state_event_name, ErrorEvent, LogLevel, ProgressEvent, StateChangedEvent,
    PROGRESS_EVENT, STATE_CHANGED_EVENT,
};

// Protocol constants useful to transport implementations
pub use config::{DfuOpcode, DfuResponseStatus, DEFAULT_PRN_INTERVAL, DFU_PACKET_SIZE};
