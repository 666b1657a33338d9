//! Target device description for a DFU session.

use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_PRN_INTERVAL;
use crate::error::{DfuError, DfuResult};

/// The device a firmware update is addressed to.
///
/// The address is an opaque identifier understood by the BLE collaborator:
/// either a peripheral UUID (`xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx`) or a
/// MAC-48 string (`AA:BB:CC:DD:EE:FF`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceTarget {
    /// Device address (UUID or MAC form).
    pub address: String,
    /// Name the peer should advertise while in bootloader mode, when the
    /// alternative-name handshake is enabled.
    pub alternative_advertising_name: Option<String>,
    /// Packet receipt notification interval; 0 disables flow control.
    pub prn_interval: u16,
}

impl DeviceTarget {
    /// Create a target for the given address.
    ///
    /// Fails with `InvalidDeviceAddress` when the address is neither a
    /// UUID nor a MAC-48 string.
    pub fn new(address: &str) -> DfuResult<Self> {
        if !is_valid_address(address) {
            return Err(DfuError::InvalidDeviceAddress {
                address: address.to_string(),
            });
        }

        Ok(Self {
            address: address.to_string(),
            alternative_advertising_name: None,
            prn_interval: DEFAULT_PRN_INTERVAL,
        })
    }

    /// Set the packet receipt notification interval.
    pub fn with_prn_interval(mut self, interval: u16) -> Self {
        self.prn_interval = interval;
        self
    }

    /// Enable the alternative advertising name handshake during the
    /// bootloader jump.
    pub fn with_alternative_advertising_name(mut self, name: &str) -> Self {
        self.alternative_advertising_name = Some(name.to_string());
        self
    }
}

/// Check whether a string is a plausible device address.
fn is_valid_address(address: &str) -> bool {
    is_uuid(address) || is_mac48(address)
}

fn is_uuid(address: &str) -> bool {
    let bytes = address.as_bytes();
    if bytes.len() != 36 {
        return false;
    }

    for (index, &byte) in bytes.iter().enumerate() {
        match index {
            8 | 13 | 18 | 23 => {
                if byte != b'-' {
                    return false;
                }
            }
            _ => {
                if !byte.is_ascii_hexdigit() {
                    return false;
                }
            }
        }
    }

    true
}

fn is_mac48(address: &str) -> bool {
    let bytes = address.as_bytes();
    if bytes.len() != 17 {
        return false;
    }

    for (index, &byte) in bytes.iter().enumerate() {
        if index % 3 == 2 {
            if byte != b':' {
                return false;
            }
        } else if !byte.is_ascii_hexdigit() {
            return false;
        }
    }

    true
}
