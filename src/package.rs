//! Firmware package reader.
//!
//! Reads and parses a DFU zip archive containing:
//! - manifest.json - Package metadata, one entry per firmware part
//! - *.bin - Firmware images
//! - *.dat - Init packets
//!
//! A package may carry up to three parts (softdevice, bootloader,
//! application). Parts are always yielded in flash-dependency order no
//! matter how the manifest lists them.

use std::io::{Cursor, Read};
use std::path::Path;

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::config::DfuImageType;
use crate::error::{DfuError, DfuResult};
use crate::packet::image_crc16;

/// Init packets at or above this length carry the extended metadata
/// (softdevice requirements and checksum) introduced with DFU v0.5.
const EXTENDED_INIT_PACKET_MIN_LEN: usize = 14;

/// Role of a firmware part within the package.
///
/// The ordering of the variants is the flash-dependency order: a
/// softdevice must land before a bootloader, and both before the
/// application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PartRole {
    SoftDevice,
    Bootloader,
    Application,
}

impl PartRole {
    /// Manifest key and display name for this role.
    pub fn name(&self) -> &'static str {
        match self {
            PartRole::SoftDevice => "softdevice",
            PartRole::Bootloader => "bootloader",
            PartRole::Application => "application",
        }
    }

    /// The image type byte announced in StartDfu for this role.
    pub fn image_type(&self) -> DfuImageType {
        match self {
            PartRole::SoftDevice => DfuImageType::SoftDevice,
            PartRole::Bootloader => DfuImageType::Bootloader,
            PartRole::Application => DfuImageType::Application,
        }
    }

    /// Whether activating this part resets the peer into a fresh
    /// bootloader session, requiring a reconnect before the next part.
    pub fn activation_resets_peer(&self) -> bool {
        matches!(self, PartRole::SoftDevice | PartRole::Bootloader)
    }
}

impl std::fmt::Display for PartRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One updatable firmware part: an init packet plus a binary image.
#[derive(Debug, Clone)]
pub struct FirmwarePart {
    /// Which component this part updates.
    pub role: PartRole,
    /// Init packet bytes (*.dat contents).
    pub init_packet: Vec<u8>,
    /// Firmware image bytes (*.bin contents).
    pub image: Vec<u8>,
    /// Image size in bytes, validated against the manifest declaration.
    pub image_size: usize,
    /// CRC-16 of the image, validated against the manifest declaration.
    pub crc16: u16,
    /// Target device type from the init packet metadata.
    pub device_type: u16,
}

/// Contents of a DFU firmware package.
#[derive(Debug, Clone)]
pub struct FirmwarePackage {
    /// Parts in flash-dependency order.
    parts: Vec<FirmwarePart>,
    /// DFU protocol version declared by the manifest.
    pub dfu_version: f32,
    /// SHA-256 of the archive file, for diagnostics.
    pub archive_sha256: String,
}

impl FirmwarePackage {
    /// Parts in flash-dependency order.
    pub fn parts(&self) -> &[FirmwarePart] {
        &self.parts
    }

    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    /// Sum of all image sizes.
    pub fn total_image_size(&self) -> usize {
        self.parts.iter().map(|part| part.image_size).sum()
    }

    /// Image size for the given role, or 0 when the package has no such
    /// part. Used to fill the StartDfu size prelude.
    pub fn image_size_for(&self, role: PartRole) -> u32 {
        self.parts
            .iter()
            .find(|part| part.role == role)
            .map(|part| part.image_size as u32)
            .unwrap_or(0)
    }
}

#[cfg(test)]
impl FirmwarePackage {
    /// Assemble a package directly, bypassing the archive layer.
    pub(crate) fn from_parts(
        parts: Vec<FirmwarePart>,
        dfu_version: f32,
        archive_sha256: String,
    ) -> Self {
        Self {
            parts,
            dfu_version,
            archive_sha256,
        }
    }
}

/// Raw manifest.json structure for deserialization.
#[derive(Debug, Deserialize)]
struct RawManifest {
    manifest: ManifestInner,
}

#[derive(Debug, Deserialize)]
struct ManifestInner {
    softdevice: Option<ImageManifest>,
    bootloader: Option<ImageManifest>,
    application: Option<ImageManifest>,
    dfu_version: f32,
}

#[derive(Debug, Deserialize)]
struct ImageManifest {
    bin_file: String,
    dat_file: String,
    bin_length: usize,
    init_packet_data: InitPacketData,
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct InitPacketData {
    application_version: u32,
    device_revision: u16,
    device_type: u16,
    firmware_crc16: u16,
    softdevice_req: Vec<u16>,
}

/// Read and parse a DFU firmware package.
///
/// # Arguments
/// * `path` - Path to the firmware zip archive
///
/// # Returns
/// Parsed package with parts in flash-dependency order, or a pre-flight
/// error describing what was wrong with the archive.
pub fn read_firmware_package<P: AsRef<Path>>(path: P) -> DfuResult<FirmwarePackage> {
    let path = path.as_ref();
    if path.as_os_str().is_empty() {
        return Err(DfuError::FileNotSpecified);
    }

    let bytes = std::fs::read(path)?;

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let archive_sha256 = format!("{:x}", hasher.finalize());

    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    let raw = read_manifest(&mut archive)?;

    let mut parts = Vec::new();
    let entries = [
        (PartRole::SoftDevice, raw.manifest.softdevice),
        (PartRole::Bootloader, raw.manifest.bootloader),
        (PartRole::Application, raw.manifest.application),
    ];

    for (role, entry) in entries {
        if let Some(entry) = entry {
            parts.push(read_part(&mut archive, role, entry, raw.manifest.dfu_version)?);
        }
    }

    if parts.is_empty() {
        return Err(DfuError::InvalidManifest {
            reason: "manifest declares no firmware images".to_string(),
        });
    }

    Ok(FirmwarePackage {
        parts,
        dfu_version: raw.manifest.dfu_version,
        archive_sha256,
    })
}

/// Read and parse the manifest.json from the archive.
fn read_manifest(archive: &mut zip::ZipArchive<Cursor<Vec<u8>>>) -> DfuResult<RawManifest> {
    let mut manifest_file =
        archive
            .by_name("manifest.json")
            .map_err(|_| DfuError::MissingFile {
                filename: "manifest.json".to_string(),
            })?;

    let mut contents = String::new();
    manifest_file.read_to_string(&mut contents)?;

    Ok(serde_json::from_str(&contents)?)
}

/// Read one part's image and init packet and validate them against the
/// manifest declarations.
fn read_part(
    archive: &mut zip::ZipArchive<Cursor<Vec<u8>>>,
    role: PartRole,
    entry: ImageManifest,
    dfu_version: f32,
) -> DfuResult<FirmwarePart> {
    let image = read_file_from_zip(archive, &entry.bin_file)?;
    let init_packet = read_file_from_zip(archive, &entry.dat_file)?;

    if image.is_empty() {
        return Err(DfuError::InvalidManifest {
            reason: format!("empty image for {}", role),
        });
    }

    if image.len() != entry.bin_length {
        return Err(DfuError::ImageSizeMismatch {
            role: role.name().to_string(),
            declared: entry.bin_length,
            actual: image.len(),
        });
    }

    let actual_crc = image_crc16(&image);
    if actual_crc != entry.init_packet_data.firmware_crc16 {
        return Err(DfuError::InvalidManifest {
            reason: format!(
                "firmware_crc16 mismatch for {}: manifest says 0x{:04X}, image has 0x{:04X}",
                role, entry.init_packet_data.firmware_crc16, actual_crc
            ),
        });
    }

    if init_packet.is_empty() {
        return Err(DfuError::InitPacketRequired {
            role: role.name().to_string(),
        });
    }

    if dfu_version >= 0.5 && init_packet.len() < EXTENDED_INIT_PACKET_MIN_LEN {
        return Err(DfuError::ExtendedInitPacketRequired {
            role: role.name().to_string(),
        });
    }

    Ok(FirmwarePart {
        role,
        image_size: image.len(),
        crc16: actual_crc,
        device_type: entry.init_packet_data.device_type,
        init_packet,
        image,
    })
}

/// Read a file from the zip archive by name.
fn read_file_from_zip(
    archive: &mut zip::ZipArchive<Cursor<Vec<u8>>>,
    name: &str,
) -> DfuResult<Vec<u8>> {
    let mut file = archive.by_name(name).map_err(|_| DfuError::MissingFile {
        filename: name.to_string(),
    })?;

    let mut data = Vec::with_capacity(file.size() as usize);
    file.read_to_end(&mut data)?;

    Ok(data)
}
