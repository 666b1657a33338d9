//! Test fixtures: a scripted peer bootloader, firmware package builders
//! and a recording observer.

use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use zip::write::FileOptions;
use zip::ZipWriter;

use crate::config::{DfuOpcode, DfuResponseStatus};
use crate::error::{DfuError, DfuResult};
use crate::events::{rejection_code, LogLevel};
use crate::package::{FirmwarePackage, FirmwarePart, PartRole};
use crate::packet::image_crc16;
use crate::progress::ProgressSample;
use crate::protocol::DfuState;
use crate::session::DfuObserver;
use crate::transport::DfuTransport;

// ============================================================================
// Scripted peer
// ============================================================================

/// Tunable misbehavior for the scripted peer bootloader.
#[derive(Debug, Clone, Default)]
pub struct PeerBehavior {
    /// Corrupt the checksum in the first N image reports.
    pub corrupt_crc_reports: u8,
    /// Under-report the byte count in the first N packet receipts.
    pub short_receipts: u8,
    /// Answer ValidateFirmware with this status instead of success.
    pub fail_validate_status: Option<u8>,
    /// Keep the StartDfu response back until the test releases it.
    pub hold_start_response: bool,
    /// Keep packet receipts back until the test releases them.
    pub hold_receipts: bool,
    /// The bootloader jump silently does nothing.
    pub jump_fails: bool,
    /// Drop the link after this many data writes.
    pub disconnect_after_data_writes: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerPhase {
    Idle,
    SizePrelude,
    Ready,
    InitPacket,
    Upload,
}

struct PeerState {
    connected: bool,
    in_dfu_mode: bool,
    pending_bootloader: bool,
    reset_on_activate: bool,
    phase: PeerPhase,
    prn_interval: u16,
    expected_size: u32,
    received_init: Vec<u8>,
    received_image: Vec<u8>,
    unacked_packets: u16,
    max_unacked: u16,
    data_writes: usize,
    notifications: VecDeque<Vec<u8>>,
    held: VecDeque<Vec<u8>>,
    behavior: PeerBehavior,
    started_image_types: Vec<u8>,
    activations: usize,
    reconnects: usize,
    system_resets: usize,
    enter_bootloader_seen: bool,
    advertised_name: Option<String>,
}

impl PeerState {
    fn disconnected(operation: &str) -> DfuError {
        DfuError::DeviceDisconnected {
            operation: operation.to_string(),
        }
    }

    fn push_response(&mut self, request: DfuOpcode, status: u8, payload: &[u8]) {
        let mut frame = vec![DfuOpcode::Response as u8, request as u8, status];
        frame.extend_from_slice(payload);
        if request == DfuOpcode::StartDfu && self.behavior.hold_start_response {
            self.held.push_back(frame);
        } else {
            self.notifications.push_back(frame);
        }
    }

    fn push_receipt(&mut self) {
        let mut count = self.received_image.len() as u32;
        if self.behavior.short_receipts > 0 {
            self.behavior.short_receipts -= 1;
            count = count.saturating_sub(7);
        }
        let mut frame = vec![DfuOpcode::PacketReceiptNotification as u8];
        frame.extend_from_slice(&count.to_le_bytes());
        if self.behavior.hold_receipts {
            self.held.push_back(frame);
        } else {
            self.notifications.push_back(frame);
        }
    }

    fn handle_control(&mut self, data: &[u8]) -> DfuResult<()> {
        if !self.connected {
            return Err(Self::disconnected("control write"));
        }
        let Some(&opcode) = data.first() else {
            return Ok(());
        };

        // Before the bootloader jump only the buttonless service listens.
        if !self.in_dfu_mode {
            match opcode {
                0x01 => {
                    self.enter_bootloader_seen = true;
                    if !self.behavior.jump_fails {
                        self.pending_bootloader = true;
                    }
                    self.connected = false;
                }
                0x02 if data.len() >= 2 => {
                    let len = (data[1] as usize).min(data.len() - 2);
                    self.advertised_name =
                        Some(String::from_utf8_lossy(&data[2..2 + len]).into_owned());
                }
                _ => {}
            }
            return Ok(());
        }

        match DfuOpcode::from_byte(opcode) {
            Some(DfuOpcode::StartDfu) => {
                self.phase = PeerPhase::SizePrelude;
                if let Some(&image_type) = data.get(1) {
                    self.started_image_types.push(image_type);
                }
            }
            Some(DfuOpcode::InitDfuParams) => {
                if data.get(1) == Some(&0x00) {
                    self.phase = PeerPhase::InitPacket;
                    self.received_init.clear();
                } else {
                    self.push_response(DfuOpcode::InitDfuParams, DfuResponseStatus::Success as u8, &[]);
                }
            }
            Some(DfuOpcode::ReceiveFirmwareImage) => {
                self.phase = PeerPhase::Upload;
                self.received_image.clear();
                self.unacked_packets = 0;
            }
            Some(DfuOpcode::ValidateFirmware) => {
                let status = self
                    .behavior
                    .fail_validate_status
                    .unwrap_or(DfuResponseStatus::Success as u8);
                self.push_response(DfuOpcode::ValidateFirmware, status, &[]);
            }
            Some(DfuOpcode::ActivateAndReset) => {
                self.activations += 1;
                self.phase = PeerPhase::Idle;
                if self.reset_on_activate {
                    self.connected = false;
                }
            }
            Some(DfuOpcode::SystemReset) => {
                self.system_resets += 1;
                self.phase = PeerPhase::Idle;
            }
            Some(DfuOpcode::ReportReceivedImageSize) => {
                let mut crc = image_crc16(&self.received_image);
                if self.behavior.corrupt_crc_reports > 0 {
                    self.behavior.corrupt_crc_reports -= 1;
                    crc ^= 0xFFFF;
                }
                let mut payload = (self.received_image.len() as u32).to_le_bytes().to_vec();
                payload.extend_from_slice(&crc.to_le_bytes());
                self.push_response(
                    DfuOpcode::ReportReceivedImageSize,
                    DfuResponseStatus::Success as u8,
                    &payload,
                );
            }
            Some(DfuOpcode::PacketReceiptNotificationRequest) => {
                if data.len() >= 3 {
                    self.prn_interval = u16::from_le_bytes([data[1], data[2]]);
                }
            }
            _ => {}
        }

        Ok(())
    }

    fn handle_data(&mut self, data: &[u8]) -> DfuResult<()> {
        if !self.connected {
            return Err(Self::disconnected("data write"));
        }

        self.data_writes += 1;
        if let Some(limit) = self.behavior.disconnect_after_data_writes {
            if self.data_writes >= limit {
                self.connected = false;
                return Err(Self::disconnected("data write"));
            }
        }

        match self.phase {
            PeerPhase::SizePrelude => {
                if data.len() >= 12 {
                    let softdevice = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
                    let bootloader = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
                    let application = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
                    self.expected_size = softdevice + bootloader + application;
                }
                self.phase = PeerPhase::Ready;
                self.push_response(DfuOpcode::StartDfu, DfuResponseStatus::Success as u8, &[]);
            }
            PeerPhase::InitPacket => {
                self.received_init.extend_from_slice(data);
            }
            PeerPhase::Upload => {
                self.received_image.extend_from_slice(data);
                self.unacked_packets += 1;
                self.max_unacked = self.max_unacked.max(self.unacked_packets);

                if self.prn_interval > 0 && self.unacked_packets >= self.prn_interval {
                    self.unacked_packets = 0;
                    self.push_receipt();
                }

                if self.received_image.len() as u32 >= self.expected_size {
                    self.push_response(
                        DfuOpcode::ReceiveFirmwareImage,
                        DfuResponseStatus::Success as u8,
                        &[],
                    );
                }
            }
            _ => {}
        }

        Ok(())
    }
}

/// In-memory transport backed by a scripted peer bootloader.
///
/// Shares its state with `ScriptedTransportProbe` so tests can inspect
/// what the peer saw after the protocol driver consumed the transport.
pub struct ScriptedTransport {
    state: Arc<Mutex<PeerState>>,
}

impl ScriptedTransport {
    /// A connected peer already in bootloader (DFU) mode.
    pub fn new() -> Self {
        Self::with_mode(true, true)
    }

    /// A connected peer still running its application firmware.
    pub fn in_application_mode() -> Self {
        Self::with_mode(true, false)
    }

    /// A peer that cannot be reached at all.
    pub fn disconnected() -> Self {
        Self::with_mode(false, true)
    }

    fn with_mode(connected: bool, in_dfu_mode: bool) -> Self {
        Self {
            state: Arc::new(Mutex::new(PeerState {
                connected,
                in_dfu_mode,
                pending_bootloader: false,
                reset_on_activate: false,
                phase: PeerPhase::Idle,
                prn_interval: 0,
                expected_size: 0,
                received_init: Vec::new(),
                received_image: Vec::new(),
                unacked_packets: 0,
                max_unacked: 0,
                data_writes: 0,
                notifications: VecDeque::new(),
                held: VecDeque::new(),
                behavior: PeerBehavior::default(),
                started_image_types: Vec::new(),
                activations: 0,
                reconnects: 0,
                system_resets: 0,
                enter_bootloader_seen: false,
                advertised_name: None,
            })),
        }
    }

    pub fn with_behavior(self, behavior: PeerBehavior) -> Self {
        self.state.lock().unwrap().behavior = behavior;
        self
    }

    /// Activating any part resets the peer, as softdevice and bootloader
    /// updates do on real hardware.
    pub fn resets_on_activate(self) -> Self {
        self.state.lock().unwrap().reset_on_activate = true;
        self
    }

    pub fn probe(&self) -> ScriptedTransportProbe {
        ScriptedTransportProbe {
            state: Arc::clone(&self.state),
        }
    }
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl DfuTransport for ScriptedTransport {
    fn write_control(&mut self, data: &[u8]) -> DfuResult<()> {
        self.state.lock().unwrap().handle_control(data)
    }

    fn write_data(&mut self, data: &[u8]) -> DfuResult<()> {
        self.state.lock().unwrap().handle_data(data)
    }

    fn receive_notification(&mut self, timeout: Duration) -> DfuResult<Option<Vec<u8>>> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if !state.connected {
                    return Err(PeerState::disconnected("notification wait"));
                }
                if let Some(frame) = state.notifications.pop_front() {
                    return Ok(Some(frame));
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn drain_notifications(&mut self) {
        self.state.lock().unwrap().notifications.clear();
    }

    fn reconnect(&mut self, _timeout: Duration) -> DfuResult<()> {
        let mut state = self.state.lock().unwrap();
        state.connected = true;
        state.reconnects += 1;
        if state.pending_bootloader {
            state.pending_bootloader = false;
            state.in_dfu_mode = true;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    fn in_dfu_mode(&self) -> bool {
        self.state.lock().unwrap().in_dfu_mode
    }
}

/// Inspection handle for a `ScriptedTransport`, usable after the
/// transport itself has been consumed by the protocol driver.
pub struct ScriptedTransportProbe {
    state: Arc<Mutex<PeerState>>,
}

impl ScriptedTransportProbe {
    pub fn max_unacked(&self) -> u16 {
        self.state.lock().unwrap().max_unacked
    }

    pub fn received_image(&self) -> Vec<u8> {
        self.state.lock().unwrap().received_image.clone()
    }

    pub fn received_init(&self) -> Vec<u8> {
        self.state.lock().unwrap().received_init.clone()
    }

    pub fn started_image_types(&self) -> Vec<u8> {
        self.state.lock().unwrap().started_image_types.clone()
    }

    pub fn activations(&self) -> usize {
        self.state.lock().unwrap().activations
    }

    pub fn reconnects(&self) -> usize {
        self.state.lock().unwrap().reconnects
    }

    pub fn system_resets(&self) -> usize {
        self.state.lock().unwrap().system_resets
    }

    pub fn enter_bootloader_seen(&self) -> bool {
        self.state.lock().unwrap().enter_bootloader_seen
    }

    pub fn advertised_name(&self) -> Option<String> {
        self.state.lock().unwrap().advertised_name.clone()
    }

    /// Release a held StartDfu response to the notification queue.
    pub fn release_held_response(&self) {
        self.release_held();
    }

    /// Release held packet receipts to the notification queue.
    pub fn release_held_receipts(&self) {
        self.release_held();
    }

    fn release_held(&self) {
        let mut state = self.state.lock().unwrap();
        // Stop holding future frames: once a test releases, a response the
        // worker has not produced yet (it may still be racing toward the
        // write that generates it) must flow straight through rather than
        // land back in the held queue forever.
        state.behavior.hold_start_response = false;
        state.behavior.hold_receipts = false;
        while let Some(frame) = state.held.pop_front() {
            state.notifications.push_back(frame);
        }
    }
}

// ============================================================================
// Package builders
// ============================================================================

#[derive(Debug, Clone)]
struct PartSpec {
    image: Vec<u8>,
    init: Vec<u8>,
    bin_length: Option<usize>,
    crc16: Option<u16>,
}

/// Builder for firmware packages, either as an on-disk zip archive or as
/// an in-memory `FirmwarePackage`.
#[derive(Debug, Clone)]
pub struct PackageBuilder {
    parts: Vec<(PartRole, PartSpec)>,
    include_manifest: bool,
    include_bins: bool,
    raw_manifest: Option<String>,
}

impl PackageBuilder {
    pub fn new() -> Self {
        Self {
            parts: Vec::new(),
            include_manifest: true,
            include_bins: true,
            raw_manifest: None,
        }
    }

    fn set_part(mut self, role: PartRole, image: Vec<u8>) -> Self {
        let spec = PartSpec {
            image,
            init: (0u8..16).collect(),
            bin_length: None,
            crc16: None,
        };
        self.parts.push((role, spec));
        self
    }

    pub fn softdevice(self, image: Vec<u8>) -> Self {
        self.set_part(PartRole::SoftDevice, image)
    }

    pub fn bootloader(self, image: Vec<u8>) -> Self {
        self.set_part(PartRole::Bootloader, image)
    }

    pub fn application(self, image: Vec<u8>) -> Self {
        self.set_part(PartRole::Application, image)
    }

    fn spec_mut(&mut self, role: &str) -> &mut PartSpec {
        self.parts
            .iter_mut()
            .find(|(part_role, _)| part_role.name() == role)
            .map(|(_, spec)| spec)
            .expect("role not present in builder")
    }

    pub fn init_packet(mut self, role: &str, init: Vec<u8>) -> Self {
        self.spec_mut(role).init = init;
        self
    }

    pub fn override_bin_length(mut self, role: &str, length: usize) -> Self {
        self.spec_mut(role).bin_length = Some(length);
        self
    }

    pub fn override_crc16(mut self, role: &str, crc: u16) -> Self {
        self.spec_mut(role).crc16 = Some(crc);
        self
    }

    pub fn omit_manifest(mut self) -> Self {
        self.include_manifest = false;
        self
    }

    pub fn omit_bin_files(mut self) -> Self {
        self.include_bins = false;
        self
    }

    pub fn raw_manifest(mut self, manifest: &str) -> Self {
        self.raw_manifest = Some(manifest.to_string());
        self
    }

    fn manifest_json(&self) -> String {
        let mut inner = serde_json::Map::new();
        for (role, spec) in &self.parts {
            let crc = spec.crc16.unwrap_or_else(|| image_crc16(&spec.image));
            inner.insert(
                role.name().to_string(),
                serde_json::json!({
                    "bin_file": format!("{}.bin", role.name()),
                    "dat_file": format!("{}.dat", role.name()),
                    "bin_length": spec.bin_length.unwrap_or(spec.image.len()),
                    "init_packet_data": {
                        "application_version": 4_294_967_295u32,
                        "device_revision": 65_535,
                        "device_type": 52,
                        "firmware_crc16": crc,
                        "softdevice_req": [65_534]
                    }
                }),
            );
        }
        inner.insert("dfu_version".to_string(), serde_json::json!(0.5));

        serde_json::json!({ "manifest": inner }).to_string()
    }

    /// Write the package as `firmware.zip` under `dir`.
    pub fn write_zip(&self, dir: &Path) -> PathBuf {
        let zip_path = dir.join("firmware.zip");
        let file = std::fs::File::create(&zip_path).unwrap();
        let mut zip = ZipWriter::new(file);
        let options = FileOptions::default().compression_method(zip::CompressionMethod::Stored);

        if let Some(ref raw) = self.raw_manifest {
            zip.start_file("manifest.json", options).unwrap();
            zip.write_all(raw.as_bytes()).unwrap();
        } else if self.include_manifest {
            zip.start_file("manifest.json", options).unwrap();
            zip.write_all(self.manifest_json().as_bytes()).unwrap();
        }

        for (role, spec) in &self.parts {
            if self.include_bins {
                zip.start_file(format!("{}.bin", role.name()), options)
                    .unwrap();
                zip.write_all(&spec.image).unwrap();
            }
            zip.start_file(format!("{}.dat", role.name()), options)
                .unwrap();
            zip.write_all(&spec.init).unwrap();
        }

        zip.finish().unwrap();
        zip_path
    }

    /// Build an in-memory package, bypassing the archive layer.
    pub fn build(&self) -> FirmwarePackage {
        let mut specs = self.parts.clone();
        specs.sort_by_key(|(role, _)| *role);

        let mut hasher = Sha256::new();
        let parts = specs
            .into_iter()
            .map(|(role, spec)| {
                hasher.update(&spec.image);
                FirmwarePart {
                    role,
                    image_size: spec.image.len(),
                    crc16: image_crc16(&spec.image),
                    device_type: 52,
                    init_packet: spec.init,
                    image: spec.image,
                }
            })
            .collect();

        FirmwarePackage::from_parts(parts, 0.5, format!("{:x}", hasher.finalize()))
    }
}

impl Default for PackageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Recording observer
// ============================================================================

/// One callback captured by `RecordingObserver`, in delivery order.
#[derive(Debug, Clone)]
pub enum RecordedEvent {
    State(DfuState),
    Progress(ProgressSample),
    /// Rejection code of the reported error.
    Error(String),
    Log(String),
}

/// Observer that records every callback for later assertions.
pub struct RecordingObserver {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl Default for RecordingObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl DfuObserver for RecordingObserver {
    fn on_state_changed(&self, state: DfuState, _device_address: &str) {
        self.events.lock().unwrap().push(RecordedEvent::State(state));
    }

    fn on_progress(&self, sample: &ProgressSample, _device_address: &str) {
        self.events
            .lock()
            .unwrap()
            .push(RecordedEvent::Progress(*sample));
    }

    fn on_error(&self, error: &DfuError, _device_address: &str) {
        self.events
            .lock()
            .unwrap()
            .push(RecordedEvent::Error(rejection_code(error).to_string()));
    }

    fn on_log(&self, _level: LogLevel, message: &str, _device_address: &str) {
        self.events
            .lock()
            .unwrap()
            .push(RecordedEvent::Log(message.to_string()));
    }
}
