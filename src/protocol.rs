// Copyright 2024 WinRun Authors
// SPDX-License-Identifier: Apache-2.0

//! Shared protocol definitions between host and guest.
//!
//! Every message crossing the transport is wrapped in a
//! `[type:u8][length:u32 LE][payload]` envelope (see [`crate::wire`]).
//! Control payloads are UTF-8 JSON with camelCase field names; the frame
//! path instead stores a binary [`FrameSlotHeader`] followed by pixel bytes
//! inside a ring-buffer slot. Field order and endianness must be kept
//! byte-exact with the host-side implementation.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::telemetry::MetricsSnapshot;

/// Magic number for the shared region header: "WFRM"
pub const REGION_MAGIC: u32 = 0x4D52_4657;

/// Current protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Default number of slots per window ring buffer (triple buffering)
pub const DEFAULT_SLOT_COUNT: u32 = 3;

/// Size of the binary frame header preceding pixel bytes in a slot
pub const SLOT_HEADER_SIZE: usize = 36;

/// Size of the legacy shared-region header at the start of the mapped file
pub const REGION_HEADER_SIZE: usize = 64;

/// Milliseconds since the Unix epoch, used as guest→host timestamps.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── Wire type table ──────────────────────────────────────────────────

/// One byte on the wire per message variant. The table is closed: decoding
/// an unlisted value yields "unrecognized", never a panic.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireType {
    // Host → guest
    LaunchProcess = 0x01,
    Input = 0x02,
    Clipboard = 0x03,
    DragDrop = 0x04,
    Shutdown = 0x05,

    // Guest → host
    WindowMetadata = 0x10,
    FrameReady = 0x11,
    WindowBufferAllocated = 0x12,
    Capability = 0x13,
    Heartbeat = 0x14,
    Error = 0x15,
    Ack = 0x16,
    TelemetryReport = 0x17,
}

impl TryFrom<u8> for WireType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0x01 => Ok(WireType::LaunchProcess),
            0x02 => Ok(WireType::Input),
            0x03 => Ok(WireType::Clipboard),
            0x04 => Ok(WireType::DragDrop),
            0x05 => Ok(WireType::Shutdown),
            0x10 => Ok(WireType::WindowMetadata),
            0x11 => Ok(WireType::FrameReady),
            0x12 => Ok(WireType::WindowBufferAllocated),
            0x13 => Ok(WireType::Capability),
            0x14 => Ok(WireType::Heartbeat),
            0x15 => Ok(WireType::Error),
            0x16 => Ok(WireType::Ack),
            0x17 => Ok(WireType::TelemetryReport),
            other => Err(other),
        }
    }
}

// ── Pixel formats and slot flags ─────────────────────────────────────

/// Frame pixel format
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 32-bit BGRA (Blue, Green, Red, Alpha)
    Bgra32 = 0,
    /// 32-bit RGBA (Red, Green, Blue, Alpha)
    Rgba32 = 1,
}

impl Default for PixelFormat {
    fn default() -> Self {
        PixelFormat::Bgra32
    }
}

impl TryFrom<u32> for PixelFormat {
    type Error = &'static str;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PixelFormat::Bgra32),
            1 => Ok(PixelFormat::Rgba32),
            _ => Err("Invalid pixel format value"),
        }
    }
}

impl PixelFormat {
    /// Get bytes per pixel for this format
    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            PixelFormat::Bgra32 | PixelFormat::Rgba32 => 4,
        }
    }
}

bitflags::bitflags! {
    /// Flags carried in a frame slot header
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SlotFlags: u32 {
        /// Payload is compressed
        const COMPRESSED = 1 << 0;
        /// Frame encodes full image data (no delta)
        const KEY_FRAME = 1 << 1;
    }
}

impl Default for SlotFlags {
    fn default() -> Self {
        SlotFlags::empty()
    }
}

// ── Frame slot header ────────────────────────────────────────────────

/// Binary header preceding pixel bytes inside a ring-buffer slot.
///
/// Serialized as 36 bytes of little-endian fields; the host reconstructs
/// it from the shared region using the offsets carried in
/// [`WindowBufferAllocated`] notifications.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameSlotHeader {
    pub window_id: u64,
    pub frame_number: u32,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub pixel_format: PixelFormat,
    pub data_size: u32,
    pub flags: SlotFlags,
}

impl FrameSlotHeader {
    /// Serialize to the fixed 36-byte wire layout.
    pub fn to_bytes(&self) -> [u8; SLOT_HEADER_SIZE] {
        let mut b = [0u8; SLOT_HEADER_SIZE];
        b[0..8].copy_from_slice(&self.window_id.to_le_bytes());
        b[8..12].copy_from_slice(&self.frame_number.to_le_bytes());
        b[12..16].copy_from_slice(&self.width.to_le_bytes());
        b[16..20].copy_from_slice(&self.height.to_le_bytes());
        b[20..24].copy_from_slice(&self.stride.to_le_bytes());
        b[24..28].copy_from_slice(&(self.pixel_format as u32).to_le_bytes());
        b[28..32].copy_from_slice(&self.data_size.to_le_bytes());
        b[32..36].copy_from_slice(&self.flags.bits().to_le_bytes());
        b
    }

    /// Deserialize from the 36-byte wire layout. Returns `None` for short
    /// input or an unknown pixel format.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < SLOT_HEADER_SIZE {
            return None;
        }
        let le_u32 = |range: std::ops::Range<usize>| {
            u32::from_le_bytes(bytes[range].try_into().unwrap())
        };
        let pixel_format = PixelFormat::try_from(le_u32(24..28)).ok()?;
        Some(Self {
            window_id: u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
            frame_number: le_u32(8..12),
            width: le_u32(12..16),
            height: le_u32(16..20),
            stride: le_u32(20..24),
            pixel_format,
            data_size: le_u32(28..32),
            flags: SlotFlags::from_bits_truncate(le_u32(32..36)),
        })
    }
}

// ── Shared region header (legacy single-region variant) ──────────────

/// Header occupying the first 64 bytes of the mapped region.
///
/// The per-window path communicates buffer placement through explicit
/// [`WindowBufferAllocated`] messages instead; this header remains so the
/// host can validate the mapping and so the legacy single-region ring
/// layout stays readable.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RegionHeader {
    pub version: u32,
    pub total_size: u64,
    pub slot_count: u32,
    pub slot_size: u64,
    pub max_width: u32,
    pub max_height: u32,
    pub write_index: u32,
    pub read_index: u32,
    pub flags: u32,
}

impl RegionHeader {
    pub fn to_bytes(&self) -> [u8; REGION_HEADER_SIZE] {
        let mut b = [0u8; REGION_HEADER_SIZE];
        b[0..4].copy_from_slice(&REGION_MAGIC.to_le_bytes());
        b[4..8].copy_from_slice(&self.version.to_le_bytes());
        b[8..16].copy_from_slice(&self.total_size.to_le_bytes());
        b[16..20].copy_from_slice(&self.slot_count.to_le_bytes());
        b[20..28].copy_from_slice(&self.slot_size.to_le_bytes());
        b[28..32].copy_from_slice(&self.max_width.to_le_bytes());
        b[32..36].copy_from_slice(&self.max_height.to_le_bytes());
        b[36..40].copy_from_slice(&self.write_index.to_le_bytes());
        b[40..44].copy_from_slice(&self.read_index.to_le_bytes());
        b[44..48].copy_from_slice(&self.flags.to_le_bytes());
        b
    }

    /// Parse and validate the header. `None` when the magic or version
    /// does not match.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < REGION_HEADER_SIZE {
            return None;
        }
        let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        if magic != REGION_MAGIC {
            return None;
        }
        let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        if version != PROTOCOL_VERSION {
            return None;
        }
        Some(Self {
            version,
            total_size: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            slot_count: u32::from_le_bytes(bytes[16..20].try_into().unwrap()),
            slot_size: u64::from_le_bytes(bytes[20..28].try_into().unwrap()),
            max_width: u32::from_le_bytes(bytes[28..32].try_into().unwrap()),
            max_height: u32::from_le_bytes(bytes[32..36].try_into().unwrap()),
            write_index: u32::from_le_bytes(bytes[36..40].try_into().unwrap()),
            read_index: u32::from_le_bytes(bytes[40..44].try_into().unwrap()),
            flags: u32::from_le_bytes(bytes[44..48].try_into().unwrap()),
        })
    }
}

// ── Input events (host → guest) ──────────────────────────────────────

/// Input event type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InputEvent {
    /// Keyboard event
    Keyboard(KeyboardEvent),
    /// Mouse event
    Mouse(MouseEvent),
}

/// Keyboard event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyboardEvent {
    pub action: KeyAction,
    /// Hardware scan code
    pub code: u16,
    /// Extended keys (right Ctrl, arrows, numpad Enter, …) carry a 0xE0
    /// prefix on the source side
    #[serde(default)]
    pub is_extended: bool,
}

/// Key action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyAction {
    Press,
    Release,
}

/// Mouse event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MouseEvent {
    pub action: MouseAction,
    /// X coordinate (absolute, window space)
    pub x: i32,
    /// Y coordinate (absolute, window space)
    pub y: i32,
    pub button: Option<MouseButton>,
    #[serde(default)]
    pub scroll_delta_x: i32,
    #[serde(default)]
    pub scroll_delta_y: i32,
}

/// Mouse action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MouseAction {
    Move,
    ButtonPress,
    ButtonRelease,
    Scroll,
}

/// Mouse button
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MouseButton {
    Left,
    Right,
    Middle,
    Extra1,
    Extra2,
}

// ── Control payloads ─────────────────────────────────────────────────

/// Clipboard payload format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClipboardFormat {
    Text,
    Rtf,
    Html,
    Png,
    FileUrl,
}

/// Host → guest: launch a process inside the guest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchProcess {
    pub message_id: u64,
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
}

/// Host → guest: inject an input event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Input {
    pub message_id: u64,
    pub window_id: u64,
    pub event: InputEvent,
}

/// Host → guest: clipboard content changed on the host.
///
/// `sequence` increases monotonically so duplicate deliveries of the same
/// clipboard grab can be discarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Clipboard {
    pub message_id: u64,
    pub format: ClipboardFormat,
    pub data: Vec<u8>,
    pub sequence: u64,
}

/// Drag-drop phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DragAction {
    Enter,
    Move,
    Leave,
    Drop,
}

/// Host → guest: drag-drop event. Only `Drop` carries file paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DragDrop {
    pub message_id: u64,
    pub action: DragAction,
    pub x: i32,
    pub y: i32,
    #[serde(default)]
    pub paths: Vec<String>,
}

/// Host → guest: shut the agent down
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shutdown {
    pub message_id: u64,
}

/// Guest → host: metadata for a tracked window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowMetadata {
    pub timestamp: u64,
    pub window_id: u64,
    pub title: String,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub scale_factor: f64,
    pub is_resizable: bool,
    pub is_minimized: bool,
}

/// Guest → host: a new frame landed in a ring-buffer slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameReady {
    pub timestamp: u64,
    pub window_id: u64,
    pub slot_index: u32,
    pub frame_number: u32,
    pub is_key_frame: bool,
}

/// Guest → host: a per-window ring buffer was (re)allocated.
///
/// Sent before any frame is written into the new placement so the host
/// never interprets slot bytes against a stale layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowBufferAllocated {
    pub timestamp: u64,
    pub window_id: u64,
    /// Offset into the shared region, or 0 for private fallback buffers
    pub offset: u64,
    pub uses_shared_memory: bool,
    pub buffer_size: u64,
    pub slot_size: u64,
    pub slot_count: u32,
    pub is_compressed: bool,
    pub is_reallocation: bool,
}

/// Guest → host: capabilities announced at startup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capability {
    pub timestamp: u64,
    pub protocol_version: u32,
    pub supports_shared_memory: bool,
    pub supports_compression: bool,
    pub max_width: u32,
    pub max_height: u32,
}

/// Guest → host: liveness signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub timestamp: u64,
}

/// Guest → host: non-fatal error report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub timestamp: u64,
    pub context: String,
    pub message: String,
}

/// Guest → host: acknowledgement of a host message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub timestamp: u64,
    pub message_id: u64,
}

/// Guest → host: point-in-time transport counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryReport {
    pub timestamp: u64,
    pub metrics: MetricsSnapshot,
}

// ── Message union ────────────────────────────────────────────────────

/// All messages crossing the transport, in both directions.
///
/// A closed tagged union: adding a variant forces the wire table and
/// codec matches to be extended at compile time.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    LaunchProcess(LaunchProcess),
    Input(Input),
    Clipboard(Clipboard),
    DragDrop(DragDrop),
    Shutdown(Shutdown),
    WindowMetadata(WindowMetadata),
    FrameReady(FrameReady),
    WindowBufferAllocated(WindowBufferAllocated),
    Capability(Capability),
    Heartbeat(Heartbeat),
    Error(ErrorReport),
    Ack(Ack),
    TelemetryReport(TelemetryReport),
}

impl Message {
    /// Wire type byte for this variant.
    pub fn wire_type(&self) -> WireType {
        match self {
            Message::LaunchProcess(_) => WireType::LaunchProcess,
            Message::Input(_) => WireType::Input,
            Message::Clipboard(_) => WireType::Clipboard,
            Message::DragDrop(_) => WireType::DragDrop,
            Message::Shutdown(_) => WireType::Shutdown,
            Message::WindowMetadata(_) => WireType::WindowMetadata,
            Message::FrameReady(_) => WireType::FrameReady,
            Message::WindowBufferAllocated(_) => WireType::WindowBufferAllocated,
            Message::Capability(_) => WireType::Capability,
            Message::Heartbeat(_) => WireType::Heartbeat,
            Message::Error(_) => WireType::Error,
            Message::Ack(_) => WireType::Ack,
            Message::TelemetryReport(_) => WireType::TelemetryReport,
        }
    }

    /// Correlation id for host→guest messages, `None` for guest→host.
    pub fn message_id(&self) -> Option<u64> {
        match self {
            Message::LaunchProcess(m) => Some(m.message_id),
            Message::Input(m) => Some(m.message_id),
            Message::Clipboard(m) => Some(m.message_id),
            Message::DragDrop(m) => Some(m.message_id),
            Message::Shutdown(m) => Some(m.message_id),
            _ => None,
        }
    }

    /// Heartbeat stamped with the current time.
    pub fn heartbeat() -> Self {
        Message::Heartbeat(Heartbeat {
            timestamp: unix_millis(),
        })
    }
}
