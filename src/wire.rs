// Copyright 2024 WinRun Authors
// SPDX-License-Identifier: Apache-2.0

//! Envelope framing for the byte-stream transport.
//!
//! Wire format:
//! ```text
//! [type:1][length:4 LE][payload:N]
//! ```
//! Encoding is total over the closed message table; decoding is partial:
//! a short buffer means "incomplete" (wait for more bytes), an unknown
//! type byte or malformed payload is skippable, and an implausible
//! declared length marks the stream as corrupt.

use log::{debug, warn};
use thiserror::Error;

use crate::protocol::{Message, WireType};

/// Fixed envelope header: one type byte plus a little-endian u32 length.
pub const ENVELOPE_HEADER_SIZE: usize = 5;

/// Hard cap on a declared payload length. Anything above this is treated
/// as stream corruption rather than an envelope worth buffering for.
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

/// Errors from the framing layer.
#[derive(Debug, Error)]
pub enum WireError {
    /// Declared length exceeds the plausibility cap; the stream is
    /// corrupt and the connection should be re-established.
    #[error("envelope declares implausible payload length {declared} (cap {MAX_PAYLOAD_SIZE})")]
    ImplausibleLength { declared: usize },

    /// Payload serialization failed. Not expected for the closed message
    /// table; indicates a programming error.
    #[error("payload serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Encode a message into a framed envelope.
pub fn encode(message: &Message) -> Result<Vec<u8>, WireError> {
    let payload = payload_bytes(message)?;
    let mut out = Vec::with_capacity(ENVELOPE_HEADER_SIZE + payload.len());
    out.push(message.wire_type() as u8);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Try to extract one message from the front of `buf`.
///
/// Returns `(consumed, message)`:
/// - `(0, None)`: the buffer holds a partial envelope; feed more bytes
///   and call again. Nothing was consumed.
/// - `(n, Some(msg))`: a message was decoded from the first `n` bytes.
/// - `(n, None)`: the first `n` bytes held an unrecognized type byte or
///   a malformed payload; the envelope is skipped and the positions of
///   subsequent messages are preserved.
///
/// An envelope declaring a payload beyond [`MAX_PAYLOAD_SIZE`] yields
/// [`WireError::ImplausibleLength`]; callers must treat the stream as
/// corrupt and reconnect instead of buffering indefinitely.
pub fn try_read(buf: &[u8]) -> Result<(usize, Option<Message>), WireError> {
    if buf.len() < ENVELOPE_HEADER_SIZE {
        return Ok((0, None));
    }

    let declared = u32::from_le_bytes(buf[1..5].try_into().unwrap()) as usize;
    if declared > MAX_PAYLOAD_SIZE {
        return Err(WireError::ImplausibleLength { declared });
    }

    let total = ENVELOPE_HEADER_SIZE + declared;
    if buf.len() < total {
        return Ok((0, None));
    }

    let payload = &buf[ENVELOPE_HEADER_SIZE..total];
    match WireType::try_from(buf[0]) {
        Err(unknown) => {
            debug!("skipping envelope with unrecognized type byte 0x{unknown:02X} ({declared} bytes)");
            Ok((total, None))
        }
        Ok(wire_type) => match decode_payload(wire_type, payload) {
            Ok(message) => Ok((total, Some(message))),
            Err(e) => {
                warn!("dropping malformed {wire_type:?} payload: {e}");
                Ok((total, None))
            }
        },
    }
}

/// Decode a single message from a complete buffer.
///
/// `None` covers both an incomplete envelope and a skippable one; use
/// [`try_read`] when the distinction (and the consumed byte count)
/// matters, e.g. when draining a receive buffer.
pub fn decode(buf: &[u8]) -> Result<Option<Message>, WireError> {
    try_read(buf).map(|(_, message)| message)
}

fn payload_bytes(message: &Message) -> Result<Vec<u8>, serde_json::Error> {
    match message {
        Message::LaunchProcess(m) => serde_json::to_vec(m),
        Message::Input(m) => serde_json::to_vec(m),
        Message::Clipboard(m) => serde_json::to_vec(m),
        Message::DragDrop(m) => serde_json::to_vec(m),
        Message::Shutdown(m) => serde_json::to_vec(m),
        Message::WindowMetadata(m) => serde_json::to_vec(m),
        Message::FrameReady(m) => serde_json::to_vec(m),
        Message::WindowBufferAllocated(m) => serde_json::to_vec(m),
        Message::Capability(m) => serde_json::to_vec(m),
        Message::Heartbeat(m) => serde_json::to_vec(m),
        Message::Error(m) => serde_json::to_vec(m),
        Message::Ack(m) => serde_json::to_vec(m),
        Message::TelemetryReport(m) => serde_json::to_vec(m),
    }
}

fn decode_payload(wire_type: WireType, payload: &[u8]) -> Result<Message, serde_json::Error> {
    Ok(match wire_type {
        WireType::LaunchProcess => Message::LaunchProcess(serde_json::from_slice(payload)?),
        WireType::Input => Message::Input(serde_json::from_slice(payload)?),
        WireType::Clipboard => Message::Clipboard(serde_json::from_slice(payload)?),
        WireType::DragDrop => Message::DragDrop(serde_json::from_slice(payload)?),
        WireType::Shutdown => Message::Shutdown(serde_json::from_slice(payload)?),
        WireType::WindowMetadata => Message::WindowMetadata(serde_json::from_slice(payload)?),
        WireType::FrameReady => Message::FrameReady(serde_json::from_slice(payload)?),
        WireType::WindowBufferAllocated => {
            Message::WindowBufferAllocated(serde_json::from_slice(payload)?)
        }
        WireType::Capability => Message::Capability(serde_json::from_slice(payload)?),
        WireType::Heartbeat => Message::Heartbeat(serde_json::from_slice(payload)?),
        WireType::Error => Message::Error(serde_json::from_slice(payload)?),
        WireType::Ack => Message::Ack(serde_json::from_slice(payload)?),
        WireType::TelemetryReport => Message::TelemetryReport(serde_json::from_slice(payload)?),
    })
}
