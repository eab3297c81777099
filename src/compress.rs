// Copyright 2024 WinRun Authors
// SPDX-License-Identifier: Apache-2.0

//! Pluggable frame payload compression.
//!
//! The transport treats compression as a byte-in/byte-out stage between
//! region extraction and the ring-buffer write; no codec semantics leak
//! into the pipeline. The default implementation is zstd at a fast
//! level, so compression stays well under the frame interval.

use std::io;

/// Byte compressor applied to frame payloads before buffering.
pub trait FrameCompressor: Send {
    /// Short identifier for logs.
    fn name(&self) -> &'static str;

    /// Compress `raw` into a fresh buffer.
    fn compress(&mut self, raw: &[u8]) -> io::Result<Vec<u8>>;
}

/// zstd compressor.
pub struct ZstdCompressor {
    /// 1 = fast / less compression, 19 = slow / max. Frame payloads are
    /// compressed once per capture tick, so speed wins.
    level: i32,
}

impl ZstdCompressor {
    pub fn new() -> Self {
        Self { level: 1 }
    }

    pub fn with_level(level: i32) -> Self {
        Self {
            level: level.clamp(1, 19),
        }
    }
}

impl Default for ZstdCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCompressor for ZstdCompressor {
    fn name(&self) -> &'static str {
        "zstd"
    }

    fn compress(&mut self, raw: &[u8]) -> io::Result<Vec<u8>> {
        zstd::encode_all(raw, self.level)
    }
}

/// No-op compressor; hands the payload back untouched.
pub struct Passthrough;

impl FrameCompressor for Passthrough {
    fn name(&self) -> &'static str {
        "none"
    }

    fn compress(&mut self, raw: &[u8]) -> io::Result<Vec<u8>> {
        Ok(raw.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zstd_shrinks_uniform_frames() {
        let raw = vec![0x3Cu8; 256 * 1024];
        let mut compressor = ZstdCompressor::new();
        let compressed = compressor.compress(&raw).unwrap();
        assert!(compressed.len() < raw.len() / 10);

        let restored = zstd::decode_all(compressed.as_slice()).unwrap();
        assert_eq!(restored, raw);
    }

    #[test]
    fn passthrough_is_identity() {
        let raw = vec![1u8, 2, 3, 4];
        let mut compressor = Passthrough;
        assert_eq!(compressor.compress(&raw).unwrap(), raw);
    }

    #[test]
    fn level_is_clamped() {
        let c = ZstdCompressor::with_level(100);
        assert_eq!(c.level, 19);
        let c = ZstdCompressor::with_level(-5);
        assert_eq!(c.level, 1);
    }
}
