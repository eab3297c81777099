// Copyright 2024 WinRun Authors
// SPDX-License-Identifier: Apache-2.0

//! Frame capture interface.
//!
//! The real capture backends (DXGI-style desktop duplication) live
//! outside this crate; the transport only depends on this trait. A
//! synthetic backend is provided so the binary runs and the capture loop
//! can be exercised without a display server.

use std::io;
use std::time::Duration;

use crate::protocol::{unix_millis, PixelFormat};

/// A rectangle in desktop coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// One captured frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// Bytes per row; at least `width * bytes_per_pixel`
    pub stride: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
    pub timestamp_ms: u64,
}

/// Desktop frame source.
pub trait CaptureSource: Send {
    /// Prepare the backend. Returns `false` when the source is
    /// unavailable; the orchestrator retries with backoff.
    fn initialize(&mut self) -> bool;

    /// Capture the next frame, waiting up to `timeout`.
    ///
    /// `Ok(None)` means no new frame arrived in time, which is normal for a
    /// static screen, not an error. `Err` indicates a device failure and
    /// counts toward re-initialization.
    fn capture_frame(&mut self, timeout: Duration) -> io::Result<Option<Frame>>;

    /// Copy a sub-rectangle out of a desktop frame, clamped to the frame
    /// bounds. Returns `None` when the clamped rectangle is empty.
    fn extract_region(&self, frame: &Frame, rect: Rect) -> Option<Frame> {
        let bpp = frame.format.bytes_per_pixel();

        let x0 = rect.x.clamp(0, frame.width as i32) as u32;
        let y0 = rect.y.clamp(0, frame.height as i32) as u32;
        let x1 = (rect.x as i64 + rect.width as i64).clamp(0, frame.width as i64) as u32;
        let y1 = (rect.y as i64 + rect.height as i64).clamp(0, frame.height as i64) as u32;
        if x1 <= x0 || y1 <= y0 {
            return None;
        }

        let width = x1 - x0;
        let height = y1 - y0;
        let stride = width * bpp;
        let mut data = Vec::with_capacity((stride * height) as usize);
        for row in y0..y1 {
            let start = (row * frame.stride + x0 * bpp) as usize;
            data.extend_from_slice(&frame.data[start..start + stride as usize]);
        }

        Some(Frame {
            width,
            height,
            stride,
            format: frame.format,
            data,
            timestamp_ms: frame.timestamp_ms,
        })
    }
}

/// Deterministic test-pattern source: a gradient that shifts every frame,
/// so consecutive captures differ and frame pacing is observable.
pub struct SyntheticCapture {
    width: u32,
    height: u32,
    frame_counter: u64,
    initialized: bool,
}

impl SyntheticCapture {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            frame_counter: 0,
            initialized: false,
        }
    }
}

impl CaptureSource for SyntheticCapture {
    fn initialize(&mut self) -> bool {
        self.initialized = true;
        true
    }

    fn capture_frame(&mut self, _timeout: Duration) -> io::Result<Option<Frame>> {
        if !self.initialized {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "capture source not initialized",
            ));
        }

        self.frame_counter += 1;
        let shift = (self.frame_counter % 251) as u8;
        let stride = self.width * 4;
        let mut data = vec![0u8; (stride * self.height) as usize];
        for y in 0..self.height {
            for x in 0..self.width {
                let i = ((y * stride) + x * 4) as usize;
                data[i] = (x as u8).wrapping_add(shift);
                data[i + 1] = (y as u8).wrapping_add(shift);
                data[i + 2] = shift;
                data[i + 3] = 0xFF;
            }
        }

        Ok(Some(Frame {
            width: self.width,
            height: self.height,
            stride,
            format: PixelFormat::Bgra32,
            data,
            timestamp_ms: unix_millis(),
        }))
    }
}
