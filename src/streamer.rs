// Copyright 2024 WinRun Authors
// SPDX-License-Identifier: Apache-2.0

//! Capture-and-publish orchestration loop.
//!
//! A dedicated thread pulls desktop frames from the capture source,
//! extracts per-window sub-regions, optionally compresses them, writes
//! them into the per-window ring buffers, and emits notifications
//! through the outbound queue. The loop is soft real-time: each
//! iteration sleeps the remainder of the target frame interval.
//!
//! Backpressure is drop-based: a full ring or a failed allocation costs
//! one frame and a counter bump, never a stall of the capture loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::buffer_manager::BufferManager;
use crate::capture::{CaptureSource, Frame, Rect};
use crate::compress::FrameCompressor;
use crate::protocol::{
    unix_millis, FrameReady, FrameSlotHeader, Message, SlotFlags, WindowBufferAllocated,
};
use crate::window::WindowRegistry;

/// Pseudo window id for whole-desktop streaming (per-window mode off).
pub const DESKTOP_WINDOW_ID: u64 = 0;

/// Orchestrator tuning knobs.
#[derive(Debug, Clone)]
pub struct StreamerConfig {
    /// Target capture rate for the desktop frame source
    pub target_fps: u32,
    /// Stream each tracked window separately instead of the whole desktop
    pub per_window: bool,
    /// Floor between two captures of the same window. Decouples
    /// per-window rate from the desktop capture rate.
    pub min_window_interval: Duration,
    /// How long one capture call may wait for a new frame
    pub capture_timeout: Duration,
    /// Capture errors in a row before the source is re-initialized
    pub max_consecutive_failures: u32,
    /// Pause before re-initializing a failing capture source
    pub reinit_cooldown: Duration,
    /// How long `stop()` waits for the loop to exit
    pub stop_grace: Duration,
    /// Advance the read index locally once the frame notification is
    /// queued. Without a host-side read acknowledgement wired in, this
    /// keeps the ring draining; with one, leave it off and call
    /// `BufferManager::advance_read_index` from the ack path.
    pub local_read_advance: bool,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            target_fps: 30,
            per_window: true,
            min_window_interval: Duration::from_millis(33),
            capture_timeout: Duration::from_millis(100),
            max_consecutive_failures: 10,
            reinit_cooldown: Duration::from_millis(500),
            stop_grace: Duration::from_secs(2),
            local_read_advance: false,
        }
    }
}

/// Orchestrator lifecycle states.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamerState {
    Idle = 0,
    Initializing = 1,
    Running = 2,
    ErrorBackoff = 3,
    Stopped = 4,
}

impl From<u8> for StreamerState {
    fn from(value: u8) -> Self {
        match value {
            1 => StreamerState::Initializing,
            2 => StreamerState::Running,
            3 => StreamerState::ErrorBackoff,
            4 => StreamerState::Stopped,
            _ => StreamerState::Idle,
        }
    }
}

/// Monotonic loop counters. Drops are counted, never escalated.
#[derive(Default)]
pub struct StreamerStats {
    pub frames_captured: AtomicU64,
    pub capture_timeouts: AtomicU64,
    pub capture_failures: AtomicU64,
    pub window_frames_written: AtomicU64,
    pub frames_dropped_full: AtomicU64,
    pub frames_dropped_oversize: AtomicU64,
    pub zero_area_drops: AtomicU64,
    pub compress_failures: AtomicU64,
    pub source_reinits: AtomicU64,
}

impl StreamerStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

struct StreamerShared {
    config: StreamerConfig,
    buffers: Arc<BufferManager>,
    registry: Arc<WindowRegistry>,
    notifier: flume::Sender<Message>,
    cancel: AtomicBool,
    state: AtomicU8,
    stats: StreamerStats,
}

impl StreamerShared {
    fn set_state(&self, state: StreamerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Queue an outbound notification, blocking in short slices so
    /// cancellation stays responsive. `false` ends the loop.
    fn notify(&self, message: Message) -> bool {
        let mut pending = message;
        loop {
            if self.cancelled() {
                return false;
            }
            match self
                .notifier
                .send_timeout(pending, Duration::from_millis(50))
            {
                Ok(()) => return true,
                Err(flume::SendTimeoutError::Timeout(m)) => pending = m,
                Err(flume::SendTimeoutError::Disconnected(_)) => {
                    debug!("notification queue disconnected, stopping capture loop");
                    return false;
                }
            }
        }
    }
}

/// The capture loop. One instance per agent; owns the capture source and
/// compressor while running.
pub struct FrameStreamer {
    shared: Arc<StreamerShared>,
    capture: Option<Box<dyn CaptureSource>>,
    compressor: Option<Box<dyn FrameCompressor>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl FrameStreamer {
    pub fn new(
        config: StreamerConfig,
        capture: Box<dyn CaptureSource>,
        compressor: Option<Box<dyn FrameCompressor>>,
        buffers: Arc<BufferManager>,
        registry: Arc<WindowRegistry>,
        notifier: flume::Sender<Message>,
    ) -> Self {
        let frame_interval = Duration::from_millis(1000 / config.target_fps.max(1) as u64);
        if config.per_window && config.min_window_interval < frame_interval {
            // Windows can never be captured faster than the desktop rate;
            // the interval floor only throttles below it.
            warn!(
                "min window interval {:?} is below the frame interval {:?} and will have no effect",
                config.min_window_interval, frame_interval
            );
        }

        Self {
            shared: Arc::new(StreamerShared {
                config,
                buffers,
                registry,
                notifier,
                cancel: AtomicBool::new(false),
                state: AtomicU8::new(StreamerState::Idle as u8),
                stats: StreamerStats::default(),
            }),
            capture: Some(capture),
            compressor,
            handle: None,
        }
    }

    pub fn state(&self) -> StreamerState {
        StreamerState::from(self.shared.state.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> &StreamerStats {
        &self.shared.stats
    }

    /// Spawn the capture loop. A no-op when already running.
    pub fn start(&mut self) {
        match self.state() {
            StreamerState::Initializing | StreamerState::Running | StreamerState::ErrorBackoff => {
                debug!("streamer already running");
                return;
            }
            _ => {}
        }
        let Some(capture) = self.capture.take() else {
            warn!("streamer cannot restart: capture source already consumed");
            return;
        };
        let compressor = self.compressor.take();

        let shared = self.shared.clone();
        shared.set_state(StreamerState::Initializing);
        self.handle = Some(
            thread::Builder::new()
                .name("frame-streamer".to_string())
                .spawn(move || run_loop(shared, capture, compressor))
                .expect("spawn frame-streamer thread"),
        );
    }

    /// Cooperative stop: set the cancel flag and wait up to the grace
    /// period, then return regardless.
    pub fn stop(&mut self) {
        self.shared.cancel.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let deadline = Instant::now() + self.shared.config.stop_grace;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                handle.join().ok();
            } else {
                warn!("capture loop did not stop within the grace period, detaching");
            }
        }
    }
}

impl Drop for FrameStreamer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(
    shared: Arc<StreamerShared>,
    mut capture: Box<dyn CaptureSource>,
    mut compressor: Option<Box<dyn FrameCompressor>>,
) {
    // Initialization with backoff: a broken source keeps the loop in
    // Initializing/ErrorBackoff until it comes up or the agent stops.
    loop {
        if shared.cancelled() {
            shared.set_state(StreamerState::Stopped);
            return;
        }
        shared.set_state(StreamerState::Initializing);
        if capture.initialize() {
            break;
        }
        warn!("capture source failed to initialize, retrying");
        shared.set_state(StreamerState::ErrorBackoff);
        thread::sleep(shared.config.reinit_cooldown);
    }
    shared.set_state(StreamerState::Running);
    info!("capture loop running at {} fps target", shared.config.target_fps);

    let frame_interval = Duration::from_millis(1000 / shared.config.target_fps.max(1) as u64);
    let mut consecutive_failures: u32 = 0;
    let mut last_window_capture: HashMap<u64, Instant> = HashMap::new();
    let mut frame_numbers: HashMap<u64, u32> = HashMap::new();

    while !shared.cancelled() {
        let iteration_start = Instant::now();

        match capture.capture_frame(shared.config.capture_timeout) {
            Ok(Some(frame)) => {
                consecutive_failures = 0;
                // Clears a lingering ErrorBackoff once the source recovers.
                shared.set_state(StreamerState::Running);
                StreamerStats::bump(&shared.stats.frames_captured);
                if shared.config.per_window {
                    process_windows(
                        &shared,
                        capture.as_ref(),
                        &mut compressor,
                        &frame,
                        &mut last_window_capture,
                        &mut frame_numbers,
                    );
                } else {
                    publish_window_frame(
                        &shared,
                        &mut compressor,
                        frame,
                        DESKTOP_WINDOW_ID,
                        &mut frame_numbers,
                    );
                }
            }
            // No new frame inside the timeout: the screen is static.
            Ok(None) => StreamerStats::bump(&shared.stats.capture_timeouts),
            Err(e) => {
                consecutive_failures += 1;
                StreamerStats::bump(&shared.stats.capture_failures);
                warn!("frame capture failed ({consecutive_failures} in a row): {e}");
                if consecutive_failures >= shared.config.max_consecutive_failures {
                    reinitialize_source(&shared, capture.as_mut());
                    consecutive_failures = 0;
                }
            }
        }

        if shared.config.per_window {
            shared
                .buffers
                .cleanup_stale_buffers(&shared.registry.active_ids());
        }

        let elapsed = iteration_start.elapsed();
        if elapsed < frame_interval && !shared.cancelled() {
            thread::sleep(frame_interval - elapsed);
        }
    }

    shared.set_state(StreamerState::Stopped);
    info!("capture loop stopped");
}

fn reinitialize_source(shared: &StreamerShared, capture: &mut dyn CaptureSource) {
    warn!(
        "{} consecutive capture failures, re-initializing source",
        shared.config.max_consecutive_failures
    );
    shared.set_state(StreamerState::ErrorBackoff);
    thread::sleep(shared.config.reinit_cooldown);
    if shared.cancelled() {
        return;
    }
    shared.set_state(StreamerState::Initializing);
    if capture.initialize() {
        StreamerStats::bump(&shared.stats.source_reinits);
        shared.set_state(StreamerState::Running);
    } else {
        // Stay in backoff; the failure counter starts fresh and the next
        // crossing retries again.
        warn!("capture source re-initialization failed");
        shared.set_state(StreamerState::ErrorBackoff);
    }
}

fn process_windows(
    shared: &StreamerShared,
    capture: &dyn CaptureSource,
    compressor: &mut Option<Box<dyn FrameCompressor>>,
    frame: &Frame,
    last_window_capture: &mut HashMap<u64, Instant>,
    frame_numbers: &mut HashMap<u64, u32>,
) {
    for window in shared.registry.snapshot() {
        if shared.cancelled() {
            return;
        }
        if window.is_minimized {
            continue;
        }
        if let Some(last) = last_window_capture.get(&window.window_id) {
            if last.elapsed() < shared.config.min_window_interval {
                continue;
            }
        }
        last_window_capture.insert(window.window_id, Instant::now());

        let rect = Rect::new(
            window.rect.x,
            window.rect.y,
            window.rect.width,
            window.rect.height,
        );
        let Some(sub) = capture.extract_region(frame, rect) else {
            // Window entirely off-screen; nothing worth publishing.
            StreamerStats::bump(&shared.stats.zero_area_drops);
            continue;
        };

        if !publish_window_frame(shared, compressor, sub, window.window_id, frame_numbers) {
            return;
        }
    }
}

/// Compress, allocate, write, and notify for one window frame. Returns
/// `false` only when the loop should stop (queue gone or cancelled).
fn publish_window_frame(
    shared: &StreamerShared,
    compressor: &mut Option<Box<dyn FrameCompressor>>,
    frame: Frame,
    window_id: u64,
    frame_numbers: &mut HashMap<u64, u32>,
) -> bool {
    let Frame {
        width,
        height,
        stride,
        format,
        data,
        ..
    } = frame;
    let (payload, compressed): (Vec<u8>, bool) = match compressor {
        Some(c) => match c.compress(&data) {
            Ok(compressed) => (compressed, true),
            Err(e) => {
                StreamerStats::bump(&shared.stats.compress_failures);
                debug!("{} compression failed ({e}), sending raw", c.name());
                (data, false)
            }
        },
        None => (data, false),
    };

    let (outcome, placement) = shared
        .buffers
        .ensure_allocated(window_id, width, height, payload.len());
    if outcome.changed() {
        // The host must learn the new placement before any slot bytes
        // are written against it.
        let allocated = Message::WindowBufferAllocated(WindowBufferAllocated {
            timestamp: unix_millis(),
            window_id,
            offset: placement.offset,
            uses_shared_memory: placement.uses_shared_memory,
            buffer_size: placement.buffer_size,
            slot_size: placement.slot_size,
            slot_count: placement.slot_count,
            is_compressed: compressed,
            is_reallocation: outcome == crate::frame_buffer::AllocationOutcome::Reallocated,
        });
        if !shared.notify(allocated) {
            return false;
        }
    }

    let frame_number = frame_numbers.get(&window_id).copied().unwrap_or(0) + 1;
    let mut flags = SlotFlags::KEY_FRAME;
    if compressed {
        flags |= SlotFlags::COMPRESSED;
    }
    let header = FrameSlotHeader {
        window_id,
        frame_number,
        width,
        height,
        stride,
        pixel_format: format,
        data_size: payload.len() as u32,
        flags,
    };

    match shared.buffers.write_frame(window_id, &header, &payload) {
        Ok(slot_index) => {
            frame_numbers.insert(window_id, frame_number);
            StreamerStats::bump(&shared.stats.window_frames_written);
            let ready = Message::FrameReady(FrameReady {
                timestamp: unix_millis(),
                window_id,
                slot_index,
                frame_number,
                is_key_frame: true,
            });
            if !shared.notify(ready) {
                return false;
            }
            if shared.config.local_read_advance {
                shared.buffers.advance_read_index(window_id);
            }
            true
        }
        Err(crate::frame_buffer::FrameWriteError::BufferFull) => {
            StreamerStats::bump(&shared.stats.frames_dropped_full);
            true
        }
        Err(crate::frame_buffer::FrameWriteError::PayloadTooLarge { size, capacity }) => {
            StreamerStats::bump(&shared.stats.frames_dropped_oversize);
            debug!("window {window_id} frame of {size} bytes exceeds slot capacity {capacity}");
            true
        }
        Err(crate::frame_buffer::FrameWriteError::Unallocated) => {
            // ensure_allocated just ran; only reachable if allocation
            // itself failed. Counted like any transient exhaustion.
            StreamerStats::bump(&shared.stats.frames_dropped_full);
            true
        }
    }
}
