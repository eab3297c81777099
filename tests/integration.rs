// Copyright 2024 WinRun Authors
// SPDX-License-Identifier: Apache-2.0

//! Integration tests for the guest agent frame transport
//!
//! This file contains end-to-end tests for:
//! - The capture → compress → buffer → notify pipeline
//! - Shared-memory-backed per-window buffers
//! - The wire codec over a chunked transport
//! - Retry/telemetry behavior against failing sinks

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use winrun_guest_agent::buffer_manager::BufferManager;
use winrun_guest_agent::capture::{Rect, SyntheticCapture};
use winrun_guest_agent::compress::ZstdCompressor;
use winrun_guest_agent::frame_buffer::AllocationMode;
use winrun_guest_agent::protocol::{
    FrameSlotHeader, Message, DEFAULT_SLOT_COUNT, SLOT_HEADER_SIZE,
};
use winrun_guest_agent::shmem::{SharedMemoryAllocator, SharedMemoryConfig};
use winrun_guest_agent::streamer::{FrameStreamer, StreamerConfig, StreamerState};
use winrun_guest_agent::telemetry::{send_with_retry, RetryPolicy, TransportMetrics};
use winrun_guest_agent::transport::{InboundHandler, MessageReader, MessageSink, SendError};
use winrun_guest_agent::window::{WindowInfo, WindowRegistry};
use winrun_guest_agent::wire;

static REGION_SEQ: AtomicU32 = AtomicU32::new(0);

fn temp_region(size: usize) -> (SharedMemoryConfig, PathBuf) {
    let seq = REGION_SEQ.fetch_add(1, Ordering::Relaxed);
    let path = std::env::temp_dir().join(format!(
        "winrun-integration-{}-{seq}",
        std::process::id()
    ));
    (
        SharedMemoryConfig {
            path: path.clone(),
            minimum_size: size,
            create: true,
        },
        path,
    )
}

fn window(id: u64, rect: Rect) -> WindowInfo {
    WindowInfo {
        window_id: id,
        title: format!("window-{id}"),
        rect,
        scale_factor: 1.0,
        is_resizable: true,
        is_minimized: false,
    }
}

fn fast_streamer_config() -> StreamerConfig {
    StreamerConfig {
        target_fps: 120,
        per_window: true,
        min_window_interval: Duration::from_millis(1),
        capture_timeout: Duration::from_millis(5),
        max_consecutive_failures: 5,
        reinit_cooldown: Duration::from_millis(5),
        stop_grace: Duration::from_secs(2),
        local_read_advance: true,
    }
}

// ============================================================================
// Pipeline: capture → buffer → notifications
// ============================================================================

#[test]
fn pipeline_publishes_allocation_before_frames() {
    let registry = Arc::new(WindowRegistry::new());
    registry.upsert(window(1, Rect::new(0, 0, 96, 64)));
    registry.upsert(window(2, Rect::new(32, 16, 48, 32)));

    let buffers = Arc::new(BufferManager::new(
        None,
        AllocationMode::Exact,
        DEFAULT_SLOT_COUNT,
    ));
    let (tx, rx) = flume::bounded(4096);
    let mut streamer = FrameStreamer::new(
        fast_streamer_config(),
        Box::new(SyntheticCapture::new(256, 128)),
        None,
        buffers,
        registry,
        tx,
    );

    streamer.start();
    std::thread::sleep(Duration::from_millis(250));
    streamer.stop();
    assert_eq!(streamer.state(), StreamerState::Stopped);

    let mut allocated: HashMap<u64, bool> = HashMap::new();
    let mut last_frame_number: HashMap<u64, u32> = HashMap::new();
    let mut ready_per_window: HashMap<u64, u32> = HashMap::new();
    for message in rx.drain() {
        match message {
            Message::WindowBufferAllocated(m) => {
                assert!(!m.uses_shared_memory, "no region was configured");
                assert_eq!(m.slot_count, DEFAULT_SLOT_COUNT);
                assert!(m.slot_size as usize > SLOT_HEADER_SIZE);
                allocated.insert(m.window_id, true);
            }
            Message::FrameReady(m) => {
                assert_eq!(
                    allocated.get(&m.window_id),
                    Some(&true),
                    "allocation notice must precede frames for window {}",
                    m.window_id
                );
                if let Some(prev) = last_frame_number.get(&m.window_id) {
                    assert!(m.frame_number > *prev);
                }
                last_frame_number.insert(m.window_id, m.frame_number);
                *ready_per_window.entry(m.window_id).or_insert(0) += 1;
                assert!(m.is_key_frame);
            }
            _ => {}
        }
    }
    assert_eq!(allocated.len(), 2);
    assert!(ready_per_window.values().all(|&count| count > 1));
}

#[test]
fn pipeline_reallocates_on_window_resize() {
    let registry = Arc::new(WindowRegistry::new());
    registry.upsert(window(5, Rect::new(0, 0, 64, 64)));

    let buffers = Arc::new(BufferManager::new(
        None,
        AllocationMode::Exact,
        DEFAULT_SLOT_COUNT,
    ));
    let (tx, rx) = flume::bounded(4096);
    let mut streamer = FrameStreamer::new(
        fast_streamer_config(),
        Box::new(SyntheticCapture::new(256, 256)),
        None,
        buffers,
        registry.clone(),
        tx,
    );

    streamer.start();
    std::thread::sleep(Duration::from_millis(100));
    registry.upsert(window(5, Rect::new(0, 0, 128, 128)));
    std::thread::sleep(Duration::from_millis(100));
    streamer.stop();

    let allocations: Vec<_> = rx
        .drain()
        .filter_map(|m| match m {
            Message::WindowBufferAllocated(a) => Some(a),
            _ => None,
        })
        .collect();
    assert_eq!(allocations.len(), 2, "resize must reallocate exactly once");
    assert!(!allocations[0].is_reallocation);
    assert!(allocations[1].is_reallocation);
    assert!(allocations[1].slot_size > allocations[0].slot_size);
}

#[test]
fn pipeline_writes_shared_memory_slots_the_host_can_read() {
    let (config, path) = temp_region(32 * 1024 * 1024);
    let allocator = Arc::new(SharedMemoryAllocator::initialize(&config).expect("map region"));

    let registry = Arc::new(WindowRegistry::new());
    registry.upsert(window(9, Rect::new(0, 0, 64, 48)));

    let buffers = Arc::new(BufferManager::new(
        Some(allocator.clone()),
        AllocationMode::Exact,
        DEFAULT_SLOT_COUNT,
    ));
    let (tx, rx) = flume::bounded(4096);
    let mut streamer = FrameStreamer::new(
        fast_streamer_config(),
        Box::new(SyntheticCapture::new(128, 96)),
        None,
        buffers,
        registry,
        tx,
    );

    streamer.start();
    std::thread::sleep(Duration::from_millis(150));
    streamer.stop();

    // Play the host: recover the buffer placement from the allocation
    // notice and read a published slot straight out of the region.
    let messages: Vec<Message> = rx.drain().collect();
    let placement = messages
        .iter()
        .find_map(|m| match m {
            Message::WindowBufferAllocated(a) => Some(a.clone()),
            _ => None,
        })
        .expect("allocation notice");
    assert!(placement.uses_shared_memory);
    assert!(placement.offset > 0);

    // The ring wraps while streaming, so only the slot behind the most
    // recent notification still holds the frame it advertised.
    let ready = messages
        .iter()
        .rev()
        .find_map(|m| match m {
            Message::FrameReady(r) => Some(r.clone()),
            _ => None,
        })
        .expect("frame notice");

    let slot_ptr = allocator
        .offset_to_pointer(placement.offset + ready.slot_index as u64 * placement.slot_size)
        .expect("slot offset within region");
    // SAFETY: the slot range lies inside the mapped region and the
    // streamer is stopped.
    let slot = unsafe {
        std::slice::from_raw_parts(slot_ptr as *const u8, placement.slot_size as usize)
    };
    let header = FrameSlotHeader::from_bytes(&slot[..SLOT_HEADER_SIZE]).expect("slot header");
    assert_eq!(header.window_id, 9);
    assert_eq!(header.frame_number, ready.frame_number);
    assert_eq!((header.width, header.height), (64, 48));
    assert_eq!(header.data_size as usize, (64 * 48 * 4) as usize);

    let _ = std::fs::remove_file(path);
}

#[test]
fn pipeline_compressed_frames_use_tranche_buckets() {
    let registry = Arc::new(WindowRegistry::new());
    registry.upsert(window(3, Rect::new(0, 0, 64, 64)));

    let buffers = Arc::new(BufferManager::new(
        None,
        AllocationMode::Tranche,
        DEFAULT_SLOT_COUNT,
    ));
    let (tx, rx) = flume::bounded(4096);
    let mut config = fast_streamer_config();
    config.local_read_advance = false;
    let mut streamer = FrameStreamer::new(
        config,
        Box::new(SyntheticCapture::new(128, 128)),
        Some(Box::new(ZstdCompressor::new())),
        buffers.clone(),
        registry,
        tx,
    );

    streamer.start();
    std::thread::sleep(Duration::from_millis(100));
    streamer.stop();

    let allocation = rx
        .drain()
        .find_map(|m| match m {
            Message::WindowBufferAllocated(a) => Some(a),
            _ => None,
        })
        .expect("allocation notice");
    assert!(allocation.is_compressed);
    // Tranche mode snapped the slot to the smallest bucket.
    assert_eq!(
        allocation.slot_size as usize,
        winrun_guest_agent::frame_buffer::TRANCHE_BUCKETS[0]
    );
}

// ============================================================================
// Wire codec over a chunked transport
// ============================================================================

struct TrickleReader {
    data: Vec<u8>,
    position: usize,
    step: usize,
}

impl std::io::Read for TrickleReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.position >= self.data.len() {
            return Ok(0);
        }
        let end = (self.position + self.step).min(self.data.len());
        let n = (end - self.position).min(buf.len());
        buf[..n].copy_from_slice(&self.data[self.position..self.position + n]);
        self.position += n;
        Ok(n)
    }
}

#[derive(Default)]
struct Collector {
    messages: Vec<Message>,
}

impl InboundHandler for Collector {
    fn handle(&mut self, message: Message) {
        self.messages.push(message);
    }
}

#[test]
fn notifications_survive_single_byte_transport() {
    use winrun_guest_agent::protocol::{FrameReady, Shutdown};

    let messages = vec![
        Message::Shutdown(Shutdown { message_id: 1 }),
        Message::FrameReady(FrameReady {
            timestamp: 10,
            window_id: 4,
            slot_index: 2,
            frame_number: 77,
            is_key_frame: true,
        }),
        Message::heartbeat(),
    ];
    let mut stream = Vec::new();
    for m in &messages {
        stream.extend_from_slice(&wire::encode(m).unwrap());
    }

    let metrics = Arc::new(TransportMetrics::new());
    let mut reader = MessageReader::new(
        TrickleReader {
            data: stream,
            position: 0,
            step: 1,
        },
        metrics.clone(),
    );
    let mut collector = Collector::default();
    reader
        .pump(&mut collector, &AtomicBool::new(false))
        .unwrap();

    assert_eq!(collector.messages, messages);
    assert_eq!(metrics.snapshot().recv_successes, 3);
    assert_eq!(metrics.snapshot().recv_failures, 0);
}

// ============================================================================
// Retry / telemetry
// ============================================================================

struct CountingFailSink {
    attempts: u32,
}

impl MessageSink for CountingFailSink {
    fn send(&mut self, _frame: &[u8]) -> Result<(), SendError> {
        self.attempts += 1;
        Err(SendError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "unreachable host",
        )))
    }
}

#[test]
fn retry_exhaustion_matches_policy() {
    let metrics = TransportMetrics::new();
    let policy = RetryPolicy {
        initial_delay: Duration::from_millis(1),
        multiplier: 2,
        max_delay: Duration::from_millis(4),
        max_attempts: Some(3),
    };
    let mut sink = CountingFailSink { attempts: 0 };

    let delivered = send_with_retry(&mut sink, &Message::heartbeat(), &policy, &metrics);

    assert!(!delivered);
    assert_eq!(sink.attempts, 3);
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.send_attempts, 3);
    assert_eq!(snapshot.send_retries, 2);
    assert_eq!(snapshot.send_failures, 1);
}
