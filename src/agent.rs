// Copyright 2024 WinRun Authors
// SPDX-License-Identifier: Apache-2.0

//! Guest agent wiring.
//!
//! Owns the three background threads of the transport: the capture loop
//! ([`FrameStreamer`]), the outbound sender (drains the notification
//! queue through the retry layer; a single consumer, so message order
//! survives retries), and the inbound reader (decodes host commands,
//! acknowledges them, and filters replays). Cancellation is cooperative
//! throughout; `stop()` returns after a bounded grace period.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::buffer_manager::BufferManager;
use crate::capture::CaptureSource;
use crate::compress::{FrameCompressor, ZstdCompressor};
use crate::error::AgentError;
use crate::frame_buffer::AllocationMode;
use crate::protocol::{
    unix_millis, Ack, Capability, Message, DEFAULT_SLOT_COUNT, PROTOCOL_VERSION,
};
use crate::shmem::SharedMemoryAllocator;
use crate::streamer::{FrameStreamer, StreamerConfig};
use crate::telemetry::{send_with_retry, RetryPolicy, TransportMetrics};
use crate::transport::{InboundHandler, MessageReader, MessageSink, ReplayFilter};
use crate::window::{WindowInfo, WindowRegistry};

/// Guest agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Capture loop tuning
    pub streamer: StreamerConfig,
    /// Policy applied to future buffer allocations
    pub allocation_mode: AllocationMode,
    /// Slots per window ring buffer
    pub slot_count: u32,
    /// Compress frame payloads before buffering
    pub compression: bool,
    /// zstd level when compression is enabled
    pub compression_level: i32,
    /// Interval between guest→host heartbeats
    pub heartbeat_interval: Duration,
    /// Interval between telemetry reports
    pub telemetry_interval: Duration,
    /// Backoff schedule for outbound sends
    pub retry: RetryPolicy,
    /// Depth of the outbound notification queue
    pub outbound_queue_depth: usize,
    /// Largest frame dimensions announced to the host
    pub max_width: u32,
    pub max_height: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            streamer: StreamerConfig::default(),
            allocation_mode: AllocationMode::Exact,
            slot_count: DEFAULT_SLOT_COUNT,
            compression: false,
            compression_level: 1,
            heartbeat_interval: Duration::from_secs(5),
            telemetry_interval: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            outbound_queue_depth: 256,
            max_width: 3840,
            max_height: 2160,
        }
    }
}

/// Interval gate for periodic work on a thread's own loop.
///
/// Replaces wall-clock timers with an explicit `due(now)` check, so tests
/// drive it with synthetic instants instead of sleeping.
pub struct Ticker {
    interval: Duration,
    last: Instant,
}

impl Ticker {
    pub fn new(interval: Duration) -> Self {
        Self::starting_at(interval, Instant::now())
    }

    pub fn starting_at(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            last: now,
        }
    }

    /// True once per elapsed interval; advances the gate when it fires.
    pub fn due(&mut self, now: Instant) -> bool {
        if now.duration_since(self.last) >= self.interval {
            self.last = now;
            true
        } else {
            false
        }
    }
}

/// Routes inbound host messages: acknowledges, deduplicates, and flags
/// shutdown. Actual command execution (input injection, clipboard,
/// process launch) is dispatched upstream of this crate.
struct ControlHandler {
    outbound: flume::Sender<Message>,
    replay: ReplayFilter,
    metrics: Arc<TransportMetrics>,
    shutdown: Arc<AtomicBool>,
}

impl InboundHandler for ControlHandler {
    fn handle(&mut self, message: Message) {
        let Some(message_id) = message.message_id() else {
            debug!("ignoring guest-bound {:?} echoed back", message.wire_type());
            return;
        };

        if !self.replay.observe(message_id) {
            debug!("dropping duplicate host message {message_id}");
            return;
        }

        let ack = Message::Ack(Ack {
            timestamp: unix_millis(),
            message_id,
        });
        if self.outbound.try_send(ack).is_err() {
            self.metrics
                .record_processing_error("outbound queue full, ack dropped");
        }

        match message {
            Message::Shutdown(_) => {
                info!("host requested shutdown");
                self.shutdown.store(true, Ordering::Relaxed);
            }
            other => {
                debug!("queued host command {:?} for dispatch", other.wire_type());
            }
        }
    }
}

/// The guest-side transport agent.
pub struct GuestAgent {
    config: AgentConfig,
    registry: Arc<WindowRegistry>,
    buffers: Arc<BufferManager>,
    metrics: Arc<TransportMetrics>,
    outbound: flume::Sender<Message>,
    streamer: FrameStreamer,
    sink: Option<Box<dyn MessageSink>>,
    inbound: Option<Box<dyn Read + Send>>,
    outbound_rx: Option<flume::Receiver<Message>>,
    cancel: Arc<AtomicBool>,
    shutdown_requested: Arc<AtomicBool>,
    sender_thread: Option<thread::JoinHandle<()>>,
    reader_thread: Option<thread::JoinHandle<()>>,
    running: bool,
}

impl GuestAgent {
    /// Assemble an agent around a capture source and an outbound sink.
    /// `allocator` is the mapped shared region, or `None` to use private
    /// buffers throughout.
    pub fn new(
        config: AgentConfig,
        capture: Box<dyn CaptureSource>,
        sink: Box<dyn MessageSink>,
        allocator: Option<Arc<SharedMemoryAllocator>>,
    ) -> Self {
        let registry = Arc::new(WindowRegistry::new());
        let buffers = Arc::new(BufferManager::new(
            allocator,
            config.allocation_mode,
            config.slot_count,
        ));
        let metrics = Arc::new(TransportMetrics::new());
        let (outbound, outbound_rx) = flume::bounded(config.outbound_queue_depth.max(1));

        let compressor: Option<Box<dyn FrameCompressor>> = if config.compression {
            Some(Box::new(ZstdCompressor::with_level(config.compression_level)))
        } else {
            None
        };
        let streamer = FrameStreamer::new(
            config.streamer.clone(),
            capture,
            compressor,
            buffers.clone(),
            registry.clone(),
            outbound.clone(),
        );

        Self {
            config,
            registry,
            buffers,
            metrics,
            outbound,
            streamer,
            sink: Some(sink),
            inbound: None,
            outbound_rx: Some(outbound_rx),
            cancel: Arc::new(AtomicBool::new(false)),
            shutdown_requested: Arc::new(AtomicBool::new(false)),
            sender_thread: None,
            reader_thread: None,
            running: false,
        }
    }

    /// Attach the inbound half of the transport. Give the stream a read
    /// timeout so the reader thread notices cancellation promptly.
    pub fn with_inbound<R: Read + Send + 'static>(mut self, reader: R) -> Self {
        self.inbound = Some(Box::new(reader));
        self
    }

    pub fn registry(&self) -> Arc<WindowRegistry> {
        self.registry.clone()
    }

    pub fn buffers(&self) -> Arc<BufferManager> {
        self.buffers.clone()
    }

    pub fn metrics(&self) -> Arc<TransportMetrics> {
        self.metrics.clone()
    }

    /// True once the host asked for shutdown via the control channel.
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Relaxed)
    }

    /// Record a window (from the platform enumeration layer) and tell
    /// the host about it when its state changed.
    pub fn update_window(&self, info: WindowInfo) {
        let message = info.metadata_message();
        if self.registry.upsert(info) && self.outbound.try_send(message).is_err() {
            self.metrics
                .record_processing_error("outbound queue full, window metadata dropped");
        }
    }

    /// Forget a window and release its frame buffer.
    pub fn remove_window(&self, window_id: u64) {
        self.registry.remove(window_id);
        self.buffers.remove_buffer(window_id);
    }

    /// Host-side read acknowledgement for a window's oldest slot.
    pub fn advance_read_index(&self, window_id: u64) {
        self.buffers.advance_read_index(window_id);
    }

    /// Start the background threads.
    pub fn start(&mut self) -> Result<(), AgentError> {
        if self.running {
            return Err(AgentError::AlreadyRunning);
        }
        let sink = self.sink.take().ok_or(AgentError::AlreadyRunning)?;
        let outbound_rx = self.outbound_rx.take().ok_or(AgentError::AlreadyRunning)?;

        // Announce capabilities before anything else leaves the queue.
        let capability = Message::Capability(Capability {
            timestamp: unix_millis(),
            protocol_version: PROTOCOL_VERSION,
            supports_shared_memory: self.buffers.uses_shared_memory(),
            supports_compression: self.config.compression,
            max_width: self.config.max_width,
            max_height: self.config.max_height,
        });
        self.outbound.try_send(capability).ok();

        self.sender_thread = Some(spawn_sender(
            sink,
            outbound_rx,
            self.config.clone(),
            self.metrics.clone(),
            self.cancel.clone(),
        ));

        if let Some(reader) = self.inbound.take() {
            self.reader_thread = Some(spawn_reader(
                reader,
                self.outbound.clone(),
                self.metrics.clone(),
                self.cancel.clone(),
                self.shutdown_requested.clone(),
            ));
        }

        self.streamer.start();
        self.running = true;
        info!("guest agent started");
        Ok(())
    }

    /// Stop all threads cooperatively, bounded by the configured grace
    /// period per thread.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        self.streamer.stop();
        self.cancel.store(true, Ordering::Relaxed);

        let grace = self.config.streamer.stop_grace;
        for handle in [self.sender_thread.take(), self.reader_thread.take()]
            .into_iter()
            .flatten()
        {
            let deadline = Instant::now() + grace;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                handle.join().ok();
            } else {
                warn!("agent thread did not stop within the grace period, detaching");
            }
        }
        info!("guest agent stopped");
    }
}

impl Drop for GuestAgent {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_sender(
    mut sink: Box<dyn MessageSink>,
    outbound_rx: flume::Receiver<Message>,
    config: AgentConfig,
    metrics: Arc<TransportMetrics>,
    cancel: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("outbound-sender".to_string())
        .spawn(move || {
            let mut heartbeat = Ticker::new(config.heartbeat_interval);
            let mut telemetry = Ticker::new(config.telemetry_interval);
            while !cancel.load(Ordering::Relaxed) {
                match outbound_rx.recv_timeout(Duration::from_millis(100)) {
                    Ok(message) => {
                        // Delivery failures are logged and counted inside
                        // the retry layer; the message is dropped here.
                        send_with_retry(sink.as_mut(), &message, &config.retry, &metrics);
                    }
                    Err(flume::RecvTimeoutError::Timeout) => {}
                    Err(flume::RecvTimeoutError::Disconnected) => break,
                }

                let now = Instant::now();
                if heartbeat.due(now) {
                    send_with_retry(sink.as_mut(), &Message::heartbeat(), &config.retry, &metrics);
                }
                if telemetry.due(now) {
                    let report = Message::TelemetryReport(crate::protocol::TelemetryReport {
                        timestamp: unix_millis(),
                        metrics: metrics.snapshot(),
                    });
                    send_with_retry(sink.as_mut(), &report, &config.retry, &metrics);
                }
            }
            debug!("outbound sender exiting");
        })
        .expect("spawn outbound-sender thread")
}

fn spawn_reader(
    reader: Box<dyn Read + Send>,
    outbound: flume::Sender<Message>,
    metrics: Arc<TransportMetrics>,
    cancel: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("inbound-reader".to_string())
        .spawn(move || {
            let mut handler = ControlHandler {
                outbound,
                replay: ReplayFilter::new(128),
                metrics: metrics.clone(),
                shutdown,
            };
            let mut message_reader = MessageReader::new(reader, metrics);
            if let Err(e) = message_reader.pump(&mut handler, &cancel) {
                warn!("inbound reader stopped: {e}");
            }
            debug!("inbound reader exiting");
        })
        .expect("spawn inbound-reader thread")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticker_fires_once_per_interval() {
        let start = Instant::now();
        let mut ticker = Ticker::starting_at(Duration::from_secs(5), start);

        assert!(!ticker.due(start));
        assert!(!ticker.due(start + Duration::from_secs(4)));
        assert!(ticker.due(start + Duration::from_secs(5)));
        // Gate advanced: not due again until another interval passes.
        assert!(!ticker.due(start + Duration::from_secs(6)));
        assert!(ticker.due(start + Duration::from_secs(10)));
    }

    #[test]
    fn control_handler_acks_and_dedups() {
        let (tx, rx) = flume::bounded(16);
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut handler = ControlHandler {
            outbound: tx,
            replay: ReplayFilter::new(16),
            metrics: Arc::new(TransportMetrics::new()),
            shutdown: shutdown.clone(),
        };

        let shutdown_msg = Message::Shutdown(crate::protocol::Shutdown { message_id: 77 });
        handler.handle(shutdown_msg.clone());
        assert!(shutdown.load(Ordering::Relaxed));

        // Redelivery of the same id is acknowledged once, applied once.
        handler.handle(shutdown_msg);
        let acks: Vec<Message> = rx.drain().collect();
        assert_eq!(acks.len(), 1);
        match &acks[0] {
            Message::Ack(ack) => assert_eq!(ack.message_id, 77),
            other => panic!("expected ack, got {other:?}"),
        }
    }

    #[test]
    fn control_handler_ignores_guest_bound_messages() {
        let (tx, rx) = flume::bounded(16);
        let mut handler = ControlHandler {
            outbound: tx,
            replay: ReplayFilter::new(16),
            metrics: Arc::new(TransportMetrics::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
        };
        handler.handle(Message::heartbeat());
        assert!(rx.is_empty());
    }
}
