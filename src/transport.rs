// Copyright 2024 WinRun Authors
// SPDX-License-Identifier: Apache-2.0

//! Byte-stream transport adapters.
//!
//! The physical transport (pipe, socket, serial) is outside this crate;
//! anything implementing `Write` becomes an outbound [`MessageSink`] and
//! anything implementing `Read` feeds a [`MessageReader`]. The reader
//! buffers partial envelopes, decodes complete ones, and hands messages
//! to an [`InboundHandler`].

use std::collections::{HashSet, VecDeque};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::warn;
use thiserror::Error;

use crate::protocol::Message;
use crate::telemetry::TransportMetrics;
use crate::wire;

/// Outbound send failure.
#[derive(Debug, Error)]
pub enum SendError {
    /// The peer is gone; retrying cannot help.
    #[error("sink closed")]
    Closed,

    /// Possibly-transient I/O failure; retryable.
    #[error("I/O failure: {0}")]
    Io(#[from] io::Error),
}

/// Destination for framed outbound messages.
pub trait MessageSink: Send {
    /// Deliver one complete envelope.
    fn send(&mut self, frame: &[u8]) -> Result<(), SendError>;
}

/// Sink over any byte stream. Once the stream reports a terminal error
/// the sink stays closed; later sends fail fast.
pub struct StreamSink<W: Write + Send> {
    writer: W,
    closed: bool,
}

impl<W: Write + Send> StreamSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            closed: false,
        }
    }
}

fn is_terminal(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

impl<W: Write + Send> MessageSink for StreamSink<W> {
    fn send(&mut self, frame: &[u8]) -> Result<(), SendError> {
        if self.closed {
            return Err(SendError::Closed);
        }
        let result = self
            .writer
            .write_all(frame)
            .and_then(|()| self.writer.flush());
        match result {
            Ok(()) => Ok(()),
            Err(e) if is_terminal(e.kind()) => {
                self.closed = true;
                Err(SendError::Closed)
            }
            Err(e) => Err(SendError::Io(e)),
        }
    }
}

/// Consumer of decoded inbound messages. Command handling itself lives
/// upstream; implementations here only route.
pub trait InboundHandler: Send {
    fn handle(&mut self, message: Message);
}

/// Drops duplicate host message ids so redelivered commands are applied
/// once. Remembers a bounded window of recent ids.
pub struct ReplayFilter {
    seen: HashSet<u64>,
    order: VecDeque<u64>,
    capacity: usize,
}

impl ReplayFilter {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record an id. Returns `true` the first time it is seen.
    pub fn observe(&mut self, message_id: u64) -> bool {
        if self.seen.contains(&message_id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.order.push_back(message_id);
        self.seen.insert(message_id);
        true
    }
}

/// Reads bytes from the transport, reassembles envelopes, and dispatches
/// decoded messages.
pub struct MessageReader<R: Read> {
    reader: R,
    buffer: Vec<u8>,
    metrics: Arc<TransportMetrics>,
}

impl<R: Read> MessageReader<R> {
    /// Cap on buffered incomplete data; a peer that keeps us below a
    /// full envelope past this point is corrupt or hostile.
    const MAX_BUFFERED: usize = wire::MAX_PAYLOAD_SIZE + wire::ENVELOPE_HEADER_SIZE;

    pub fn new(reader: R, metrics: Arc<TransportMetrics>) -> Self {
        Self {
            reader,
            buffer: Vec::new(),
            metrics,
        }
    }

    /// Read and dispatch until EOF, cancellation, or a corrupt stream.
    ///
    /// Timeout-style read errors (`WouldBlock`/`TimedOut`) are treated as
    /// idle ticks so the cancel flag is observed promptly; give the
    /// underlying stream a read timeout for responsive shutdown.
    pub fn pump(
        &mut self,
        handler: &mut dyn InboundHandler,
        cancel: &AtomicBool,
    ) -> io::Result<()> {
        let mut chunk = [0u8; 8192];
        while !cancel.load(Ordering::Relaxed) {
            match self.reader.read(&mut chunk) {
                Ok(0) => return Ok(()),
                Ok(n) => {
                    self.buffer.extend_from_slice(&chunk[..n]);
                    self.drain(handler)?;
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn drain(&mut self, handler: &mut dyn InboundHandler) -> io::Result<()> {
        let mut cursor = 0;
        loop {
            match wire::try_read(&self.buffer[cursor..]) {
                Ok((0, None)) => break,
                Ok((consumed, Some(message))) => {
                    cursor += consumed;
                    self.metrics.record_recv_attempt();
                    self.metrics.record_recv_success();
                    handler.handle(message);
                }
                Ok((consumed, None)) => {
                    cursor += consumed;
                    self.metrics.record_recv_attempt();
                    self.metrics.record_recv_failure("unrecognized or malformed envelope");
                }
                Err(e) => {
                    self.metrics.record_recv_failure(&e.to_string());
                    warn!("inbound stream corrupt: {e}");
                    return Err(io::Error::new(io::ErrorKind::InvalidData, e.to_string()));
                }
            }
        }
        self.buffer.drain(..cursor);

        if self.buffer.len() > Self::MAX_BUFFERED {
            self.metrics
                .record_recv_failure("buffered incomplete envelope exceeds cap");
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "buffered incomplete envelope exceeds cap",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Ack, Message, Shutdown};

    #[derive(Default)]
    struct Collector {
        messages: Vec<Message>,
    }

    impl InboundHandler for Collector {
        fn handle(&mut self, message: Message) {
            self.messages.push(message);
        }
    }

    /// Reader that yields the stream a few bytes at a time, modeling a
    /// slow transport.
    struct TrickleReader {
        data: Vec<u8>,
        position: usize,
        step: usize,
    }

    impl Read for TrickleReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
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

    fn sample_stream() -> (Vec<u8>, Vec<Message>) {
        let messages = vec![
            Message::Shutdown(Shutdown { message_id: 1 }),
            Message::heartbeat(),
            Message::Ack(Ack {
                timestamp: 3,
                message_id: 1,
            }),
        ];
        let mut stream = Vec::new();
        for m in &messages {
            stream.extend_from_slice(&wire::encode(m).unwrap());
        }
        (stream, messages)
    }

    #[test]
    fn pump_reassembles_trickled_stream() {
        let (stream, expected) = sample_stream();
        for step in [1usize, 2, 5, 4096] {
            let metrics = Arc::new(TransportMetrics::new());
            let mut reader = MessageReader::new(
                TrickleReader {
                    data: stream.clone(),
                    position: 0,
                    step,
                },
                metrics.clone(),
            );
            let mut collector = Collector::default();
            let cancel = AtomicBool::new(false);
            reader.pump(&mut collector, &cancel).unwrap();
            assert_eq!(collector.messages, expected, "step {step}");
            assert_eq!(metrics.snapshot().recv_successes, expected.len() as u64);
        }
    }

    #[test]
    fn unknown_envelope_counts_failure_and_continues() {
        let (mut stream, expected) = sample_stream();
        // Prepend a valid envelope with an undefined type byte.
        let mut prefixed = vec![0x66u8];
        prefixed.extend_from_slice(&3u32.to_le_bytes());
        prefixed.extend_from_slice(&[1, 2, 3]);
        prefixed.append(&mut stream);

        let metrics = Arc::new(TransportMetrics::new());
        let mut reader = MessageReader::new(
            TrickleReader {
                data: prefixed,
                position: 0,
                step: 7,
            },
            metrics.clone(),
        );
        let mut collector = Collector::default();
        reader.pump(&mut collector, &AtomicBool::new(false)).unwrap();
        assert_eq!(collector.messages, expected);
        assert_eq!(metrics.snapshot().recv_failures, 1);
    }

    #[test]
    fn implausible_length_aborts_the_stream() {
        let mut data = vec![0x14u8]; // heartbeat type byte
        data.extend_from_slice(&u32::MAX.to_le_bytes());
        data.extend_from_slice(&[0u8; 32]);

        let metrics = Arc::new(TransportMetrics::new());
        let mut reader = MessageReader::new(
            TrickleReader {
                data,
                position: 0,
                step: 4096,
            },
            metrics.clone(),
        );
        let mut collector = Collector::default();
        let result = reader.pump(&mut collector, &AtomicBool::new(false));
        assert!(result.is_err());
        assert!(collector.messages.is_empty());
    }

    #[test]
    fn stream_sink_stays_closed_after_terminal_error() {
        struct BrokenPipe;
        impl Write for BrokenPipe {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut sink = StreamSink::new(BrokenPipe);
        assert!(matches!(sink.send(b"x"), Err(SendError::Closed)));
        // Still closed without touching the stream again.
        assert!(matches!(sink.send(b"y"), Err(SendError::Closed)));
    }

    #[test]
    fn stream_sink_delivers_to_writer() {
        let mut sink = StreamSink::new(Vec::new());
        sink.send(b"abc").unwrap();
        sink.send(b"def").unwrap();
        assert_eq!(sink.writer, b"abcdef");
    }

    #[test]
    fn replay_filter_drops_duplicates_within_window() {
        let mut filter = ReplayFilter::new(3);
        assert!(filter.observe(1));
        assert!(!filter.observe(1));
        assert!(filter.observe(2));
        assert!(filter.observe(3));
        // 1 evicted by capacity.
        assert!(filter.observe(4));
        assert!(filter.observe(1));
        assert!(!filter.observe(4));
    }
}
