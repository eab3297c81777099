// Copyright 2024 WinRun Authors
// SPDX-License-Identifier: Apache-2.0

//! WinRun Guest Agent frame transport
//!
//! This crate is the guest-side transport layer of the WinRun host↔guest
//! window virtualization agent. It captures per-window frames inside the
//! VM, stores them in shared-memory ring buffers with minimal copying,
//! and exchanges a small binary control protocol with the host over an
//! arbitrary byte stream.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       Capture Source                         │
//! │  (desktop duplication backend, external; synthetic here)     │
//! └──────────────────────────────────────────────────────────────┘
//!                │ desktop frames
//!                ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    Frame Streamer (loop)                     │
//! │  per-window extraction → compression → ring-buffer write     │
//! └──────────────────────────────────────────────────────────────┘
//!        │ slot bytes                       │ notifications
//!        ▼                                  ▼
//! ┌──────────────────────┐   ┌─────────────────────────────────┐
//! │ Shared Memory Region │   │ Outbound Sender (retry/metrics) │
//! │  free-list allocator │   │   wire codec → byte stream      │
//! │  per-window rings    │   └─────────────────────────────────┘
//! └──────────────────────┘                  │
//!        ▲ maps independently               ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Host                                │
//! │  reads slots via offsets from WindowBufferAllocated,         │
//! │  consumes FrameReady, sends input/clipboard/launch commands  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`protocol`]: message types, slot/region headers, wire type table
//! - [`wire`]: envelope framing over the byte stream
//! - [`shmem`]: shared region mapping and free-list allocation
//! - [`frame_buffer`]: per-window slot rings (exact and tranche sizing)
//! - [`buffer_manager`]: window → buffer ownership and reclamation
//! - [`compress`]: pluggable frame payload compression
//! - [`capture`]: capture source interface and synthetic backend
//! - [`window`]: tracked-window registry
//! - [`streamer`]: the capture-and-publish loop
//! - [`telemetry`]: send retries and transport counters
//! - [`transport`]: sinks, inbound reading, replay filtering
//! - [`agent`]: thread wiring and lifecycle

pub mod agent;
pub mod buffer_manager;
pub mod capture;
pub mod compress;
pub mod error;
pub mod frame_buffer;
pub mod protocol;
pub mod shmem;
pub mod streamer;
pub mod telemetry;
pub mod transport;
pub mod window;
pub mod wire;

pub use agent::{AgentConfig, GuestAgent};
pub use buffer_manager::BufferManager;
pub use capture::{CaptureSource, Frame, Rect, SyntheticCapture};
pub use error::AgentError;
pub use frame_buffer::{AllocationMode, WindowFrameBuffer};
pub use protocol::Message;
pub use shmem::{SharedMemoryAllocator, SharedMemoryConfig};
pub use streamer::{FrameStreamer, StreamerConfig};
pub use telemetry::{RetryPolicy, TransportMetrics};
pub use window::{WindowInfo, WindowRegistry};
