// Copyright 2024 WinRun Authors
// SPDX-License-Identifier: Apache-2.0

//! Crate-level error type.

use std::io;

use thiserror::Error;

use crate::transport::SendError;
use crate::wire::WireError;

/// Errors surfaced by the guest agent's public API.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Wire protocol failure.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// Outbound transport failure.
    #[error("transport send failed: {0}")]
    Send(#[from] SendError),

    /// The agent was started twice.
    #[error("agent already running")]
    AlreadyRunning,
}
