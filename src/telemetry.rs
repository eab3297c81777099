// Copyright 2024 WinRun Authors
// SPDX-License-Identifier: Apache-2.0

//! Send retries and transport counters.
//!
//! The transport between guest and host is unreliable; outbound
//! notifications go through [`send_with_retry`], which applies an
//! exponential-backoff [`RetryPolicy`] and records every attempt in
//! [`TransportMetrics`]. A closed sink is non-retryable and fails fast.
//! Exhausted messages are dropped, not re-queued; queueing them again
//! would grow without bound while the transport is down.

use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::protocol::{unix_millis, Message};
use crate::transport::{MessageSink, SendError};
use crate::wire;

/// Exponential backoff schedule for resends.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
    /// Total delivery attempts; `None` retries indefinitely.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            multiplier: 2,
            max_delay: Duration::from_secs(10),
            max_attempts: Some(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based), capped at
    /// `max_delay`. Pure: same input, same output.
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = (self.multiplier.max(1) as u128).saturating_pow(retry.min(32));
        let millis = self.initial_delay.as_millis().saturating_mul(factor);
        Duration::from_millis(millis.min(self.max_delay.as_millis()) as u64)
    }
}

/// Point-in-time copy of the transport counters. Serialized into
/// `TelemetryReport` messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub send_attempts: u64,
    pub send_successes: u64,
    pub send_failures: u64,
    pub send_retries: u64,
    pub recv_attempts: u64,
    pub recv_successes: u64,
    pub recv_failures: u64,
    pub processing_errors: u64,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_error_at: Option<u64>,
}

/// Thread-safe monotonic transport counters.
///
/// Counters never decrease except through [`TransportMetrics::reset`],
/// which zeroes everything as a unit; `snapshot` can never observe a
/// half-reset state.
#[derive(Default)]
pub struct TransportMetrics {
    inner: Mutex<MetricsSnapshot>,
}

impl TransportMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_send_attempt(&self) {
        self.inner.lock().unwrap().send_attempts += 1;
    }

    pub fn record_send_success(&self) {
        self.inner.lock().unwrap().send_successes += 1;
    }

    pub fn record_send_retry(&self) {
        self.inner.lock().unwrap().send_retries += 1;
    }

    pub fn record_send_failure(&self, context: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.send_failures += 1;
        inner.last_error = Some(context.to_string());
        inner.last_error_at = Some(unix_millis());
    }

    pub fn record_recv_attempt(&self) {
        self.inner.lock().unwrap().recv_attempts += 1;
    }

    pub fn record_recv_success(&self) {
        self.inner.lock().unwrap().recv_successes += 1;
    }

    pub fn record_recv_failure(&self, context: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.recv_failures += 1;
        inner.last_error = Some(context.to_string());
        inner.last_error_at = Some(unix_millis());
    }

    pub fn record_processing_error(&self, context: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.processing_errors += 1;
        inner.last_error = Some(context.to_string());
        inner.last_error_at = Some(unix_millis());
    }

    /// Immutable point-in-time copy.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().unwrap().clone()
    }

    /// Zero all counters atomically as a unit.
    pub fn reset(&self) {
        *self.inner.lock().unwrap() = MetricsSnapshot::default();
    }
}

/// Deliver `message` through `sink`, retrying per `policy`.
///
/// Returns `true` on delivery. A closed sink fails immediately; any
/// other failure sleeps the policy delay and retries until
/// `max_attempts` is exhausted, after which the message is dropped.
pub fn send_with_retry(
    sink: &mut dyn MessageSink,
    message: &Message,
    policy: &RetryPolicy,
    metrics: &TransportMetrics,
) -> bool {
    let frame = match wire::encode(message) {
        Ok(frame) => frame,
        Err(e) => {
            // Only reachable through a serialization bug; loud by design.
            metrics.record_processing_error(&e.to_string());
            error!("failed to encode {:?}: {e}", message.wire_type());
            return false;
        }
    };

    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        metrics.record_send_attempt();
        match sink.send(&frame) {
            Ok(()) => {
                metrics.record_send_success();
                if attempt > 1 {
                    info!(
                        "delivered {:?} after {} retr{}",
                        message.wire_type(),
                        attempt - 1,
                        if attempt == 2 { "y" } else { "ies" }
                    );
                }
                return true;
            }
            Err(SendError::Closed) => {
                metrics.record_send_failure("sink closed");
                warn!("dropping {:?}: sink closed", message.wire_type());
                return false;
            }
            Err(SendError::Io(e)) => {
                if policy.max_attempts.is_some_and(|max| attempt >= max) {
                    metrics.record_send_failure(&e.to_string());
                    warn!(
                        "dropping {:?} after {attempt} attempts: {e}",
                        message.wire_type()
                    );
                    return false;
                }
                metrics.record_send_retry();
                let delay = policy.delay(attempt - 1);
                debug!(
                    "send of {:?} failed ({e}), retrying in {delay:?}",
                    message.wire_type()
                );
                thread::sleep(delay);
            }
        }
    }
}
