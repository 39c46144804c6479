// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection-level flow control for the replication consumer.
//!
//! Every buffered inbound message is counted against the negotiated
//! connection buffer. When the processor releases at least a quarter of the
//! buffer, a BUFFER_ACK for exactly the released byte count goes back to the
//! peer, so the sum of acked bytes always equals the sum of released bytes.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Fraction of the buffer that must drain before an ack is due.
const ACK_RATIO: u32 = 4;

#[derive(Debug)]
pub struct FlowControl {
    enabled: bool,
    buffer_size: u32,
    /// Bytes released since the last ack.
    freed_bytes: AtomicU32,
    /// Lifetime counters for stats.
    total_received: AtomicU64,
    total_acked: AtomicU64,
}

impl FlowControl {
    pub fn new(buffer_size: u32) -> Self {
        Self {
            enabled: buffer_size > 0,
            buffer_size,
            freed_bytes: AtomicU32::new(0),
            total_received: AtomicU64::new(0),
            total_acked: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    pub fn bytes_received(&self, bytes: u32) {
        self.total_received
            .fetch_add(u64::from(bytes), Ordering::Relaxed);
    }

    /// Credit bytes the processor (or a stream teardown) released.
    pub fn bytes_freed(&self, bytes: u32) {
        if bytes > 0 {
            self.freed_bytes.fetch_add(bytes, Ordering::AcqRel);
        }
    }

    #[must_use]
    pub fn freed_bytes(&self) -> u32 {
        self.freed_bytes.load(Ordering::Acquire)
    }

    /// Take the pending ack if the threshold has been reached.
    pub fn take_ack(&self) -> Option<u32> {
        if !self.enabled {
            return None;
        }
        let freed = self.freed_bytes.load(Ordering::Acquire);
        if freed < self.buffer_size / ACK_RATIO || freed == 0 {
            return None;
        }
        let bytes = self.freed_bytes.swap(0, Ordering::AcqRel);
        self.total_acked
            .fetch_add(u64::from(bytes), Ordering::Relaxed);
        Some(bytes)
    }

    #[must_use]
    pub fn total_received(&self) -> u64 {
        self.total_received.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn total_acked(&self) -> u64 {
        self.total_acked.load(Ordering::Relaxed)
    }
}
