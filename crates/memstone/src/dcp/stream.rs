// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Passive stream: the receiving end of one vbucket's replication session.
//!
//! State machine: `Pending` (STREAM_REQ queued) -> `Accepting` (peer said
//! SUCCESS) -> `Reading` (first snapshot marker seen) -> `Dead`. Inbound
//! data is validated against the current snapshot window at receive time and
//! buffered; a background processor drains the buffer into the item store in
//! arrival order, which is by construction strict `by_seqno` order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use parking_lot::Mutex;

use crate::clock::EngineClock;
use crate::error::{EngineError, Result};
use crate::store::item::{CasToken, DocState, StoreOp, ENGINE_VBUCKET_UUID};
use crate::store::ItemStore;

use super::message::{SnapshotType, StreamMessage};

/// Stream cursor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    /// STREAM_REQ not yet accepted by the peer.
    Pending = 0,
    /// Peer accepted; waiting for the first snapshot marker.
    Accepting = 1,
    /// Inside a snapshot window, data flowing.
    Reading = 2,
    /// Closed; buffered messages are dropped, not applied.
    Dead = 3,
}

impl StreamState {
    fn from_bits(bits: u8) -> Self {
        match bits {
            1 => StreamState::Accepting,
            2 => StreamState::Reading,
            3 => StreamState::Dead,
            _ => StreamState::Pending,
        }
    }
}

/// Outcome of one buffered-message batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    /// Buffer is empty.
    Drained,
    /// Batch limit reached with messages still waiting.
    MoreAvailable,
    /// A transient apply failure; the message stays queued.
    CannotProcess,
    /// STREAM_END was processed; the stream is dead.
    Ended,
}

/// What one `process_buffered` call did.
#[derive(Debug, Clone, Copy)]
pub struct BatchResult {
    pub applied: usize,
    pub drained_bytes: usize,
    pub status: BatchStatus,
}

struct StreamBuffer {
    messages: VecDeque<StreamMessage>,
    bytes: usize,
}

/// Per-vbucket passive stream.
pub struct PassiveStream {
    vbid: u16,
    local_opaque: u32,
    remote_opaque: u32,
    flags: u32,
    state: AtomicU8,
    /// Last received (validated) seqno.
    last_seqno: AtomicU64,
    /// Receive-side snapshot window.
    snap_start: AtomicU64,
    snap_end: AtomicU64,
    /// 0 = none yet, 1 = memory, 2 = disk.
    snap_kind: AtomicU8,
    /// Where the next STREAM_REQ starts.
    start_seqno: AtomicU64,
    /// Failover entries, newest first; head is the entry in use.
    failover: Mutex<VecDeque<(u64, u64)>>,
    buffer: Mutex<StreamBuffer>,
}

impl PassiveStream {
    pub fn new(vbid: u16, local_opaque: u32, remote_opaque: u32, flags: u32) -> Self {
        Self {
            vbid,
            local_opaque,
            remote_opaque,
            flags,
            state: AtomicU8::new(StreamState::Pending as u8),
            last_seqno: AtomicU64::new(0),
            snap_start: AtomicU64::new(0),
            snap_end: AtomicU64::new(0),
            snap_kind: AtomicU8::new(0),
            start_seqno: AtomicU64::new(0),
            failover: Mutex::new(VecDeque::from([(ENGINE_VBUCKET_UUID, 0u64)])),
            buffer: Mutex::new(StreamBuffer {
                messages: VecDeque::new(),
                bytes: 0,
            }),
        }
    }

    #[must_use]
    pub fn vbid(&self) -> u16 {
        self.vbid
    }

    #[must_use]
    pub fn local_opaque(&self) -> u32 {
        self.local_opaque
    }

    #[must_use]
    pub fn remote_opaque(&self) -> u32 {
        self.remote_opaque
    }

    #[must_use]
    pub fn state(&self) -> StreamState {
        StreamState::from_bits(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: StreamState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[must_use]
    pub fn last_seqno(&self) -> u64 {
        self.last_seqno.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn snapshot_window(&self) -> (u64, u64) {
        (
            self.snap_start.load(Ordering::Acquire),
            self.snap_end.load(Ordering::Acquire),
        )
    }

    #[must_use]
    pub fn snapshot_type(&self) -> Option<SnapshotType> {
        match self.snap_kind.load(Ordering::Acquire) {
            1 => Some(SnapshotType::Memory),
            2 => Some(SnapshotType::Disk),
            _ => None,
        }
    }

    /// Peer accepted the STREAM_REQ.
    pub fn accepted(&self) {
        if self.state() == StreamState::Pending {
            self.set_state(StreamState::Accepting);
        }
    }

    /// Mark dead. Idempotent.
    pub fn mark_dead(&self) {
        self.set_state(StreamState::Dead);
    }

    #[must_use]
    pub fn buffered_bytes(&self) -> usize {
        self.buffer.lock().bytes
    }

    #[must_use]
    pub fn buffer_is_empty(&self) -> bool {
        self.buffer.lock().messages.is_empty()
    }

    /// Drop everything buffered; returns the byte count so the caller can
    /// credit flow control (dropped bytes are released bytes).
    pub fn take_buffered_bytes(&self) -> usize {
        let mut buffer = self.buffer.lock();
        buffer.messages.clear();
        std::mem::take(&mut buffer.bytes)
    }

    /// The entry the next STREAM_REQ should use.
    #[must_use]
    pub fn current_failover_entry(&self) -> Option<(u64, u64)> {
        self.failover.lock().front().copied()
    }

    /// Discard the entry in use and move to the next older one.
    pub fn advance_failover(&self) -> Option<(u64, u64)> {
        let mut failover = self.failover.lock();
        failover.pop_front();
        failover.front().copied()
    }

    /// Reset stream position after a completed rollback.
    pub fn reset_for_rollback(&self, seqno: u64) {
        self.set_state(StreamState::Pending);
        self.last_seqno.store(seqno, Ordering::Release);
        self.start_seqno.store(seqno, Ordering::Release);
        self.snap_start.store(seqno, Ordering::Release);
        self.snap_end.store(seqno, Ordering::Release);
        self.snap_kind.store(0, Ordering::Release);
    }

    /// Parameters for the next STREAM_REQ emission.
    #[must_use]
    pub fn stream_req_params(&self) -> (u16, u32, u32, u64, u64, u64, u64, u64) {
        let start = self.start_seqno.load(Ordering::Acquire);
        let uuid = self
            .current_failover_entry()
            .map(|(uuid, _)| uuid)
            .unwrap_or(0);
        (
            self.vbid,
            self.flags,
            self.local_opaque,
            start,
            u64::MAX,
            uuid,
            start,
            start,
        )
    }

    /// Validate and buffer one inbound message.
    ///
    /// Ordering violations (data before the first marker, a seqno outside
    /// the snapshot window, a non-increasing seqno) are fatal: the stream
    /// goes dead and `Disconnect` is returned for the connection layer.
    /// Returns the buffered byte count on success.
    pub fn accept(&self, msg: StreamMessage) -> Result<usize> {
        match self.state() {
            StreamState::Dead => return Err(EngineError::NoSuchKey),
            StreamState::Pending => {
                log::warn!(
                    "[PassiveStream] vb {} data before stream accepted",
                    self.vbid
                );
                self.mark_dead();
                return Err(EngineError::Disconnect);
            }
            StreamState::Accepting | StreamState::Reading => {}
        }

        match &msg {
            StreamMessage::SnapshotMarker(marker) => {
                if marker.end < marker.start {
                    log::warn!(
                        "[PassiveStream] vb {} bad snapshot window [{}, {}]",
                        self.vbid,
                        marker.start,
                        marker.end
                    );
                    self.mark_dead();
                    return Err(EngineError::Disconnect);
                }
                self.snap_start.store(marker.start, Ordering::Release);
                self.snap_end.store(marker.end, Ordering::Release);
                self.snap_kind.store(
                    match marker.kind {
                        SnapshotType::Memory => 1,
                        SnapshotType::Disk => 2,
                    },
                    Ordering::Release,
                );
                if self.state() == StreamState::Accepting {
                    self.set_state(StreamState::Reading);
                }
            }
            StreamMessage::StreamEnd(_) => {}
            data => {
                if self.state() != StreamState::Reading {
                    log::warn!(
                        "[PassiveStream] vb {} data before first snapshot marker",
                        self.vbid
                    );
                    self.mark_dead();
                    return Err(EngineError::Disconnect);
                }
                let seqno = data.by_seqno().unwrap_or(0);
                let last = self.last_seqno();
                let (start, end) = self.snapshot_window();
                if seqno <= last || seqno < start || seqno > end {
                    log::warn!(
                        "[PassiveStream] vb {} seqno {} violates window [{}, {}] after {}",
                        self.vbid,
                        seqno,
                        start,
                        end,
                        last
                    );
                    self.mark_dead();
                    return Err(EngineError::Disconnect);
                }
                self.last_seqno.store(seqno, Ordering::Release);
            }
        }

        let size = msg.size_bytes();
        let mut buffer = self.buffer.lock();
        buffer.messages.push_back(msg);
        buffer.bytes += size;
        Ok(size)
    }

    /// Apply up to `batch_size` buffered messages to the item store.
    ///
    /// A dead stream drains without applying (cancellation). Transient
    /// apply failures leave the message queued and report `CannotProcess`;
    /// anything else poison-drops the single message with a log line.
    pub fn process_buffered(
        &self,
        store: &ItemStore,
        clock: &EngineClock,
        batch_size: usize,
    ) -> BatchResult {
        let mut applied = 0usize;
        let mut drained = 0usize;
        let mut status = None;

        for _ in 0..batch_size {
            let msg = {
                let mut buffer = self.buffer.lock();
                match buffer.messages.pop_front() {
                    Some(m) => m,
                    None => {
                        status = Some(BatchStatus::Drained);
                        break;
                    }
                }
            };
            let size = msg.size_bytes();

            if self.state() == StreamState::Dead {
                // Cancelled: drop without applying, still release the bytes.
                drained += size;
                continue;
            }

            match self.apply_message(store, clock, &msg) {
                Ok(ended) => {
                    drained += size;
                    applied += 1;
                    if ended {
                        self.mark_dead();
                        drained += self.drain_remaining();
                        status = Some(BatchStatus::Ended);
                        break;
                    }
                }
                // A locked document clears within the lock window, so it
                // counts as transient here.
                Err(e) if e.is_transient() || e == EngineError::Locked => {
                    // Put it back; the processor re-queues with backoff.
                    let mut buffer = self.buffer.lock();
                    buffer.messages.push_front(msg);
                    status = Some(BatchStatus::CannotProcess);
                    break;
                }
                Err(e) => {
                    log::warn!(
                        "[PassiveStream] vb {} dropping unappliable message: {}",
                        self.vbid,
                        e
                    );
                    drained += size;
                    applied += 1;
                }
            }
        }

        // Release the bytes we consumed from the buffer accounting.
        let status = {
            let mut buffer = self.buffer.lock();
            buffer.bytes = buffer.bytes.saturating_sub(drained);
            status.unwrap_or(if buffer.messages.is_empty() {
                BatchStatus::Drained
            } else {
                BatchStatus::MoreAvailable
            })
        };

        BatchResult {
            applied,
            drained_bytes: drained,
            status,
        }
    }

    fn drain_remaining(&self) -> usize {
        let mut buffer = self.buffer.lock();
        let bytes: usize = buffer.messages.iter().map(StreamMessage::size_bytes).sum();
        buffer.messages.clear();
        bytes
    }

    /// Returns `Ok(true)` when the message ended the stream.
    fn apply_message(
        &self,
        store: &ItemStore,
        clock: &EngineClock,
        msg: &StreamMessage,
    ) -> Result<bool> {
        match msg {
            StreamMessage::SnapshotMarker(marker) => {
                log::debug!(
                    "[PassiveStream] vb {} entering snapshot [{}, {}]",
                    self.vbid,
                    marker.start,
                    marker.end
                );
                Ok(false)
            }
            StreamMessage::Mutation(m) => {
                let mut item = store.alloc_item(
                    &m.key,
                    m.value.len(),
                    m.flags,
                    m.datatype,
                    clock.realtime(m.expiration),
                    self.vbid,
                )?;
                item.value_mut().copy_from_slice(&m.value);
                store.store(item, CasToken::Any, StoreOp::Set, DocState::Alive)?;
                Ok(false)
            }
            StreamMessage::Deletion(d) | StreamMessage::Expiration(d) => {
                match store.delete(&d.key, CasToken::Any) {
                    Ok(_) | Err(EngineError::NoSuchKey) => Ok(false),
                    Err(e) => Err(e),
                }
            }
            StreamMessage::SystemEvent(e) => {
                log::debug!(
                    "[PassiveStream] vb {} system event {} at seqno {}",
                    self.vbid,
                    e.event,
                    e.by_seqno
                );
                Ok(false)
            }
            StreamMessage::StreamEnd(reason) => {
                log::info!(
                    "[PassiveStream] vb {} stream ended ({})",
                    self.vbid,
                    reason.name()
                );
                Ok(true)
            }
        }
    }
}

impl std::fmt::Debug for PassiveStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassiveStream")
            .field("vbid", &self.vbid)
            .field("state", &self.state())
            .field("last_seqno", &self.last_seqno())
            .field("buffered_bytes", &self.buffered_bytes())
            .finish()
    }
}
