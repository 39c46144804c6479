// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Replication consumer: owns the passive streams of one peer connection.
//!
//! Inbound messages are validated and buffered per stream; a processor job
//! on the background pool drains ready streams into the item store in
//! batches, yielding between batches so one busy vbucket cannot hog a
//! worker. Ready vbuckets rotate through a FIFO deque and a stream with
//! more work re-queues at the back, so scheduling is fair across vbuckets.
//!
//! Outbound traffic (control negotiation, STREAM_REQ, BUFFER_ACK, NOOP) is
//! emitted one message per `step()` call through the connection layer's
//! [`MessageProducer`]; `step()` returns `WouldBlock` when it has nothing to
//! say.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::engine::vbucket::VBucketState;
use crate::engine::{Engine, KvEngine};
use crate::error::{EngineError, Result};

use super::flow_control::FlowControl;
use super::message::{
    DcpResponse, DeletionMessage, MessageProducer, MutationMessage, Opaque, ResponseStatus,
    SnapshotMarker, SnapshotType, StreamEndReason, StreamMessage, SystemEventMessage,
};
use super::stream::{BatchStatus, PassiveStream, StreamState};

/// Re-schedule delay after a `CannotProcess` batch.
const PROCESSOR_BACKOFF: Duration = Duration::from_millis(10);

/// Processor verdict for one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    AllProcessed,
    MoreToProcess,
    CannotProcess,
}

/// Message queued for the next `step()` emissions.
enum Outbound {
    StreamReq(u16),
    AddStreamRsp {
        remote: Opaque,
        local: Opaque,
        success: bool,
    },
    CloseStream {
        local: Opaque,
        vbid: u16,
    },
}

/// Control negotiations still owed to the peer, popped in a fixed priority
/// order before any STREAM_REQ goes out.
struct PendingControls {
    conn_buffer: bool,
    enable_noop: bool,
    noop_interval: bool,
    priority: bool,
    ext_metadata: bool,
    value_compression: bool,
    cursor_dropping: bool,
    stream_end_on_close: bool,
}

impl PendingControls {
    fn new() -> Self {
        Self {
            conn_buffer: true,
            enable_noop: true,
            noop_interval: true,
            priority: true,
            ext_metadata: true,
            value_compression: true,
            cursor_dropping: true,
            stream_end_on_close: true,
        }
    }
}

/// The consumer half of one replication connection.
pub struct DcpConsumer {
    name: String,
    engine: Arc<Engine>,
    /// vbid -> stream; lock-free reads, locked structural changes.
    streams: DashMap<u16, Arc<PassiveStream>>,
    /// Source of locally assigned stream opaques.
    opaque_counter: AtomicU32,
    /// local opaque -> (remote opaque, vbid).
    opaque_map: Mutex<HashMap<Opaque, (Opaque, u16)>>,
    /// VBuckets with buffered work, FIFO for fairness.
    ready: Mutex<VecDeque<u16>>,
    processor_notified: AtomicBool,
    outbox: Mutex<VecDeque<Outbound>>,
    pending: Mutex<PendingControls>,
    flow: FlowControl,
    /// Rel-time of the last inbound message (liveness).
    last_message_time: AtomicU32,
    last_noop_tx: AtomicU32,
    backoffs: AtomicU64,
    dead: AtomicBool,
    batch_size: usize,
    yield_limit: usize,
    idle_timeout: u32,
    noop_tx_interval: u32,
}

impl DcpConsumer {
    /// Create a consumer bound to `engine` and register it for
    /// vbucket-state notifications.
    pub fn new(engine: Arc<Engine>, name: impl Into<String>) -> Arc<Self> {
        let config = engine.config();
        let now = engine.clock().now();
        let consumer = Arc::new(Self {
            name: name.into(),
            flow: FlowControl::new(config.dcp_conn_buffer_size),
            batch_size: config.dcp_batch_size,
            yield_limit: config.dcp_yield_limit,
            idle_timeout: config.dcp_idle_timeout,
            noop_tx_interval: config.dcp_noop_tx_interval,
            streams: DashMap::new(),
            opaque_counter: AtomicU32::new(0),
            opaque_map: Mutex::new(HashMap::new()),
            ready: Mutex::new(VecDeque::new()),
            processor_notified: AtomicBool::new(false),
            outbox: Mutex::new(VecDeque::new()),
            pending: Mutex::new(PendingControls::new()),
            last_message_time: AtomicU32::new(now),
            last_noop_tx: AtomicU32::new(now),
            backoffs: AtomicU64::new(0),
            dead: AtomicBool::new(false),
            engine,
        });
        consumer
            .engine
            .register_consumer(Arc::downgrade(&consumer));
        consumer
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn backoffs(&self) -> u64 {
        self.backoffs.load(Ordering::Relaxed)
    }

    /// Seconds since the peer last said anything.
    #[must_use]
    pub fn seconds_since_last_message(&self) -> u32 {
        self.engine
            .clock()
            .now()
            .saturating_sub(self.last_message_time.load(Ordering::Acquire))
    }

    fn touch_last_message(&self) {
        self.last_message_time
            .store(self.engine.clock().now(), Ordering::Release);
    }

    fn next_opaque(&self) -> Opaque {
        self.opaque_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[must_use]
    pub fn is_stream_present(&self, vbid: u16) -> bool {
        self.streams.contains_key(&vbid)
    }

    fn find_stream(&self, vbid: u16) -> Option<Arc<PassiveStream>> {
        self.streams.get(&vbid).map(|entry| Arc::clone(entry.value()))
    }

    /// Validate that `opaque` names an open session for `vbid` and return
    /// its stream.
    fn stream_for(&self, opaque: Opaque, vbid: u16) -> Result<Arc<PassiveStream>> {
        {
            let map = self.opaque_map.lock();
            match map.get(&opaque) {
                Some((_, v)) if *v == vbid => {}
                _ => return Err(EngineError::NoSuchKey),
            }
        }
        self.find_stream(vbid).ok_or(EngineError::NoSuchKey)
    }

    // ------------------------------------------------------------------
    // Session establishment
    // ------------------------------------------------------------------

    /// Host-side ADD_STREAM: create a passive stream and queue the
    /// STREAM_REQ.
    pub fn add_stream(&self, remote_opaque: Opaque, vbid: u16, flags: u32) -> Result<()> {
        if self.is_dead() {
            return Err(EngineError::Disconnect);
        }
        if self.streams.contains_key(&vbid) {
            log::warn!(
                "[DcpConsumer::{}] add_stream vb {}: stream already present",
                self.name,
                vbid
            );
            return Err(EngineError::KeyExists);
        }
        let local = self.next_opaque();
        let stream = Arc::new(PassiveStream::new(vbid, local, remote_opaque, flags));
        self.opaque_map.lock().insert(local, (remote_opaque, vbid));
        self.streams.insert(vbid, stream);
        self.outbox.lock().push_back(Outbound::StreamReq(vbid));
        log::info!(
            "[DcpConsumer::{}] add_stream vb {} (local opaque {})",
            self.name,
            vbid,
            local
        );
        Ok(())
    }

    /// Host-side CLOSE_STREAM.
    pub fn close_stream(&self, vbid: u16) -> Result<()> {
        let stream = self
            .close_stream_inner(vbid, "client close")
            .ok_or(EngineError::NoSuchKey)?;
        self.outbox.lock().push_back(Outbound::CloseStream {
            local: stream.local_opaque(),
            vbid,
        });
        Ok(())
    }

    /// Tear a stream down locally: mark dead, release its buffered bytes to
    /// flow control, and forget its opaque.
    fn close_stream_inner(&self, vbid: u16, reason: &str) -> Option<Arc<PassiveStream>> {
        let (_, stream) = self.streams.remove(&vbid)?;
        stream.mark_dead();
        let freed = stream.take_buffered_bytes();
        self.flow.bytes_freed(freed as u32);
        self.opaque_map.lock().remove(&stream.local_opaque());
        log::info!(
            "[DcpConsumer::{}] closed stream vb {} ({})",
            self.name,
            vbid,
            reason
        );
        Some(stream)
    }

    /// Close every stream (disconnect or teardown).
    pub fn close_all_streams(&self) {
        let vbids: Vec<u16> = self.streams.iter().map(|e| *e.key()).collect();
        for vbid in vbids {
            self.close_stream_inner(vbid, "connection closed");
        }
    }

    /// Terminal for this connection.
    pub fn set_disconnect(&self) {
        if !self.dead.swap(true, Ordering::AcqRel) {
            self.close_all_streams();
        }
    }

    /// Match a peer response to a consumer-initiated request. Returns false
    /// when the connection should be dropped.
    pub fn handle_response(self: &Arc<Self>, resp: &DcpResponse) -> bool {
        self.touch_last_message();
        let entry = {
            let map = self.opaque_map.lock();
            map.get(&resp.opaque).copied()
        };
        let Some((remote, vbid)) = entry else {
            log::warn!(
                "[DcpConsumer::{}] response for unknown opaque {}",
                self.name,
                resp.opaque
            );
            return true;
        };

        match resp.status {
            ResponseStatus::Success => {
                if let Some(stream) = self.find_stream(vbid) {
                    stream.accepted();
                    self.outbox.lock().push_back(Outbound::AddStreamRsp {
                        remote,
                        local: resp.opaque,
                        success: true,
                    });
                }
                true
            }
            ResponseStatus::Rollback(seqno) => {
                self.schedule_rollback(vbid, seqno);
                true
            }
            ResponseStatus::KeyEnoent => {
                // The peer does not know this failover entry; retry with the
                // next older one, close when exhausted.
                if let Some(stream) = self.find_stream(vbid) {
                    if stream.advance_failover().is_some() {
                        self.outbox.lock().push_back(Outbound::StreamReq(vbid));
                    } else {
                        self.close_stream_inner(vbid, "failover entries exhausted");
                        self.outbox.lock().push_back(Outbound::AddStreamRsp {
                            remote,
                            local: resp.opaque,
                            success: false,
                        });
                    }
                }
                true
            }
            ResponseStatus::Error(status) => {
                log::warn!(
                    "[DcpConsumer::{}] stream request vb {} failed with status {}",
                    self.name,
                    vbid,
                    status
                );
                self.close_stream_inner(vbid, "peer error");
                self.outbox.lock().push_back(Outbound::AddStreamRsp {
                    remote,
                    local: resp.opaque,
                    success: false,
                });
                true
            }
        }
    }

    /// Peer-demanded rollback runs on the background pool; on success the
    /// stream re-requests from the rolled-back seqno.
    fn schedule_rollback(self: &Arc<Self>, vbid: u16, seqno: u64) {
        let weak = Arc::downgrade(self);
        self.engine.tasks().spawn(move || {
            let Some(consumer) = weak.upgrade() else {
                return;
            };
            if consumer.is_dead() {
                return;
            }
            log::info!(
                "[RollbackTask] vb {} rolling back to seqno {}",
                vbid,
                seqno
            );
            match consumer.engine.rollback_vbucket(vbid, seqno) {
                Ok(()) => {
                    if let Some(stream) = consumer.find_stream(vbid) {
                        let freed = stream.take_buffered_bytes();
                        consumer.flow.bytes_freed(freed as u32);
                        stream.reset_for_rollback(seqno);
                        consumer
                            .outbox
                            .lock()
                            .push_back(Outbound::StreamReq(vbid));
                    }
                }
                Err(e) => {
                    log::warn!("[RollbackTask] vb {} rollback failed: {}", vbid, e);
                    if let Some(stream) = consumer.find_stream(vbid) {
                        if stream.advance_failover().is_some() {
                            stream.reset_for_rollback(0);
                            consumer
                                .outbox
                                .lock()
                                .push_back(Outbound::StreamReq(vbid));
                        } else {
                            consumer.close_stream_inner(vbid, "rollback exhausted");
                        }
                    }
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // Inbound stream traffic
    // ------------------------------------------------------------------

    fn accept_on_stream(
        self: &Arc<Self>,
        opaque: Opaque,
        vbid: u16,
        msg: StreamMessage,
    ) -> Result<()> {
        self.touch_last_message();
        let stream = self.stream_for(opaque, vbid)?;
        match stream.accept(msg) {
            Ok(bytes) => {
                self.flow.bytes_received(bytes as u32);
                self.notify_vbucket_ready(vbid);
                Ok(())
            }
            Err(EngineError::Disconnect) => {
                self.close_stream_inner(vbid, "protocol violation");
                Err(EngineError::Disconnect)
            }
            Err(e) => Err(e),
        }
    }

    pub fn snapshot_marker(
        self: &Arc<Self>,
        opaque: Opaque,
        vbid: u16,
        start: u64,
        end: u64,
        flags: u32,
    ) -> Result<()> {
        self.accept_on_stream(
            opaque,
            vbid,
            StreamMessage::SnapshotMarker(SnapshotMarker {
                start,
                end,
                kind: SnapshotType::from_marker_flags(flags),
            }),
        )
    }

    pub fn mutation(self: &Arc<Self>, opaque: Opaque, vbid: u16, msg: MutationMessage) -> Result<()> {
        self.accept_on_stream(opaque, vbid, StreamMessage::Mutation(msg))
    }

    pub fn deletion(self: &Arc<Self>, opaque: Opaque, vbid: u16, msg: DeletionMessage) -> Result<()> {
        self.accept_on_stream(opaque, vbid, StreamMessage::Deletion(msg))
    }

    pub fn expiration(
        self: &Arc<Self>,
        opaque: Opaque,
        vbid: u16,
        msg: DeletionMessage,
    ) -> Result<()> {
        self.accept_on_stream(opaque, vbid, StreamMessage::Expiration(msg))
    }

    pub fn system_event(
        self: &Arc<Self>,
        opaque: Opaque,
        vbid: u16,
        msg: SystemEventMessage,
    ) -> Result<()> {
        self.accept_on_stream(opaque, vbid, StreamMessage::SystemEvent(msg))
    }

    pub fn stream_end(
        self: &Arc<Self>,
        opaque: Opaque,
        vbid: u16,
        reason: StreamEndReason,
    ) -> Result<()> {
        self.accept_on_stream(opaque, vbid, StreamMessage::StreamEnd(reason))
    }

    /// Peer NOOP: liveness only.
    pub fn noop(&self, _opaque: Opaque) -> Result<()> {
        self.touch_last_message();
        Ok(())
    }

    /// Peer-driven vbucket state change (takeover flow).
    pub fn set_vbucket_state(&self, _opaque: Opaque, vbid: u16, state: VBucketState) -> Result<()> {
        self.touch_last_message();
        self.engine.set_vbucket_state(vbid, state)
    }

    // ------------------------------------------------------------------
    // Processor
    // ------------------------------------------------------------------

    fn notify_vbucket_ready(self: &Arc<Self>, vbid: u16) {
        {
            let mut ready = self.ready.lock();
            if !ready.contains(&vbid) {
                ready.push_back(vbid);
            }
        }
        self.schedule_processor();
    }

    fn requeue_vbucket(&self, vbid: u16) {
        let mut ready = self.ready.lock();
        if !ready.contains(&vbid) {
            // Back of the queue: other vbuckets go first.
            ready.push_back(vbid);
        }
    }

    /// Kick the processor task unless one is already notified.
    fn schedule_processor(self: &Arc<Self>) {
        if self.is_dead() {
            return;
        }
        if self.processor_notified.swap(true, Ordering::AcqRel) {
            return;
        }
        let weak = Arc::downgrade(self);
        self.engine.tasks().spawn(move || Self::run_processor(weak));
    }

    fn run_processor(weak: Weak<DcpConsumer>) {
        let Some(consumer) = weak.upgrade() else {
            return;
        };
        consumer.processor_notified.store(false, Ordering::Release);
        match consumer.process_buffered_items() {
            ProcessStatus::MoreToProcess => consumer.schedule_processor(),
            ProcessStatus::CannotProcess => {
                let weak = Arc::downgrade(&consumer);
                consumer
                    .engine
                    .tasks()
                    .spawn_after(PROCESSOR_BACKOFF, move || {
                        if let Some(consumer) = weak.upgrade() {
                            consumer.schedule_processor();
                        }
                    });
            }
            ProcessStatus::AllProcessed => {
                if !consumer.ready.lock().is_empty() {
                    consumer.schedule_processor();
                }
            }
        }
    }

    /// One processor invocation: drain the next ready vbucket in batches.
    ///
    /// Yields with `MoreToProcess` after `yield_limit` batches (the stream
    /// re-queues behind any other ready vbucket) and with `CannotProcess`
    /// plus a backoff when the store pushes back.
    pub fn process_buffered_items(&self) -> ProcessStatus {
        let vbid = match self.ready.lock().pop_front() {
            Some(v) => v,
            None => return ProcessStatus::AllProcessed,
        };
        let Some(stream) = self.find_stream(vbid) else {
            return ProcessStatus::AllProcessed;
        };

        let store = self.engine.item_store();
        let clock = self.engine.clock();
        let mut batches = 0usize;
        loop {
            let result = stream.process_buffered(store, clock, self.batch_size);
            self.flow.bytes_freed(result.drained_bytes as u32);
            match result.status {
                BatchStatus::Ended => {
                    self.streams.remove(&vbid);
                    self.opaque_map.lock().remove(&stream.local_opaque());
                    return ProcessStatus::AllProcessed;
                }
                BatchStatus::Drained => return ProcessStatus::AllProcessed,
                BatchStatus::CannotProcess => {
                    self.backoffs.fetch_add(1, Ordering::Relaxed);
                    self.requeue_vbucket(vbid);
                    return ProcessStatus::CannotProcess;
                }
                BatchStatus::MoreAvailable => {
                    batches += 1;
                    if batches >= self.yield_limit {
                        self.requeue_vbucket(vbid);
                        return ProcessStatus::MoreToProcess;
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Outbound (step)
    // ------------------------------------------------------------------

    /// Emit at most one outbound message. `WouldBlock` means idle; a
    /// `Disconnect` is terminal (idle timeout or prior protocol death).
    pub fn step(&self, producer: &mut dyn MessageProducer) -> Result<()> {
        if self.is_dead() {
            return Err(EngineError::Disconnect);
        }
        let now = self.engine.clock().now();
        let idle = now.saturating_sub(self.last_message_time.load(Ordering::Acquire));
        if idle > self.idle_timeout {
            log::warn!(
                "[DcpConsumer::{}] peer idle for {}s (limit {}s), disconnecting",
                self.name,
                idle,
                self.idle_timeout
            );
            self.set_disconnect();
            return Err(EngineError::Disconnect);
        }

        // Pending control negotiation first, one message per step.
        if let Some((key, value)) = self.next_pending_control() {
            producer.control(key, &value)?;
            return Ok(());
        }

        // Stream lifecycle messages.
        let out = self.outbox.lock().pop_front();
        if let Some(out) = out {
            match out {
                Outbound::StreamReq(vbid) => {
                    if let Some(stream) = self.find_stream(vbid) {
                        let (vbid, flags, opaque, start, end, uuid, snap_start, snap_end) =
                            stream.stream_req_params();
                        producer
                            .stream_req(vbid, flags, opaque, start, end, uuid, snap_start, snap_end)?;
                    }
                }
                Outbound::AddStreamRsp {
                    remote,
                    local,
                    success,
                } => producer.add_stream_rsp(remote, local, success)?,
                Outbound::CloseStream { local, vbid } => producer.close_stream(local, vbid)?,
            }
            return Ok(());
        }

        // Flow-control ack when a quarter of the buffer has been released.
        if let Some(bytes) = self.flow.take_ack() {
            producer.buffer_ack(0, bytes)?;
            return Ok(());
        }

        // NOOP keepalive when nothing else is due.
        let last_noop = self.last_noop_tx.load(Ordering::Acquire);
        if now.saturating_sub(last_noop) >= self.noop_tx_interval {
            self.last_noop_tx.store(now, Ordering::Release);
            producer.noop(self.next_opaque())?;
            return Ok(());
        }

        Err(EngineError::WouldBlock)
    }

    fn next_pending_control(&self) -> Option<(&'static str, String)> {
        let mut pending = self.pending.lock();
        if pending.conn_buffer {
            pending.conn_buffer = false;
            if self.flow.enabled() {
                return Some((
                    "connection_buffer_size",
                    self.flow.buffer_size().to_string(),
                ));
            }
        }
        if pending.enable_noop {
            pending.enable_noop = false;
            return Some(("enable_noop", "true".to_string()));
        }
        if pending.noop_interval {
            pending.noop_interval = false;
            return Some(("set_noop_interval", self.noop_tx_interval.to_string()));
        }
        if pending.priority {
            pending.priority = false;
            return Some(("set_priority", "high".to_string()));
        }
        if pending.ext_metadata {
            pending.ext_metadata = false;
            return Some(("enable_ext_metadata", "true".to_string()));
        }
        if pending.value_compression {
            pending.value_compression = false;
            return Some(("enable_value_compression", "true".to_string()));
        }
        if pending.cursor_dropping {
            pending.cursor_dropping = false;
            return Some(("supports_cursor_dropping", "true".to_string()));
        }
        if pending.stream_end_on_close {
            pending.stream_end_on_close = false;
            return Some((
                "send_stream_end_on_client_close_stream",
                "true".to_string(),
            ));
        }
        None
    }

    // ------------------------------------------------------------------
    // VBucket-state-driven close
    // ------------------------------------------------------------------

    /// Called by the engine on every local vbucket state change: a stream
    /// whose vbucket is no longer a replica has no business staying open.
    pub(crate) fn vbucket_state_changed(&self, vbid: u16, state: VBucketState) {
        if state == VBucketState::Replica {
            return;
        }
        if let Some(stream) = self.close_stream_inner(vbid, "vbucket state changed") {
            self.outbox.lock().push_back(Outbound::CloseStream {
                local: stream.local_opaque(),
                vbid,
            });
        }
    }

    // ------------------------------------------------------------------
    // Stats
    // ------------------------------------------------------------------

    /// Emit per-consumer counters through the host's stat callback.
    pub fn add_stats(&self, add_stat: &mut dyn FnMut(&str, &str)) {
        let mut buf = [0u8; 20];
        add_stat("connection", &self.name);
        add_stat(
            "streams",
            crate::engine::stats::fmt_u64(&mut buf, self.streams.len() as u64),
        );
        let mut buf = [0u8; 20];
        add_stat(
            "backoffs",
            crate::engine::stats::fmt_u64(&mut buf, self.backoffs()),
        );
        let mut buf = [0u8; 20];
        add_stat(
            "flow_control_buffer_size",
            crate::engine::stats::fmt_u64(&mut buf, u64::from(self.flow.buffer_size())),
        );
        let mut buf = [0u8; 20];
        add_stat(
            "flow_control_freed_bytes",
            crate::engine::stats::fmt_u64(&mut buf, u64::from(self.flow.freed_bytes())),
        );
        let mut buf = [0u8; 20];
        add_stat(
            "total_bytes_received",
            crate::engine::stats::fmt_u64(&mut buf, self.flow.total_received()),
        );
        let mut buf = [0u8; 20];
        add_stat(
            "total_bytes_acked",
            crate::engine::stats::fmt_u64(&mut buf, self.flow.total_acked()),
        );
    }

    /// Stream state for tests and introspection.
    #[must_use]
    pub fn stream_state(&self, vbid: u16) -> Option<StreamState> {
        self.find_stream(vbid).map(|s| s.state())
    }

    #[must_use]
    pub fn stream_buffered_bytes(&self, vbid: u16) -> usize {
        self.find_stream(vbid)
            .map(|s| s.buffered_bytes())
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for DcpConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DcpConsumer")
            .field("name", &self.name)
            .field("streams", &self.streams.len())
            .field("dead", &self.is_dead())
            .finish()
    }
}
