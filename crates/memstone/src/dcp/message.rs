// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Consumer-side replication message set.
//!
//! These are the in-memory forms of the wire messages the connection layer
//! parses for us (inbound) or encodes for us (outbound). Field widths match
//! the memcached binary protocol: opaques are 32-bit tags, seqnos 64-bit,
//! and buffer accounting charges the 24-byte frame header plus key and value
//! lengths.

use crate::error::Result;
use crate::store::item::Datatype;

/// 32-bit request/stream correlation tag.
pub type Opaque = u32;

/// Frame header size charged per buffered message.
pub const MSG_HEADER_BYTES: usize = 24;

/// Snapshot marker flag bits (wire encoding).
pub const MARKER_FLAG_MEMORY: u32 = 0x01;
pub const MARKER_FLAG_DISK: u32 = 0x02;

/// Whether a snapshot was produced from memory or disk on the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotType {
    Memory,
    Disk,
}

impl SnapshotType {
    #[must_use]
    pub fn from_marker_flags(flags: u32) -> Self {
        if flags & MARKER_FLAG_DISK != 0 {
            SnapshotType::Disk
        } else {
            SnapshotType::Memory
        }
    }
}

/// Snapshot marker delimiting a contiguous seqno window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotMarker {
    pub start: u64,
    pub end: u64,
    pub kind: SnapshotType,
}

/// A replicated document mutation.
#[derive(Debug, Clone)]
pub struct MutationMessage {
    pub key: Box<[u8]>,
    pub value: Box<[u8]>,
    pub flags: u32,
    /// Peer-side expiry (absolute unix seconds or relative, wire form).
    pub expiration: u32,
    pub datatype: Datatype,
    pub cas: u64,
    pub by_seqno: u64,
    pub rev_seqno: u64,
    pub lock_time: u32,
}

/// A replicated deletion or expiration.
#[derive(Debug, Clone)]
pub struct DeletionMessage {
    pub key: Box<[u8]>,
    pub cas: u64,
    pub datatype: Datatype,
    pub by_seqno: u64,
    pub rev_seqno: u64,
}

/// An out-of-band peer event carried in-stream.
#[derive(Debug, Clone)]
pub struct SystemEventMessage {
    pub by_seqno: u64,
    pub event: u32,
    pub key: Box<[u8]>,
    pub data: Box<[u8]>,
}

/// Why a stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEndReason {
    /// The peer sent everything the stream asked for.
    Ok,
    /// Closed on request (client close or local teardown).
    Closed,
    /// The local vbucket state no longer allows the stream.
    StateChanged,
    /// The peer connection died.
    Disconnected,
    /// Every failover entry was rejected during rollback handling.
    RollbackExhausted,
}

impl StreamEndReason {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            StreamEndReason::Ok => "ok",
            StreamEndReason::Closed => "closed",
            StreamEndReason::StateChanged => "state changed",
            StreamEndReason::Disconnected => "disconnected",
            StreamEndReason::RollbackExhausted => "rollback exhausted",
        }
    }
}

/// One buffered inbound stream message.
#[derive(Debug, Clone)]
pub enum StreamMessage {
    SnapshotMarker(SnapshotMarker),
    Mutation(MutationMessage),
    Deletion(DeletionMessage),
    Expiration(DeletionMessage),
    SystemEvent(SystemEventMessage),
    StreamEnd(StreamEndReason),
}

impl StreamMessage {
    /// Bytes charged against the connection flow-control budget.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        match self {
            StreamMessage::SnapshotMarker(_) => MSG_HEADER_BYTES,
            StreamMessage::Mutation(m) => MSG_HEADER_BYTES + m.key.len() + m.value.len(),
            StreamMessage::Deletion(d) | StreamMessage::Expiration(d) => {
                MSG_HEADER_BYTES + d.key.len()
            }
            StreamMessage::SystemEvent(e) => MSG_HEADER_BYTES + e.key.len() + e.data.len(),
            StreamMessage::StreamEnd(_) => MSG_HEADER_BYTES,
        }
    }

    /// The seqno a data message carries; markers and ends have none.
    #[must_use]
    pub fn by_seqno(&self) -> Option<u64> {
        match self {
            StreamMessage::Mutation(m) => Some(m.by_seqno),
            StreamMessage::Deletion(d) | StreamMessage::Expiration(d) => Some(d.by_seqno),
            StreamMessage::SystemEvent(e) => Some(e.by_seqno),
            StreamMessage::SnapshotMarker(_) | StreamMessage::StreamEnd(_) => None,
        }
    }
}

/// Status of a peer response to a consumer-initiated request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Success,
    /// The peer demands a rollback to the given seqno before streaming.
    Rollback(u64),
    /// The failover entry we asked for is unknown to the peer.
    KeyEnoent,
    /// Any other protocol status code.
    Error(u16),
}

/// A peer response matched to a local opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DcpResponse {
    pub opaque: Opaque,
    pub status: ResponseStatus,
}

/// Outbound sink the connection layer hands to [`step`].
///
/// Each method encodes and ships one message; an `Err` propagates out of
/// `step` untouched.
///
/// [`step`]: crate::dcp::DcpConsumer::step
pub trait MessageProducer {
    #[allow(clippy::too_many_arguments)]
    fn stream_req(
        &mut self,
        vbid: u16,
        flags: u32,
        opaque: Opaque,
        start_seqno: u64,
        end_seqno: u64,
        vb_uuid: u64,
        snap_start: u64,
        snap_end: u64,
    ) -> Result<()>;

    /// Reply to the host-side ADD_STREAM admin command once the peer
    /// accepted or refused the stream.
    fn add_stream_rsp(&mut self, remote_opaque: Opaque, local_opaque: Opaque, success: bool)
        -> Result<()>;

    fn close_stream(&mut self, opaque: Opaque, vbid: u16) -> Result<()>;

    fn buffer_ack(&mut self, opaque: Opaque, bytes: u32) -> Result<()>;

    fn control(&mut self, key: &str, value: &str) -> Result<()>;

    fn noop(&mut self, opaque: Opaque) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_sizes_charge_key_and_value() {
        let mutation = StreamMessage::Mutation(MutationMessage {
            key: b"key".to_vec().into_boxed_slice(),
            value: b"value".to_vec().into_boxed_slice(),
            flags: 0,
            expiration: 0,
            datatype: Datatype::RAW,
            cas: 1,
            by_seqno: 1,
            rev_seqno: 1,
            lock_time: 0,
        });
        assert_eq!(mutation.size_bytes(), MSG_HEADER_BYTES + 3 + 5);

        let marker = StreamMessage::SnapshotMarker(SnapshotMarker {
            start: 1,
            end: 2,
            kind: SnapshotType::Memory,
        });
        assert_eq!(marker.size_bytes(), MSG_HEADER_BYTES);
    }

    #[test]
    fn test_snapshot_type_from_flags() {
        assert_eq!(
            SnapshotType::from_marker_flags(MARKER_FLAG_MEMORY),
            SnapshotType::Memory
        );
        assert_eq!(
            SnapshotType::from_marker_flags(MARKER_FLAG_DISK),
            SnapshotType::Disk
        );
        assert_eq!(
            SnapshotType::from_marker_flags(0),
            SnapshotType::Memory,
            "memory is the default"
        );
    }

    #[test]
    fn test_by_seqno_only_on_data() {
        let end = StreamMessage::StreamEnd(StreamEndReason::Ok);
        assert_eq!(end.by_seqno(), None);
        let deletion = StreamMessage::Deletion(DeletionMessage {
            key: b"k".to_vec().into_boxed_slice(),
            cas: 0,
            datatype: Datatype::RAW,
            by_seqno: 42,
            rev_seqno: 1,
        });
        assert_eq!(deletion.by_seqno(), Some(42));
    }
}
