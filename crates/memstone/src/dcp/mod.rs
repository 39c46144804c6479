// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Replication consumer (DCP-style).
//!
//! The connection layer feeds parsed inbound messages into a [`DcpConsumer`]
//! and drives its outbound side by calling [`DcpConsumer::step`] with a
//! [`MessageProducer`]. Per-vbucket [`PassiveStream`]s enforce snapshot and
//! seqno ordering, buffer messages under connection-level flow control, and
//! a background processor applies them to the item store in order.

pub mod consumer;
pub mod flow_control;
pub mod message;
pub mod stream;

pub use consumer::{DcpConsumer, ProcessStatus};
pub use flow_control::FlowControl;
pub use message::{
    DcpResponse, DeletionMessage, MessageProducer, MutationMessage, Opaque, ResponseStatus,
    SnapshotMarker, SnapshotType, StreamEndReason, StreamMessage, SystemEventMessage,
};
pub use stream::{BatchResult, BatchStatus, PassiveStream, StreamState};
