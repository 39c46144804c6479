// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # Memstone - slab-allocated in-memory bucket engine
//!
//! A volatile key/document storage engine with per-bucket isolation,
//! designed to sit behind a memcached-compatible server: a size-classed
//! slab allocator feeds a hash-indexed item table with CAS-based optimistic
//! concurrency, LRU eviction, document locking and lazy expiry, gated per
//! operation by a virtual-bucket state byte, and fed by a replication
//! consumer that applies peer mutation streams in strict seqno order.
//!
//! ## Quick Start
//!
//! ```rust
//! use memstone::{CasToken, Datatype, DocState, Engine, KvEngine, StoreOp, TaskPool};
//!
//! let tasks = TaskPool::new(2);
//! let engine = Engine::from_config_str("cache_size=1048576", tasks.clone()).unwrap();
//!
//! let mut item = engine
//!     .allocate(b"greeting", 5, 0, 0, Datatype::RAW, 0)
//!     .unwrap();
//! item.value_mut().copy_from_slice(b"hello");
//! let cas = engine
//!     .store(item, CasToken::Any, StoreOp::Add, DocState::Alive)
//!     .unwrap();
//! assert!(cas > 0);
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                        Host server (wire layer)                    |
//! |        frame parsing | connection state machine | cookies          |
//! +--------------------------------------------------------------------+
//! |                       Engine facade (KvEngine)                     |
//! |    argument validation | vbucket gate | stats | management cmds    |
//! +--------------------------------------------------------------------+
//! |   Item store                      |   DCP consumer                 |
//! |   hash index | LRU | CAS | locks  |   passive streams | ordering   |
//! |   expiry | scrubber               |   flow control | processor     |
//! +--------------------------------------------------------------------+
//! |                  Slab allocator (size-classed pool)                |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Engine`] | Concrete bucket engine, one per bucket |
//! | [`KvEngine`] | The capability set the host programs against |
//! | [`DcpConsumer`] | Receiving half of one replication connection |
//! | [`TaskPool`] | Background workers (scrubber, processor, rollback) |
//! | [`EngineConfig`] | Parsed `key=value;...` bucket configuration |
//!
//! ## Concurrency model
//!
//! Request workers call the facade concurrently; a small background pool
//! runs the scrubber, the stream processor and rollback tasks. The engine
//! uses coarse per-subsystem locks (items, slabs, scrubber) ordered
//! items -> slabs to stay deadlock-free; counters and item flags are
//! atomics, and the stream registry is lock-free for reads.

/// Coarse rel-time clock shared by expiry, locking and liveness checks.
pub mod clock;
/// Bucket configuration parsing.
pub mod config;
/// Replication consumer (streams, flow control, processor).
pub mod dcp;
/// Engine facade, vbucket gate and counters.
pub mod engine;
/// The closed engine error set.
pub mod error;
/// Item store: slab allocator, hash index, LRU, scrubber.
pub mod store;
/// Background worker pool.
pub mod tasks;

pub use clock::EngineClock;
pub use config::{ConfigError, EngineConfig};
pub use dcp::{
    DcpConsumer, DcpResponse, DeletionMessage, MessageProducer, MutationMessage, Opaque,
    ProcessStatus, ResponseStatus, SnapshotMarker, SnapshotType, StreamEndReason, StreamMessage,
    StreamState, SystemEventMessage,
};
pub use engine::vbucket::{VBucketState, NUM_VBUCKETS};
pub use engine::{Engine, KvEngine, ManagementCommand, ManagementResponse};
pub use error::{EngineError, Result};
pub use store::item::{
    CasToken, Datatype, DocState, DocStateFilter, ItemHandle, ItemInfo, MutationResult, NewItem,
    StoreOp, KEY_MAX_LENGTH,
};
pub use store::slab::{ClassStats, SlabAllocator};
pub use tasks::TaskPool;

/// Engine version string.
pub const VERSION: &str = "0.4.2";
