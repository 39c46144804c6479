// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Engine error codes.
//!
//! The error kinds form a closed set shared by the item store, the vbucket
//! gate and the replication consumer. Item-store errors bubble to the engine
//! facade untouched; only the facade translates them when crossing the host
//! boundary. Every variant carries a short static descriptor for logging and
//! no error path allocates.

use std::fmt;

/// Result alias used across the engine.
pub type Result<T> = std::result::Result<T, EngineError>;

/// The closed set of engine error codes.
///
/// `Ok(_)` is the success arm; everything else that can happen inside the
/// engine is one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineError {
    /// The requested document does not exist (or is filtered out).
    NoSuchKey,
    /// A document already exists, or a CAS comparison failed.
    KeyExists,
    /// The item does not fit any slab class.
    TooBig,
    /// The slab pool is exhausted and eviction could not free a chunk.
    NoMemory,
    /// Transient resource shortage; the caller should retry.
    TemporaryFailure,
    /// The vbucket gate rejected the operation.
    NotMyVbucket,
    /// The document is locked and the supplied CAS does not own the lock.
    Locked,
    /// Unlock was requested for a document that is not locked.
    NotLocked,
    /// No work is ready; the caller should park and retry later.
    WouldBlock,
    /// Terminal for a connection (protocol violation or idle timeout).
    Disconnect,
    /// A store-if predicate vetoed the mutation.
    PredicateFailed,
    /// The replication peer demanded a rollback to the given seqno.
    Rollback(u64),
    /// A singleton background pass is already running.
    Busy,
    /// The management opcode is not handled by this engine.
    UnknownCommand,
    /// Internal invariant violation; not expected in normal operation.
    Failed,
}

impl EngineError {
    /// Short static descriptor for log lines.
    #[must_use]
    pub fn descriptor(&self) -> &'static str {
        match self {
            EngineError::NoSuchKey => "no such key",
            EngineError::KeyExists => "key exists",
            EngineError::TooBig => "too big",
            EngineError::NoMemory => "no memory",
            EngineError::TemporaryFailure => "temporary failure",
            EngineError::NotMyVbucket => "not my vbucket",
            EngineError::Locked => "locked",
            EngineError::NotLocked => "not locked",
            EngineError::WouldBlock => "would block",
            EngineError::Disconnect => "disconnect",
            EngineError::PredicateFailed => "predicate failed",
            EngineError::Rollback(_) => "rollback",
            EngineError::Busy => "busy",
            EngineError::UnknownCommand => "unknown command",
            EngineError::Failed => "failed",
        }
    }

    /// Whether the caller may retry the operation without changing anything.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::TemporaryFailure | EngineError::NoMemory | EngineError::WouldBlock
        )
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Rollback(seqno) => write!(f, "rollback to seqno {}", seqno),
            other => f.write_str(other.descriptor()),
        }
    }
}

impl std::error::Error for EngineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_is_static() {
        let e = EngineError::NoSuchKey;
        let d: &'static str = e.descriptor();
        assert_eq!(d, "no such key");
    }

    #[test]
    fn test_rollback_display_carries_seqno() {
        assert_eq!(
            format!("{}", EngineError::Rollback(42)),
            "rollback to seqno 42"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(EngineError::TemporaryFailure.is_transient());
        assert!(EngineError::NoMemory.is_transient());
        assert!(!EngineError::KeyExists.is_transient());
        assert!(!EngineError::Disconnect.is_transient());
    }
}
