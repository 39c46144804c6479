// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Item model: the stored document, its lifecycle flags, and the handles
//! that cross the engine boundary.
//!
//! A linked item is shared (`Arc`) between the hash index and any number of
//! external [`ItemHandle`]s. Memory safety comes from the `Arc`; eviction
//! and scrub eligibility come from an explicit external reference count the
//! handles maintain. The slab chunk reservation travels with the item and is
//! released when the last owner drops it, which by construction happens only
//! once the item is unlinked and no handle remains.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use super::slab::ChunkGuard;

/// Longest accepted key, in bytes.
pub const KEY_MAX_LENGTH: usize = 250;

/// This engine does not track per-vbucket uuids; mutation descriptors and
/// item info carry this fixed tag so hosts exercising the uuid plumbing get
/// a recognizable value.
pub const ENGINE_VBUCKET_UUID: u64 = 0x00fa_ce0f_f00d_0001;

/// The CAS value reported to readers while a document is locked.
pub const LOCKED_CAS_MASK: u64 = u64::MAX;

const IFLAG_LINKED: u8 = 0x01;
const IFLAG_ZOMBIE: u8 = 0x02;

/// Value datatype byte: raw bytes plus JSON / snappy / xattr bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Datatype(u8);

impl Datatype {
    pub const RAW: Datatype = Datatype(0x00);
    pub const JSON: Datatype = Datatype(0x01);
    pub const SNAPPY: Datatype = Datatype(0x02);
    pub const XATTR: Datatype = Datatype(0x04);

    #[must_use]
    pub fn from_bits(bits: u8) -> Self {
        Datatype(bits & 0x07)
    }

    #[must_use]
    pub fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub fn is_json(self) -> bool {
        self.0 & Self::JSON.0 != 0
    }

    #[must_use]
    pub fn is_snappy(self) -> bool {
        self.0 & Self::SNAPPY.0 != 0
    }

    #[must_use]
    pub fn has_xattr(self) -> bool {
        self.0 & Self::XATTR.0 != 0
    }
}

/// Whether a document is live or a tombstone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocState {
    Alive,
    Deleted,
}

/// Which document states a lookup is willing to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocStateFilter {
    Alive,
    Deleted,
    AliveOrDeleted,
}

impl DocStateFilter {
    #[must_use]
    pub fn admits(self, state: DocState) -> bool {
        match (self, state) {
            (DocStateFilter::Alive, DocState::Alive) => true,
            (DocStateFilter::Deleted, DocState::Deleted) => true,
            (DocStateFilter::AliveOrDeleted, _) => true,
            _ => false,
        }
    }
}

/// Store operation selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Add,
    Set,
    Replace,
    Append,
    Prepend,
    Cas,
}

/// CAS expectation supplied with a mutation. The wire-level wildcard zero is
/// converted to `Any` at the facade; the core never overloads a sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasToken {
    Any,
    Exact(u64),
}

impl CasToken {
    /// Facade helper: interpret the wire encoding (0 means "any").
    #[must_use]
    pub fn from_wire(cas: u64) -> Self {
        if cas == 0 {
            CasToken::Any
        } else {
            CasToken::Exact(cas)
        }
    }

    #[must_use]
    pub fn matches(self, current: u64) -> bool {
        match self {
            CasToken::Any => true,
            CasToken::Exact(c) => c == current,
        }
    }
}

/// Metadata snapshot of an item, with the CAS already masked for locked
/// documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemInfo {
    pub cas: u64,
    pub vbucket_uuid: u64,
    pub seqno: u64,
    /// Absolute unix expiry (0 = never).
    pub exptime: u64,
    pub nbytes: usize,
    pub flags: u32,
    pub datatype: Datatype,
    pub document_state: DocState,
}

/// Result of a delete: the winning CAS plus the vbucket tag the host echoes
/// to deletion-aware clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationResult {
    pub cas: u64,
    pub vbucket_uuid: u64,
    pub seqno: u64,
}

/// A stored document. Immutable payload; the handful of fields a mutation
/// may touch in place (expiry, lock, CAS on link) are atomics so readers
/// never block.
pub struct Item {
    key: Box<[u8]>,
    value: Box<[u8]>,
    flags: u32,
    datatype: Datatype,
    exptime: AtomicU32,
    locktime: AtomicU32,
    cas: AtomicU64,
    iflag: AtomicU8,
    /// External handles only; linkage does not count.
    refcount: AtomicU32,
    stored_at: AtomicU32,
    /// Node id in the owning class LRU list (`u32::MAX` when unlinked).
    lru_slot: AtomicU32,
    chunk: ChunkGuard,
}

impl Item {
    pub(crate) fn new(
        key: Box<[u8]>,
        value: Box<[u8]>,
        flags: u32,
        datatype: Datatype,
        exptime: u32,
        chunk: ChunkGuard,
    ) -> Self {
        Self {
            key,
            value,
            flags,
            datatype,
            exptime: AtomicU32::new(exptime),
            locktime: AtomicU32::new(0),
            cas: AtomicU64::new(0),
            iflag: AtomicU8::new(0),
            refcount: AtomicU32::new(0),
            stored_at: AtomicU32::new(0),
            lru_slot: AtomicU32::new(u32::MAX),
            chunk,
        }
    }

    #[must_use]
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    #[must_use]
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    #[must_use]
    pub fn flags(&self) -> u32 {
        self.flags
    }

    #[must_use]
    pub fn datatype(&self) -> Datatype {
        self.datatype
    }

    #[must_use]
    pub fn cas(&self) -> u64 {
        self.cas.load(Ordering::Relaxed)
    }

    pub(crate) fn set_cas(&self, cas: u64) {
        self.cas.store(cas, Ordering::Relaxed);
    }

    #[must_use]
    pub fn exptime(&self) -> u32 {
        self.exptime.load(Ordering::Relaxed)
    }

    pub(crate) fn set_exptime(&self, exptime: u32) {
        self.exptime.store(exptime, Ordering::Relaxed);
    }

    #[must_use]
    pub fn locktime(&self) -> u32 {
        self.locktime.load(Ordering::Relaxed)
    }

    pub(crate) fn set_locktime(&self, until: u32) {
        self.locktime.store(until, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_locked(&self, now: u32) -> bool {
        let lock = self.locktime();
        lock != 0 && lock > now
    }

    #[must_use]
    pub fn is_linked(&self) -> bool {
        self.iflag.load(Ordering::Relaxed) & IFLAG_LINKED != 0
    }

    #[must_use]
    pub fn is_zombie(&self) -> bool {
        self.iflag.load(Ordering::Relaxed) & IFLAG_ZOMBIE != 0
    }

    #[must_use]
    pub fn document_state(&self) -> DocState {
        if self.is_zombie() {
            DocState::Deleted
        } else {
            DocState::Alive
        }
    }

    pub(crate) fn mark_linked(&self, state: DocState, now: u32) {
        let bits = match state {
            DocState::Alive => IFLAG_LINKED,
            DocState::Deleted => IFLAG_LINKED | IFLAG_ZOMBIE,
        };
        self.stored_at.store(now, Ordering::Relaxed);
        self.iflag.store(bits, Ordering::Release);
    }

    pub(crate) fn mark_unlinked(&self) {
        self.iflag
            .fetch_and(!IFLAG_LINKED, Ordering::AcqRel);
        self.lru_slot.store(u32::MAX, Ordering::Relaxed);
    }

    #[must_use]
    pub fn stored_at(&self) -> u32 {
        self.stored_at.load(Ordering::Relaxed)
    }

    pub(crate) fn lru_slot(&self) -> u32 {
        self.lru_slot.load(Ordering::Relaxed)
    }

    pub(crate) fn set_lru_slot(&self, slot: u32) {
        self.lru_slot.store(slot, Ordering::Relaxed);
    }

    /// Whether the item is observably absent at `now` given the bucket-wide
    /// `oldest_live` flush horizon (items stored strictly before the horizon
    /// are flushed).
    #[must_use]
    pub fn is_expired(&self, now: u32, oldest_live: u32) -> bool {
        let exp = self.exptime();
        if exp != 0 && exp <= now {
            return true;
        }
        oldest_live != 0 && self.stored_at() < oldest_live && oldest_live <= now
    }

    /// Number of live external handles.
    #[must_use]
    pub fn external_refs(&self) -> u32 {
        self.refcount.load(Ordering::Relaxed)
    }

    /// Slab class of the backing chunk.
    #[must_use]
    pub fn class(&self) -> u8 {
        self.chunk.class()
    }

    /// Accounted size: struct overhead plus key plus value.
    #[must_use]
    pub fn ntotal(&self) -> usize {
        std::mem::size_of::<Item>() + self.key.len() + self.value.len()
    }
}

impl std::fmt::Debug for Item {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Item")
            .field("key_len", &self.key.len())
            .field("nbytes", &self.value.len())
            .field("cas", &self.cas())
            .field("linked", &self.is_linked())
            .field("zombie", &self.is_zombie())
            .finish()
    }
}

/// Shared read handle on a stored (or copied) item. Creation and clones bump
/// the item's external reference count; drops release it. While any handle
/// is live the item is ineligible for eviction and scrubbing.
pub struct ItemHandle {
    item: Arc<Item>,
}

impl ItemHandle {
    pub(crate) fn new(item: Arc<Item>) -> Self {
        item.refcount.fetch_add(1, Ordering::AcqRel);
        Self { item }
    }

    pub(crate) fn item(&self) -> &Arc<Item> {
        &self.item
    }

    #[must_use]
    pub fn key(&self) -> &[u8] {
        self.item.key()
    }

    #[must_use]
    pub fn value(&self) -> &[u8] {
        self.item.value()
    }

    #[must_use]
    pub fn flags(&self) -> u32 {
        self.item.flags()
    }

    #[must_use]
    pub fn datatype(&self) -> Datatype {
        self.item.datatype()
    }

    /// Raw CAS of the item. Use [`crate::engine::KvEngine::item_info`] for
    /// the host-visible value, which masks locked documents.
    #[must_use]
    pub fn cas(&self) -> u64 {
        self.item.cas()
    }

    #[must_use]
    pub fn document_state(&self) -> DocState {
        self.item.document_state()
    }
}

impl Clone for ItemHandle {
    fn clone(&self) -> Self {
        ItemHandle::new(Arc::clone(&self.item))
    }
}

impl Drop for ItemHandle {
    fn drop(&mut self) {
        self.item.refcount.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for ItemHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ItemHandle").field(&*self.item).finish()
    }
}

/// An allocated, not-yet-linked item. Exclusively owned by the caller
/// between `allocate` and `store`, which is what makes the payload writable
/// without any locking.
pub struct NewItem {
    key: Box<[u8]>,
    value: Box<[u8]>,
    flags: u32,
    datatype: Datatype,
    /// Rel-time expiry, already converted by the facade.
    exptime: u32,
    /// CAS seeded by the delete path; 0 means "assign fresh on link".
    cas: u64,
    vbid: u16,
    chunk: ChunkGuard,
}

impl NewItem {
    pub(crate) fn new(
        key: Box<[u8]>,
        nbytes: usize,
        flags: u32,
        datatype: Datatype,
        exptime: u32,
        vbid: u16,
        chunk: ChunkGuard,
    ) -> Self {
        Self {
            key,
            value: vec![0u8; nbytes].into_boxed_slice(),
            flags,
            datatype,
            exptime,
            cas: 0,
            vbid,
            chunk,
        }
    }

    #[must_use]
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    #[must_use]
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Writable payload for the host to fill before `store`.
    pub fn value_mut(&mut self) -> &mut [u8] {
        &mut self.value
    }

    #[must_use]
    pub fn flags(&self) -> u32 {
        self.flags
    }

    #[must_use]
    pub fn datatype(&self) -> Datatype {
        self.datatype
    }

    pub fn set_datatype(&mut self, datatype: Datatype) {
        self.datatype = datatype;
    }

    #[must_use]
    pub fn exptime(&self) -> u32 {
        self.exptime
    }

    #[must_use]
    pub fn vbid(&self) -> u16 {
        self.vbid
    }

    /// Seed the CAS the link will carry (delete-as-CAS path).
    pub fn set_cas(&mut self, cas: u64) {
        self.cas = cas;
    }

    #[must_use]
    pub fn cas(&self) -> u64 {
        self.cas
    }

    pub(crate) fn into_parts(self) -> (Box<[u8]>, Box<[u8]>, u32, Datatype, u32, ChunkGuard) {
        (
            self.key,
            self.value,
            self.flags,
            self.datatype,
            self.exptime,
            self.chunk,
        )
    }
}

impl std::fmt::Debug for NewItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewItem")
            .field("key_len", &self.key.len())
            .field("nbytes", &self.value.len())
            .field("vbid", &self.vbid)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::slab::SlabAllocator;

    fn chunk() -> ChunkGuard {
        let slabs = Arc::new(SlabAllocator::new(1 << 20, 64, 2.0, 8192));
        slabs.alloc(128).expect("chunk")
    }

    fn item(key: &[u8], value: &[u8]) -> Item {
        Item::new(
            key.to_vec().into_boxed_slice(),
            value.to_vec().into_boxed_slice(),
            0,
            Datatype::RAW,
            0,
            chunk(),
        )
    }

    #[test]
    fn test_link_flags_transitions() {
        let it = item(b"k", b"v");
        assert!(!it.is_linked());
        it.mark_linked(DocState::Alive, 10);
        assert!(it.is_linked());
        assert!(!it.is_zombie());
        it.mark_unlinked();
        assert!(!it.is_linked());
    }

    #[test]
    fn test_zombie_state() {
        let it = item(b"k", b"");
        it.mark_linked(DocState::Deleted, 5);
        assert!(it.is_linked());
        assert!(it.is_zombie());
        assert_eq!(it.document_state(), DocState::Deleted);
    }

    #[test]
    fn test_handle_refcounting() {
        let it = Arc::new(item(b"k", b"v"));
        assert_eq!(it.external_refs(), 0);
        let h1 = ItemHandle::new(Arc::clone(&it));
        let h2 = h1.clone();
        assert_eq!(it.external_refs(), 2);
        drop(h1);
        assert_eq!(it.external_refs(), 1);
        drop(h2);
        assert_eq!(it.external_refs(), 0);
    }

    #[test]
    fn test_expiry_rules() {
        let it = item(b"k", b"v");
        it.mark_linked(DocState::Alive, 100);
        assert!(!it.is_expired(100, 0), "no exptime, no flush horizon");
        it.set_exptime(150);
        assert!(!it.is_expired(149, 0));
        assert!(it.is_expired(150, 0));
        // Flush horizon covers items stored strictly before it.
        let fresh = item(b"k2", b"v");
        fresh.mark_linked(DocState::Alive, 100);
        assert!(fresh.is_expired(101, 101));
        assert!(!fresh.is_expired(101, 100));
    }

    #[test]
    fn test_lock_window() {
        let it = item(b"k", b"v");
        assert!(!it.is_locked(10));
        it.set_locktime(20);
        assert!(it.is_locked(19));
        assert!(!it.is_locked(20), "lock expires at its deadline");
    }

    #[test]
    fn test_cas_token_wire_conversion() {
        assert_eq!(CasToken::from_wire(0), CasToken::Any);
        assert_eq!(CasToken::from_wire(7), CasToken::Exact(7));
        assert!(CasToken::Any.matches(123));
        assert!(CasToken::Exact(5).matches(5));
        assert!(!CasToken::Exact(5).matches(6));
    }

    #[test]
    fn test_datatype_bits() {
        let dt = Datatype::from_bits(0x07);
        assert!(dt.is_json());
        assert!(dt.is_snappy());
        assert!(dt.has_xattr());
        assert_eq!(Datatype::from_bits(0xF8).bits(), 0, "high bits discarded");
    }

    #[test]
    fn test_new_item_value_writable() {
        let slabs = Arc::new(SlabAllocator::new(1 << 20, 64, 2.0, 8192));
        let g = slabs.alloc(128).expect("chunk");
        let mut ni = NewItem::new(
            b"key".to_vec().into_boxed_slice(),
            4,
            0,
            Datatype::RAW,
            0,
            0,
            g,
        );
        ni.value_mut().copy_from_slice(b"data");
        assert_eq!(ni.value(), b"data");
    }
}
