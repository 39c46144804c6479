// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The item store: document lifecycle, CAS, locking, expiry and eviction on
//! top of the slab allocator and the hash index.
//!
//! Locking model: one coarse mutex (`items`) serializes every hash-chain and
//! LRU mutation; the slab allocator has its own lock and is only ever taken
//! while `items` is held or with no lock at all, never the other way around.
//! Item flags and refcounts are atomics so read paths off the lock stay
//! cheap.

pub mod hash;
pub mod item;
pub mod lru;
pub mod scrub;
pub mod slab;

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::clock::EngineClock;
use crate::config::EngineConfig;
use crate::engine::stats::EngineStats;
use crate::error::{EngineError, Result};

use hash::HashIndex;
use item::{
    CasToken, Datatype, DocState, DocStateFilter, Item, ItemHandle, MutationResult, NewItem,
    StoreOp, ENGINE_VBUCKET_UUID, KEY_MAX_LENGTH,
};
use lru::LruLists;
use slab::{ChunkGuard, SlabAllocator};

/// LRU tail entries inspected per eviction attempt.
const EVICTION_SEARCH_DEPTH: usize = 50;
/// Alloc/evict round-trips before giving up with `NoMemory`.
const EVICTION_ATTEMPTS: usize = 10;

/// Largest chunk the slab allocator must provide for a given value cap.
#[must_use]
pub fn max_chunk_for(item_size_max: usize) -> usize {
    std::mem::size_of::<Item>() + KEY_MAX_LENGTH + item_size_max
}

pub(crate) struct ItemsInner {
    hash: HashIndex,
    lru: LruLists,
}

/// Hash-indexed item table of one bucket.
pub struct ItemStore {
    inner: Mutex<ItemsInner>,
    slabs: Arc<SlabAllocator>,
    stats: Arc<EngineStats>,
    clock: Arc<EngineClock>,
    cas_source: AtomicU64,
    oldest_live: AtomicU32,
    keep_deleted: bool,
    evict_to_free: bool,
    item_size_max: usize,
}

impl ItemStore {
    pub fn new(
        slabs: Arc<SlabAllocator>,
        stats: Arc<EngineStats>,
        clock: Arc<EngineClock>,
        config: &EngineConfig,
    ) -> Self {
        let lru = LruLists::new(slabs.class_count());
        Self {
            inner: Mutex::new(ItemsInner {
                hash: HashIndex::new(),
                lru,
            }),
            slabs,
            stats,
            clock,
            cas_source: AtomicU64::new(0),
            oldest_live: AtomicU32::new(0),
            keep_deleted: config.keep_deleted,
            evict_to_free: config.evict_to_free,
            item_size_max: config.item_size_max,
        }
    }

    /// Strictly monotone per-engine CAS source.
    fn next_cas(&self) -> u64 {
        self.cas_source.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[must_use]
    pub fn oldest_live(&self) -> u32 {
        self.oldest_live.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Reserve an unlinked item. `exptime` is already rel-time.
    pub fn alloc_item(
        &self,
        key: &[u8],
        nbytes: usize,
        flags: u32,
        datatype: Datatype,
        exptime: u32,
        vbid: u16,
    ) -> Result<NewItem> {
        if key.is_empty() || key.len() > KEY_MAX_LENGTH {
            return Err(EngineError::TooBig);
        }
        if nbytes > self.item_size_max {
            return Err(EngineError::TooBig);
        }
        let ntotal = std::mem::size_of::<Item>() + key.len() + nbytes;
        let class = self.slabs.class_of(ntotal).ok_or(EngineError::TooBig)?;
        let chunk = self.reserve_chunk(class)?;
        Ok(NewItem::new(
            key.to_vec().into_boxed_slice(),
            nbytes,
            flags,
            datatype,
            exptime,
            vbid,
            chunk,
        ))
    }

    /// Chunk reservation with LRU eviction pressure relief.
    fn reserve_chunk(&self, class: u8) -> Result<ChunkGuard> {
        for _ in 0..EVICTION_ATTEMPTS {
            match self.slabs.alloc_class(class) {
                Ok(chunk) => return Ok(chunk),
                Err(EngineError::NoMemory) => {
                    if !self.evict_to_free {
                        return Err(EngineError::NoMemory);
                    }
                    let mut inner = self.inner.lock();
                    if !self.evict_one_locked(&mut inner, class) {
                        return Err(EngineError::NoMemory);
                    }
                    // The victim's chunk is back on the free list once its
                    // Arc dropped inside evict_one_locked.
                }
                Err(e) => return Err(e),
            }
        }
        Err(EngineError::NoMemory)
    }

    /// Walk the class LRU tail and unlink the first evictable item.
    fn evict_one_locked(&self, inner: &mut ItemsInner, class: u8) -> bool {
        let now = self.clock.now();
        let oldest = self.oldest_live();
        let candidates = inner.lru.tail_candidates(class, EVICTION_SEARCH_DEPTH);
        for item in candidates {
            if !item.is_linked() || item.external_refs() > 0 || item.is_locked(now) {
                continue;
            }
            let expired = item.is_expired(now, oldest);
            self.unlink_item_locked(inner, &item);
            if expired {
                self.stats.add_reclaimed();
            } else {
                self.stats.add_eviction();
            }
            return true;
        }
        false
    }

    // ------------------------------------------------------------------
    // Linking
    // ------------------------------------------------------------------

    fn link_item_locked(&self, inner: &mut ItemsInner, item: Arc<Item>) {
        if let Some(old) = inner.hash.insert(Arc::clone(&item)) {
            inner.lru.remove(&old);
            old.mark_unlinked();
            self.stats.item_unlinked(old.ntotal());
        }
        inner.lru.promote(&item);
        self.stats.item_linked(item.ntotal());
    }

    fn unlink_item_locked(&self, inner: &mut ItemsInner, item: &Arc<Item>) {
        if !item.is_linked() {
            return;
        }
        if let Some(removed) = inner.hash.remove(item.key()) {
            if !Arc::ptr_eq(&removed, item) {
                // A newer item took the key; this one is already gone.
                inner.hash.insert(removed);
                return;
            }
        } else {
            return;
        }
        inner.lru.remove(item);
        item.mark_unlinked();
        self.stats.item_unlinked(item.ntotal());
    }

    /// Fetch a linked, not-yet-expired item. Lazily reclaims expired ones.
    fn lookup_live(&self, inner: &mut ItemsInner, key: &[u8]) -> Result<Arc<Item>> {
        let now = self.clock.now();
        let oldest = self.oldest_live();
        let item = inner.hash.get(key).ok_or(EngineError::NoSuchKey)?;
        if item.is_expired(now, oldest) {
            self.unlink_item_locked(inner, &item);
            self.stats.add_reclaimed();
            return Err(EngineError::NoSuchKey);
        }
        Ok(item)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Fetch a document. `promote` moves it to the MRU end (data reads do,
    /// meta-only reads don't).
    pub fn get(&self, key: &[u8], filter: DocStateFilter, promote: bool) -> Result<ItemHandle> {
        let mut inner = self.inner.lock();
        let item = self.lookup_live(&mut inner, key)?;
        if !filter.admits(item.document_state()) {
            return Err(EngineError::NoSuchKey);
        }
        if promote {
            inner.lru.promote(&item);
        }
        Ok(ItemHandle::new(item))
    }

    /// Lock a document until `until` (rel-time) and return an unlinked copy
    /// exposing the true CAS.
    pub fn get_locked(&self, key: &[u8], until: u32) -> Result<ItemHandle> {
        let mut inner = self.inner.lock();
        let item = self.lookup_live(&mut inner, key)?;
        if item.is_zombie() {
            return Err(EngineError::NoSuchKey);
        }
        let now = self.clock.now();
        if item.is_locked(now) {
            return Err(EngineError::Locked);
        }
        item.set_locktime(until);

        let ntotal = item.ntotal();
        let class = match self.slabs.class_of(ntotal) {
            Some(c) => c,
            None => {
                item.set_locktime(0);
                return Err(EngineError::Failed);
            }
        };
        let chunk = match self.slabs.alloc_class(class) {
            Ok(c) => c,
            Err(_) => {
                // No room for the copy; don't leave the document locked.
                item.set_locktime(0);
                return Err(EngineError::TemporaryFailure);
            }
        };
        let copy = Item::new(
            key.to_vec().into_boxed_slice(),
            item.value().to_vec().into_boxed_slice(),
            item.flags(),
            item.datatype(),
            item.exptime(),
            chunk,
        );
        copy.set_cas(item.cas());
        inner.lru.promote(&item);
        Ok(ItemHandle::new(Arc::new(copy)))
    }

    /// Fetch and update the expiry in one step.
    pub fn get_and_touch(&self, key: &[u8], new_exptime: u32) -> Result<ItemHandle> {
        let mut inner = self.inner.lock();
        let item = self.lookup_live(&mut inner, key)?;
        if item.is_zombie() {
            return Err(EngineError::NoSuchKey);
        }
        if item.is_locked(self.clock.now()) {
            return Err(EngineError::Locked);
        }
        item.set_exptime(new_exptime);
        inner.lru.promote(&item);
        Ok(ItemHandle::new(item))
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Store `new` under `op` semantics. Returns the freshly assigned CAS.
    ///
    /// A `Set` carrying a concrete CAS behaves as `Cas`; a `Cas` with the
    /// wildcard behaves as `Set` (wire-level convention, resolved here once).
    pub fn store(
        &self,
        new: NewItem,
        cas_token: CasToken,
        op: StoreOp,
        state: DocState,
    ) -> Result<u64> {
        let op = match (op, cas_token) {
            (StoreOp::Set, CasToken::Exact(_)) => StoreOp::Cas,
            (StoreOp::Cas, CasToken::Any) => StoreOp::Set,
            (other, _) => other,
        };

        let mut inner = self.inner.lock();
        let now = self.clock.now();
        let oldest = self.oldest_live();

        let existing = match inner.hash.get(new.key()) {
            Some(it) if it.is_expired(now, oldest) => {
                self.unlink_item_locked(&mut inner, &it);
                self.stats.add_reclaimed();
                None
            }
            other => other,
        };

        // Only the exact current CAS may touch a locked document; the
        // wildcard does not bypass a lock.
        if let Some(it) = &existing {
            if !it.is_zombie() && it.is_locked(now) {
                let owns = matches!(cas_token, CasToken::Exact(c) if c == it.cas());
                if !owns {
                    return Err(EngineError::Locked);
                }
            }
        }

        match op {
            StoreOp::Add => {
                if existing.as_ref().map_or(false, |it| !it.is_zombie()) {
                    return Err(EngineError::KeyExists);
                }
            }
            StoreOp::Replace => match &existing {
                Some(it) if !it.is_zombie() => {}
                _ => return Err(EngineError::NoSuchKey),
            },
            StoreOp::Cas => {
                let it = existing.as_ref().ok_or(EngineError::NoSuchKey)?;
                if !cas_token.matches(it.cas()) {
                    return Err(EngineError::KeyExists);
                }
            }
            StoreOp::Set => {}
            StoreOp::Append | StoreOp::Prepend => {
                let it = match &existing {
                    Some(it) if !it.is_zombie() => Arc::clone(it),
                    _ => return Err(EngineError::NoSuchKey),
                };
                if let CasToken::Exact(c) = cas_token {
                    if c != it.cas() {
                        return Err(EngineError::KeyExists);
                    }
                }
                return self.concat_locked(&mut inner, &it, new, op, now);
            }
        }

        if state == DocState::Deleted && !self.keep_deleted {
            // Delete without tombstone retention: drop the document instead
            // of linking a zombie.
            if let Some(it) = existing {
                self.unlink_item_locked(&mut inner, &it);
            }
            return Ok(self.next_cas());
        }

        let (key, value, flags, datatype, exptime, chunk) = new.into_parts();
        let item = Arc::new(Item::new(key, value, flags, datatype, exptime, chunk));
        let cas = self.next_cas();
        item.set_cas(cas);
        item.mark_linked(state, now);
        self.link_item_locked(&mut inner, item);
        Ok(cas)
    }

    /// Append/prepend: build the combined document in a fresh (possibly
    /// larger) slab class and swap it in atomically. The original document
    /// keeps its flags, datatype and expiry; failure leaves it untouched.
    fn concat_locked(
        &self,
        inner: &mut ItemsInner,
        old: &Arc<Item>,
        new: NewItem,
        op: StoreOp,
        now: u32,
    ) -> Result<u64> {
        let combined_len = old.value().len() + new.value().len();
        if combined_len > self.item_size_max {
            return Err(EngineError::TooBig);
        }
        let ntotal = std::mem::size_of::<Item>() + old.key().len() + combined_len;
        let class = self.slabs.class_of(ntotal).ok_or(EngineError::TooBig)?;

        let mut chunk = None;
        for _ in 0..EVICTION_ATTEMPTS {
            match self.slabs.alloc_class(class) {
                Ok(c) => {
                    chunk = Some(c);
                    break;
                }
                Err(EngineError::NoMemory) if self.evict_to_free => {
                    if !self.evict_one_locked(inner, class) {
                        return Err(EngineError::NoMemory);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        let chunk = chunk.ok_or(EngineError::NoMemory)?;

        let mut value = Vec::with_capacity(combined_len);
        match op {
            StoreOp::Append => {
                value.extend_from_slice(old.value());
                value.extend_from_slice(new.value());
            }
            StoreOp::Prepend => {
                value.extend_from_slice(new.value());
                value.extend_from_slice(old.value());
            }
            _ => return Err(EngineError::Failed),
        }

        let item = Arc::new(Item::new(
            old.key().to_vec().into_boxed_slice(),
            value.into_boxed_slice(),
            old.flags(),
            old.datatype(),
            old.exptime(),
            chunk,
        ));
        let cas = self.next_cas();
        item.set_cas(cas);
        item.mark_linked(DocState::Alive, now);
        self.link_item_locked(inner, item);
        Ok(cas)
    }

    /// Delete as a store-of-tombstone with a CAS race-retry loop for the
    /// wildcard caller.
    pub fn delete(&self, key: &[u8], cas_token: CasToken) -> Result<MutationResult> {
        loop {
            let (cur_cas, flags, exptime, datatype) = {
                let mut inner = self.inner.lock();
                let item = self.lookup_live(&mut inner, key)?;
                if item.is_zombie() {
                    return Err(EngineError::NoSuchKey);
                }
                let now = self.clock.now();
                if item.is_locked(now) {
                    let owns = matches!(cas_token, CasToken::Exact(c) if c == item.cas());
                    if !owns {
                        return Err(EngineError::Locked);
                    }
                }
                (item.cas(), item.flags(), item.exptime(), item.datatype())
            };

            let tomb_cas = match cas_token {
                CasToken::Any => cur_cas,
                CasToken::Exact(c) => c,
            };
            let mut tomb = match self.alloc_item(key, 0, flags, datatype, exptime, 0) {
                Ok(t) => t,
                // Tombstone allocation shortfalls surface as transient.
                Err(_) => return Err(EngineError::TemporaryFailure),
            };
            tomb.set_cas(tomb_cas);

            match self.store(
                tomb,
                CasToken::Exact(tomb_cas),
                StoreOp::Cas,
                DocState::Deleted,
            ) {
                Ok(cas) => {
                    return Ok(MutationResult {
                        cas,
                        vbucket_uuid: ENGINE_VBUCKET_UUID,
                        seqno: 0,
                    })
                }
                // Retry races only for the wildcard caller.
                Err(EngineError::KeyExists) if cas_token == CasToken::Any => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Clear a lock iff the caller knows the current CAS.
    pub fn unlock(&self, key: &[u8], cas: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        let item = self.lookup_live(&mut inner, key)?;
        if item.is_zombie() {
            return Err(EngineError::NoSuchKey);
        }
        if !item.is_locked(self.clock.now()) {
            return Err(EngineError::NotLocked);
        }
        if item.cas() != cas {
            return Err(EngineError::KeyExists);
        }
        item.set_locktime(0);
        Ok(())
    }

    /// Expire everything stored before now and sweep the table.
    pub fn flush_expired(&self) {
        let now = self.clock.now();
        self.oldest_live.store(now, Ordering::Relaxed);
        let oldest = self.oldest_live();

        let mut inner = self.inner.lock();
        let mut snapshot = Vec::new();
        for b in 0..inner.hash.bucket_count() {
            snapshot.extend(inner.hash.collect_bucket(b));
        }
        let mut swept = 0u64;
        for item in snapshot {
            if item.is_expired(now, oldest) {
                self.unlink_item_locked(&mut inner, &item);
                swept += 1;
            }
        }
        log::debug!("[ItemStore::flush_expired] swept {} items", swept);
    }

    /// One bounded scrub slice: visit buckets `start..start+max`, unlinking
    /// expired and zombie items nobody holds. Returns the next start index,
    /// or `None` when the table has been fully visited.
    pub fn scrub_chunk(&self, start: usize, max: usize) -> (u64, u64, Option<usize>) {
        let mut inner = self.inner.lock();
        let now = self.clock.now();
        let oldest = self.oldest_live();
        let end = (start + max).min(inner.hash.bucket_count());

        let mut snapshot = Vec::new();
        for b in start..end {
            snapshot.extend(inner.hash.collect_bucket(b));
        }

        let mut visited = 0u64;
        let mut cleaned = 0u64;
        for item in snapshot {
            visited += 1;
            if !item.is_linked() || item.external_refs() > 0 {
                continue;
            }
            if item.is_zombie() || item.is_expired(now, oldest) {
                self.unlink_item_locked(&mut inner, &item);
                cleaned += 1;
            }
        }
        let next = if end >= inner.hash.bucket_count() {
            None
        } else {
            Some(end)
        };
        (visited, cleaned, next)
    }

    // ------------------------------------------------------------------
    // Stat readouts
    // ------------------------------------------------------------------

    /// Per-class linked item counters for `stats items`.
    pub fn class_item_stats<F: FnMut(u8, usize, Option<u32>)>(&self, mut f: F) {
        let inner = self.inner.lock();
        let now = self.clock.now();
        for class in 0..inner.lru.class_count() {
            let len = inner.lru.len(class as u8);
            if len > 0 {
                f(class as u8, len, inner.lru.tail_age(class as u8, now));
            }
        }
    }

    /// Item size histogram (32-byte buckets) for `stats sizes`.
    pub fn size_histogram<F: FnMut(usize, u64)>(&self, mut f: F) {
        let inner = self.inner.lock();
        let mut histogram = std::collections::BTreeMap::new();
        for b in 0..inner.hash.bucket_count() {
            for item in inner.hash.collect_bucket(b) {
                let bucket = (item.ntotal() / 32) * 32;
                *histogram.entry(bucket).or_insert(0u64) += 1;
            }
        }
        for (size, count) in histogram {
            f(size, count);
        }
    }

    /// Linked item count (tombstones included).
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().hash.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
