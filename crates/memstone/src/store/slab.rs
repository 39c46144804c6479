// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Size-classed slab allocator.
//!
//! Chunk sizes grow geometrically from `chunk_size` by `factor` until they
//! cover the largest possible item. Each class hands out fixed-size chunk
//! reservations carved page-by-page from a global byte pool; freed chunks go
//! back on the class free list and are never returned to the pool (or the
//! OS) at runtime. Reclamation happens only through item eviction.
//!
//! The payload bytes of an item live in the item itself; a chunk reservation
//! is the admission ticket that bounds total memory to `cache_size` and
//! drives the per-class statistics.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{EngineError, Result};

/// Bytes carved from the pool at a time (one slab page).
pub const PAGE_SIZE: usize = 1024 * 1024;

/// Upper bound on the number of size classes.
pub const MAX_CLASSES: usize = 64;

/// Point-in-time view of one slab class, for `stats slabs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassStats {
    pub chunk_size: usize,
    pub chunks_per_page: usize,
    pub pages: usize,
    pub in_use: usize,
    pub free: usize,
}

struct SlabClass {
    chunk_size: usize,
    chunks_per_page: usize,
    /// Slot ids previously handed out and returned.
    free: Vec<u32>,
    /// Next never-used slot id (slots below this are either free or in use).
    next_slot: u32,
    pages: usize,
    in_use: usize,
}

impl SlabClass {
    fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            chunks_per_page: (PAGE_SIZE / chunk_size).max(1),
            free: Vec::new(),
            next_slot: 0,
            pages: 0,
            in_use: 0,
        }
    }

    fn page_bytes(&self) -> usize {
        self.chunks_per_page * self.chunk_size
    }

    fn stats(&self) -> ClassStats {
        ClassStats {
            chunk_size: self.chunk_size,
            chunks_per_page: self.chunks_per_page,
            pages: self.pages,
            in_use: self.in_use,
            free: self.pages * self.chunks_per_page - self.in_use,
        }
    }
}

struct SlabInner {
    classes: Vec<SlabClass>,
    pool_remaining: usize,
}

/// The per-bucket slab allocator. One mutex covers the class free lists and
/// page carving; allocation is O(1) amortized.
pub struct SlabAllocator {
    chunk_sizes: Vec<usize>,
    pool_size: usize,
    inner: Mutex<SlabInner>,
}

impl SlabAllocator {
    /// Build the class table.
    ///
    /// `max_chunk` must cover the largest storable item (value cap plus key
    /// and item overhead); the final class is exactly that size so a
    /// maximum-sized value always has a home.
    pub fn new(cache_size: usize, chunk_size: usize, factor: f64, max_chunk: usize) -> Self {
        let mut sizes = Vec::new();
        let mut size = align8(chunk_size.max(48));
        while size < max_chunk && sizes.len() < MAX_CLASSES - 1 {
            sizes.push(size);
            let next = align8((size as f64 * factor) as usize);
            size = next.max(size + 8);
        }
        sizes.push(align8(max_chunk));

        let classes = sizes.iter().map(|&s| SlabClass::new(s)).collect();
        Self {
            chunk_sizes: sizes,
            pool_size: cache_size,
            inner: Mutex::new(SlabInner {
                classes,
                pool_remaining: cache_size,
            }),
        }
    }

    /// Number of size classes.
    #[must_use]
    pub fn class_count(&self) -> usize {
        self.chunk_sizes.len()
    }

    /// Chunk size of a class.
    #[must_use]
    pub fn chunk_size(&self, class: u8) -> usize {
        self.chunk_sizes[usize::from(class)]
    }

    /// Total pool budget in bytes.
    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Bytes carved from the pool so far.
    #[must_use]
    pub fn pool_allocated(&self) -> usize {
        self.pool_size - self.inner.lock().pool_remaining
    }

    /// Smallest class whose chunk size covers `ntotal`, or `None` when the
    /// item exceeds the largest class.
    #[must_use]
    pub fn class_of(&self, ntotal: usize) -> Option<u8> {
        self.chunk_sizes
            .iter()
            .position(|&s| s >= ntotal)
            .map(|i| i as u8)
    }

    /// Reserve one chunk from `class`.
    ///
    /// Pops the class free list, carving a fresh page from the pool when the
    /// list is empty. Fails with `NoMemory` when the pool cannot fit another
    /// page; eviction is the item store's business, not ours.
    pub fn alloc_class(self: &Arc<Self>, class: u8) -> Result<ChunkGuard> {
        let slot = {
            let mut inner = self.inner.lock();
            let cls = &mut inner.classes[usize::from(class)];
            if let Some(slot) = cls.free.pop() {
                cls.in_use += 1;
                slot
            } else {
                let page_bytes = cls.page_bytes();
                if inner.pool_remaining < page_bytes {
                    return Err(EngineError::NoMemory);
                }
                inner.pool_remaining -= page_bytes;
                let cls = &mut inner.classes[usize::from(class)];
                cls.pages += 1;
                let base = cls.next_slot;
                cls.next_slot += cls.chunks_per_page as u32;
                // Hand out the first new slot, queue the rest.
                for s in (base + 1..cls.next_slot).rev() {
                    cls.free.push(s);
                }
                cls.in_use += 1;
                base
            }
        };
        Ok(ChunkGuard {
            slabs: Arc::clone(self),
            class,
            slot,
        })
    }

    /// Reserve a chunk for an item of `ntotal` bytes.
    pub fn alloc(self: &Arc<Self>, ntotal: usize) -> Result<ChunkGuard> {
        let class = self.class_of(ntotal).ok_or(EngineError::TooBig)?;
        self.alloc_class(class)
    }

    fn free(&self, class: u8, slot: u32) {
        let mut inner = self.inner.lock();
        let cls = &mut inner.classes[usize::from(class)];
        debug_assert!(cls.in_use > 0, "free without matching alloc");
        cls.in_use -= 1;
        cls.free.push(slot);
    }

    /// Eagerly carve one page for every class, stopping when the pool runs
    /// out. Boot-time option; pointless (and skipped) afterwards.
    pub fn preallocate(&self) {
        let mut inner = self.inner.lock();
        for idx in 0..inner.classes.len() {
            let page_bytes = inner.classes[idx].page_bytes();
            if inner.pool_remaining < page_bytes {
                log::debug!(
                    "[SlabAllocator::preallocate] pool exhausted at class {}",
                    idx
                );
                break;
            }
            inner.pool_remaining -= page_bytes;
            let cls = &mut inner.classes[idx];
            cls.pages += 1;
            let base = cls.next_slot;
            cls.next_slot += cls.chunks_per_page as u32;
            for s in (base..cls.next_slot).rev() {
                cls.free.push(s);
            }
        }
    }

    /// Visit a snapshot of every class's counters.
    pub fn for_each_class<F: FnMut(u8, ClassStats)>(&self, mut f: F) {
        let inner = self.inner.lock();
        for (idx, cls) in inner.classes.iter().enumerate() {
            f(idx as u8, cls.stats());
        }
    }
}

/// RAII chunk reservation. Returning the chunk to its class free list on
/// drop keeps alloc/free perfectly paired no matter which path drops an
/// item.
pub struct ChunkGuard {
    slabs: Arc<SlabAllocator>,
    class: u8,
    slot: u32,
}

impl ChunkGuard {
    /// The size class this chunk belongs to.
    #[must_use]
    pub fn class(&self) -> u8 {
        self.class
    }

    /// Chunk size of the owning class.
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.slabs.chunk_size(self.class)
    }
}

impl std::fmt::Debug for ChunkGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkGuard")
            .field("class", &self.class)
            .field("slot", &self.slot)
            .finish()
    }
}

impl Drop for ChunkGuard {
    fn drop(&mut self) {
        self.slabs.free(self.class, self.slot);
    }
}

fn align8(n: usize) -> usize {
    (n + 7) & !7
}
