// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Engine facade: the public operation surface of one bucket.
//!
//! Validates arguments, applies the vbucket gate, and forwards into the
//! item store. The capability set the host programs against is the
//! [`KvEngine`] trait; [`Engine`] is the concrete in-memory implementation.
//!
//! Gate policy: every key operation goes through the vbucket gate,
//! `get_locked` and `unlock` included.

pub mod stats;
pub mod vbucket;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::clock::EngineClock;
use crate::config::EngineConfig;
use crate::dcp::DcpConsumer;
use crate::error::{EngineError, Result};
use crate::store::item::{
    CasToken, Datatype, DocState, DocStateFilter, ItemHandle, ItemInfo, MutationResult, NewItem,
    StoreOp, ENGINE_VBUCKET_UUID, LOCKED_CAS_MASK,
};
use crate::store::scrub::{self, Scrubber};
use crate::store::slab::SlabAllocator;
use crate::store::{max_chunk_for, ItemStore};
use crate::tasks::TaskPool;

use stats::{fmt_u64, EngineStats};
use vbucket::{VBucketMap, VBucketState};

/// Lock timeout clamp (seconds).
const LOCK_TIMEOUT_DEFAULT: u32 = 15;
const LOCK_TIMEOUT_MAX: u32 = 30;

/// Management commands reaching the engine through the generic command
/// opcode. The wire parser lives in the host; the engine sees typed
/// commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagementCommand<'a> {
    StartScrub,
    DeleteVbucket(u16),
    SetVbucketState(u16, VBucketState),
    GetVbucketState(u16),
    SetParam { key: &'a str, value: &'a str },
}

/// Reply for [`ManagementCommand`]s that carry data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagementResponse {
    Done,
    VbucketState(VBucketState),
}

/// The engine capability set: what a host server may ask of a bucket.
pub trait KvEngine: Send + Sync {
    fn allocate(
        &self,
        key: &[u8],
        nbytes: usize,
        flags: u32,
        exptime: u32,
        datatype: Datatype,
        vbid: u16,
    ) -> Result<NewItem>;

    fn store(&self, item: NewItem, cas: CasToken, op: StoreOp, state: DocState) -> Result<u64>;

    /// Store gated on a predicate over the existing document (or absence).
    fn store_if(
        &self,
        item: NewItem,
        cas: CasToken,
        op: StoreOp,
        predicate: &dyn Fn(Option<&ItemInfo>) -> bool,
        state: DocState,
    ) -> Result<u64>;

    fn get(&self, key: &[u8], vbid: u16, filter: DocStateFilter) -> Result<ItemHandle>;

    /// Fetch an alive document and hand it over only when `predicate`
    /// approves its metadata; `Ok(None)` when it vetoed.
    fn get_if(
        &self,
        key: &[u8],
        vbid: u16,
        predicate: &dyn Fn(&ItemInfo) -> bool,
    ) -> Result<Option<ItemHandle>>;

    fn get_and_touch(&self, key: &[u8], vbid: u16, exptime: u32) -> Result<ItemHandle>;

    fn get_locked(&self, key: &[u8], vbid: u16, lock_timeout: u32) -> Result<ItemHandle>;

    fn get_meta(&self, key: &[u8], vbid: u16) -> Result<ItemInfo>;

    fn delete(&self, key: &[u8], cas: CasToken, vbid: u16) -> Result<MutationResult>;

    fn unlock(&self, key: &[u8], vbid: u16, cas: u64) -> Result<()>;

    fn flush(&self) -> Result<()>;

    fn get_stats(&self, key: &str, add_stat: &mut dyn FnMut(&str, &str)) -> Result<()>;

    fn reset_stats(&self);

    fn set_vbucket_state(&self, vbid: u16, state: VBucketState) -> Result<()>;

    fn get_vbucket_state(&self, vbid: u16) -> VBucketState;

    fn unknown_command(&self, command: ManagementCommand<'_>) -> Result<ManagementResponse>;

    /// Metadata snapshot with the CAS masked for locked documents.
    fn item_info(&self, item: &ItemHandle) -> ItemInfo;

    fn is_xattr_enabled(&self) -> bool;

    /// Unwind background work. With `force` the engine does not wait for
    /// in-flight passes to finish naturally.
    fn destroy(&self, force: bool);
}

/// The in-memory bucket engine.
pub struct Engine {
    config: EngineConfig,
    clock: Arc<EngineClock>,
    slabs: Arc<SlabAllocator>,
    store: Arc<ItemStore>,
    vbuckets: VBucketMap,
    stats: Arc<EngineStats>,
    scrubber: Arc<Scrubber>,
    tasks: Arc<TaskPool>,
    consumers: Mutex<Vec<Weak<DcpConsumer>>>,
    xattr_enabled: AtomicBool,
    shutdown: Arc<AtomicBool>,
}

impl Engine {
    /// Build a bucket from a parsed configuration. The task pool is owned
    /// by the engine manager and shared between buckets.
    pub fn new(config: EngineConfig, tasks: Arc<TaskPool>) -> Arc<Self> {
        let clock = Arc::new(EngineClock::new());
        let stats = Arc::new(EngineStats::new());
        let slabs = Arc::new(SlabAllocator::new(
            config.cache_size,
            config.chunk_size,
            config.factor,
            max_chunk_for(config.item_size_max),
        ));
        if config.preallocate {
            slabs.preallocate();
        }
        let store = Arc::new(ItemStore::new(
            Arc::clone(&slabs),
            Arc::clone(&stats),
            Arc::clone(&clock),
            &config,
        ));
        let vbuckets = VBucketMap::new(config.ignore_vbucket);
        if config.vb0 {
            vbuckets.set_state(0, VBucketState::Active);
        }
        let xattr_enabled = AtomicBool::new(config.xattr_enabled);
        log::info!(
            "[Engine] bucket up: cache_size={} chunk_size={} factor={} item_size_max={}",
            config.cache_size,
            config.chunk_size,
            config.factor,
            config.item_size_max
        );
        Arc::new(Self {
            config,
            clock,
            slabs,
            store,
            vbuckets,
            stats,
            scrubber: Arc::new(Scrubber::new()),
            tasks,
            consumers: Mutex::new(Vec::new()),
            xattr_enabled,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Parse a `key=value;...` config string and build the bucket.
    pub fn from_config_str(cfg: &str, tasks: Arc<TaskPool>) -> Result<Arc<Self>> {
        match EngineConfig::parse(cfg) {
            Ok(config) => Ok(Self::new(config, tasks)),
            Err(e) => {
                log::warn!("[Engine] bad configuration: {}", e);
                Err(EngineError::Failed)
            }
        }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<EngineClock> {
        &self.clock
    }

    pub(crate) fn item_store(&self) -> &ItemStore {
        &self.store
    }

    pub(crate) fn tasks(&self) -> &Arc<TaskPool> {
        &self.tasks
    }

    fn gate(&self, vbid: u16) -> Result<()> {
        if self.vbuckets.admits(vbid) {
            Ok(())
        } else {
            Err(EngineError::NotMyVbucket)
        }
    }

    // ------------------------------------------------------------------
    // Replication plumbing
    // ------------------------------------------------------------------

    pub(crate) fn register_consumer(&self, consumer: Weak<DcpConsumer>) {
        self.consumers.lock().push(consumer);
    }

    fn notify_vbucket_state(&self, vbid: u16, state: VBucketState) {
        let mut consumers = self.consumers.lock();
        consumers.retain(|weak| match weak.upgrade() {
            Some(consumer) => {
                consumer.vbucket_state_changed(vbid, state);
                true
            }
            None => false,
        });
    }

    /// Peer-demanded rollback. This engine is volatile: rolling back to
    /// seqno 0 empties the bucket, anything else cannot be honored.
    pub fn rollback_vbucket(&self, vbid: u16, seqno: u64) -> Result<()> {
        if seqno == 0 {
            log::info!("[Engine] rollback vb {} to 0: resetting bucket", vbid);
            self.store.flush_expired();
            Ok(())
        } else {
            Err(EngineError::Rollback(seqno))
        }
    }

    /// Kick off the background scrub pass. `Busy` while one is running.
    pub fn start_scrub(&self) -> Result<()> {
        let now = self.clock.now();
        if !self.scrubber.try_begin(now) {
            return Err(EngineError::Busy);
        }
        let store = Arc::clone(&self.store);
        let scrubber = Arc::clone(&self.scrubber);
        let shutdown = Arc::clone(&self.shutdown);
        let clock = Arc::clone(&self.clock);
        self.tasks.spawn(move || {
            scrub::run_pass(&store, &scrubber, &shutdown, || clock.now());
        });
        Ok(())
    }

    #[must_use]
    pub fn is_scrub_running(&self) -> bool {
        self.scrubber.is_running()
    }

    // ------------------------------------------------------------------
    // Stats emission
    // ------------------------------------------------------------------

    fn emit_global_stats(&self, add_stat: &mut dyn FnMut(&str, &str)) {
        let mut buf = [0u8; 20];
        add_stat("evictions", fmt_u64(&mut buf, self.stats.evictions()));
        let mut buf = [0u8; 20];
        add_stat("curr_items", fmt_u64(&mut buf, self.stats.curr_items()));
        let mut buf = [0u8; 20];
        add_stat("total_items", fmt_u64(&mut buf, self.stats.total_items()));
        let mut buf = [0u8; 20];
        add_stat("bytes", fmt_u64(&mut buf, self.stats.curr_bytes()));
        let mut buf = [0u8; 20];
        add_stat("reclaimed", fmt_u64(&mut buf, self.stats.reclaimed()));
        let mut buf = [0u8; 20];
        add_stat(
            "engine_maxbytes",
            fmt_u64(&mut buf, self.config.cache_size as u64),
        );
    }

    fn emit_slab_stats(&self, add_stat: &mut dyn FnMut(&str, &str)) {
        let mut active = 0u64;
        self.slabs.for_each_class(|class, cls| {
            if cls.pages > 0 {
                active += 1;
            }
            let mut buf = [0u8; 20];
            add_stat(
                &format!("{}:chunk_size", class),
                fmt_u64(&mut buf, cls.chunk_size as u64),
            );
            let mut buf = [0u8; 20];
            add_stat(
                &format!("{}:chunks_per_page", class),
                fmt_u64(&mut buf, cls.chunks_per_page as u64),
            );
            let mut buf = [0u8; 20];
            add_stat(
                &format!("{}:total_pages", class),
                fmt_u64(&mut buf, cls.pages as u64),
            );
            let mut buf = [0u8; 20];
            add_stat(
                &format!("{}:used_chunks", class),
                fmt_u64(&mut buf, cls.in_use as u64),
            );
            let mut buf = [0u8; 20];
            add_stat(
                &format!("{}:free_chunks", class),
                fmt_u64(&mut buf, cls.free as u64),
            );
        });
        let mut buf = [0u8; 20];
        add_stat("active_slabs", fmt_u64(&mut buf, active));
        let mut buf = [0u8; 20];
        add_stat(
            "total_malloced",
            fmt_u64(&mut buf, self.slabs.pool_allocated() as u64),
        );
    }

    fn emit_item_stats(&self, add_stat: &mut dyn FnMut(&str, &str)) {
        self.store.class_item_stats(|class, number, age| {
            let mut buf = [0u8; 20];
            add_stat(
                &format!("items:{}:number", class),
                fmt_u64(&mut buf, number as u64),
            );
            if let Some(age) = age {
                let mut buf = [0u8; 20];
                add_stat(
                    &format!("items:{}:age", class),
                    fmt_u64(&mut buf, u64::from(age)),
                );
            }
        });
    }

    fn emit_size_stats(&self, add_stat: &mut dyn FnMut(&str, &str)) {
        self.store.size_histogram(|size, count| {
            let mut name_buf = [0u8; 20];
            let mut value_buf = [0u8; 20];
            let name = fmt_u64(&mut name_buf, size as u64);
            add_stat(name, fmt_u64(&mut value_buf, count));
        });
    }

    fn emit_scrub_stats(&self, add_stat: &mut dyn FnMut(&str, &str)) {
        let running = self.scrubber.is_running();
        add_stat(
            "scrubber:status",
            if running { "running" } else { "stopped" },
        );
        let snapshot = self.scrubber.snapshot();
        if snapshot.started != 0 {
            if snapshot.stopped != 0 {
                let mut buf = [0u8; 20];
                add_stat(
                    "scrubber:last_run",
                    fmt_u64(
                        &mut buf,
                        u64::from(snapshot.stopped.saturating_sub(snapshot.started)),
                    ),
                );
            }
            let mut buf = [0u8; 20];
            add_stat("scrubber:visited", fmt_u64(&mut buf, snapshot.visited));
            let mut buf = [0u8; 20];
            add_stat("scrubber:cleaned", fmt_u64(&mut buf, snapshot.cleaned));
        }
    }
}

impl KvEngine for Engine {
    fn allocate(
        &self,
        key: &[u8],
        nbytes: usize,
        flags: u32,
        exptime: u32,
        datatype: Datatype,
        vbid: u16,
    ) -> Result<NewItem> {
        self.gate(vbid)?;
        self.store.alloc_item(
            key,
            nbytes,
            flags,
            datatype,
            self.clock.realtime(exptime),
            vbid,
        )
    }

    fn store(&self, item: NewItem, cas: CasToken, op: StoreOp, state: DocState) -> Result<u64> {
        self.gate(item.vbid())?;
        self.store.store(item, cas, op, state)
    }

    fn store_if(
        &self,
        item: NewItem,
        cas: CasToken,
        op: StoreOp,
        predicate: &dyn Fn(Option<&ItemInfo>) -> bool,
        state: DocState,
    ) -> Result<u64> {
        self.gate(item.vbid())?;
        let existing = match self.store.get(item.key(), DocStateFilter::Alive, false) {
            Ok(handle) => Some(self.item_info(&handle)),
            Err(EngineError::NoSuchKey) => None,
            Err(e) => return Err(e),
        };
        if !predicate(existing.as_ref()) {
            return Err(EngineError::PredicateFailed);
        }
        self.store.store(item, cas, op, state)
    }

    fn get(&self, key: &[u8], vbid: u16, filter: DocStateFilter) -> Result<ItemHandle> {
        self.gate(vbid)?;
        self.store.get(key, filter, true)
    }

    fn get_if(
        &self,
        key: &[u8],
        vbid: u16,
        predicate: &dyn Fn(&ItemInfo) -> bool,
    ) -> Result<Option<ItemHandle>> {
        self.gate(vbid)?;
        let handle = self.store.get(key, DocStateFilter::Alive, true)?;
        let info = self.item_info(&handle);
        if predicate(&info) {
            Ok(Some(handle))
        } else {
            Ok(None)
        }
    }

    fn get_and_touch(&self, key: &[u8], vbid: u16, exptime: u32) -> Result<ItemHandle> {
        self.gate(vbid)?;
        self.store
            .get_and_touch(key, self.clock.realtime(exptime))
    }

    fn get_locked(&self, key: &[u8], vbid: u16, lock_timeout: u32) -> Result<ItemHandle> {
        self.gate(vbid)?;
        let timeout = if lock_timeout == 0 || lock_timeout > LOCK_TIMEOUT_MAX {
            LOCK_TIMEOUT_DEFAULT
        } else {
            lock_timeout
        };
        let until = self.clock.now() + timeout;
        self.store.get_locked(key, until)
    }

    fn get_meta(&self, key: &[u8], vbid: u16) -> Result<ItemInfo> {
        self.gate(vbid)?;
        let handle = self.store.get(key, DocStateFilter::AliveOrDeleted, false)?;
        Ok(self.item_info(&handle))
    }

    fn delete(&self, key: &[u8], cas: CasToken, vbid: u16) -> Result<MutationResult> {
        self.gate(vbid)?;
        self.store.delete(key, cas)
    }

    fn unlock(&self, key: &[u8], vbid: u16, cas: u64) -> Result<()> {
        self.gate(vbid)?;
        self.store.unlock(key, cas)
    }

    fn flush(&self) -> Result<()> {
        self.store.flush_expired();
        Ok(())
    }

    fn get_stats(&self, key: &str, add_stat: &mut dyn FnMut(&str, &str)) -> Result<()> {
        match key {
            "" => self.emit_global_stats(add_stat),
            "slabs" => self.emit_slab_stats(add_stat),
            "items" => self.emit_item_stats(add_stat),
            "sizes" => self.emit_size_stats(add_stat),
            "uuid" => add_stat("uuid", self.config.uuid.as_deref().unwrap_or("")),
            "scrub" => self.emit_scrub_stats(add_stat),
            _ => return Err(EngineError::NoSuchKey),
        }
        Ok(())
    }

    fn reset_stats(&self) {
        self.stats.reset();
    }

    fn set_vbucket_state(&self, vbid: u16, state: VBucketState) -> Result<()> {
        if !self.vbuckets.set_state(vbid, state) {
            return Err(EngineError::NotMyVbucket);
        }
        log::info!("[Engine] vb {} -> {}", vbid, state.name());
        self.notify_vbucket_state(vbid, state);
        Ok(())
    }

    fn get_vbucket_state(&self, vbid: u16) -> VBucketState {
        self.vbuckets.state(vbid)
    }

    fn unknown_command(&self, command: ManagementCommand<'_>) -> Result<ManagementResponse> {
        match command {
            ManagementCommand::StartScrub => {
                self.start_scrub()?;
                Ok(ManagementResponse::Done)
            }
            ManagementCommand::DeleteVbucket(vbid) => {
                self.set_vbucket_state(vbid, VBucketState::Dead)?;
                Ok(ManagementResponse::Done)
            }
            ManagementCommand::SetVbucketState(vbid, state) => {
                self.set_vbucket_state(vbid, state)?;
                Ok(ManagementResponse::Done)
            }
            ManagementCommand::GetVbucketState(vbid) => {
                Ok(ManagementResponse::VbucketState(self.get_vbucket_state(vbid)))
            }
            ManagementCommand::SetParam { key, value } => {
                if key != "xattr_enabled" {
                    return Err(EngineError::UnknownCommand);
                }
                match value {
                    "true" => self.xattr_enabled.store(true, Ordering::Relaxed),
                    "false" => self.xattr_enabled.store(false, Ordering::Relaxed),
                    _ => return Err(EngineError::UnknownCommand),
                }
                Ok(ManagementResponse::Done)
            }
        }
    }

    fn item_info(&self, item: &ItemHandle) -> ItemInfo {
        let inner = item.item();
        let now = self.clock.now();
        // Locked documents hide their CAS from everyone except the lock
        // holder, who got an unlinked copy from get_locked. The mask
        // applies to tombstones the same way.
        let cas = if inner.is_linked() && inner.is_locked(now) {
            LOCKED_CAS_MASK
        } else {
            inner.cas()
        };
        ItemInfo {
            cas,
            vbucket_uuid: ENGINE_VBUCKET_UUID,
            seqno: 0,
            exptime: self.clock.abstime(inner.exptime()),
            nbytes: inner.value().len(),
            flags: inner.flags(),
            datatype: inner.datatype(),
            document_state: inner.document_state(),
        }
    }

    fn is_xattr_enabled(&self) -> bool {
        self.xattr_enabled.load(Ordering::Relaxed)
    }

    fn destroy(&self, force: bool) {
        self.shutdown.store(true, Ordering::Release);
        let consumers = std::mem::take(&mut *self.consumers.lock());
        for weak in consumers {
            if let Some(consumer) = weak.upgrade() {
                consumer.set_disconnect();
            }
        }
        if !force {
            // Give an in-flight scrub pass a moment to observe the flag.
            let deadline = std::time::Instant::now() + std::time::Duration::from_secs(1);
            while self.scrubber.is_running() && std::time::Instant::now() < deadline {
                std::thread::yield_now();
            }
        }
        log::info!("[Engine] destroyed (force={})", force);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(cfg: &str) -> (Arc<Engine>, Arc<TaskPool>) {
        let tasks = TaskPool::new(2);
        let engine = Engine::from_config_str(cfg, Arc::clone(&tasks)).expect("engine");
        (engine, tasks)
    }

    fn put(engine: &Engine, key: &[u8], value: &[u8], vbid: u16) -> Result<u64> {
        let mut item = engine.allocate(key, value.len(), 0, 0, Datatype::RAW, vbid)?;
        item.value_mut().copy_from_slice(value);
        engine.store(item, CasToken::Any, StoreOp::Set, DocState::Alive)
    }

    #[test]
    fn test_vb0_active_by_default() {
        let (engine, tasks) = engine("");
        assert_eq!(engine.get_vbucket_state(0), VBucketState::Active);
        assert_eq!(engine.get_vbucket_state(1), VBucketState::Dead);
        put(&engine, b"k", b"v", 0).expect("vb0 admitted");
        assert_eq!(
            put(&engine, b"k", b"v", 1).unwrap_err(),
            EngineError::NotMyVbucket
        );
        tasks.shutdown();
    }

    #[test]
    fn test_ignore_vbucket_bypasses_gate() {
        let (engine, tasks) = engine("ignore_vbucket=true");
        put(&engine, b"k", b"v", 999).expect("gate disabled");
        tasks.shutdown();
    }

    #[test]
    fn test_gate_applies_to_lock_pair() {
        let (engine, tasks) = engine("");
        assert_eq!(
            engine.get_locked(b"k", 5, 10).unwrap_err(),
            EngineError::NotMyVbucket
        );
        assert_eq!(
            engine.unlock(b"k", 5, 1).unwrap_err(),
            EngineError::NotMyVbucket
        );
        tasks.shutdown();
    }

    #[test]
    fn test_item_info_masks_locked_cas() {
        let (engine, tasks) = engine("");
        put(&engine, b"k", b"v", 0).expect("set");
        let locked = engine.get_locked(b"k", 0, 10).expect("lock");
        assert_ne!(locked.cas(), LOCKED_CAS_MASK, "copy exposes the real cas");
        let info = engine.item_info(&locked);
        assert_ne!(info.cas, LOCKED_CAS_MASK, "unlinked copy is not masked");

        let seen = engine
            .get(b"k", 0, DocStateFilter::Alive)
            .expect("plain get");
        let info = engine.item_info(&seen);
        assert_eq!(info.cas, LOCKED_CAS_MASK, "other readers see the mask");
        tasks.shutdown();
    }

    #[test]
    fn test_get_meta_reads_tombstones() {
        let (engine, tasks) = engine("keep_deleted=true");
        put(&engine, b"k", b"v", 0).expect("set");
        engine.delete(b"k", CasToken::Any, 0).expect("delete");
        let info = engine.get_meta(b"k", 0).expect("tombstone meta");
        assert_eq!(info.document_state, DocState::Deleted);
        assert_eq!(info.nbytes, 0);
        tasks.shutdown();
    }

    #[test]
    fn test_get_if_predicate() {
        let (engine, tasks) = engine("");
        let mut item = engine
            .allocate(b"k", 1, 42, 0, Datatype::RAW, 0)
            .expect("alloc");
        item.value_mut().copy_from_slice(b"v");
        engine
            .store(item, CasToken::Any, StoreOp::Set, DocState::Alive)
            .expect("set");
        let hit = engine
            .get_if(b"k", 0, &|info| info.flags == 42)
            .expect("get_if");
        assert!(hit.is_some());
        let miss = engine
            .get_if(b"k", 0, &|info| info.flags == 7)
            .expect("get_if");
        assert!(miss.is_none(), "predicate veto yields no item");
        tasks.shutdown();
    }

    #[test]
    fn test_store_if_predicate_veto() {
        let (engine, tasks) = engine("");
        put(&engine, b"k", b"v", 0).expect("set");
        let mut item = engine.allocate(b"k", 1, 0, 0, Datatype::RAW, 0).expect("alloc");
        item.value_mut().copy_from_slice(b"w");
        let err = engine
            .store_if(
                item,
                CasToken::Any,
                StoreOp::Set,
                &|existing| existing.is_none(),
                DocState::Alive,
            )
            .unwrap_err();
        assert_eq!(err, EngineError::PredicateFailed);
        tasks.shutdown();
    }

    #[test]
    fn test_unknown_stat_key() {
        let (engine, tasks) = engine("");
        let mut sink = |_: &str, _: &str| {};
        assert_eq!(
            engine.get_stats("bogus", &mut sink).unwrap_err(),
            EngineError::NoSuchKey
        );
        tasks.shutdown();
    }

    #[test]
    fn test_uuid_stat() {
        let (engine, tasks) = engine("uuid=bucket-42");
        let mut seen = None;
        engine
            .get_stats("uuid", &mut |name, value| {
                if name == "uuid" {
                    seen = Some(value.to_string());
                }
            })
            .expect("uuid stats");
        assert_eq!(seen.as_deref(), Some("bucket-42"));
        tasks.shutdown();
    }

    #[test]
    fn test_set_param_xattr() {
        let (engine, tasks) = engine("");
        assert!(engine.is_xattr_enabled());
        engine
            .unknown_command(ManagementCommand::SetParam {
                key: "xattr_enabled",
                value: "false",
            })
            .expect("set_param");
        assert!(!engine.is_xattr_enabled());
        assert_eq!(
            engine
                .unknown_command(ManagementCommand::SetParam {
                    key: "xattr_enabled",
                    value: "sideways",
                })
                .unwrap_err(),
            EngineError::UnknownCommand
        );
        tasks.shutdown();
    }

    #[test]
    fn test_del_vbucket_goes_dead() {
        let (engine, tasks) = engine("");
        engine
            .unknown_command(ManagementCommand::DeleteVbucket(0))
            .expect("del vbucket");
        assert_eq!(engine.get_vbucket_state(0), VBucketState::Dead);
        assert_eq!(
            put(&engine, b"k", b"v", 0).unwrap_err(),
            EngineError::NotMyVbucket
        );
        tasks.shutdown();
    }
}
