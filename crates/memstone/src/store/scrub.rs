// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Background scrubber.
//!
//! One reclamation pass per request: visit every hash bucket and unlink
//! expired or zombie items nobody holds. The pass runs on a background
//! worker in bounded slices so the items lock is never held for long; a
//! second start request while a pass is running is refused.
//!
//! The scrubber's own lock is never held together with any other engine
//! lock: the store takes the items lock inside `scrub_chunk`, strictly after
//! the scrubber state has been updated.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::ItemStore;

/// Hash buckets visited per slice (one items-lock acquisition each).
const SCRUB_SLICE_BUCKETS: usize = 64;

/// Progress counters of the most recent pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScrubStats {
    pub visited: u64,
    pub cleaned: u64,
    /// Rel-time the pass started (0 = never ran).
    pub started: u32,
    /// Rel-time the pass finished (0 = running or never ran).
    pub stopped: u32,
}

/// Scrubber status shared between the facade and the background pass.
#[derive(Debug, Default)]
pub struct Scrubber {
    running: AtomicBool,
    state: Mutex<ScrubStats>,
}

impl Scrubber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the singleton pass. Returns false when one is already running.
    pub fn try_begin(&self, now: u32) -> bool {
        if self.running.swap(true, Ordering::AcqRel) {
            return false;
        }
        let mut state = self.state.lock();
        *state = ScrubStats {
            visited: 0,
            cleaned: 0,
            started: now,
            stopped: 0,
        };
        true
    }

    pub fn record(&self, visited: u64, cleaned: u64) {
        let mut state = self.state.lock();
        state.visited += visited;
        state.cleaned += cleaned;
    }

    pub fn finish(&self, now: u32) {
        {
            let mut state = self.state.lock();
            state.stopped = now;
        }
        self.running.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn snapshot(&self) -> ScrubStats {
        *self.state.lock()
    }
}

/// Drive one full pass over the store in bounded slices.
///
/// `shutdown` aborts between slices so engine teardown never waits on a
/// long table walk.
pub fn run_pass(store: &ItemStore, scrubber: &Scrubber, shutdown: &Arc<AtomicBool>, now: impl Fn() -> u32) {
    let mut start = 0usize;
    loop {
        if shutdown.load(Ordering::Acquire) {
            log::debug!("[Scrubber] pass aborted by shutdown");
            break;
        }
        let (visited, cleaned, next) = store.scrub_chunk(start, SCRUB_SLICE_BUCKETS);
        scrubber.record(visited, cleaned);
        match next {
            Some(n) => start = n,
            None => break,
        }
    }
    scrubber.finish(now());
    let stats = scrubber.snapshot();
    log::info!(
        "[Scrubber] pass complete: visited {} cleaned {}",
        stats.visited,
        stats.cleaned
    );
}
