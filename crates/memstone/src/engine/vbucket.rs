// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Virtual-bucket state gate.
//!
//! One byte per vbucket id, state in the low two bits, read and written
//! atomically so request workers observe transitions without taking a lock.
//! This engine does not partition data by vbid; the gate is the only
//! vbid-aware element.

use std::sync::atomic::{AtomicU8, Ordering};

/// Number of virtual buckets.
pub const NUM_VBUCKETS: usize = 1024;

const STATE_MASK: u8 = 0b0000_0011;

/// VBucket state. Every vbucket is implicitly dead at startup (the backing
/// byte array is zeroed), which is why `Dead` is the zero encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VBucketState {
    Dead = 0,
    Active = 1,
    Replica = 2,
    Pending = 3,
}

impl VBucketState {
    /// Decode the low bits of a state byte.
    #[must_use]
    pub fn from_bits(bits: u8) -> Self {
        match bits & STATE_MASK {
            1 => VBucketState::Active,
            2 => VBucketState::Replica,
            3 => VBucketState::Pending,
            _ => VBucketState::Dead,
        }
    }

    #[must_use]
    pub fn bits(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            VBucketState::Dead => "dead",
            VBucketState::Active => "active",
            VBucketState::Replica => "replica",
            VBucketState::Pending => "pending",
        }
    }
}

/// Flat array of per-vbucket state bytes.
pub struct VBucketMap {
    states: Box<[AtomicU8]>,
    ignore_vbucket: bool,
}

impl VBucketMap {
    pub fn new(ignore_vbucket: bool) -> Self {
        let mut states = Vec::with_capacity(NUM_VBUCKETS);
        states.resize_with(NUM_VBUCKETS, || AtomicU8::new(0));
        Self {
            states: states.into_boxed_slice(),
            ignore_vbucket,
        }
    }

    /// State of `vbid`; out-of-range ids read as dead.
    #[must_use]
    pub fn state(&self, vbid: u16) -> VBucketState {
        match self.states.get(usize::from(vbid)) {
            Some(byte) => VBucketState::from_bits(byte.load(Ordering::Acquire)),
            None => VBucketState::Dead,
        }
    }

    /// Set the state of `vbid`. Returns false for out-of-range ids.
    pub fn set_state(&self, vbid: u16, state: VBucketState) -> bool {
        match self.states.get(usize::from(vbid)) {
            Some(byte) => {
                let old = byte.load(Ordering::Acquire);
                byte.store((old & !STATE_MASK) | state.bits(), Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Admission rule for key operations: admit everything when the gate is
    /// disabled, otherwise only active vbuckets.
    #[must_use]
    pub fn admits(&self, vbid: u16) -> bool {
        self.ignore_vbucket || self.state(vbid) == VBucketState::Active
    }
}
