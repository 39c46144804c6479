// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Background worker pool.
//!
//! A handful of worker threads drain a job channel; a timer lane holds jobs
//! scheduled for a later instant (processor backoff, mostly) and feeds them
//! into the same channel when due. The pool is created explicitly at
//! engine-manager startup and a handle is passed into whatever needs it;
//! nothing looks it up globally on a hot path.
//!
//! Shutdown is cooperative: `shutdown()` closes the channels and joins every
//! thread. Long-running jobs are expected to watch a cancellation flag of
//! their own, the pool only guarantees it stops handing out new work.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A job queued for a later instant. Ordered so the soonest deadline sits on
/// top of the heap.
struct TimedJob {
    due: Instant,
    seq: u64,
    job: Job,
}

impl PartialEq for TimedJob {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for TimedJob {}

impl PartialOrd for TimedJob {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimedJob {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed: BinaryHeap is a max-heap, we want the earliest deadline.
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Fixed-size worker pool with a delayed-job lane.
pub struct TaskPool {
    tx: Mutex<Option<Sender<Job>>>,
    timer_tx: Mutex<Option<Sender<TimedJob>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    seq: AtomicU64,
}

impl TaskPool {
    /// Spin up `workers` job threads plus one timer thread.
    pub fn new(workers: usize) -> Arc<Self> {
        let workers = workers.max(1);
        let (tx, rx) = unbounded::<Job>();
        let (timer_tx, timer_rx) = bounded::<TimedJob>(1024);

        let mut threads = Vec::with_capacity(workers + 1);
        for idx in 0..workers {
            let rx = rx.clone();
            threads.push(
                std::thread::Builder::new()
                    .name(format!("memstone-worker-{}", idx))
                    .spawn(move || worker_loop(rx))
                    .expect("spawn worker thread"),
            );
        }
        let job_tx = tx.clone();
        threads.push(
            std::thread::Builder::new()
                .name("memstone-timer".to_string())
                .spawn(move || timer_loop(timer_rx, job_tx))
                .expect("spawn timer thread"),
        );

        Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            timer_tx: Mutex::new(Some(timer_tx)),
            threads: Mutex::new(threads),
            seq: AtomicU64::new(0),
        })
    }

    /// Queue a job for the next free worker.
    pub fn spawn<F: FnOnce() + Send + 'static>(&self, job: F) {
        let guard = self.tx.lock();
        match guard.as_ref() {
            Some(tx) => {
                if tx.send(Box::new(job)).is_err() {
                    log::debug!("[TaskPool::spawn] workers gone, job dropped");
                }
            }
            None => log::debug!("[TaskPool::spawn] pool shut down, job dropped"),
        }
    }

    /// Queue a job to run no earlier than `delay` from now.
    pub fn spawn_after<F: FnOnce() + Send + 'static>(&self, delay: Duration, job: F) {
        let timed = TimedJob {
            due: Instant::now() + delay,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            job: Box::new(job),
        };
        let guard = self.timer_tx.lock();
        match guard.as_ref() {
            Some(tx) => {
                if tx.send(timed).is_err() {
                    log::debug!("[TaskPool::spawn_after] timer gone, job dropped");
                }
            }
            None => log::debug!("[TaskPool::spawn_after] pool shut down, job dropped"),
        }
    }

    /// Close the queues and join every thread. Jobs already queued still
    /// run; delayed jobs not yet due are dropped.
    pub fn shutdown(&self) {
        self.timer_tx.lock().take();
        self.tx.lock().take();
        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            if handle.join().is_err() {
                log::warn!("[TaskPool::shutdown] worker panicked");
            }
        }
    }
}

fn worker_loop(rx: Receiver<Job>) {
    while let Ok(job) = rx.recv() {
        job();
    }
}

fn timer_loop(rx: Receiver<TimedJob>, tx: Sender<Job>) {
    let mut heap: BinaryHeap<TimedJob> = BinaryHeap::new();
    loop {
        // Fire everything due.
        let now = Instant::now();
        while heap.peek().map_or(false, |t| t.due <= now) {
            let timed = heap.pop().expect("peeked");
            if tx.send(timed.job).is_err() {
                return;
            }
        }
        let timeout = heap
            .peek()
            .map(|t| t.due.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::from_millis(200));
        match rx.recv_timeout(timeout) {
            Ok(timed) => heap.push(timed),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                // Drain what is already due, then stop.
                let now = Instant::now();
                while heap.peek().map_or(false, |t| t.due <= now) {
                    let timed = heap.pop().expect("peeked");
                    if tx.send(timed.job).is_err() {
                        return;
                    }
                }
                return;
            }
        }
    }
}
