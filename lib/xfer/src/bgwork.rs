// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Background-work pool driving descriptor progress.
//!
//! Channels enqueue ready descriptors; worker threads pull one, call the
//! channel's `progress_xd` with a cooperative time limit, and re-queue it if
//! it reported work. A descriptor is never progressed by two workers at once:
//! the queued/running state machine on the descriptor admits a single entry,
//! and external updates that race with progress re-arm the queue instead of
//! entering it.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::channel::Channel;
use crate::xferdes::XferDes;

/// Cooperative deadline passed to `progress_xd`. Callers check
/// `is_expired()` after each logical chunk; the minimum-transfer-size policy
/// guarantees at least one chunk moves when data is available.
#[derive(Debug, Clone, Copy)]
pub struct TimeLimit {
    deadline: Option<Instant>,
}

impl TimeLimit {
    pub fn new(budget: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + budget),
        }
    }

    pub fn unlimited() -> Self {
        Self { deadline: None }
    }

    pub fn is_expired(&self) -> bool {
        match self.deadline {
            Some(d) => Instant::now() >= d,
            None => false,
        }
    }
}

/// One-shot readiness event (iterator metadata, etc.). Waiters registered
/// after the trigger run immediately on the caller's thread.
#[derive(Clone)]
pub struct ReadyEvent {
    inner: Arc<ReadyEventInner>,
}

struct ReadyEventInner {
    triggered: AtomicBool,
    waiters: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl Default for ReadyEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadyEvent {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ReadyEventInner {
                triggered: AtomicBool::new(false),
                waiters: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn has_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::Acquire)
    }

    pub fn trigger(&self) {
        let waiters = {
            let mut guard = self.inner.waiters.lock().unwrap();
            self.inner.triggered.store(true, Ordering::Release);
            std::mem::take(&mut *guard)
        };
        for w in waiters {
            w();
        }
    }

    pub fn add_waiter(&self, f: Box<dyn FnOnce() + Send>) {
        {
            let mut guard = self.inner.waiters.lock().unwrap();
            if !self.inner.triggered.load(Ordering::Acquire) {
                guard.push(f);
                return;
            }
        }
        f();
    }
}

struct ReadyXd {
    priority: i32,
    seq: u64,
    channel: Arc<dyn Channel>,
    xd: Arc<XferDes>,
}

impl PartialEq for ReadyXd {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for ReadyXd {}

impl Ord for ReadyXd {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // higher priority first; FIFO within a priority
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ReadyXd {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct BgShared {
    queue: Mutex<BinaryHeap<ReadyXd>>,
    condvar: Condvar,
    cancel: CancellationToken,
    seq: AtomicU64,
}

/// Per-process pool of progress workers.
pub struct BackgroundWorkManager {
    shared: Arc<BgShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    work_slice: Duration,
}

impl BackgroundWorkManager {
    pub fn new(num_workers: usize) -> Arc<Self> {
        Self::with_work_slice(num_workers, Duration::from_micros(100))
    }

    pub fn with_work_slice(num_workers: usize, work_slice: Duration) -> Arc<Self> {
        let this = Arc::new(Self {
            shared: Arc::new(BgShared {
                queue: Mutex::new(BinaryHeap::new()),
                condvar: Condvar::new(),
                cancel: CancellationToken::new(),
                seq: AtomicU64::new(0),
            }),
            workers: Mutex::new(Vec::new()),
            work_slice,
        });
        for i in 0..num_workers {
            let shared = this.shared.clone();
            let slice = work_slice;
            let handle = std::thread::Builder::new()
                .name(format!("xfer-worker-{i}"))
                .spawn(move || Self::worker_loop(shared, slice))
                .expect("failed to spawn progress worker");
            this.workers.lock().unwrap().push(handle);
        }
        this
    }

    /// Hand a ready descriptor to the pool. The descriptor must already be in
    /// the queued scheduling state.
    pub(crate) fn push(&self, channel: Arc<dyn Channel>, xd: Arc<XferDes>) {
        let item = ReadyXd {
            priority: xd.priority(),
            seq: self.shared.seq.fetch_add(1, Ordering::Relaxed),
            channel,
            xd,
        };
        self.shared.queue.lock().unwrap().push(item);
        self.shared.condvar.notify_one();
    }

    fn worker_loop(shared: Arc<BgShared>, work_slice: Duration) {
        loop {
            let item = {
                let mut queue = shared.queue.lock().unwrap();
                loop {
                    if shared.cancel.is_cancelled() {
                        return;
                    }
                    if let Some(item) = queue.pop() {
                        break item;
                    }
                    let (guard, _timeout) = shared
                        .condvar
                        .wait_timeout(queue, Duration::from_millis(50))
                        .unwrap();
                    queue = guard;
                }
            };

            if !item.xd.sched_begin_progress() {
                // completed or destroyed while queued
                continue;
            }

            let did_work = item.channel.progress_xd(&item.xd, TimeLimit::new(work_slice));

            if item.xd.is_completed() {
                item.xd.mark_completed();
                continue;
            }

            if item.xd.sched_finish_progress(did_work) {
                let ReadyXd { channel, xd, .. } = item;
                let priority = xd.priority();
                let seq = shared.seq.fetch_add(1, Ordering::Relaxed);
                shared.queue.lock().unwrap().push(ReadyXd {
                    priority,
                    seq,
                    channel,
                    xd,
                });
                shared.condvar.notify_one();
            }
        }
    }

    pub fn work_slice(&self) -> Duration {
        self.work_slice
    }

    pub fn shutdown(&self) {
        self.shared.cancel.cancel();
        self.shared.condvar.notify_all();
        let mut workers = self.workers.lock().unwrap();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for BackgroundWorkManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_limit_expiry() {
        let tl = TimeLimit::new(Duration::from_millis(1));
        assert!(!TimeLimit::unlimited().is_expired());
        std::thread::sleep(Duration::from_millis(5));
        assert!(tl.is_expired());
    }

    #[test]
    fn test_ready_event_immediate_and_deferred() {
        let ev = ReadyEvent::new();
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let h = hits.clone();
        ev.add_waiter(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        ev.trigger();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(ev.has_triggered());

        // late waiter fires immediately
        let h = hits.clone();
        ev.add_waiter(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
