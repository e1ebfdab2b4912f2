//! # Stub Platform
//!
//! In-process [`Platform`] implementation for tests, demos, and hosted
//! embedders. Time only moves when advanced, timers only fire when told to,
//! and deferred work runs when pumped, so interleavings are fully
//! deterministic.

use crate::platform::{DeferredWork, IrqFlags, Nanoseconds, Platform, ProcessorId, TimerHandle};
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use spin::Mutex;

const NS_PER_MS: u64 = 1_000_000;

struct ArmedTimer {
    handle: TimerHandle,
    deadline: Nanoseconds,
    work: DeferredWork,
}

/// Deterministic in-process platform
///
/// The "current processor" is a settable register rather than real affinity;
/// single-threaded tests steer it with [`StubPlatform::set_current`].
pub struct StubPlatform {
    processors: usize,
    current: AtomicU32,
    irq_depth: AtomicUsize,
    clock: AtomicU64,
    deferred: Mutex<VecDeque<DeferredWork>>,
    timers: Mutex<Vec<ArmedTimer>>,
    next_timer: AtomicU64,
    drain_requests: Mutex<Vec<ProcessorId>>,
}

impl StubPlatform {
    /// Create a stub with `processors` processor slots
    pub fn new(processors: usize) -> Self {
        Self {
            processors,
            current: AtomicU32::new(0),
            irq_depth: AtomicUsize::new(0),
            clock: AtomicU64::new(0),
            deferred: Mutex::new(VecDeque::new()),
            timers: Mutex::new(Vec::new()),
            next_timer: AtomicU64::new(1),
            drain_requests: Mutex::new(Vec::new()),
        }
    }

    /// Steer which processor subsequent calls appear to run on
    pub fn set_current(&self, processor: ProcessorId) {
        self.current.store(processor.as_u32(), Ordering::SeqCst);
    }

    /// Advance the monotonic clock
    pub fn advance_clock(&self, ns: Nanoseconds) {
        self.clock.fetch_add(ns, Ordering::SeqCst);
    }

    /// Run all currently queued deferred work; returns how many items ran
    ///
    /// Work queued by the items themselves is left for the next pump, so a
    /// test can observe each stage of a deferral chain.
    pub fn run_deferred(&self) -> usize {
        let batch: Vec<DeferredWork> = {
            let mut queue = self.deferred.lock();
            queue.drain(..).collect()
        };
        let count = batch.len();
        for work in batch {
            work();
        }
        count
    }

    /// Number of deferred work items currently queued
    pub fn deferred_len(&self) -> usize {
        self.deferred.lock().len()
    }

    /// Fire one armed timer now, regardless of its deadline
    ///
    /// Returns `false` if the timer was already fired or cancelled.
    pub fn fire_timer(&self, handle: TimerHandle) -> bool {
        let timer = {
            let mut timers = self.timers.lock();
            match timers.iter().position(|t| t.handle == handle) {
                Some(index) => timers.swap_remove(index),
                None => return false,
            }
        };
        (timer.work)();
        true
    }

    /// Fire every timer whose deadline has passed
    pub fn fire_expired_timers(&self) -> usize {
        let now = self.clock.load(Ordering::SeqCst);
        let due: Vec<ArmedTimer> = {
            let mut timers = self.timers.lock();
            let mut due = Vec::new();
            let mut index = 0;
            while index < timers.len() {
                if timers[index].deadline <= now {
                    due.push(timers.swap_remove(index));
                } else {
                    index += 1;
                }
            }
            due
        };
        let count = due.len();
        for timer in due {
            (timer.work)();
        }
        count
    }

    /// Number of timers currently armed
    pub fn armed_timers(&self) -> usize {
        self.timers.lock().len()
    }

    /// Take the processors with pending drain requests, oldest first
    pub fn take_drain_requests(&self) -> Vec<ProcessorId> {
        core::mem::take(&mut *self.drain_requests.lock())
    }
}

impl Platform for StubPlatform {
    fn processor_count(&self) -> usize {
        self.processors
    }

    fn current_processor(&self) -> ProcessorId {
        ProcessorId::new(self.current.load(Ordering::SeqCst))
    }

    fn irq_save(&self) -> IrqFlags {
        self.irq_depth.fetch_add(1, Ordering::SeqCst)
    }

    fn irq_restore(&self, _flags: IrqFlags) {
        self.irq_depth.fetch_sub(1, Ordering::SeqCst);
    }

    fn request_drain(&self, processor: ProcessorId) {
        let mut requests = self.drain_requests.lock();
        if !requests.contains(&processor) {
            log::trace!("drain requested on processor {}", processor.as_u32());
            requests.push(processor);
        }
    }

    fn defer(&self, work: DeferredWork) {
        self.deferred.lock().push_back(work);
    }

    fn start_timer(&self, after_ms: u64, work: DeferredWork) -> TimerHandle {
        let handle = TimerHandle::from_raw(self.next_timer.fetch_add(1, Ordering::SeqCst));
        let deadline = self.clock.load(Ordering::SeqCst) + after_ms * NS_PER_MS;
        self.timers.lock().push(ArmedTimer {
            handle,
            deadline,
            work,
        });
        handle
    }

    fn cancel_timer(&self, handle: TimerHandle) -> bool {
        let mut timers = self.timers.lock();
        match timers.iter().position(|t| t.handle == handle) {
            Some(index) => {
                timers.swap_remove(index);
                true
            }
            None => false,
        }
    }

    fn now(&self) -> Nanoseconds {
        self.clock.load(Ordering::SeqCst)
    }

    fn delay_ms(&self, ms: u64) {
        self.advance_clock(ms * NS_PER_MS);
    }
}

impl core::fmt::Debug for StubPlatform {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StubPlatform")
            .field("processors", &self.processors)
            .field("now", &self.clock.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}
