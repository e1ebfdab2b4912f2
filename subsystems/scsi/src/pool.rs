//! # Command Pool
//!
//! Fixed-capacity cache of command objects, sized for the expected
//! system-wide concurrent-command maximum, plus a one-deep per-adapter
//! emergency reserve so an error completion can always be carried even when
//! the cache is exhausted.

use crate::command::Command;
use crate::device::Adapter;
use crate::{ScsiError, ScsiResult};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use spin::Mutex;

/// Pool usage counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Commands created from scratch
    pub allocations: u64,
    /// Commands recycled from the free list
    pub recycles: u64,
    /// Acquisitions served from an adapter's emergency reserve
    pub reserve_hits: u64,
    /// Acquisitions that failed outright
    pub exhaustions: u64,
}

/// Command cache backing the pool
pub struct CommandCache {
    capacity: usize,
    live: AtomicUsize,
    free: Mutex<Vec<Arc<Command>>>,
    allocations: AtomicU64,
    recycles: AtomicU64,
    reserve_hits: AtomicU64,
    exhaustions: AtomicU64,
}

impl CommandCache {
    /// Create a cache bounded at `capacity` concurrently-live commands
    /// (emergency reserves are primed on top of the bound)
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            live: AtomicUsize::new(0),
            free: Mutex::new(Vec::new()),
            allocations: AtomicU64::new(0),
            recycles: AtomicU64::new(0),
            reserve_hits: AtomicU64::new(0),
            exhaustions: AtomicU64::new(0),
        }
    }

    /// Acquire a blank command for issuance against one of `adapter`'s
    /// devices
    ///
    /// Order of preference: recycled from the free list, newly created under
    /// the capacity bound, then the adapter's emergency reserve.
    pub(crate) fn acquire(&self, adapter: &Adapter) -> ScsiResult<Arc<Command>> {
        if let Some(command) = self.free.lock().pop() {
            self.recycles.fetch_add(1, Ordering::Relaxed);
            return Ok(command);
        }

        let mut live = self.live.load(Ordering::Relaxed);
        while live < self.capacity {
            match self.live.compare_exchange_weak(
                live,
                live + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.allocations.fetch_add(1, Ordering::Relaxed);
                    return Ok(Arc::new(Command::new()));
                }
                Err(observed) => live = observed,
            }
        }

        if let Some(command) = adapter.take_reserve() {
            self.reserve_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(command);
        }

        self.exhaustions.fetch_add(1, Ordering::Relaxed);
        Err(ScsiError::OutOfMemory)
    }

    /// Return a command: zero it, refill the owning adapter's reserve first,
    /// otherwise put it back on the free list
    pub(crate) fn release(&self, command: Arc<Command>, adapter: Option<&Adapter>) {
        command.reset();
        let command = match adapter {
            Some(adapter) => match adapter.refill_reserve(command) {
                None => return,
                Some(rejected) => rejected,
            },
            None => command,
        };
        self.free.lock().push(command);
    }

    /// Create one command outside the capacity bound (emergency reserves)
    pub(crate) fn prime(&self) -> Arc<Command> {
        self.live.fetch_add(1, Ordering::Relaxed);
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Arc::new(Command::new())
    }

    /// Commands currently allocated, live or pooled
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Snapshot the usage counters
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            recycles: self.recycles.load(Ordering::Relaxed),
            reserve_hits: self.reserve_hits.load(Ordering::Relaxed),
            exhaustions: self.exhaustions.load(Ordering::Relaxed),
        }
    }
}

impl core::fmt::Debug for CommandCache {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CommandCache")
            .field("capacity", &self.capacity)
            .field("live", &self.live())
            .finish_non_exhaustive()
    }
}
