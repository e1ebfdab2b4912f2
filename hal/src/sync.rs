//! # Synchronization Primitives
//!
//! Mid-layer-specific primitives on top of `spin`: a lock that detects
//! same-processor reacquisition, and a one-shot completion event for
//! borrowed-stack hand-offs.

use crate::platform::ProcessorId;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

const NO_OWNER: u32 = u32::MAX;

/// Spin lock that records the processor holding it
///
/// Callees invoked while the lock is held (the synchronous adapter transfer
/// call) must not reacquire it. On a non-preemptible system a same-processor
/// reacquisition can only be recursion, so debug builds turn the would-be
/// deadlock into a panic naming the contract.
pub struct NonReentrant<T> {
    locked: AtomicBool,
    owner: AtomicU32,
    value: UnsafeCell<T>,
}

// SAFETY: the value is only reachable through the guard, which is handed out
// to exactly one holder at a time by the `locked` flag.
unsafe impl<T: Send> Sync for NonReentrant<T> {}
unsafe impl<T: Send> Send for NonReentrant<T> {}

impl<T> NonReentrant<T> {
    /// Create a new unlocked instance
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            owner: AtomicU32::new(NO_OWNER),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock on behalf of `processor`
    ///
    /// # Panics
    ///
    /// In debug builds, panics if `processor` already holds the lock.
    pub fn lock(&self, processor: ProcessorId) -> NonReentrantGuard<'_, T> {
        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
            cfg_if::cfg_if! {
                if #[cfg(debug_assertions)] {
                    if self.owner.load(Ordering::Relaxed) == processor.as_u32() {
                        panic!(
                            "non-reentrant lock reacquired on processor {}",
                            processor.as_u32()
                        );
                    }
                }
            }
            core::hint::spin_loop();
        }
        self.owner.store(processor.as_u32(), Ordering::Relaxed);
        NonReentrantGuard { lock: self }
    }

    /// Whether the lock is currently held by anyone
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl<T> core::fmt::Debug for NonReentrant<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NonReentrant")
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

/// Guard for [`NonReentrant`]; releases the lock on drop
pub struct NonReentrantGuard<'a, T> {
    lock: &'a NonReentrant<T>,
}

impl<T> core::ops::Deref for NonReentrantGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves exclusive acquisition
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> core::ops::DerefMut for NonReentrantGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves exclusive acquisition
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for NonReentrantGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.owner.store(NO_OWNER, Ordering::Relaxed);
        self.lock.locked.store(false, Ordering::Release);
    }
}

impl<T> core::fmt::Debug for NonReentrantGuard<'_, T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NonReentrantGuard").finish_non_exhaustive()
    }
}

/// One-shot completion event
///
/// The signalling side calls [`Completion::complete`] exactly once; the
/// waiting side spins in a block-safe context until it has. Used for the
/// direct result hand-off of internal synthetic commands, which execute on a
/// borrowed stack and cannot take the deferred completion path.
#[derive(Debug, Default)]
pub struct Completion {
    done: AtomicBool,
}

impl Completion {
    /// Create a new, unsignalled completion
    pub const fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
        }
    }

    /// Signal the waiter
    pub fn complete(&self) {
        self.done.store(true, Ordering::Release);
    }

    /// Whether the completion has been signalled
    pub fn is_complete(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Spin until signalled. Only legal in block-safe contexts
    pub fn wait(&self) {
        while !self.is_complete() {
            core::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_hands_out_exclusive_access() {
        let lock = NonReentrant::new(0u32);
        {
            let mut guard = lock.lock(ProcessorId::new(0));
            *guard += 1;
            assert!(lock.is_locked());
        }
        assert!(!lock.is_locked());
        assert_eq!(*lock.lock(ProcessorId::new(1)), 1);
    }

    #[test]
    fn completion_signals_once() {
        let event = Completion::new();
        assert!(!event.is_complete());
        event.complete();
        assert!(event.is_complete());
        event.wait();
    }
}
