//! # Platform Abstraction
//!
//! This module defines the trait through which the mid-layer reaches its
//! execution environment: processor identity, local interrupt masking,
//! deferred work, timers, and the monotonic clock.

use alloc::boxed::Box;
use core::marker::PhantomData;

/// Monotonic time in nanoseconds
pub type Nanoseconds = u64;

/// Opaque saved interrupt state, as returned by [`Platform::irq_save`]
pub type IrqFlags = usize;

/// A unit of work to run later in a deferred, block-safe context
pub type DeferredWork = Box<dyn FnOnce() + Send + 'static>;

/// Identifier of one processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessorId(u32);

impl ProcessorId {
    /// Create a processor ID from a raw index
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw index value
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Get the index as a usize (for table indexing)
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Handle for an armed one-shot timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle(u64);

impl TimerHandle {
    /// Create a handle from a raw timer ID
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw timer ID
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Execution environment abstraction
///
/// Implementations must tolerate calls from interrupt context for
/// [`Platform::irq_save`], [`Platform::irq_restore`],
/// [`Platform::current_processor`], and [`Platform::request_drain`].
/// The remaining entry points are only invoked from block-safe contexts.
pub trait Platform: Send + Sync {
    /// Get the number of processors available
    fn processor_count(&self) -> usize;

    /// Get the processor this call is executing on
    fn current_processor(&self) -> ProcessorId;

    /// Disable local interrupt delivery, returning the previous state
    fn irq_save(&self) -> IrqFlags;

    /// Restore interrupt state previously returned by [`Platform::irq_save`]
    fn irq_restore(&self, flags: IrqFlags);

    /// Request that the completion drain be invoked on `processor` from a
    /// deferred (non-interrupt) context as soon as practical
    fn request_drain(&self, processor: ProcessorId);

    /// Run `work` later from a deferred, block-safe context
    fn defer(&self, work: DeferredWork);

    /// Arm a one-shot timer; `work` runs in a deferred context after
    /// `after_ms` milliseconds unless the timer is cancelled first
    fn start_timer(&self, after_ms: u64, work: DeferredWork) -> TimerHandle;

    /// Disarm a timer. Returns `true` iff the timer had not yet fired and
    /// its work will never run
    fn cancel_timer(&self, handle: TimerHandle) -> bool;

    /// Read the monotonic clock
    fn now(&self) -> Nanoseconds;

    /// Sleep for `ms` milliseconds. Only legal in block-safe contexts
    fn delay_ms(&self, ms: u64);
}

/// RAII guard for a local-interrupts-disabled section
///
/// While a guard is alive, interrupt delivery on the current processor is
/// masked and the execution context cannot migrate. The guard is therefore
/// the capability token for per-processor data: see [`crate::PerCpu`].
///
/// Guards are deliberately `!Send`; a section entered on one processor can
/// only be left on that processor.
pub struct IrqGuard<'a> {
    platform: &'a dyn Platform,
    flags: IrqFlags,
    processor: ProcessorId,
    _not_send: PhantomData<*mut ()>,
}

impl<'a> IrqGuard<'a> {
    /// Mask local interrupts and capture the current processor
    pub fn new(platform: &'a dyn Platform) -> Self {
        let flags = platform.irq_save();
        let processor = platform.current_processor();
        Self {
            platform,
            flags,
            processor,
            _not_send: PhantomData,
        }
    }

    /// The processor this guard pins execution to
    pub fn processor(&self) -> ProcessorId {
        self.processor
    }
}

impl Drop for IrqGuard<'_> {
    fn drop(&mut self) {
        self.platform.irq_restore(self.flags);
    }
}

impl core::fmt::Debug for IrqGuard<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IrqGuard")
            .field("processor", &self.processor)
            .finish_non_exhaustive()
    }
}

static_assertions::assert_not_impl_any!(IrqGuard<'static>: Send, Sync);
