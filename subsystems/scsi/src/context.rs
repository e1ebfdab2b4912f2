//! # Process-Wide Context
//!
//! Everything the classic design kept in globals (the serial counter, the
//! per-processor completion queue table, the adapter list) lives in one
//! [`ScsiCore`], created at init and passed by reference. There are no
//! hidden statics.

use crate::device::{Adapter, AdapterConfig, AdapterOps, Device, DeviceConfig};
use crate::dispatch::DoneQueue;
use crate::pool::CommandCache;
use crate::{ScsiError, ScsiResult, SerialNumber};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use spin::RwLock;
use strata_hal::{PerCpu, Platform};

/// Core construction parameters
#[derive(Debug, Clone, Copy)]
pub struct CoreConfig {
    /// Command-cache bound: the expected system-wide concurrent-command
    /// maximum
    pub pool_capacity: usize,
    /// Maximum completions handled per drain invocation
    pub drain_batch_limit: usize,
    /// Drain time budget in nanoseconds
    pub drain_budget_ns: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            pool_capacity: 64,
            drain_batch_limit: 32,
            drain_budget_ns: 1_000_000,
        }
    }
}

/// Diagnostic-only toggles
///
/// Both default off and exist to exercise recovery paths in testing; neither
/// belongs anywhere near a production configuration.
#[derive(Debug, Default)]
pub struct Diagnostics {
    force_drop: AtomicBool,
    force_abort_failure: AtomicBool,
}

impl Diagnostics {
    /// Discard completions of commands flagged drop-eligible
    pub fn set_force_drop(&self, enabled: bool) {
        self.force_drop.store(enabled, Ordering::SeqCst);
    }

    /// Whether forced drop-on-complete is armed
    pub fn force_drop(&self) -> bool {
        self.force_drop.load(Ordering::SeqCst)
    }

    /// Report every adapter abort as failed
    pub fn set_force_abort_failure(&self, enabled: bool) {
        self.force_abort_failure.store(enabled, Ordering::SeqCst);
    }

    /// Whether forced abort failure is armed
    pub fn force_abort_failure(&self) -> bool {
        self.force_abort_failure.load(Ordering::SeqCst)
    }
}

/// Monotonic event counters
#[derive(Debug, Default)]
pub struct CoreStats {
    pub(crate) issued: AtomicU64,
    pub(crate) completed: AtomicU64,
    pub(crate) timeouts: AtomicU64,
    pub(crate) aborts: AtomicU64,
    pub(crate) resets: AtomicU64,
    pub(crate) rejections: AtomicU64,
    pub(crate) dropped: AtomicU64,
}

impl CoreStats {
    /// Read a consistent-enough snapshot of the counters
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            issued: self.issued.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            aborts: self.aborts.load(Ordering::Relaxed),
            resets: self.resets.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`CoreStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Commands accepted by the issue path
    pub issued: u64,
    /// Completions delivered upstream
    pub completed: u64,
    /// Timeouts fired
    pub timeouts: u64,
    /// Abort attempts driven
    pub aborts: u64,
    /// Resets driven
    pub resets: u64,
    /// Synchronous adapter rejections
    pub rejections: u64,
    /// Completions discarded by the drop diagnostic
    pub dropped: u64,
}

/// The mid-layer context object
///
/// ## Init / teardown
///
/// Create one per process with [`ScsiCore::new`]; register adapters and
/// devices, then `start()` each. For teardown, stop issuing, let in-flight
/// commands drain (or recover them), then call [`ScsiCore::shutdown`],
/// which refuses while any adapter still has commands outstanding.
pub struct ScsiCore {
    platform: Arc<dyn Platform>,
    config: CoreConfig,
    serial_counter: AtomicU64,
    pub(crate) pool: CommandCache,
    pub(crate) queues: PerCpu<DoneQueue>,
    pub(crate) stats: CoreStats,
    diag: Diagnostics,
    adapters: RwLock<Vec<Arc<Adapter>>>,
}

impl ScsiCore {
    /// Bring up a mid-layer core on `platform`
    pub fn new(platform: Arc<dyn Platform>, config: CoreConfig) -> Arc<Self> {
        let processors = platform.processor_count();
        log::info!(
            "scsi core online: {} processors, pool capacity {}",
            processors,
            config.pool_capacity
        );
        Arc::new(Self {
            queues: PerCpu::new(processors, |_| DoneQueue::default()),
            pool: CommandCache::new(config.pool_capacity),
            serial_counter: AtomicU64::new(1),
            stats: CoreStats::default(),
            diag: Diagnostics::default(),
            adapters: RwLock::new(Vec::new()),
            platform,
            config,
        })
    }

    /// The platform this core runs on
    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    pub(crate) fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub(crate) fn next_serial(&self) -> SerialNumber {
        crate::next_serial(&self.serial_counter)
    }

    /// Diagnostic toggles
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diag
    }

    /// Event counters
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Pool usage counters
    pub fn pool_stats(&self) -> crate::pool::PoolStats {
        self.pool.stats()
    }

    /// Register an adapter backend and prime its emergency reserve
    ///
    /// The adapter is returned in `Created` state; call
    /// [`Adapter::start`] once the backend is ready for commands.
    pub fn register_adapter(
        &self,
        ops: Arc<dyn AdapterOps>,
        config: AdapterConfig,
    ) -> Arc<Adapter> {
        let adapter = Adapter::new(ops, config);
        adapter.refill_reserve(self.pool.prime());
        self.adapters.write().push(Arc::clone(&adapter));
        log::info!(
            "adapter {} registered (this_id {}, can_queue {})",
            adapter.ops().name(),
            adapter.this_id(),
            adapter.can_queue()
        );
        adapter
    }

    /// Tear an adapter down; refuses while commands are outstanding
    pub fn remove_adapter(&self, adapter: &Arc<Adapter>) -> ScsiResult<()> {
        adapter.mark_deleting()?;
        let mut adapters = self.adapters.write();
        match adapters.iter().position(|a| Arc::ptr_eq(a, adapter)) {
            Some(index) => {
                adapters.remove(index);
                log::info!("adapter {} removed", adapter.ops().name());
                Ok(())
            }
            None => Err(ScsiError::NotFound),
        }
    }

    /// Registered adapters
    pub fn adapters(&self) -> Vec<Arc<Adapter>> {
        self.adapters.read().clone()
    }

    /// Register a device on `adapter`
    ///
    /// The device is returned in `Created` state; call [`Device::start`]
    /// to open its issue gate.
    pub fn add_device(&self, adapter: &Arc<Adapter>, config: DeviceConfig) -> Arc<Device> {
        let device = Device::new(config, adapter);
        adapter.attach_device(&device);
        log::info!(
            "device {:?} registered on {} (queue depth {})",
            device.address(),
            adapter.ops().name(),
            device.queue_depth()
        );
        device
    }

    /// Tear a device down; refuses while commands are outstanding
    pub fn remove_device(&self, adapter: &Arc<Adapter>, device: &Arc<Device>) -> ScsiResult<()> {
        device.mark_deleted()?;
        if adapter.detach_device(device) {
            Ok(())
        } else {
            Err(ScsiError::NotFound)
        }
    }

    /// Close a device's gate and wait, block-safe, for in-flight commands
    /// to drain
    pub fn quiesce_device(&self, device: &Arc<Device>) -> ScsiResult<()> {
        device.begin_quiesce()?;
        while device.outstanding() != 0 {
            core::hint::spin_loop();
        }
        Ok(())
    }

    /// Tear the core down
    ///
    /// Refuses while any adapter still owns commands; on success the
    /// adapter registry is emptied and the core can be dropped.
    pub fn shutdown(&self) -> ScsiResult<()> {
        let adapters = self.adapters.read().clone();
        for adapter in &adapters {
            if adapter.busy() != 0 {
                return Err(ScsiError::Outstanding);
            }
        }
        self.adapters.write().clear();
        log::info!("scsi core offline");
        Ok(())
    }
}

impl core::fmt::Debug for ScsiCore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ScsiCore")
            .field("processors", &self.queues.len())
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceState;
    use strata_hal::StubPlatform;

    fn core() -> Arc<ScsiCore> {
        ScsiCore::new(Arc::new(StubPlatform::new(1)), CoreConfig::default())
    }

    #[test]
    fn registration_primes_the_reserve() {
        let core = core();
        let adapter = core.register_adapter(
            Arc::new(crate::device::tests::null_ops()),
            AdapterConfig::default(),
        );
        assert!(adapter.take_reserve().is_some());
        assert!(adapter.take_reserve().is_none());
    }

    #[test]
    fn removal_requires_idle_adapter() {
        let core = core();
        let adapter = core.register_adapter(
            Arc::new(crate::device::tests::null_ops()),
            AdapterConfig::default(),
        );
        adapter.start().expect("start");
        adapter.busy_inc();
        assert_eq!(core.remove_adapter(&adapter), Err(ScsiError::Outstanding));
        adapter.busy_dec();
        core.remove_adapter(&adapter).expect("remove");
        assert!(core.adapters().is_empty());
    }

    #[test]
    fn device_add_remove_round_trip() {
        let core = core();
        let adapter = core.register_adapter(
            Arc::new(crate::device::tests::null_ops()),
            AdapterConfig::default(),
        );
        let device = core.add_device(&adapter, DeviceConfig::default());
        assert_eq!(device.state(), DeviceState::Created);
        device.start().expect("start");
        core.remove_device(&adapter, &device).expect("remove");
        assert_eq!(device.state(), DeviceState::Deleted);
        assert_eq!(
            core.remove_device(&adapter, &device),
            Err(ScsiError::NotFound)
        );
    }

    #[test]
    fn quiesce_returns_once_idle() {
        let core = core();
        let adapter = core.register_adapter(
            Arc::new(crate::device::tests::null_ops()),
            AdapterConfig::default(),
        );
        let device = core.add_device(&adapter, DeviceConfig::default());
        device.start().expect("start");
        core.quiesce_device(&device).expect("quiesce");
        assert_eq!(device.state(), DeviceState::Quiesced);
    }
}
