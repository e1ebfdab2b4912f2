//! # Reset Engine
//!
//! Device, LUN, and bus reset against an (adapter, device) pair, driven
//! through one reused synthetic task-management command. No timeout is
//! enforced on the adapter entry points; escalation on a hung reset is a
//! higher layer's policy.

use crate::command::{Command, CommandFlags};
use crate::context::ScsiCore;
use crate::device::{Adapter, Device, TaskOutcome};
use alloc::sync::Arc;
use core::sync::atomic::Ordering;

/// Settle delay imposed after a bus reset, in milliseconds
pub const BUS_RESET_SETTLE_MS: u64 = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResetKind {
    Device,
    Lun,
    Bus,
}

impl ScsiCore {
    /// Reset the target `device` addresses
    pub fn reset_device(&self, adapter: &Arc<Adapter>, device: &Arc<Device>) -> TaskOutcome {
        self.run_reset(adapter, device, ResetKind::Device)
    }

    /// Reset only the logical unit, falling back on the adapter's target
    /// reset entry point with the LUN-reset flag set
    pub fn reset_lun(&self, adapter: &Arc<Adapter>, device: &Arc<Device>) -> TaskOutcome {
        self.run_reset(adapter, device, ResetKind::Lun)
    }

    /// Reset the whole bus, then wait the fixed settle delay
    pub fn reset_bus(&self, adapter: &Arc<Adapter>, device: &Arc<Device>) -> TaskOutcome {
        self.run_reset(adapter, device, ResetKind::Bus)
    }

    fn run_reset(
        &self,
        adapter: &Arc<Adapter>,
        device: &Arc<Device>,
        kind: ResetKind,
    ) -> TaskOutcome {
        // one reused synthetic command per adapter, never pooled; holding
        // the slot lock serializes concurrent resets on the same adapter
        let mut slot = adapter.tm_slot().lock();
        let command = slot.get_or_insert_with(|| Arc::new(Command::new()));

        {
            let mut state = command.state();
            state.device = Some(Arc::clone(device));
            // task-management commands are exempt from serial and counter
            // bookkeeping
            state.flags = match kind {
                ResetKind::Lun => {
                    CommandFlags::TASK_MANAGEMENT | CommandFlags::INTERNAL | CommandFlags::LUN_RESET
                }
                _ => CommandFlags::TASK_MANAGEMENT | CommandFlags::INTERNAL,
            };
            state.cdb.clear();
        }

        let outcome = match kind {
            ResetKind::Device | ResetKind::Lun => adapter.ops().device_reset(command),
            ResetKind::Bus => {
                let outcome = adapter.ops().bus_reset(command);
                self.platform().delay_ms(BUS_RESET_SETTLE_MS);
                outcome
            }
        };

        command.state().device = None;
        self.stats.resets.fetch_add(1, Ordering::Relaxed);
        match outcome {
            TaskOutcome::Success => log::info!(
                "{}: {:?} reset of {:?} complete",
                adapter.ops().name(),
                kind,
                device.address()
            ),
            TaskOutcome::Failed => log::error!(
                "{}: {:?} reset of {:?} failed",
                adapter.ops().name(),
                kind,
                device.address()
            ),
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CoreConfig;
    use crate::device::{AdapterConfig, AdapterOps, DeviceConfig, DispatchStatus};
    use crate::dispatch::Completer;
    use alloc::vec::Vec;
    use std::sync::Mutex as StdMutex;
    use strata_hal::{Platform, StubPlatform};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Entry {
        DeviceReset(CommandFlags),
        BusReset,
    }

    struct ResetOps {
        entries: StdMutex<Vec<Entry>>,
        commands: StdMutex<Vec<Arc<Command>>>,
    }

    impl ResetOps {
        fn new() -> Self {
            Self {
                entries: StdMutex::new(Vec::new()),
                commands: StdMutex::new(Vec::new()),
            }
        }
    }

    impl AdapterOps for ResetOps {
        fn name(&self) -> &str {
            "reset"
        }

        fn transfer(&self, _command: &Arc<Command>, _done: Completer) -> DispatchStatus {
            DispatchStatus::Rejected
        }

        fn abort(&self, _command: &Arc<Command>) -> TaskOutcome {
            TaskOutcome::Success
        }

        fn device_reset(&self, command: &Arc<Command>) -> TaskOutcome {
            self.entries
                .lock()
                .unwrap()
                .push(Entry::DeviceReset(command.flags()));
            self.commands.lock().unwrap().push(Arc::clone(command));
            TaskOutcome::Success
        }

        fn bus_reset(&self, command: &Arc<Command>) -> TaskOutcome {
            self.entries.lock().unwrap().push(Entry::BusReset);
            self.commands.lock().unwrap().push(Arc::clone(command));
            TaskOutcome::Success
        }
    }

    struct Rig {
        platform: Arc<StubPlatform>,
        core: Arc<ScsiCore>,
        ops: Arc<ResetOps>,
        adapter: Arc<Adapter>,
        device: Arc<Device>,
    }

    fn rig() -> Rig {
        let platform = Arc::new(StubPlatform::new(1));
        let core = ScsiCore::new(platform.clone(), CoreConfig::default());
        let ops = Arc::new(ResetOps::new());
        let adapter = core.register_adapter(ops.clone(), AdapterConfig::default());
        adapter.start().expect("start");
        let device = core.add_device(&adapter, DeviceConfig::default());
        device.start().expect("start");
        Rig {
            platform,
            core,
            ops,
            adapter,
            device,
        }
    }

    #[test]
    fn device_reset_carries_task_management_marking() {
        let rig = rig();
        assert_eq!(
            rig.core.reset_device(&rig.adapter, &rig.device),
            TaskOutcome::Success
        );
        let entries = rig.ops.entries.lock().unwrap();
        assert_eq!(
            entries[0],
            Entry::DeviceReset(CommandFlags::TASK_MANAGEMENT | CommandFlags::INTERNAL)
        );
        // exempt from issue bookkeeping
        assert_eq!(rig.adapter.busy(), 0);
        assert_eq!(rig.device.outstanding(), 0);
        assert_eq!(rig.core.stats().resets, 1);
    }

    #[test]
    fn lun_reset_falls_back_to_device_reset_with_flag() {
        let rig = rig();
        rig.core.reset_lun(&rig.adapter, &rig.device);
        let entries = rig.ops.entries.lock().unwrap();
        assert!(matches!(
            entries[0],
            Entry::DeviceReset(flags) if flags.contains(CommandFlags::LUN_RESET)
        ));
    }

    #[test]
    fn bus_reset_waits_out_the_settle_delay() {
        let rig = rig();
        let before = rig.platform.now();
        rig.core.reset_bus(&rig.adapter, &rig.device);
        assert_eq!(*rig.ops.entries.lock().unwrap(), [Entry::BusReset]);
        assert!(rig.platform.now() - before >= BUS_RESET_SETTLE_MS * 1_000_000);
    }

    #[test]
    fn synthetic_command_is_reused_across_resets() {
        let rig = rig();
        rig.core.reset_device(&rig.adapter, &rig.device);
        rig.core.reset_bus(&rig.adapter, &rig.device);
        let commands = rig.ops.commands.lock().unwrap();
        assert!(Arc::ptr_eq(&commands[0], &commands[1]));
    }
}
