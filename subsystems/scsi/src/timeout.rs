//! # Timeout and Abort Engine
//!
//! An armed timer fires into deferred work, marks its command delayed, and
//! schedules an abort. Abort marks the delay first, so a racing natural
//! completion can only defer, never interleave, and any completion
//! observed while delayed is replayed by this layer once the adapter call
//! returns. The abort entry point is bounded in meaning, not in time.

use crate::command::{Command, CommandFlags, DeliveryState};
use crate::context::ScsiCore;
use crate::device::TaskOutcome;
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::Ordering;
use strata_hal::{Completion, TimerHandle};

enum Verdict {
    /// A completion arrived while delayed; replay it through the dispatcher
    FinishDeferred,
    /// Same, for an internal command: hand it to the waiting stack
    FinishInternal(Option<Arc<Completion>>),
    /// No completion observed; the command resumes normal tracking
    Resume,
    /// Adapter reported failure on a live, non-internal command
    HardFailure,
    /// Delivery moved on while the adapter worked
    Moot,
}

impl ScsiCore {
    /// Arm the per-command timer; the expiry body runs in deferred context
    pub(crate) fn arm_timeout(self: &Arc<Self>, command: &Arc<Command>, after_ms: u64) -> TimerHandle {
        let core = Arc::clone(self);
        let command = Arc::clone(command);
        self.platform()
            .start_timer(after_ms, Box::new(move || core.times_out(&command)))
    }

    /// Timer expiry: mark the delay and schedule the abort
    fn times_out(self: &Arc<Self>, command: &Arc<Command>) {
        let serial = {
            let mut state = command.state();
            match state.delivery {
                DeliveryState::Issued { .. } => {
                    // the timer has already disarmed itself by firing; mark
                    // the delay before anything else can claim delivery
                    state.delivery = DeliveryState::Delayed { attempted: false };
                    state.serial
                }
                // natural completion won the race
                _ => return,
            }
        };

        self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
        log::warn!("command {} timed out, scheduling abort", serial);

        let core = Arc::clone(self);
        let command = Arc::clone(command);
        self.platform().defer(Box::new(move || {
            let _ = core.abort_command(&command);
        }));
    }

    /// Abort one in-flight command
    ///
    /// Returns `Failed` only for a non-internal command that reached the
    /// adapter without any completion attempt and whose adapter reported
    /// failure; everything else, including a command that had already
    /// completed, is `Success`. Aborting twice is idempotent.
    pub fn abort_command(self: &Arc<Self>, command: &Arc<Command>) -> TaskOutcome {
        // mark the delay first: a natural completion racing us defers
        // instead of interleaving
        let armed = {
            let mut state = command.state();
            match state.delivery {
                DeliveryState::Issued { timer } => {
                    if let Some(timer) = timer {
                        self.platform().cancel_timer(timer);
                    }
                    state.delivery = DeliveryState::Delayed { attempted: false };
                    true
                }
                DeliveryState::Delayed { .. } => true,
                DeliveryState::Completing | DeliveryState::Done | DeliveryState::Idle => false,
            }
        };
        if !armed {
            return TaskOutcome::Success;
        }

        let Some(adapter) = command.device().and_then(|d| d.adapter()) else {
            return TaskOutcome::Success;
        };

        self.stats.aborts.fetch_add(1, Ordering::Relaxed);
        let mut reported = adapter.ops().abort(command);
        if self.diagnostics().force_abort_failure() {
            reported = TaskOutcome::Failed;
        }

        let verdict = {
            let mut state = command.state();
            let internal = state.flags.contains(CommandFlags::INTERNAL);
            match state.delivery {
                DeliveryState::Delayed { attempted: true } => {
                    if internal {
                        state.delivery = DeliveryState::Done;
                        Verdict::FinishInternal(state.waiter.take())
                    } else {
                        state.delivery = DeliveryState::Completing;
                        Verdict::FinishDeferred
                    }
                }
                DeliveryState::Delayed { attempted: false } => {
                    if reported == TaskOutcome::Failed && !internal {
                        Verdict::HardFailure
                    } else {
                        state.delivery = DeliveryState::Issued { timer: None };
                        Verdict::Resume
                    }
                }
                // a racing abort replayed the delivery, or released it
                DeliveryState::Completing
                | DeliveryState::Done
                | DeliveryState::Idle
                | DeliveryState::Issued { .. } => Verdict::Moot,
            }
        };

        match verdict {
            Verdict::FinishDeferred => {
                self.enqueue_completion(command);
                TaskOutcome::Success
            }
            Verdict::FinishInternal(waiter) => {
                if let Some(waiter) = waiter {
                    waiter.complete();
                }
                TaskOutcome::Success
            }
            Verdict::Resume => TaskOutcome::Success,
            Verdict::HardFailure => {
                log::error!("{}: abort failed, command still live", adapter.ops().name());
                TaskOutcome::Failed
            }
            Verdict::Moot => TaskOutcome::Success,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Cdb;
    use crate::context::CoreConfig;
    use crate::device::{AdapterConfig, AdapterOps, Device, DeviceConfig, DispatchStatus};
    use crate::dispatch::Completer;
    use crate::issue::IssueRequest;
    use crate::status::{AdapterResult, HostStatus, RawOutcome};
    use crate::IssueError;
    use alloc::vec::Vec;
    use core::sync::atomic::{AtomicBool, AtomicU32};
    use std::sync::Mutex as StdMutex;
    use strata_hal::StubPlatform;

    /// Accepting backend with configurable recovery behavior
    struct RecoveryOps {
        pending: StdMutex<Vec<(Arc<Command>, Completer)>>,
        complete_in_abort: AtomicBool,
        fail_abort: AtomicBool,
    }

    impl RecoveryOps {
        fn new() -> Self {
            Self {
                pending: StdMutex::new(Vec::new()),
                complete_in_abort: AtomicBool::new(false),
                fail_abort: AtomicBool::new(false),
            }
        }
    }

    impl AdapterOps for RecoveryOps {
        fn name(&self) -> &str {
            "recovery"
        }

        fn supports_abort(&self) -> bool {
            true
        }

        fn transfer(&self, command: &Arc<Command>, done: Completer) -> DispatchStatus {
            self.pending
                .lock()
                .unwrap()
                .push((Arc::clone(command), done));
            DispatchStatus::Accepted
        }

        fn abort(&self, command: &Arc<Command>) -> TaskOutcome {
            if self.fail_abort.load(Ordering::SeqCst) {
                return TaskOutcome::Failed;
            }
            if self.complete_in_abort.load(Ordering::SeqCst) {
                let entry = {
                    let mut pending = self.pending.lock().unwrap();
                    let index = pending.iter().position(|(c, _)| Arc::ptr_eq(c, command));
                    index.map(|i| pending.swap_remove(i))
                };
                if let Some((command, done)) = entry {
                    done.complete(&command, AdapterResult::error(RawOutcome::Timeout));
                }
            }
            TaskOutcome::Success
        }

        fn device_reset(&self, _command: &Arc<Command>) -> TaskOutcome {
            TaskOutcome::Success
        }

        fn bus_reset(&self, _command: &Arc<Command>) -> TaskOutcome {
            TaskOutcome::Success
        }
    }

    struct Rig {
        platform: Arc<StubPlatform>,
        core: Arc<ScsiCore>,
        ops: Arc<RecoveryOps>,
        adapter: Arc<crate::device::Adapter>,
        device: Arc<Device>,
    }

    fn rig() -> Rig {
        let platform = Arc::new(StubPlatform::new(1));
        let core = ScsiCore::new(platform.clone(), CoreConfig::default());
        let ops = Arc::new(RecoveryOps::new());
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

    fn timed_request() -> IssueRequest {
        let mut cdb = Cdb::new();
        cdb.push(0x28);
        IssueRequest {
            cdb,
            required_len: 512,
            min_transfer: 512,
            timeout_ms: Some(30_000),
            ..IssueRequest::default()
        }
    }

    fn issue_counted(rig: &Rig, delivered: &Arc<AtomicU32>) -> Result<(), IssueError> {
        let count = Arc::clone(delivered);
        rig.core.issue(
            &rig.adapter,
            &rig.device,
            timed_request(),
            alloc::boxed::Box::new(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[test]
    fn timeout_then_abort_replays_the_deferred_completion() {
        let rig = rig();
        rig.ops.complete_in_abort.store(true, Ordering::SeqCst);
        let delivered = Arc::new(AtomicU32::new(0));
        issue_counted(&rig, &delivered).expect("issue");

        // timer fires into deferred work, which schedules the abort
        rig.platform.advance_clock(31_000 * 1_000_000);
        assert_eq!(rig.platform.fire_expired_timers(), 1);
        assert_eq!(rig.platform.run_deferred(), 1);

        // the adapter's abort handler completed the command before
        // returning; this layer finished the deferred delivery
        rig.core.service_completions();
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert_eq!(rig.device.outstanding(), 0);
        assert_eq!(rig.adapter.busy(), 0);
        assert_eq!(rig.core.stats().timeouts, 1);
        assert_eq!(rig.core.stats().aborts, 1);
    }

    #[test]
    fn abort_of_completed_command_is_idempotent_success() {
        let rig = rig();
        let delivered = Arc::new(AtomicU32::new(0));
        issue_counted(&rig, &delivered).expect("issue");

        let (command, done) = rig.ops.pending.lock().unwrap().pop().expect("parked");
        done.complete(&command, AdapterResult::ok(512));
        rig.core.service_completions();
        assert_eq!(delivered.load(Ordering::SeqCst), 1);

        let stats = rig.core.stats();
        assert_eq!(rig.core.abort_command(&command), TaskOutcome::Success);
        assert_eq!(rig.core.abort_command(&command), TaskOutcome::Success);
        // no further mutation: nothing delivered, nothing counted
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert_eq!(rig.core.stats().aborts, stats.aborts);
    }

    #[test]
    fn failed_abort_on_live_command_is_a_hard_failure() {
        let rig = rig();
        rig.ops.fail_abort.store(true, Ordering::SeqCst);
        let delivered = Arc::new(AtomicU32::new(0));
        issue_counted(&rig, &delivered).expect("issue");

        let (command, _done) = rig.ops.pending.lock().unwrap().pop().expect("parked");
        assert_eq!(rig.core.abort_command(&command), TaskOutcome::Failed);
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn forced_abort_failure_diagnostic_overrides_the_adapter() {
        let rig = rig();
        rig.core.diagnostics().set_force_abort_failure(true);
        let delivered = Arc::new(AtomicU32::new(0));
        issue_counted(&rig, &delivered).expect("issue");

        let (command, _done) = rig.ops.pending.lock().unwrap().pop().expect("parked");
        assert_eq!(rig.core.abort_command(&command), TaskOutcome::Failed);
    }

    #[test]
    fn successful_abort_without_completion_resumes_tracking() {
        let rig = rig();
        let delivered = Arc::new(AtomicU32::new(0));
        issue_counted(&rig, &delivered).expect("issue");

        let (command, done) = rig.ops.pending.lock().unwrap().pop().expect("parked");
        assert_eq!(rig.core.abort_command(&command), TaskOutcome::Success);
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
        assert_eq!(rig.device.outstanding(), 1);

        // the adapter later completes the aborted command normally
        done.complete(&command, AdapterResult::error(RawOutcome::Timeout));
        rig.core.service_completions();
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert_eq!(rig.device.outstanding(), 0);
    }

    #[test]
    fn timeout_losing_the_race_is_a_noop() {
        let rig = rig();
        let delivered = Arc::new(AtomicU32::new(0));
        issue_counted(&rig, &delivered).expect("issue");

        let (command, done) = rig.ops.pending.lock().unwrap().pop().expect("parked");
        done.complete(&command, AdapterResult::ok(512));

        // expiry body runs after the completion already claimed delivery
        rig.platform.advance_clock(31_000 * 1_000_000);
        rig.platform.fire_expired_timers();
        rig.platform.run_deferred();

        rig.core.service_completions();
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert_eq!(rig.core.stats().timeouts, 0);
    }

    #[test]
    fn timeout_of_command_with_error_result_maps_to_host_timeout() {
        let rig = rig();
        rig.ops.complete_in_abort.store(true, Ordering::SeqCst);
        let results = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&results);
        rig.core
            .issue(
                &rig.adapter,
                &rig.device,
                timed_request(),
                alloc::boxed::Box::new(move |info| {
                    sink.lock().unwrap().push(info);
                }),
            )
            .expect("issue");

        rig.platform.advance_clock(31_000 * 1_000_000);
        rig.platform.fire_expired_timers();
        rig.platform.run_deferred();
        rig.core.service_completions();

        let results = results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].result.host, HostStatus::Timeout);
    }
}
