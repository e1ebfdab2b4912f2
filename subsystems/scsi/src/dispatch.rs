//! # Completion Dispatcher
//!
//! Natural completion may arrive in interrupt context on any processor.
//! Intake claims delivery under the command lock, then parks the command on
//! the observing processor's inbox; a bounded drain later maps the raw
//! outcome, settles the counters, releases the command, and only then runs
//! the upstream callback. The inbox and the drain's running flag are
//! per-processor and synchronized by local interrupt masking alone.

use crate::command::{
    Command, CommandFlags, CompletionInfo, DataBuffer, DeliveryState, DoneCallback, OPCODE_INQUIRY,
};
use crate::context::ScsiCore;
use crate::status::{normalize, AdapterResult};
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::Ordering;
use strata_hal::{Completion, IrqGuard};

/// Per-processor completion queue; interrupt-context inbox plus the drain's
/// running flag. The deferred-processing outbox lives on the drain's stack:
/// each pass moves the whole inbox there under one brief masked section.
#[derive(Debug, Default)]
pub(crate) struct DoneQueue {
    pub inbox: VecDeque<Arc<Command>>,
    pub running: bool,
}

/// Handle through which an adapter signals completion
///
/// Cloneable and callable from any context, including interrupt context and
/// from inside the transfer entry point itself.
#[derive(Clone)]
pub struct Completer {
    core: Arc<ScsiCore>,
}

impl Completer {
    pub(crate) fn new(core: Arc<ScsiCore>) -> Self {
        Self { core }
    }

    /// Report that `command` finished with `result`
    ///
    /// # Panics
    ///
    /// Panics if the command was already completed; reporting a completion
    /// twice is a fatal programming error in the backend.
    pub fn complete(&self, command: &Arc<Command>, result: AdapterResult) {
        self.core.command_done(command, result);
    }
}

impl core::fmt::Debug for Completer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Completer").finish_non_exhaustive()
    }
}

enum Intake {
    /// Queue on the observing processor's inbox
    Queue,
    /// Internal command: hand the result straight to the waiting stack
    Signal(Option<Arc<Completion>>),
    /// A delaying operation owns the command; delivery is replayed later
    Deferred,
}

impl ScsiCore {
    /// Completion intake; safe in interrupt context
    pub(crate) fn command_done(&self, command: &Arc<Command>, result: AdapterResult) {
        if self.diagnostics().force_drop()
            && command.flags().contains(CommandFlags::DROP_ON_COMPLETE)
        {
            log::warn!(
                "command {}: completion discarded by drop diagnostic",
                command.serial()
            );
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let intake = {
            let mut state = command.state();
            match state.delivery {
                DeliveryState::Idle => {
                    panic!("completion reported for a command no adapter owns")
                }
                DeliveryState::Issued { timer } => {
                    if let Some(timer) = timer {
                        // a lost race is fine; the timer body rechecks state
                        self.platform().cancel_timer(timer);
                    }
                    state.record_completion(result);
                    if state.flags.contains(CommandFlags::INTERNAL) {
                        state.delivery = DeliveryState::Done;
                        Intake::Signal(state.waiter.take())
                    } else {
                        state.delivery = DeliveryState::Completing;
                        Intake::Queue
                    }
                }
                DeliveryState::Delayed { attempted: false } => {
                    state.record_completion(result);
                    state.delivery = DeliveryState::Delayed { attempted: true };
                    Intake::Deferred
                }
                DeliveryState::Delayed { attempted: true }
                | DeliveryState::Completing
                | DeliveryState::Done => {
                    panic!(
                        "double completion on command {} - reused-command corruption imminent",
                        state.retired
                    )
                }
            }
        };

        match intake {
            Intake::Queue => self.enqueue_completion(command),
            Intake::Signal(waiter) => {
                if let Some(waiter) = waiter {
                    waiter.complete();
                }
            }
            Intake::Deferred => {}
        }
    }

    /// Park a claimed completion on the observing processor and signal its
    /// drain if one is not already scheduled
    pub(crate) fn enqueue_completion(&self, command: &Arc<Command>) {
        let platform = self.platform().as_ref();
        let guard = IrqGuard::new(platform);
        let processor = guard.processor();
        let signal = self.queues.with(&guard, |queue| {
            queue.inbox.push_back(Arc::clone(command));
            if queue.running {
                false
            } else {
                queue.running = true;
                true
            }
        });
        if signal {
            platform.request_drain(processor);
        }
    }

    /// Drain the current processor's completion queue
    ///
    /// Called by the embedder in a deferred context in response to
    /// [`Platform::request_drain`]. Runs until the queue is empty or the
    /// batch/time budget is spent, in which case it reschedules itself on
    /// the same processor.
    ///
    /// [`Platform::request_drain`]: strata_hal::Platform::request_drain
    pub fn service_completions(&self) {
        let platform = Arc::clone(self.platform());
        let start = platform.now();
        let mut handled = 0usize;

        loop {
            // move the whole inbox out under a brief interrupt-masked section
            let mut batch = {
                let guard = IrqGuard::new(platform.as_ref());
                self.queues
                    .with(&guard, |queue| core::mem::take(&mut queue.inbox))
            };

            if batch.is_empty() {
                // the running-flag clear and the enqueue-and-signal exclude
                // each other through local interrupt masking
                let guard = IrqGuard::new(platform.as_ref());
                let idle = self.queues.with(&guard, |queue| {
                    if queue.inbox.is_empty() {
                        queue.running = false;
                        true
                    } else {
                        false
                    }
                });
                if idle {
                    return;
                }
                continue;
            }

            while let Some(command) = batch.pop_front() {
                self.finish_one(command);
                handled += 1;

                let over_budget = platform.now().saturating_sub(start)
                    >= self.config().drain_budget_ns;
                if handled >= self.config().drain_batch_limit || over_budget {
                    let guard = IrqGuard::new(platform.as_ref());
                    let processor = guard.processor();
                    let reschedule = self.queues.with(&guard, |queue| {
                        while let Some(rest) = batch.pop_back() {
                            queue.inbox.push_front(rest);
                        }
                        if queue.inbox.is_empty() {
                            queue.running = false;
                            false
                        } else {
                            true
                        }
                    });
                    if reschedule {
                        platform.request_drain(processor);
                    }
                    return;
                }
            }
        }
    }

    /// Settle one completion: normalize, account, release, then notify
    fn finish_one(&self, command: Arc<Command>) {
        let (info, done, device): (CompletionInfo, Option<DoneCallback>, _) = {
            let mut state = command.state();
            debug_assert!(
                matches!(state.delivery, DeliveryState::Completing),
                "drained a command that never claimed delivery"
            );
            let result = normalize(state.outcome);
            let sense = if result.is_good() { None } else { state.sense };

            if state.opcode() == Some(OPCODE_INQUIRY) && result.is_good() {
                if let (Some(device), DataBuffer::Inline(buffer)) = (&state.device, &state.data) {
                    device.refresh_identification(buffer);
                }
            }

            state.delivery = DeliveryState::Done;
            let info = CompletionInfo {
                serial: state.retired,
                result,
                transferred: state.transferred,
                sense,
            };
            (info, state.done.take(), state.device.take())
        };

        let adapter = device.as_ref().and_then(|d| d.adapter());
        if let Some(device) = &device {
            device.remove_inflight(&command);
            device.outstanding_dec();
        }
        if let Some(adapter) = &adapter {
            adapter.busy_dec();
        }

        // release before notify: the callback may re-enter the issue path,
        // and must never find this command's locks held
        self.pool.release(command, adapter.as_deref());
        self.stats.completed.fetch_add(1, Ordering::Relaxed);

        if let Some(done) = done {
            done(info);
        }
    }
}
