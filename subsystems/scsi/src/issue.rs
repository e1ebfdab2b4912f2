//! # Issue Path
//!
//! Validates a request, fills a pooled command, and hands it to the
//! adapter's transfer entry point. The capacity/state gate and its counter
//! increments are atomic under the adapter's issue lock, and the transfer
//! call itself happens while that lock is held. That is a deliberate
//! historical contract; callees must not reacquire the lock.

use crate::command::{
    Cdb, Command, CommandFlags, CompletionInfo, DataBuffer, DataDirection, DeliveryState,
    DoneCallback, OPCODE_INQUIRY,
};
use crate::context::ScsiCore;
use crate::device::{Adapter, Device, DispatchStatus};
use crate::dispatch::Completer;
use crate::status::{normalize, AdapterResult};
use crate::IssueError;
use alloc::sync::Arc;
use core::sync::atomic::Ordering;
use strata_hal::Completion;

/// Parameters for one command issuance
#[derive(Debug, Default)]
pub struct IssueRequest {
    /// Command descriptor block
    pub cdb: Cdb,
    /// Data phase direction
    pub direction: DataDirection,
    /// Data attached to the command
    pub data: DataBuffer,
    /// Requested transfer length in bytes
    pub required_len: u32,
    /// Minimum acceptable transfer; anything shorter with a claimed
    /// success is corrected to an error. Clamped to `required_len`
    pub min_transfer: u32,
    /// Attribute bits
    pub flags: CommandFlags,
    /// Timeout in milliseconds; armed only where the transport supports
    /// abort
    pub timeout_ms: Option<u64>,
}

impl ScsiCore {
    /// Issue one command against `device`
    ///
    /// On `Ok`, `done` will fire exactly once with the final status, even
    /// when the adapter rejects synchronously; in that case a synthesized
    /// busy result travels the normal completion channel.
    pub fn issue(
        self: &Arc<Self>,
        adapter: &Arc<Adapter>,
        device: &Arc<Device>,
        request: IssueRequest,
        done: DoneCallback,
    ) -> Result<(), IssueError> {
        let _command = self.start_command(adapter, device, request, Some(done), None)?;
        Ok(())
    }

    /// Issue an internal synthetic command and wait for its direct result
    ///
    /// The completion bypasses the dispatcher and is handed to this
    /// borrowed stack through a one-shot event. Only legal in block-safe
    /// contexts; used for diagnostic probes.
    pub fn issue_wait(
        self: &Arc<Self>,
        adapter: &Arc<Adapter>,
        device: &Arc<Device>,
        mut request: IssueRequest,
    ) -> Result<CompletionInfo, IssueError> {
        request.flags |= CommandFlags::INTERNAL;
        let waiter = Arc::new(Completion::new());
        let command =
            self.start_command(adapter, device, request, None, Some(Arc::clone(&waiter)))?;
        waiter.wait();
        Ok(self.harvest_internal(adapter, device, command))
    }

    fn start_command(
        self: &Arc<Self>,
        adapter: &Arc<Adapter>,
        device: &Arc<Device>,
        request: IssueRequest,
        done: Option<DoneCallback>,
        waiter: Option<Arc<Completion>>,
    ) -> Result<Arc<Command>, IssueError> {
        if device.address().id == adapter.this_id() {
            return Err(IssueError::InvalidTarget);
        }

        let command = self
            .pool
            .acquire(adapter)
            .map_err(|_| IssueError::OutOfMemory)?;

        // size the bounce buffer up front; this is the data-path allocation
        // that can fail
        let mut data = request.data;
        if let DataBuffer::Inline(buffer) = &mut data {
            let needed = request.required_len as usize;
            if buffer.len() < needed {
                if buffer.try_reserve(needed - buffer.len()).is_err() {
                    self.pool.release(command, Some(adapter));
                    return Err(IssueError::OutOfMemory);
                }
                buffer.resize(needed, 0);
            }
        }

        {
            let mut state = command.state();
            state.serial = self.next_serial();
            state.device = Some(Arc::clone(device));
            state.cdb = request.cdb;
            state.direction = request.direction;
            state.data = data;
            state.required_len = request.required_len;
            state.min_transfer = request.min_transfer.min(request.required_len);
            state.flags = request.flags;
            state.done = done;
            state.waiter = waiter;
        }

        let processor = self.platform().current_processor();
        let gate = adapter.issue_lock().lock(processor);

        let open = device.accepts_commands()
            && adapter.accepts_commands()
            && device.outstanding() < device.queue_depth()
            && adapter.busy() < adapter.can_queue();
        if !open {
            drop(gate);
            // no counter moved; the release zeroes the serial with the rest
            self.pool.release(command, Some(adapter));
            return Err(IssueError::WouldBlock);
        }

        device.outstanding_inc();
        adapter.busy_inc();
        device.push_inflight(&command);

        {
            // arm under the command lock so an expiry racing this store
            // cannot observe a pre-issuance state
            let mut state = command.state();
            let timer = match request.timeout_ms {
                Some(ms) if adapter.ops().supports_abort() => Some(self.arm_timeout(&command, ms)),
                _ => None,
            };
            state.delivery = DeliveryState::Issued { timer };
        }
        self.stats.issued.fetch_add(1, Ordering::Relaxed);

        let verdict = adapter
            .ops()
            .transfer(&command, Completer::new(Arc::clone(self)));
        drop(gate);

        if verdict == DispatchStatus::Rejected {
            self.stats.rejections.fetch_add(1, Ordering::Relaxed);
            // synthesized busy result through the normal channel; the
            // intake disarms the timer
            self.command_done(&command, AdapterResult::busy());
            adapter.note_rejection(self.platform().now());
        }

        Ok(command)
    }

    /// Collect the direct result of an internal command and release it
    fn harvest_internal(
        &self,
        adapter: &Arc<Adapter>,
        device: &Arc<Device>,
        command: Arc<Command>,
    ) -> CompletionInfo {
        let info = {
            let state = command.state();
            debug_assert!(
                matches!(state.delivery, DeliveryState::Done),
                "internal command harvested before its hand-off"
            );
            let result = normalize(state.outcome);
            let sense = if result.is_good() { None } else { state.sense };

            if state.opcode() == Some(OPCODE_INQUIRY) && result.is_good() {
                if let DataBuffer::Inline(buffer) = &state.data {
                    device.refresh_identification(buffer);
                }
            }

            CompletionInfo {
                serial: state.retired,
                result,
                transferred: state.transferred,
                sense,
            }
        };

        device.remove_inflight(&command);
        device.outstanding_dec();
        adapter.busy_dec();
        self.pool.release(command, Some(adapter));
        self.stats.completed.fetch_add(1, Ordering::Relaxed);
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CoreConfig;
    use crate::device::{AdapterConfig, AdapterOps, DeviceAddress, DeviceConfig, TaskOutcome};
    use alloc::boxed::Box;
    use alloc::vec::Vec;
    use std::sync::Mutex as StdMutex;
    use strata_hal::StubPlatform;

    /// Accepts every transfer and parks it for later completion
    struct PendingOps {
        pending: StdMutex<Vec<(Arc<Command>, Completer)>>,
    }

    impl PendingOps {
        fn new() -> Self {
            Self {
                pending: StdMutex::new(Vec::new()),
            }
        }
    }

    impl AdapterOps for PendingOps {
        fn name(&self) -> &str {
            "pending"
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

        fn abort(&self, _command: &Arc<Command>) -> TaskOutcome {
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
        ops: Arc<PendingOps>,
        adapter: Arc<crate::device::Adapter>,
        device: Arc<crate::device::Device>,
    }

    fn rig() -> Rig {
        let platform = Arc::new(StubPlatform::new(1));
        let core = ScsiCore::new(platform.clone(), CoreConfig::default());
        let ops = Arc::new(PendingOps::new());
        let adapter = core.register_adapter(ops.clone(), AdapterConfig::default());
        adapter.start().expect("start");
        let device = core.add_device(
            &adapter,
            DeviceConfig {
                address: DeviceAddress {
                    channel: 0,
                    id: 1,
                    lun: 0,
                },
                queue_depth: 2,
            },
        );
        device.start().expect("start");
        Rig {
            platform,
            core,
            ops,
            adapter,
            device,
        }
    }

    fn read_request(len: u32) -> IssueRequest {
        let mut cdb = Cdb::new();
        cdb.push(0x28);
        IssueRequest {
            cdb,
            direction: DataDirection::FromDevice,
            required_len: len,
            min_transfer: len,
            ..IssueRequest::default()
        }
    }

    #[test]
    fn accepted_command_is_tracked_until_completed() {
        let rig = rig();
        rig.core
            .issue(&rig.adapter, &rig.device, read_request(512), Box::new(|_| {}))
            .expect("issue");

        assert_eq!(rig.device.outstanding(), 1);
        assert_eq!(rig.adapter.busy(), 1);

        let (command, done) = rig.ops.pending.lock().unwrap().pop().expect("parked");
        assert!(!command.serial().is_none());
        done.complete(&command, AdapterResult::ok(512));
        rig.core.service_completions();

        assert_eq!(rig.device.outstanding(), 0);
        assert_eq!(rig.adapter.busy(), 0);
    }

    #[test]
    fn self_target_is_rejected_before_any_allocation() {
        let rig = rig();
        let lonely = rig.core.add_device(
            &rig.adapter,
            DeviceConfig {
                address: DeviceAddress {
                    channel: 0,
                    id: rig.adapter.this_id(),
                    lun: 0,
                },
                queue_depth: 2,
            },
        );
        lonely.start().expect("start");
        let verdict = rig
            .core
            .issue(&rig.adapter, &lonely, read_request(512), Box::new(|_| {}));
        assert_eq!(verdict, Err(IssueError::InvalidTarget));
        assert_eq!(rig.core.pool_stats().allocations, 1); // reserve priming only
    }

    #[test]
    fn closed_gate_rejects_without_touching_counters() {
        let rig = rig();
        rig.device.block().expect("block");
        let verdict = rig
            .core
            .issue(&rig.adapter, &rig.device, read_request(512), Box::new(|_| {}));
        assert_eq!(verdict, Err(IssueError::WouldBlock));
        assert_eq!(rig.device.outstanding(), 0);
        assert_eq!(rig.adapter.busy(), 0);
        assert_eq!(rig.core.stats().issued, 0);
    }

    #[test]
    fn queue_depth_gates_the_device() {
        let rig = rig();
        for _ in 0..2 {
            rig.core
                .issue(&rig.adapter, &rig.device, read_request(512), Box::new(|_| {}))
                .expect("issue");
        }
        let verdict = rig
            .core
            .issue(&rig.adapter, &rig.device, read_request(512), Box::new(|_| {}));
        assert_eq!(verdict, Err(IssueError::WouldBlock));
        assert_eq!(rig.device.outstanding(), 2);
    }

    #[test]
    fn timeout_is_armed_only_with_a_timeout_request() {
        let rig = rig();
        rig.core
            .issue(&rig.adapter, &rig.device, read_request(512), Box::new(|_| {}))
            .expect("issue");
        assert_eq!(rig.platform.armed_timers(), 0);

        let mut request = read_request(512);
        request.timeout_ms = Some(30_000);
        rig.core
            .issue(&rig.adapter, &rig.device, request, Box::new(|_| {}))
            .expect("issue");
        assert_eq!(rig.platform.armed_timers(), 1);
    }

    #[test]
    fn natural_completion_disarms_the_timer() {
        let rig = rig();
        let mut request = read_request(512);
        request.timeout_ms = Some(30_000);
        rig.core
            .issue(&rig.adapter, &rig.device, request, Box::new(|_| {}))
            .expect("issue");

        let (command, done) = rig.ops.pending.lock().unwrap().pop().expect("parked");
        done.complete(&command, AdapterResult::ok(512));
        assert_eq!(rig.platform.armed_timers(), 0);
        rig.core.service_completions();
    }
}
