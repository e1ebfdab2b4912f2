//! # Command Model
//!
//! One [`Command`] is one SCSI operation in flight, from issuance to
//! completion. The issue path owns a command exclusively until the adapter
//! accepts it; after that the completion dispatcher, the timeout/abort
//! engine, and the command's own lock arbitrate it jointly, and it returns
//! to the pool on release.

use crate::device::Device;
use crate::status::{AdapterResult, RawOutcome, SenseData};
use crate::{ScsiError, ScsiResult, SerialNumber};
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use arrayvec::ArrayVec;
use bitflags::bitflags;
use spin::{Mutex, MutexGuard};
use static_assertions::const_assert;
use strata_hal::{Completion, TimerHandle};

/// Maximum command descriptor block length
pub const MAX_CDB_LEN: usize = 16;

/// Opcode of the identification command whose response refreshes the
/// device's cached metadata
pub const OPCODE_INQUIRY: u8 = 0x12;

/// Command descriptor block, at most [`MAX_CDB_LEN`] bytes
pub type Cdb = ArrayVec<u8, MAX_CDB_LEN>;

/// Direction of the data phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataDirection {
    /// No data phase
    #[default]
    None,
    /// Write: data moves to the target
    ToDevice,
    /// Read: data moves from the target
    FromDevice,
}

/// One scatter-list segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgSegment {
    /// Segment base (bus address space; opaque to this layer)
    pub base: u64,
    /// Segment length in bytes
    pub len: u32,
}

/// Reference to an externally-built scatter list
///
/// Construction of the underlying segments is the upper layer's business;
/// this layer only carries the reference and its failure mode.
#[derive(Debug, Clone, Default)]
pub struct ScatterList {
    segments: Vec<SgSegment>,
}

impl ScatterList {
    /// Copy `segments` into a new list, failing cleanly on allocation error
    pub fn try_from_segments(segments: &[SgSegment]) -> ScsiResult<Self> {
        let mut owned = Vec::new();
        owned
            .try_reserve_exact(segments.len())
            .map_err(|_| ScsiError::OutOfMemory)?;
        owned.extend_from_slice(segments);
        Ok(Self { segments: owned })
    }

    /// The segments
    pub fn segments(&self) -> &[SgSegment] {
        &self.segments
    }

    /// Number of segments
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Whether the list has no segments
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Total byte count across all segments
    pub fn total_bytes(&self) -> u64 {
        self.segments.iter().map(|s| u64::from(s.len)).sum()
    }
}

/// Data attached to a command
#[derive(Debug, Clone, Default)]
pub enum DataBuffer {
    /// No data phase
    #[default]
    None,
    /// Externally-owned scatter list
    Scatter(ScatterList),
    /// Bounce buffer owned by the command; used by internal probes so the
    /// dispatcher can inspect the response
    Inline(Vec<u8>),
}

bitflags! {
    /// Auxiliary command attribute bits
    ///
    /// The delivery lifecycle itself is [`DeliveryState`], not a bit here;
    /// these are the attributes that do not participate in the completion
    /// state machine.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CommandFlags: u32 {
        /// Synthetic command owned by this layer; completion is handed off
        /// directly instead of through the dispatcher
        const INTERNAL = 1 << 0;
        /// Task-management request; exempt from counter and serial
        /// bookkeeping
        const TASK_MANAGEMENT = 1 << 1;
        /// Crash-dump I/O; adapters may take reduced-resource paths
        const DUMP = 1 << 2;
        /// Eligible for the forced drop-on-complete diagnostic
        const DROP_ON_COMPLETE = 1 << 3;
        /// Ask the adapter to reset the LUN rather than the whole target
        const LUN_RESET = 1 << 4;
    }
}

/// Where a command is in its delivery lifecycle
///
/// Guarded by the command lock; every transition is an exhaustive match in
/// the engines. `Issued` corresponds to "needs completion", `Delayed` to
/// "delay completion" with its "completion attempted" companion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum DeliveryState {
    /// Not owned by an adapter (pooled, or being filled)
    #[default]
    Idle,
    /// Handed to the adapter; no callback delivered yet
    Issued {
        /// Armed timeout, if the transport supports abort
        timer: Option<TimerHandle>,
    },
    /// Natural completion claimed delivery; queued for drain
    Completing,
    /// Timeout or abort in progress; an observed completion is deferred
    Delayed {
        /// A completion arrived while delayed and awaits replay
        attempted: bool,
    },
    /// Callback delivered (or never required); safe to release
    Done,
}

/// Snapshot delivered to the upstream callback
///
/// Passed by value: by the time the callback runs, the command it describes
/// has already been released back to the pool.
#[derive(Debug, Clone)]
pub struct CompletionInfo {
    /// Serial the command carried while in flight
    pub serial: SerialNumber,
    /// Normalized result pair
    pub result: crate::status::CommandResult,
    /// Bytes actually moved
    pub transferred: u32,
    /// Sense data, present on any non-good outcome that carried it
    pub sense: Option<SenseData>,
}

/// Upstream completion callback, invoked at most once per issuance
pub type DoneCallback = Box<dyn FnOnce(CompletionInfo) + Send + 'static>;

/// Mutable command fields; every access goes through the command lock
#[derive(Default)]
pub(crate) struct CommandState {
    pub delivery: DeliveryState,
    pub flags: CommandFlags,
    pub serial: SerialNumber,
    /// Serial retired at completion intake, for upstream reporting
    pub retired: SerialNumber,
    pub device: Option<Arc<Device>>,
    pub cdb: Cdb,
    pub direction: DataDirection,
    pub data: DataBuffer,
    pub required_len: u32,
    pub min_transfer: u32,
    pub transferred: u32,
    pub outcome: RawOutcome,
    pub sense: Option<SenseData>,
    pub done: Option<DoneCallback>,
    pub waiter: Option<Arc<Completion>>,
}

impl CommandState {
    /// First CDB byte
    pub fn opcode(&self) -> Option<u8> {
        self.cdb.first().copied()
    }

    /// Record a completion observed from the adapter: retire the serial and
    /// correct byte-count misbehavior before the result is mapped.
    ///
    /// Overrun is defensive (should not occur): the count is discarded and a
    /// claimed success becomes a hard error. Underrun with a claimed success
    /// becomes a hard error with the count preserved.
    pub fn record_completion(&mut self, result: AdapterResult) {
        let mut outcome = result.outcome;
        let mut transferred = result.transferred;
        if transferred > self.required_len {
            log::warn!(
                "command {}: overrun, {} of {} bytes; discarding count",
                self.serial,
                transferred,
                self.required_len
            );
            transferred = 0;
            if outcome == RawOutcome::Ok {
                outcome = RawOutcome::HardError;
            }
        } else if outcome == RawOutcome::Ok && transferred < self.min_transfer {
            log::warn!(
                "command {}: underrun, {} of at least {} bytes",
                self.serial,
                transferred,
                self.min_transfer
            );
            outcome = RawOutcome::HardError;
        }
        self.outcome = outcome;
        self.transferred = transferred;
        self.sense = result.sense;
        self.retired = self.serial;
        self.serial = SerialNumber::NONE;
    }
}

/// One SCSI operation and its bookkeeping, issuance to completion
pub struct Command {
    state: Mutex<CommandState>,
}

const_assert!(core::mem::size_of::<Command>() <= 512);

impl Command {
    /// Create a blank command (pool use)
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(CommandState::default()),
        }
    }

    /// Lock the mutable fields
    pub(crate) fn state(&self) -> MutexGuard<'_, CommandState> {
        self.state.lock()
    }

    /// Zero the mutable fields for recycling
    pub(crate) fn reset(&self) {
        *self.state.lock() = CommandState::default();
    }

    /// Current serial number; [`SerialNumber::NONE`] unless adapter-owned
    pub fn serial(&self) -> SerialNumber {
        self.state.lock().serial
    }

    /// Attribute bits
    pub fn flags(&self) -> CommandFlags {
        self.state.lock().flags
    }

    /// Copy of the command descriptor block
    pub fn cdb(&self) -> Cdb {
        self.state.lock().cdb.clone()
    }

    /// Data phase direction
    pub fn direction(&self) -> DataDirection {
        self.state.lock().direction
    }

    /// Requested transfer length in bytes
    pub fn required_len(&self) -> u32 {
        self.state.lock().required_len
    }

    /// Device the command targets, while it is attached
    pub fn device(&self) -> Option<Arc<Device>> {
        self.state.lock().device.clone()
    }

    /// Run `f` against the inline bounce buffer, if this command has one
    ///
    /// Adapter backends use this to fill probe responses.
    pub fn with_inline_data<R>(&self, f: impl FnOnce(&mut Vec<u8>) -> R) -> Option<R> {
        let mut state = self.state.lock();
        match &mut state.data {
            DataBuffer::Inline(buffer) => Some(f(buffer)),
            _ => None,
        }
    }

    /// Run `f` against the scatter list, if this command carries one
    pub fn with_scatter<R>(&self, f: impl FnOnce(&ScatterList) -> R) -> Option<R> {
        let state = self.state.lock();
        match &state.data {
            DataBuffer::Scatter(list) => Some(f(list)),
            _ => None,
        }
    }
}

impl core::fmt::Debug for Command {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.state.try_lock() {
            Some(state) => f
                .debug_struct("Command")
                .field("serial", &state.serial)
                .field("delivery", &state.delivery)
                .field("flags", &state.flags)
                .finish_non_exhaustive(),
            None => f.debug_struct("Command").finish_non_exhaustive(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn in_flight_state(required: u32, min: u32) -> CommandState {
        CommandState {
            serial: crate::next_serial(&core::sync::atomic::AtomicU64::new(7)),
            delivery: DeliveryState::Issued { timer: None },
            required_len: required,
            min_transfer: min,
            ..CommandState::default()
        }
    }

    #[test]
    fn underrun_with_claimed_success_becomes_hard_error() {
        let mut state = in_flight_state(512, 512);
        state.record_completion(AdapterResult::ok(256));
        assert_eq!(state.outcome, RawOutcome::HardError);
        assert_eq!(state.transferred, 256);
        assert!(state.serial.is_none());
        assert_eq!(state.retired.as_u64(), 7);
    }

    #[test]
    fn underrun_on_error_outcome_is_left_alone() {
        let mut state = in_flight_state(512, 512);
        state.record_completion(AdapterResult {
            outcome: RawOutcome::MediaError,
            transferred: 0,
            sense: None,
        });
        assert_eq!(state.outcome, RawOutcome::MediaError);
    }

    #[test]
    fn overrun_clamps_count_and_forces_error() {
        let mut state = in_flight_state(512, 0);
        state.record_completion(AdapterResult::ok(1024));
        assert_eq!(state.outcome, RawOutcome::HardError);
        assert_eq!(state.transferred, 0);
    }

    #[test]
    fn exact_transfer_passes_through_unmodified() {
        let mut state = in_flight_state(512, 512);
        state.record_completion(AdapterResult::ok(512));
        assert_eq!(state.outcome, RawOutcome::Ok);
        assert_eq!(state.transferred, 512);
    }

    #[test]
    fn inline_buffer_is_reachable_for_backends() {
        let command = Command::new();
        command.state().data = DataBuffer::Inline(alloc::vec![0u8; 4]);
        let len = command.with_inline_data(|buffer| {
            buffer[0] = 0xFF;
            buffer.len()
        });
        assert_eq!(len, Some(4));
        assert_eq!(command.with_scatter(|_| ()), None);
    }

    #[test]
    fn scatter_list_reports_totals() {
        let list = ScatterList::try_from_segments(&[
            SgSegment { base: 0, len: 512 },
            SgSegment {
                base: 4096,
                len: 1024,
            },
        ])
        .expect("allocation");
        assert_eq!(list.len(), 2);
        assert_eq!(list.total_bytes(), 1536);
    }
}
