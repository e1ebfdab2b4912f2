//! # Strata SCSI Mid-Layer
//!
//! The mid-layer sits between an upper storage stack and heterogeneous
//! adapter backends. It accepts command requests, forwards them to an
//! adapter's transfer entry point, and completes, times out, aborts, or
//! resets each command exactly once, despite concurrent issuance from
//! multiple processors, completion signals arriving in interrupt context,
//! and driver-initiated recovery racing natural completion.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Upper Storage Stack                        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  issue()                                 done callback          │
//! │     │                                         ▲                 │
//! │  ┌──▼──────────┐   ┌──────────────────┐   ┌──┴──────────────┐   │
//! │  │ Issue Path  │   │ Timeout / Abort  │   │   Completion    │   │
//! │  │  + gate     │   │     Engine       │   │   Dispatcher    │   │
//! │  └──┬──────────┘   └───────┬──────────┘   └──▲──────────────┘   │
//! │     │        ┌─────────────┘                 │ per-processor    │
//! │  ┌──▼────────▼───┐   ┌──────────────┐        │ drain            │
//! │  │ Command Pool  │   │ Reset Engine │   Completer::complete     │
//! │  └───────────────┘   └──────┬───────┘        │                  │
//! ├─────────────────────────────┼────────────────┼──────────────────┤
//! │        transfer / abort / device_reset / bus_reset              │
//! │                     Adapter Backends                            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Key guarantees
//!
//! - The done callback fires exactly once per issuance, on the processor
//!   that observed the completion.
//! - A command's serial number is nonzero exactly while an adapter owns it.
//! - Device and adapter counters return to their pre-issuance values after
//!   every completion path, natural or recovered.
//! - A command under delayed completion is never recycled until the
//!   delaying operation releases it.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;
#[cfg(test)]
extern crate std;

pub mod command;
pub mod context;
pub mod device;
pub mod dispatch;
pub mod issue;
pub mod pool;
pub mod ratelimit;
pub mod reset;
pub mod status;
pub mod timeout;


pub use command::{
    Cdb, Command, CommandFlags, CompletionInfo, DataBuffer, DataDirection, DoneCallback,
    ScatterList, SgSegment, MAX_CDB_LEN, OPCODE_INQUIRY,
};
pub use context::{CoreConfig, CoreStats, Diagnostics, ScsiCore, StatsSnapshot};
pub use device::{
    Adapter, AdapterConfig, AdapterOps, AdapterState, Device, DeviceAddress, DeviceConfig,
    DeviceState, DispatchStatus, InquiryData, TaskOutcome,
};
pub use dispatch::Completer;
pub use issue::IssueRequest;
pub use pool::{CommandCache, PoolStats};
pub use reset::BUS_RESET_SETTLE_MS;
pub use status::{
    normalize, AdapterResult, CommandResult, DeviceStatus, HostStatus, RawOutcome, SenseData,
    SENSE_BUFFER_SIZE,
};

use core::sync::atomic::{AtomicU64, Ordering};

/// Monotonic nonzero tag carried by a command while an adapter owns it
///
/// [`SerialNumber::NONE`] (zero) means "not adapter-owned"; the generator
/// never hands it out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SerialNumber(u64);

impl SerialNumber {
    /// The "not adapter-owned" sentinel
    pub const NONE: Self = Self(0);

    /// Whether this is the sentinel value
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Get the raw value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Draw the next serial from `counter`, retrying if the increment wraps to
/// zero
pub(crate) fn next_serial(counter: &AtomicU64) -> SerialNumber {
    loop {
        let raw = counter.fetch_add(1, Ordering::Relaxed);
        if raw != 0 {
            return SerialNumber(raw);
        }
    }
}

/// Result type for mid-layer operations
pub type ScsiResult<T> = Result<T, ScsiError>;

/// Errors that can occur in mid-layer operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScsiError {
    /// A resource allocation failed
    OutOfMemory,
    /// The operation is not legal in the current lifecycle state
    InvalidState,
    /// The referenced device or adapter is not registered
    NotFound,
    /// Commands are still outstanding
    Outstanding,
}

impl core::fmt::Display for ScsiError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ScsiError::OutOfMemory => write!(f, "out of memory"),
            ScsiError::InvalidState => write!(f, "invalid lifecycle state"),
            ScsiError::NotFound => write!(f, "no such device or adapter"),
            ScsiError::Outstanding => write!(f, "commands still outstanding"),
        }
    }
}

/// Reasons the issue path can refuse a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueError {
    /// Capacity or lifecycle-state gate closed; the caller may retry later
    WouldBlock,
    /// Command or data-buffer allocation failed
    OutOfMemory,
    /// The request addresses the adapter's own ID; never retryable
    InvalidTarget,
}

impl core::fmt::Display for IssueError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            IssueError::WouldBlock => write!(f, "device or adapter cannot accept commands now"),
            IssueError::OutOfMemory => write!(f, "out of memory"),
            IssueError::InvalidTarget => write!(f, "request addresses the adapter itself"),
        }
    }
}
