//! # Devices and Adapters
//!
//! A [`Device`] is one logical target behind an [`Adapter`]; an adapter owns
//! its device set, a busy counter bounded by its configured limit, and the
//! lock everything beneath it nests under. Lock order is fixed: adapter lock,
//! then a command's lock, then a device list lock, never reversed.

use crate::command::Command;
use crate::dispatch::Completer;
use crate::ratelimit::RateLimited;
use crate::{ScsiError, ScsiResult};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use spin::Mutex;
use strata_hal::NonReentrant;

/// Synchronous verdict of the adapter's transfer entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStatus {
    /// The adapter took the command; completion arrives through the
    /// [`Completer`]
    Accepted,
    /// The adapter refused; the mid-layer synthesizes a busy completion
    Rejected,
}

/// Outcome of an abort or reset entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The operation took effect (or was already moot)
    Success,
    /// The adapter could not perform the operation
    Failed,
}

/// Entry points an adapter backend implements
///
/// `transfer` is invoked synchronously while the adapter's issue lock is
/// held; the callee must not call back into the issue path for the same
/// adapter. The recovery entry points are called from block-safe contexts
/// with no mid-layer locks held and may sleep.
pub trait AdapterOps: Send + Sync {
    /// Backend name for diagnostics
    fn name(&self) -> &str;

    /// Whether the transport can abort an in-flight command; gates timeout
    /// arming
    fn supports_abort(&self) -> bool {
        false
    }

    /// Start one command. Completion is signalled through `done`, from any
    /// context, possibly before this call returns
    fn transfer(&self, command: &Arc<Command>, done: Completer) -> DispatchStatus;

    /// Abort one in-flight command; bounded in meaning, not in time
    fn abort(&self, command: &Arc<Command>) -> TaskOutcome;

    /// Reset the target a synthetic command addresses; honors the LUN-reset
    /// flag when set
    fn device_reset(&self, command: &Arc<Command>) -> TaskOutcome;

    /// Reset the whole bus
    fn bus_reset(&self, command: &Arc<Command>) -> TaskOutcome;
}

/// Logical target address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceAddress {
    /// Channel (bus) number on the adapter
    pub channel: u32,
    /// Target ID
    pub id: u32,
    /// Logical unit number
    pub lun: u32,
}

/// Device lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Registered, not yet accepting commands
    Created,
    /// Accepting commands
    Running,
    /// Draining for a suspend-like operation; gate closed
    Quiesced,
    /// Administratively stopped; gate closed
    Blocked,
    /// Failed out of service
    Offline,
    /// Being torn down
    Deleted,
}

/// Cached identification data parsed from an INQUIRY response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InquiryData {
    /// Peripheral qualifier and device type byte
    pub peripheral: u8,
    /// Vendor identification, space-padded ASCII
    pub vendor: [u8; 8],
    /// Product identification, space-padded ASCII
    pub model: [u8; 16],
    /// Product revision, space-padded ASCII
    pub revision: [u8; 4],
}

impl InquiryData {
    /// Minimum response length this parser accepts
    pub const MIN_LEN: usize = 36;

    /// Parse a standard INQUIRY response
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < Self::MIN_LEN {
            return None;
        }
        let mut vendor = [0u8; 8];
        let mut model = [0u8; 16];
        let mut revision = [0u8; 4];
        vendor.copy_from_slice(&data[8..16]);
        model.copy_from_slice(&data[16..32]);
        revision.copy_from_slice(&data[32..36]);
        Some(Self {
            peripheral: data[0],
            vendor,
            model,
            revision,
        })
    }

    /// Vendor identification as trimmed text, when valid ASCII
    pub fn vendor_str(&self) -> Option<&str> {
        core::str::from_utf8(&self.vendor).ok().map(str::trim_end)
    }

    /// Product identification as trimmed text, when valid ASCII
    pub fn model_str(&self) -> Option<&str> {
        core::str::from_utf8(&self.model).ok().map(str::trim_end)
    }
}

/// Device registration parameters
#[derive(Debug, Clone, Copy)]
pub struct DeviceConfig {
    /// Target address
    pub address: DeviceAddress,
    /// Maximum commands in flight on this device
    pub queue_depth: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: DeviceAddress::default(),
            queue_depth: 8,
        }
    }
}

/// One logical target
pub struct Device {
    address: DeviceAddress,
    queue_depth: AtomicU32,
    outstanding: AtomicU32,
    state: Mutex<DeviceState>,
    /// In-flight commands in arrival order; the list lock is distinct from
    /// every per-command lock
    inflight: Mutex<Vec<Arc<Command>>>,
    inquiry: Mutex<Option<InquiryData>>,
    adapter: Weak<Adapter>,
}

impl Device {
    pub(crate) fn new(config: DeviceConfig, adapter: &Arc<Adapter>) -> Arc<Self> {
        Arc::new(Self {
            address: config.address,
            queue_depth: AtomicU32::new(config.queue_depth),
            outstanding: AtomicU32::new(0),
            state: Mutex::new(DeviceState::Created),
            inflight: Mutex::new(Vec::new()),
            inquiry: Mutex::new(None),
            adapter: Arc::downgrade(adapter),
        })
    }

    /// Target address
    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    /// Current lifecycle state
    pub fn state(&self) -> DeviceState {
        *self.state.lock()
    }

    /// Commands currently in flight
    pub fn outstanding(&self) -> u32 {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Current queue-depth limit
    pub fn queue_depth(&self) -> u32 {
        self.queue_depth.load(Ordering::SeqCst)
    }

    /// Change the queue-depth limit; takes effect at the next issue gate
    pub fn set_queue_depth(&self, depth: u32) {
        self.queue_depth.store(depth.max(1), Ordering::SeqCst);
    }

    /// Cached identification data, if any INQUIRY has completed
    pub fn identification(&self) -> Option<InquiryData> {
        *self.inquiry.lock()
    }

    /// Owning adapter, unless it is already torn down
    pub fn adapter(&self) -> Option<Arc<Adapter>> {
        self.adapter.upgrade()
    }

    /// Start accepting commands
    pub fn start(&self) -> ScsiResult<()> {
        let mut state = self.state.lock();
        match *state {
            DeviceState::Created => {
                *state = DeviceState::Running;
                Ok(())
            }
            DeviceState::Running => Ok(()),
            DeviceState::Quiesced
            | DeviceState::Blocked
            | DeviceState::Offline
            | DeviceState::Deleted => Err(ScsiError::InvalidState),
        }
    }

    /// Close the issue gate administratively
    pub fn block(&self) -> ScsiResult<()> {
        let mut state = self.state.lock();
        match *state {
            DeviceState::Running | DeviceState::Created => {
                *state = DeviceState::Blocked;
                Ok(())
            }
            DeviceState::Blocked => Ok(()),
            DeviceState::Quiesced | DeviceState::Offline | DeviceState::Deleted => {
                Err(ScsiError::InvalidState)
            }
        }
    }

    /// Reopen the issue gate after [`Device::block`]
    pub fn unblock(&self) -> ScsiResult<()> {
        let mut state = self.state.lock();
        match *state {
            DeviceState::Blocked => {
                *state = DeviceState::Running;
                Ok(())
            }
            DeviceState::Running => Ok(()),
            DeviceState::Created
            | DeviceState::Quiesced
            | DeviceState::Offline
            | DeviceState::Deleted => Err(ScsiError::InvalidState),
        }
    }

    /// Close the gate for a drain; the block-safe wait lives on the core
    pub(crate) fn begin_quiesce(&self) -> ScsiResult<()> {
        let mut state = self.state.lock();
        match *state {
            DeviceState::Running => {
                *state = DeviceState::Quiesced;
                Ok(())
            }
            DeviceState::Quiesced => Ok(()),
            DeviceState::Created
            | DeviceState::Blocked
            | DeviceState::Offline
            | DeviceState::Deleted => Err(ScsiError::InvalidState),
        }
    }

    /// Resume after a quiesce
    pub fn resume(&self) -> ScsiResult<()> {
        let mut state = self.state.lock();
        match *state {
            DeviceState::Quiesced => {
                *state = DeviceState::Running;
                Ok(())
            }
            DeviceState::Running => Ok(()),
            DeviceState::Created
            | DeviceState::Blocked
            | DeviceState::Offline
            | DeviceState::Deleted => Err(ScsiError::InvalidState),
        }
    }

    /// Fail the device out of service
    pub fn set_offline(&self) -> ScsiResult<()> {
        let mut state = self.state.lock();
        match *state {
            DeviceState::Deleted => Err(ScsiError::InvalidState),
            _ => {
                *state = DeviceState::Offline;
                Ok(())
            }
        }
    }

    pub(crate) fn mark_deleted(&self) -> ScsiResult<()> {
        if self.outstanding() != 0 {
            return Err(ScsiError::Outstanding);
        }
        *self.state.lock() = DeviceState::Deleted;
        Ok(())
    }

    /// Whether the issue gate is open
    pub(crate) fn accepts_commands(&self) -> bool {
        *self.state.lock() == DeviceState::Running
    }

    pub(crate) fn push_inflight(&self, command: &Arc<Command>) {
        self.inflight.lock().push(Arc::clone(command));
    }

    pub(crate) fn remove_inflight(&self, command: &Arc<Command>) -> bool {
        let mut list = self.inflight.lock();
        match list.iter().position(|c| Arc::ptr_eq(c, command)) {
            Some(index) => {
                list.remove(index);
                true
            }
            None => false,
        }
    }

    /// Commands currently linked on the in-flight list
    pub fn inflight_len(&self) -> usize {
        self.inflight.lock().len()
    }

    pub(crate) fn outstanding_inc(&self) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn outstanding_dec(&self) {
        let previous = self.outstanding.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous != 0, "outstanding count underflow");
    }

    /// Refresh the cached identification from an INQUIRY response
    pub(crate) fn refresh_identification(&self, data: &[u8]) {
        if let Some(parsed) = InquiryData::parse(data) {
            log::debug!(
                "device {:?}: identification refreshed ({})",
                self.address,
                parsed.vendor_str().unwrap_or("?")
            );
            *self.inquiry.lock() = Some(parsed);
        }
    }
}

impl core::fmt::Debug for Device {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Device")
            .field("address", &self.address)
            .field("state", &self.state())
            .field("outstanding", &self.outstanding())
            .finish_non_exhaustive()
    }
}

/// Adapter lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    /// Registered, not yet accepting commands
    Created,
    /// Accepting commands
    Running,
    /// Error recovery owns the adapter; gate closed
    Recovery,
    /// Being torn down
    Deleting,
}

/// Adapter registration parameters
#[derive(Debug, Clone, Copy)]
pub struct AdapterConfig {
    /// The adapter's own target ID on its bus
    pub this_id: u32,
    /// Maximum commands in flight across the whole adapter
    pub can_queue: u32,
    /// Coalescing window for rejection diagnostics, in milliseconds
    pub reject_window_ms: u64,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            this_id: 7,
            can_queue: 32,
            reject_window_ms: 5_000,
        }
    }
}

/// One adapter backend and the mid-layer state wrapped around it
pub struct Adapter {
    ops: Arc<dyn AdapterOps>,
    this_id: u32,
    can_queue: u32,
    busy: AtomicU32,
    state: Mutex<AdapterState>,
    self_blocked: AtomicBool,
    /// Issuance serialization; held across the synchronous transfer call
    issue_lock: NonReentrant<()>,
    devices: Mutex<Vec<Arc<Device>>>,
    /// One-deep emergency reserve, refilled ahead of the shared free list
    reserve: Mutex<Option<Arc<Command>>>,
    /// The reused synthetic task-management command
    tm_command: Mutex<Option<Arc<Command>>>,
    rejections: RateLimited,
}

impl Adapter {
    pub(crate) fn new(ops: Arc<dyn AdapterOps>, config: AdapterConfig) -> Arc<Self> {
        Arc::new(Self {
            ops,
            this_id: config.this_id,
            can_queue: config.can_queue.max(1),
            busy: AtomicU32::new(0),
            state: Mutex::new(AdapterState::Created),
            self_blocked: AtomicBool::new(false),
            issue_lock: NonReentrant::new(()),
            devices: Mutex::new(Vec::new()),
            reserve: Mutex::new(None),
            tm_command: Mutex::new(None),
            rejections: RateLimited::new(config.reject_window_ms),
        })
    }

    /// Backend entry points
    pub fn ops(&self) -> &dyn AdapterOps {
        &*self.ops
    }

    /// The adapter's own target ID
    pub fn this_id(&self) -> u32 {
        self.this_id
    }

    /// Configured busy limit
    pub fn can_queue(&self) -> u32 {
        self.can_queue
    }

    /// Commands currently in flight across the adapter
    pub fn busy(&self) -> u32 {
        self.busy.load(Ordering::SeqCst)
    }

    /// Current lifecycle state
    pub fn state(&self) -> AdapterState {
        *self.state.lock()
    }

    /// Registered devices
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.lock().clone()
    }

    /// Stop accepting commands without a state change (driver throttle)
    pub fn self_block(&self) {
        self.self_blocked.store(true, Ordering::SeqCst);
    }

    /// Undo [`Adapter::self_block`]
    pub fn self_unblock(&self) {
        self.self_blocked.store(false, Ordering::SeqCst);
    }

    /// Whether the driver throttle is engaged
    pub fn is_self_blocked(&self) -> bool {
        self.self_blocked.load(Ordering::SeqCst)
    }

    /// Start accepting commands
    pub fn start(&self) -> ScsiResult<()> {
        let mut state = self.state.lock();
        match *state {
            AdapterState::Created => {
                *state = AdapterState::Running;
                Ok(())
            }
            AdapterState::Running => Ok(()),
            AdapterState::Recovery | AdapterState::Deleting => Err(ScsiError::InvalidState),
        }
    }

    /// Hand the adapter to error recovery; the gate closes
    pub fn enter_recovery(&self) -> ScsiResult<()> {
        let mut state = self.state.lock();
        match *state {
            AdapterState::Running => {
                *state = AdapterState::Recovery;
                log::info!("{}: entering recovery", self.ops.name());
                Ok(())
            }
            AdapterState::Recovery => Ok(()),
            AdapterState::Created | AdapterState::Deleting => Err(ScsiError::InvalidState),
        }
    }

    /// Return the adapter to service after recovery
    pub fn leave_recovery(&self) -> ScsiResult<()> {
        let mut state = self.state.lock();
        match *state {
            AdapterState::Recovery => {
                *state = AdapterState::Running;
                log::info!("{}: recovery complete", self.ops.name());
                Ok(())
            }
            AdapterState::Running => Ok(()),
            AdapterState::Created | AdapterState::Deleting => Err(ScsiError::InvalidState),
        }
    }

    pub(crate) fn mark_deleting(&self) -> ScsiResult<()> {
        if self.busy() != 0 {
            return Err(ScsiError::Outstanding);
        }
        *self.state.lock() = AdapterState::Deleting;
        Ok(())
    }

    /// Whether the issue gate is open at the adapter level
    pub(crate) fn accepts_commands(&self) -> bool {
        *self.state.lock() == AdapterState::Running && !self.is_self_blocked()
    }

    pub(crate) fn issue_lock(&self) -> &NonReentrant<()> {
        &self.issue_lock
    }

    pub(crate) fn busy_inc(&self) {
        self.busy.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn busy_dec(&self) {
        let previous = self.busy.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous != 0, "adapter busy count underflow");
    }

    pub(crate) fn attach_device(&self, device: &Arc<Device>) {
        self.devices.lock().push(Arc::clone(device));
    }

    pub(crate) fn detach_device(&self, device: &Arc<Device>) -> bool {
        let mut devices = self.devices.lock();
        match devices.iter().position(|d| Arc::ptr_eq(d, device)) {
            Some(index) => {
                devices.remove(index);
                true
            }
            None => false,
        }
    }

    /// Take the emergency reserve command, if present
    pub(crate) fn take_reserve(&self) -> Option<Arc<Command>> {
        self.reserve.lock().take()
    }

    /// Offer a recycled command to the reserve; hands it back when full
    pub(crate) fn refill_reserve(&self, command: Arc<Command>) -> Option<Arc<Command>> {
        let mut reserve = self.reserve.lock();
        match *reserve {
            None => {
                *reserve = Some(command);
                None
            }
            Some(_) => Some(command),
        }
    }

    pub(crate) fn tm_slot(&self) -> &Mutex<Option<Arc<Command>>> {
        &self.tm_command
    }

    /// Feed one synchronous rejection into the coalescer, logging when a
    /// window closes
    pub(crate) fn note_rejection(&self, now: strata_hal::Nanoseconds) {
        if let Some(count) = self.rejections.note(now) {
            log::warn!(
                "{}: transfer rejected, {} occurrences coalesced",
                self.ops.name(),
                count
            );
        }
    }

    /// Emit any pending coalesced rejection diagnostic whose window closed
    pub fn flush_diagnostics(&self, now: strata_hal::Nanoseconds) {
        if let Some(count) = self.rejections.flush(now) {
            log::warn!(
                "{}: transfer rejected, {} occurrences coalesced",
                self.ops.name(),
                count
            );
        }
    }

    /// Rejections counted in the currently open diagnostic window
    pub fn pending_rejections(&self) -> u64 {
        self.rejections.pending()
    }
}

impl core::fmt::Debug for Adapter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Adapter")
            .field("name", &self.ops.name())
            .field("state", &self.state())
            .field("busy", &self.busy())
            .finish_non_exhaustive()
    }
}
