//! # Completion Status Model
//!
//! Raw outcome codes as adapters report them, the normalized
//! (host, device) status pair delivered upstream, and the fixed mapping
//! between the two.

/// Raw completion code reported by an adapter backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RawOutcome {
    /// Transfer finished without incident
    #[default]
    Ok,
    /// Target or adapter is momentarily busy; retryable upstream
    Busy,
    /// Recoverable error; retryable upstream
    SoftError,
    /// Medium-level failure
    MediaError,
    /// Unrecoverable adapter or target failure
    HardError,
    /// The request itself was malformed for this target
    Invalid,
    /// The adapter gave up waiting on the target
    Timeout,
    /// Sense data accompanies the completion
    SenseAvailable,
}

/// Normalized adapter-side status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostStatus {
    /// The adapter moved the data as asked
    #[default]
    Ok,
    /// The adapter failed the transfer
    Error,
    /// The transfer timed out
    Timeout,
}

/// Normalized target-side status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceStatus {
    /// The target accepted and executed the command
    #[default]
    Good,
    /// The target is busy; retry later
    Busy,
    /// The target has sense data pending
    CheckCondition,
}

/// Final normalized result pair delivered upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandResult {
    /// Adapter-side outcome
    pub host: HostStatus,
    /// Target-side outcome
    pub device: DeviceStatus,
}

impl CommandResult {
    /// The all-clear result
    pub const GOOD: Self = Self {
        host: HostStatus::Ok,
        device: DeviceStatus::Good,
    };

    /// Whether both sides report success
    pub fn is_good(self) -> bool {
        self == Self::GOOD
    }
}

/// Map a raw adapter outcome to the normalized pair
///
/// The table is fixed: busy and soft errors surface as a busy target so the
/// upper stack retries; media, hard, and invalid outcomes surface as a host
/// error with the target held blameless; sense-bearing completions pass
/// through as check-condition.
pub fn normalize(raw: RawOutcome) -> CommandResult {
    match raw {
        RawOutcome::Ok => CommandResult::GOOD,
        RawOutcome::Busy | RawOutcome::SoftError => CommandResult {
            host: HostStatus::Ok,
            device: DeviceStatus::Busy,
        },
        RawOutcome::MediaError | RawOutcome::HardError | RawOutcome::Invalid => CommandResult {
            host: HostStatus::Error,
            device: DeviceStatus::Good,
        },
        RawOutcome::Timeout => CommandResult {
            host: HostStatus::Timeout,
            device: DeviceStatus::Good,
        },
        RawOutcome::SenseAvailable => CommandResult {
            host: HostStatus::Ok,
            device: DeviceStatus::CheckCondition,
        },
    }
}

/// Size of the fixed sense buffer
pub const SENSE_BUFFER_SIZE: usize = 18;

/// Fixed-size sense data block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenseData {
    bytes: [u8; SENSE_BUFFER_SIZE],
    len: u8,
}

impl SenseData {
    /// Capture sense bytes, truncating to the fixed buffer size
    pub fn new(source: &[u8]) -> Self {
        let mut bytes = [0u8; SENSE_BUFFER_SIZE];
        let len = source.len().min(SENSE_BUFFER_SIZE);
        bytes[..len].copy_from_slice(&source[..len]);
        Self {
            bytes,
            len: len as u8,
        }
    }

    /// The captured bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// Sense key (low nibble of byte 2), if captured
    pub fn key(&self) -> Option<u8> {
        self.as_bytes().get(2).map(|b| b & 0x0F)
    }
}

/// What an adapter hands back when a command finishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterResult {
    /// Raw outcome code
    pub outcome: RawOutcome,
    /// Bytes actually moved
    pub transferred: u32,
    /// Sense data, if the target produced any
    pub sense: Option<SenseData>,
}

impl AdapterResult {
    /// Successful completion moving `transferred` bytes
    pub fn ok(transferred: u32) -> Self {
        Self {
            outcome: RawOutcome::Ok,
            transferred,
            sense: None,
        }
    }

    /// Busy rejection; nothing moved
    pub fn busy() -> Self {
        Self {
            outcome: RawOutcome::Busy,
            transferred: 0,
            sense: None,
        }
    }

    /// Failure with `outcome`; nothing moved
    pub fn error(outcome: RawOutcome) -> Self {
        Self {
            outcome,
            transferred: 0,
            sense: None,
        }
    }

    /// Attach sense data
    pub fn with_sense(mut self, sense: SenseData) -> Self {
        self.sense = Some(sense);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_maps_every_raw_code() {
        assert_eq!(normalize(RawOutcome::Ok), CommandResult::GOOD);
        for raw in [RawOutcome::Busy, RawOutcome::SoftError] {
            let result = normalize(raw);
            assert_eq!(result.host, HostStatus::Ok);
            assert_eq!(result.device, DeviceStatus::Busy);
        }
        for raw in [
            RawOutcome::MediaError,
            RawOutcome::HardError,
            RawOutcome::Invalid,
        ] {
            let result = normalize(raw);
            assert_eq!(result.host, HostStatus::Error);
            assert_eq!(result.device, DeviceStatus::Good);
        }
        assert_eq!(normalize(RawOutcome::Timeout).host, HostStatus::Timeout);
        let sense = normalize(RawOutcome::SenseAvailable);
        assert_eq!(sense.host, HostStatus::Ok);
        assert_eq!(sense.device, DeviceStatus::CheckCondition);
    }

    #[test]
    fn sense_truncates_and_exposes_key() {
        let long = [0xAAu8; 32];
        let sense = SenseData::new(&long);
        assert_eq!(sense.as_bytes().len(), SENSE_BUFFER_SIZE);

        let keyed = SenseData::new(&[0x70, 0x00, 0x03, 0x00]);
        assert_eq!(keyed.key(), Some(0x03));
        assert_eq!(SenseData::new(&[]).key(), None);
    }
}
