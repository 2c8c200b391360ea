//! Error taxonomy of a programming run.
use std::fmt;

use crate::device::FuseCategory;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Signature did not match after all reset-and-enable attempts.
    #[error("device not detected: expected signature {expected:#06x}, found {found:#06x}")]
    DeviceNotDetected { expected: u16, found: u16 },
    /// The bus could not be driven (I/O error, timeout).
    #[error("transport fault: {0:#}")]
    TransportFault(anyhow::Error),
    /// The target answered chip erase out of sync; the bus itself worked.
    #[error("chip erase rejected by the target")]
    EraseFault,
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("page write failed at {address:#06x} after {attempts} attempts")]
    PageWriteFault { address: u32, attempts: u32 },
    #[error("verify mismatch at {address:#06x} after {attempts} attempts")]
    VerifyMismatch { address: u32, attempts: u32 },
    #[error("{category} fuse write failed: wrote {expected:#04x}, read {found:#04x}")]
    FuseWriteFault {
        category: FuseCategory,
        expected: u8,
        found: u8,
    },
    #[error("programming cancelled")]
    Cancelled,
    #[error("invalid catalog: {0}")]
    Catalog(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn transport(err: anyhow::Error) -> Self {
        Error::TransportFault(err)
    }

    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Error::MalformedPayload(msg.into())
    }
}

/// What the target holds when a session ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeviceState {
    /// Nothing destructive happened.
    Untouched,
    /// Flash erased, fuses unchanged.
    Erased,
    /// Programming fuses (some or all) applied, flash incomplete or unverified.
    /// The device will not run but stays re-programmable.
    ProgrammingFusesOnly,
    /// Flash written and verified, normal fuses not (fully) applied.
    FlashWrittenFusesPending,
    Done,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceState::Untouched => "untouched",
            DeviceState::Erased => "erased",
            DeviceState::ProgrammingFusesOnly => "program-fuses-only",
            DeviceState::FlashWrittenFusesPending => "flash-written-fuses-pending",
            DeviceState::Done => "fully-done",
        };
        f.write_str(s)
    }
}
