//! Master-side error type and its mapping onto wire statuses.

use kiln_dispatch::TransportError;
use kiln_wire::{Status, WireError};

/// Everything that can go wrong while servicing a master operation.
///
/// The reject variants carry the version that was found so handlers can
/// report it in the reply header alongside the status, as clients expect.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum MasterError {
    /// No tablet owned by this master covers the requested object.
    #[error("table does not exist here")]
    TableDoesntExist,
    /// The object is absent (or a reject rule required absence).
    #[error("object does not exist (version {version})")]
    ObjectDoesntExist { version: u64 },
    /// A reject rule required the object not to exist, but it does.
    #[error("object exists (version {version})")]
    ObjectExists { version: u64 },
    /// A version-based reject rule fired.
    #[error("wrong version: found {version}")]
    WrongVersion { version: u64 },
    /// The coordinator has no room for another table.
    #[error("no table space")]
    NoTableSpace,
    /// A table's id space was exhausted while allocating a fresh id.
    #[error("no free object id in table {table_id}")]
    IdSpaceExhausted { table_id: u32 },
    /// A malformed request or log payload.
    #[error("wire format error: {0}")]
    Wire(#[from] WireError),
    /// Replication could not reach a replica within the retry budget.
    #[error("replication to {locator} failed: {detail}")]
    ReplicationFailed { locator: String, detail: String },
    /// A session could not be opened or died mid-RPC.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Some segment had no surviving replica during recovery.
    #[error("segment {segment_id} unavailable due to insufficient recovery resources")]
    SegmentRecoveryFailed { segment_id: u64 },
    /// A checksum mismatch or impossible structure in log bytes.
    #[error("corrupted log entry: {0}")]
    Corruption(String),
    /// The segment cannot hold the entry (entry larger than a segment).
    #[error("entry of {0} bytes cannot fit in any segment")]
    EntryTooBig(usize),
    /// Catch-all for states that should not be reachable.
    #[error("internal error: {0}")]
    Internal(String),
}

impl MasterError {
    /// The wire status reported for this failure.
    pub fn status(&self) -> Status {
        match self {
            MasterError::TableDoesntExist => Status::TableDoesntExist,
            MasterError::ObjectDoesntExist { .. } => Status::ObjectDoesntExist,
            MasterError::ObjectExists { .. } => Status::ObjectExists,
            MasterError::WrongVersion { .. } => Status::WrongVersion,
            MasterError::NoTableSpace => Status::NoTableSpace,
            MasterError::Wire(WireError::MessageTooShort { .. }) => Status::MessageTooShort,
            MasterError::Wire(_) => Status::Internal,
            MasterError::ReplicationFailed { .. } => Status::Retry,
            MasterError::Transport(_) => Status::Retry,
            MasterError::SegmentRecoveryFailed { .. } => Status::SegmentRecoveryFailed,
            MasterError::IdSpaceExhausted { .. }
            | MasterError::Corruption(_)
            | MasterError::EntryTooBig(_)
            | MasterError::Internal(_) => Status::Internal,
        }
    }

    /// The version to report alongside the status (zero when versions are
    /// not meaningful for this failure).
    pub fn found_version(&self) -> u64 {
        match self {
            MasterError::ObjectDoesntExist { version }
            | MasterError::ObjectExists { version }
            | MasterError::WrongVersion { version } => *version,
            _ => 0,
        }
    }

    pub fn internal<T: std::fmt::Display>(detail: T) -> Self {
        MasterError::Internal(detail.to_string())
    }

    pub fn corruption<T: std::fmt::Display>(detail: T) -> Self {
        MasterError::Corruption(detail.to_string())
    }
}

/// Result alias for master operations.
pub type MasterResult<T> = Result<T, MasterError>;
