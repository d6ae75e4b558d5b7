//! Wire protocol for the kiln storage cluster.
//!
//! Every RPC in the cluster is a fixed-layout little-endian struct: a common
//! request header carrying the opcode and target service, followed by an
//! op-specific body, with variable-length data (object bytes, table names,
//! backup locators) trailing the fixed part. Responses lead with a common
//! status word. This crate owns those layouts plus the textual service
//! locator format; it performs no I/O.
//!
//! Encoding is deliberately hand-rolled: each struct knows how to append
//! itself to a request buffer and how to parse itself back out, failing with
//! [`WireError::MessageTooShort`] rather than panicking on truncated input.

pub mod locator;
pub mod rpc;

pub use locator::ServiceLocator;
pub use rpc::{
    BackupListEntry, CreateRequest, CreateResponse, GetRecoveryDataRequest,
    GetRecoveryDataResponse, MultiReadPart, MultiReadRequest, MultiReadResponse, Opcode,
    OpenTableResponse, ReadRequest, ReadResponse, RecoverRequest, RejectRules, RemoveRequest,
    RequestHeader, ResponseHeader, ServiceType, Status, TableNameRequest, TabletEntry,
    TabletState, VersionResponse, WriteRequest, WriteSegmentRequest, REQUEST_HEADER_LEN,
    RESPONSE_HEADER_LEN,
};

/// Errors produced while encoding or decoding wire messages.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// The buffer ended before the fixed-layout fields (or a declared
    /// variable-length region) could be read.
    #[error("message too short: needed {needed} more bytes at offset {offset}")]
    MessageTooShort { offset: usize, needed: usize },
    /// An opcode value that no known operation uses.
    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),
    /// A status value outside the defined set.
    #[error("unknown status {0}")]
    UnknownStatus(u32),
    /// A string field (table name, locator) was not valid UTF-8.
    #[error("invalid string field: {0}")]
    InvalidString(String),
    /// A malformed service locator.
    #[error("bad service locator: {0}")]
    BadLocator(String),
}

/// Result alias for wire operations.
pub type WireResult<T> = Result<T, WireError>;
