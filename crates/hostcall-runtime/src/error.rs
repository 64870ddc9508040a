//! Error types for the host-call runtime.

use thiserror::Error;

use crate::marshal::FuncType;

/// Host-call runtime error type
#[derive(Error, Debug)]
pub enum HostError {
    /// Reserving the guest address range failed
    #[error("out of address space: could not reserve {requested} bytes: {reason}")]
    OutOfAddressSpace {
        /// Bytes requested from the provider
        requested: usize,
        /// Provider-specific reason
        reason: String,
    },

    /// Committing pages inside a reserved range failed
    #[error("commit failed at offset 0x{offset:x} (+{size} bytes): {reason}")]
    CommitFailed {
        /// Offset inside the reserved range
        offset: usize,
        /// Bytes requested
        size: usize,
        /// Provider-specific reason
        reason: String,
    },

    /// Growth would exceed the reserved ceiling
    #[error("out of memory: growing by {requested} bytes exceeds reservation ({committed}/{reserved} committed)")]
    OutOfMemory {
        /// Page-rounded growth request
        requested: u64,
        /// Committed size before the request
        committed: usize,
        /// Reserved ceiling
        reserved: usize,
    },

    /// A guest offset/length pair does not lie inside committed memory
    #[error("memory fault: offset 0x{offset:x} length {length} outside committed memory ({committed} bytes)")]
    MemoryFault {
        /// Guest offset
        offset: u64,
        /// Requested length (`u64::MAX` for terminator scans)
        length: u64,
        /// Committed size at the time of the access
        committed: usize,
    },

    /// The same import name and type were registered twice
    #[error("duplicate import: {name} {ty}")]
    DuplicateImport {
        /// Import name
        name: String,
        /// Guest-visible type
        ty: FuncType,
    },

    /// A guest module imports something the host never registered
    #[error("unknown import: {name} {ty}")]
    UnknownImport {
        /// Import name
        name: String,
        /// Guest-visible type
        ty: FuncType,
    },

    /// Raw call values do not match the import's type
    #[error("signature mismatch calling {name}: {reason}")]
    SignatureMismatch {
        /// Import name
        name: String,
        /// What did not match
        reason: String,
    },

    /// A decoded argument could not be interpreted as requested
    #[error("invalid argument {index}: {reason}")]
    InvalidArgument {
        /// Parameter index in the declarative signature
        index: usize,
        /// What was wrong with it
        reason: String,
    },

    /// Import slot outside the linked table
    #[error("invalid import slot {slot} (table has {len} entries)")]
    InvalidSlot {
        /// Requested slot
        slot: usize,
        /// Table length
        len: usize,
    },

    /// Malformed interface description
    #[error("interface error: {0}")]
    Interface(String),

    /// A host capability refused the request
    #[error("capability denied: {0}")]
    Capability(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HostError {
    /// Whether the error stems from guest-controlled values and can be
    /// reported back across the call boundary instead of aborting the load.
    pub fn is_guest_recoverable(&self) -> bool {
        matches!(
            self,
            HostError::MemoryFault { .. }
                | HostError::OutOfMemory { .. }
                | HostError::SignatureMismatch { .. }
                | HostError::InvalidArgument { .. }
                | HostError::InvalidSlot { .. }
                | HostError::Capability(_)
        )
    }

    pub(crate) fn fault(offset: u64, length: u64, committed: usize) -> Self {
        HostError::MemoryFault {
            offset,
            length,
            committed,
        }
    }
}

/// Result type alias for host-call runtime operations
pub type Result<T> = std::result::Result<T, HostError>;
