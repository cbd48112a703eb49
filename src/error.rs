//! Error types for the federation and compaction layers

use thiserror::Error;

use crate::query::QueryError;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    /// Object storage error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Block metadata store error
    #[error("Metastore error: {0}")]
    Metastore(#[from] MetastoreError),

    /// Provider (StoreAPI) error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Compaction error
    #[error("Compaction error: {0}")]
    Compaction(#[from] CompactionError),

    /// Query error
    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// General error
    #[error("{0}")]
    General(String),
}

/// Object storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// Requested object does not exist
    #[error("Object not found: {0}")]
    NotFound(String),

    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Backend temporarily unavailable (retryable)
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// Object key rejected (empty, absolute, path traversal)
    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    /// Stored bytes failed validation
    #[error("Corrupted data: {0}")]
    CorruptedData(String),

    /// Checksum verification failed
    #[error("Checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch {
        /// The checksum recorded in the payload trailer
        expected: u64,
        /// The checksum computed from the payload
        actual: u64,
    },

    /// Encoding or decoding of a stored document failed
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// Whether retrying the operation may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Unavailable(_) => true,
            StorageError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }
}

/// Block metadata store errors
#[derive(Error, Debug)]
pub enum MetastoreError {
    /// A block with this id is already registered with different content
    #[error("Duplicate block {block_id}: already registered with different content")]
    DuplicateBlock {
        /// Conflicting block id
        block_id: String,
    },

    /// Block id not known to the store
    #[error("Block not found: {0}")]
    BlockNotFound(String),

    /// Block descriptor violates an invariant
    #[error("Invalid block: {0}")]
    InvalidBlock(String),

    /// Object storage failure while syncing
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Errors returned by a single provider call
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// The call did not finish within the per-provider timeout
    #[error("Provider {endpoint} timed out")]
    Timeout {
        /// Provider endpoint
        endpoint: String,
    },

    /// The provider is temporarily unable to serve (retryable)
    #[error("Provider {endpoint} unavailable: {message}")]
    Unavailable {
        /// Provider endpoint
        endpoint: String,
        /// Failure description
        message: String,
    },

    /// The provider rejected the request (not retryable)
    #[error("Provider {endpoint} rejected request: {message}")]
    Rejected {
        /// Provider endpoint
        endpoint: String,
        /// Failure description
        message: String,
    },
}

impl StoreError {
    /// Whether retrying the call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Timeout { .. } | StoreError::Unavailable { .. })
    }

    /// Endpoint the error originated from
    pub fn endpoint(&self) -> &str {
        match self {
            StoreError::Timeout { endpoint }
            | StoreError::Unavailable { endpoint, .. }
            | StoreError::Rejected { endpoint, .. } => endpoint,
        }
    }

    /// Map an object storage failure observed while serving `endpoint`
    pub fn from_storage(endpoint: &str, err: &StorageError) -> Self {
        if err.is_transient() {
            StoreError::Unavailable {
                endpoint: endpoint.to_string(),
                message: err.to_string(),
            }
        } else {
            StoreError::Rejected {
                endpoint: endpoint.to_string(),
                message: err.to_string(),
            }
        }
    }
}

/// Compaction errors
#[derive(Error, Debug)]
pub enum CompactionError {
    /// Another job for this group is running
    #[error("Compaction group {0} already has a job in flight")]
    GroupBusy(String),

    /// The group exceeded its consecutive-failure ceiling
    #[error("Compaction halted for group {0}")]
    GroupHalted(String),

    /// A source block is missing or already deletion-marked
    #[error("Source block unavailable: {0}")]
    SourceUnavailable(String),

    /// Job description is inconsistent
    #[error("Invalid compaction job: {0}")]
    InvalidJob(String),

    /// Sample merge failed
    #[error("Merge failed: {0}")]
    Merge(String),

    /// Work queue is full
    #[error("Compaction queue full (max: {0})")]
    QueueFull(usize),

    /// Object storage failure
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Metadata store failure
    #[error("Metastore error: {0}")]
    Metastore(#[from] MetastoreError),
}

/// Validation errors for configuration and input
#[derive(Error, Debug)]
pub enum ValidationError {
    /// Value is out of allowed range
    #[error("{field} value {value} is out of range [{min}, {max}]")]
    OutOfRange {
        /// Field name being validated
        field: String,
        /// The invalid value
        value: String,
        /// Minimum allowed value
        min: String,
        /// Maximum allowed value
        max: String,
    },

    /// Required field is missing
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Invalid format
    #[error("Invalid format for {field}: {message}")]
    InvalidFormat {
        /// Field name being validated
        field: String,
        /// Description of the format error
        message: String,
    },

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    Failed(String),
}

impl From<ValidationError> for Error {
    fn from(e: ValidationError) -> Self {
        Error::Configuration(e.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_transience() {
        assert!(StorageError::Unavailable("503".into()).is_transient());
        assert!(!StorageError::NotFound("a/b".into()).is_transient());
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert!(StorageError::Io(io).is_transient());
    }

    #[test]
    fn test_store_error_mapping() {
        let err = StoreError::from_storage("bucket", &StorageError::Unavailable("x".into()));
        assert!(err.is_transient());
        assert_eq!(err.endpoint(), "bucket");

        let err = StoreError::from_storage("bucket", &StorageError::NotFound("x".into()));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_duplicate_block_display() {
        let err: Error = MetastoreError::DuplicateBlock {
            block_id: "01ABC".into(),
        }
        .into();
        assert!(err.to_string().contains("01ABC"));
    }
}
