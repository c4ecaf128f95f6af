//! Error types for the bulk transfer pipeline.
//!
//! Only partition- and job-fatal conditions are represented here. Per-record
//! failures (serialization, parsing, persistence of a single resource) are
//! counted in the checkpoint and never surface as a [`BulkError`].

use std::fmt;

/// Errors that terminate a partition or a whole job.
#[derive(Debug, thiserror::Error)]
pub enum BulkError {
    /// The object store rejected or failed a request.
    #[error("Object storage error during {operation}: {message}")]
    ObjectStorage {
        /// The protocol step that failed (`upload_part`, `complete`, ...).
        operation: &'static str,
        /// Description of the failure.
        message: String,
    },

    /// The persistence collaborator failed outside of a single record.
    #[error("Persistence error: {message}")]
    Persistence {
        /// Description of the failure.
        message: String,
    },

    /// Writing into an in-memory chunk buffer failed.
    #[error("Buffer write error: {0}")]
    Buffer(#[from] std::io::Error),

    /// A checkpoint could not be encoded or decoded.
    #[error("Invalid checkpoint: {0}")]
    Checkpoint(#[from] serde_json::Error),

    /// Reading or writing a persisted checkpoint failed.
    #[error("Checkpoint store error for '{name}': {source}")]
    CheckpointStore {
        /// Checkpoint name.
        name: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Missing or inconsistent configuration.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// An upload session was driven out of order.
    #[error("Upload session for '{key}' is {state}, cannot {action}")]
    InvalidSessionState {
        /// Object key or prefix of the session.
        key: String,
        /// Current session state.
        state: String,
        /// The attempted transition.
        action: &'static str,
    },

    /// A bulk request could not be interpreted.
    #[error("Invalid bulk request: {message}")]
    InvalidRequest {
        /// What is wrong with the request.
        message: String,
    },

    /// The planner found nothing to run.
    #[error("No valid partitions: {message}")]
    NoValidPartitions {
        /// Why every requested partition was rejected.
        message: String,
    },

    /// A partition task panicked or was aborted by the runtime.
    #[error("Partition '{partition}' aborted: {message}")]
    PartitionAborted {
        /// Partition name.
        partition: String,
        /// Join error text.
        message: String,
    },
}

impl BulkError {
    /// Creates a new `ObjectStorage` error.
    #[must_use]
    pub fn object_storage(operation: &'static str, message: impl Into<String>) -> Self {
        Self::ObjectStorage {
            operation,
            message: message.into(),
        }
    }

    /// Creates a new `Persistence` error.
    #[must_use]
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
        }
    }

    /// Creates a new `CheckpointStore` error.
    #[must_use]
    pub fn checkpoint_store(name: impl Into<String>, source: std::io::Error) -> Self {
        Self::CheckpointStore {
            name: name.into(),
            source,
        }
    }

    /// Creates a new `Configuration` error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new `InvalidSessionState` error.
    #[must_use]
    pub fn invalid_session_state(
        key: impl Into<String>,
        state: impl fmt::Display,
        action: &'static str,
    ) -> Self {
        Self::InvalidSessionState {
            key: key.into(),
            state: state.to_string(),
            action,
        }
    }

    /// Creates a new `InvalidRequest` error.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Creates a new `NoValidPartitions` error.
    #[must_use]
    pub fn no_valid_partitions(message: impl Into<String>) -> Self {
        Self::NoValidPartitions {
            message: message.into(),
        }
    }

    /// Returns the error category for logging/monitoring purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ObjectStorage { .. }
            | Self::Persistence { .. }
            | Self::CheckpointStore { .. } => ErrorCategory::Transient,
            Self::Buffer(_)
            | Self::Checkpoint(_)
            | Self::Configuration { .. }
            | Self::InvalidSessionState { .. }
            | Self::PartitionAborted { .. } => ErrorCategory::Partition,
            Self::InvalidRequest { .. } | Self::NoValidPartitions { .. } => ErrorCategory::Job,
        }
    }

    /// Returns `true` if restarting the partition from its last checkpoint
    /// may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }
}

/// Failure classes of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Network, object store or lock contention. Owned by the orchestration
    /// runtime's restart-from-checkpoint policy.
    Transient,
    /// A single resource failed. Counted, never raised.
    Record,
    /// Terminates the partition; the last checkpoint stays the resume point.
    Partition,
    /// The job never starts.
    Job,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Record => write!(f, "record"),
            Self::Partition => write!(f, "partition"),
            Self::Job => write!(f, "job"),
        }
    }
}

/// Type alias for a pipeline result.
pub type BulkResult<T> = Result<T, BulkError>;
