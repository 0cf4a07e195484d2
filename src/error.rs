use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors raised by the storage layer.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Underlying database reported an error
    #[error("Database error: {0}")]
    Database(String),

    /// Storage is temporarily unavailable (connection lost, worker pool gone)
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// A stored row could not be decoded into a model type
    #[error("Corrupt {table} row: {message}")]
    CorruptRow {
        table: &'static str,
        message: String,
    },
}

/// A status change that the entity's state machine does not allow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Illegal {entity} transition: {from} -> {to}")]
pub struct TransitionError {
    pub entity: &'static str,
    pub from: &'static str,
    pub to: &'static str,
}

/// A stored status string that does not name a known status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown {entity} status: {value:?}")]
pub struct ParseStatusError {
    pub entity: &'static str,
    pub value: String,
}

/// Errors reported by the image converter.
///
/// The worker treats every variant the same way for retry purposes; the
/// variant only shapes the message stored on the Image and Job.
#[derive(Debug, Clone, Error)]
pub enum ConvertError {
    /// Source file does not exist
    #[error("Source file not found: {}", .0.display())]
    MissingFile(PathBuf),

    /// Input could not be decoded
    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),

    /// Measurement or conversion exceeded the configured deadline
    #[error("Conversion timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    /// External conversion tool failed or could not be started
    #[error("Conversion tool failed: {0}")]
    Tool(String),

    /// Filesystem error while reading input or writing output
    #[error("I/O error: {0}")]
    Io(String),
}

/// Errors from the state synchronizer.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Errors from the quota ledger.
#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    /// Admission refused: the request does not fit in the remaining quota
    #[error("Storage quota exceeded for user {user_id}: requested {requested} bytes, {remaining} bytes remaining")]
    QuotaExceeded {
        user_id: String,
        requested: u64,
        remaining: u64,
    },

    /// No ledger entry exists for this user
    #[error("Unknown user: {0}")]
    UnknownUser(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Stored Resource metadata that cannot be rendered into a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManifestError {
    #[error("Metadata is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("Metadata must be a JSON list of label/value objects")]
    NotAList,
}

/// Errors from the job dispatcher.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// The queue has shut down and accepts no more work
    #[error("Job queue is closed")]
    QueueClosed,

    /// No Image with this id exists
    #[error("Image not found: {0}")]
    UnknownImage(String),

    /// The Image has already been converted
    #[error("Image {0} is already ready")]
    AlreadyReady(String),

    /// The Image's Job is currently executing
    #[error("Job {0} is already active")]
    InFlight(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Failure of a single processing attempt.
///
/// Every variant is handed to the retry policy unchanged.
#[derive(Debug, Clone, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Convert(#[from] ConvertError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl From<StoreError> for ProcessError {
    fn from(err: StoreError) -> Self {
        ProcessError::Sync(SyncError::Store(err))
    }
}

/// Errors from the resource read/delete boundary.
#[derive(Debug, Clone, Error)]
pub enum ResourceError {
    /// Resource does not exist (maps to HTTP 404)
    #[error("Resource not found: {resource_id}")]
    NotFound { resource_id: String },

    /// Resource is private and the caller is not its owner (maps to HTTP 403)
    #[error("Access denied to resource {resource_id}")]
    AccessDenied { resource_id: String },

    /// Resource is still processing or has failed (maps to HTTP 503)
    #[error("Resource {resource_id} is not ready (status: {status})")]
    NotReady { resource_id: String, status: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}
