//! Error types for the charging data layer

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the data layer
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Lookup / Validation Errors
    // =========================================================================
    /// Entity, index key or load marker does not exist
    #[error("NOT_FOUND")]
    NotFound,

    /// A write cites a filter that does not exist
    #[error("broken reference to filter: <{0}>")]
    BrokenReference(String),

    /// A filter removal would orphan entities still referencing it
    #[error("cannot remove filter <{filter}>: still referenced by {dependents:?}")]
    FilterReferenced {
        filter: String,
        dependents: Vec<String>,
    },

    /// Required fields are empty
    #[error("MANDATORY_IE_MISSING: [{}]", .0.join(","))]
    MandatoryFieldMissing(Vec<String>),

    /// Index key does not follow the `<type>:<a>:<b>` grammar
    #[error("WRONG_IDX_KEY_FORMAT<{0}>")]
    MalformedIndexKey(String),

    /// Prefix does not name a known cache partition
    #[error("unsupported cache prefix")]
    UnsupportedCachePrefix,

    /// Entity already exists and overwrite was not requested
    #[error("EXISTS")]
    Exists,

    /// Filter rule is syntactically invalid
    #[error("invalid filter rule <{rule}>: {reason}")]
    InvalidFilter { rule: String, reason: String },

    // =========================================================================
    // Driver / Transport Errors
    // =========================================================================
    /// Store driver failure, passed through
    #[error("driver error: {0}")]
    Driver(String),

    /// Remote or replication peer failure
    #[error("transport error on <{conn}>: {reason}")]
    Transport { conn: String, reason: String },

    /// Remote call exceeded the connection reply timeout
    #[error("timed out after {timeout:?} waiting for <{conn}>")]
    Timeout { conn: String, timeout: Duration },

    /// Caller cancelled the operation
    #[error("operation cancelled")]
    Cancelled,

    /// Some items of a batch succeeded, others failed
    #[error("PARTIALLY_EXECUTED: failed {failed:?}")]
    PartiallyExecuted { failed: Vec<String> },

    /// Guardian lock could not be acquired in time
    #[error("failed to acquire lock <{key}> within {timeout:?}")]
    LockTimeout { key: String, timeout: Duration },

    // =========================================================================
    // Post-commit Errors
    // =========================================================================
    /// The entity was stored but its filter indexes were not updated
    #[error("data committed, index update failed: {0}")]
    IndexUpdate(#[source] Box<Error>),

    /// The change was applied locally but propagation to peers failed
    #[error("data committed, replication failed: {0}")]
    Replication(#[source] Box<Error>),

    // =========================================================================
    // Ambient Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Duration parse error
    #[error("Failed to parse duration: {0}")]
    DurationParse(String),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML config error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Comparable classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    BrokenReference,
    MandatoryFieldMissing,
    MalformedIndexKey,
    DriverOrTransport,
    PartiallyExecuted,
    Exists,
    LockTimeout,
    UnsupportedCachePrefix,
    InvalidFilter,
    Config,
    Internal,
}

impl Error {
    /// Classify the error; post-commit wrappers report their cause.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound => ErrorKind::NotFound,
            Error::BrokenReference(_) | Error::FilterReferenced { .. } => {
                ErrorKind::BrokenReference
            }
            Error::MandatoryFieldMissing(_) => ErrorKind::MandatoryFieldMissing,
            Error::MalformedIndexKey(_) => ErrorKind::MalformedIndexKey,
            Error::UnsupportedCachePrefix => ErrorKind::UnsupportedCachePrefix,
            Error::Exists => ErrorKind::Exists,
            Error::InvalidFilter { .. } => ErrorKind::InvalidFilter,
            Error::Driver(_)
            | Error::Transport { .. }
            | Error::Timeout { .. }
            | Error::Cancelled
            | Error::Io(_) => ErrorKind::DriverOrTransport,
            Error::PartiallyExecuted { .. } => ErrorKind::PartiallyExecuted,
            Error::LockTimeout { .. } => ErrorKind::LockTimeout,
            Error::IndexUpdate(inner) | Error::Replication(inner) => inner.kind(),
            Error::Config(_) | Error::DurationParse(_) | Error::Yaml(_) => ErrorKind::Config,
            Error::Serialization(_) | Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// True when the primary write is durable and only derived state lags.
    pub fn is_committed(&self) -> bool {
        matches!(self, Error::IndexUpdate(_) | Error::Replication(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }

    pub(crate) fn index_update(err: Error) -> Self {
        Error::IndexUpdate(Box::new(err))
    }

    pub(crate) fn replication(err: Error) -> Self {
        Error::Replication(Box::new(err))
    }

    pub(crate) fn mandatory<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Error::MandatoryFieldMissing(fields.into_iter().map(Into::into).collect())
    }
}

// =============================================================================
// Tests
// =============================================================================
