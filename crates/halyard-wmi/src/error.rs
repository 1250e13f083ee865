//! Error types for halyard-wmi.

use thiserror::Error;

/// Result type alias for halyard-wmi operations.
pub type Result<T> = std::result::Result<T, WmiError>;

/// Errors surfaced by the management transport.
#[derive(Debug, Error)]
pub enum WmiError {
    /// Could not connect to the namespace
    #[error("connection to {namespace} on {host} failed: {message}")]
    Connection {
        /// Target host
        host: String,
        /// Target namespace
        namespace: String,
        /// Transport-provided reason
        message: String,
    },

    /// A query was rejected or failed remotely
    #[error("query failed: {query}: {message}")]
    Query {
        /// Rendered WQL text
        query: String,
        /// Transport-provided reason
        message: String,
    },

    /// The class definition does not exist in the namespace
    #[error("class not found: {0}")]
    ClassNotFound(String),

    /// No object lives at the given path
    #[error("object not found: {0}")]
    ObjectNotFound(String),

    /// The object has no such property
    #[error("property not found: {0}")]
    PropertyNotFound(String),

    /// A property value had a different type than the caller asked for
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        /// Requested type
        expected: &'static str,
        /// Type actually held
        actual: &'static str,
    },

    /// An object path string could not be parsed
    #[error("malformed object path {path:?}: {reason}")]
    MalformedPath {
        /// The offending input
        path: String,
        /// What was wrong with it
        reason: String,
    },

    /// A method invocation failed before producing out-parameters
    #[error("invoking {method} failed: {message}")]
    Invoke {
        /// Method name
        method: String,
        /// Transport-provided reason
        message: String,
    },

    /// An out-parameter the caller expected was not returned
    #[error("missing out-parameter {0}")]
    MissingOutParam(String),

    /// Index past the end of a result set
    #[error("index {index} out of range for result set of {len}")]
    IndexOutOfRange {
        /// Requested index
        index: usize,
        /// Number of elements
        len: usize,
    },

    /// The handle does not belong to this backend or was discarded
    #[error("stale handle {0}")]
    StaleHandle(u64),

    /// The session was released
    #[error("session closed")]
    SessionClosed,

    /// Embedded-instance text could not be produced or read
    #[error("instance text error: {0}")]
    Text(#[from] serde_json::Error),
}

impl WmiError {
    /// Check if this error indicates a missing object, class, or property.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            WmiError::ClassNotFound(_)
                | WmiError::ObjectNotFound(_)
                | WmiError::PropertyNotFound(_)
                | WmiError::IndexOutOfRange { .. }
        )
    }
}
