//! Error types for halyard-core.

use crate::job::JobState;
use halyard_wmi::WmiError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for halyard-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a job did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobFailure {
    /// The service's own description of the failure
    Description(String),
    /// The method refused to start a job
    ReturnCode(u32),
    /// The job stopped in a non-success state without a description
    State {
        state: JobState,
        error_code: Option<u32>,
    },
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobFailure::Description(text) => f.write_str(text),
            JobFailure::ReturnCode(code) => write!(f, "method returned status {code}"),
            JobFailure::State {
                state,
                error_code: Some(code),
            } => write!(f, "job ended in state {state} with error code {code}"),
            JobFailure::State {
                state,
                error_code: None,
            } => write!(f, "job ended in state {state}"),
        }
    }
}

/// Errors that can occur while managing virtual machines.
#[derive(Debug, Error)]
pub enum Error {
    /// Connection, query, or invocation failure in the management transport
    #[error("transport error: {0}")]
    Transport(#[source] WmiError),

    /// A lookup matched nothing
    #[error("not found: {0}")]
    NotFound(String),

    /// The service's object graph violates an invariant
    #[error("inconsistent resource: {0}")]
    InconsistentResource(String),

    /// An asynchronous job ended in a non-success state
    #[error("job {job} failed: {reason}")]
    JobFailed {
        /// Job path, or the method name when no job was started
        job: String,
        reason: JobFailure,
    },

    /// The caller's deadline elapsed while polling a job
    #[error("job {job} did not finish within {timeout:?}")]
    JobTimeout { job: String, timeout: Duration },

    /// A creation result's locator could not be parsed
    #[error("malformed locator {locator:?}: {reason}")]
    MalformedLocator { locator: String, reason: String },

    /// The class template for a new instance could not be obtained
    #[error("template for {class} unavailable: {source}")]
    TemplateUnavailable {
        class: String,
        #[source]
        source: WmiError,
    },

    /// Client-side capacity check failed
    #[error("requested {requested} {resource}, only {available} available")]
    ExceedsHostCapacity {
        resource: &'static str,
        requested: usize,
        available: usize,
    },

    /// The manager's session was released
    #[error("session closed")]
    SessionClosed,

    /// A property held a different type than expected
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    /// The operation is not supported for this machine
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Caller-supplied arguments are unusable
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Manager configuration is unusable
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Creation failed after the machine was, or may have been, defined.
    /// `vm` is the identifier when known, otherwise the locator or job.
    #[error(
        "virtual machine {vm} may already exist on the host but was not fully created; \
         it has been left in place and was not rolled back: {source}"
    )]
    PartiallyCreated {
        vm: String,
        #[source]
        source: Box<Error>,
    },

    /// Which step failed, wrapped around the underlying error
    #[error("{step}: {source}")]
    Context {
        step: String,
        #[source]
        source: Box<Error>,
    },
}

impl From<WmiError> for Error {
    fn from(err: WmiError) -> Self {
        match err {
            WmiError::SessionClosed => Error::SessionClosed,
            WmiError::TypeMismatch { expected, actual } => Error::TypeMismatch { expected, actual },
            WmiError::ObjectNotFound(what) => Error::NotFound(what),
            WmiError::MalformedPath { path, reason } => Error::MalformedLocator {
                locator: path,
                reason,
            },
            other => Error::Transport(other),
        }
    }
}

impl Error {
    /// Classify a failure to obtain or spawn a class template.
    pub(crate) fn template_unavailable(class: &str, err: WmiError) -> Self {
        match err {
            WmiError::SessionClosed => Error::SessionClosed,
            source => Error::TemplateUnavailable {
                class: class.to_string(),
                source,
            },
        }
    }

    pub(crate) fn partially_created(vm: impl Into<String>, source: Error) -> Self {
        Error::PartiallyCreated {
            vm: vm.into(),
            source: Box::new(source),
        }
    }

    /// The innermost error once step context and partial-creation wrapping
    /// are stripped.
    pub fn root(&self) -> &Error {
        let mut err = self;
        loop {
            match err {
                Error::Context { source, .. } | Error::PartiallyCreated { source, .. } => {
                    err = source.as_ref();
                }
                _ => return err,
            }
        }
    }

    /// Check if this error indicates a zero-result lookup.
    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Error::NotFound(_))
    }

    /// Check if this error indicates a broken object graph on the service.
    pub fn is_inconsistent(&self) -> bool {
        matches!(self.root(), Error::InconsistentResource(_))
    }

    /// Check if this error comes from using a released session.
    pub fn is_session_closed(&self) -> bool {
        matches!(self.root(), Error::SessionClosed)
    }

    /// Check if a remote job failed or timed out.
    pub fn is_job_failure(&self) -> bool {
        matches!(
            self.root(),
            Error::JobFailed { .. } | Error::JobTimeout { .. }
        )
    }

    /// Check if the error may have left a partially configured machine behind.
    pub fn is_partially_created(&self) -> bool {
        let mut err = self;
        loop {
            match err {
                Error::PartiallyCreated { .. } => return true,
                Error::Context { source, .. } => err = source.as_ref(),
                _ => return false,
            }
        }
    }
}

/// Attach the failing step to an error.
pub trait ResultExt<T> {
    fn context(self, step: impl Into<String>) -> Result<T>;

    fn with_context<F>(self, step: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, step: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Context {
            step: step.into(),
            source: Box::new(e.into()),
        })
    }

    fn with_context<F>(self, step: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| Error::Context {
            step: step(),
            source: Box::new(e.into()),
        })
    }
}
