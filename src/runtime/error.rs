//! Kernel errors
//!
//! Every failure that can reach a Thread State is a [`KernelError`]. Failures
//! are handed to many waiters at once (a failed monitor releases every parked
//! job with the same outcome), so the type is cheap to clone.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Kernel result
pub type KernelResult<T> = Result<T, KernelError>;

/// Broad classification used when matching escalation handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// A resource could not be created.
    Sourcing,
    /// An asynchronous operation on a ready resource failed or timed out.
    Operation,
    /// A job step raised an unexpected error.
    Execution,
    /// A failure propagated from a resource a job depends on.
    Dependency,
}

/// Kernel errors
#[derive(Debug, Clone, Error)]
pub enum KernelError {
    #[error("failed to source resource '{name}': {message}")]
    Sourcing { name: String, message: String },

    #[error("operation on resource '{name}' failed: {message}")]
    Operation { name: String, message: String },

    #[error("resource '{name}' timed out after {timeout:?}")]
    Timeout {
        /// Bound name of the resource
        name: String,
        /// Configured timeout that elapsed
        timeout: Duration,
        /// Whether the timeout hit sourcing or an asynchronous operation
        during_operation: bool,
    },

    #[error("job '{job}' failed: {message}")]
    Execution { job: String, message: String },

    #[error("job '{job}' panicked: {message}")]
    Panicked { job: String, message: String },

    #[error("dependency '{name}' failed: {cause}")]
    Dependency { name: String, cause: Arc<KernelError> },

    #[error("escalation handler failed while handling '{original}': {cause}")]
    Unrecoverable {
        original: Arc<KernelError>,
        cause: Arc<KernelError>,
    },

    #[error("process {0} is already complete")]
    ProcessComplete(u64),

    #[error("thread {0} has terminated")]
    ThreadTerminated(u64),

    #[error("invalid metadata: {0}")]
    InvalidMetaData(String),

    #[error("resource '{0}' is not ready")]
    NotReady(String),

    #[error("resource '{name}' is not of type {expected}")]
    TypeMismatch { name: String, expected: &'static str },

    #[error("unknown team '{0}'")]
    UnknownTeam(String),

    #[error("team '{0}' is not accepting work")]
    TeamStopped(String),

    #[error("{0}")]
    Custom(Arc<dyn std::error::Error + Send + Sync>),
}

impl KernelError {
    /// Create an execution failure for the named job.
    pub fn execution(
        job: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        KernelError::Execution {
            job: job.into(),
            message: message.into(),
        }
    }

    /// Create a sourcing failure for the named resource.
    pub fn sourcing(
        name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        KernelError::Sourcing {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create an operation failure for the named resource.
    pub fn operation(
        name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        KernelError::Operation {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Wrap any error raised by user code.
    pub fn custom<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        KernelError::Custom(Arc::new(error))
    }

    /// Wrap this failure as a dependency failure of `name`.
    ///
    /// Already-wrapped dependency failures keep their original cause so that
    /// chains of dependent resources do not nest.
    pub fn as_dependency_of(
        self,
        name: impl Into<String>,
    ) -> Self {
        match self {
            KernelError::Dependency { .. } => self,
            other => KernelError::Dependency {
                name: name.into(),
                cause: Arc::new(other),
            },
        }
    }

    /// Classify the failure for escalation matching.
    pub fn kind(&self) -> FailureKind {
        match self {
            KernelError::Sourcing { .. } => FailureKind::Sourcing,
            KernelError::Operation { .. } => FailureKind::Operation,
            KernelError::Timeout {
                during_operation, ..
            } => {
                if *during_operation {
                    FailureKind::Operation
                } else {
                    FailureKind::Sourcing
                }
            },
            KernelError::Dependency { .. } => FailureKind::Dependency,
            KernelError::Unrecoverable { original, .. } => original.kind(),
            _ => FailureKind::Execution,
        }
    }

    /// Check whether this failure is (or was caused by) a timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            KernelError::Timeout { .. } => true,
            KernelError::Dependency { cause, .. } => cause.is_timeout(),
            _ => false,
        }
    }
}

impl From<anyhow::Error> for KernelError {
    fn from(error: anyhow::Error) -> Self {
        KernelError::Custom(Arc::from(Box::<dyn std::error::Error + Send + Sync>::from(
            error,
        )))
    }
}

/// Render a panic payload for [`KernelError::Panicked`].
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
