//! Error types for the secret CSI node plugin
//!
//! Errors are structured with fields to aid debugging in production. Every
//! variant maps onto one gRPC status code so kubelet sees the same taxonomy
//! the pipeline produced: invalid-argument requests never cause side effects,
//! not-found covers missing SecretClasses and Pods, an expired caller
//! deadline is reported as such, and everything else is internal.

use thiserror::Error;
use tonic::{Code, Status};

/// Main error type for node plugin operations
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or incomplete request
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of what's missing or malformed
        message: String,
    },

    /// A referenced cluster object does not exist
    #[error("{kind} {name} not found")]
    NotFound {
        /// Resource kind (e.g., "SecretClass", "Pod")
        kind: String,
        /// Name of the missing resource (namespace/name for namespaced kinds)
        name: String,
    },

    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Filesystem error while preparing, populating or removing a volume
    #[error("io error [{context}]: {source}")]
    Io {
        /// Operation that failed (e.g., "mkdir", "write", "remove")
        context: String,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Secret backend failed to produce content
    #[error("backend error for class {class}: {message}")]
    Backend {
        /// SecretClass the backend was serving
        class: String,
        /// Description of what failed
        message: String,
    },

    /// Existing expiration annotation could not be interpreted
    #[error("expiration error: {message}")]
    Expiration {
        /// Description of what's wrong with the annotation
        message: String,
    },

    /// The request deadline expired before the operation finished
    #[error("deadline exceeded during {operation}")]
    DeadlineExceeded {
        /// Operation that was running when the deadline fired
        operation: String,
    },

    /// RPC deliberately not supported by this plugin
    #[error("unimplemented: {method}")]
    Unimplemented {
        /// Name of the RPC
        method: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "mount", "config", "pki")
        context: String,
    },
}

impl Error {
    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: msg.into(),
        }
    }

    /// Create a not found error for a resource kind and name
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Wrap an I/O error with the operation that produced it
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a backend error for a SecretClass
    pub fn backend(class: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Backend {
            class: class.into(),
            message: msg.into(),
        }
    }

    /// Create an expiration annotation error
    pub fn expiration(msg: impl Into<String>) -> Self {
        Self::Expiration {
            message: msg.into(),
        }
    }

    /// Create a deadline exceeded error for an operation
    pub fn deadline_exceeded(operation: impl Into<String>) -> Self {
        Self::DeadlineExceeded {
            operation: operation.into(),
        }
    }

    /// Create an unimplemented error for an RPC
    pub fn unimplemented(method: impl Into<String>) -> Self {
        Self::Unimplemented {
            method: method.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// gRPC status code for this error
    pub fn code(&self) -> Code {
        match self {
            Error::InvalidArgument { .. } => Code::InvalidArgument,
            Error::NotFound { .. } => Code::NotFound,
            Error::Kube {
                source: kube::Error::Api(ae),
            } if ae.code == 404 => Code::NotFound,
            Error::DeadlineExceeded { .. } => Code::DeadlineExceeded,
            Error::Unimplemented { .. } => Code::Unimplemented,
            Error::Kube { .. }
            | Error::Io { .. }
            | Error::Backend { .. }
            | Error::Expiration { .. }
            | Error::Internal { .. } => Code::Internal,
        }
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        Status::new(err.code(), err.to_string())
    }
}

/// Returns true if a kube error is an API 404
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Returns true if a kube error is an API 409 (conflict / already exists)
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}
