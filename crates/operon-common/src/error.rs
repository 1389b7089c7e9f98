//! Error types for operon controllers
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the context needed to tell which resource,
//! component or object failed, and [`Error::is_retryable`] classifies
//! them for the retry driver.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// HTTP status the API server uses when a watch resource version expired
const GONE: u16 = 410;

/// Main error type for operon operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Missing or contradictory constructor configuration
    #[error("invalid config for {component}: {message}")]
    InvalidConfig {
        /// Component being constructed (e.g. "informer", "resource set")
        component: String,
        /// Description of what's invalid
        message: String,
    },

    /// A decorator's preferred wrapping strategy does not apply
    #[error("incompatible underlying resource {resource}: {message}")]
    IncompatibleUnderlyingResource {
        /// Name of the resource being wrapped
        resource: String,
        /// Why the strategy does not apply
        message: String,
    },

    /// Unwrap traversal exceeded its depth bound
    #[error("loop detected while unwrapping resource after {depth} steps")]
    LoopDetected {
        /// Number of steps followed before giving up
        depth: usize,
    },

    /// Failure raised by a concrete resource operation
    #[error("resource {resource}: {message}")]
    Resource {
        /// Name of the resource that failed
        resource: String,
        /// Description of what failed
        message: String,
        /// Whether retrying may succeed
        retryable: bool,
    },

    /// Optimistic concurrency conflict on update
    #[error("conflict updating {object}")]
    Conflict {
        /// Object key (namespace/name)
        object: String,
    },

    /// Object does not exist
    #[error("{object} not found")]
    NotFound {
        /// Object key (namespace/name)
        object: String,
    },

    /// In-band error status delivered on a watch stream
    #[error("watch error ({code}): {message}")]
    Watch {
        /// HTTP-like status code reported by the server
        code: u16,
        /// Server message
        message: String,
    },

    /// An event or object could not be decoded
    #[error("decode error: {message}")]
    Decode {
        /// Description of what failed
        message: String,
    },

    /// Transport failure talking to the remote API
    #[error("transport error: {message}")]
    Transport {
        /// Description of what failed
        message: String,
    },

    /// An operation did not complete in time
    #[error("timeout in {operation}: {message}")]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Description of what was awaited
        message: String,
    },

    /// A resource was handed a state or change of a type it does not own
    #[error("type mismatch in resource {resource}: {message}")]
    TypeMismatch {
        /// Name of the resource
        resource: String,
        /// What was expected and what arrived
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g. "controller", "informer")
        context: String,
    },
}

impl Error {
    /// Create an invalid config error for a component
    pub fn invalid_config(component: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidConfig {
            component: component.into(),
            message: msg.into(),
        }
    }

    /// Create an incompatible underlying resource error
    pub fn incompatible_underlying_resource(
        resource: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::IncompatibleUnderlyingResource {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a loop detected error
    pub fn loop_detected(depth: usize) -> Self {
        Self::LoopDetected { depth }
    }

    /// Create a retryable resource error
    ///
    /// This is what concrete resource operations return for transient failures.
    pub fn resource(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Resource {
            resource: resource.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a resource error that retrying cannot fix
    pub fn resource_permanent(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Resource {
            resource: resource.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a conflict error for an object key
    pub fn conflict(object: impl Into<String>) -> Self {
        Self::Conflict {
            object: object.into(),
        }
    }

    /// Create a not found error for an object key
    pub fn not_found(object: impl Into<String>) -> Self {
        Self::NotFound {
            object: object.into(),
        }
    }

    /// Create a watch status error
    pub fn watch(code: u16, msg: impl Into<String>) -> Self {
        Self::Watch {
            code,
            message: msg.into(),
        }
    }

    /// Create a decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode {
            message: msg.into(),
        }
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport {
            message: msg.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
            message: msg.into(),
        }
    }

    /// Create a type mismatch error for a resource
    pub fn type_mismatch(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::TypeMismatch {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Map a kube error, translating 404/409 responses for an object key
    pub fn from_kube_for(object: impl Into<String>, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 404 => Self::not_found(object),
            kube::Error::Api(ae) if ae.code == 409 => Self::conflict(object),
            other => Self::Kube { source: other },
        }
    }

    /// Check if this is an invalid config error
    pub fn is_invalid_config(&self) -> bool {
        matches!(self, Error::InvalidConfig { .. })
    }

    /// Check if this is an incompatible underlying resource error
    pub fn is_incompatible_underlying_resource(&self) -> bool {
        matches!(self, Error::IncompatibleUnderlyingResource { .. })
    }

    /// Check if this is a loop detected error
    pub fn is_loop_detected(&self) -> bool {
        matches!(self, Error::LoopDetected { .. })
    }

    /// Check if a resource received a value of the wrong type
    pub fn is_type_mismatch(&self) -> bool {
        matches!(self, Error::TypeMismatch { .. })
    }

    /// Check if this is an optimistic concurrency conflict
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409,
            _ => false,
        }
    }

    /// Check if this is a not found error
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            _ => false,
        }
    }

    /// Check if the watch resource version expired and a fresh list is needed
    pub fn is_gone(&self) -> bool {
        match self {
            Error::Watch { code, .. } => *code == GONE,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == GONE,
            _ => false,
        }
    }

    /// Check if this error is retryable
    ///
    /// Configuration, wrapping, type and loop errors are defects and never
    /// retried.
    /// Kubernetes errors are retried unless they are 4xx responses, except
    /// for conflicts which resolve on a fresh read.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) => ae.code == 409 || !(400..500).contains(&ae.code),
                _ => true,
            },
            Error::InvalidConfig { .. } => false,
            Error::IncompatibleUnderlyingResource { .. } => false,
            Error::LoopDetected { .. } => false,
            Error::Resource { retryable, .. } => *retryable,
            Error::Conflict { .. } => true,
            Error::NotFound { .. } => false,
            Error::Watch { .. } => true,
            Error::Decode { .. } => false,
            Error::Transport { .. } => true,
            Error::Timeout { .. } => true,
            Error::TypeMismatch { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Get the resource name if this error is associated with a specific resource
    pub fn resource_name(&self) -> Option<&str> {
        match self {
            Error::IncompatibleUnderlyingResource { resource, .. } => Some(resource),
            Error::Resource { resource, .. } => Some(resource),
            Error::TypeMismatch { resource, .. } => Some(resource),
            _ => None,
        }
    }
}
