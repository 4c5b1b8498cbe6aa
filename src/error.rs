//! Error types for node identity and certificate trust operations
//!
//! Errors are grouped by how the caller should react: validation errors need
//! a fix to the input, conflicts and transient errors are retryable, and a
//! missing node is always surfaced as-is.

use thiserror::Error;

/// Main error type for node-trust operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed address, IP, CSR or configuration input
    #[error("validation error: {0}")]
    Validation(String),

    /// Referenced object does not exist
    ///
    /// Formats the same way the API server does (`nodes "x" not found`).
    #[error("{kind} \"{name}\" not found")]
    NotFound {
        /// Plural resource kind, e.g. `nodes`
        kind: String,
        /// Name of the missing object
        name: String,
    },

    /// Node lookup failed while evaluating a signing request
    #[error("failed to get node {name}: {source}")]
    NodeLookup {
        /// Node name taken from the request
        name: String,
        /// Underlying registry failure
        #[source]
        source: Box<Error>,
    },

    /// Optimistic concurrency conflict from the registry
    #[error("conflict updating {name}: {message}")]
    Conflict {
        /// Object being updated
        name: String,
        /// Registry-provided message
        message: String,
    },

    /// Network, timeout or cancellation while talking to the registry
    #[error("transient error: {0}")]
    Transient(String),

    /// Any other Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a not-found error for a node
    pub fn node_not_found(name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "nodes".to_string(),
            name: name.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Conflict {
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a transient error with the given message
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Wrap a registry failure that happened while resolving a CSR's node
    pub fn node_lookup(name: impl Into<String>, source: Error) -> Self {
        Self::NodeLookup {
            name: name.into(),
            source: Box::new(source),
        }
    }

    /// Check if the caller may retry the failed operation
    ///
    /// Conflicts and transient failures are retryable. A missing node and
    /// invalid input are not: retrying would return the same answer.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Conflict { .. } | Error::Transient(_) => true,
            Error::NodeLookup { source, .. } => source.is_retryable(),
            Error::Kube(source) => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::Validation(_) | Error::NotFound { .. } | Error::Serialization(_) => false,
        }
    }

    /// True if this error (or the lookup it wraps) reports a missing object
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::NodeLookup { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
