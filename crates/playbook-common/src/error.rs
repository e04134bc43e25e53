//! Error types for resource store operations
//!
//! Errors are structured with fields to aid debugging in production.
//! The store distinguishes optimistic-concurrency conflicts from every other
//! failure so callers can retry the former and surface the latter.

use thiserror::Error;

/// Main error type for resource store operations
#[derive(Debug, Error)]
pub enum Error {
    /// The write was rejected because the resource changed since it was read
    #[error("conflict writing {resource}: resource was modified concurrently")]
    Conflict {
        /// `namespace/name` of the resource
        resource: String,
    },

    /// The resource does not exist (or no longer exists) in the store
    #[error("resource {resource} not found")]
    NotFound {
        /// `namespace/name` of the resource
        resource: String,
    },

    /// The resource carries no version token, so a safe write is impossible
    #[error("resource {resource} has no resourceVersion")]
    MissingResourceVersion {
        /// `namespace/name` of the resource
        resource: String,
    },

    /// A resource is missing its name or namespace
    #[error("invalid resource: {message}")]
    InvalidResource {
        /// Description of what is missing
        message: String,
    },

    /// Kubernetes API error not covered by a more specific variant
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },
}

impl Error {
    /// Create a conflict error for the given resource
    pub fn conflict(resource: impl Into<String>) -> Self {
        Self::Conflict {
            resource: resource.into(),
        }
    }

    /// Create a not-found error for the given resource
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Create an invalid-resource error
    pub fn invalid_resource(msg: impl Into<String>) -> Self {
        Self::InvalidResource {
            message: msg.into(),
        }
    }

    /// Map a kube-rs error for `resource`, lifting 409 and 404 into their
    /// dedicated variants
    pub fn from_kube(resource: &str, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ref ae) if ae.code == 409 => Self::conflict(resource),
            kube::Error::Api(ref ae) if ae.code == 404 => Self::not_found(resource),
            other => Self::Kube { source: other },
        }
    }

    /// Check if this error is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// Check if this error is a not-found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}
