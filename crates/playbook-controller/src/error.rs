//! Controller errors
//!
//! Workflow failures are not errors here: they are recorded in the resource
//! status. An `Err` from an add/update handler means the status could not be
//! persisted; from a delete handler it also covers a failed deprovision.

use playbook_common::ResourcePhase;
use thiserror::Error;

use crate::params::DerivationError;

/// Errors returned by the lifecycle handlers
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The resource store failed with a non-retryable error
    #[error(transparent)]
    Store(#[from] playbook_common::Error),

    /// Every status write attempt lost to a concurrent modification
    #[error("status write for {resource} still conflicting after {attempts} attempts")]
    StatusConflict {
        /// `namespace/name` of the resource
        resource: String,
        /// Attempts made before giving up
        attempts: u32,
    },

    /// The stored phase cannot move to the requested phase
    #[error("status of {resource} cannot move from {from} to {to}")]
    InvalidTransition {
        /// `namespace/name` of the resource
        resource: String,
        /// Phase found in the store
        from: ResourcePhase,
        /// Phase that was to be written
        to: ResourcePhase,
    },

    /// Parameters for the deprovision workflow could not be derived
    #[error("cannot derive deprovision parameters for {resource}: {source}")]
    Derivation {
        /// `namespace/name` of the resource
        resource: String,
        /// What was wrong with the resource
        #[source]
        source: DerivationError,
    },

    /// The deprovision workflow failed
    #[error("deprovision of {resource} failed: {detail}")]
    Deprovision {
        /// `namespace/name` of the resource
        resource: String,
        /// Failure detail and captured output
        detail: String,
    },

    /// The operator is shutting down and no new workflows are started
    #[error("operator is shutting down")]
    ShuttingDown,
}

impl ControllerError {
    /// Whether the error means the resource status may not reflect the
    /// latest outcome
    pub fn is_persistence_failure(&self) -> bool {
        matches!(
            self,
            Self::Store(_) | Self::StatusConflict { .. } | Self::InvalidTransition { .. }
        )
    }
}
