//! Common types for the playbook operator: status model, resource store,
//! errors, metrics and telemetry.

#![deny(missing_docs)]

pub mod error;
pub mod events;
pub mod metrics;
pub mod retry;
pub mod status;
pub mod store;
pub mod telemetry;

pub use error::Error;
pub use status::{status_for, ConditionReason, ReconciliationStatus, ResourcePhase};
pub use store::{KubeResourceStore, ResourceKey, ResourceStore, ResourceVersion};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager recorded on every write made by the operator
pub const FIELD_MANAGER: &str = "playbook-operator";

/// Default number of attempts for a conflicting status write
pub const DEFAULT_STATUS_RETRIES: u32 = 5;
