//! Playbook controller: runs provision/update/deprovision workflows in
//! response to custom resource lifecycle events and records the outcome in
//! each resource's status.

#![deny(missing_docs)]

pub mod controller;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod params;
pub mod runner;

pub use controller::{Controller, ControllerBuilder};
pub use dispatcher::{Dispatcher, EventClassifier, LifecycleEvent, LifecycleHandler};
pub use error::ControllerError;
pub use executor::{
    ExecutionFailure, ExecutionOutcome, ExecutionResult, Parameter, Workflow, WorkflowExecutor,
};
pub use params::{DerivationError, FieldKind, FieldSpec, ParameterSchema};
pub use runner::PlaybookRunner;
