//! Kubernetes Event recording
//!
//! Wraps `kube::runtime::events::Recorder` behind a trait so the controller
//! can surface workflow outcomes in `kubectl describe` without depending on a
//! live API server in tests.
//!
//! Events are fire-and-forget: a failed publish is logged and never fails
//! reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::DynamicObject;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

use crate::status::truncate_tail;

/// Trait for publishing Kubernetes Events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event about `resource`
    async fn publish(
        &self,
        resource: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher backed by the Kubernetes events API
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: note.map(truncate_note),
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Publisher that drops every event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Build an object reference for a dynamically typed resource
pub fn object_reference(resource: &DynamicObject) -> ObjectReference {
    let types = resource.types.as_ref();
    ObjectReference {
        api_version: types.map(|t| t.api_version.clone()),
        kind: types.map(|t| t.kind.clone()),
        name: resource.metadata.name.clone(),
        namespace: resource.metadata.namespace.clone(),
        uid: resource.metadata.uid.clone(),
        resource_version: resource.metadata.resource_version.clone(),
        ..Default::default()
    }
}

/// Events API notes are limited to 1 KiB
const MAX_NOTE_BYTES: usize = 1024;

fn truncate_note(note: String) -> String {
    truncate_tail(note, MAX_NOTE_BYTES)
}

/// Well-known event action strings
pub mod actions {
    /// Running the provision workflow
    pub const PROVISION: &str = "Provision";
    /// Running the update workflow
    pub const UPDATE: &str = "Update";
}
