//! Resource store client
//!
//! Get and update custom resources by namespace and name with optimistic
//! concurrency. The version token is the Kubernetes `resourceVersion`; a
//! write carrying a stale token is rejected by the API server with 409 and
//! surfaces as [`Error::Conflict`].

use std::fmt;

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::Client;
use serde_json::{json, Value};
use tracing::debug;

use crate::status::STATUS_KEY;
use crate::{Error, FIELD_MANAGER};

/// Identity of a namespaced resource
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    /// Resource namespace
    pub namespace: String,
    /// Resource name
    pub name: String,
}

impl ResourceKey {
    /// Create a key from namespace and name
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Read the key from a resource's metadata
    pub fn from_resource(resource: &DynamicObject) -> Result<Self, Error> {
        let name = resource
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::invalid_resource("resource has no metadata.name"))?;
        let namespace = resource.metadata.namespace.as_deref().ok_or_else(|| {
            Error::invalid_resource(format!("resource {name} has no metadata.namespace"))
        })?;
        Ok(Self::new(namespace, name))
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Optimistic-concurrency token returned by [`ResourceStore::get`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceVersion(String);

impl ResourceVersion {
    /// Wrap a raw version string
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    /// Read the version from a resource's metadata
    pub fn of(resource: &DynamicObject) -> Result<Self, Error> {
        resource
            .metadata
            .resource_version
            .clone()
            .map(Self)
            .ok_or_else(|| Error::MissingResourceVersion {
                resource: describe(resource),
            })
    }

    /// Raw version string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Trait abstracting the resource store
///
/// Lets the controller run against a mock in tests and the Kubernetes API in
/// production.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Fetch the current copy of a resource together with its version token
    async fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(DynamicObject, ResourceVersion), Error>;

    /// Write `resource`'s status, succeeding only if the stored copy is still
    /// at `version`.
    ///
    /// Returns [`Error::Conflict`] if the resource changed since it was read.
    async fn update(
        &self,
        resource: &DynamicObject,
        version: &ResourceVersion,
    ) -> Result<DynamicObject, Error>;
}

/// Resource store backed by the Kubernetes API
pub struct KubeResourceStore {
    client: Client,
    api_resource: ApiResource,
    status_subresource: bool,
}

impl KubeResourceStore {
    /// Create a store for the custom resource described by `api_resource`.
    ///
    /// Status writes go through the `/status` subresource by default.
    pub fn new(client: Client, api_resource: ApiResource) -> Self {
        Self {
            client,
            api_resource,
            status_subresource: true,
        }
    }

    /// Choose whether status writes target the `/status` subresource or the
    /// main resource (for CRDs without a status subresource)
    pub fn with_status_subresource(mut self, enabled: bool) -> Self {
        self.status_subresource = enabled;
        self
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.api_resource)
    }
}

#[async_trait]
impl ResourceStore for KubeResourceStore {
    async fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(DynamicObject, ResourceVersion), Error> {
        let key = ResourceKey::new(namespace, name);
        let resource = self
            .api(namespace)
            .get(name)
            .await
            .map_err(|e| Error::from_kube(&key.to_string(), e))?;
        let version = ResourceVersion::of(&resource)?;
        Ok((resource, version))
    }

    async fn update(
        &self,
        resource: &DynamicObject,
        version: &ResourceVersion,
    ) -> Result<DynamicObject, Error> {
        let key = ResourceKey::from_resource(resource)?;
        let patch = status_patch(resource, version);
        let params = PatchParams::apply(FIELD_MANAGER);
        let api = self.api(&key.namespace);

        debug!(resource = %key, version = %version, "writing status");

        let result = if self.status_subresource {
            api.patch_status(&key.name, &params, &Patch::Merge(&patch))
                .await
        } else {
            api.patch(&key.name, &params, &Patch::Merge(&patch)).await
        };

        result.map_err(|e| Error::from_kube(&key.to_string(), e))
    }
}

/// Status fields that are omitted when empty and must be cleared explicitly
const CLEARABLE_STATUS_FIELDS: [&str; 4] =
    ["reason", "message", "lastUpdateTime", "lastTransitionTime"];

/// Merge patch that replaces the status and pins the expected resourceVersion.
///
/// The API server rejects the patch with 409 if the stored resourceVersion
/// differs from the one in the patch. Omitted status fields are sent as null
/// so the merge removes stale values instead of keeping them.
fn status_patch(resource: &DynamicObject, version: &ResourceVersion) -> Value {
    let mut status = resource
        .data
        .get(STATUS_KEY)
        .cloned()
        .unwrap_or(Value::Null);
    if let Value::Object(fields) = &mut status {
        for field in CLEARABLE_STATUS_FIELDS {
            fields.entry(field).or_insert(Value::Null);
        }
    }
    json!({
        "metadata": { "resourceVersion": version.as_str() },
        STATUS_KEY: status,
    })
}

/// `namespace/name` of a resource for logs, falling back to the bare name
pub fn describe(resource: &DynamicObject) -> String {
    match ResourceKey::from_resource(resource) {
        Ok(key) => key.to_string(),
        Err(_) => resource
            .metadata
            .name
            .clone()
            .unwrap_or_else(|| "<unnamed>".to_string()),
    }
}
