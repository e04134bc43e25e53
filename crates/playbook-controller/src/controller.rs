//! Lifecycle controller
//!
//! Turns resource lifecycle events into workflow runs and records each
//! outcome in the resource status:
//!
//! ```text
//! added/updated:  observe -> persist Applying -> derive parameters
//!                 -> run workflow -> persist Applied | Failed
//! deleted:        derive parameters -> run deprovision (no status writes)
//! ```
//!
//! Status writes are read-modify-write against the store: each attempt reads
//! the stored status, checks the phase change is allowed and stamps it. A
//! conflicting write re-reads the resource and re-applies the same phase
//! change; the workflow itself is never re-run because of a conflict. The
//! outcome Event is published only once the final status is stored.

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::runtime::events::EventType;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use playbook_common::events::{actions, object_reference, EventPublisher, NoopEventPublisher};
use playbook_common::metrics::ControllerMetrics;
use playbook_common::retry::{retry_with_backoff, RetryConfig, RetryError};
use playbook_common::status::{truncate_tail, MAX_MESSAGE_BYTES};
use playbook_common::store::describe;
use playbook_common::{
    status_for, ConditionReason, ReconciliationStatus, ResourceKey, ResourcePhase, ResourceStore,
};

use crate::dispatcher::{LifecycleEvent, LifecycleHandler};
use crate::error::ControllerError;
use crate::executor::{ExecutionFailure, ExecutionResult, Parameter, Workflow, WorkflowExecutor};
use crate::params::ParameterSchema;

/// Which kind of change triggered a reconcile
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Change {
    Added,
    Updated,
}

impl Change {
    fn workflow(self) -> Workflow {
        match self {
            Self::Added => Workflow::Provision,
            Self::Updated => Workflow::Update,
        }
    }

    fn reason(self) -> ConditionReason {
        match self {
            Self::Added => ConditionReason::CustomResourceAdded,
            Self::Updated => ConditionReason::CustomResourceUpdated,
        }
    }

    fn action(self) -> &'static str {
        match self {
            Self::Added => actions::PROVISION,
            Self::Updated => actions::UPDATE,
        }
    }

    fn record_success(self, metrics: &ControllerMetrics) {
        match self {
            Self::Added => metrics.record_created(),
            Self::Updated => metrics.record_updated(),
        }
    }

    fn record_failure(self, metrics: &ControllerMetrics) {
        match self {
            Self::Added => metrics.record_create_failure(),
            Self::Updated => metrics.record_update_failure(),
        }
    }
}

/// Reacts to resource lifecycle events
pub struct Controller {
    store: Arc<dyn ResourceStore>,
    executor: Arc<dyn WorkflowExecutor>,
    metrics: Arc<ControllerMetrics>,
    events: Arc<dyn EventPublisher>,
    schema: ParameterSchema,
    retry: RetryConfig,
    shutdown: CancellationToken,
}

impl Controller {
    /// Start building a controller over `store` and `executor`
    pub fn builder(
        store: Arc<dyn ResourceStore>,
        executor: Arc<dyn WorkflowExecutor>,
    ) -> ControllerBuilder {
        ControllerBuilder::new(store, executor)
    }

    /// Counters updated by this controller
    pub fn metrics(&self) -> &ControllerMetrics {
        &self.metrics
    }

    /// Handle a newly created resource: run the provision workflow.
    ///
    /// Returns the final status written to the resource. Workflow failures
    /// are reported through that status; `Err` means the status could not
    /// be persisted.
    #[instrument(skip_all, fields(resource = %describe(resource)))]
    pub async fn on_added(
        &self,
        resource: &DynamicObject,
    ) -> Result<ReconciliationStatus, ControllerError> {
        self.metrics.record_event();
        info!("resource added");
        self.reconcile(resource, Change::Added).await
    }

    /// Handle a modified resource: run the update workflow against the new
    /// version
    #[instrument(skip_all, fields(resource = %describe(new)))]
    pub async fn on_updated(
        &self,
        _old: &DynamicObject,
        new: &DynamicObject,
    ) -> Result<ReconciliationStatus, ControllerError> {
        self.metrics.record_event();
        info!("resource updated");
        self.reconcile(new, Change::Updated).await
    }

    /// Handle a deleted resource: run the deprovision workflow.
    ///
    /// The resource is gone, so no status is written.
    #[instrument(skip_all, fields(resource = %describe(resource)))]
    pub async fn on_deleted(&self, resource: &DynamicObject) -> Result<(), ControllerError> {
        self.metrics.record_event();
        info!("resource deleted");
        if self.shutdown.is_cancelled() {
            return Err(ControllerError::ShuttingDown);
        }
        let key = ResourceKey::from_resource(resource)?;

        let parameters = match self.schema.derive(resource) {
            Ok(parameters) => parameters,
            Err(source) => {
                self.metrics.record_delete_failure();
                return Err(ControllerError::Derivation {
                    resource: key.to_string(),
                    source,
                });
            }
        };

        let result = self.execute(Workflow::Deprovision, &parameters).await;
        if !result.is_success() {
            self.metrics.record_delete_failure();
            return Err(ControllerError::Deprovision {
                resource: key.to_string(),
                detail: truncate_tail(result.summary(), MAX_MESSAGE_BYTES),
            });
        }

        info!("deprovision workflow succeeded");
        self.metrics.record_deleted();
        Ok(())
    }

    async fn reconcile(
        &self,
        resource: &DynamicObject,
        change: Change,
    ) -> Result<ReconciliationStatus, ControllerError> {
        if self.shutdown.is_cancelled() {
            return Err(ControllerError::ShuttingDown);
        }
        let key = ResourceKey::from_resource(resource)?;
        let workflow = change.workflow();

        self.persist_phase(
            &key,
            ResourcePhase::Applying,
            change.reason(),
            format!("running {workflow} workflow"),
        )
        .await?;

        let (phase, reason, message) = match self.schema.derive(resource) {
            Err(e) => {
                warn!(error = %e, "cannot derive workflow parameters");
                change.record_failure(&self.metrics);
                (ResourcePhase::Failed, ConditionReason::ApplyFailed, e.to_string())
            }
            Ok(parameters) => {
                let result = self.execute(workflow, &parameters).await;
                let message = truncate_tail(result.summary(), MAX_MESSAGE_BYTES);
                if result.is_success() {
                    info!(%workflow, "workflow succeeded");
                    change.record_success(&self.metrics);
                    (ResourcePhase::Applied, ConditionReason::ApplySuccessful, message)
                } else {
                    change.record_failure(&self.metrics);
                    (ResourcePhase::Failed, ConditionReason::ApplyFailed, message)
                }
            }
        };

        let final_status = self.persist_phase(&key, phase, reason, message).await?;
        self.announce(resource, &final_status, change.action())
            .await;
        Ok(final_status)
    }

    /// Run a workflow, abandoning it if the operator shuts down first
    async fn execute(&self, workflow: Workflow, parameters: &[Parameter]) -> ExecutionResult {
        tokio::select! {
            biased;
            result = self.executor.run(workflow, parameters) => {
                if let Some(failure) = result.failure() {
                    warn!(%workflow, failure = %failure, "workflow failed");
                }
                result
            }
            _ = self.shutdown.cancelled() => {
                warn!(%workflow, "workflow interrupted by shutdown");
                ExecutionResult::failed(ExecutionFailure::Interrupted, String::new(), String::new())
            }
        }
    }

    /// Move the stored status to `phase` and return what was written.
    ///
    /// Every attempt starts from the status just read from the store, so
    /// timestamps are computed against the latest record and a conflicting
    /// write re-applies the same phase change on top of the newer copy.
    async fn persist_phase(
        &self,
        key: &ResourceKey,
        phase: ResourcePhase,
        reason: ConditionReason,
        message: String,
    ) -> Result<ReconciliationStatus, ControllerError> {
        let written = retry_with_backoff(
            &self.retry,
            "status-write",
            |e: &ControllerError| matches!(e, ControllerError::Store(s) if s.is_conflict()),
            |attempt| {
                let message = message.clone();
                async move {
                    if attempt > 1 {
                        debug!(resource = %key, attempt, "re-applying status after conflict");
                    }
                    let (mut current, version) =
                        self.store.get(&key.namespace, &key.name).await?;
                    let previous = status_for(&current);
                    if !previous.phase.can_transition_to(phase) {
                        return Err(ControllerError::InvalidTransition {
                            resource: key.to_string(),
                            from: previous.phase,
                            to: phase,
                        });
                    }
                    let next = previous.set_phase(phase, reason, message);
                    next.apply_to(&mut current);
                    self.store.update(&current, &version).await?;
                    Ok::<_, ControllerError>(next)
                }
            },
        )
        .await;

        match written {
            Ok(status) => {
                debug!(resource = %key, phase = %status.phase, "status persisted");
                Ok(status)
            }
            Err(RetryError::Exhausted { attempts, .. }) => Err(ControllerError::StatusConflict {
                resource: key.to_string(),
                attempts,
            }),
            Err(RetryError::Permanent(e)) => Err(e),
        }
    }

    async fn announce(&self, resource: &DynamicObject, status: &ReconciliationStatus, action: &str) {
        let type_ = if status.phase == ResourcePhase::Applied {
            EventType::Normal
        } else {
            EventType::Warning
        };
        let reason = status.reason.unwrap_or(ConditionReason::Unknown);
        let note = (!status.message.is_empty()).then(|| status.message.clone());
        self.events
            .publish(
                &object_reference(resource),
                type_,
                reason.as_str(),
                action,
                note,
            )
            .await;
    }
}

#[async_trait]
impl LifecycleHandler for Controller {
    async fn handle(&self, event: LifecycleEvent) {
        let result = match &event {
            LifecycleEvent::Added(resource) => self.on_added(resource).await.map(|_| ()),
            LifecycleEvent::Updated { old, new } => self.on_updated(old, new).await.map(|_| ()),
            LifecycleEvent::Deleted(resource) => self.on_deleted(resource).await,
        };
        match result {
            Ok(()) => {}
            Err(ControllerError::ShuttingDown) => {
                debug!(resource = %describe(event.resource()), kind = event.kind(), "skipped during shutdown")
            }
            Err(ControllerError::Store(e)) if e.is_not_found() => info!(
                resource = %describe(event.resource()),
                kind = event.kind(),
                "resource deleted before its status could be written"
            ),
            Err(e) if e.is_persistence_failure() => error!(
                resource = %describe(event.resource()),
                kind = event.kind(),
                error = %e,
                "status not persisted; resource status may be stale"
            ),
            Err(e) => error!(
                resource = %describe(event.resource()),
                kind = event.kind(),
                error = %e,
                "lifecycle handler failed"
            ),
        }
    }
}

/// Builder for [`Controller`]
pub struct ControllerBuilder {
    store: Arc<dyn ResourceStore>,
    executor: Arc<dyn WorkflowExecutor>,
    metrics: Option<Arc<ControllerMetrics>>,
    events: Option<Arc<dyn EventPublisher>>,
    schema: ParameterSchema,
    retry: RetryConfig,
    shutdown: Option<CancellationToken>,
}

impl ControllerBuilder {
    fn new(store: Arc<dyn ResourceStore>, executor: Arc<dyn WorkflowExecutor>) -> Self {
        Self {
            store,
            executor,
            metrics: None,
            events: None,
            schema: ParameterSchema::default(),
            retry: RetryConfig::default(),
            shutdown: None,
        }
    }

    /// Counters to update (defaults to a set on the global meter)
    pub fn metrics(mut self, metrics: Arc<ControllerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Where to publish Kubernetes Events (defaults to dropping them)
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Spec fields passed to workflows (defaults to a required integer `size`)
    pub fn schema(mut self, schema: ParameterSchema) -> Self {
        self.schema = schema;
        self
    }

    /// Attempts per status write before giving up on conflicts
    pub fn status_retries(mut self, attempts: u32) -> Self {
        self.retry.max_attempts = attempts.max(1);
        self
    }

    /// Full backoff settings for status writes
    pub fn retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Token whose cancellation interrupts running workflows
    pub fn shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    /// Build the controller
    pub fn build(self) -> Controller {
        Controller {
            store: self.store,
            executor: self.executor,
            metrics: self
                .metrics
                .unwrap_or_else(|| Arc::new(ControllerMetrics::default())),
            events: self.events.unwrap_or_else(|| Arc::new(NoopEventPublisher)),
            schema: self.schema,
            retry: self.retry,
            shutdown: self.shutdown.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::time::Duration;

    use k8s_openapi::api::core::v1::ObjectReference;
    use kube::discovery::ApiResource;
    use mockall::mock;
    use playbook_common::ResourceVersion;
    use serde_json::{json, Value};

    use crate::executor::MockWorkflowExecutor;

    mock! {
        pub Store {}

        #[async_trait::async_trait]
        impl ResourceStore for Store {
            async fn get(
                &self,
                namespace: &str,
                name: &str,
            ) -> Result<(DynamicObject, ResourceVersion), playbook_common::Error>;
            async fn update(
                &self,
                resource: &DynamicObject,
                version: &ResourceVersion,
            ) -> Result<DynamicObject, playbook_common::Error>;
        }
    }

    /// In-memory store with a real version check and injectable conflicts
    struct MemoryStore {
        state: Mutex<StoreState>,
    }

    struct StoreState {
        resource: DynamicObject,
        version: u64,
        write_attempts: usize,
        conflicting_attempts: HashSet<usize>,
        conflict_from: Option<usize>,
        written: Vec<ReconciliationStatus>,
    }

    impl MemoryStore {
        fn new(resource: DynamicObject) -> Arc<Self> {
            Arc::new(Self {
                state: Mutex::new(StoreState {
                    resource,
                    version: 1,
                    write_attempts: 0,
                    conflicting_attempts: HashSet::new(),
                    conflict_from: None,
                    written: Vec::new(),
                }),
            })
        }

        /// Reject the given zero-based write attempts as if another writer
        /// got there first
        fn conflict_on(self: &Arc<Self>, attempts: &[usize]) -> Arc<Self> {
            self.state
                .lock()
                .unwrap()
                .conflicting_attempts
                .extend(attempts);
            self.clone()
        }

        fn conflict_from(self: &Arc<Self>, attempt: usize) -> Arc<Self> {
            self.state.lock().unwrap().conflict_from = Some(attempt);
            self.clone()
        }

        fn written(&self) -> Vec<ReconciliationStatus> {
            self.state.lock().unwrap().written.clone()
        }

        fn stored_status(&self) -> ReconciliationStatus {
            status_for(&self.state.lock().unwrap().resource)
        }

        fn write_attempts(&self) -> usize {
            self.state.lock().unwrap().write_attempts
        }
    }

    #[async_trait]
    impl ResourceStore for MemoryStore {
        async fn get(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<(DynamicObject, ResourceVersion), playbook_common::Error> {
            let state = self.state.lock().unwrap();
            let mut resource = state.resource.clone();
            if resource.metadata.namespace.as_deref() != Some(namespace)
                || resource.metadata.name.as_deref() != Some(name)
            {
                return Err(playbook_common::Error::not_found(format!(
                    "{namespace}/{name}"
                )));
            }
            let version = state.version.to_string();
            resource.metadata.resource_version = Some(version.clone());
            Ok((resource, ResourceVersion::new(version)))
        }

        async fn update(
            &self,
            resource: &DynamicObject,
            version: &ResourceVersion,
        ) -> Result<DynamicObject, playbook_common::Error> {
            let mut state = self.state.lock().unwrap();
            let attempt = state.write_attempts;
            state.write_attempts += 1;

            let injected = state.conflicting_attempts.contains(&attempt)
                || state.conflict_from.is_some_and(|from| attempt >= from);
            if injected {
                state.version += 1;
            }
            if injected || version.as_str() != state.version.to_string() {
                return Err(playbook_common::Error::conflict(describe(resource)));
            }

            state.version += 1;
            let status = status_for(resource);
            status.apply_to(&mut state.resource);
            state.written.push(status);
            let mut stored = state.resource.clone();
            stored.metadata.resource_version = Some(state.version.to_string());
            Ok(stored)
        }
    }

    #[derive(Default)]
    struct RecordingEvents {
        published: Mutex<Vec<(bool, String, String)>>,
    }

    impl RecordingEvents {
        fn published(&self) -> Vec<(bool, String, String)> {
            self.published.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventPublisher for RecordingEvents {
        async fn publish(
            &self,
            _resource: &ObjectReference,
            type_: EventType,
            reason: &str,
            action: &str,
            _note: Option<String>,
        ) {
            self.published.lock().unwrap().push((
                matches!(type_, EventType::Normal),
                reason.to_string(),
                action.to_string(),
            ));
        }
    }

    /// Executor whose runs never finish on their own
    struct HangingExecutor;

    #[async_trait]
    impl WorkflowExecutor for HangingExecutor {
        async fn run(&self, _workflow: Workflow, _parameters: &[Parameter]) -> ExecutionResult {
            std::future::pending().await
        }
    }

    fn api_resource() -> ApiResource {
        ApiResource {
            group: "example.com".into(),
            version: "v1".into(),
            kind: "Database".into(),
            api_version: "example.com/v1".into(),
            plural: "databases".into(),
        }
    }

    fn database(spec: Value) -> DynamicObject {
        let mut obj = DynamicObject::new("dory", &api_resource())
            .within("ns1")
            .data(json!({ "spec": spec }));
        obj.metadata.resource_version = Some("1".to_string());
        obj
    }

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        }
    }

    fn expected_params() -> Vec<Parameter> {
        vec![Parameter::new("namespace", "ns1"), Parameter::new("size", "3")]
    }

    fn executor_returning(workflow: Workflow, result: ExecutionResult) -> MockWorkflowExecutor {
        let mut executor = MockWorkflowExecutor::new();
        executor
            .expect_run()
            .withf(move |w, params| *w == workflow && params.to_vec() == expected_params())
            .times(1)
            .returning(move |_, _| result.clone());
        executor
    }

    fn controller(
        store: Arc<dyn ResourceStore>,
        executor: Arc<dyn WorkflowExecutor>,
    ) -> (Controller, Arc<ControllerMetrics>, Arc<RecordingEvents>) {
        let metrics = Arc::new(ControllerMetrics::global("Database"));
        let events = Arc::new(RecordingEvents::default());
        let controller = Controller::builder(store, executor)
            .metrics(metrics.clone())
            .events(events.clone())
            .retry_config(fast_retry(5))
            .build();
        (controller, metrics, events)
    }

    // =========================================================================
    // Added / Updated
    // =========================================================================

    /// Story: a new resource is provisioned and its status ends in Applied
    ///
    /// The provision workflow receives namespace then size; the resource
    /// passes through Applying before landing in Applied with the workflow
    /// output, and the managed gauge goes up by one.
    #[tokio::test]
    async fn story_successful_add_provisions_and_records_applied() {
        let resource = database(json!({ "namespace": "ns1", "size": 3 }));
        let store = MemoryStore::new(resource.clone());
        let executor = executor_returning(
            Workflow::Provision,
            ExecutionResult::succeeded("PLAY RECAP ok=2", ""),
        );
        let (controller, metrics, events) = controller(store.clone(), Arc::new(executor));

        let status = controller.on_added(&resource).await.unwrap();

        assert_eq!(status.phase, ResourcePhase::Applied);
        assert_eq!(status.reason, Some(ConditionReason::ApplySuccessful));
        assert_eq!(status.message, "PLAY RECAP ok=2");

        let written = store.written();
        assert_eq!(written.len(), 2);
        assert_eq!(written[0].phase, ResourcePhase::Applying);
        assert_eq!(written[0].reason, Some(ConditionReason::CustomResourceAdded));
        assert_eq!(written[1], status);
        assert_eq!(store.stored_status(), status);

        let applying_at = written[0].last_transition_time.unwrap();
        let applied_at = status.last_transition_time.unwrap();
        assert!(applied_at > applying_at);
        assert_eq!(status.last_update_time, status.last_transition_time);

        let snap = metrics.snapshot();
        assert_eq!(snap.events, 1);
        assert_eq!(snap.created, 1);
        assert_eq!(snap.managed, 1);

        assert_eq!(
            events.published(),
            vec![(true, "ApplySuccessful".to_string(), "Provision".to_string())]
        );
    }

    #[tokio::test]
    async fn failed_add_records_failure_detail() {
        let resource = database(json!({ "size": 3 }));
        let store = MemoryStore::new(resource.clone());
        let executor = executor_returning(
            Workflow::Provision,
            ExecutionResult::failed(
                ExecutionFailure::Exited { code: 1 },
                "TASK [create]",
                "fatal: unreachable",
            ),
        );
        let (controller, metrics, events) = controller(store.clone(), Arc::new(executor));

        let status = controller.on_added(&resource).await.unwrap();

        assert_eq!(status.phase, ResourcePhase::Failed);
        assert_eq!(status.reason, Some(ConditionReason::ApplyFailed));
        assert!(status.message.contains("exit code 1"));
        assert!(status.message.contains("fatal: unreachable"));
        assert_eq!(store.stored_status(), status);

        let snap = metrics.snapshot();
        assert_eq!(snap.create_failures, 1);
        assert_eq!(snap.created, 0);
        assert_eq!(snap.managed, 0);
        assert_eq!(
            events.published(),
            vec![(false, "ApplyFailed".to_string(), "Provision".to_string())]
        );
    }

    #[tokio::test]
    async fn missing_size_fails_without_running_the_workflow() {
        let resource = database(json!({}));
        let store = MemoryStore::new(resource.clone());
        let mut executor = MockWorkflowExecutor::new();
        executor.expect_run().never();
        let (controller, metrics, _) = controller(store.clone(), Arc::new(executor));

        let status = controller.on_added(&resource).await.unwrap();

        assert_eq!(status.phase, ResourcePhase::Failed);
        assert_eq!(status.reason, Some(ConditionReason::ApplyFailed));
        assert!(status.message.contains("spec.size"));
        assert_eq!(store.written().len(), 2);
        assert_eq!(metrics.snapshot().create_failures, 1);
    }

    #[tokio::test]
    async fn update_runs_update_workflow() {
        let old = database(json!({ "size": 2 }));
        let new = database(json!({ "size": 3 }));
        let store = MemoryStore::new(new.clone());
        let executor =
            executor_returning(Workflow::Update, ExecutionResult::succeeded("resized", ""));
        let (controller, metrics, events) = controller(store.clone(), Arc::new(executor));

        let status = controller.on_updated(&old, &new).await.unwrap();

        assert_eq!(status.phase, ResourcePhase::Applied);
        assert_eq!(
            store.written()[0].reason,
            Some(ConditionReason::CustomResourceUpdated)
        );
        let snap = metrics.snapshot();
        assert_eq!(snap.updated, 1);
        assert_eq!(snap.managed, 0);
        assert_eq!(events.published()[0].2, "Update");
    }

    #[tokio::test]
    async fn failed_update_counts_update_failure() {
        let resource = database(json!({ "size": 3 }));
        let store = MemoryStore::new(resource.clone());
        let executor = executor_returning(
            Workflow::Update,
            ExecutionResult::failed(ExecutionFailure::Signaled, "", ""),
        );
        let (controller, metrics, _) = controller(store, Arc::new(executor));

        let status = controller.on_updated(&resource, &resource).await.unwrap();

        assert_eq!(status.message, "terminated by signal");
        assert_eq!(metrics.snapshot().update_failures, 1);
    }

    #[tokio::test]
    async fn previously_failed_resource_moves_back_through_applying() {
        let mut resource = database(json!({ "size": 3 }));
        resource.data["status"] = json!({ "phase": "Failed", "reason": "ApplyFailed" });
        let store = MemoryStore::new(resource.clone());
        let executor =
            executor_returning(Workflow::Update, ExecutionResult::succeeded("fixed", ""));
        let (controller, _, _) = controller(store.clone(), Arc::new(executor));

        controller.on_updated(&resource, &resource).await.unwrap();

        let phases: Vec<_> = store.written().iter().map(|s| s.phase).collect();
        assert_eq!(phases, vec![ResourcePhase::Applying, ResourcePhase::Applied]);
    }

    #[tokio::test]
    async fn long_output_is_truncated_from_the_front() {
        let resource = database(json!({ "size": 3 }));
        let store = MemoryStore::new(resource.clone());
        let output = format!("{}PLAY RECAP", "x".repeat(MAX_MESSAGE_BYTES));
        let executor =
            executor_returning(Workflow::Provision, ExecutionResult::succeeded(output, ""));
        let (controller, _, _) = controller(store, Arc::new(executor));

        let status = controller.on_added(&resource).await.unwrap();

        assert_eq!(status.message.len(), MAX_MESSAGE_BYTES);
        assert!(status.message.ends_with("PLAY RECAP"));
    }

    // =========================================================================
    // Conflicts
    // =========================================================================

    /// Story: a concurrent writer wins the first final-status write
    ///
    /// The controller re-reads the resource and re-applies the same status.
    /// The workflow ran exactly once and the stored status is the one the
    /// handler returned.
    #[tokio::test]
    async fn story_conflict_on_final_write_reapplies_without_rerunning() {
        let resource = database(json!({ "size": 3 }));
        let store = MemoryStore::new(resource.clone()).conflict_on(&[1]);
        let executor = executor_returning(
            Workflow::Provision,
            ExecutionResult::succeeded("PLAY RECAP ok=2", ""),
        );
        let (controller, _, _) = controller(store.clone(), Arc::new(executor));

        let status = controller.on_added(&resource).await.unwrap();

        assert_eq!(store.write_attempts(), 3);
        assert_eq!(store.written().len(), 2);
        assert_eq!(store.stored_status(), status);
        assert_eq!(status.phase, ResourcePhase::Applied);
    }

    #[tokio::test]
    async fn conflict_on_applying_write_is_retried() {
        let resource = database(json!({ "size": 3 }));
        let store = MemoryStore::new(resource.clone()).conflict_on(&[0, 1]);
        let executor =
            executor_returning(Workflow::Provision, ExecutionResult::succeeded("ok", ""));
        let (controller, _, _) = controller(store.clone(), Arc::new(executor));

        let status = controller.on_added(&resource).await.unwrap();

        assert_eq!(status.phase, ResourcePhase::Applied);
        assert_eq!(store.write_attempts(), 4);
    }

    #[tokio::test]
    async fn persistent_conflicts_surface_after_bounded_attempts() {
        let resource = database(json!({ "size": 3 }));
        let store = MemoryStore::new(resource.clone()).conflict_from(1);
        let executor =
            executor_returning(Workflow::Provision, ExecutionResult::succeeded("ok", ""));
        let metrics = Arc::new(ControllerMetrics::global("Database"));
        let events = Arc::new(RecordingEvents::default());
        let controller = Controller::builder(store.clone(), Arc::new(executor))
            .metrics(metrics.clone())
            .events(events.clone())
            .retry_config(fast_retry(1))
            .status_retries(3)
            .build();

        let err = controller.on_added(&resource).await.unwrap_err();

        match err {
            ControllerError::StatusConflict { resource, attempts } => {
                assert_eq!(resource, "ns1/dory");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected StatusConflict, got {other:?}"),
        }
        assert_eq!(store.write_attempts(), 4);
        // the workflow did succeed; only the record of it was lost
        assert_eq!(metrics.snapshot().created, 1);
        assert!(events.published().is_empty());
    }

    /// Story: an update event arrives carrying an older status than the store
    ///
    /// An edit queued while provisioning ran still shows `Applying` from
    /// before the workflow finished. The handler must stamp its phase change
    /// against the stored `Applied` record, so the transition time moves
    /// forward instead of being copied back from the stale snapshot.
    #[tokio::test]
    async fn story_stale_event_status_does_not_rewind_transition_time() {
        let applying_at = "2020-01-01T00:00:00Z";
        let mut stale = database(json!({ "size": 3 }));
        stale.data["status"] = json!({
            "phase": "Applying",
            "reason": "CustomResourceAdded",
            "lastUpdateTime": applying_at,
            "lastTransitionTime": applying_at,
        });
        let mut stored = stale.clone();
        stored.data["status"] = json!({
            "phase": "Applied",
            "reason": "ApplySuccessful",
            "message": "PLAY RECAP ok=2",
            "lastUpdateTime": "2020-01-01T00:05:00Z",
            "lastTransitionTime": "2020-01-01T00:05:00Z",
        });
        let applied_at = status_for(&stored).last_transition_time.unwrap();
        let store = MemoryStore::new(stored);
        let executor =
            executor_returning(Workflow::Update, ExecutionResult::succeeded("resized", ""));
        let (controller, _, _) = controller(store.clone(), Arc::new(executor));

        let status = controller.on_updated(&stale, &stale).await.unwrap();

        let written = store.written();
        assert_eq!(written[0].phase, ResourcePhase::Applying);
        let moved_at = written[0].last_transition_time.unwrap();
        assert!(moved_at > applied_at);
        assert!(status.last_transition_time.unwrap() > moved_at);
        assert_eq!(store.stored_status(), status);
    }

    #[tokio::test]
    async fn disallowed_final_transition_is_rejected_without_an_event() {
        // another writer wiped the status while the workflow ran
        let resource = database(json!({ "size": 3 }));
        let stored = resource.clone();
        let mut store = MockStore::new();
        store.expect_get().returning(move |_, _| {
            Ok((stored.clone(), ResourceVersion::new("1")))
        });
        store
            .expect_update()
            .times(1)
            .returning(|resource, _| Ok(resource.clone()));
        let executor =
            executor_returning(Workflow::Provision, ExecutionResult::succeeded("ok", ""));
        let (controller, _, events) = controller(Arc::new(store), Arc::new(executor));

        let err = controller.on_added(&resource).await.unwrap_err();

        match err {
            ControllerError::InvalidTransition { resource, from, to } => {
                assert_eq!(resource, "ns1/dory");
                assert_eq!(from, ResourcePhase::None);
                assert_eq!(to, ResourcePhase::Applied);
            }
            other => panic!("expected InvalidTransition, got {other:?}"),
        }
        assert!(events.published().is_empty());
    }

    #[tokio::test]
    async fn failed_applying_write_aborts_before_the_workflow() {
        let resource = database(json!({ "size": 3 }));
        let mut store = MockStore::new();
        store
            .expect_get()
            .returning(|ns, name| Err(playbook_common::Error::not_found(format!("{ns}/{name}"))));
        store.expect_update().never();
        let mut executor = MockWorkflowExecutor::new();
        executor.expect_run().never();
        let (controller, _, events) = controller(Arc::new(store), Arc::new(executor));

        let err = controller.on_added(&resource).await.unwrap_err();

        assert!(matches!(
            err,
            ControllerError::Store(playbook_common::Error::NotFound { .. })
        ));
        assert!(events.published().is_empty());
    }

    #[tokio::test]
    async fn resource_without_namespace_is_rejected() {
        let resource = DynamicObject::new("dory", &api_resource())
            .data(json!({ "spec": { "size": 3 } }));
        let mut store = MockStore::new();
        store.expect_get().never();
        store.expect_update().never();
        let mut executor = MockWorkflowExecutor::new();
        executor.expect_run().never();
        let (controller, _, _) = controller(Arc::new(store), Arc::new(executor));

        let err = controller.on_added(&resource).await.unwrap_err();

        assert!(matches!(
            err,
            ControllerError::Store(playbook_common::Error::InvalidResource { .. })
        ));
    }

    // =========================================================================
    // Deleted
    // =========================================================================

    fn store_without_writes() -> MockStore {
        let mut store = MockStore::new();
        store.expect_get().never();
        store.expect_update().never();
        store
    }

    #[tokio::test]
    async fn delete_runs_deprovision_without_touching_status() {
        let resource = database(json!({ "size": 3 }));
        let executor =
            executor_returning(Workflow::Deprovision, ExecutionResult::succeeded("gone", ""));
        let (controller, metrics, _) =
            controller(Arc::new(store_without_writes()), Arc::new(executor));

        controller.on_deleted(&resource).await.unwrap();

        let snap = metrics.snapshot();
        assert_eq!(snap.events, 1);
        assert_eq!(snap.deleted, 1);
        assert_eq!(snap.managed, -1);
    }

    #[tokio::test]
    async fn failed_delete_is_reported_and_counted() {
        let resource = database(json!({ "size": 3 }));
        let executor = executor_returning(
            Workflow::Deprovision,
            ExecutionResult::failed(ExecutionFailure::Exited { code: 4 }, "", "still in use"),
        );
        let (controller, metrics, _) =
            controller(Arc::new(store_without_writes()), Arc::new(executor));

        let err = controller.on_deleted(&resource).await.unwrap_err();

        match err {
            ControllerError::Deprovision { resource, detail } => {
                assert_eq!(resource, "ns1/dory");
                assert!(detail.contains("exit code 4"));
                assert!(detail.contains("still in use"));
            }
            other => panic!("expected Deprovision, got {other:?}"),
        }
        let snap = metrics.snapshot();
        assert_eq!(snap.delete_failures, 1);
        assert_eq!(snap.deleted, 0);
    }

    #[tokio::test]
    async fn delete_with_invalid_spec_never_runs_the_workflow() {
        let resource = database(json!({ "size": "large" }));
        let mut executor = MockWorkflowExecutor::new();
        executor.expect_run().never();
        let (controller, metrics, _) =
            controller(Arc::new(store_without_writes()), Arc::new(executor));

        let err = controller.on_deleted(&resource).await.unwrap_err();

        assert!(matches!(err, ControllerError::Derivation { .. }));
        assert_eq!(metrics.snapshot().delete_failures, 1);
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Story: the operator shuts down while a provision workflow is running
    ///
    /// The running workflow is abandoned and the resource is left Failed with
    /// a message saying why, instead of stuck in Applying.
    #[tokio::test]
    async fn story_shutdown_interrupts_running_workflow() {
        let resource = database(json!({ "size": 3 }));
        let store = MemoryStore::new(resource.clone());
        let token = CancellationToken::new();
        let controller = Controller::builder(store.clone(), Arc::new(HangingExecutor))
            .metrics(Arc::new(ControllerMetrics::global("Database")))
            .retry_config(fast_retry(5))
            .shutdown(token.clone())
            .build();

        let (status, ()) = tokio::join!(controller.on_added(&resource), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });
        let status = status.unwrap();

        assert_eq!(status.phase, ResourcePhase::Failed);
        assert_eq!(status.message, "interrupted by operator shutdown");
        assert_eq!(store.stored_status(), status);
        assert_eq!(controller.metrics().snapshot().create_failures, 1);
    }

    #[tokio::test]
    async fn no_new_work_starts_after_shutdown() {
        let resource = database(json!({ "size": 3 }));
        let token = CancellationToken::new();
        token.cancel();
        let mut executor = MockWorkflowExecutor::new();
        executor.expect_run().never();
        let controller = Controller::builder(Arc::new(store_without_writes()), Arc::new(executor))
            .metrics(Arc::new(ControllerMetrics::global("Database")))
            .shutdown(token)
            .build();

        assert!(matches!(
            controller.on_added(&resource).await,
            Err(ControllerError::ShuttingDown)
        ));
        assert!(matches!(
            controller.on_deleted(&resource).await,
            Err(ControllerError::ShuttingDown)
        ));
    }

    // =========================================================================
    // LifecycleHandler
    // =========================================================================

    #[tokio::test]
    async fn handler_routes_events_to_the_matching_workflow() {
        let resource = database(json!({ "size": 3 }));
        let store = MemoryStore::new(resource.clone());
        let mut executor = MockWorkflowExecutor::new();
        let mut seq = mockall::Sequence::new();
        for workflow in [Workflow::Provision, Workflow::Update, Workflow::Deprovision] {
            executor
                .expect_run()
                .withf(move |w, _| *w == workflow)
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _| ExecutionResult::succeeded("ok", ""));
        }
        let (controller, metrics, _) = controller(store, Arc::new(executor));

        controller
            .handle(LifecycleEvent::Added(resource.clone()))
            .await;
        controller
            .handle(LifecycleEvent::Updated {
                old: resource.clone(),
                new: resource.clone(),
            })
            .await;
        controller.handle(LifecycleEvent::Deleted(resource)).await;

        let snap = metrics.snapshot();
        assert_eq!(snap.events, 3);
        assert_eq!((snap.created, snap.updated, snap.deleted), (1, 1, 1));
        assert_eq!(snap.managed, 0);
    }
}
