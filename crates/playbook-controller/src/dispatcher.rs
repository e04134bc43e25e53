//! Watch stream dispatch
//!
//! Converts the raw watch stream into added/updated/deleted lifecycle events
//! and hands them to a handler. Events for one resource identity are handled
//! strictly in order by a dedicated worker task; different identities are
//! handled concurrently.
//!
//! Changes that touch only the status (including the controller's own status
//! writes) are not reported as updates. This differs from a plain informer,
//! which reports every modification: an edit made only to `status` by another
//! writer does not trigger the update workflow here.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use kube::api::DynamicObject;
use kube::runtime::watcher;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use playbook_common::status::STATUS_KEY;
use playbook_common::store::describe;
use playbook_common::ResourceKey;

/// How long in-flight work may run after a shutdown request before it is
/// interrupted
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// A resource lifecycle transition
#[derive(Clone, Debug)]
pub enum LifecycleEvent {
    /// The resource appeared
    Added(DynamicObject),
    /// The resource's desired state changed
    Updated {
        /// Previously observed copy
        old: DynamicObject,
        /// Newly observed copy
        new: DynamicObject,
    },
    /// The resource was removed
    Deleted(DynamicObject),
}

impl LifecycleEvent {
    /// The most recent copy of the resource
    pub fn resource(&self) -> &DynamicObject {
        match self {
            Self::Added(resource) | Self::Deleted(resource) => resource,
            Self::Updated { new, .. } => new,
        }
    }

    /// Short label for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Added(_) => "added",
            Self::Updated { .. } => "updated",
            Self::Deleted(_) => "deleted",
        }
    }
}

/// Receives lifecycle events, one at a time per resource identity
#[async_trait]
pub trait LifecycleHandler: Send + Sync + 'static {
    /// Handle one event; failures are the handler's to report
    async fn handle(&self, event: LifecycleEvent);
}

// =============================================================================
// Classification
// =============================================================================

/// Tracks the last-seen copy of each resource to turn watch events into
/// lifecycle events
#[derive(Default)]
pub struct EventClassifier {
    known: HashMap<ResourceKey, DynamicObject>,
    relisted: Option<HashSet<ResourceKey>>,
}

impl EventClassifier {
    /// Classify one watch event
    pub fn observe(&mut self, event: watcher::Event<DynamicObject>) -> Vec<LifecycleEvent> {
        match event {
            watcher::Event::Init => {
                debug!(known = self.known.len(), "relist started");
                self.relisted = Some(HashSet::new());
                Vec::new()
            }
            watcher::Event::InitApply(resource) => {
                let Some(key) = identity(&resource) else {
                    return Vec::new();
                };
                if let Some(relisted) = &mut self.relisted {
                    relisted.insert(key.clone());
                }
                self.apply(key, resource).into_iter().collect()
            }
            watcher::Event::InitDone => self.finish_relist(),
            watcher::Event::Apply(resource) => match identity(&resource) {
                Some(key) => self.apply(key, resource).into_iter().collect(),
                None => Vec::new(),
            },
            watcher::Event::Delete(resource) => {
                if let Some(key) = identity(&resource) {
                    self.known.remove(&key);
                    vec![LifecycleEvent::Deleted(resource)]
                } else {
                    Vec::new()
                }
            }
        }
    }

    /// Number of resources currently tracked
    pub fn len(&self) -> usize {
        self.known.len()
    }

    /// Whether no resources are tracked
    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    fn apply(&mut self, key: ResourceKey, resource: DynamicObject) -> Option<LifecycleEvent> {
        match self.known.insert(key, resource.clone()) {
            None => Some(LifecycleEvent::Added(resource)),
            Some(old) if same_desired_state(&old, &resource) => {
                debug!(resource = %describe(&resource), "ignoring status-only change");
                None
            }
            Some(old) => Some(LifecycleEvent::Updated { old, new: resource }),
        }
    }

    /// Resources that were known before a relist but missing from it were
    /// deleted while the watch was down
    fn finish_relist(&mut self) -> Vec<LifecycleEvent> {
        let Some(relisted) = self.relisted.take() else {
            return Vec::new();
        };
        let gone: Vec<ResourceKey> = self
            .known
            .keys()
            .filter(|key| !relisted.contains(*key))
            .cloned()
            .collect();
        if !gone.is_empty() {
            info!(count = gone.len(), "resources deleted while the watch was down");
        }
        gone.into_iter()
            .filter_map(|key| self.known.remove(&key))
            .map(LifecycleEvent::Deleted)
            .collect()
    }
}

fn identity(resource: &DynamicObject) -> Option<ResourceKey> {
    match ResourceKey::from_resource(resource) {
        Ok(key) => Some(key),
        Err(e) => {
            warn!(error = %e, "ignoring resource without a namespaced identity");
            None
        }
    }
}

/// Whether two copies of a resource differ only in status or server-managed
/// bookkeeping (resourceVersion, managedFields, generation)
pub fn same_desired_state(a: &DynamicObject, b: &DynamicObject) -> bool {
    a.metadata.labels == b.metadata.labels
        && a.metadata.annotations == b.metadata.annotations
        && a.metadata.deletion_timestamp == b.metadata.deletion_timestamp
        && same_ignoring_status(&a.data, &b.data)
}

fn same_ignoring_status(a: &Value, b: &Value) -> bool {
    match (a.as_object(), b.as_object()) {
        (Some(a), Some(b)) => {
            desired_fields(a).count() == desired_fields(b).count()
                && desired_fields(a).all(|(key, value)| b.get(key) == Some(value))
        }
        _ => a == b,
    }
}

fn desired_fields(data: &Map<String, Value>) -> impl Iterator<Item = (&String, &Value)> {
    data.iter().filter(|(key, _)| key.as_str() != STATUS_KEY)
}

// =============================================================================
// Per-identity workers
// =============================================================================

struct Worker {
    sender: mpsc::UnboundedSender<LifecycleEvent>,
    handle: JoinHandle<()>,
}

/// Routes lifecycle events to one ordered worker per resource identity
pub struct Dispatcher {
    handler: Arc<dyn LifecycleHandler>,
    workers: HashMap<ResourceKey, Worker>,
    retiring: HashMap<ResourceKey, JoinHandle<()>>,
    tracker: TaskTracker,
}

impl Dispatcher {
    /// Dispatcher delivering to `handler`
    pub fn new(handler: Arc<dyn LifecycleHandler>) -> Self {
        Self {
            handler,
            workers: HashMap::new(),
            retiring: HashMap::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Queue `event` behind any earlier events for the same resource
    pub fn dispatch(&mut self, event: LifecycleEvent) {
        let Some(key) = identity(event.resource()) else {
            return;
        };
        let deleted = matches!(event, LifecycleEvent::Deleted(_));

        let worker = match self.workers.entry(key.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                // a re-created resource waits for the previous incarnation
                let previous = self.retiring.remove(&key);
                entry.insert(spawn_worker(
                    &self.tracker,
                    self.handler.clone(),
                    key.clone(),
                    previous,
                ))
            }
        };

        if worker.sender.send(event).is_err() {
            warn!(resource = %key, "worker stopped; event dropped");
        }

        if deleted {
            if let Some(worker) = self.workers.remove(&key) {
                self.retiring.retain(|_, handle| !handle.is_finished());
                self.retiring.insert(key, worker.handle);
            }
        }
    }

    /// Number of identities with a live worker
    pub fn active_workers(&self) -> usize {
        self.workers.len()
    }

    /// Stop accepting events and let queued work drain.
    ///
    /// If work is still running after `grace`, `interrupt` is cancelled so
    /// running workflows are abandoned, and the remaining workers are awaited.
    pub async fn shutdown(mut self, grace: Duration, interrupt: &CancellationToken) {
        info!(
            workers = self.workers.len(),
            grace_secs = grace.as_secs(),
            "draining lifecycle workers"
        );
        self.workers.clear();
        self.retiring.clear();
        self.tracker.close();

        if tokio::time::timeout(grace, self.tracker.wait())
            .await
            .is_err()
        {
            warn!("shutdown grace period elapsed; interrupting running workflows");
            interrupt.cancel();
            self.tracker.wait().await;
        }
        info!("lifecycle workers finished");
    }
}

fn spawn_worker(
    tracker: &TaskTracker,
    handler: Arc<dyn LifecycleHandler>,
    key: ResourceKey,
    previous: Option<JoinHandle<()>>,
) -> Worker {
    let (sender, mut receiver) = mpsc::unbounded_channel();
    let handle = tracker.spawn(async move {
        if let Some(previous) = previous {
            if let Err(e) = previous.await {
                warn!(resource = %key, error = %e, "previous worker ended abnormally");
            }
        }
        while let Some(event) = receiver.recv().await {
            handler.handle(event).await;
        }
        debug!(resource = %key, "worker finished");
    });
    Worker { sender, handle }
}

// =============================================================================
// Watch loop
// =============================================================================

/// Consume `stream` until it ends or `shutdown_signal` resolves, then drain
/// the workers with the given grace period.
///
/// Watch errors are logged and the stream is polled again; the watcher
/// re-establishes the watch (with backoff) and relists.
pub async fn run<S, F>(
    handler: Arc<dyn LifecycleHandler>,
    stream: S,
    shutdown_signal: F,
    grace: Duration,
    interrupt: CancellationToken,
) where
    S: Stream<Item = Result<watcher::Event<DynamicObject>, watcher::Error>>,
    F: Future<Output = ()>,
{
    let mut classifier = EventClassifier::default();
    let mut dispatcher = Dispatcher::new(handler);
    tokio::pin!(stream);
    tokio::pin!(shutdown_signal);

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("shutdown requested; stopping watch");
                break;
            }
            next = stream.next() => match next {
                Some(Ok(event)) => {
                    for lifecycle in classifier.observe(event) {
                        debug!(
                            resource = %describe(lifecycle.resource()),
                            kind = lifecycle.kind(),
                            "dispatching lifecycle event"
                        );
                        dispatcher.dispatch(lifecycle);
                    }
                }
                Some(Err(e)) => warn!(error = %e, "watch error; retrying"),
                None => {
                    warn!("watch stream ended");
                    break;
                }
            }
        }
    }

    dispatcher.shutdown(grace, &interrupt).await;
}
