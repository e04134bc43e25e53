//! Controller counters
//!
//! Counters are injected into the controller rather than living in globals.
//! Each counter is exported as an OpenTelemetry instrument and mirrored by a
//! lock-free tally so tests and logs can read current values.
//!
//! Instruments:
//! - `playbook_events_total`: lifecycle events observed
//! - `playbook_created_total` / `playbook_updated_total` / `playbook_deleted_total`:
//!   successful workflows per event kind
//! - `playbook_managed`: resources currently managed (up on create, down on delete)
//! - `playbook_{create,update,delete}_failures_total`: failed workflows per event kind

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use opentelemetry::global;
use opentelemetry::metrics::{Counter, Meter, UpDownCounter};
use opentelemetry::KeyValue;

/// Name of the meter the instruments are registered under
pub const METER_NAME: &str = "playbook-operator";

/// Point-in-time copy of the controller counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Lifecycle events observed
    pub events: u64,
    /// Successful provision workflows
    pub created: u64,
    /// Successful update workflows
    pub updated: u64,
    /// Successful deprovision workflows
    pub deleted: u64,
    /// Resources currently managed
    pub managed: i64,
    /// Failed provision attempts
    pub create_failures: u64,
    /// Failed update attempts
    pub update_failures: u64,
    /// Failed deprovision attempts
    pub delete_failures: u64,
}

#[derive(Default)]
struct Tallies {
    events: AtomicU64,
    created: AtomicU64,
    updated: AtomicU64,
    deleted: AtomicU64,
    managed: AtomicI64,
    create_failures: AtomicU64,
    update_failures: AtomicU64,
    delete_failures: AtomicU64,
}

/// Counter handles passed to the controller
pub struct ControllerMetrics {
    events: Counter<u64>,
    created: Counter<u64>,
    updated: Counter<u64>,
    deleted: Counter<u64>,
    managed: UpDownCounter<i64>,
    create_failures: Counter<u64>,
    update_failures: Counter<u64>,
    delete_failures: Counter<u64>,
    attributes: Vec<KeyValue>,
    tallies: Tallies,
}

impl ControllerMetrics {
    /// Build the counter set on `meter`, tagging every data point with `kind`
    pub fn new(meter: &Meter, kind: &str) -> Self {
        let counter = |name: &'static str, description: &'static str| {
            meter
                .u64_counter(name)
                .with_description(description)
                .with_unit("{events}")
                .build()
        };

        Self {
            events: counter("playbook_events_total", "Lifecycle events observed"),
            created: counter(
                "playbook_created_total",
                "Resources successfully provisioned",
            ),
            updated: counter("playbook_updated_total", "Resources successfully updated"),
            deleted: counter(
                "playbook_deleted_total",
                "Resources successfully deprovisioned",
            ),
            managed: meter
                .i64_up_down_counter("playbook_managed")
                .with_description("Resources currently managed")
                .with_unit("{resources}")
                .build(),
            create_failures: counter(
                "playbook_create_failures_total",
                "Failed provision attempts",
            ),
            update_failures: counter("playbook_update_failures_total", "Failed update attempts"),
            delete_failures: counter(
                "playbook_delete_failures_total",
                "Failed deprovision attempts",
            ),
            attributes: vec![KeyValue::new("kind", kind.to_string())],
            tallies: Tallies::default(),
        }
    }

    /// Build the counter set on the globally installed meter provider
    pub fn global(kind: &str) -> Self {
        Self::new(&global::meter(METER_NAME), kind)
    }

    /// A lifecycle event arrived
    pub fn record_event(&self) {
        self.events.add(1, &self.attributes);
        self.tallies.events.fetch_add(1, Ordering::Relaxed);
    }

    /// A provision workflow succeeded; the resource is now managed
    pub fn record_created(&self) {
        self.created.add(1, &self.attributes);
        self.tallies.created.fetch_add(1, Ordering::Relaxed);
        self.managed.add(1, &self.attributes);
        self.tallies.managed.fetch_add(1, Ordering::Relaxed);
    }

    /// An update workflow succeeded
    pub fn record_updated(&self) {
        self.updated.add(1, &self.attributes);
        self.tallies.updated.fetch_add(1, Ordering::Relaxed);
    }

    /// A deprovision workflow succeeded; the resource is no longer managed
    pub fn record_deleted(&self) {
        self.deleted.add(1, &self.attributes);
        self.tallies.deleted.fetch_add(1, Ordering::Relaxed);
        self.managed.add(-1, &self.attributes);
        self.tallies.managed.fetch_sub(1, Ordering::Relaxed);
    }

    /// A provision attempt failed
    pub fn record_create_failure(&self) {
        self.create_failures.add(1, &self.attributes);
        self.tallies.create_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// An update attempt failed
    pub fn record_update_failure(&self) {
        self.update_failures.add(1, &self.attributes);
        self.tallies.update_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// A deprovision attempt failed
    pub fn record_delete_failure(&self) {
        self.delete_failures.add(1, &self.attributes);
        self.tallies.delete_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Read the current counter values
    pub fn snapshot(&self) -> MetricsSnapshot {
        let t = &self.tallies;
        MetricsSnapshot {
            events: t.events.load(Ordering::Relaxed),
            created: t.created.load(Ordering::Relaxed),
            updated: t.updated.load(Ordering::Relaxed),
            deleted: t.deleted.load(Ordering::Relaxed),
            managed: t.managed.load(Ordering::Relaxed),
            create_failures: t.create_failures.load(Ordering::Relaxed),
            update_failures: t.update_failures.load(Ordering::Relaxed),
            delete_failures: t.delete_failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::global("unknown")
    }
}
