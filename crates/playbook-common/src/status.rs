//! Reconciliation status sub-document
//!
//! The operator owns the `status` key of every custom resource it manages.
//! Internally the status is a typed record; it is converted to and from the
//! resource's generic attribute map only at the boundary.
//!
//! Timestamp rules:
//! - `lastUpdateTime` advances on every write
//! - `lastTransitionTime` moves iff `phase` changes, and never goes backwards

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use kube::api::DynamicObject;
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

/// Key under which the status sub-document lives
pub const STATUS_KEY: &str = "status";

// =============================================================================
// Phase
// =============================================================================

/// Coarse convergence state of a resource
#[derive(Clone, Copy, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum ResourcePhase {
    /// Never reconciled
    #[default]
    #[serde(rename = "")]
    None,
    /// A workflow is running for this resource
    Applying,
    /// The last workflow succeeded
    Applied,
    /// The last workflow (or its preparation) failed
    Failed,
}

impl ResourcePhase {
    /// Wire representation of the phase
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "",
            Self::Applying => "Applying",
            Self::Applied => "Applied",
            Self::Failed => "Failed",
        }
    }

    /// Whether moving from `self` to `next` is allowed.
    ///
    /// Writing the same phase again is not a transition and is always allowed.
    pub fn can_transition_to(&self, next: ResourcePhase) -> bool {
        if *self == next {
            return true;
        }
        matches!(
            (self, next),
            (Self::None, Self::Applying)
                | (Self::Applying, Self::Applied)
                | (Self::Applying, Self::Failed)
                | (Self::Applied, Self::Applying)
                | (Self::Failed, Self::Applying)
        )
    }
}

impl fmt::Display for ResourcePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

// =============================================================================
// Reason
// =============================================================================

/// Machine-readable reason for the current phase
///
/// Unrecognised reason strings decode as [`ConditionReason::Unknown`].
#[derive(Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Hash)]
pub enum ConditionReason {
    /// Reason not known to this operator
    Unknown,
    /// Reconciliation triggered by resource creation
    CustomResourceAdded,
    /// Reconciliation triggered by a resource update
    CustomResourceUpdated,
    /// The workflow completed successfully
    ApplySuccessful,
    /// The workflow failed or could not be started
    ApplyFailed,
}

impl ConditionReason {
    /// Wire representation of the reason
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::CustomResourceAdded => "CustomResourceAdded",
            Self::CustomResourceUpdated => "CustomResourceUpdated",
            Self::ApplySuccessful => "ApplySuccessful",
            Self::ApplyFailed => "ApplyFailed",
        }
    }

    /// Parse a wire label, mapping anything unrecognised to `Unknown`
    pub fn from_label(label: &str) -> Self {
        match label {
            "CustomResourceAdded" => Self::CustomResourceAdded,
            "CustomResourceUpdated" => Self::CustomResourceUpdated,
            "ApplySuccessful" => Self::ApplySuccessful,
            "ApplyFailed" => Self::ApplyFailed,
            _ => Self::Unknown,
        }
    }
}

impl FromStr for ConditionReason {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_label(s))
    }
}

impl<'de> Deserialize<'de> for ConditionReason {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::from_label(&raw))
    }
}

impl fmt::Display for ConditionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Status
// =============================================================================

/// Status sub-document written to every managed resource
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationStatus {
    /// Current phase
    #[serde(default)]
    pub phase: ResourcePhase,

    /// Why the resource is in its current phase
    #[serde(default)]
    pub reason: Option<ConditionReason>,

    /// Free text, usually captured workflow output
    #[serde(default)]
    pub message: String,

    /// Time of the last status write
    #[serde(default)]
    pub last_update_time: Option<DateTime<Utc>>,

    /// Time of the last phase change
    #[serde(default)]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl ReconciliationStatus {
    /// Status reported when a pre-existing status sub-document cannot be decoded
    pub fn decode_failure(message: impl Into<String>) -> Self {
        Self {
            phase: ResourcePhase::Failed,
            reason: Some(ConditionReason::ApplyFailed),
            message: message.into(),
            ..Default::default()
        }
    }

    /// Return a copy moved to `phase`, stamped with the current time
    pub fn set_phase(
        &self,
        phase: ResourcePhase,
        reason: ConditionReason,
        message: impl Into<String>,
    ) -> Self {
        self.set_phase_at(phase, reason, message, Utc::now())
    }

    /// Return a copy moved to `phase`, stamped with `now`.
    ///
    /// If `now` is not after the previous `lastUpdateTime` the previous value
    /// plus one nanosecond is used instead, so update times strictly advance
    /// and transition times never regress.
    pub fn set_phase_at(
        &self,
        phase: ResourcePhase,
        reason: ConditionReason,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let stamp = match self.last_update_time {
            Some(previous) if now <= previous => previous + Duration::nanoseconds(1),
            _ => now,
        };

        let mut next = self.clone();
        next.last_update_time = Some(stamp);
        if self.phase != phase {
            next.phase = phase;
            next.last_transition_time = Some(stamp);
        }
        next.reason = Some(reason);
        next.message = message.into();
        next
    }

    /// Serialize to the generic attribute representation stored on the resource
    pub fn to_attribute_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("phase".into(), Value::from(self.phase.as_str()));
        if let Some(reason) = self.reason {
            map.insert("reason".into(), Value::from(reason.as_str()));
        }
        if !self.message.is_empty() {
            map.insert("message".into(), Value::from(self.message.clone()));
        }
        if let Some(time) = self.last_update_time {
            map.insert("lastUpdateTime".into(), Value::from(format_time(time)));
        }
        if let Some(time) = self.last_transition_time {
            map.insert("lastTransitionTime".into(), Value::from(format_time(time)));
        }
        map
    }

    /// Decode a raw status value; see [`status_for`]
    pub fn from_value(value: Option<&Value>) -> Self {
        match value {
            None | Some(Value::Null) => Self::default(),
            Some(value @ Value::Object(_)) => match Self::deserialize(value) {
                Ok(status) => status,
                Err(e) => Self::decode_failure(format!("invalid status: {e}")),
            },
            Some(other) => Self::decode_failure(format!(
                "invalid status: expected an object, found {}",
                json_type(other)
            )),
        }
    }

    /// Write this status into `resource`, replacing any previous status
    pub fn apply_to(&self, resource: &mut DynamicObject) {
        if !resource.data.is_object() {
            resource.data = Value::Object(Map::new());
        }
        if let Value::Object(data) = &mut resource.data {
            data.insert(STATUS_KEY.into(), Value::Object(self.to_attribute_map()));
        }
    }
}

/// Extract the typed status from a resource.
///
/// An absent (or null) status yields the zero value. A status that cannot be
/// decoded yields a `Failed`/`ApplyFailed` status describing the problem; this
/// never returns an error.
pub fn status_for(resource: &DynamicObject) -> ReconciliationStatus {
    ReconciliationStatus::from_value(resource.data.get(STATUS_KEY))
}

/// Largest status message kept on a resource; longer workflow output is cut
/// from the front
pub const MAX_MESSAGE_BYTES: usize = 32 * 1024;

/// Keep at most `max_bytes` from the end of `text`, on a char boundary
pub fn truncate_tail(text: String, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text;
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
