//! Condition model shared by every plinth status

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type set on a FeatureTracker when the feature is fully applied
pub const CONDITION_AVAILABLE: &str = "Available";

/// Condition type set on a FeatureTracker when a stage failed
pub const CONDITION_DEGRADED: &str = "Degraded";

/// Machine-readable reasons carried by plinth conditions
///
/// Feature-level reasons name the stage a feature reached or failed at.
/// Capability-level reasons describe the state of a whole capability on the
/// owner object.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum ConditionReason {
    /// Feature applied with every check passing
    FeatureCreated,
    /// A precondition failed
    PreConditions,
    /// Applying rendered manifests failed
    ApplyManifests,
    /// A resource producer failed
    ResourceCreation,
    /// A postcondition failed
    PostConditions,
    /// Capability is configured
    Configured,
    /// Capability was removed
    Removed,
    /// Capability is inert because a required operator is absent
    MissingOperator,
}

impl ConditionReason {
    /// Reason string as written to the API
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FeatureCreated => "FeatureCreated",
            Self::PreConditions => "PreConditions",
            Self::ApplyManifests => "ApplyManifests",
            Self::ResourceCreation => "ResourceCreation",
            Self::PostConditions => "PostConditions",
            Self::Configured => "Configured",
            Self::Removed => "Removed",
            Self::MissingOperator => "MissingOperator",
        }
    }
}

impl std::fmt::Display for ConditionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<crate::error::ApplyStage> for ConditionReason {
    fn from(stage: crate::error::ApplyStage) -> Self {
        use crate::error::ApplyStage;
        match stage {
            ApplyStage::PreConditions => Self::PreConditions,
            ApplyStage::ApplyManifests => Self::ApplyManifests,
            ApplyStage::ResourceCreation => Self::ResourceCreation,
            ApplyStage::PostConditions => Self::PostConditions,
        }
    }
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Available, CapabilityServiceMesh)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: ConditionReason,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.as_str().to_string(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// True when status is True
    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Insert or replace a condition by type, keeping list order stable
///
/// When the status did not change, the stored `lastTransitionTime` is kept so
/// repeated reconciliation of an unchanged state writes an identical condition.
/// Returns true when anything about the condition changed.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            let changed = *existing != condition;
            *existing = condition;
            changed
        }
        None => {
            conditions.push(condition);
            true
        }
    }
}

/// Remove a condition by type, returning whether one was present
pub fn remove_condition(conditions: &mut Vec<Condition>, type_: &str) -> bool {
    let before = conditions.len();
    conditions.retain(|c| c.type_ != type_);
    conditions.len() != before
}
