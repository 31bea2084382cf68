//! FeatureTracker CRD: the persisted health record of one feature
//!
//! Trackers are keyed by the feature name in the feature's target namespace.
//! They carry the provenance of the feature (which top-level object caused it)
//! and the conditions of its last apply.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;

/// Spec for a FeatureTracker
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "features.plinth.dev",
    version = "v1",
    kind = "FeatureTracker",
    plural = "featuretrackers",
    shortname = "ft",
    namespaced,
    status = "FeatureTrackerStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Source","type":"string","jsonPath":".spec.source.name"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FeatureTrackerSpec {
    /// Object that caused the feature to exist
    #[serde(default)]
    pub source: Source,

    /// Namespace the feature acts on
    #[serde(default)]
    pub app_namespace: String,
}

/// Provenance of a feature
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct Source {
    /// Kind of the originating object
    #[serde(rename = "type", default)]
    pub type_: SourceType,

    /// Name of the originating object
    #[serde(default)]
    pub name: String,
}

impl Source {
    /// Create a source tag
    pub fn new(type_: SourceType, name: impl Into<String>) -> Self {
        Self {
            type_,
            name: name.into(),
        }
    }
}

/// Kind of object a feature originates from
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum SourceType {
    /// A PlatformInitialization object
    PlatformInitialization,
    /// A component object
    Component,
    /// Not declared
    #[default]
    Unknown,
}

/// Status of a FeatureTracker
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeatureTrackerStatus {
    /// Current phase
    #[serde(default)]
    pub phase: FeaturePhase,
    /// Feature conditions (`Available`, `Degraded`)
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Phase of a feature
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum FeaturePhase {
    /// Apply in progress
    #[default]
    Progressing,
    /// Every check passed
    Ready,
    /// A stage failed
    Error,
}

impl std::fmt::Display for FeaturePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Progressing => write!(f, "Progressing"),
            Self::Ready => write!(f, "Ready"),
            Self::Error => write!(f, "Error"),
        }
    }
}
