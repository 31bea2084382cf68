//! Custom Resource Definitions for plinth

mod feature_tracker;
mod platform;
mod types;

pub use feature_tracker::{
    FeaturePhase, FeatureTracker, FeatureTrackerSpec, FeatureTrackerStatus, Source, SourceType,
};
pub use platform::{
    AuthSpec, ControlPlaneSpec, ManagementState, MetricsCollection, PlatformInitialization,
    PlatformInitializationSpec, PlatformInitializationStatus, ServiceMeshSpec,
};
pub use types::{
    find_condition, remove_condition, set_condition, Condition, ConditionReason, ConditionStatus,
    CONDITION_AVAILABLE, CONDITION_DEGRADED,
};
