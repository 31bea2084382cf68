//! FeatureTracker reconciliation
//!
//! One tracker per feature, named after the feature, in the feature's target
//! namespace. Only the feature that owns a tracker ever writes it.

use kube::api::ObjectMeta;
use plinth_common::crd::{
    set_condition, Condition, ConditionReason, ConditionStatus, FeaturePhase, FeatureTracker,
    FeatureTrackerSpec, FeatureTrackerStatus, CONDITION_AVAILABLE, CONDITION_DEGRADED,
};
use plinth_common::store::{api_resource, apply_typed, get_typed, patch_status_typed};
use plinth_common::{ApplyStage, ObjectKey, ObjectStore, Result};
use tracing::debug;

use crate::feature::Feature;

/// Key of the tracker belonging to `feature`
pub fn tracker_key(feature: &Feature) -> ObjectKey {
    ObjectKey::namespaced(feature.target_namespace(), feature.name())
}

fn desired(feature: &Feature) -> FeatureTracker {
    FeatureTracker {
        metadata: ObjectMeta {
            name: Some(feature.name().to_string()),
            namespace: Some(feature.target_namespace().to_string()),
            owner_references: feature.owner_reference().map(|r| vec![r.clone()]),
            ..Default::default()
        },
        spec: FeatureTrackerSpec {
            source: feature.source().clone(),
            app_namespace: feature.app_namespace().to_string(),
        },
        status: None,
    }
}

/// Make sure the tracker exists, creating it in phase `Progressing`
///
/// An existing tracker keeps its status so a re-apply of an unchanged feature
/// leaves it untouched.
pub(crate) async fn ensure(feature: &Feature) -> Result<FeatureTracker> {
    let store = feature.store().as_ref();
    let key = tracker_key(feature);
    let existed = get_typed::<FeatureTracker>(store, &key).await?.is_some();

    let mut tracker = apply_typed(store, &desired(feature)).await?;
    if !existed {
        debug!(feature = %feature.name(), tracker = %key, "created feature tracker");
        let status = FeatureTrackerStatus {
            phase: FeaturePhase::Progressing,
            conditions: Vec::new(),
        };
        patch_status_typed::<FeatureTracker, _>(store, &key, &status).await?;
        tracker.status = Some(status);
    }
    Ok(tracker)
}

async fn write_status(
    feature: &Feature,
    phase: FeaturePhase,
    available: Condition,
    degraded: Condition,
) -> Result<()> {
    let store = feature.store().as_ref();
    let key = tracker_key(feature);
    let mut status = get_typed::<FeatureTracker>(store, &key)
        .await?
        .and_then(|t| t.status)
        .unwrap_or_default();

    status.phase = phase;
    set_condition(&mut status.conditions, available);
    set_condition(&mut status.conditions, degraded);
    patch_status_typed::<FeatureTracker, _>(store, &key, &status).await
}

/// Record a fully successful apply
pub(crate) async fn record_success(feature: &Feature) -> Result<()> {
    write_status(
        feature,
        FeaturePhase::Ready,
        Condition::new(
            CONDITION_AVAILABLE,
            ConditionStatus::True,
            ConditionReason::FeatureCreated,
            "",
        ),
        Condition::new(
            CONDITION_DEGRADED,
            ConditionStatus::False,
            ConditionReason::FeatureCreated,
            "",
        ),
    )
    .await
}

/// Record a failure at `stage`
pub(crate) async fn record_failure(feature: &Feature, stage: ApplyStage, message: &str) -> Result<()> {
    let reason = ConditionReason::from(stage);
    write_status(
        feature,
        FeaturePhase::Error,
        Condition::new(CONDITION_AVAILABLE, ConditionStatus::False, reason, message),
        Condition::new(CONDITION_DEGRADED, ConditionStatus::True, reason, message),
    )
    .await
}

/// Remove the tracker; a missing tracker is not an error
pub(crate) async fn remove(feature: &Feature) -> Result<()> {
    let key = tracker_key(feature);
    let removed = feature
        .store()
        .delete(&api_resource::<FeatureTracker>(), &key)
        .await?;
    debug!(feature = %feature.name(), tracker = %key, removed, "removed feature tracker");
    Ok(())
}
