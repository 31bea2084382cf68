//! End-to-end behaviour of features, handlers and trackers against the
//! in-memory object store.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use kube::api::DynamicObject;
use kube::ResourceExt;
use plinth_common::crd::{
    find_condition, ConditionStatus, FeaturePhase, FeatureTracker, PlatformInitialization,
    PlatformInitializationSpec, CONDITION_AVAILABLE, CONDITION_DEGRADED,
};
use plinth_common::kube_utils::build_api_resource;
use plinth_common::store::{api_resource, apply_typed, get_typed, MemoryStore};
use plinth_common::{Error, ObjectKey, ObjectStore, Stage};
use plinth_feature::{
    ClusterFeaturesHandler, FeatureBuilder, FeatureOwner, FeaturesHandler, FeaturesRegistry,
    ManifestSource,
};
use tokio_util::sync::CancellationToken;

const APP_NS: &str = "opendatahub";

async fn stored_owner(store: &MemoryStore) -> PlatformInitialization {
    let owner = PlatformInitialization::new(
        "default",
        PlatformInitializationSpec {
            applications_namespace: APP_NS.to_string(),
            ..Default::default()
        },
    );
    apply_typed(store, &owner).await.unwrap()
}

async fn tracker(store: &MemoryStore, name: &str) -> Option<FeatureTracker> {
    get_typed::<FeatureTracker>(store, &ObjectKey::namespaced(APP_NS, name))
        .await
        .unwrap()
}

async fn configmap(store: &MemoryStore, name: &str) -> Option<DynamicObject> {
    store
        .get(
            &build_api_resource("v1", "ConfigMap"),
            &ObjectKey::namespaced(APP_NS, name),
        )
        .await
        .unwrap()
}

fn write_configmap_template(dir: &Path) {
    std::fs::write(
        dir.join("configmap.tmpl.yaml"),
        "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {{ feature_name }}-settings\n  namespace: {{ target_namespace }}\ndata:\n  appNamespace: {{ app_namespace }}\n",
    )
    .unwrap();
}

/// Story: a failing precondition stops the pass before the next feature runs
#[tokio::test]
async fn story_failing_precondition_halts_later_features() {
    let store = Arc::new(MemoryStore::new());
    let owner = stored_owner(&store).await;
    let produced = Arc::new(AtomicUsize::new(0));
    let counter = produced.clone();

    let handler: FeaturesHandler =
        ClusterFeaturesHandler::new("fail-fast", owner.feature_defaults(store.clone()).unwrap())
            .with_provider(move |registry: &mut FeaturesRegistry| {
                let counter = counter.clone();
                registry.add([
                    FeatureBuilder::define("gate").pre_condition(|_f, _c| async {
                        Err(Error::NotFound {
                            kind: "Subscription".to_string(),
                            name: "servicemeshoperator".to_string(),
                        })
                    }),
                    FeatureBuilder::define("after-gate").with_resource(move |_f, _c| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        async { Ok(()) }
                    }),
                ])
            })
            .into();

    let err = handler.apply(&CancellationToken::new()).await.unwrap_err();

    assert_eq!(err.feature(), Some("gate"));
    assert_eq!(err.stage(), Some(Stage::PreConditions));
    assert_eq!(produced.load(Ordering::SeqCst), 0);
    assert!(tracker(&store, "after-gate").await.is_none());
}

#[tokio::test]
async fn precondition_failure_is_recorded_on_tracker() {
    let store = Arc::new(MemoryStore::new());
    let feature = FeatureBuilder::define("gated")
        .using_store(store.clone())
        .target_namespace(APP_NS)
        .pre_condition(|_f, _c| async { Err(Error::internal("operator missing")) })
        .create()
        .unwrap();

    assert!(feature.apply(&CancellationToken::new()).await.is_err());

    let status = tracker(&store, "gated").await.unwrap().status.unwrap();
    assert_eq!(status.phase, FeaturePhase::Error);
    let degraded = find_condition(&status.conditions, CONDITION_DEGRADED).unwrap();
    assert_eq!(degraded.status, ConditionStatus::True);
    assert_eq!(degraded.reason, "PreConditions");
    assert!(degraded.message.contains("operator missing"));
    let available = find_condition(&status.conditions, CONDITION_AVAILABLE).unwrap();
    assert_eq!(available.status, ConditionStatus::False);
}

/// Story: a failed postcondition is reported but nothing is rolled back
#[tokio::test]
async fn story_postcondition_failure_keeps_resources() {
    let store = Arc::new(MemoryStore::new());
    let manifests = tempfile::tempdir().unwrap();
    write_configmap_template(manifests.path());

    let feature = FeatureBuilder::define("verified")
        .using_store(store.clone())
        .target_namespace(APP_NS)
        .app_namespace(APP_NS)
        .manifests(ManifestSource::new(manifests.path()))
        .post_condition(|_f, _c| async { Err(Error::timeout("control plane", std::time::Duration::from_secs(300))) })
        .create()
        .unwrap();

    let err = feature.apply(&CancellationToken::new()).await.unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(err.stage(), Some(Stage::PostConditions));

    let status = tracker(&store, "verified").await.unwrap().status.unwrap();
    assert_eq!(status.phase, FeaturePhase::Error);
    assert_eq!(
        find_condition(&status.conditions, CONDITION_DEGRADED).unwrap().reason,
        "PostConditions"
    );
    let cm = configmap(&store, "verified-settings").await.unwrap();
    assert_eq!(cm.data["data"]["appNamespace"], APP_NS);
}

/// Story: re-applying an unchanged feature changes nothing in the cluster
#[tokio::test]
async fn story_reapply_is_idempotent() {
    let store = Arc::new(MemoryStore::new());
    let manifests = tempfile::tempdir().unwrap();
    write_configmap_template(manifests.path());

    let feature = FeatureBuilder::define("steady")
        .using_store(store.clone())
        .target_namespace(APP_NS)
        .manifests(ManifestSource::new(manifests.path()))
        .create()
        .unwrap();
    let cancel = CancellationToken::new();

    feature.apply(&cancel).await.unwrap();
    let cm_before = configmap(&store, "steady-settings").await.unwrap();
    let tracker_before = tracker(&store, "steady").await.unwrap();

    feature.apply(&cancel).await.unwrap();
    let cm_after = configmap(&store, "steady-settings").await.unwrap();
    let tracker_after = tracker(&store, "steady").await.unwrap();

    assert_eq!(cm_before.resource_version(), cm_after.resource_version());
    assert_eq!(tracker_before.status, tracker_after.status);
    assert_eq!(tracker_after.status.unwrap().phase, FeaturePhase::Ready);
}

#[tokio::test]
async fn tracker_owner_references_follow_feature_owner() {
    let store = Arc::new(MemoryStore::new());
    let owner = stored_owner(&store).await;
    let cancel = CancellationToken::new();

    FeatureBuilder::define("owned")
        .using_store(store.clone())
        .target_namespace(APP_NS)
        .owned_by(&owner)
        .create()
        .unwrap()
        .apply(&cancel)
        .await
        .unwrap();
    FeatureBuilder::define("orphan")
        .using_store(store.clone())
        .target_namespace(APP_NS)
        .create()
        .unwrap()
        .apply(&cancel)
        .await
        .unwrap();

    let owned = tracker(&store, "owned").await.unwrap();
    assert_eq!(owned.owner_references().len(), 1);
    assert_eq!(owned.owner_references()[0].uid, owner.uid().unwrap());
    assert!(tracker(&store, "orphan").await.unwrap().owner_references().is_empty());
}

#[tokio::test]
async fn disabled_feature_leaves_no_trace() {
    let store = Arc::new(MemoryStore::new());
    let manifests = tempfile::tempdir().unwrap();
    write_configmap_template(manifests.path());

    FeatureBuilder::define("dormant")
        .using_store(store.clone())
        .target_namespace(APP_NS)
        .manifests(ManifestSource::new(manifests.path()))
        .enabled_when(|_f, _c| async { Ok(false) })
        .create()
        .unwrap()
        .apply(&CancellationToken::new())
        .await
        .unwrap();

    assert!(store.is_empty());
}

#[tokio::test]
async fn deleting_never_applied_capability_succeeds() {
    let store = Arc::new(MemoryStore::new());
    let owner = stored_owner(&store).await;
    let handler: FeaturesHandler =
        ClusterFeaturesHandler::new("dormant", owner.feature_defaults(store.clone()).unwrap())
            .with_provider(|registry: &mut FeaturesRegistry| {
                registry.add([FeatureBuilder::define("never").enabled_when(|_f, _c| async { Ok(false) })])
            })
            .into();

    let cancel = CancellationToken::new();
    handler.apply(&cancel).await.unwrap();
    handler.delete(&cancel).await.unwrap();
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn duplicate_names_fail_registration() {
    let store = Arc::new(MemoryStore::new());
    let owner = stored_owner(&store).await;
    let handler: FeaturesHandler =
        ClusterFeaturesHandler::new("dupes", owner.feature_defaults(store.clone()).unwrap())
            .with_provider(|registry: &mut FeaturesRegistry| {
                registry.add([
                    FeatureBuilder::define("mesh-shared-configmap"),
                    FeatureBuilder::define("mesh-shared-configmap"),
                ])
            })
            .into();

    let err = handler.apply(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, Error::Registration { .. }));
    assert!(err.to_string().contains("mesh-shared-configmap"));
    assert!(!err.is_retryable());
    assert!(store.objects_of_kind("FeatureTracker").is_empty());
}

/// Story: deleting the owner garbage-collects trackers and applied resources
#[tokio::test]
async fn story_owner_deletion_cascades() {
    let store = Arc::new(MemoryStore::new());
    let owner = stored_owner(&store).await;
    let manifests = tempfile::tempdir().unwrap();
    write_configmap_template(manifests.path());

    let handler: FeaturesHandler =
        ClusterFeaturesHandler::new("cascade", owner.feature_defaults(store.clone()).unwrap())
            .with_provider(move |registry: &mut FeaturesRegistry| {
                registry.add([FeatureBuilder::define("tagged")
                    .manifests(ManifestSource::new(manifests.path()))])
            })
            .into();
    handler.apply(&CancellationToken::new()).await.unwrap();

    let cm = configmap(&store, "tagged-settings").await.unwrap();
    assert_eq!(cm.owner_references()[0].uid, owner.uid().unwrap());

    store
        .delete(&api_resource::<PlatformInitialization>(), &ObjectKey::cluster("default"))
        .await
        .unwrap();

    assert!(tracker(&store, "tagged").await.is_none());
    assert!(configmap(&store, "tagged-settings").await.is_none());
    assert!(store.is_empty());
}
