//! Mesh-specific preconditions and postconditions

use std::collections::BTreeMap;

use kube::api::{ApiResource, DynamicObject};
use plinth_common::kube_utils::build_api_resource;
use plinth_common::{Error, ObjectKey, ObjectStore, Result};
use plinth_feature::conditions::{ensure_namespace, ensure_operator_is_installed};
use plinth_feature::{poll_until_ready, Feature};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::data::{AUTHORIZATION, CONTROL_PLANE};

/// Subscription name of the mesh operator
pub const SERVICE_MESH_OPERATOR: &str = "servicemeshoperator";

/// Subscription name of the authorization operator
pub const AUTHORINO_OPERATOR: &str = "authorino-operator";

/// API version of the mesh control plane
pub const SMCP_API_VERSION: &str = "maistra.io/v2";

/// Kind of the mesh control plane
pub const SMCP_KIND: &str = "ServiceMeshControlPlane";

/// ApiResource of the mesh control plane
pub fn smcp_resource() -> ApiResource {
    build_api_resource(SMCP_API_VERSION, SMCP_KIND)
}

/// Component readiness of a control plane object
///
/// Ready when nothing is pending or unready and at least one component is
/// ready. A control plane without readiness status is not ready yet.
pub fn control_plane_components_ready(smcp: &DynamicObject) -> bool {
    let Some(components) = smcp.data.pointer("/status/readiness/components") else {
        return false;
    };
    let count = |state: &str| {
        components
            .get(state)
            .and_then(Value::as_array)
            .map_or(0, Vec::len)
    };
    count("pending") == 0 && count("unready") == 0 && count("ready") > 0
}

/// Whether the named control plane reports all components ready
pub async fn check_control_plane_component_readiness(
    store: &dyn ObjectStore,
    name: &str,
    namespace: &str,
) -> Result<bool> {
    let smcp = store
        .get(&smcp_resource(), &ObjectKey::namespaced(namespace, name))
        .await?
        .ok_or_else(|| Error::NotFound {
            kind: SMCP_KIND.to_string(),
            name: format!("{namespace}/{name}"),
        })?;
    Ok(control_plane_components_ready(&smcp))
}

/// Fail unless the mesh operator subscription exists
pub async fn ensure_service_mesh_operator_installed(feature: &Feature) -> Result<()> {
    ensure_operator_is_installed(feature, SERVICE_MESH_OPERATOR)
        .await
        .map_err(|e| {
            Error::internal_with_context(
                "service mesh operator",
                format!("please ensure the Service Mesh operator is installed: {e}"),
            )
        })
}

/// Wait for the feature's control plane to report every component ready
pub async fn wait_for_control_plane_to_be_ready(
    feature: &Feature,
    cancel: &CancellationToken,
) -> Result<()> {
    let control_plane = CONTROL_PLANE.extract(feature)?;
    let config = feature.poll_config();
    info!(
        control_plane = %control_plane.name,
        namespace = %control_plane.namespace,
        timeout_secs = config.timeout.as_secs(),
        "waiting for control plane components to be ready"
    );

    let store = feature.store().clone();
    let what = format!(
        "control plane {}/{}",
        control_plane.namespace, control_plane.name
    );
    poll_until_ready(cancel, config, &what, || {
        let store = store.clone();
        let control_plane = control_plane.clone();
        async move {
            check_control_plane_component_readiness(
                store.as_ref(),
                &control_plane.name,
                &control_plane.namespace,
            )
            .await
        }
    })
    .await?;

    info!(control_plane = %control_plane.name, "control plane components ready");
    Ok(())
}

/// The mesh operator is installed and the control plane is ready
pub async fn ensure_service_mesh_installed(feature: &Feature, cancel: &CancellationToken) -> Result<()> {
    ensure_service_mesh_operator_installed(feature).await?;

    wait_for_control_plane_to_be_ready(feature, cancel)
        .await
        .inspect_err(|e| {
            error!(feature = %feature.name(), error = %e, "service mesh control plane is not ready");
        })
}

/// Create the authorization provider's namespace, owned by the feature's owner
pub async fn ensure_auth_namespace_exists(feature: &Feature) -> Result<()> {
    let auth = AUTHORIZATION.extract(feature)?;
    ensure_namespace(
        feature.store().as_ref(),
        &auth.namespace,
        feature.owner_reference(),
        BTreeMap::new(),
    )
    .await
    .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ControlPlane;
    use plinth_common::crd::MetricsCollection;
    use plinth_common::store::MemoryStore;
    use plinth_feature::{DataEntry, FeatureBuilder, PollConfig};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn smcp(readiness: Option<Value>) -> DynamicObject {
        let mut obj = json!({
            "apiVersion": SMCP_API_VERSION,
            "kind": SMCP_KIND,
            "metadata": {"name": "data-science-smcp", "namespace": "istio-system"},
        });
        if let Some(readiness) = readiness {
            obj["status"] = json!({ "readiness": { "components": readiness } });
        }
        serde_json::from_value(obj).unwrap()
    }

    fn feature(store: Arc<MemoryStore>) -> Feature {
        FeatureBuilder::define("mesh-metrics-collection")
            .using_store(store)
            .target_namespace("opendatahub")
            .with_data(DataEntry::value(
                &CONTROL_PLANE,
                ControlPlane {
                    name: "data-science-smcp".to_string(),
                    namespace: "istio-system".to_string(),
                    metrics_collection: MetricsCollection::Istio,
                },
            ))
            .poll_config(PollConfig {
                interval: Duration::from_secs(2),
                timeout: Duration::from_secs(10),
            })
            .create()
            .unwrap()
    }

    #[test]
    fn readiness_requires_ready_and_nothing_pending() {
        assert!(control_plane_components_ready(&smcp(Some(json!({
            "ready": ["istiod", "prometheus"], "pending": [], "unready": []
        })))));
        assert!(!control_plane_components_ready(&smcp(Some(json!({
            "ready": ["istiod"], "pending": ["prometheus"], "unready": []
        })))));
        assert!(!control_plane_components_ready(&smcp(Some(json!({
            "ready": ["istiod"], "pending": [], "unready": ["grafana"]
        })))));
    }

    #[test]
    fn zero_components_is_never_ready() {
        assert!(!control_plane_components_ready(&smcp(Some(json!({
            "ready": [], "pending": [], "unready": []
        })))));
        assert!(!control_plane_components_ready(&smcp(Some(json!({})))));
    }

    #[test]
    fn missing_status_is_not_ready() {
        assert!(!control_plane_components_ready(&smcp(None)));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_control_plane_fails_without_waiting_for_timeout() {
        let store = Arc::new(MemoryStore::new());
        let err = wait_for_control_plane_to_be_ready(&feature(store), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn ready_control_plane_passes() {
        let store = Arc::new(MemoryStore::new());
        let ar = smcp_resource();
        store.apply(&ar, &smcp(None)).await.unwrap();
        store
            .patch_status(
                &ar,
                &ObjectKey::namespaced("istio-system", "data-science-smcp"),
                &json!({"readiness": {"components": {"ready": ["istiod"], "pending": [], "unready": []}}}),
            )
            .await
            .unwrap();

        wait_for_control_plane_to_be_ready(&feature(store), &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unready_control_plane_times_out() {
        let store = Arc::new(MemoryStore::new());
        store.apply(&smcp_resource(), &smcp(None)).await.unwrap();

        let err = wait_for_control_plane_to_be_ready(&feature(store), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn service_mesh_requires_operator() {
        let store = Arc::new(MemoryStore::new());
        let err = ensure_service_mesh_installed(&feature(store), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Service Mesh operator"));
    }
}
