//! Config maps publishing mesh and authorization settings
//!
//! Other components read these instead of depending on plinth's data types.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ObjectMeta;
use plinth_common::store::apply_typed;
use plinth_common::{ObjectKey, ObjectStore, Result};
use plinth_feature::Feature;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::conditions::smcp_resource;
use crate::data::{auth_provider_name, AUTHORIZATION, CONTROL_PLANE};

/// Config map holding the control plane reference
pub const MESH_REFS_CONFIGMAP: &str = "service-mesh-refs";

/// Config map holding the authorization reference
pub const AUTH_REFS_CONFIGMAP: &str = "auth-refs";

/// Write `service-mesh-refs` into the feature's target namespace
pub async fn mesh_refs(feature: &Feature) -> Result<()> {
    let control_plane = CONTROL_PLANE.extract(feature)?;
    let data = BTreeMap::from([
        ("CONTROL_PLANE_NAME".to_string(), control_plane.name),
        ("MESH_NAMESPACE".to_string(), control_plane.namespace),
    ]);
    write_configmap(feature, MESH_REFS_CONFIGMAP, data).await
}

/// Write `auth-refs` into the feature's target namespace
pub async fn auth_refs(feature: &Feature) -> Result<()> {
    let auth = AUTHORIZATION.extract(feature)?;
    let data = BTreeMap::from([
        ("AUTH_AUDIENCE".to_string(), auth.audiences.join(",")),
        ("AUTH_PROVIDER".to_string(), auth.provider_name),
        ("AUTHORINO_LABEL".to_string(), auth.config_selector),
    ]);
    write_configmap(feature, AUTH_REFS_CONFIGMAP, data).await
}

async fn write_configmap(feature: &Feature, name: &str, data: BTreeMap<String, String>) -> Result<()> {
    let configmap = ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(feature.target_namespace().to_string()),
            owner_references: feature.owner_reference().map(|o| vec![o.clone()]),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    };
    apply_typed(feature.store().as_ref(), &configmap).await?;
    debug!(configmap = name, namespace = %feature.target_namespace(), "published references");
    Ok(())
}

/// Drop the authorization provider from the control plane's extension providers
///
/// A missing control plane, or one that never had the provider, is left alone.
pub async fn remove_extension_provider(feature: &Feature) -> Result<()> {
    let control_plane = CONTROL_PLANE.extract(feature)?;
    let provider = auth_provider_name(feature.app_namespace());
    let ar = smcp_resource();
    let key = ObjectKey::namespaced(&control_plane.namespace, &control_plane.name);

    let Some(smcp) = feature.store().get(&ar, &key).await? else {
        info!(control_plane = %key, "control plane not found, nothing to clean up");
        return Ok(());
    };

    let providers = smcp
        .data
        .pointer("/spec/techPreview/meshConfig/extensionProviders")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let remaining: Vec<Value> = providers
        .iter()
        .filter(|p| p.get("name").and_then(Value::as_str) != Some(provider.as_str()))
        .cloned()
        .collect();
    if remaining.len() == providers.len() {
        return Ok(());
    }

    let patch = json!({
        "spec": { "techPreview": { "meshConfig": { "extensionProviders": remaining } } }
    });
    feature.store().patch(&ar, &key, &patch).await?;
    info!(control_plane = %key, provider = %provider, "removed extension provider");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MeshData;
    use plinth_common::crd::{
        AuthSpec, ManagementState, PlatformInitializationSpec, ServiceMeshSpec,
    };
    use plinth_common::store::{get_typed, MemoryStore};
    use plinth_feature::FeatureBuilder;
    use std::sync::Arc;

    fn feature(store: Arc<MemoryStore>, with_auth: bool) -> Feature {
        let spec = PlatformInitializationSpec {
            applications_namespace: "opendatahub".to_string(),
            service_mesh: Some(ServiceMeshSpec {
                management_state: ManagementState::Managed,
                auth: AuthSpec {
                    namespace: None,
                    audiences: Some(vec!["aud-1".to_string(), "aud-2".to_string()]),
                },
                ..Default::default()
            }),
        };
        let data = MeshData::from_spec(&spec).unwrap();
        let builder = FeatureBuilder::define("mesh-shared-configmap")
            .using_store(store)
            .target_namespace("opendatahub")
            .with_data(data.control_plane);
        let builder = if with_auth {
            builder.with_data(data.authorization)
        } else {
            builder
        };
        builder.create().unwrap()
    }

    async fn configmap_data(store: &MemoryStore, name: &str) -> BTreeMap<String, String> {
        get_typed::<ConfigMap>(store, &ObjectKey::namespaced("opendatahub", name))
            .await
            .unwrap()
            .unwrap()
            .data
            .unwrap()
    }

    #[tokio::test]
    async fn mesh_refs_publishes_control_plane() {
        let store = Arc::new(MemoryStore::new());
        mesh_refs(&feature(store.clone(), true)).await.unwrap();

        let data = configmap_data(&store, MESH_REFS_CONFIGMAP).await;
        assert_eq!(data["CONTROL_PLANE_NAME"], "data-science-smcp");
        assert_eq!(data["MESH_NAMESPACE"], "istio-system");
    }

    #[tokio::test]
    async fn auth_refs_joins_audiences() {
        let store = Arc::new(MemoryStore::new());
        auth_refs(&feature(store.clone(), true)).await.unwrap();

        let data = configmap_data(&store, AUTH_REFS_CONFIGMAP).await;
        assert_eq!(data["AUTH_AUDIENCE"], "aud-1,aud-2");
        assert_eq!(data["AUTH_PROVIDER"], "opendatahub-auth-provider");
        assert_eq!(
            data["AUTHORINO_LABEL"],
            "security.plinth.dev/authorization-group=default"
        );
    }

    #[tokio::test]
    async fn extension_provider_removal_keeps_other_providers() {
        let store = Arc::new(MemoryStore::new());
        let smcp: kube::api::DynamicObject = serde_json::from_value(json!({
            "apiVersion": "maistra.io/v2",
            "kind": "ServiceMeshControlPlane",
            "metadata": {"name": "data-science-smcp", "namespace": "istio-system"},
            "spec": {"techPreview": {"meshConfig": {"extensionProviders": [
                {"name": "opendatahub-auth-provider"},
                {"name": "other-provider"}
            ]}}}
        }))
        .unwrap();
        store.apply(&smcp_resource(), &smcp).await.unwrap();
        let f = FeatureBuilder::define("mesh-control-plane-external-authz")
            .using_store(store.clone())
            .target_namespace("opendatahub")
            .with_data(
                MeshData::from_spec(&PlatformInitializationSpec {
                    applications_namespace: "opendatahub".to_string(),
                    service_mesh: Some(ServiceMeshSpec::default()),
                })
                .unwrap()
                .control_plane,
            )
            .create()
            .unwrap();

        remove_extension_provider(&f).await.unwrap();

        let key = ObjectKey::namespaced("istio-system", "data-science-smcp");
        let smcp = store.get(&smcp_resource(), &key).await.unwrap().unwrap();
        assert_eq!(
            smcp.data["spec"]["techPreview"]["meshConfig"]["extensionProviders"],
            json!([{"name": "other-provider"}])
        );
    }

    #[tokio::test]
    async fn extension_provider_removal_without_control_plane_is_ok() {
        let store = Arc::new(MemoryStore::new());
        remove_extension_provider(&feature(store.clone(), true)).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn auth_refs_without_wiring_is_data_not_found() {
        let store = Arc::new(MemoryStore::new());
        let err = auth_refs(&feature(store.clone(), false)).await.unwrap_err();
        assert!(err.is_data_not_found());
        assert!(store.is_empty());
    }
}
