//! Reusable preconditions and postconditions
//!
//! These are plain async functions over a [`Feature`], so a feature wires them
//! in with a short closure:
//!
//! ```ignore
//! FeatureBuilder::define("mesh-control-plane-creation")
//!     .pre_condition(|f, _| async move { ensure_operator_is_installed(&f, "servicemeshoperator").await })
//!     .post_condition(|f, c| async move { wait_for_pods_to_be_ready(&f, &c, "istio-system").await })
//! ```

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Namespace, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use plinth_common::kube_utils::build_api_resource;
use plinth_common::store::{apply_typed, list_typed};
use plinth_common::{Error, ObjectStore, Result, MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::feature::Feature;
use crate::poll::poll_until_ready;

/// API version of OLM subscriptions
pub const SUBSCRIPTION_API_VERSION: &str = "operators.coreos.com/v1alpha1";

/// True when every pod has a `Ready=True` condition; no pods counts as ready
pub fn pods_ready(pods: &[Pod]) -> bool {
    pods.iter().all(|pod| {
        pod.status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .is_some_and(|conditions| {
                conditions
                    .iter()
                    .any(|c| c.type_ == "Ready" && c.status == "True")
            })
    })
}

/// Wait until every pod in `namespace` is ready, within the feature's poll bounds
pub async fn wait_for_pods_to_be_ready(
    feature: &Feature,
    cancel: &CancellationToken,
    namespace: &str,
) -> Result<()> {
    let store = feature.store().clone();
    let what = format!("pods in namespace {namespace}");
    poll_until_ready(cancel, feature.poll_config(), &what, || {
        let store = store.clone();
        async move {
            let pods = list_typed::<Pod>(store.as_ref(), Some(namespace)).await?;
            let ready = pods_ready(&pods);
            debug!(namespace, pods = pods.len(), ready, "checked pod readiness");
            Ok(ready)
        }
    })
    .await
}

/// Whether an OLM subscription named `name` exists in any namespace
///
/// A cluster without the subscription API has no subscriptions.
pub async fn subscription_exists(store: &dyn ObjectStore, name: &str) -> Result<bool> {
    let ar = build_api_resource(SUBSCRIPTION_API_VERSION, "Subscription");
    match store.list(&ar, None).await {
        Ok(subscriptions) => Ok(subscriptions.iter().any(|s| s.name_any() == name)),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

/// Fail unless the operator behind subscription `name` is installed
pub async fn ensure_operator_is_installed(feature: &Feature, name: &str) -> Result<()> {
    if subscription_exists(feature.store().as_ref(), name).await? {
        return Ok(());
    }
    Err(Error::NotFound {
        kind: "Subscription".to_string(),
        name: name.to_string(),
    })
}

/// Server-side apply a namespace, optionally owned and labelled
pub async fn ensure_namespace(
    store: &dyn ObjectStore,
    name: &str,
    owner: Option<&OwnerReference>,
    labels: BTreeMap<String, String>,
) -> Result<Namespace> {
    let mut labels = labels;
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
    let namespace = Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels),
            owner_references: owner.map(|o| vec![o.clone()]),
            ..Default::default()
        },
        ..Default::default()
    };
    let applied = apply_typed(store, &namespace).await?;
    info!(namespace = name, "ensured namespace");
    Ok(applied)
}

/// Idempotently create `name` for a feature
///
/// The namespace is not owned by the feature's owner: namespaces hold
/// workloads that outlive a single capability.
pub async fn create_namespace_if_not_exists(feature: &Feature, name: &str) -> Result<()> {
    ensure_namespace(feature.store().as_ref(), name, None, BTreeMap::new())
        .await
        .map(|_| ())
}
