//! Service mesh and authorization capabilities
//!
//! [`MeshReconciler::configure_service_mesh`] dispatches on the owner's mesh
//! management state:
//! - `Managed` applies the mesh capability, then the authorization capability
//! - `Unmanaged` leaves the cluster alone
//! - `Removed` deletes both, but only if the mesh was configured before
//!
//! The authorization capability becomes an empty handler reporting
//! `MissingOperator` when the authorization operator is not installed.
//!
//! A removal that failed part way leaves its condition `Unknown`, so the
//! next `Removed` pass deletes again.

use std::path::PathBuf;
use std::sync::Arc;

use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use plinth_common::crd::{
    find_condition, Condition, ConditionReason, ConditionStatus, ManagementState,
    MetricsCollection, PlatformInitialization,
};
use plinth_common::events::{actions, reasons, EventPublisher};
use plinth_common::{Error, ObjectStore, Result};
use plinth_feature::conditions::{
    create_namespace_if_not_exists, ensure_operator_is_installed, subscription_exists,
    wait_for_pods_to_be_ready,
};
use plinth_feature::{
    CapabilityReporter, ClusterFeaturesHandler, FeatureBuilder, FeatureDefaults, FeatureOwner,
    FeaturesHandler, FeaturesRegistry, FsManifestResolver, HandlerWithReporter, ManifestResolver, ManifestSource,
    PollConfig,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use crate::conditions::{
    ensure_auth_namespace_exists, ensure_service_mesh_installed,
    ensure_service_mesh_operator_installed, AUTHORINO_OPERATOR,
};
use crate::data::{ControlPlane, MeshData, AUTHORIZATION};
use crate::resources::{auth_refs, mesh_refs, remove_extension_provider};

/// Condition type of the mesh capability
pub const CAPABILITY_SERVICE_MESH: &str = "CapabilityServiceMesh";

/// Condition type of the authorization capability
pub const CAPABILITY_SERVICE_MESH_AUTHORIZATION: &str = "CapabilityServiceMeshAuthorization";

const SERVICE_MESH_DIR: &str = "servicemesh";
const METRICS_DIR: &str = "metrics-collection";
const AUTHORINO_DIR: &str = "authorino";

/// Settings of the mesh capabilities
#[derive(Clone, Debug)]
pub struct MeshSettings {
    /// Root of the mesh manifest tree
    pub manifests_dir: PathBuf,
    /// Readiness poll bounds
    pub poll: PollConfig,
}

impl Default for MeshSettings {
    fn default() -> Self {
        Self {
            manifests_dir: default_manifests_dir(),
            poll: PollConfig::default(),
        }
    }
}

/// Manifests shipped with this crate
pub fn default_manifests_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("manifests")
}

/// Capability condition for the mesh
pub fn service_mesh_condition(reason: ConditionReason, message: &str) -> Condition {
    capability_condition(CAPABILITY_SERVICE_MESH, reason, message)
}

/// Capability condition for authorization
pub fn authorization_condition(reason: ConditionReason, message: &str) -> Condition {
    capability_condition(CAPABILITY_SERVICE_MESH_AUTHORIZATION, reason, message)
}

fn capability_condition(type_: &str, reason: ConditionReason, message: &str) -> Condition {
    let status = match reason {
        ConditionReason::Configured => ConditionStatus::True,
        _ => ConditionStatus::False,
    };
    Condition::new(type_, status, reason, message)
}

/// Builds and runs the mesh capabilities for a PlatformInitialization
pub struct MeshReconciler {
    store: Arc<dyn ObjectStore>,
    events: Arc<dyn EventPublisher>,
    resolver: Arc<dyn ManifestResolver>,
    settings: MeshSettings,
}

impl MeshReconciler {
    /// Create a reconciler
    pub fn new(store: Arc<dyn ObjectStore>, events: Arc<dyn EventPublisher>, settings: MeshSettings) -> Self {
        Self {
            store,
            events,
            resolver: Arc::new(FsManifestResolver::new()),
            settings,
        }
    }

    fn feature_defaults(&self, owner: &PlatformInitialization) -> Result<FeatureDefaults> {
        Ok(owner
            .feature_defaults(self.store.clone())?
            .with_poll(self.settings.poll)
            .with_resolver(self.resolver.clone()))
    }

    fn manifests(&self, include: impl Into<PathBuf>) -> ManifestSource {
        ManifestSource::new(self.settings.manifests_dir.clone()).include(include)
    }

    fn handler(
        &self,
        owner: &PlatformInitialization,
        handler: FeaturesHandler,
        condition: Condition,
    ) -> HandlerWithReporter {
        HandlerWithReporter::new(
            handler,
            CapabilityReporter::new(self.store.clone(), owner, condition.clone()),
        )
        .with_delete_condition(condition)
    }

    /// Mesh capability: control plane, metrics collection and shared config maps
    pub fn service_mesh_capability(
        &self,
        owner: &PlatformInitialization,
        condition: Condition,
    ) -> Result<HandlerWithReporter> {
        let defaults = self.feature_defaults(owner)?;
        let spec = owner.spec.clone();
        let control_plane_dir = self.manifests(SERVICE_MESH_DIR);
        let metrics_dir = self.manifests(METRICS_DIR);

        let features = ClusterFeaturesHandler::new(CAPABILITY_SERVICE_MESH, defaults).with_provider(
            move |registry: &mut FeaturesRegistry| {
                let data = MeshData::from_spec(&spec)?;
                let ControlPlane {
                    namespace: mesh_namespace,
                    metrics_collection,
                    ..
                } = ControlPlane::from_spec(&spec)?;
                let namespace_for_pre = mesh_namespace.clone();

                registry.add([
                    FeatureBuilder::define("mesh-control-plane-creation")
                        .manifests(control_plane_dir.clone())
                        .with_data(data.control_plane.clone())
                        .pre_condition(|f, _| async move {
                            ensure_service_mesh_operator_installed(&f).await
                        })
                        .pre_condition(move |f, _| {
                            let namespace = namespace_for_pre.clone();
                            async move { create_namespace_if_not_exists(&f, &namespace).await }
                        })
                        .post_condition(move |f, cancel| {
                            let namespace = mesh_namespace.clone();
                            async move { wait_for_pods_to_be_ready(&f, &cancel, &namespace).await }
                        }),
                    FeatureBuilder::define("mesh-metrics-collection")
                        .enabled_when(move |_, _| async move {
                            Ok(metrics_collection == MetricsCollection::Istio)
                        })
                        .manifests(metrics_dir.clone())
                        .with_data(data.control_plane.clone())
                        .pre_condition(|f, cancel| async move {
                            ensure_service_mesh_installed(&f, &cancel).await
                        }),
                    FeatureBuilder::define("mesh-shared-configmap")
                        .with_resource(|f, _| async move { mesh_refs(&f).await })
                        .with_resource(|f, _| async move { auth_refs(&f).await })
                        .with_data(data.control_plane)
                        .with_data(data.authorization),
                ])
            },
        );
        Ok(self.handler(owner, features.into(), condition))
    }

    /// Authorization capability, or an inert one when its operator is missing
    pub async fn authorization_capability(
        &self,
        owner: &PlatformInitialization,
        condition: Condition,
    ) -> Result<HandlerWithReporter> {
        let installed = subscription_exists(self.store.as_ref(), AUTHORINO_OPERATOR)
            .await
            .map_err(|e| {
                Error::internal_with_context("authorization capability", format!("failed to list subscriptions: {e}"))
            })?;

        if !installed {
            info!(operator = AUTHORINO_OPERATOR, "operator not installed, authorization capability is inert");
            let missing = authorization_condition(
                ConditionReason::MissingOperator,
                "Authorino operator is not installed on the cluster, skipping authorization capability",
            );
            return Ok(self.handler(owner, FeaturesHandler::Empty, missing));
        }

        let defaults = self.feature_defaults(owner)?;
        let spec = owner.spec.clone();
        let external_authz = self
            .manifests(PathBuf::from(AUTHORINO_DIR).join("auth-smm.tmpl.yaml"))
            .include(PathBuf::from(AUTHORINO_DIR).join("base"))
            .include(PathBuf::from(AUTHORINO_DIR).join("mesh-authz-ext-provider.patch.tmpl.yaml"));
        let injection = self.manifests(
            PathBuf::from(AUTHORINO_DIR).join("deployment.injection.patch.tmpl.yaml"),
        );

        let features = ClusterFeaturesHandler::new(CAPABILITY_SERVICE_MESH_AUTHORIZATION, defaults)
            .with_provider(move |registry: &mut FeaturesRegistry| {
                let data = MeshData::from_spec(&spec)?;
                let mesh_namespace = ControlPlane::from_spec(&spec)?.namespace;

                registry.add([
                    FeatureBuilder::define("mesh-control-plane-external-authz")
                        .manifests(external_authz.clone())
                        .with_data(data.control_plane.clone())
                        .with_data(data.authorization.clone())
                        .pre_condition(|f, _| async move {
                            ensure_operator_is_installed(&f, AUTHORINO_OPERATOR).await
                        })
                        .pre_condition(|f, cancel| async move {
                            ensure_service_mesh_installed(&f, &cancel).await
                        })
                        .pre_condition(|f, _| async move { ensure_auth_namespace_exists(&f).await })
                        .post_condition(move |f, cancel| {
                            let namespace = mesh_namespace.clone();
                            async move { wait_for_pods_to_be_ready(&f, &cancel, &namespace).await }
                        })
                        .on_delete(|f, _| async move { remove_extension_provider(&f).await }),
                    // The provider's deployment is created by its operator, which does not
                    // propagate labels to the pod template, so injection is patched in.
                    FeatureBuilder::define("enable-proxy-injection-in-authorino-deployment")
                        .manifests(injection.clone())
                        .with_data(data.control_plane)
                        .with_data(data.authorization)
                        .pre_condition(|f, cancel| async move {
                            let auth = AUTHORIZATION.extract(&f)?;
                            wait_for_pods_to_be_ready(&f, &cancel, &auth.namespace).await
                        }),
                ])
            });
        Ok(self.handler(owner, features.into(), condition))
    }

    /// Bring the mesh capabilities in line with the owner's management state
    #[instrument(skip_all, fields(owner = %owner.name_any()))]
    pub async fn configure_service_mesh(
        &self,
        owner: &PlatformInitialization,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match owner.spec.mesh_management_state() {
            ManagementState::Managed => {
                let capabilities = [
                    self.service_mesh_capability(
                        owner,
                        service_mesh_condition(ConditionReason::Configured, "Service Mesh configured"),
                    )?,
                    self.authorization_capability(
                        owner,
                        authorization_condition(
                            ConditionReason::Configured,
                            "Service Mesh Authorization configured",
                        ),
                    )
                    .await?,
                ];
                for capability in &capabilities {
                    if let Err(e) = capability.apply(cancel).await {
                        self.report_failure(owner, actions::RECONCILE, "failed applying service mesh resources", &e)
                            .await;
                        return Err(e);
                    }
                }
                Ok(())
            }
            ManagementState::Unmanaged => {
                info!("service mesh is not managed by the operator, leaving it alone");
                Ok(())
            }
            ManagementState::Removed => self.remove_service_mesh(owner, cancel).await,
        }
    }

    async fn remove_service_mesh(
        &self,
        owner: &PlatformInitialization,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if !needs_removal(owner) {
            info!("service mesh is not configured, nothing to remove");
            return Ok(());
        }
        info!("removing service mesh capabilities");

        let capabilities = [
            self.service_mesh_capability(
                owner,
                service_mesh_condition(ConditionReason::Removed, "Service Mesh removed"),
            )?,
            self.authorization_capability(
                owner,
                authorization_condition(ConditionReason::Removed, "Service Mesh Authorization removed"),
            )
            .await?,
        ];
        for capability in &capabilities {
            if let Err(e) = capability.delete(cancel).await {
                self.report_failure(owner, actions::DELETE, "failed deleting service mesh resources", &e)
                    .await;
                return Err(e);
            }
        }
        self.events
            .publish(
                &owner.object_ref(&()),
                EventType::Normal,
                reasons::CAPABILITY_REMOVED,
                actions::DELETE,
                Some("service mesh capabilities removed".to_string()),
            )
            .await;
        Ok(())
    }

    async fn report_failure(&self, owner: &PlatformInitialization, action: &str, message: &str, err: &Error) {
        error!(error = %err, action, "{message}");
        self.events
            .publish(
                &owner.object_ref(&()),
                EventType::Warning,
                reasons::PROVISIONING_FAILED,
                action,
                Some(format!("{message}: {err}")),
            )
            .await;
    }
}

/// Either capability may still have something installed
///
/// That is the case for any condition other than a finished removal or an
/// inert authorization capability. A removal that failed is `Unknown`.
fn needs_removal(owner: &PlatformInitialization) -> bool {
    let Some(status) = owner.status.as_ref() else {
        return false;
    };
    [CAPABILITY_SERVICE_MESH, CAPABILITY_SERVICE_MESH_AUTHORIZATION]
        .iter()
        .filter_map(|type_| find_condition(&status.conditions, type_))
        .any(|c| {
            if c.reason == ConditionReason::Removed.as_str() {
                c.status == ConditionStatus::Unknown
            } else {
                c.reason != ConditionReason::MissingOperator.as_str()
            }
        })
}
