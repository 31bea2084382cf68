//! PlatformInitialization CRD: the top-level configuration object
//!
//! One cluster-scoped object declares which platform capabilities should
//! exist. It owns every FeatureTracker and every resource the capabilities
//! create, so deleting it cascades through all of them.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;

// =============================================================================
// CRD
// =============================================================================

/// Spec for a PlatformInitialization
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "plinth.dev",
    version = "v1alpha1",
    kind = "PlatformInitialization",
    plural = "platforminitializations",
    shortname = "pinit",
    status = "PlatformInitializationStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PlatformInitializationSpec {
    /// Namespace the platform's applications live in
    pub applications_namespace: String,

    /// Service mesh configuration; absent means the mesh is not managed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_mesh: Option<ServiceMeshSpec>,
}

/// Whether the operator manages a capability
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ManagementState {
    /// The operator creates and reconciles the capability
    Managed,
    /// The operator leaves the capability alone
    #[default]
    Unmanaged,
    /// The operator tears the capability down
    Removed,
}

/// Service mesh settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMeshSpec {
    /// Management state of the mesh
    #[serde(default)]
    pub management_state: ManagementState,

    /// Control plane placement
    #[serde(default)]
    pub control_plane: ControlPlaneSpec,

    /// Authorization provider settings
    #[serde(default)]
    pub auth: AuthSpec,
}

/// Mesh control plane placement
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneSpec {
    /// Name of the control plane resource
    #[serde(default = "default_control_plane_name")]
    pub name: String,

    /// Namespace the control plane runs in
    #[serde(default = "default_control_plane_namespace")]
    pub namespace: String,

    /// Metrics collection mode
    #[serde(default)]
    pub metrics_collection: MetricsCollection,
}

impl Default for ControlPlaneSpec {
    fn default() -> Self {
        Self {
            name: default_control_plane_name(),
            namespace: default_control_plane_namespace(),
            metrics_collection: MetricsCollection::default(),
        }
    }
}

fn default_control_plane_name() -> String {
    "data-science-smcp".to_string()
}

fn default_control_plane_namespace() -> String {
    "istio-system".to_string()
}

/// Metrics collection backend for the mesh
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum MetricsCollection {
    /// Mesh-native metrics collection
    #[default]
    Istio,
    /// No metrics collection
    None,
}

/// Authorization provider settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthSpec {
    /// Namespace of the authorization provider; defaults to `<appNamespace>-auth-provider`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Token audiences; defaults to the cluster's API server audience
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audiences: Option<Vec<String>>,
}

// =============================================================================
// Status
// =============================================================================

/// Status of a PlatformInitialization
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlatformInitializationStatus {
    /// Free-form phase summary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// Capability conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

// =============================================================================
// Helpers
// =============================================================================

impl PlatformInitializationSpec {
    /// Management state of the mesh, `Unmanaged` when the section is absent
    pub fn mesh_management_state(&self) -> ManagementState {
        self.service_mesh
            .as_ref()
            .map(|m| m.management_state)
            .unwrap_or_default()
    }

    /// Validate required fields
    pub fn validate(&self) -> Result<(), String> {
        if self.applications_namespace.is_empty() {
            return Err("applicationsNamespace cannot be empty".to_string());
        }
        if let Some(mesh) = &self.service_mesh {
            if mesh.control_plane.name.is_empty() {
                return Err("serviceMesh.controlPlane.name cannot be empty".to_string());
            }
            if mesh.control_plane.namespace.is_empty() {
                return Err("serviceMesh.controlPlane.namespace cannot be empty".to_string());
            }
        }
        Ok(())
    }
}
