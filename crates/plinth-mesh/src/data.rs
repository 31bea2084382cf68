//! Data shared by the mesh features
//!
//! Both descriptors are derived from the PlatformInitialization spec once per
//! pass and handed to every feature that needs them. Templates see them as
//! `control_plane` and `authorization`.

use plinth_common::crd::{MetricsCollection, PlatformInitializationSpec};
use plinth_common::{Error, Result, AUTHORIZATION_GROUP_LABEL};
use plinth_feature::{DataEntry, DataKey};
use serde::{Deserialize, Serialize};

/// Audience used when none is configured
pub const DEFAULT_AUDIENCE: &str = "https://kubernetes.default.svc";

/// Value of [`AUTHORIZATION_GROUP_LABEL`] on auth configs served by the provider
pub const DEFAULT_AUTHORIZATION_GROUP: &str = "default";

/// Where the mesh control plane lives
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlPlane {
    /// Control plane resource name
    pub name: String,
    /// Namespace of the control plane
    pub namespace: String,
    /// Metrics collection backend
    pub metrics_collection: MetricsCollection,
}

/// Authorization provider placement and selection
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    /// Name of the mesh extension provider
    pub provider_name: String,
    /// Namespace the provider runs in
    pub namespace: String,
    /// Token audiences
    pub audiences: Vec<String>,
    /// Label selector picking the auth configs the provider serves
    pub config_selector: String,
}

/// Control plane descriptor key
pub const CONTROL_PLANE: DataKey<ControlPlane> = DataKey::new("control_plane");

/// Authorization descriptor key
pub const AUTHORIZATION: DataKey<Authorization> = DataKey::new("authorization");

impl ControlPlane {
    /// Descriptor from the spec; fails when the mesh section is absent
    pub fn from_spec(spec: &PlatformInitializationSpec) -> Result<Self> {
        let mesh = spec
            .service_mesh
            .as_ref()
            .ok_or_else(|| Error::validation("serviceMesh is not configured"))?;
        Ok(Self {
            name: mesh.control_plane.name.clone(),
            namespace: mesh.control_plane.namespace.clone(),
            metrics_collection: mesh.control_plane.metrics_collection,
        })
    }
}

impl Authorization {
    /// Descriptor from the spec, filling in defaults
    pub fn from_spec(spec: &PlatformInitializationSpec) -> Result<Self> {
        let mesh = spec
            .service_mesh
            .as_ref()
            .ok_or_else(|| Error::validation("serviceMesh is not configured"))?;
        let provider_name = auth_provider_name(&spec.applications_namespace);
        let namespace = mesh
            .auth
            .namespace
            .clone()
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| provider_name.clone());
        let audiences = match &mesh.auth.audiences {
            Some(audiences) if !audiences.is_empty() => audiences.clone(),
            _ => vec![DEFAULT_AUDIENCE.to_string()],
        };
        Ok(Self {
            provider_name,
            namespace,
            audiences,
            config_selector: format!("{AUTHORIZATION_GROUP_LABEL}={DEFAULT_AUTHORIZATION_GROUP}"),
        })
    }
}

/// Name of the authorization provider serving `app_namespace`
pub fn auth_provider_name(app_namespace: &str) -> String {
    format!("{app_namespace}-auth-provider")
}

/// Data entries for one pass, cloned into every feature that reads them
#[derive(Clone, Debug)]
pub struct MeshData {
    /// Control plane entry
    pub control_plane: DataEntry,
    /// Authorization entry
    pub authorization: DataEntry,
}

impl MeshData {
    /// Build both entries from the spec
    pub fn from_spec(spec: &PlatformInitializationSpec) -> Result<Self> {
        Ok(Self {
            control_plane: DataEntry::value(&CONTROL_PLANE, ControlPlane::from_spec(spec)?),
            authorization: DataEntry::value(&AUTHORIZATION, Authorization::from_spec(spec)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plinth_common::crd::{AuthSpec, ManagementState, ServiceMeshSpec};

    fn spec(auth: AuthSpec) -> PlatformInitializationSpec {
        PlatformInitializationSpec {
            applications_namespace: "opendatahub".to_string(),
            service_mesh: Some(ServiceMeshSpec {
                management_state: ManagementState::Managed,
                auth,
                ..Default::default()
            }),
        }
    }

    #[test]
    fn control_plane_comes_from_spec() {
        let cp = ControlPlane::from_spec(&spec(AuthSpec::default())).unwrap();
        assert_eq!(cp.name, "data-science-smcp");
        assert_eq!(cp.namespace, "istio-system");
        assert_eq!(cp.metrics_collection, MetricsCollection::Istio);
    }

    #[test]
    fn authorization_defaults() {
        let auth = Authorization::from_spec(&spec(AuthSpec::default())).unwrap();
        assert_eq!(auth.provider_name, "opendatahub-auth-provider");
        assert_eq!(auth.namespace, "opendatahub-auth-provider");
        assert_eq!(auth.audiences, vec![DEFAULT_AUDIENCE.to_string()]);
        assert_eq!(
            auth.config_selector,
            "security.plinth.dev/authorization-group=default"
        );
    }

    #[test]
    fn authorization_overrides() {
        let auth = Authorization::from_spec(&spec(AuthSpec {
            namespace: Some("auth".to_string()),
            audiences: Some(vec!["a".to_string(), "b".to_string()]),
        }))
        .unwrap();
        assert_eq!(auth.namespace, "auth");
        assert_eq!(auth.provider_name, "opendatahub-auth-provider");
        assert_eq!(auth.audiences, vec!["a", "b"]);
    }

    #[test]
    fn missing_mesh_section_is_a_validation_error() {
        let spec = PlatformInitializationSpec {
            applications_namespace: "opendatahub".to_string(),
            service_mesh: None,
        };
        assert!(matches!(
            ControlPlane::from_spec(&spec),
            Err(Error::Validation { .. })
        ));
    }
}
