//! Service mesh and authorization capabilities built on the plinth feature engine
//!
//! - [`data`] - control plane and authorization descriptors
//! - [`conditions`] - mesh readiness checks
//! - [`resources`] - shared config maps and extension provider cleanup
//! - [`capability`] - capability wiring and management-state dispatch

#![deny(missing_docs)]

pub mod capability;
pub mod conditions;
pub mod data;
pub mod resources;

pub use capability::{
    authorization_condition, service_mesh_condition, MeshReconciler, MeshSettings,
    CAPABILITY_SERVICE_MESH, CAPABILITY_SERVICE_MESH_AUTHORIZATION,
};
pub use data::{Authorization, ControlPlane, MeshData, AUTHORIZATION, CONTROL_PLANE};
