//! Common types for plinth: CRDs, errors, object store and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod store;
pub mod telemetry;
pub mod template;
pub mod yaml;

pub use error::{ApplyStage, Error, Stage};
pub use store::{ObjectKey, ObjectStore};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Label key grouping authorization configs served by one provider
pub const AUTHORIZATION_GROUP_LABEL: &str = "security.plinth.dev/authorization-group";

/// Label marking objects managed by plinth
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`] on plinth-managed objects
pub const MANAGED_BY_VALUE: &str = "plinth";
