//! Feature lifecycle engine for plinth
//!
//! A capability is a set of features registered by providers. Each feature
//! is gated by preconditions, materialised from templated manifests and
//! resource producers, verified by postconditions, and mirrored into a
//! FeatureTracker. The capability's overall outcome is reported as one
//! condition on the owner object.
//!
//! # Modules
//!
//! - [`feature`] - `Feature` and its builder, the apply/delete flow
//! - [`data`] - typed data keys shared between features and templates
//! - [`manifest`] - manifest sources and filesystem resolution
//! - [`registry`] - feature registration and providers
//! - [`handler`] - cluster and empty capability handlers
//! - [`reporter`] - capability conditions on the owner
//! - [`poll`] - bounded readiness polling
//! - [`conditions`] - reusable preconditions and postconditions
//! - [`tracker`] - FeatureTracker reconciliation

#![deny(missing_docs)]

pub mod conditions;
pub mod data;
pub mod feature;
pub mod handler;
pub mod manifest;
pub mod poll;
pub mod registry;
pub mod reporter;
pub mod tracker;

pub use data::{DataEntry, DataKey};
pub use feature::{Feature, FeatureBuilder};
pub use handler::{ClusterFeaturesHandler, FeatureOwner, FeaturesHandler};
pub use manifest::{FsManifestResolver, ManifestResolver, ManifestSource};
pub use poll::{poll_until_ready, PollConfig};
pub use registry::{FeatureDefaults, FeaturesProvider, FeaturesRegistry};
pub use reporter::{CapabilityReporter, HandlerWithReporter};
