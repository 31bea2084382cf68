//! Capability handlers: apply or delete every feature of a capability
//!
//! Each pass builds a fresh registry from the handler's providers, then walks
//! the features sequentially in registration order. The first failure stops
//! the pass; the next reconciliation starts again from the first feature.

use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use plinth_common::crd::{PlatformInitialization, Source, SourceType};
use plinth_common::kube_utils::controller_owner_ref;
use plinth_common::{ObjectStore, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::feature::Feature;
use crate::registry::{FeatureDefaults, FeaturesProvider, FeaturesRegistry};

/// A top-level object features can be bound to
pub trait FeatureOwner {
    /// Provenance recorded on every tracker
    fn feature_source(&self) -> Source;

    /// Namespace the owner's features act on
    fn feature_app_namespace(&self) -> String;

    /// Controller reference put on trackers and applied objects
    fn feature_owner_reference(&self) -> Result<OwnerReference>;

    /// Registry defaults derived from this owner
    fn feature_defaults(&self, store: Arc<dyn ObjectStore>) -> Result<FeatureDefaults> {
        Ok(
            FeatureDefaults::new(store, self.feature_source(), self.feature_app_namespace())
                .with_owner(self.feature_owner_reference()?),
        )
    }
}

impl FeatureOwner for PlatformInitialization {
    fn feature_source(&self) -> Source {
        Source::new(SourceType::PlatformInitialization, self.name_any())
    }

    fn feature_app_namespace(&self) -> String {
        self.spec.applications_namespace.clone()
    }

    fn feature_owner_reference(&self) -> Result<OwnerReference> {
        controller_owner_ref(self)
    }
}

/// Handler that applies registered features against the cluster
pub struct ClusterFeaturesHandler {
    capability: String,
    defaults: FeatureDefaults,
    providers: Vec<Arc<dyn FeaturesProvider>>,
}

impl ClusterFeaturesHandler {
    /// Handler for `capability` with no providers yet
    pub fn new(capability: impl Into<String>, defaults: FeatureDefaults) -> Self {
        Self {
            capability: capability.into(),
            defaults,
            providers: Vec::new(),
        }
    }

    /// Add a provider; providers run in the order they were added
    pub fn with_provider(mut self, provider: impl FeaturesProvider + 'static) -> Self {
        self.providers.push(Arc::new(provider));
        self
    }

    /// Build this pass's features
    pub fn features(&self) -> Result<Vec<Feature>> {
        let mut registry = FeaturesRegistry::new(self.defaults.clone());
        for provider in &self.providers {
            provider.provide(&mut registry)?;
        }
        Ok(registry.into_features())
    }

    #[instrument(skip_all, fields(capability = %self.capability))]
    async fn apply(&self, cancel: &CancellationToken) -> Result<()> {
        let features = self.features()?;
        debug!(count = features.len(), "applying features");
        for feature in &features {
            feature.apply(cancel).await?;
        }
        info!(count = features.len(), "capability applied");
        Ok(())
    }

    #[instrument(skip_all, fields(capability = %self.capability))]
    async fn delete(&self, cancel: &CancellationToken) -> Result<()> {
        let features = self.features()?;
        debug!(count = features.len(), "deleting features");
        for feature in &features {
            feature.delete(cancel).await?;
        }
        info!(count = features.len(), "capability deleted");
        Ok(())
    }
}

/// Apply/delete entry point of one capability
pub enum FeaturesHandler {
    /// Features registered through providers
    Cluster(ClusterFeaturesHandler),
    /// Structurally disabled capability; never touches the cluster
    Empty,
}

impl FeaturesHandler {
    /// Apply every feature, stopping at the first failure
    pub async fn apply(&self, cancel: &CancellationToken) -> Result<()> {
        match self {
            Self::Cluster(handler) => handler.apply(cancel).await,
            Self::Empty => Ok(()),
        }
    }

    /// Delete every feature, stopping at the first failure
    pub async fn delete(&self, cancel: &CancellationToken) -> Result<()> {
        match self {
            Self::Cluster(handler) => handler.delete(cancel).await,
            Self::Empty => Ok(()),
        }
    }

    /// True for the no-op variant
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

impl From<ClusterFeaturesHandler> for FeaturesHandler {
    fn from(handler: ClusterFeaturesHandler) -> Self {
        Self::Cluster(handler)
    }
}
