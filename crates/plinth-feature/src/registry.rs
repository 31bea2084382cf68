//! Registration of features under a capability
//!
//! Providers add builders to a [`FeaturesRegistry`]; the registry fills in
//! the capability-wide defaults (store, owner, namespaces), builds each
//! feature and keeps them in registration order. A batch is all or nothing:
//! any violation rejects every feature in it.

use std::collections::BTreeSet;
use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use plinth_common::crd::Source;
use plinth_common::{Error, ObjectStore, Result};
use tracing::debug;

use crate::feature::{Feature, FeatureBuilder};
use crate::manifest::ManifestResolver;
use crate::poll::PollConfig;

/// Settings every feature registered through a registry starts from
#[derive(Clone)]
pub struct FeatureDefaults {
    /// Object store features work against
    pub store: Arc<dyn ObjectStore>,
    /// Manifest resolver; `None` uses the filesystem resolver
    pub resolver: Option<Arc<dyn ManifestResolver>>,
    /// Provenance recorded on trackers
    pub source: Source,
    /// Namespace features act on
    pub app_namespace: String,
    /// Namespace for trackers and side-effect objects
    pub target_namespace: String,
    /// Owner of every tracker and applied object
    pub owner: Option<OwnerReference>,
    /// Readiness poll bounds
    pub poll: PollConfig,
}

impl FeatureDefaults {
    /// Defaults with the tracker namespace equal to the app namespace
    pub fn new(store: Arc<dyn ObjectStore>, source: Source, app_namespace: impl Into<String>) -> Self {
        let app_namespace = app_namespace.into();
        Self {
            store,
            resolver: None,
            source,
            target_namespace: app_namespace.clone(),
            app_namespace,
            owner: None,
            poll: PollConfig::default(),
        }
    }

    /// Set the owner reference
    pub fn with_owner(mut self, owner: OwnerReference) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Set the manifest resolver
    pub fn with_resolver(mut self, resolver: Arc<dyn ManifestResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Set the poll bounds
    pub fn with_poll(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }
}

/// Ordered set of features for one capability
pub struct FeaturesRegistry {
    defaults: FeatureDefaults,
    features: Vec<Feature>,
}

impl FeaturesRegistry {
    /// Empty registry
    pub fn new(defaults: FeatureDefaults) -> Self {
        Self {
            defaults,
            features: Vec::new(),
        }
    }

    /// Defaults applied to every registered feature
    pub fn defaults(&self) -> &FeatureDefaults {
        &self.defaults
    }

    /// Register a batch of features
    ///
    /// Every builder is validated; on any violation (an empty or duplicate
    /// name, a failed build) nothing from the batch is kept and a single
    /// `Registration` error lists all of them.
    pub fn add(&mut self, builders: impl IntoIterator<Item = FeatureBuilder>) -> Result<()> {
        let mut names: BTreeSet<String> = self.features.iter().map(|f| f.name().to_string()).collect();
        let mut violations = Vec::new();
        let mut batch = Vec::new();

        for builder in builders {
            let name = builder.name().to_string();
            if name.trim().is_empty() {
                violations.push("feature name cannot be empty".to_string());
                continue;
            }
            if !names.insert(name.clone()) {
                violations.push(format!("feature '{name}' is already registered"));
                continue;
            }
            match builder.with_defaults(&self.defaults).create() {
                Ok(feature) => batch.push(feature),
                Err(e) => violations.push(format!("feature '{name}': {e}")),
            }
        }

        if !violations.is_empty() {
            return Err(Error::Registration { violations });
        }
        debug!(count = batch.len(), "registered features");
        self.features.extend(batch);
        Ok(())
    }

    /// Registered features in registration order
    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    /// Consume the registry
    pub fn into_features(self) -> Vec<Feature> {
        self.features
    }

    /// Number of registered features
    pub fn len(&self) -> usize {
        self.features.len()
    }

    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

/// Contributes features to a registry
///
/// Providers only declare; anything that needs the cluster belongs in a
/// deferred data entry or a precondition.
pub trait FeaturesProvider: Send + Sync {
    /// Add this provider's features
    fn provide(&self, registry: &mut FeaturesRegistry) -> Result<()>;
}

impl<F> FeaturesProvider for F
where
    F: Fn(&mut FeaturesRegistry) -> Result<()> + Send + Sync,
{
    fn provide(&self, registry: &mut FeaturesRegistry) -> Result<()> {
        self(registry)
    }
}
