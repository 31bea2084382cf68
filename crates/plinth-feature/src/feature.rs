//! Feature: a named, idempotent unit of cluster change
//!
//! A feature is assembled by [`FeatureBuilder`] without touching the cluster.
//! [`Feature::apply`] and [`Feature::delete`] are the only entry points that
//! do. Apply runs, in order:
//!
//! 1. the enablement predicate (a disabled feature is a silent success)
//! 2. tracker creation, then data resolution
//! 3. preconditions, stopping at the first failure
//! 4. manifests, each object tagged with the owner reference
//! 5. resource producers
//! 6. postconditions (a failure leaves applied resources in place)
//! 7. the tracker's final status
//!
//! Every failure is wrapped with the feature name and the stage it happened
//! in, and recorded on the tracker before being returned.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Resource;
use parking_lot::RwLock;
use plinth_common::crd::Source;
use plinth_common::kube_utils::{api_resource_for, controller_owner_ref};
use plinth_common::{ApplyStage, Error, ObjectKey, ObjectStore, Result, Stage};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::data::DataEntry;
use crate::manifest::{ApplyMode, FsManifestResolver, ManifestResolver, ManifestSource};
use crate::poll::PollConfig;
use crate::tracker;

/// A step run against a feature (precondition, postcondition, resource producer, cleanup)
pub type Action = Arc<dyn Fn(Feature, CancellationToken) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Enablement predicate
pub type Predicate =
    Arc<dyn Fn(Feature, CancellationToken) -> BoxFuture<'static, Result<bool>> + Send + Sync>;

fn action<F, Fut>(f: F) -> Action
where
    F: Fn(Feature, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |feature, cancel| -> BoxFuture<'static, Result<()>> {
        Box::pin(f(feature, cancel))
    })
}

struct FeatureInner {
    name: String,
    target_namespace: String,
    app_namespace: String,
    source: Source,
    owner: Option<OwnerReference>,
    manifests: Vec<ManifestSource>,
    entries: Vec<DataEntry>,
    data: RwLock<BTreeMap<String, Value>>,
    preconditions: Vec<Action>,
    postconditions: Vec<Action>,
    resources: Vec<Action>,
    enabled_when: Option<Predicate>,
    on_delete: Vec<Action>,
    store: Arc<dyn ObjectStore>,
    resolver: Arc<dyn ManifestResolver>,
    poll: PollConfig,
}

/// A constructed feature; cloning is cheap and clones share state
#[derive(Clone)]
pub struct Feature {
    inner: Arc<FeatureInner>,
}

impl std::fmt::Debug for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feature")
            .field("name", &self.inner.name)
            .field("target_namespace", &self.inner.target_namespace)
            .field("entries", &self.inner.entries)
            .finish_non_exhaustive()
    }
}

impl Feature {
    /// Unique name of the feature
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Namespace the feature's tracker and side-effect objects live in
    pub fn target_namespace(&self) -> &str {
        &self.inner.target_namespace
    }

    /// Namespace the feature acts on
    pub fn app_namespace(&self) -> &str {
        &self.inner.app_namespace
    }

    /// Provenance of the feature
    pub fn source(&self) -> &Source {
        &self.inner.source
    }

    /// Owner reference to put on everything the feature creates
    pub fn owner_reference(&self) -> Option<&OwnerReference> {
        self.inner.owner.as_ref()
    }

    /// Object store the feature works against
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.inner.store
    }

    /// Poll bounds for readiness checks run by this feature
    pub fn poll_config(&self) -> PollConfig {
        self.inner.poll
    }

    /// Raw JSON value of a data key, if populated
    pub fn data_value(&self, key: &str) -> Option<Value> {
        self.inner.data.read().get(key).cloned()
    }

    /// Template context: every data key plus the feature's identity
    pub fn template_context(&self) -> Value {
        let mut ctx: serde_json::Map<String, Value> = self
            .inner
            .data
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        ctx.insert("feature_name".to_string(), Value::from(self.name()));
        ctx.insert(
            "target_namespace".to_string(),
            Value::from(self.target_namespace()),
        );
        ctx.insert("app_namespace".to_string(), Value::from(self.app_namespace()));
        Value::Object(ctx)
    }

    /// Apply the feature
    #[instrument(skip_all, fields(feature = %self.name(), namespace = %self.target_namespace()))]
    pub async fn apply(&self, cancel: &CancellationToken) -> Result<()> {
        if !self.is_enabled(cancel).await? {
            debug!("feature disabled, skipping");
            return Ok(());
        }

        tracker::ensure(self)
            .await
            .map_err(|e| e.in_feature(self.name(), Stage::Tracking))?;

        match self.run_stages(cancel).await {
            Ok(()) => {
                tracker::record_success(self)
                    .await
                    .map_err(|e| e.in_feature(self.name(), Stage::Tracking))?;
                info!("feature applied");
                Ok(())
            }
            Err((stage, err)) => {
                if !matches!(err, Error::Cancelled { .. }) {
                    if let Err(track_err) =
                        tracker::record_failure(self, stage, &err.to_string()).await
                    {
                        warn!(stage = %stage, error = %track_err, "failed to record feature failure on tracker");
                    }
                }
                warn!(stage = %stage, error = %err, "feature failed");
                Err(err.in_feature(self.name(), stage.into()))
            }
        }
    }

    /// Delete the feature: cleanup actions first, then the tracker
    ///
    /// Resources the feature created are removed by owner-reference cascade.
    #[instrument(skip_all, fields(feature = %self.name(), namespace = %self.target_namespace()))]
    pub async fn delete(&self, cancel: &CancellationToken) -> Result<()> {
        let wrap = |e: Error| e.in_feature(self.name(), Stage::Delete);
        // Cleanup actions may read data, e.g. the control plane they clean up
        self.resolve_data().await.map_err(wrap)?;
        for cleanup in &self.inner.on_delete {
            check_cancel(cancel, self.name()).map_err(wrap)?;
            cleanup(self.clone(), cancel.clone()).await.map_err(wrap)?;
        }
        check_cancel(cancel, self.name()).map_err(wrap)?;
        tracker::remove(self).await.map_err(wrap)?;
        debug!("feature deleted");
        Ok(())
    }

    async fn is_enabled(&self, cancel: &CancellationToken) -> Result<bool> {
        match &self.inner.enabled_when {
            Some(predicate) => predicate(self.clone(), cancel.clone())
                .await
                .map_err(|e| e.in_feature(self.name(), Stage::PreConditions)),
            None => Ok(true),
        }
    }

    async fn resolve_data(&self) -> Result<()> {
        for entry in &self.inner.entries {
            let value = entry.resolve(self.inner.store.clone()).await?;
            self.inner.data.write().insert(entry.key().to_string(), value);
        }
        Ok(())
    }

    async fn run_stages(&self, cancel: &CancellationToken) -> std::result::Result<(), (ApplyStage, Error)> {
        let at = |stage: ApplyStage| move |e: Error| (stage, e);

        check_cancel(cancel, self.name()).map_err(at(ApplyStage::PreConditions))?;
        self.resolve_data().await.map_err(at(ApplyStage::PreConditions))?;
        run_actions(self, &self.inner.preconditions, cancel)
            .await
            .map_err(at(ApplyStage::PreConditions))?;

        check_cancel(cancel, self.name()).map_err(at(ApplyStage::ApplyManifests))?;
        self.apply_manifests().await.map_err(at(ApplyStage::ApplyManifests))?;

        run_actions(self, &self.inner.resources, cancel)
            .await
            .map_err(at(ApplyStage::ResourceCreation))?;

        run_actions(self, &self.inner.postconditions, cancel)
            .await
            .map_err(at(ApplyStage::PostConditions))?;
        Ok(())
    }

    async fn apply_manifests(&self) -> Result<()> {
        let context = self.template_context();
        for source in &self.inner.manifests {
            for manifest in self.inner.resolver.resolve(source, &context)? {
                let types = manifest.object.types.clone().ok_or_else(|| {
                    Error::manifest(manifest.path.display().to_string(), "missing type metadata")
                })?;
                let ar = api_resource_for(&types);
                match manifest.mode {
                    ApplyMode::Apply => {
                        let mut object = manifest.object;
                        if let Some(owner) = self.owner_reference() {
                            add_owner(&mut object.metadata.owner_references, owner);
                        }
                        self.inner.store.apply(&ar, &object).await?;
                    }
                    ApplyMode::Patch => {
                        let key = ObjectKey::of(&manifest.object);
                        let patch = serde_json::to_value(&manifest.object)
                            .map_err(|e| Error::serialization_for_kind(&types.kind, e.to_string()))?;
                        self.inner.store.patch(&ar, &key, &patch).await?;
                    }
                }
                debug!(kind = %types.kind, path = %manifest.path.display(), "applied manifest");
            }
        }
        Ok(())
    }
}

fn check_cancel(cancel: &CancellationToken, feature: &str) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::cancelled(format!("feature {feature}")));
    }
    Ok(())
}

async fn run_actions(feature: &Feature, actions: &[Action], cancel: &CancellationToken) -> Result<()> {
    for step in actions {
        check_cancel(cancel, feature.name())?;
        step(feature.clone(), cancel.clone()).await?;
    }
    Ok(())
}

fn add_owner(refs: &mut Option<Vec<OwnerReference>>, owner: &OwnerReference) {
    let refs = refs.get_or_insert_with(Vec::new);
    if !refs.iter().any(|r| r.uid == owner.uid) {
        refs.push(owner.clone());
    }
}

/// Fluent builder for [`Feature`]
///
/// Nothing here touches the cluster. Errors found while building (an owner
/// without uid, duplicate data keys) surface from [`FeatureBuilder::create`].
pub struct FeatureBuilder {
    name: String,
    target_namespace: Option<String>,
    app_namespace: Option<String>,
    source: Option<Source>,
    owner: Option<OwnerReference>,
    owner_error: Option<Error>,
    manifests: Vec<ManifestSource>,
    entries: Vec<DataEntry>,
    preconditions: Vec<Action>,
    postconditions: Vec<Action>,
    resources: Vec<Action>,
    enabled_when: Option<Predicate>,
    on_delete: Vec<Action>,
    store: Option<Arc<dyn ObjectStore>>,
    resolver: Option<Arc<dyn ManifestResolver>>,
    poll: Option<PollConfig>,
}

impl FeatureBuilder {
    /// Start defining a feature
    pub fn define(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target_namespace: None,
            app_namespace: None,
            source: None,
            owner: None,
            owner_error: None,
            manifests: Vec::new(),
            entries: Vec::new(),
            preconditions: Vec::new(),
            postconditions: Vec::new(),
            resources: Vec::new(),
            enabled_when: None,
            on_delete: Vec::new(),
            store: None,
            resolver: None,
            poll: None,
        }
    }

    /// Name the feature is being defined under
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a manifest source
    pub fn manifests(mut self, source: ManifestSource) -> Self {
        self.manifests.push(source);
        self
    }

    /// Populate a data key
    pub fn with_data(mut self, entry: DataEntry) -> Self {
        self.entries.push(entry);
        self
    }

    /// Add a gating check run before anything is applied
    pub fn pre_condition<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Feature, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.preconditions.push(action(f));
        self
    }

    /// Add a verification check run after resources are applied
    pub fn post_condition<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Feature, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.postconditions.push(action(f));
        self
    }

    /// Add a producer creating non-templated objects
    pub fn with_resource<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Feature, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.resources.push(action(f));
        self
    }

    /// Skip the feature entirely when the predicate returns false
    pub fn enabled_when<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Feature, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool>> + Send + 'static,
    {
        self.enabled_when = Some(Arc::new(
            move |feature, cancel| -> BoxFuture<'static, Result<bool>> {
                Box::pin(f(feature, cancel))
            },
        ));
        self
    }

    /// Add a cleanup action run on delete
    pub fn on_delete<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Feature, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.on_delete.push(action(f));
        self
    }

    /// Tie the feature's tracker and resources to `owner`'s lifecycle
    pub fn owned_by<K>(mut self, owner: &K) -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        match controller_owner_ref(owner) {
            Ok(owner_ref) => {
                self.owner = Some(owner_ref);
                self.owner_error = None;
            }
            Err(e) => self.owner_error = Some(e),
        }
        self
    }

    /// Record which object caused this feature to exist
    pub fn source(mut self, source: Source) -> Self {
        self.source = Some(source);
        self
    }

    /// Namespace for the tracker and side-effect objects
    pub fn target_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.target_namespace = Some(namespace.into());
        self
    }

    /// Namespace the feature acts on
    pub fn app_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.app_namespace = Some(namespace.into());
        self
    }

    /// Object store to work against
    pub fn using_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Manifest resolver; defaults to reading from the filesystem
    pub fn using_resolver(mut self, resolver: Arc<dyn ManifestResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Poll bounds for readiness checks
    pub fn poll_config(mut self, poll: PollConfig) -> Self {
        self.poll = Some(poll);
        self
    }

    /// Fill in settings the definition left open
    pub(crate) fn with_defaults(mut self, defaults: &crate::registry::FeatureDefaults) -> Self {
        if self.store.is_none() {
            self.store = Some(defaults.store.clone());
        }
        if self.resolver.is_none() {
            self.resolver = defaults.resolver.clone();
        }
        if self.source.is_none() {
            self.source = Some(defaults.source.clone());
        }
        if self.app_namespace.is_none() {
            self.app_namespace = Some(defaults.app_namespace.clone());
        }
        if self.target_namespace.is_none() {
            self.target_namespace = Some(defaults.target_namespace.clone());
        }
        if self.owner.is_none() && self.owner_error.is_none() {
            self.owner = defaults.owner.clone();
        }
        if self.poll.is_none() {
            self.poll = Some(defaults.poll);
        }
        self
    }

    /// Validate and build the feature
    pub fn create(self) -> Result<Feature> {
        let name = self.name;
        if name.trim().is_empty() {
            return Err(Error::validation("feature name cannot be empty"));
        }
        if let Some(err) = self.owner_error {
            return Err(Error::validation_for(&name, err.to_string()));
        }
        let store = self
            .store
            .ok_or_else(|| Error::validation_for(&name, "no object store configured"))?;
        let target_namespace = self
            .target_namespace
            .filter(|ns| !ns.is_empty())
            .ok_or_else(|| Error::validation_for(&name, "target namespace is required"))?;

        let mut data = BTreeMap::new();
        let mut seen = std::collections::BTreeSet::new();
        for entry in &self.entries {
            if !seen.insert(entry.key()) {
                return Err(Error::validation_for(
                    &name,
                    format!("data key '{}' populated more than once", entry.key()),
                ));
            }
            if let Some(value) = entry.ready_value() {
                data.insert(entry.key().to_string(), value);
            }
        }

        Ok(Feature {
            inner: Arc::new(FeatureInner {
                app_namespace: self
                    .app_namespace
                    .unwrap_or_else(|| target_namespace.clone()),
                name,
                target_namespace,
                source: self.source.unwrap_or_default(),
                owner: self.owner,
                manifests: self.manifests,
                entries: self.entries,
                data: RwLock::new(data),
                preconditions: self.preconditions,
                postconditions: self.postconditions,
                resources: self.resources,
                enabled_when: self.enabled_when,
                on_delete: self.on_delete,
                store,
                resolver: self
                    .resolver
                    .unwrap_or_else(|| Arc::new(FsManifestResolver::new())),
                poll: self.poll.unwrap_or_default(),
            }),
        })
    }
}
