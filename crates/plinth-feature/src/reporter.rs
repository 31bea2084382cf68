//! Capability conditions on the owner object
//!
//! A [`CapabilityReporter`] turns the outcome of a capability pass into one
//! condition in the owner's `status.conditions`. Conditions are persisted, so
//! the owner shows last-known capability health across operator restarts.

use chrono::Utc;
use kube::api::ApiResource;
use kube::Resource;
use plinth_common::crd::{remove_condition, set_condition, Condition, ConditionStatus};
use plinth_common::store::api_resource;
use plinth_common::{Error, ObjectKey, ObjectStore, Result};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument};

use crate::handler::FeaturesHandler;

/// Writes a capability condition onto an owner object
pub struct CapabilityReporter {
    store: Arc<dyn ObjectStore>,
    owner_resource: ApiResource,
    owner_key: ObjectKey,
    initial: Condition,
}

impl CapabilityReporter {
    /// Reporter for `owner`, writing `initial` on success
    pub fn new<K>(store: Arc<dyn ObjectStore>, owner: &K, initial: Condition) -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        Self {
            store,
            owner_resource: api_resource::<K>(),
            owner_key: ObjectKey::of(owner),
            initial,
        }
    }

    /// Condition type this reporter owns
    pub fn condition_type(&self) -> &str {
        &self.initial.type_
    }

    /// Condition written for an outcome
    ///
    /// Success yields the initial condition. Failure keeps its type and reason,
    /// flips the status to `False` and carries the error as the message.
    pub fn condition_for(&self, outcome: std::result::Result<(), &Error>) -> Condition {
        match outcome {
            Ok(()) => self.initial.clone(),
            Err(err) => Condition {
                status: ConditionStatus::False,
                message: err.to_string(),
                last_transition_time: Utc::now(),
                ..self.initial.clone()
            },
        }
    }

    /// Condition written when deleting the capability failed
    ///
    /// The removal did not finish, so whether the capability is still present
    /// is unknown. The reason of `base` is kept so the next pass can retry.
    pub fn delete_failure_condition(&self, base: &Condition, err: &Error) -> Condition {
        Condition {
            status: ConditionStatus::Unknown,
            message: err.to_string(),
            last_transition_time: Utc::now(),
            ..base.clone()
        }
    }

    /// Persist the condition for `outcome`
    pub async fn report(&self, outcome: std::result::Result<(), &Error>) -> Result<()> {
        let condition = self.condition_for(outcome);
        self.update_conditions(|conditions| set_condition(conditions, condition))
            .await
    }

    /// Write an explicit condition, used for delete outcomes
    pub async fn report_condition(&self, condition: Condition) -> Result<()> {
        self.update_conditions(|conditions| set_condition(conditions, condition))
            .await
    }

    /// Drop this reporter's condition from the owner
    pub async fn clear(&self) -> Result<()> {
        let type_ = self.initial.type_.clone();
        self.update_conditions(|conditions| remove_condition(conditions, &type_))
            .await
    }

    async fn update_conditions<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut Vec<Condition>) -> bool,
    {
        let owner = self
            .store
            .get(&self.owner_resource, &self.owner_key)
            .await?
            .ok_or_else(|| Error::NotFound {
                kind: self.owner_resource.kind.clone(),
                name: self.owner_key.to_string(),
            })?;

        let mut conditions: Vec<Condition> = match owner.data.pointer("/status/conditions") {
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                Error::serialization_for_kind(&self.owner_resource.kind, e.to_string())
            })?,
            None => Vec::new(),
        };

        if !change(&mut conditions) {
            debug!(owner = %self.owner_key, condition = %self.initial.type_, "condition unchanged");
            return Ok(());
        }

        let conditions = serde_json::to_value(&conditions)
            .map_err(|e| Error::serialization_for_kind(&self.owner_resource.kind, e.to_string()))?;
        let status: Value = json!({ "conditions": conditions });
        self.store
            .patch_status(&self.owner_resource, &self.owner_key, &status)
            .await
    }
}

/// A capability handler whose outcome is mirrored onto the owner
pub struct HandlerWithReporter {
    handler: FeaturesHandler,
    reporter: CapabilityReporter,
    delete_condition: Option<Condition>,
}

impl HandlerWithReporter {
    /// Wrap `handler`
    pub fn new(handler: FeaturesHandler, reporter: CapabilityReporter) -> Self {
        Self {
            handler,
            reporter,
            delete_condition: None,
        }
    }

    /// Condition written after a successful delete
    ///
    /// Without one, a successful delete removes the capability's condition.
    pub fn with_delete_condition(mut self, condition: Condition) -> Self {
        self.delete_condition = Some(condition);
        self
    }

    /// The wrapped handler
    pub fn handler(&self) -> &FeaturesHandler {
        &self.handler
    }

    /// Apply the capability and report the outcome
    #[instrument(skip_all, fields(capability = %self.reporter.condition_type()))]
    pub async fn apply(&self, cancel: &CancellationToken) -> Result<()> {
        let outcome = self.handler.apply(cancel).await;
        let reported = self.reporter.report(outcome.as_ref().map(|_| ())).await;
        settle(outcome, reported)
    }

    /// Delete the capability and report the outcome
    #[instrument(skip_all, fields(capability = %self.reporter.condition_type()))]
    pub async fn delete(&self, cancel: &CancellationToken) -> Result<()> {
        let outcome = self.handler.delete(cancel).await;
        let reported = match (&outcome, &self.delete_condition) {
            (Err(err), condition) => {
                let base = condition.as_ref().unwrap_or(&self.reporter.initial);
                let failed = self.reporter.delete_failure_condition(base, err);
                self.reporter.report_condition(failed).await
            }
            (Ok(()), Some(condition)) => self.reporter.report_condition(condition.clone()).await,
            (Ok(()), None) => self.reporter.clear().await,
        };
        settle(outcome, reported)
    }
}

/// The handler's error wins; a reporting error alone is still surfaced
fn settle(outcome: Result<()>, reported: Result<()>) -> Result<()> {
    match (outcome, reported) {
        (Err(err), Err(report_err)) => {
            error!(error = %report_err, "failed to report capability failure");
            Err(err)
        }
        (Err(err), Ok(())) => Err(err),
        (Ok(()), reported) => reported,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::FeatureBuilder;
    use crate::handler::{ClusterFeaturesHandler, FeatureOwner};
    use crate::registry::FeaturesRegistry;
    use plinth_common::crd::{
        find_condition, ConditionReason, PlatformInitialization, PlatformInitializationSpec,
    };
    use plinth_common::store::{apply_typed, get_typed, MemoryStore};

    const CAPABILITY: &str = "CapabilityExample";

    async fn stored_owner(store: &MemoryStore) -> PlatformInitialization {
        let owner = PlatformInitialization::new(
            "default",
            PlatformInitializationSpec {
                applications_namespace: "opendatahub".to_string(),
                ..Default::default()
            },
        );
        apply_typed(store, &owner).await.unwrap()
    }

    async fn conditions(store: &MemoryStore) -> Vec<Condition> {
        get_typed::<PlatformInitialization>(store, &ObjectKey::cluster("default"))
            .await
            .unwrap()
            .unwrap()
            .status
            .map(|s| s.conditions)
            .unwrap_or_default()
    }

    fn configured() -> Condition {
        Condition::new(
            CAPABILITY,
            ConditionStatus::True,
            ConditionReason::Configured,
            "capability configured",
        )
    }

    fn handler_with(
        store: Arc<MemoryStore>,
        owner: &PlatformInitialization,
        fail: bool,
    ) -> HandlerWithReporter {
        let defaults = owner.feature_defaults(store.clone()).unwrap();
        let handler = ClusterFeaturesHandler::new("example", defaults).with_provider(
            move |registry: &mut FeaturesRegistry| {
                registry.add([FeatureBuilder::define("example-feature")
                    .pre_condition(move |_f, _c| async move {
                        if fail {
                            Err(Error::internal("operator missing"))
                        } else {
                            Ok(())
                        }
                    })
                    .on_delete(move |_f, _c| async move {
                        if fail {
                            Err(Error::internal("cleanup refused"))
                        } else {
                            Ok(())
                        }
                    })])
            },
        );
        HandlerWithReporter::new(
            handler.into(),
            CapabilityReporter::new(store, owner, configured()),
        )
    }

    #[tokio::test]
    async fn success_writes_initial_condition() {
        let store = Arc::new(MemoryStore::new());
        let owner = stored_owner(&store).await;

        handler_with(store.clone(), &owner, false)
            .apply(&CancellationToken::new())
            .await
            .unwrap();

        let conditions = conditions(&store).await;
        let condition = find_condition(&conditions, CAPABILITY).unwrap();
        assert_eq!(condition.status, ConditionStatus::True);
        assert_eq!(condition.reason, "Configured");
    }

    /// Story: a failing capability still surfaces its error and flips the condition
    #[tokio::test]
    async fn story_failure_flips_condition_and_propagates_error() {
        let store = Arc::new(MemoryStore::new());
        let owner = stored_owner(&store).await;

        let err = handler_with(store.clone(), &owner, true)
            .apply(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("operator missing"));

        let conditions = conditions(&store).await;
        let condition = find_condition(&conditions, CAPABILITY).unwrap();
        assert_eq!(condition.status, ConditionStatus::False);
        assert_eq!(condition.reason, "Configured");
        assert!(condition.message.contains("operator missing"));
    }

    #[tokio::test]
    async fn recovery_restores_true_condition() {
        let store = Arc::new(MemoryStore::new());
        let owner = stored_owner(&store).await;
        let cancel = CancellationToken::new();

        assert!(handler_with(store.clone(), &owner, true).apply(&cancel).await.is_err());
        handler_with(store.clone(), &owner, false).apply(&cancel).await.unwrap();

        let conditions = conditions(&store).await;
        assert!(find_condition(&conditions, CAPABILITY).unwrap().is_true());
    }

    #[tokio::test]
    async fn empty_handler_reports_missing_operator() {
        let store = Arc::new(MemoryStore::new());
        let owner = stored_owner(&store).await;
        let missing = Condition::new(
            CAPABILITY,
            ConditionStatus::False,
            ConditionReason::MissingOperator,
            "authorino-operator is not installed",
        );

        HandlerWithReporter::new(
            FeaturesHandler::Empty,
            CapabilityReporter::new(store.clone(), &owner, missing),
        )
        .apply(&CancellationToken::new())
        .await
        .unwrap();

        let conditions = conditions(&store).await;
        let condition = find_condition(&conditions, CAPABILITY).unwrap();
        assert_eq!(condition.reason, "MissingOperator");
        assert_eq!(condition.status, ConditionStatus::False);
    }

    #[tokio::test]
    async fn delete_writes_delete_condition_or_clears() {
        let store = Arc::new(MemoryStore::new());
        let owner = stored_owner(&store).await;
        let cancel = CancellationToken::new();
        let removed = Condition::new(
            CAPABILITY,
            ConditionStatus::False,
            ConditionReason::Removed,
            "capability removed",
        );

        handler_with(store.clone(), &owner, false)
            .with_delete_condition(removed)
            .delete(&cancel)
            .await
            .unwrap();
        let conditions_after = conditions(&store).await;
        assert_eq!(
            find_condition(&conditions_after, CAPABILITY).unwrap().reason,
            "Removed"
        );

        handler_with(store.clone(), &owner, false).delete(&cancel).await.unwrap();
        assert!(find_condition(&conditions(&store).await, CAPABILITY).is_none());
    }

    #[tokio::test]
    async fn reporting_to_missing_owner_fails_after_success() {
        let store = Arc::new(MemoryStore::new());
        let mut owner = PlatformInitialization::new("ghost", PlatformInitializationSpec::default());
        owner.metadata.uid = Some("ghost-uid".to_string());

        let err = HandlerWithReporter::new(
            FeaturesHandler::Empty,
            CapabilityReporter::new(store, &owner, configured()),
        )
        .apply(&CancellationToken::new())
        .await
        .unwrap_err();
        assert!(err.is_not_found());
    }

    /// Story: a failed removal is surfaced and marked unknown so it is retried
    #[tokio::test]
    async fn story_failed_delete_flips_condition_and_propagates_error() {
        let store = Arc::new(MemoryStore::new());
        let owner = stored_owner(&store).await;
        let removed = Condition::new(
            CAPABILITY,
            ConditionStatus::False,
            ConditionReason::Removed,
            "capability removed",
        );

        let err = handler_with(store.clone(), &owner, true)
            .with_delete_condition(removed)
            .delete(&CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.stage(), Some(plinth_common::Stage::Delete));
        assert_eq!(err.feature(), Some("example-feature"));

        let conditions = conditions(&store).await;
        let condition = find_condition(&conditions, CAPABILITY).unwrap();
        assert_eq!(condition.status, ConditionStatus::Unknown);
        assert_eq!(condition.reason, "Removed");
        assert!(condition.message.contains("cleanup refused"));
    }
}
