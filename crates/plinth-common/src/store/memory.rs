//! In-memory ObjectStore
//!
//! Simulates the parts of the API server the engine depends on: uid
//! assignment, resourceVersion bumps on real changes only, merge patches, a
//! status sub-resource that spec writes cannot touch, and background cascade
//! deletion through owner references.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::DynamicObject;
use kube::core::TypeMeta;
use kube::discovery::ApiResource;
use kube::ResourceExt;
use parking_lot::Mutex;
use serde_json::Value;

use super::{merge_patch, ObjectKey, ObjectStore};
use crate::{Error, Result};

/// (group, kind, namespace, name); version is ignored like the API server does
type Slot = (String, String, Option<String>, String);

#[derive(Default)]
struct Inner {
    objects: BTreeMap<Slot, DynamicObject>,
    revision: u64,
    failures: BTreeSet<(String, String)>,
}

impl Inner {
    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }
}

/// ObjectStore that keeps every object in process memory
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

fn slot(ar: &ApiResource, key: &ObjectKey) -> Slot {
    (
        ar.group.clone(),
        ar.kind.clone(),
        key.namespace.clone(),
        key.name.clone(),
    )
}

fn to_value(obj: &DynamicObject) -> Result<Value> {
    serde_json::to_value(obj).map_err(|e| Error::serialization(e.to_string()))
}

fn from_value(value: Value) -> Result<DynamicObject> {
    serde_json::from_value(value).map_err(|e| Error::serialization(e.to_string()))
}

/// Content of an object without fields the server owns
fn content(obj: &DynamicObject) -> Result<Value> {
    let mut value = to_value(obj)?;
    if let Some(meta) = value.get_mut("metadata").and_then(Value::as_object_mut) {
        meta.remove("resourceVersion");
        meta.remove("uid");
        meta.remove("creationTimestamp");
    }
    Ok(value)
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `operation` ("get", "create", "apply", ...) on `kind` fail
    pub fn fail_on(&self, operation: &str, kind: &str) {
        self.inner
            .lock()
            .failures
            .insert((operation.to_string(), kind.to_string()));
    }

    /// Stop failing injected operations
    pub fn clear_failures(&self) {
        self.inner.lock().failures.clear();
    }

    /// Number of stored objects across every kind
    pub fn len(&self) -> usize {
        self.inner.lock().objects.len()
    }

    /// True when nothing is stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every stored object of a kind, in key order
    pub fn objects_of_kind(&self, kind: &str) -> Vec<DynamicObject> {
        self.inner
            .lock()
            .objects
            .iter()
            .filter(|((_, k, _, _), _)| k == kind)
            .map(|(_, obj)| obj.clone())
            .collect()
    }

    fn check_failure(inner: &Inner, operation: &str, ar: &ApiResource, key: &ObjectKey) -> Result<()> {
        if inner
            .failures
            .contains(&(operation.to_string(), ar.kind.clone()))
        {
            return Err(Error::store(
                operation,
                &ar.kind,
                key.to_string(),
                "injected failure",
            ));
        }
        Ok(())
    }

    fn insert_new(inner: &mut Inner, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        let mut obj = obj.clone();
        obj.types = Some(TypeMeta {
            api_version: ar.api_version.clone(),
            kind: ar.kind.clone(),
        });
        obj.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        obj.metadata.resource_version = Some(inner.next_revision());
        obj.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
        if let Some(data) = obj.data.as_object_mut() {
            data.remove("status");
        }
        let key = ObjectKey::of(&obj);
        inner.objects.insert(slot(ar, &key), obj.clone());
        Ok(obj)
    }

    /// Store `updated` in place of `existing`, bumping resourceVersion only on change
    fn replace(
        inner: &mut Inner,
        ar: &ApiResource,
        key: &ObjectKey,
        existing: &DynamicObject,
        mut updated: DynamicObject,
    ) -> Result<DynamicObject> {
        updated.types = existing.types.clone();
        updated.metadata.uid = existing.metadata.uid.clone();
        updated.metadata.creation_timestamp = existing.metadata.creation_timestamp.clone();
        updated.metadata.resource_version = existing.metadata.resource_version.clone();
        if content(&updated)? != content(existing)? {
            updated.metadata.resource_version = Some(inner.next_revision());
        }
        inner.objects.insert(slot(ar, key), updated.clone());
        Ok(updated)
    }

    fn not_found(ar: &ApiResource, key: &ObjectKey) -> Error {
        Error::NotFound {
            kind: ar.kind.clone(),
            name: key.to_string(),
        }
    }

    /// Remove objects whose owner was deleted, transitively
    fn cascade(inner: &mut Inner, uid: String) -> usize {
        let mut removed = 0;
        let mut pending = vec![uid];
        while let Some(owner_uid) = pending.pop() {
            let orphans: Vec<Slot> = inner
                .objects
                .iter()
                .filter(|(_, obj)| obj.owner_references().iter().any(|r| r.uid == owner_uid))
                .map(|(slot, _)| slot.clone())
                .collect();
            for orphan in orphans {
                if let Some(obj) = inner.objects.remove(&orphan) {
                    removed += 1;
                    if let Some(uid) = obj.metadata.uid {
                        pending.push(uid);
                    }
                }
            }
        }
        removed
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, ar: &ApiResource, key: &ObjectKey) -> Result<Option<DynamicObject>> {
        let inner = self.inner.lock();
        Self::check_failure(&inner, "get", ar, key)?;
        Ok(inner.objects.get(&slot(ar, key)).cloned())
    }

    async fn list(&self, ar: &ApiResource, namespace: Option<&str>) -> Result<Vec<DynamicObject>> {
        let inner = self.inner.lock();
        Self::check_failure(&inner, "list", ar, &ObjectKey::cluster("*"))?;
        Ok(inner
            .objects
            .iter()
            .filter(|((group, kind, ns, _), _)| {
                *group == ar.group
                    && *kind == ar.kind
                    && namespace.map_or(true, |wanted| ns.as_deref() == Some(wanted))
            })
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::of(obj);
        let mut inner = self.inner.lock();
        Self::check_failure(&inner, "create", ar, &key)?;
        if inner.objects.contains_key(&slot(ar, &key)) {
            return Err(Error::AlreadyExists {
                kind: ar.kind.clone(),
                name: key.to_string(),
            });
        }
        Self::insert_new(&mut inner, ar, obj)
    }

    async fn update(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::of(obj);
        let mut inner = self.inner.lock();
        Self::check_failure(&inner, "update", ar, &key)?;
        let existing = inner
            .objects
            .get(&slot(ar, &key))
            .cloned()
            .ok_or_else(|| Self::not_found(ar, &key))?;

        if let Some(rv) = &obj.metadata.resource_version {
            if existing.metadata.resource_version.as_ref() != Some(rv) {
                return Err(Error::store(
                    "update",
                    &ar.kind,
                    key.to_string(),
                    "resourceVersion conflict",
                ));
            }
        }

        let mut updated = obj.clone();
        // Status is only writable through the status sub-resource
        match (updated.data.as_object_mut(), existing.data.get("status")) {
            (Some(data), Some(status)) => {
                data.insert("status".to_string(), status.clone());
            }
            (Some(data), None) => {
                data.remove("status");
            }
            _ => {}
        }
        Self::replace(&mut inner, ar, &key, &existing, updated)
    }

    async fn apply(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::of(obj);
        let mut inner = self.inner.lock();
        Self::check_failure(&inner, "apply", ar, &key)?;
        let existing = match inner.objects.get(&slot(ar, &key)).cloned() {
            Some(existing) => existing,
            None => return Self::insert_new(&mut inner, ar, obj),
        };

        let mut applied = to_value(obj)?;
        if let Some(map) = applied.as_object_mut() {
            map.remove("status");
            if let Some(meta) = map.get_mut("metadata").and_then(Value::as_object_mut) {
                meta.remove("resourceVersion");
                meta.remove("uid");
            }
        }
        let mut merged = to_value(&existing)?;
        merge_patch(&mut merged, &applied);
        let merged = from_value(merged)?;
        Self::replace(&mut inner, ar, &key, &existing, merged)
    }

    async fn patch(
        &self,
        ar: &ApiResource,
        key: &ObjectKey,
        patch: &Value,
    ) -> Result<DynamicObject> {
        let mut inner = self.inner.lock();
        Self::check_failure(&inner, "patch", ar, key)?;
        let existing = inner
            .objects
            .get(&slot(ar, key))
            .cloned()
            .ok_or_else(|| Self::not_found(ar, key))?;

        let mut patch = patch.clone();
        if let Some(map) = patch.as_object_mut() {
            map.remove("status");
        }
        let mut merged = to_value(&existing)?;
        merge_patch(&mut merged, &patch);
        let merged = from_value(merged)?;
        Self::replace(&mut inner, ar, key, &existing, merged)
    }

    async fn patch_status(&self, ar: &ApiResource, key: &ObjectKey, status: &Value) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::check_failure(&inner, "patch_status", ar, key)?;
        let existing = inner
            .objects
            .get(&slot(ar, key))
            .cloned()
            .ok_or_else(|| Self::not_found(ar, key))?;

        let mut merged = to_value(&existing)?;
        merge_patch(&mut merged, &serde_json::json!({ "status": status }));
        let merged = from_value(merged)?;
        Self::replace(&mut inner, ar, key, &existing, merged)?;
        Ok(())
    }

    async fn delete(&self, ar: &ApiResource, key: &ObjectKey) -> Result<bool> {
        let mut inner = self.inner.lock();
        Self::check_failure(&inner, "delete", ar, key)?;
        match inner.objects.remove(&slot(ar, key)) {
            Some(obj) => {
                if let Some(uid) = obj.metadata.uid {
                    Self::cascade(&mut inner, uid);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube_utils::build_api_resource;
    use crate::store::{from_dynamic, to_dynamic};
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use serde_json::json;

    fn configmap(ns: &str, name: &str, value: &str) -> DynamicObject {
        let mut cm = ConfigMap::default();
        cm.metadata.name = Some(name.to_string());
        cm.metadata.namespace = Some(ns.to_string());
        cm.data = Some([("KEY".to_string(), value.to_string())].into());
        to_dynamic(&cm).unwrap()
    }

    fn cm_ar() -> ApiResource {
        build_api_resource("v1", "ConfigMap")
    }

    #[tokio::test]
    async fn create_assigns_uid_and_rejects_duplicates() {
        let store = MemoryStore::new();
        let created = store.create(&cm_ar(), &configmap("ns", "a", "1")).await.unwrap();
        assert!(created.metadata.uid.is_some());
        assert!(created.metadata.resource_version.is_some());

        let err = store
            .create(&cm_ar(), &configmap("ns", "a", "1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn apply_is_idempotent_for_unchanged_content() {
        let store = MemoryStore::new();
        let first = store.apply(&cm_ar(), &configmap("ns", "a", "1")).await.unwrap();
        let second = store.apply(&cm_ar(), &configmap("ns", "a", "1")).await.unwrap();
        assert_eq!(first.metadata.resource_version, second.metadata.resource_version);
        assert_eq!(first.metadata.uid, second.metadata.uid);

        let third = store.apply(&cm_ar(), &configmap("ns", "a", "2")).await.unwrap();
        assert_ne!(first.metadata.resource_version, third.metadata.resource_version);
        let cm: ConfigMap = from_dynamic(third).unwrap();
        assert_eq!(cm.data.unwrap()["KEY"], "2");
    }

    #[tokio::test]
    async fn status_is_only_written_through_subresource() {
        let store = MemoryStore::new();
        let mut obj = configmap("ns", "a", "1");
        obj.data["status"] = json!({"phase": "ignored"});
        let created = store.apply(&cm_ar(), &obj).await.unwrap();
        assert!(created.data.get("status").is_none());

        let key = ObjectKey::namespaced("ns", "a");
        store
            .patch_status(&cm_ar(), &key, &json!({"phase": "Ready"}))
            .await
            .unwrap();
        let stored = store.get(&cm_ar(), &key).await.unwrap().unwrap();
        assert_eq!(stored.data["status"]["phase"], "Ready");

        // a spec write keeps the status
        store.apply(&cm_ar(), &configmap("ns", "a", "2")).await.unwrap();
        let stored = store.get(&cm_ar(), &key).await.unwrap().unwrap();
        assert_eq!(stored.data["status"]["phase"], "Ready");
    }

    #[tokio::test]
    async fn delete_cascades_through_owner_references() {
        let store = MemoryStore::new();
        let owner = store.create(&cm_ar(), &configmap("ns", "owner", "1")).await.unwrap();

        let mut child = configmap("ns", "child", "1");
        child.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "v1".to_string(),
            kind: "ConfigMap".to_string(),
            name: "owner".to_string(),
            uid: owner.metadata.uid.clone().unwrap(),
            ..Default::default()
        }]);
        let child = store.create(&cm_ar(), &child).await.unwrap();

        let mut grandchild = configmap("ns", "grandchild", "1");
        grandchild.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "v1".to_string(),
            kind: "ConfigMap".to_string(),
            name: "child".to_string(),
            uid: child.metadata.uid.clone().unwrap(),
            ..Default::default()
        }]);
        store.create(&cm_ar(), &grandchild).await.unwrap();
        store.create(&cm_ar(), &configmap("ns", "bystander", "1")).await.unwrap();

        assert!(store
            .delete(&cm_ar(), &ObjectKey::namespaced("ns", "owner"))
            .await
            .unwrap());
        let names: Vec<_> = store
            .objects_of_kind("ConfigMap")
            .iter()
            .map(|o| o.name_any())
            .collect();
        assert_eq!(names, vec!["bystander"]);

        assert!(!store
            .delete(&cm_ar(), &ObjectKey::namespaced("ns", "owner"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn patch_requires_existing_object() {
        let store = MemoryStore::new();
        let err = store
            .patch(&cm_ar(), &ObjectKey::namespaced("ns", "a"), &json!({"data": {}}))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn list_filters_by_namespace() {
        let store = MemoryStore::new();
        store.apply(&cm_ar(), &configmap("one", "a", "1")).await.unwrap();
        store.apply(&cm_ar(), &configmap("two", "b", "1")).await.unwrap();

        assert_eq!(store.list(&cm_ar(), Some("one")).await.unwrap().len(), 1);
        assert_eq!(store.list(&cm_ar(), None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn injected_failures_surface_as_store_errors() {
        let store = MemoryStore::new();
        store.fail_on("apply", "ConfigMap");
        let err = store
            .apply(&cm_ar(), &configmap("ns", "a", "1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Store { .. }));

        store.clear_failures();
        assert!(store.apply(&cm_ar(), &configmap("ns", "a", "1")).await.is_ok());
    }
}
