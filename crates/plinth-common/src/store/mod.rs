//! Object store abstraction over the cluster API
//!
//! Features never talk to `kube::Api` directly. Everything they read or write
//! goes through [`ObjectStore`], which works on `DynamicObject` so the same
//! code path handles core kinds, plinth CRDs and third-party CRDs that have no
//! Rust type. The typed helpers at the bottom of this module convert to and
//! from concrete `kube::Resource` types.
//!
//! Two implementations exist: [`KubeStore`] for a real cluster and
//! [`MemoryStore`] which simulates the API server closely enough to run the
//! engine end to end in tests.

mod kube_store;
mod memory;

pub use kube_store::KubeStore;
pub use memory::MemoryStore;

use std::fmt;

use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::{Error, Result};

/// Identity of an object within a kind
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Namespace, `None` for cluster-scoped objects
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Key of a namespaced object
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Key of a cluster-scoped object
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Key of an existing object
    pub fn of<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace(),
            name: obj.name_any(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Get/Create/Update/Patch/Delete/List over dynamically-typed cluster objects
///
/// Namespacing follows the key (or the object's metadata): a namespace means a
/// namespaced call, none means cluster-scoped.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object, `None` when it does not exist
    async fn get(&self, ar: &ApiResource, key: &ObjectKey) -> Result<Option<DynamicObject>>;

    /// List objects of a kind in one namespace, or everywhere when `None`
    async fn list(&self, ar: &ApiResource, namespace: Option<&str>) -> Result<Vec<DynamicObject>>;

    /// Create a new object; fails with `AlreadyExists` if it is present
    async fn create(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Replace an existing object
    async fn update(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Server-side apply under the plinth field manager
    async fn apply(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject>;

    /// JSON merge patch of an existing object
    async fn patch(&self, ar: &ApiResource, key: &ObjectKey, patch: &Value)
        -> Result<DynamicObject>;

    /// Merge `status` into the status sub-resource
    async fn patch_status(&self, ar: &ApiResource, key: &ObjectKey, status: &Value) -> Result<()>;

    /// Delete an object; returns false when it was already gone
    async fn delete(&self, ar: &ApiResource, key: &ObjectKey) -> Result<bool>;
}

/// ApiResource of a typed kind
pub fn api_resource<K>() -> ApiResource
where
    K: Resource<DynamicType = ()>,
{
    ApiResource::erase::<K>(&())
}

/// Convert a typed object into a DynamicObject
pub fn to_dynamic<K>(obj: &K) -> Result<DynamicObject>
where
    K: Resource<DynamicType = ()> + Serialize,
{
    let value = serde_json::to_value(obj)
        .map_err(|e| Error::serialization_for_kind(K::kind(&()), e.to_string()))?;
    serde_json::from_value(value)
        .map_err(|e| Error::serialization_for_kind(K::kind(&()), e.to_string()))
}

/// Convert a DynamicObject into a typed object
pub fn from_dynamic<K>(obj: DynamicObject) -> Result<K>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    let value = serde_json::to_value(&obj)
        .map_err(|e| Error::serialization_for_kind(K::kind(&()), e.to_string()))?;
    serde_json::from_value(value)
        .map_err(|e| Error::serialization_for_kind(K::kind(&()), e.to_string()))
}

/// Fetch a typed object
pub async fn get_typed<K>(store: &dyn ObjectStore, key: &ObjectKey) -> Result<Option<K>>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    match store.get(&api_resource::<K>(), key).await? {
        Some(obj) => from_dynamic(obj).map(Some),
        None => Ok(None),
    }
}

/// List typed objects
pub async fn list_typed<K>(store: &dyn ObjectStore, namespace: Option<&str>) -> Result<Vec<K>>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    store
        .list(&api_resource::<K>(), namespace)
        .await?
        .into_iter()
        .map(from_dynamic)
        .collect()
}

/// Server-side apply a typed object
pub async fn apply_typed<K>(store: &dyn ObjectStore, obj: &K) -> Result<K>
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
{
    let applied = store.apply(&api_resource::<K>(), &to_dynamic(obj)?).await?;
    from_dynamic(applied)
}

/// Merge a typed status into an object's status sub-resource
pub async fn patch_status_typed<K, S>(store: &dyn ObjectStore, key: &ObjectKey, status: &S) -> Result<()>
where
    K: Resource<DynamicType = ()>,
    S: Serialize,
{
    let value = serde_json::to_value(status)
        .map_err(|e| Error::serialization_for_kind(K::kind(&()), e.to_string()))?;
    store.patch_status(&api_resource::<K>(), key, &value).await
}

/// Apply RFC 7386 JSON merge patch semantics
pub fn merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(patch_map) => {
            if !target.is_object() {
                *target = Value::Object(serde_json::Map::new());
            }
            if let Value::Object(target_map) = target {
                for (key, value) in patch_map {
                    if value.is_null() {
                        target_map.remove(key);
                    } else {
                        merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}
