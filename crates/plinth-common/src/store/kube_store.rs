//! ObjectStore backed by a live cluster

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::discovery::ApiResource;
use kube::{Client, ResourceExt};
use serde_json::Value;
use tracing::{debug, trace};

use super::{ObjectKey, ObjectStore};
use crate::kube_utils::FIELD_MANAGER;
use crate::{Error, Result};

/// ObjectStore talking to the Kubernetes API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    /// Create a store over an existing client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// The underlying client
    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api(&self, ar: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, ar),
            None => Api::all_with(self.client.clone(), ar),
        }
    }
}

/// Fill in apiVersion/kind when a caller built the object without them
fn with_types(ar: &ApiResource, obj: &DynamicObject) -> DynamicObject {
    let mut obj = obj.clone();
    if obj.types.is_none() {
        obj.types = Some(kube::core::TypeMeta {
            api_version: ar.api_version.clone(),
            kind: ar.kind.clone(),
        });
    }
    obj
}

fn map_create_error(ar: &ApiResource, name: &str, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(ae) if ae.code == 409 => Error::AlreadyExists {
            kind: ar.kind.clone(),
            name: name.to_string(),
        },
        other => Error::from(other),
    }
}

fn map_missing_error(ar: &ApiResource, key: &ObjectKey, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => Error::NotFound {
            kind: ar.kind.clone(),
            name: key.to_string(),
        },
        other => Error::from(other),
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, ar: &ApiResource, key: &ObjectKey) -> Result<Option<DynamicObject>> {
        trace!(kind = %ar.kind, key = %key, "get");
        Ok(self
            .api(ar, key.namespace.as_deref())
            .get_opt(&key.name)
            .await?)
    }

    async fn list(&self, ar: &ApiResource, namespace: Option<&str>) -> Result<Vec<DynamicObject>> {
        trace!(kind = %ar.kind, namespace = ?namespace, "list");
        let list = self.api(ar, namespace).list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn create(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        let name = obj.name_any();
        debug!(kind = %ar.kind, name = %name, namespace = ?obj.namespace(), "create");
        self.api(ar, obj.namespace().as_deref())
            .create(&PostParams::default(), &with_types(ar, obj))
            .await
            .map_err(|e| map_create_error(ar, &name, e))
    }

    async fn update(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::of(obj);
        debug!(kind = %ar.kind, key = %key, "update");
        self.api(ar, key.namespace.as_deref())
            .replace(&key.name, &PostParams::default(), &with_types(ar, obj))
            .await
            .map_err(|e| map_missing_error(ar, &key, e))
    }

    async fn apply(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::of(obj);
        debug!(kind = %ar.kind, key = %key, "server-side apply");
        let params = PatchParams::apply(FIELD_MANAGER).force();
        Ok(self
            .api(ar, key.namespace.as_deref())
            .patch(&key.name, &params, &Patch::Apply(&with_types(ar, obj)))
            .await?)
    }

    async fn patch(
        &self,
        ar: &ApiResource,
        key: &ObjectKey,
        patch: &Value,
    ) -> Result<DynamicObject> {
        debug!(kind = %ar.kind, key = %key, "merge patch");
        self.api(ar, key.namespace.as_deref())
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| map_missing_error(ar, key, e))
    }

    async fn patch_status(&self, ar: &ApiResource, key: &ObjectKey, status: &Value) -> Result<()> {
        debug!(kind = %ar.kind, key = %key, "patch status");
        let patch = serde_json::json!({ "status": status });
        self.api(ar, key.namespace.as_deref())
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_missing_error(ar, key, e))?;
        Ok(())
    }

    async fn delete(&self, ar: &ApiResource, key: &ObjectKey) -> Result<bool> {
        debug!(kind = %ar.kind, key = %key, "delete");
        match self
            .api(ar, key.namespace.as_deref())
            .delete(&key.name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
