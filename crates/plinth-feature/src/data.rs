//! Typed data passed between features
//!
//! A [`DataKey`] names one logical dependency (a control-plane descriptor, an
//! authorization descriptor) and carries its Rust type. A [`DataEntry`]
//! populates a key on a feature, either eagerly or through a deferred producer
//! that runs on first resolution. Cloned entries share that resolution, so a
//! descriptor handed to several features is computed once per pass.
//!
//! Values are kept as JSON so the same bag feeds manifest templates.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::BoxFuture;
use plinth_common::{Error, ObjectStore, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::OnceCell;

use crate::feature::Feature;

/// Name and type of a data entry
pub struct DataKey<T> {
    name: &'static str,
    _type: PhantomData<fn() -> T>,
}

impl<T> DataKey<T> {
    /// Declare a key
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _type: PhantomData,
        }
    }

    /// Key name, also the variable name exposed to templates
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T: DeserializeOwned> DataKey<T> {
    /// Read this key back from a feature
    ///
    /// Fails with `DataNotFound` when no entry for the key was wired into the
    /// feature (or its deferred producer has not run yet).
    pub fn extract(&self, feature: &Feature) -> Result<T> {
        let value = feature
            .data_value(self.name)
            .ok_or_else(|| Error::data_not_found(feature.name(), self.name))?;
        serde_json::from_value(value).map_err(|e| {
            Error::serialization(format!(
                "data '{}' in feature '{}' has unexpected shape: {}",
                self.name,
                feature.name(),
                e
            ))
        })
    }
}

impl<T> Clone for DataKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for DataKey<T> {}

impl<T> std::fmt::Debug for DataKey<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DataKey").field(&self.name).finish()
    }
}

type Producer = Box<dyn Fn(Arc<dyn ObjectStore>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

enum DataSource {
    Value(Value),
    Invalid(String),
    Deferred {
        cell: OnceCell<Value>,
        produce: Producer,
    },
}

/// A populated data key
#[derive(Clone)]
pub struct DataEntry {
    key: &'static str,
    source: Arc<DataSource>,
}

impl DataEntry {
    /// Entry with an already-built value
    pub fn value<T: Serialize>(key: &DataKey<T>, value: T) -> Self {
        let source = match serde_json::to_value(&value) {
            Ok(v) => DataSource::Value(v),
            Err(e) => DataSource::Invalid(e.to_string()),
        };
        Self {
            key: key.name(),
            source: Arc::new(source),
        }
    }

    /// Entry computed on first resolution and shared by every clone
    pub fn deferred<T, F, Fut>(key: &DataKey<T>, producer: F) -> Self
    where
        T: Serialize + Send + 'static,
        F: Fn(Arc<dyn ObjectStore>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let name = key.name();
        let produce: Producer = Box::new(move |store| -> BoxFuture<'static, Result<Value>> {
            let fut = producer(store);
            Box::pin(async move {
                let value = fut.await?;
                serde_json::to_value(&value).map_err(|e| {
                    Error::serialization(format!("data '{name}' cannot be serialized: {e}"))
                })
            })
        });
        Self {
            key: name,
            source: Arc::new(DataSource::Deferred {
                cell: OnceCell::new(),
                produce,
            }),
        }
    }

    /// Key this entry populates
    pub fn key(&self) -> &'static str {
        self.key
    }

    /// Value if it is known without running a producer
    pub(crate) fn ready_value(&self) -> Option<Value> {
        match self.source.as_ref() {
            DataSource::Value(v) => Some(v.clone()),
            DataSource::Deferred { cell, .. } => cell.get().cloned(),
            DataSource::Invalid(_) => None,
        }
    }

    /// Compute the value, running the deferred producer at most once
    pub(crate) async fn resolve(&self, store: Arc<dyn ObjectStore>) -> Result<Value> {
        match self.source.as_ref() {
            DataSource::Value(v) => Ok(v.clone()),
            DataSource::Invalid(msg) => Err(Error::serialization(format!(
                "data '{}' cannot be serialized: {}",
                self.key, msg
            ))),
            DataSource::Deferred { cell, produce } => cell
                .get_or_try_init(|| produce(store))
                .await
                .cloned(),
        }
    }
}

impl std::fmt::Debug for DataEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.source.as_ref() {
            DataSource::Value(_) => "value",
            DataSource::Invalid(_) => "invalid",
            DataSource::Deferred { .. } => "deferred",
        };
        f.debug_struct("DataEntry")
            .field("key", &self.key)
            .field("source", &kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plinth_common::store::MemoryStore;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Descriptor {
        name: String,
    }

    const DESCRIPTOR: DataKey<Descriptor> = DataKey::new("descriptor");

    fn store() -> Arc<dyn ObjectStore> {
        Arc::new(MemoryStore::new())
    }

    #[tokio::test]
    async fn value_entry_resolves_immediately() {
        let entry = DataEntry::value(
            &DESCRIPTOR,
            Descriptor {
                name: "basic".to_string(),
            },
        );
        assert_eq!(entry.key(), "descriptor");
        assert_eq!(entry.ready_value().unwrap()["name"], "basic");
        assert_eq!(entry.resolve(store()).await.unwrap()["name"], "basic");
    }

    /// Story: a descriptor shared by several features is produced once
    #[tokio::test]
    async fn story_cloned_deferred_entry_resolves_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let entry = DataEntry::deferred(&DESCRIPTOR, move |_store| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Descriptor {
                    name: "shared".to_string(),
                })
            }
        });
        let other = entry.clone();

        assert!(entry.ready_value().is_none());
        entry.resolve(store()).await.unwrap();
        let value = other.resolve(store()).await.unwrap();

        assert_eq!(value["name"], "shared");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(other.ready_value().is_some());
    }

    #[tokio::test]
    async fn failed_deferred_entry_can_retry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let entry = DataEntry::deferred(&DESCRIPTOR, move |_store| {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(Error::internal("cluster unreachable"))
                } else {
                    Ok(Descriptor {
                        name: "late".to_string(),
                    })
                }
            }
        });

        assert!(entry.resolve(store()).await.is_err());
        assert_eq!(entry.resolve(store()).await.unwrap()["name"], "late");
    }
}
