//! Generic typed object store
//!
//! A single object-store capability keyed by [`ApiResource`], used for every
//! kind the controller reads or writes. Objects cross the trait boundary as
//! [`DynamicObject`]s; the free functions in this module are the typed codec
//! on top of it.

use std::fmt;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt, stream::BoxStream};
use kube::{
    Api, Client, Resource,
    api::{ApiResource, DynamicObject, ListParams, Patch, PatchParams, PostParams},
    runtime::{WatchStreamExt, watcher},
};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::json;
use thiserror::Error;

pub mod memory;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),
    #[error("watch error: {0}")]
    Watch(#[from] watcher::Error),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("conflict writing {0}: the object has been modified")]
    Conflict(String),
    #[error("invalid object: {0}")]
    Invalid(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        match self {
            StoreError::NotFound(_) => true,
            StoreError::Kube(kube::Error::Api(e)) => e.code == 404,
            _ => false,
        }
    }
}

/// Identity of a single object: its kind plus namespace and name.
#[derive(Clone, Debug)]
pub struct ObjectKey {
    pub resource: ApiResource,
    /// `None` for cluster-scoped kinds.
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(resource: ApiResource, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            resource,
            namespace: namespace.map(str::to_string),
            name: name.into(),
        }
    }

    pub fn of<K: Resource<DynamicType = ()>>(namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self::new(ApiResource::erase::<K>(&()), namespace, name)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.resource.kind, ns, self.name),
            None => write!(f, "{} {}", self.resource.kind, self.name),
        }
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object, `Ok(None)` if it does not exist.
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>, StoreError>;

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
    ) -> Result<Vec<DynamicObject>, StoreError>;

    async fn create(
        &self,
        resource: &ApiResource,
        object: &DynamicObject,
    ) -> Result<DynamicObject, StoreError>;

    /// Replace an existing object. The object's resource version, when set,
    /// must match the stored one.
    async fn update(
        &self,
        resource: &ApiResource,
        object: &DynamicObject,
    ) -> Result<DynamicObject, StoreError>;

    /// Merge-patch the status subresource.
    async fn patch_status(
        &self,
        key: &ObjectKey,
        status: &serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Watch events for every object of the given kind, starting with an
    /// initial listing.
    fn watch(
        &self,
        resource: &ApiResource,
    ) -> BoxStream<'static, Result<watcher::Event<DynamicObject>, StoreError>>;
}

pub fn decode<K: DeserializeOwned>(object: DynamicObject) -> Result<K, StoreError> {
    Ok(serde_json::from_value(serde_json::to_value(object)?)?)
}

pub fn encode<K: Serialize>(object: &K) -> Result<DynamicObject, StoreError> {
    Ok(serde_json::from_value(serde_json::to_value(object)?)?)
}

pub async fn get<K>(
    store: &dyn ObjectStore,
    namespace: Option<&str>,
    name: &str,
) -> Result<Option<K>, StoreError>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    store
        .get(&ObjectKey::of::<K>(namespace, name))
        .await?
        .map(decode)
        .transpose()
}

pub async fn list<K>(store: &dyn ObjectStore, namespace: Option<&str>) -> Result<Vec<K>, StoreError>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    store
        .list(&ApiResource::erase::<K>(&()), namespace)
        .await?
        .into_iter()
        .map(decode)
        .collect()
}

fn decode_event<K: DeserializeOwned>(
    event: watcher::Event<DynamicObject>,
) -> Result<watcher::Event<K>, StoreError> {
    Ok(match event {
        watcher::Event::Apply(object) => watcher::Event::Apply(decode(object)?),
        watcher::Event::Delete(object) => watcher::Event::Delete(decode(object)?),
        watcher::Event::Init => watcher::Event::Init,
        watcher::Event::InitApply(object) => watcher::Event::InitApply(decode(object)?),
        watcher::Event::InitDone => watcher::Event::InitDone,
    })
}

/// Typed watch; objects that fail to decode are surfaced as errors.
pub fn watch<K>(store: &dyn ObjectStore) -> BoxStream<'static, Result<watcher::Event<K>, StoreError>>
where
    K: Resource<DynamicType = ()> + DeserializeOwned + Send + 'static,
{
    store
        .watch(&ApiResource::erase::<K>(&()))
        .and_then(|event| async move { decode_event(event) })
        .boxed()
}

/// [`ObjectStore`] backed by a Kubernetes API server.
#[derive(Clone)]
pub struct KubeObjectStore {
    client: Client,
}

impl KubeObjectStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, resource: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, resource),
            None => Api::all_with(self.client.clone(), resource),
        }
    }
}

fn object_name(resource: &ApiResource, object: &DynamicObject) -> Result<String, StoreError> {
    object
        .metadata
        .name
        .clone()
        .ok_or_else(|| StoreError::Invalid(format!("{} without a name", resource.kind)))
}

#[async_trait]
impl ObjectStore for KubeObjectStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>, StoreError> {
        Ok(self
            .api(&key.resource, key.namespace.as_deref())
            .get_opt(&key.name)
            .await?)
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
    ) -> Result<Vec<DynamicObject>, StoreError> {
        Ok(self
            .api(resource, namespace)
            .list(&ListParams::default())
            .await?
            .items)
    }

    async fn create(
        &self,
        resource: &ApiResource,
        object: &DynamicObject,
    ) -> Result<DynamicObject, StoreError> {
        object_name(resource, object)?;
        Ok(self
            .api(resource, object.metadata.namespace.as_deref())
            .create(&PostParams::default(), object)
            .await?)
    }

    async fn update(
        &self,
        resource: &ApiResource,
        object: &DynamicObject,
    ) -> Result<DynamicObject, StoreError> {
        let name = object_name(resource, object)?;
        Ok(self
            .api(resource, object.metadata.namespace.as_deref())
            .replace(&name, &PostParams::default(), object)
            .await?)
    }

    async fn patch_status(
        &self,
        key: &ObjectKey,
        status: &serde_json::Value,
    ) -> Result<(), StoreError> {
        self.api(&key.resource, key.namespace.as_deref())
            .patch_status(
                &key.name,
                &PatchParams::default(),
                &Patch::Merge(json!({ "status": status })),
            )
            .await?;
        Ok(())
    }

    fn watch(
        &self,
        resource: &ApiResource,
    ) -> BoxStream<'static, Result<watcher::Event<DynamicObject>, StoreError>> {
        watcher(
            Api::<DynamicObject>::all_with(self.client.clone(), resource),
            watcher::Config::default(),
        )
        .default_backoff()
        .map_err(StoreError::from)
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Cluster;
    use k8s_openapi::api::core::v1::Namespace;

    #[test]
    fn key_display_includes_namespace_when_set() {
        let key = ObjectKey::of::<Namespace>(None, "velero");
        assert_eq!(key.to_string(), "Namespace velero");

        let key = ObjectKey::of::<Cluster>(Some("ns"), "c1");
        assert_eq!(key.to_string(), "Cluster ns/c1");
    }

    #[test]
    fn codec_keeps_type_meta() {
        let ns = Namespace {
            metadata: kube::api::ObjectMeta {
                name: Some("velero".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let dynamic = encode(&ns).unwrap();
        let types = dynamic.types.clone().unwrap();
        assert_eq!(types.api_version, "v1");
        assert_eq!(types.kind, "Namespace");

        let back: Namespace = decode(dynamic).unwrap();
        assert_eq!(back.metadata.name.as_deref(), Some("velero"));
    }

    #[test]
    fn typed_events_keep_their_variant() {
        let ns = Namespace {
            metadata: kube::api::ObjectMeta {
                name: Some("velero".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let event = decode_event::<Namespace>(watcher::Event::Delete(encode(&ns).unwrap())).unwrap();
        assert!(matches!(event, watcher::Event::Delete(n) if n.metadata.name.as_deref() == Some("velero")));
        assert!(matches!(
            decode_event::<Namespace>(watcher::Event::InitDone).unwrap(),
            watcher::Event::InitDone
        ));
    }

    #[test]
    fn not_found_detection() {
        assert!(StoreError::NotFound("x".to_string()).is_not_found());
        assert!(!StoreError::Unavailable("x".to_string()).is_not_found());
    }
}
