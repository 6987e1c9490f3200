//! In-memory [`ObjectStore`] backend
//!
//! Keeps objects in a map, assigns resource versions, records every call and
//! supports injected failures. Used to drive the controller without an API
//! server.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::{StreamExt, stream::{self, BoxStream}};
use kube::{
    Resource,
    api::{ApiResource, DynamicObject},
    runtime::watcher::Event,
};
use parking_lot::Mutex;
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use super::{ObjectKey, ObjectStore, StoreError, decode, encode};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    Get,
    List,
    Create,
    Update,
    PatchStatus,
}

impl Verb {
    pub fn is_write(self) -> bool {
        matches!(self, Verb::Create | Verb::Update | Verb::PatchStatus)
    }
}

/// One call made against the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    pub verb: Verb,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

struct Failure {
    verb: Verb,
    kind: String,
    name: Option<String>,
    message: String,
}

type StoredKey = (String, String, String, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<StoredKey, DynamicObject>,
    next_version: u64,
    calls: Vec<Call>,
    failures: Vec<Failure>,
}

impl State {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    fn check(&self, verb: Verb, kind: &str, name: &str) -> Result<(), StoreError> {
        match self.failures.iter().find(|f| {
            f.verb == verb && f.kind == kind && f.name.as_deref().is_none_or(|n| n == name)
        }) {
            Some(f) => Err(StoreError::Unavailable(f.message.clone())),
            None => Ok(()),
        }
    }
}

pub struct MemoryObjectStore {
    state: Mutex<State>,
    events: broadcast::Sender<Event<DynamicObject>>,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

fn stored_key(resource: &ApiResource, namespace: Option<&str>, name: &str) -> StoredKey {
    (
        resource.api_version.clone(),
        resource.kind.clone(),
        namespace.unwrap_or_default().to_string(),
        name.to_string(),
    )
}

fn label(key: &StoredKey) -> String {
    if key.2.is_empty() {
        format!("{} {}", key.1, key.3)
    } else {
        format!("{} {}/{}", key.1, key.2, key.3)
    }
}

fn merge_patch(target: &mut serde_json::Value, patch: &serde_json::Value) {
    match patch {
        serde_json::Value::Object(fields) => {
            if !target.is_object() {
                *target = serde_json::Value::Object(Default::default());
            }
            if let serde_json::Value::Object(existing) = target {
                for (k, v) in fields {
                    if v.is_null() {
                        existing.remove(k);
                    } else {
                        merge_patch(existing.entry(k.clone()).or_insert(serde_json::Value::Null), v);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(State::default()),
            events,
        }
    }

    /// Seed an object without recording a call.
    pub fn insert<K>(&self, object: &K) -> Result<(), StoreError>
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        let resource = ApiResource::erase::<K>(&());
        let mut dynamic = encode(object)?;
        let name = dynamic
            .metadata
            .name
            .clone()
            .ok_or_else(|| StoreError::Invalid(format!("{} without a name", resource.kind)))?;
        let key = stored_key(&resource, dynamic.metadata.namespace.as_deref(), &name);
        {
            let mut state = self.state.lock();
            dynamic.metadata.resource_version = Some(state.bump());
            state.objects.insert(key, dynamic.clone());
        }
        let _ = self.events.send(Event::Apply(dynamic));
        Ok(())
    }

    pub fn remove<K: Resource<DynamicType = ()>>(&self, namespace: Option<&str>, name: &str) {
        let key = stored_key(&ApiResource::erase::<K>(&()), namespace, name);
        let removed = self.state.lock().objects.remove(&key);
        if let Some(object) = removed {
            let _ = self.events.send(Event::Delete(object));
        }
    }

    pub fn object<K>(&self, namespace: Option<&str>, name: &str) -> Option<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let key = stored_key(&ApiResource::erase::<K>(&()), namespace, name);
        let object = self.state.lock().objects.get(&key).cloned()?;
        decode(object).ok()
    }

    pub fn contains<K: Resource<DynamicType = ()>>(&self, namespace: Option<&str>, name: &str) -> bool {
        let key = stored_key(&ApiResource::erase::<K>(&()), namespace, name);
        self.state.lock().objects.contains_key(&key)
    }

    /// Number of stored objects of kind `K`.
    pub fn count<K: Resource<DynamicType = ()>>(&self) -> usize {
        let resource = ApiResource::erase::<K>(&());
        self.state
            .lock()
            .objects
            .keys()
            .filter(|k| k.0 == resource.api_version && k.1 == resource.kind)
            .count()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn writes(&self) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.verb.is_write()).collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Make every `verb` on `kind` (optionally only `name`) fail as unavailable.
    pub fn fail_on(&self, verb: Verb, kind: &str, name: Option<&str>, message: &str) {
        self.state.lock().failures.push(Failure {
            verb,
            kind: kind.to_string(),
            name: name.map(str::to_string),
            message: message.to_string(),
        });
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    fn record(&self, state: &mut State, verb: Verb, resource: &ApiResource, namespace: Option<&str>, name: &str) {
        state.calls.push(Call {
            verb,
            kind: resource.kind.clone(),
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        });
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>, StoreError> {
        let mut state = self.state.lock();
        self.record(&mut state, Verb::Get, &key.resource, key.namespace.as_deref(), &key.name);
        state.check(Verb::Get, &key.resource.kind, &key.name)?;
        let stored = stored_key(&key.resource, key.namespace.as_deref(), &key.name);
        Ok(state.objects.get(&stored).cloned())
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
    ) -> Result<Vec<DynamicObject>, StoreError> {
        let mut state = self.state.lock();
        self.record(&mut state, Verb::List, resource, namespace, "");
        state.check(Verb::List, &resource.kind, "")?;
        Ok(state
            .objects
            .iter()
            .filter(|(k, _)| {
                k.0 == resource.api_version
                    && k.1 == resource.kind
                    && namespace.is_none_or(|ns| k.2 == ns)
            })
            .map(|(_, o)| o.clone())
            .collect())
    }

    async fn create(
        &self,
        resource: &ApiResource,
        object: &DynamicObject,
    ) -> Result<DynamicObject, StoreError> {
        let name = object
            .metadata
            .name
            .clone()
            .ok_or_else(|| StoreError::Invalid(format!("{} without a name", resource.kind)))?;
        let namespace = object.metadata.namespace.as_deref();
        let created = {
            let mut state = self.state.lock();
            self.record(&mut state, Verb::Create, resource, namespace, &name);
            state.check(Verb::Create, &resource.kind, &name)?;
            let key = stored_key(resource, namespace, &name);
            if state.objects.contains_key(&key) {
                return Err(StoreError::AlreadyExists(label(&key)));
            }
            let mut created = object.clone();
            created.metadata.resource_version = Some(state.bump());
            state.objects.insert(key, created.clone());
            created
        };
        let _ = self.events.send(Event::Apply(created.clone()));
        Ok(created)
    }

    async fn update(
        &self,
        resource: &ApiResource,
        object: &DynamicObject,
    ) -> Result<DynamicObject, StoreError> {
        let name = object
            .metadata
            .name
            .clone()
            .ok_or_else(|| StoreError::Invalid(format!("{} without a name", resource.kind)))?;
        let namespace = object.metadata.namespace.as_deref();
        let updated = {
            let mut state = self.state.lock();
            self.record(&mut state, Verb::Update, resource, namespace, &name);
            state.check(Verb::Update, &resource.kind, &name)?;
            let key = stored_key(resource, namespace, &name);
            let Some(current) = state.objects.get(&key) else {
                return Err(StoreError::NotFound(label(&key)));
            };
            if object
                .metadata
                .resource_version
                .as_ref()
                .is_some_and(|rv| Some(rv) != current.metadata.resource_version.as_ref())
            {
                return Err(StoreError::Conflict(label(&key)));
            }
            // status is a subresource; a replace leaves it alone
            let status = current.data.get("status").cloned();
            let mut updated = object.clone();
            match (status, updated.data.as_object_mut()) {
                (Some(status), Some(data)) => {
                    data.insert("status".to_string(), status);
                }
                (None, Some(data)) => {
                    data.remove("status");
                }
                _ => {}
            }
            updated.metadata.resource_version = Some(state.bump());
            state.objects.insert(key, updated.clone());
            updated
        };
        let _ = self.events.send(Event::Apply(updated.clone()));
        Ok(updated)
    }

    async fn patch_status(
        &self,
        key: &ObjectKey,
        status: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let patched = {
            let mut state = self.state.lock();
            self.record(&mut state, Verb::PatchStatus, &key.resource, key.namespace.as_deref(), &key.name);
            state.check(Verb::PatchStatus, &key.resource.kind, &key.name)?;
            let stored = stored_key(&key.resource, key.namespace.as_deref(), &key.name);
            let version = state.bump();
            let Some(object) = state.objects.get_mut(&stored) else {
                return Err(StoreError::NotFound(label(&stored)));
            };
            if !object.data.is_object() {
                object.data = serde_json::Value::Object(Default::default());
            }
            if let Some(data) = object.data.as_object_mut() {
                merge_patch(
                    data.entry("status".to_string())
                        .or_insert(serde_json::Value::Null),
                    status,
                );
            }
            object.metadata.resource_version = Some(version);
            object.clone()
        };
        let _ = self.events.send(Event::Apply(patched));
        Ok(())
    }

    fn watch(
        &self,
        resource: &ApiResource,
    ) -> BoxStream<'static, Result<Event<DynamicObject>, StoreError>> {
        let api_version = resource.api_version.clone();
        let kind = resource.kind.clone();
        // subscribe under the lock so no write falls between listing and watching
        let (receiver, listed) = {
            let state = self.state.lock();
            let listed: Vec<DynamicObject> = state
                .objects
                .iter()
                .filter(|(k, _)| k.0 == api_version && k.1 == kind)
                .map(|(_, o)| o.clone())
                .collect();
            (self.events.subscribe(), listed)
        };

        let initial = std::iter::once(Event::Init)
            .chain(listed.into_iter().map(Event::InitApply))
            .chain(std::iter::once(Event::InitDone))
            .map(Ok);
        let changes = BroadcastStream::new(receiver).filter_map(move |event| {
            let item = match event {
                Ok(event) if is_kind(&event, &api_version, &kind) => Some(Ok(event)),
                // lagged receivers drop events; the resync picks the object up again
                _ => None,
            };
            async move { item }
        });
        stream::iter(initial).chain(changes).boxed()
    }
}

fn is_kind(event: &Event<DynamicObject>, api_version: &str, kind: &str) -> bool {
    let object = match event {
        Event::Apply(object) | Event::Delete(object) | Event::InitApply(object) => object,
        Event::Init | Event::InitDone => return false,
    };
    object
        .types
        .as_ref()
        .is_some_and(|t| t.api_version == api_version && t.kind == kind)
}
