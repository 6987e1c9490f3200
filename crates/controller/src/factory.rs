use std::fmt;

use kube::{
    Resource,
    api::{ApiResource, DynamicObject},
};
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    Result,
    store::{self, ObjectKey},
};

/// Which cluster a derived resource lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    /// The seed cluster hosting the control plane.
    Seed,
    /// The user cluster the primary object manages.
    User,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Scope::Seed => "seed",
            Scope::User => "user",
        })
    }
}

/// Produces the desired content of one derived resource.
///
/// Identity (kind, namespace, name, scope) is fixed at construction; `build`
/// only decides content, starting from the current object when one exists.
pub trait DesiredStateFactory: Send + Sync {
    fn resource(&self) -> &ApiResource;

    fn scope(&self) -> Scope;

    fn key(&self) -> ObjectKey;

    fn build(&self, existing: Option<&DynamicObject>) -> Result<DynamicObject>;

    /// `object` as `build` sees it: fields the resource type does not model
    /// are dropped. Comparing this against `build`'s output tells whether the
    /// factory changed anything.
    fn normalize(&self, object: &DynamicObject) -> Result<DynamicObject>;
}

pub type Factories = Vec<Box<dyn DesiredStateFactory>>;

type Mutate<K> = Box<dyn Fn(K) -> Result<K> + Send + Sync>;

/// A factory over a concrete resource type `K`.
pub struct TypedFactory<K> {
    resource: ApiResource,
    scope: Scope,
    namespace: Option<String>,
    name: String,
    mutate: Mutate<K>,
}

impl<K> TypedFactory<K>
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned + Default + 'static,
{
    pub fn new(
        scope: Scope,
        namespace: Option<&str>,
        name: impl Into<String>,
        mutate: impl Fn(K) -> Result<K> + Send + Sync + 'static,
    ) -> Self {
        Self {
            resource: ApiResource::erase::<K>(&()),
            scope,
            namespace: namespace.map(str::to_string),
            name: name.into(),
            mutate: Box::new(mutate),
        }
    }

    /// A factory that only ensures the object exists.
    pub fn existing(scope: Scope, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self::new(scope, namespace, name, Ok)
    }

    pub fn boxed(self) -> Box<dyn DesiredStateFactory> {
        Box::new(self)
    }

    fn pin_identity(&self, object: &mut K) {
        let meta = object.meta_mut();
        meta.name = Some(self.name.clone());
        meta.namespace = self.namespace.clone();
    }
}

impl<K> DesiredStateFactory for TypedFactory<K>
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned + Default + 'static,
{
    fn resource(&self) -> &ApiResource {
        &self.resource
    }

    fn scope(&self) -> Scope {
        self.scope
    }

    fn key(&self) -> ObjectKey {
        ObjectKey::new(self.resource.clone(), self.namespace.as_deref(), self.name.clone())
    }

    fn build(&self, existing: Option<&DynamicObject>) -> Result<DynamicObject> {
        let mut object = match existing {
            Some(existing) => store::decode::<K>(existing.clone())?,
            None => K::default(),
        };
        self.pin_identity(&mut object);
        let mut object = (self.mutate)(object)?;
        self.pin_identity(&mut object);
        Ok(store::encode(&object)?)
    }

    fn normalize(&self, object: &DynamicObject) -> Result<DynamicObject> {
        Ok(store::encode(&store::decode::<K>(object.clone())?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ServiceAccount;

    #[test]
    fn build_from_empty_sets_identity() {
        let factory = TypedFactory::<ServiceAccount>::existing(Scope::User, Some("velero"), "velero");
        let object = factory.build(None).unwrap();

        assert_eq!(object.metadata.name.as_deref(), Some("velero"));
        assert_eq!(object.metadata.namespace.as_deref(), Some("velero"));
        assert_eq!(object.types.unwrap().kind, "ServiceAccount");
    }

    #[test]
    fn mutate_cannot_rename() {
        let factory = TypedFactory::<ServiceAccount>::new(Scope::User, Some("velero"), "velero", |mut sa| {
            sa.metadata.name = Some("other".to_string());
            sa.automount_service_account_token = Some(false);
            Ok(sa)
        });
        let object = factory.build(None).unwrap();

        assert_eq!(object.metadata.name.as_deref(), Some("velero"));
        assert_eq!(object.data["automountServiceAccountToken"], false);
    }

    #[test]
    fn normalize_drops_unmodelled_fields() {
        let mut existing = store::encode(&ServiceAccount {
            metadata: kube::api::ObjectMeta {
                name: Some("velero".to_string()),
                namespace: Some("velero".to_string()),
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();
        existing.data["unknownField"] = "x".into();

        let factory = TypedFactory::<ServiceAccount>::existing(Scope::User, Some("velero"), "velero");
        let normalized = factory.normalize(&existing).unwrap();
        assert!(normalized.data.get("unknownField").is_none());
        assert_eq!(normalized.data, factory.build(Some(&existing)).unwrap().data);
    }

    #[test]
    fn build_starts_from_existing() {
        let existing = store::encode(&ServiceAccount {
            metadata: kube::api::ObjectMeta {
                name: Some("velero".to_string()),
                namespace: Some("velero".to_string()),
                resource_version: Some("7".to_string()),
                labels: Some([("keep".to_string(), "me".to_string())].into()),
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();

        let factory = TypedFactory::<ServiceAccount>::existing(Scope::User, Some("velero"), "velero");
        let object = factory.build(Some(&existing)).unwrap();

        assert_eq!(object.metadata.resource_version.as_deref(), Some("7"));
        assert_eq!(object.metadata.labels.unwrap()["keep"], "me");
    }
}
