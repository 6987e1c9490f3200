//! Velero resources inside the user cluster

use k8s_openapi::{
    api::{
        core::v1::{Namespace, ServiceAccount},
        rbac::v1::{ClusterRoleBinding, RoleRef, Subject},
    },
    apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition,
};
use kube::ResourceExt;
use serde::Deserialize;

use super::{
    APP_NAME, CLUSTER_BACKUP_NAMESPACE, CLUSTER_BACKUP_SERVICE_ACCOUNT, CLUSTER_BACKUP_USERNAME,
    CLUSTER_ROLE_BINDING_NAME, DEFAULT_BSL_NAME, base_app_labels,
};
use crate::{
    Error, Result,
    api::{Cluster, ClusterBackupStorageLocation},
    factory::{DesiredStateFactory, Factories, Scope, TypedFactory},
    velero::BackupStorageLocation,
};

const VELERO_CRDS: &str = include_str!("crds/velero.yaml");

/// All user cluster factories, in apply order.
pub fn factories(cluster: &Cluster, cbsl: &ClusterBackupStorageLocation) -> Result<Factories> {
    let mut factories = vec![
        namespace(),
        service_account(),
        cluster_role_binding(),
    ];
    factories.extend(crds()?.into_iter().map(crd));
    factories.push(backup_storage_location(cluster, cbsl));
    Ok(factories)
}

pub fn namespace() -> Box<dyn DesiredStateFactory> {
    TypedFactory::<Namespace>::existing(Scope::User, None, CLUSTER_BACKUP_NAMESPACE).boxed()
}

pub fn service_account() -> Box<dyn DesiredStateFactory> {
    TypedFactory::<ServiceAccount>::existing(
        Scope::User,
        Some(CLUSTER_BACKUP_NAMESPACE),
        CLUSTER_BACKUP_SERVICE_ACCOUNT,
    )
    .boxed()
}

pub fn cluster_role_binding() -> Box<dyn DesiredStateFactory> {
    TypedFactory::<ClusterRoleBinding>::new(Scope::User, None, CLUSTER_ROLE_BINDING_NAME, |mut crb| {
        crb.metadata.labels = Some(base_app_labels(APP_NAME));
        crb.role_ref = RoleRef {
            // too wide, but backups and restores touch every resource
            name: "cluster-admin".to_string(),
            kind: "ClusterRole".to_string(),
            api_group: "rbac.authorization.k8s.io".to_string(),
        };
        // the seed deployment authenticates with a client cert for this user
        crb.subjects = Some(vec![
            Subject {
                kind: "User".to_string(),
                name: CLUSTER_BACKUP_USERNAME.to_string(),
                api_group: Some("rbac.authorization.k8s.io".to_string()),
                ..Default::default()
            },
            Subject {
                kind: "ServiceAccount".to_string(),
                name: CLUSTER_BACKUP_SERVICE_ACCOUNT.to_string(),
                namespace: Some(CLUSTER_BACKUP_NAMESPACE.to_string()),
                ..Default::default()
            },
        ]);
        Ok(crb)
    })
    .boxed()
}

/// The CRDs velero needs, parsed from the embedded bundle.
pub fn crds() -> Result<Vec<CustomResourceDefinition>> {
    serde_yaml_ng::Deserializer::from_str(VELERO_CRDS)
        .map(CustomResourceDefinition::deserialize)
        .collect::<Result<Vec<_>, _>>()
        .map_err(Error::from)
}

pub fn crd(bundled: CustomResourceDefinition) -> Box<dyn DesiredStateFactory> {
    let name = bundled.name_any();
    TypedFactory::<CustomResourceDefinition>::new(Scope::User, None, name, move |mut crd| {
        let labels = crd.metadata.labels.get_or_insert_with(Default::default);
        labels.extend(bundled.metadata.labels.clone().unwrap_or_default());
        // the API server defaults the conversion strategy
        let conversion = crd.spec.conversion.take();
        crd.spec = bundled.spec.clone();
        if crd.spec.conversion.is_none() {
            crd.spec.conversion = conversion;
        }
        Ok(crd)
    })
    .boxed()
}

/// The default storage location, pointed at a per-cluster prefix of the
/// referenced configuration's bucket.
pub fn backup_storage_location(
    cluster: &Cluster,
    cbsl: &ClusterBackupStorageLocation,
) -> Box<dyn DesiredStateFactory> {
    let cluster_name = cluster.name_any();
    let project_id = cluster.project_id().map(str::to_string);
    let location = cbsl.spec.location.clone();

    TypedFactory::<BackupStorageLocation>::new(
        Scope::User,
        Some(CLUSTER_BACKUP_NAMESPACE),
        DEFAULT_BSL_NAME,
        move |mut bsl| {
            let project_id = project_id
                .as_deref()
                .ok_or_else(|| Error::validation(&cluster_name, "cluster ProjectID label is not set"))?;
            bsl.spec = location.clone();
            // default location, authenticating with velero's own credentials
            bsl.spec.default = true;
            bsl.spec.credential = None;
            bsl.spec.object_storage.prefix = Some(format!("{project_id}/{cluster_name}"));
            Ok(bsl)
        },
    )
    .boxed()
}
