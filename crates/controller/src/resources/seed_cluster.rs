//! Velero resources in the cluster's seed namespace

use std::collections::BTreeMap;

use k8s_openapi::{
    ByteString,
    api::{
        apps::v1::Deployment,
        core::v1::{
            Container, EmptyDirVolumeSource, EnvVar, Secret, SecretVolumeSource, Volume,
            VolumeMount,
        },
    },
    apimachinery::pkg::apis::meta::v1::LabelSelector,
};
use kube::ResourceExt;
use tracing::debug;

use super::{
    APP_NAME, CLOUD_CREDENTIALS_SECRET_NAME, CLUSTER_BACKUP_NAMESPACE, CLUSTER_BACKUP_USERNAME,
    DEPLOYMENT_NAME, Images, KUBECONFIG_SECRET_NAME, base_app_labels,
    kubeconfig::{self, CA_CERT_KEY, CA_KEY_KEY, CA_SECRET_NAME, CertificateAuthority, KUBECONFIG_KEY},
};
use crate::{
    Error, Result,
    api::{Cluster, ClusterBackupStorageLocation},
    factory::{DesiredStateFactory, Factories, Scope, TypedFactory},
    store::{self, ObjectStore},
};

/// Keys in the referenced credential secret
pub const ACCESS_KEY_ID_KEY: &str = "ACCESS_KEY_ID";
pub const SECRET_ACCESS_KEY_KEY: &str = "SECRET_ACCESS_KEY";

/// Key of the AWS credentials file in the cloud-credentials secret
pub const CLOUD_CREDENTIALS_KEY: &str = "cloud";

const KUBECONFIG_MOUNT: &str = "/etc/kubernetes/kubeconfig";
const CREDENTIALS_MOUNT: &str = "/credentials";
const PLUGINS_MOUNT: &str = "/plugins";
const SCRATCH_MOUNT: &str = "/scratch";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloudCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl CloudCredentials {
    fn from_secret(secret: &Secret) -> Result<Self> {
        let value = |key: &str| {
            secret
                .data
                .as_ref()
                .and_then(|data| data.get(key))
                .map(|v| String::from_utf8_lossy(&v.0).into_owned())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| {
                    Error::Precondition(format!(
                        "credential secret {} has no {key}",
                        secret.name_any()
                    ))
                })
        };
        Ok(Self {
            access_key_id: value(ACCESS_KEY_ID_KEY)?,
            secret_access_key: value(SECRET_ACCESS_KEY_KEY)?,
        })
    }

    /// AWS shared credentials file
    pub fn render(&self) -> String {
        format!(
            "[default]\naws_access_key_id={}\naws_secret_access_key={}\n",
            self.access_key_id, self.secret_access_key
        )
    }
}

/// Everything the seed factories render from, loaded once per reconcile.
#[derive(Clone, Debug)]
pub struct TemplateData {
    pub cluster_name: String,
    pub namespace: String,
    pub api_server_url: String,
    pub ca: CertificateAuthority,
    pub credentials: Option<CloudCredentials>,
    pub images: Images,
}

impl TemplateData {
    pub async fn resolve(
        seed: &dyn ObjectStore,
        cluster: &Cluster,
        cbsl: &ClusterBackupStorageLocation,
        images: &Images,
    ) -> Result<Self> {
        let cluster_name = cluster.name_any();
        let namespace = cluster
            .bound_namespace()
            .ok_or_else(|| Error::Precondition(format!("cluster {cluster_name} has no namespace")))?
            .to_string();
        let api_server_url = cluster
            .status
            .as_ref()
            .and_then(|s| s.address.as_ref())
            .map(|a| a.internal_url.clone())
            .filter(|url| !url.is_empty())
            .ok_or_else(|| {
                Error::Precondition(format!("cluster {cluster_name} has no internal address yet"))
            })?;

        let ca_secret = store::get::<Secret>(seed, Some(&namespace), CA_SECRET_NAME)
            .await?
            .ok_or_else(|| {
                Error::Precondition(format!("CA secret {namespace}/{CA_SECRET_NAME} not found"))
            })?;
        let ca = CertificateAuthority::new(
            secret_value(&ca_secret, CA_CERT_KEY)?,
            secret_value(&ca_secret, CA_KEY_KEY)?,
        );

        let credentials = match &cbsl.spec.location.credential {
            Some(credential) => {
                let config_namespace = cbsl.namespace().unwrap_or_default();
                let secret = store::get::<Secret>(seed, Some(&config_namespace), &credential.name)
                    .await?
                    .ok_or_else(|| {
                        Error::Precondition(format!(
                            "credential secret {config_namespace}/{} not found",
                            credential.name
                        ))
                    })?;
                Some(CloudCredentials::from_secret(&secret)?)
            }
            None => None,
        };

        Ok(Self {
            cluster_name,
            namespace,
            api_server_url,
            ca,
            credentials,
            images: images.clone(),
        })
    }
}

fn secret_value(secret: &Secret, key: &str) -> Result<String> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|v| String::from_utf8_lossy(&v.0).into_owned())
        .ok_or_else(|| Error::Precondition(format!("secret {} has no {key}", secret.name_any())))
}

/// All seed factories, in apply order.
pub fn factories(data: &TemplateData) -> Factories {
    let mut factories = vec![kubeconfig_secret(data)];
    if let Some(credentials) = &data.credentials {
        factories.push(cloud_credentials_secret(&data.namespace, credentials));
    }
    factories.push(deployment(data));
    factories
}

pub fn kubeconfig_secret(data: &TemplateData) -> Box<dyn DesiredStateFactory> {
    let data = data.clone();
    let namespace = data.namespace.clone();
    TypedFactory::<Secret>::new(
        Scope::Seed,
        Some(&namespace),
        KUBECONFIG_SECRET_NAME,
        move |mut secret| {
            let current = secret
                .data
                .as_ref()
                .and_then(|d| d.get(KUBECONFIG_KEY))
                .is_some_and(|existing| {
                    kubeconfig::is_current(
                        &existing.0,
                        &data.api_server_url,
                        &data.ca,
                        CLUSTER_BACKUP_USERNAME,
                    )
                });
            if !current {
                debug!(cluster = %data.cluster_name, "Issuing velero kubeconfig");
                let config = kubeconfig::generate(
                    &data.cluster_name,
                    &data.api_server_url,
                    &data.ca,
                    CLUSTER_BACKUP_USERNAME,
                )?;
                secret
                    .data
                    .get_or_insert_with(BTreeMap::new)
                    .insert(KUBECONFIG_KEY.to_string(), ByteString(config.into_bytes()));
            }
            Ok(secret)
        },
    )
    .boxed()
}

pub fn cloud_credentials_secret(
    namespace: &str,
    credentials: &CloudCredentials,
) -> Box<dyn DesiredStateFactory> {
    let file = credentials.render();
    TypedFactory::<Secret>::new(
        Scope::Seed,
        Some(namespace),
        CLOUD_CREDENTIALS_SECRET_NAME,
        move |mut secret| {
            secret.data = Some(
                [(
                    CLOUD_CREDENTIALS_KEY.to_string(),
                    ByteString(file.clone().into_bytes()),
                )]
                .into(),
            );
            Ok(secret)
        },
    )
    .boxed()
}

fn env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

fn secret_volume(name: &str, secret: &str) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret.to_string()),
            default_mode: Some(0o644),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// `desired` on top of the served container of the same name.
fn merge_container(served: &[Container], desired: Container) -> Container {
    match served.iter().find(|c| c.name == desired.name) {
        Some(current) => Container {
            image: desired.image,
            command: desired.command,
            args: desired.args,
            env: desired.env,
            volume_mounts: desired.volume_mounts,
            ..current.clone()
        },
        None => desired,
    }
}

fn empty_dir(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

pub fn deployment(data: &TemplateData) -> Box<dyn DesiredStateFactory> {
    let images = data.images.clone();
    let with_credentials = data.credentials.is_some();

    TypedFactory::<Deployment>::new(Scope::Seed, Some(&data.namespace), DEPLOYMENT_NAME, move |mut deployment| {
        let labels = base_app_labels(APP_NAME);
        deployment
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .extend(labels.clone());

        let mut env_vars = vec![
            env("VELERO_SCRATCH_DIR", SCRATCH_MOUNT),
            env("VELERO_NAMESPACE", CLUSTER_BACKUP_NAMESPACE),
            env("LD_LIBRARY_PATH", PLUGINS_MOUNT),
        ];
        let mut mounts = vec![
            mount("kubeconfig", KUBECONFIG_MOUNT),
            mount("plugins", PLUGINS_MOUNT),
            mount("scratch", SCRATCH_MOUNT),
        ];
        let mut volumes = vec![
            secret_volume("kubeconfig", KUBECONFIG_SECRET_NAME),
            empty_dir("plugins"),
            empty_dir("scratch"),
        ];
        if with_credentials {
            env_vars.push(env(
                "AWS_SHARED_CREDENTIALS_FILE",
                &format!("{CREDENTIALS_MOUNT}/{CLOUD_CREDENTIALS_KEY}"),
            ));
            mounts.push(mount("cloud-credentials", CREDENTIALS_MOUNT));
            volumes.push(secret_volume("cloud-credentials", CLOUD_CREDENTIALS_SECRET_NAME));
        }

        let velero = Container {
            name: "velero".to_string(),
            image: Some(images.velero.clone()),
            command: Some(vec!["/velero".to_string()]),
            args: Some(vec![
                "server".to_string(),
                format!("--namespace={CLUSTER_BACKUP_NAMESPACE}"),
                format!("--kubeconfig={KUBECONFIG_MOUNT}/{KUBECONFIG_KEY}"),
            ]),
            env: Some(env_vars),
            volume_mounts: Some(mounts),
            ..Default::default()
        };
        let aws_plugin = Container {
            name: "velero-plugin-for-aws".to_string(),
            image: Some(images.aws_plugin.clone()),
            volume_mounts: Some(vec![mount("plugins", "/target")]),
            ..Default::default()
        };

        // start from the served spec so API server defaults are not drift
        let mut spec = deployment.spec.take().unwrap_or_default();
        spec.replicas = Some(1);
        spec.selector = LabelSelector {
            match_labels: Some(labels.clone()),
            ..Default::default()
        };
        let mut template_metadata = spec.template.metadata.take().unwrap_or_default();
        template_metadata.labels = Some(labels);
        spec.template.metadata = Some(template_metadata);

        let mut pod = spec.template.spec.take().unwrap_or_default();
        pod.init_containers = Some(vec![merge_container(
            pod.init_containers.as_deref().unwrap_or_default(),
            aws_plugin,
        )]);
        pod.containers = vec![merge_container(&pod.containers, velero)];
        pod.volumes = Some(volumes);
        spec.template.spec = Some(pod);

        deployment.spec = Some(spec);
        Ok(deployment)
    })
    .boxed()
}
