#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use k8s_openapi::{
    ByteString,
    api::core::v1::{ObjectReference, Secret},
};
use kube::{api::ObjectMeta, runtime::events::EventType};
use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, IsCa, KeyPair,
    KeyUsagePurpose,
};

use controller::{
    api::{
        BackupConfig, CLUSTER_BACKUP_FEATURE, Cluster, ClusterAddress,
        ClusterBackupStorageLocation, ClusterBackupStorageLocationSpec, ClusterSpec,
        ClusterStatus, PROJECT_ID_LABEL,
    },
    config::ControllerConfig,
    events::EventPublisher,
    reconcilers::{Settings, cluster_backup::ClusterBackupReconciler},
    resolver::{RemoteClusterResolver, StaticResolver},
    resources::{
        kubeconfig::{CA_CERT_KEY, CA_KEY_KEY, CA_SECRET_NAME},
        seed_cluster::{ACCESS_KEY_ID_KEY, SECRET_ACCESS_KEY_KEY},
    },
    store::memory::MemoryObjectStore,
    velero::{BackupStorageLocationSpec, CredentialRef, ObjectStorageLocation},
};

pub const CLUSTER: &str = "cluster-1";
pub const PROJECT: &str = "proj-7";
pub const BOUND_NAMESPACE: &str = "cluster-cluster-1";
pub const CONFIG_NAMESPACE: &str = "kubermatic";
pub const LOCATION: &str = "s3";
pub const CREDENTIALS: &str = "s3-credentials";

#[derive(Clone, Debug)]
pub struct RecordedEvent {
    pub object: Option<String>,
    pub type_: EventType,
    pub reason: String,
    pub note: Option<String>,
}

#[derive(Default)]
pub struct RecordingEventPublisher {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventPublisher {
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        note: Option<String>,
    ) {
        self.events.lock().push(RecordedEvent {
            object: resource_ref.name.clone(),
            type_,
            reason: reason.to_string(),
            note,
        });
    }
}

pub fn ca() -> (String, String) {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String("root-ca".to_string()));
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let key = KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();
    (cert.pem(), key.serialize_pem())
}

pub fn secret(namespace: &str, name: &str, data: &[(&str, &str)]) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(
            data.iter()
                .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                .collect(),
        ),
        ..Default::default()
    }
}

/// A bound cluster with backups switched on and pointed at [`LOCATION`].
pub fn cluster() -> Cluster {
    Cluster {
        metadata: ObjectMeta {
            name: Some(CLUSTER.to_string()),
            labels: Some([(PROJECT_ID_LABEL.to_string(), PROJECT.to_string())].into()),
            ..Default::default()
        },
        spec: ClusterSpec {
            features: [(CLUSTER_BACKUP_FEATURE.to_string(), true)].into(),
            backup_config: Some(BackupConfig {
                location_ref: LOCATION.to_string(),
            }),
            ..Default::default()
        },
        status: Some(ClusterStatus {
            bound_namespace: BOUND_NAMESPACE.to_string(),
            address: Some(ClusterAddress {
                internal_url: "https://apiserver-external.cluster-cluster-1.svc:6443".to_string(),
            }),
            ..Default::default()
        }),
    }
}

pub fn location() -> ClusterBackupStorageLocation {
    let mut cbsl = ClusterBackupStorageLocation::new(
        LOCATION,
        ClusterBackupStorageLocationSpec {
            location: BackupStorageLocationSpec {
                provider: "aws".to_string(),
                object_storage: ObjectStorageLocation {
                    bucket: "b".to_string(),
                    ..Default::default()
                },
                config: [("region".to_string(), "eu-central-1".to_string())].into(),
                credential: Some(CredentialRef {
                    name: CREDENTIALS.to_string(),
                    key: "cloud".to_string(),
                }),
                default: false,
                ..Default::default()
            },
        },
    );
    cbsl.metadata.namespace = Some(CONFIG_NAMESPACE.to_string());
    cbsl
}

pub struct Harness {
    pub seed: Arc<MemoryObjectStore>,
    pub user: Arc<MemoryObjectStore>,
    pub events: Arc<RecordingEventPublisher>,
    pub reconciler: ClusterBackupReconciler,
}

impl Harness {
    /// Seed store holding `cluster`, its CA, the referenced location and its
    /// credentials. The user store starts empty.
    pub fn new(cluster: Cluster) -> Self {
        let seed = Arc::new(MemoryObjectStore::new());
        let user = Arc::new(MemoryObjectStore::new());
        let events = Arc::new(RecordingEventPublisher::default());

        let (ca_cert, ca_key) = ca();
        seed.insert(&cluster).unwrap();
        seed.insert(&location()).unwrap();
        seed.insert(&secret(
            BOUND_NAMESPACE,
            CA_SECRET_NAME,
            &[(CA_CERT_KEY, ca_cert.as_str()), (CA_KEY_KEY, ca_key.as_str())],
        ))
        .unwrap();
        seed.insert(&secret(
            CONFIG_NAMESPACE,
            CREDENTIALS,
            &[(ACCESS_KEY_ID_KEY, "AKID"), (SECRET_ACCESS_KEY_KEY, "SECRET")],
        ))
        .unwrap();

        let reconciler = ClusterBackupReconciler::new(
            seed.clone(),
            Arc::new(StaticResolver::new(user.clone())),
            events.clone(),
            Settings::default(),
        );
        Self {
            seed,
            user,
            events,
            reconciler,
        }
    }

    pub fn resolver(&self) -> Arc<dyn RemoteClusterResolver> {
        Arc::new(StaticResolver::new(self.user.clone()))
    }

    /// A fresh reconciler over the harness stores reaching the user cluster
    /// through `resolver`.
    pub fn reconciler_with(&self, resolver: Arc<dyn RemoteClusterResolver>) -> ClusterBackupReconciler {
        ClusterBackupReconciler::new(
            self.seed.clone(),
            resolver,
            self.events.clone(),
            Settings::default(),
        )
    }

    pub fn cluster(&self) -> Cluster {
        self.seed.object::<Cluster>(None, CLUSTER).unwrap()
    }
}

/// Defaults with millisecond retries.
pub fn config() -> ControllerConfig {
    let settings = Settings::default();
    ControllerConfig {
        workers: 2,
        worker_name: settings.worker_name,
        namespace: settings.namespace,
        velero_image: settings.images.velero,
        velero_aws_plugin_image: settings.images.aws_plugin,
        backoff_base_ms: 10,
        backoff_max_secs: 1,
        resync_secs: 300,
        reconcile_timeout_secs: 5,
        enable_cluster_backup: true,
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
