//! Remote cluster client resolution
//!
//! Resolves the object store of a cluster's own API server from the admin
//! kubeconfig kept in its seed namespace.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    Client, Config, ResourceExt,
    config::{KubeConfigOptions, Kubeconfig},
};
use tracing::debug;

use crate::{
    Error, Result,
    api::Cluster,
    store::{self, KubeObjectStore, ObjectStore},
};

/// Seed secret holding the admin kubeconfig of a user cluster.
pub const ADMIN_KUBECONFIG_SECRET_NAME: &str = "admin-kubeconfig";
pub const KUBECONFIG_SECRET_KEY: &str = "kubeconfig";

#[async_trait]
pub trait RemoteClusterResolver: Send + Sync {
    /// A store bound to the cluster's own API server. Failures are transient.
    async fn resolve(&self, cluster: &Cluster) -> Result<Arc<dyn ObjectStore>>;

    /// Drop anything held for a cluster that is gone or going away.
    fn forget(&self, _cluster: &str) {}
}

/// Builds clients from the seed's admin kubeconfig secrets.
///
/// Clients are cached per cluster and rebuilt when the secret's resource
/// version changes.
pub struct KubeconfigResolver {
    seed: Arc<dyn ObjectStore>,
    clients: DashMap<String, (String, Arc<dyn ObjectStore>)>,
}

impl KubeconfigResolver {
    pub fn new(seed: Arc<dyn ObjectStore>) -> Self {
        Self {
            seed,
            clients: DashMap::new(),
        }
    }
}

fn remote_error(cluster: &Cluster, message: impl Into<String>) -> Error {
    Error::RemoteCluster {
        cluster: cluster.name_any(),
        message: message.into(),
    }
}

#[async_trait]
impl RemoteClusterResolver for KubeconfigResolver {
    async fn resolve(&self, cluster: &Cluster) -> Result<Arc<dyn ObjectStore>> {
        let namespace = cluster
            .bound_namespace()
            .ok_or_else(|| remote_error(cluster, "cluster has no namespace yet"))?;

        let Some(secret) =
            store::get::<Secret>(self.seed.as_ref(), Some(namespace), ADMIN_KUBECONFIG_SECRET_NAME)
                .await?
        else {
            self.forget(&cluster.name_any());
            return Err(remote_error(
                cluster,
                format!("secret {namespace}/{ADMIN_KUBECONFIG_SECRET_NAME} not found"),
            ));
        };
        let version = secret.resource_version().unwrap_or_default();

        if let Some(cached) = self.clients.get(&cluster.name_any()) {
            if cached.0 == version {
                return Ok(Arc::clone(&cached.1));
            }
        }

        let raw = secret
            .data
            .as_ref()
            .and_then(|d| d.get(KUBECONFIG_SECRET_KEY))
            .ok_or_else(|| remote_error(cluster, "admin kubeconfig secret has no kubeconfig key"))?;
        let yaml = String::from_utf8(raw.0.clone())
            .map_err(|e| remote_error(cluster, format!("kubeconfig is not UTF-8: {e}")))?;
        let kubeconfig = Kubeconfig::from_yaml(&yaml)
            .map_err(|e| remote_error(cluster, format!("invalid kubeconfig: {e}")))?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| remote_error(cluster, format!("invalid kubeconfig: {e}")))?;
        let client = Client::try_from(config)
            .map_err(|e| remote_error(cluster, format!("failed to build client: {e}")))?;

        debug!(cluster = %cluster.name_any(), "Built user cluster client");
        let remote: Arc<dyn ObjectStore> = Arc::new(KubeObjectStore::new(client));
        self.clients
            .insert(cluster.name_any(), (version, Arc::clone(&remote)));
        Ok(remote)
    }

    fn forget(&self, cluster: &str) {
        if self.clients.remove(cluster).is_some() {
            debug!(cluster, "Dropped user cluster client");
        }
    }
}

/// Resolves every cluster to the same store.
pub struct StaticResolver {
    store: Arc<dyn ObjectStore>,
}

impl StaticResolver {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RemoteClusterResolver for StaticResolver {
    async fn resolve(&self, _cluster: &Cluster) -> Result<Arc<dyn ObjectStore>> {
        Ok(Arc::clone(&self.store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ClusterStatus;
    use crate::store::memory::MemoryObjectStore;
    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;

    fn cluster() -> Cluster {
        Cluster {
            metadata: ObjectMeta {
                name: Some("cluster-1".to_string()),
                ..Default::default()
            },
            spec: Default::default(),
            status: Some(ClusterStatus {
                bound_namespace: "cluster-1-ns".to_string(),
                ..Default::default()
            }),
        }
    }

    #[tokio::test]
    async fn missing_secret_is_a_remote_error() {
        let seed = Arc::new(MemoryObjectStore::new());
        let resolver = KubeconfigResolver::new(seed);

        let err = resolver.resolve(&cluster()).await.err().unwrap();
        assert!(matches!(err, Error::RemoteCluster { .. }));
        assert!(err.to_string().contains("admin-kubeconfig"));
    }

    #[tokio::test]
    async fn malformed_kubeconfig_is_a_remote_error() {
        let seed = Arc::new(MemoryObjectStore::new());
        seed.insert(&Secret {
            metadata: ObjectMeta {
                name: Some(ADMIN_KUBECONFIG_SECRET_NAME.to_string()),
                namespace: Some("cluster-1-ns".to_string()),
                ..Default::default()
            },
            data: Some([(KUBECONFIG_SECRET_KEY.to_string(), ByteString(b": [".to_vec()))].into()),
            ..Default::default()
        })
        .unwrap();
        let resolver = KubeconfigResolver::new(seed);

        let err = resolver.resolve(&cluster()).await.err().unwrap();
        assert!(err.to_string().contains("invalid kubeconfig"));
    }

    fn admin_kubeconfig(server: &str) -> Secret {
        let kubeconfig = format!(
            "apiVersion: v1
kind: Config
clusters:
- name: c
  cluster:
    server: {server}
users:
- name: admin
  user:
    token: t
contexts:
- name: c
  context:
    cluster: c
    user: admin
current-context: c
"
        );
        Secret {
            metadata: ObjectMeta {
                name: Some(ADMIN_KUBECONFIG_SECRET_NAME.to_string()),
                namespace: Some("cluster-1-ns".to_string()),
                ..Default::default()
            },
            data: Some(
                [(KUBECONFIG_SECRET_KEY.to_string(), ByteString(kubeconfig.into_bytes()))].into(),
            ),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn clients_are_cached_until_the_secret_changes() {
        let seed = Arc::new(MemoryObjectStore::new());
        seed.insert(&admin_kubeconfig("http://127.0.0.1:6443")).unwrap();
        let resolver = KubeconfigResolver::new(seed.clone());

        let first = resolver.resolve(&cluster()).await.unwrap();
        let second = resolver.resolve(&cluster()).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        seed.insert(&admin_kubeconfig("http://127.0.0.2:6443")).unwrap();
        let third = resolver.resolve(&cluster()).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(resolver.clients.len(), 1);
    }

    #[tokio::test]
    async fn removed_secret_evicts_the_cached_client() {
        let seed = Arc::new(MemoryObjectStore::new());
        seed.insert(&admin_kubeconfig("http://127.0.0.1:6443")).unwrap();
        let resolver = KubeconfigResolver::new(seed.clone());
        resolver.resolve(&cluster()).await.unwrap();
        assert_eq!(resolver.clients.len(), 1);

        seed.remove::<Secret>(Some("cluster-1-ns"), ADMIN_KUBECONFIG_SECRET_NAME);
        assert!(resolver.resolve(&cluster()).await.is_err());
        assert!(resolver.clients.is_empty());
    }

    #[tokio::test]
    async fn forget_evicts_the_cached_client() {
        let seed = Arc::new(MemoryObjectStore::new());
        seed.insert(&admin_kubeconfig("http://127.0.0.1:6443")).unwrap();
        let resolver = KubeconfigResolver::new(seed);
        resolver.resolve(&cluster()).await.unwrap();

        resolver.forget("cluster-1");
        assert!(resolver.clients.is_empty());
    }

    #[tokio::test]
    async fn unbound_cluster_cannot_be_resolved() {
        let resolver = KubeconfigResolver::new(Arc::new(MemoryObjectStore::new()));
        let mut c = cluster();
        c.status = None;
        assert!(resolver.resolve(&c).await.is_err());
    }
}
