use std::collections::BTreeMap;

pub mod kubeconfig;
pub mod seed_cluster;
pub mod user_cluster;

/// Namespace for velero resources in the user cluster
pub const CLUSTER_BACKUP_NAMESPACE: &str = "velero";
pub const CLUSTER_BACKUP_SERVICE_ACCOUNT: &str = "velero";
pub const CLUSTER_ROLE_BINDING_NAME: &str = "velero";
pub const DEFAULT_BSL_NAME: &str = "default-cluster-backup-bsl";

/// Seed secret with the kubeconfig velero uses to reach the user cluster
pub const KUBECONFIG_SECRET_NAME: &str = "velero-kubeconfig";
pub const CLOUD_CREDENTIALS_SECRET_NAME: &str = "velero-cloud-credentials";
pub const DEPLOYMENT_NAME: &str = "velero";

/// User the velero kubeconfig authenticates as
pub const CLUSTER_BACKUP_USERNAME: &str = "velero";

const APP_NAME: &str = "velero";

pub fn base_app_labels(app: &str) -> BTreeMap<String, String> {
    [("app".to_string(), app.to_string())].into()
}

/// Container images for the seed deployment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Images {
    pub velero: String,
    pub aws_plugin: String,
}

impl Default for Images {
    fn default() -> Self {
        Self {
            velero: "docker.io/velero/velero:v1.14.0".to_string(),
            aws_plugin: "docker.io/velero/velero-plugin-for-aws:v1.10.0".to_string(),
        }
    }
}
