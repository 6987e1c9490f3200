use std::collections::BTreeMap;

use garde::Validate;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::velero::BackupStorageLocationSpec;

/// Label carrying the owning project's identifier.
pub const PROJECT_ID_LABEL: &str = "project-id";

/// Label selecting which controller worker owns a cluster.
pub const WORKER_NAME_LABEL: &str = "worker-name";

/// Feature key that switches cluster backups on for a cluster.
pub const CLUSTER_BACKUP_FEATURE: &str = "clusterBackup";

/// A managed user cluster. Cluster-scoped; its control plane lives in the
/// seed namespace recorded in `status.boundNamespace`.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, Validate, JsonSchema)]
#[kube(group = "kubermatic.k8c.io", version = "v1", kind = "Cluster")]
#[kube(status = "ClusterStatus")]
#[kube(derive = "Default")]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    #[garde(skip)]
    #[serde(default)]
    pub pause: bool,
    #[garde(skip)]
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub features: BTreeMap<String, bool>,
    #[garde(dive)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_config: Option<BackupConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupConfig {
    /// Name of the [`ClusterBackupStorageLocation`] backups are written to.
    #[garde(skip)]
    pub location_ref: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default)]
    pub bound_namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<ClusterAddress>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub conditions: BTreeMap<String, ClusterCondition>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct ClusterAddress {
    #[serde(rename = "internalURL", default)]
    pub internal_url: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    pub status: ConditionStatus,
    /// Always serialized so a merge patch clears a previous failure.
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: String,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionStatus::True => write!(f, "True"),
            ConditionStatus::False => write!(f, "False"),
            ConditionStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

impl Cluster {
    /// The seed namespace hosting this cluster's control plane, once assigned.
    pub fn bound_namespace(&self) -> Option<&str> {
        self.status
            .as_ref()
            .map(|s| s.bound_namespace.as_str())
            .filter(|ns| !ns.is_empty())
    }

    pub fn project_id(&self) -> Option<&str> {
        self.labels().get(PROJECT_ID_LABEL).map(String::as_str)
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Name of the referenced backup storage location, if one is configured.
    pub fn backup_location_ref(&self) -> Option<&str> {
        self.spec
            .backup_config
            .as_ref()
            .map(|c| c.location_ref.as_str())
            .filter(|name| !name.is_empty())
    }

    pub fn is_cluster_backup_enabled(&self) -> bool {
        self.spec
            .features
            .get(CLUSTER_BACKUP_FEATURE)
            .copied()
            .unwrap_or(false)
            && self.backup_location_ref().is_some()
    }

    pub fn condition(&self, type_: &str) -> Option<&ClusterCondition> {
        self.status.as_ref().and_then(|s| s.conditions.get(type_))
    }
}

/// Seed-wide backup storage configuration that clusters reference by name.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, Validate, JsonSchema)]
#[kube(
    group = "kubermatic.k8c.io",
    version = "v1",
    kind = "ClusterBackupStorageLocation",
    namespaced
)]
#[kube(derive = "Default")]
pub struct ClusterBackupStorageLocationSpec {
    #[garde(dive)]
    #[serde(flatten)]
    pub location: BackupStorageLocationSpec,
}
