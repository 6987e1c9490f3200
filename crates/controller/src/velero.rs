//! Velero resource types
//!
//! Typed structs for the Velero resources this controller derives. The
//! storage-location spec is shared with [`ClusterBackupStorageLocation`],
//! which embeds it verbatim.
//!
//! [`ClusterBackupStorageLocation`]: crate::api::ClusterBackupStorageLocation

use std::collections::BTreeMap;

use garde::Validate;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Velero BackupStorageLocation
///
/// Defines where backups are stored (S3, GCS, Azure, etc.).
#[derive(
    CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, Validate, JsonSchema,
)]
#[kube(
    group = "velero.io",
    version = "v1",
    kind = "BackupStorageLocation",
    namespaced
)]
#[kube(derive = "Default")]
#[serde(rename_all = "camelCase")]
pub struct BackupStorageLocationSpec {
    /// Provider name (aws, gcp, azure)
    #[garde(length(min = 1))]
    pub provider: String,
    #[garde(dive)]
    pub object_storage: ObjectStorageLocation,
    /// Provider-specific configuration
    #[garde(skip)]
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<CredentialRef>,
    /// Whether this is the default BSL
    #[garde(skip)]
    #[serde(default)]
    pub default: bool,
    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_mode: Option<String>,
    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_sync_period: Option<String>,
    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_frequency: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStorageLocation {
    #[garde(length(min = 1))]
    pub bucket: String,
    /// Prefix within the bucket
    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<String>,
}

/// Reference to a key within a Kubernetes Secret
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct CredentialRef {
    pub name: String,
    #[serde(default)]
    pub key: String,
}
