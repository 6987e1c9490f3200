use kube::ResourceExt;

use crate::{
    api::{Cluster, WORKER_NAME_LABEL},
    resources::Images,
};

pub mod backoff;
pub mod cluster_backup;

/// Inputs every reconciler shares, fixed at startup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    /// Namespace holding the referenced backup storage locations and their
    /// credential secrets.
    pub namespace: String,
    pub worker_name: String,
    pub images: Images,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            namespace: "kubermatic".to_string(),
            worker_name: String::new(),
            images: Images::default(),
        }
    }
}

/// Admission predicate for change notifications.
///
/// Paused, deleting and not yet bound clusters are never queued, and neither
/// are clusters handed to a different worker. An absent worker-name label
/// matches the empty worker name.
pub fn admit(cluster: &Cluster, worker_name: &str) -> bool {
    let owner = cluster
        .labels()
        .get(WORKER_NAME_LABEL)
        .map(String::as_str)
        .unwrap_or_default();

    !cluster.spec.pause
        && !cluster.is_deleting()
        && cluster.bound_namespace().is_some()
        && owner == worker_name
}
