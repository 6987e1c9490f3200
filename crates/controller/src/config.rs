use std::{hash::Hash, time::Duration};

use clap::{ArgAction, Args};
use kube::runtime::controller;

use crate::{
    reconcilers::{Settings, backoff::Backoff},
    resources::Images,
};

#[derive(Debug, Clone, Args)]
pub struct ControllerConfig {
    /// Number of clusters reconciled in parallel
    #[arg(long, env = "CLUSTER_BACKUP_WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// Only clusters whose worker-name label matches are reconciled
    #[arg(long, env = "CLUSTER_BACKUP_WORKER_NAME", default_value = "")]
    pub worker_name: String,

    /// Namespace holding ClusterBackupStorageLocations and their credentials
    #[arg(long, env = "CLUSTER_BACKUP_NAMESPACE", default_value = "kubermatic")]
    pub namespace: String,

    #[arg(long, env = "CLUSTER_BACKUP_VELERO_IMAGE", default_value_t = Images::default().velero)]
    pub velero_image: String,

    #[arg(
        long,
        env = "CLUSTER_BACKUP_VELERO_AWS_PLUGIN_IMAGE",
        default_value_t = Images::default().aws_plugin
    )]
    pub velero_aws_plugin_image: String,

    /// First retry delay after a failed reconcile
    #[arg(long, env = "CLUSTER_BACKUP_BACKOFF_BASE_MS", default_value_t = 5000)]
    pub backoff_base_ms: u64,

    #[arg(long, env = "CLUSTER_BACKUP_BACKOFF_MAX_SECS", default_value_t = 300)]
    pub backoff_max_secs: u64,

    /// Interval of the periodic full resync
    #[arg(long, env = "CLUSTER_BACKUP_RESYNC_SECS", default_value_t = 300)]
    pub resync_secs: u64,

    #[arg(long, env = "CLUSTER_BACKUP_RECONCILE_TIMEOUT_SECS", default_value_t = 120)]
    pub reconcile_timeout_secs: u64,

    /// Register the cluster backup controller
    #[arg(
        long,
        env = "CLUSTER_BACKUP_ENABLED",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub enable_cluster_backup: bool,
}

impl ControllerConfig {
    /// Reconcile concurrency, at least one.
    pub fn workers(&self) -> u16 {
        u16::try_from(self.workers.max(1)).unwrap_or(u16::MAX)
    }

    pub fn controller(&self) -> controller::Config {
        controller::Config::default().concurrency(self.workers())
    }

    pub fn backoff<K: Eq + Hash>(&self) -> Backoff<K> {
        Backoff::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_secs(self.backoff_max_secs),
        )
    }

    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout_secs.max(1))
    }

    pub fn settings(&self) -> Settings {
        Settings {
            namespace: self.namespace.clone(),
            worker_name: self.worker_name.clone(),
            images: Images {
                velero: self.velero_image.clone(),
                aws_plugin: self.velero_aws_plugin_image.clone(),
            },
        }
    }

    pub fn resync(&self) -> Duration {
        Duration::from_secs(self.resync_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        config: ControllerConfig,
    }

    fn parse(args: &[&str]) -> ControllerConfig {
        Cli::try_parse_from(std::iter::once("controller").chain(args.iter().copied()))
            .unwrap()
            .config
    }

    #[test]
    fn defaults() {
        let config = parse(&[]);
        assert_eq!(config.workers, 4);
        assert!(config.enable_cluster_backup);
        assert_eq!(config.settings(), Settings::default());

        assert_eq!(config.reconcile_timeout(), Duration::from_secs(120));

        let backoff = config.backoff();
        assert_eq!(backoff.next_delay("a"), Duration::from_secs(5));
        for _ in 0..10 {
            backoff.next_delay("a");
        }
        assert_eq!(backoff.next_delay("a"), Duration::from_secs(300));
    }

    #[test]
    fn flags_override_defaults() {
        let config = parse(&[
            "--workers",
            "8",
            "--worker-name",
            "alice",
            "--velero-image",
            "registry/velero:dev",
            "--enable-cluster-backup",
            "false",
        ]);
        assert_eq!(config.workers(), 8);
        assert!(!config.enable_cluster_backup);

        let settings = config.settings();
        assert_eq!(settings.worker_name, "alice");
        assert_eq!(settings.images.velero, "registry/velero:dev");
    }

    #[test]
    fn zero_values_are_clamped() {
        let config = parse(&[
            "--workers",
            "0",
            "--resync-secs",
            "0",
            "--reconcile-timeout-secs",
            "0",
        ]);
        assert_eq!(config.workers(), 1);
        assert_eq!(config.resync(), Duration::from_secs(1));
        assert_eq!(config.reconcile_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn workers_beyond_u16_saturate() {
        let config = parse(&["--workers", "100000"]);
        assert_eq!(config.workers(), u16::MAX);
    }
}
