use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use kube::{Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;

use controller::{
    CONTROLLER_NAME,
    api::{Cluster, ClusterBackupStorageLocation},
    config::ControllerConfig,
    events::KubeEventPublisher,
    reconcilers::cluster_backup,
    resolver::KubeconfigResolver,
    store::{KubeObjectStore, ObjectStore},
};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Subcommand)]
enum Commands {
    /// Run the cluster backup controller
    Run(ControllerConfig),
    /// Output K8s manifest for a given CRD resource
    #[command(subcommand)]
    CrdManifest(Crd),
}

#[derive(Debug, Clone, Subcommand)]
enum Crd {
    Cluster,
    ClusterBackupStorageLocation,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_file(true)
                .with_line_number(true),
        )
        .with(EnvFilter::from_default_env())
        .try_init()?;

    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Run(config)) => run_controller(config).await?,
        Some(Commands::CrdManifest(crd)) => {
            let crd = match crd {
                Crd::Cluster => Cluster::crd(),
                Crd::ClusterBackupStorageLocation => ClusterBackupStorageLocation::crd(),
            };

            println!("{}", serde_yaml_ng::to_string(&crd)?);
        }
        None => {}
    }

    Ok(())
}

async fn run_controller(config: ControllerConfig) -> anyhow::Result<()> {
    if !config.enable_cluster_backup {
        tracing::info!("cluster backup controller disabled");
        return Ok(());
    }

    let client = Client::try_default().await?;
    let seed: Arc<dyn ObjectStore> = Arc::new(KubeObjectStore::new(client.clone()));
    let resolver = Arc::new(KubeconfigResolver::new(seed.clone()));
    let events = Arc::new(KubeEventPublisher::new(client, CONTROLLER_NAME));

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for shutdown signal: {e}");
            }
            shutdown.cancel();
        }
    });

    cluster_backup::control_loop(seed, resolver, events, &config, shutdown)
        .for_each(|res| async move {
            match res {
                Ok((cluster, _)) => tracing::debug!("Reconciled cluster {cluster}"),
                Err(e) => tracing::error!("Cluster reconcile failed: {e:?}"),
            }
        })
        .await;

    tracing::info!("controller terminated");
    Ok(())
}
