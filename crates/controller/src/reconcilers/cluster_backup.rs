//! Cluster backup controller
//!
//! Installs velero into a user cluster and runs its server from the seed:
//! the user phase creates the namespace, RBAC, CRDs and the default storage
//! location; the seed phase creates the kubeconfig, cloud credentials and the
//! velero deployment in the cluster's namespace.

use std::{
    future::{Future, ready},
    sync::Arc,
    time::Duration,
};

use futures::{FutureExt, Stream, StreamExt, TryStreamExt, channel::oneshot};
use garde::Validate;
use kube::{
    ResourceExt,
    runtime::{
        Controller, WatchStreamExt,
        controller::{Action, Error as ControllerError},
        reflector::{self, ObjectRef, store::Writer},
        watcher,
    },
};
use tokio_stream::wrappers::IntervalStream;
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, info, instrument, warn};

use super::{Settings, admit, backoff::Backoff};
use crate::{
    Error, Result,
    api::{Cluster, ClusterBackupStorageLocation},
    config::ControllerConfig,
    engine::{self, Scopes},
    events::EventPublisher,
    factory::Scope,
    resolver::RemoteClusterResolver,
    resources::{seed_cluster::{self, TemplateData}, user_cluster},
    status::StatusReporter,
    store::{self, ObjectStore},
};

pub struct ClusterBackupReconciler {
    seed: Arc<dyn ObjectStore>,
    resolver: Arc<dyn RemoteClusterResolver>,
    reporter: StatusReporter,
    settings: Settings,
}

fn phase(phase: Scope) -> impl FnOnce(Error) -> Error {
    move |source| Error::Phase {
        phase,
        source: Box::new(source),
    }
}

impl ClusterBackupReconciler {
    pub fn new(
        seed: Arc<dyn ObjectStore>,
        resolver: Arc<dyn RemoteClusterResolver>,
        events: Arc<dyn EventPublisher>,
        settings: Settings,
    ) -> Self {
        Self {
            reporter: StatusReporter::new(seed.clone(), events),
            seed,
            resolver,
            settings,
        }
    }

    async fn converge(
        &self,
        cluster: &Cluster,
        cbsl: &ClusterBackupStorageLocation,
        cancel: &CancellationToken,
    ) -> Result<()> {
        cbsl.spec.validate().map_err(|e| {
            Error::validation(
                cluster.name_any(),
                format!("invalid ClusterBackupStorageLocation {}: {e}", cbsl.name_any()),
            )
        })?;

        let user = self.resolver.resolve(cluster).await.map_err(phase(Scope::User))?;
        let scopes = Scopes::new(self.seed.clone(), user);

        let factories = user_cluster::factories(cluster, cbsl).map_err(phase(Scope::User))?;
        let user_summary = engine::converge(&factories, &scopes, cancel)
            .await
            .map_err(phase(Scope::User))?;

        let data = TemplateData::resolve(self.seed.as_ref(), cluster, cbsl, &self.settings.images)
            .await
            .map_err(phase(Scope::Seed))?;
        let seed_summary = engine::converge(&seed_cluster::factories(&data), &scopes, cancel)
            .await
            .map_err(phase(Scope::Seed))?;

        let writes = user_summary.writes() + seed_summary.writes();
        if writes > 0 {
            info!(writes, "Cluster backup resources converged");
        }
        Ok(())
    }

    /// Converge the named cluster once, reporting the outcome on its status.
    #[instrument(level = Level::DEBUG, skip(self, cancel))]
    pub async fn reconcile(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        let Some(cluster) = store::get::<Cluster>(self.seed.as_ref(), None, name).await? else {
            debug!("Cluster not found");
            self.resolver.forget(name);
            return Ok(());
        };
        if cluster.is_deleting() {
            debug!("Cluster is deleting");
            self.resolver.forget(name);
            return Ok(());
        }
        if !admit(&cluster, &self.settings.worker_name) {
            debug!("Cluster is paused, unbound or handled by another worker");
            return Ok(());
        }
        if !cluster.is_cluster_backup_enabled() {
            return Ok(());
        }
        let Some(location) = cluster.backup_location_ref() else {
            return Ok(());
        };

        let cbsl = match store::get::<ClusterBackupStorageLocation>(
            self.seed.as_ref(),
            Some(&self.settings.namespace),
            location,
        )
        .await
        {
            Ok(Some(cbsl)) => cbsl,
            Ok(None) => {
                debug!(location, "ClusterBackupStorageLocation not found");
                return Ok(());
            }
            Err(e) => {
                return self
                    .reporter
                    .wrap::<()>(&cluster, async move { Err(Error::from(e)) })
                    .await;
            }
        };

        self.reporter
            .wrap(&cluster, self.converge(&cluster, &cbsl, cancel))
            .await
    }
}

/// State shared by [`reconcile`] and [`error_policy`].
pub struct Context {
    reconciler: ClusterBackupReconciler,
    backoff: Backoff<ObjectRef<Cluster>>,
    reconcile_timeout: Duration,
    shutdown: CancellationToken,
}

impl Context {
    pub fn new(
        reconciler: ClusterBackupReconciler,
        backoff: Backoff<ObjectRef<Cluster>>,
        reconcile_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            reconciler,
            backoff,
            reconcile_timeout,
            shutdown,
        }
    }
}

/// Reconcile one cluster within the configured deadline.
///
/// A reconcile that runs out of time is cancelled between steps and retried
/// like any transient failure.
#[instrument(level = Level::DEBUG, skip_all, fields(cluster = %cluster.name_any()))]
pub async fn reconcile(cluster: Arc<Cluster>, context: Arc<Context>) -> Result<Action> {
    let name = cluster.name_any();
    let cancel = context.shutdown.child_token();

    match tokio::time::timeout(
        context.reconcile_timeout,
        context.reconciler.reconcile(&name, &cancel),
    )
    .await
    {
        Ok(result) => result?,
        Err(_) => {
            cancel.cancel();
            return Err(Error::Cancelled);
        }
    }

    context.backoff.forget(&ObjectRef::from_obj(cluster.as_ref()));
    Ok(Action::await_change())
}

/// Transient failures are requeued with per-cluster exponential backoff.
/// Permanent ones wait for the next change or resync.
pub fn error_policy(cluster: Arc<Cluster>, error: &Error, context: Arc<Context>) -> Action {
    let key = ObjectRef::from_obj(cluster.as_ref());
    if error.is_permanent() {
        warn!(cluster = %key, %error, "Reconcile failed permanently");
        context.backoff.forget(&key);
        return Action::await_change();
    }

    let delay = context.backoff.next_delay(key.clone());
    warn!(
        cluster = %key,
        %error,
        retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        "Reconcile failed, requeueing"
    );
    Action::requeue(delay)
}

/// Admitted clusters from the seed watch, mirrored into `writer`.
pub fn watched_clusters(
    seed: &dyn ObjectStore,
    writer: Writer<Cluster>,
    worker_name: String,
) -> impl Stream<Item = Result<Cluster, watcher::Error>> + Send + 'static {
    let events = store::watch::<Cluster>(seed).filter_map(|event| {
        ready(match event {
            Ok(event) => Some(Ok::<_, watcher::Error>(event)),
            Err(e) => {
                warn!(error = %e, "Cluster watch failed");
                None
            }
        })
    });

    reflector::reflector(writer, events)
        .applied_objects()
        .try_filter(move |cluster| ready(admit(cluster, &worker_name)))
}

fn cancelled(token: CancellationToken) -> impl Future<Output = ()> + Send + Sync + 'static {
    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        token.cancelled().await;
        let _ = tx.send(());
    });
    rx.map(|_| ())
}

/// Run the cluster backup controller until `shutdown` fires.
pub fn control_loop(
    seed: Arc<dyn ObjectStore>,
    resolver: Arc<dyn RemoteClusterResolver>,
    events: Arc<dyn EventPublisher>,
    config: &ControllerConfig,
    shutdown: CancellationToken,
) -> impl Stream<Item = Result<(ObjectRef<Cluster>, Action), ControllerError<Error, watcher::Error>>> + use<>
{
    let settings = config.settings();
    let (reader, writer) = reflector::store::<Cluster>();
    let clusters = watched_clusters(seed.as_ref(), writer, settings.worker_name.clone());
    let resync = IntervalStream::new(tokio::time::interval(config.resync())).map(|_| ());

    let context = Arc::new(Context::new(
        ClusterBackupReconciler::new(seed, resolver, events, settings),
        config.backoff(),
        config.reconcile_timeout(),
        shutdown.clone(),
    ));

    Controller::for_stream(clusters, reader)
        .with_config(config.controller())
        .reconcile_all_on(resync)
        .graceful_shutdown_on(cancelled(shutdown))
        .run(reconcile, error_policy, context)
}
