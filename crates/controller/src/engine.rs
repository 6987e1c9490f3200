//! Converge/apply engine
//!
//! Runs an ordered list of [`DesiredStateFactory`]s against their scopes:
//! create what is missing, update what drifted, leave the rest alone. The
//! first failure aborts the run; later factories assume earlier ones applied.
//! There is no retry here, the controller requeues.

use std::sync::Arc;

use kube::api::DynamicObject;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    Error, Result, Step,
    factory::{DesiredStateFactory, Scope},
    store::{ObjectKey, ObjectStore, StoreError},
};

/// Object stores per [`Scope`].
#[derive(Clone)]
pub struct Scopes {
    seed: Arc<dyn ObjectStore>,
    user: Arc<dyn ObjectStore>,
}

impl Scopes {
    pub fn new(seed: Arc<dyn ObjectStore>, user: Arc<dyn ObjectStore>) -> Self {
        Self { seed, user }
    }

    pub fn store(&self, scope: Scope) -> &dyn ObjectStore {
        match scope {
            Scope::Seed => self.seed.as_ref(),
            Scope::User => self.user.as_ref(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Updated,
    Unchanged,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
}

impl Summary {
    pub fn writes(&self) -> usize {
        self.created + self.updated
    }

    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Created => self.created += 1,
            Outcome::Updated => self.updated += 1,
            Outcome::Unchanged => self.unchanged += 1,
        }
    }
}

/// Converge every factory in order, stopping at the first error or when
/// `cancel` fires. Already-applied steps are not rolled back.
pub async fn converge(
    factories: &[Box<dyn DesiredStateFactory>],
    scopes: &Scopes,
    cancel: &CancellationToken,
) -> Result<Summary> {
    let mut summary = Summary::default();
    for factory in factories {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            outcome = apply(factory.as_ref(), scopes.store(factory.scope())) => outcome?,
        };
        summary.record(outcome);
    }
    debug!(
        created = summary.created,
        updated = summary.updated,
        unchanged = summary.unchanged,
        "Converged"
    );
    Ok(summary)
}

fn step_error(step: Step, key: &ObjectKey, source: impl Into<Error>) -> Error {
    Error::Step {
        step,
        kind: key.resource.kind.clone(),
        name: key.name.clone(),
        source: Box::new(source.into()),
    }
}

/// Converge a single factory against `store`.
pub async fn apply(factory: &dyn DesiredStateFactory, store: &dyn ObjectStore) -> Result<Outcome> {
    let key = factory.key();

    let existing = store
        .get(&key)
        .await
        .map_err(|e| step_error(Step::Get, &key, e))?;
    let mut desired = factory
        .build(existing.as_ref())
        .map_err(|e| step_error(Step::Build, &key, e))?;

    let Some(existing) = existing else {
        store
            .create(factory.resource(), &desired)
            .await
            .map_err(|e| step_error(Step::Create, &key, e))?;
        info!(resource = %key, scope = %factory.scope(), "Created");
        return Ok(Outcome::Created);
    };

    let current = factory
        .normalize(&existing)
        .map_err(|e| step_error(Step::Build, &key, e))?;
    if is_unchanged(&desired, &current).map_err(|e| step_error(Step::Build, &key, e))? {
        debug!(resource = %key, "Unchanged");
        return Ok(Outcome::Unchanged);
    }

    desired.metadata.resource_version = existing.metadata.resource_version.clone();
    store
        .update(factory.resource(), &desired)
        .await
        .map_err(|e| step_error(Step::Update, &key, e))?;
    info!(resource = %key, scope = %factory.scope(), "Updated");
    Ok(Outcome::Updated)
}

const SERVER_MANAGED_METADATA: &[&str] = &[
    "resourceVersion",
    "uid",
    "generation",
    "creationTimestamp",
    "managedFields",
    "selfLink",
];

fn comparable(object: &DynamicObject) -> Result<Value, StoreError> {
    let mut value = serde_json::to_value(object)?;
    if let Some(fields) = value.as_object_mut() {
        fields.remove("status");
        if let Some(meta) = fields.get_mut("metadata").and_then(Value::as_object_mut) {
            for field in SERVER_MANAGED_METADATA {
                meta.remove(*field);
            }
        }
    }
    Ok(value)
}

/// Whether `desired` matches `current` exactly, outside of status and
/// server-managed metadata. A field the factory cleared is drift.
fn is_unchanged(desired: &DynamicObject, current: &DynamicObject) -> Result<bool, StoreError> {
    Ok(comparable(desired)? == comparable(current)?)
}
