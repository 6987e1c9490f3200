//! Reconcile outcome reporting
//!
//! One condition on the [`Cluster`] summarises the last reconcile. Failures
//! additionally produce a Warning event. Neither write can change the outcome
//! handed back to the controller.

use std::{future::Future, sync::Arc};

use chrono::{DateTime, SecondsFormat, Utc};
use kube::{Resource, ResourceExt, runtime::events::EventType};
use serde_json::json;
use tracing::{debug, warn};

use crate::{
    Result,
    api::{Cluster, ClusterCondition, ConditionStatus},
    events::{EventPublisher, actions, reasons},
    store::{ObjectKey, ObjectStore},
};

pub const CLUSTER_BACKUP_CONDITION: &str = "ClusterBackupControllerReconcilingSuccess";

/// Condition to persist for an outcome. `lastTransitionTime` only moves when
/// the status flips.
pub fn next_condition(
    existing: Option<&ClusterCondition>,
    status: ConditionStatus,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) -> ClusterCondition {
    let last_transition_time = match existing {
        Some(existing) if existing.status == status => existing.last_transition_time.clone(),
        _ => now.to_rfc3339_opts(SecondsFormat::Secs, true),
    };
    ClusterCondition {
        status,
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time,
    }
}

pub struct StatusReporter {
    seed: Arc<dyn ObjectStore>,
    events: Arc<dyn EventPublisher>,
    condition: &'static str,
}

impl StatusReporter {
    pub fn new(seed: Arc<dyn ObjectStore>, events: Arc<dyn EventPublisher>) -> Self {
        Self {
            seed,
            events,
            condition: CLUSTER_BACKUP_CONDITION,
        }
    }

    /// Run `reconcile` and record its outcome on `cluster`.
    pub async fn wrap<T>(
        &self,
        cluster: &Cluster,
        reconcile: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let result = reconcile.await;
        match &result {
            Ok(_) => self.set_condition(cluster, ConditionStatus::True, "", "").await,
            Err(err) => {
                let message = err.to_string();
                self.set_condition(cluster, ConditionStatus::False, err.reason(), &message)
                    .await;
                self.events
                    .publish(
                        &cluster.object_ref(&()),
                        EventType::Warning,
                        reasons::RECONCILING_ERROR,
                        actions::RECONCILE,
                        Some(message),
                    )
                    .await;
            }
        }
        result
    }

    async fn set_condition(
        &self,
        cluster: &Cluster,
        status: ConditionStatus,
        reason: &str,
        message: &str,
    ) {
        let existing = cluster.condition(self.condition);
        let condition = next_condition(existing, status, reason, message, Utc::now());
        if existing == Some(&condition) {
            debug!(cluster = %cluster.name_any(), condition = self.condition, "Condition unchanged");
            return;
        }

        let patch = json!({ "conditions": { self.condition: condition } });
        let key = ObjectKey::of::<Cluster>(None, cluster.name_any());
        if let Err(e) = self.seed.patch_status(&key, &patch).await {
            warn!(
                cluster = %cluster.name_any(),
                condition = self.condition,
                error = %e,
                "Failed to persist condition"
            );
        }
    }
}
