/// K8s API objects
pub mod api;

/// Runtime configuration
pub mod config;

/// Converge/apply engine
pub mod engine;

pub mod events;

/// Desired-state factories
pub mod factory;

/// K8s reconciliation logic
pub mod reconcilers;

pub mod resolver;

/// Derived resources for the user and seed clusters
pub mod resources;

pub mod status;

/// Generic object store over every kind the controller touches
pub mod store;

/// Velero API objects
pub mod velero;

use std::fmt;

use thiserror::Error;

use crate::{factory::Scope, store::StoreError};

pub const CONTROLLER_NAME: &str = "cluster-backup-controller";

#[derive(Debug, Error)]
pub enum Error {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("validation error for cluster {cluster}: {message}")]
    Validation { cluster: String, message: String },
    #[error("failed to get user cluster client for {cluster}: {message}")]
    RemoteCluster { cluster: String, message: String },
    #[error("failed to {step} {kind} {name}: {source}")]
    Step {
        step: Step,
        kind: String,
        name: String,
        #[source]
        source: Box<Error>,
    },
    #[error("failed to ensure cluster backup {phase} cluster resources: {source}")]
    Phase {
        phase: Scope,
        #[source]
        source: Box<Error>,
    },
    #[error("{0}")]
    Precondition(String),
    #[error("certificate error: {0}")]
    Certificate(String),
    #[error("Serde error: {0}")]
    SerdeYaml(#[from] serde_yaml_ng::Error),
    #[error("reconcile cancelled")]
    Cancelled,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The converge step an [`Error::Step`] failed in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Get,
    Build,
    Create,
    Update,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Step::Get => "get",
            Step::Build => "build",
            Step::Create => "create",
            Step::Update => "update",
        })
    }
}

/// Whether retrying can make an error go away.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
}

impl Error {
    pub fn validation(cluster: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation { .. } | Error::SerdeYaml(_) => ErrorKind::Permanent,
            // an object that cannot be decoded stays broken until it is edited
            Error::Store(StoreError::Codec(_)) => ErrorKind::Permanent,
            Error::Step { source, .. } | Error::Phase { source, .. } => source.kind(),
            _ => ErrorKind::Transient,
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.kind() == ErrorKind::Permanent
    }

    /// The innermost error, past any step or phase wrapping.
    pub fn root(&self) -> &Error {
        match self {
            Error::Step { source, .. } | Error::Phase { source, .. } => source.root(),
            other => other,
        }
    }

    /// Machine-readable reason for conditions.
    pub fn reason(&self) -> &'static str {
        match self.root() {
            Error::Validation { .. } => "ValidationError",
            Error::Cancelled => "Cancelled",
            _ => "ReconcilingError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(source: Error) -> Error {
        Error::Phase {
            phase: Scope::User,
            source: Box::new(Error::Step {
                step: Step::Build,
                kind: "BackupStorageLocation".to_string(),
                name: "default-cluster-backup-bsl".to_string(),
                source: Box::new(source),
            }),
        }
    }

    #[test]
    fn kind_follows_wrapped_source() {
        assert!(step(Error::validation("c", "missing label")).is_permanent());
        assert!(!step(Error::Store(StoreError::Unavailable("down".to_string()))).is_permanent());
    }

    #[test]
    fn undecodable_objects_are_permanent() {
        let codec = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(step(Error::Store(StoreError::Codec(codec))).is_permanent());
    }

    #[test]
    fn reason_uses_root_cause() {
        assert_eq!(step(Error::validation("c", "x")).reason(), "ValidationError");
        assert_eq!(step(Error::Cancelled).reason(), "Cancelled");
        assert_eq!(
            Error::Precondition("no CA".to_string()).reason(),
            "ReconcilingError"
        );
    }

    #[test]
    fn message_names_phase_step_and_resource() {
        let msg = step(Error::validation("c", "missing label")).to_string();
        assert!(msg.starts_with("failed to ensure cluster backup user cluster resources"));
        assert!(msg.contains("failed to build BackupStorageLocation default-cluster-backup-bsl"));
        assert!(msg.contains("missing label"));
    }
}
