use std::time::Duration;

use thiserror::Error;

use crate::api::flux_config::ConfigError;
use crate::store::StoreError;

pub mod actuator;
pub mod bootstrap;
pub mod controller;
pub mod install;
pub mod operation;
pub mod poller;
pub mod secrets;
pub mod shoot;
pub mod shoot_info;
pub mod tracker;

/// Why an object did not pass its readiness check.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HealthError {
    #[error("condition {0:?} is missing")]
    ConditionMissing(String),

    #[error("condition {type_:?} has status {status:?}: {message}")]
    ConditionStatus {
        type_: String,
        status: String,
        message: String,
    },

    #[error("observed generation outdated ({observed}/{expected})")]
    OutdatedGeneration { observed: i64, expected: i64 },

    #[error("is terminating")]
    Terminating,

    #[error("reconciliation failed: {0}")]
    ReconciliationFailed(String),

    #[error("has not been reconciled yet")]
    NotReconciled,
}

#[derive(Error, Debug)]
pub enum WaitError {
    #[error("{0}")]
    Unhealthy(#[source] HealthError),

    #[error("{0}")]
    Store(#[source] StoreError),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Error, Debug)]
pub enum InstallError {
    #[error("error generating install manifest: {0}")]
    Generate(String),

    #[error("error running flux: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("error parsing install manifest: {0}")]
    Manifest(#[source] serde_yaml::Error),

    #[error("install manifest contains an object without apiVersion or kind: {0}")]
    IncompleteObject(String),

    #[error("error applying Flux install manifest: {0}")]
    Apply(#[source] StoreError),

    #[error("error waiting for CustomResourceDefinition {name} to become established: {source}")]
    CrdNotReady {
        name: String,
        #[source]
        source: WaitError,
    },

    #[error("error waiting for Deployment {namespace}/{name} to become available: {source}")]
    DeploymentNotReady {
        namespace: String,
        name: String,
        #[source]
        source: WaitError,
    },
}

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("{kind} template has no namespace")]
    MissingNamespace { kind: String },

    #[error("error ensuring namespace {namespace}: {source}")]
    Namespace {
        namespace: String,
        #[source]
        source: StoreError,
    },

    #[error("error applying {kind} template: {source}")]
    Apply {
        kind: String,
        #[source]
        source: StoreError,
    },

    #[error("error waiting for {kind} {namespace}/{name} to get ready: {source}")]
    NotReady {
        kind: String,
        namespace: String,
        name: String,
        #[source]
        source: WaitError,
    },
}

#[derive(Error, Debug)]
pub enum SecretSyncError {
    #[error("secret resource {0:?} does not match any of the resource names in Shoot.spec.resources[].name")]
    UnknownResource(String),

    #[error("resource {name:?} references a {kind}, not a Secret")]
    NotASecret { name: String, kind: String },

    #[error("referenced secret {namespace}/{name} does not exist in the seed")]
    MissingSeedSecret { namespace: String, name: String },

    #[error("error reading referenced secret: {0}")]
    Read(#[source] StoreError),

    #[error("failed to ensure secret {name}: {source}")]
    Copy {
        name: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to list managed secrets in shoot: {0}")]
    List(#[source] StoreError),

    #[error("failed to delete secret {name} that is no longer referenced: {source}")]
    Delete {
        name: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to ensure shoot-info ConfigMap: {0}")]
    ShootInfo(#[source] StoreError),
}

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("Extension {0} has no resourceVersion")]
    MissingResourceVersion(String),

    #[error("error setting Bootstrapped condition in Extension status: {0}")]
    Patch(#[source] StoreError),

    #[error("error reading Extension {name}: {source}")]
    Read {
        name: String,
        #[source]
        source: StoreError,
    },

    #[error("error recording last operation in Extension status: {0}")]
    Operation(#[source] StoreError),
}

#[derive(Error, Debug)]
pub enum ShootClientError {
    #[error("no shoot access secret found in namespace {0}")]
    MissingSecret(String),

    #[error("secret {0} has no kubeconfig")]
    MissingKubeconfig(String),

    #[error("error reading shoot access secret: {0}")]
    Store(#[source] StoreError),

    #[error("invalid shoot kubeconfig: {0}")]
    Kubeconfig(#[source] kube::config::KubeconfigError),

    #[error("error creating shoot client: {0}")]
    Client(#[source] kube::Error),
}

/// A state of the reconcile sequence that touches a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    InstallAgent,
    SyncSecrets,
    BootstrapSource,
    BootstrapTarget,
    MarkBootstrapped,
}

impl Step {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::InstallAgent => "install_agent",
            Step::SyncSecrets => "sync_secrets",
            Step::BootstrapSource => "bootstrap_source",
            Step::BootstrapTarget => "bootstrap_target",
            Step::MarkBootstrapped => "mark_bootstrapped",
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum StepError {
    #[error(transparent)]
    Install(#[from] InstallError),

    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    #[error(transparent)]
    Secrets(#[from] SecretSyncError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),
}

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("step {step} failed: {source}")]
    Step {
        step: Step,
        #[source]
        source: StepError,
    },
}
