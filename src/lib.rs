use controllers::{ReconcileError, ShootClientError, TrackerError};
use store::StoreError;
use thiserror::Error;

pub mod api;
pub mod config;
pub mod controllers;
pub mod metrics;
pub mod store;
pub mod telemetry;

pub use metrics::Metrics;

/// Extension type served by this controller.
pub static EXTENSION_TYPE: &str = "shoot-flux";

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Finalizer Error: {0}")]
    // NB: awkward type because finalizer::Error embeds the reconciler error (which is this)
    // so boxing this error to break cycles
    FinalizerError(#[source] Box<kube::runtime::finalizer::Error<Error>>),

    #[error("Extension {0} has no namespace")]
    MissingNamespace(String),

    #[error("Cluster {0} not found")]
    MissingCluster(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Shoot client error: {0}")]
    ShootClient(#[from] ShootClientError),

    #[error("Reconcile error: {0}")]
    Reconcile(#[from] ReconcileError),

    #[error("Status error: {0}")]
    Status(#[from] TrackerError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    #[must_use]
    pub fn metric_label(&self) -> String {
        match self {
            Error::Reconcile(ReconcileError::Step { step, .. }) => {
                format!("reconcile_{}", step.as_str())
            }
            Error::Reconcile(ReconcileError::Config(_)) => "invalid_config".to_string(),
            Error::ShootClient(_) => "shoot_client".to_string(),
            Error::MissingNamespace(_) => "missing_namespace".to_string(),
            Error::MissingCluster(_) => "missing_cluster".to_string(),
            Error::Store(_) => "store".to_string(),
            Error::Status(_) => "status".to_string(),
            Error::FinalizerError(_) => "finalizer".to_string(),
            Error::KubeError(_) => "kube".to_string(),
        }
    }
}
