//! Reports each reconcile in the Extension status the way Gardener reads it: `lastOperation`,
//! `lastError` and `observedGeneration`.
//!
//! Every write is skipped when the status already says the same thing, since each status
//! change triggers another reconcile.

use chrono::Utc;
use kube::ResourceExt as _;
use serde_json::json;
use tracing::{debug, info};

use super::TrackerError;
use crate::api::extension::{Extension, LastOperationState, LastOperationType};
use crate::store::{ObjectStore, StoreError};

pub static PROCESSING_DESCRIPTION: &str = "Reconciling Flux on the Shoot cluster";
pub static SUCCEEDED_DESCRIPTION: &str = "Successfully reconciled Flux on the Shoot cluster";

/// `Create` until the first operation succeeded, `Reconcile` afterwards.
#[must_use]
pub fn operation_type(ext: &Extension) -> LastOperationType {
    match ext.status.as_ref().and_then(|s| s.last_operation.as_ref()) {
        Some(op)
            if op.type_ == LastOperationType::Create
                && op.state != LastOperationState::Succeeded =>
        {
            LastOperationType::Create
        }
        Some(_) => LastOperationType::Reconcile,
        None => LastOperationType::Create,
    }
}

/// Whether the current generation has not been reconciled to an outcome yet.
#[must_use]
pub fn generation_pending(ext: &Extension) -> bool {
    ext.status.as_ref().and_then(|s| s.observed_generation) != ext.metadata.generation
}

fn resource_version(ext: &Extension) -> Result<String, TrackerError> {
    ext.resource_version()
        .ok_or_else(|| TrackerError::MissingResourceVersion(ext.name_any()))
}

/// Mark a new generation as `Processing`, returning the Extension as written.
///
/// Retries of a generation that already has an outcome write nothing.
pub async fn record_processing<S: ObjectStore>(
    store: &S,
    ext: &Extension,
) -> Result<Extension, TrackerError> {
    let processing = ext
        .status
        .as_ref()
        .and_then(|s| s.last_operation.as_ref())
        .is_some_and(|op| op.state == LastOperationState::Processing);
    if !generation_pending(ext) || processing {
        return Ok(ext.clone());
    }

    let patch = json!({
        "metadata": {"resourceVersion": resource_version(ext)?},
        "status": {
            "lastOperation": {
                "type": operation_type(ext),
                "state": LastOperationState::Processing,
                "description": PROCESSING_DESCRIPTION,
                "lastUpdateTime": Utc::now(),
                "progress": 1,
            },
        },
    });
    let namespace = ext.namespace().unwrap_or_default();
    let updated = store
        .patch_status::<Extension>(&namespace, &ext.name_any(), &patch)
        .await
        .map_err(TrackerError::Operation)?;
    debug!("Recorded processing operation");
    Ok(updated)
}

/// Record the outcome of a reconcile of `ext`: `Succeeded` without an error, `Error` with
/// its description otherwise. Returns whether a write happened.
///
/// The Extension is re-read first, earlier steps may have changed its status since `ext` was
/// read. The write carries that resourceVersion.
pub async fn record_outcome<S: ObjectStore>(
    store: &S,
    ext: &Extension,
    error: Option<&str>,
) -> Result<bool, TrackerError> {
    let namespace = ext.namespace().unwrap_or_default();
    let name = ext.name_any();
    let latest = store
        .get::<Extension>(&namespace, &name)
        .await
        .and_then(|found| found.ok_or_else(|| StoreError::NotFound(name.clone())))
        .map_err(|source| TrackerError::Read {
            name: name.clone(),
            source,
        })?;

    let (state, description) = match error {
        None => (LastOperationState::Succeeded, SUCCEEDED_DESCRIPTION),
        Some(error) => (LastOperationState::Error, error),
    };
    let status = latest.status.as_ref();
    let recorded = status
        .and_then(|s| s.last_operation.as_ref())
        .is_some_and(|op| op.state == state && op.description == description);
    let last_error = status
        .and_then(|s| s.last_error.as_ref())
        .map(|e| e.description.as_str());
    if recorded && !generation_pending(&latest) && last_error == error {
        debug!(?state, "Last operation already recorded");
        return Ok(false);
    }

    let now = Utc::now();
    let last_error = error.map(|description| {
        json!({
            "description": description,
            "lastUpdateTime": now,
        })
    });
    let patch = json!({
        "metadata": {"resourceVersion": resource_version(&latest)?},
        "status": {
            "lastOperation": {
                "type": operation_type(&latest),
                "state": state,
                "description": description,
                "lastUpdateTime": now,
                "progress": if error.is_none() { 100 } else { 50 },
            },
            "lastError": last_error,
            "observedGeneration": latest.metadata.generation,
        },
    });
    store
        .patch_status::<Extension>(&namespace, &name, &patch)
        .await
        .map_err(TrackerError::Operation)?;

    info!(?state, "Recorded last operation");
    Ok(true)
}
