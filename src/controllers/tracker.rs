//! Persists whether Flux has been bootstrapped as a condition on the Extension.

use chrono::Utc;
use kube::ResourceExt as _;
use serde_json::json;
use tracing::{debug, info};

use super::TrackerError;
use crate::api::extension::{Condition, Extension};
use crate::store::ObjectStore;

pub static BOOTSTRAPPED_CONDITION: &str = "Bootstrapped";
pub static BOOTSTRAPPED_REASON: &str = "BootstrapSuccessful";
pub static BOOTSTRAPPED_MESSAGE: &str = "Flux has been successfully bootstrapped on the Shoot cluster.";

#[must_use]
pub fn is_bootstrapped(ext: &Extension) -> bool {
    ext.status
        .as_ref()
        .and_then(|s| s.condition(BOOTSTRAPPED_CONDITION))
        .is_some_and(|c| c.status == "True")
}

/// Set the Bootstrapped condition to True, returning whether a write happened.
///
/// The status patch carries the resourceVersion `ext` was read at, a concurrent status writer
/// makes it fail with a conflict that is left to the next reconcile.
pub async fn mark_bootstrapped<S: ObjectStore>(
    store: &S,
    ext: &Extension,
) -> Result<bool, TrackerError> {
    let mut conditions = ext
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();
    let current = conditions
        .iter_mut()
        .find(|c| c.type_ == BOOTSTRAPPED_CONDITION);

    if current.as_ref().is_some_and(|c| {
        c.status == "True" && c.reason == BOOTSTRAPPED_REASON && c.message == BOOTSTRAPPED_MESSAGE
    }) {
        debug!("Bootstrapped condition already set");
        return Ok(false);
    }

    let now = Utc::now();
    match current {
        Some(condition) => {
            if condition.status != "True" {
                condition.last_transition_time = Some(now);
            }
            condition.status = "True".into();
            condition.reason = BOOTSTRAPPED_REASON.into();
            condition.message = BOOTSTRAPPED_MESSAGE.into();
            condition.last_update_time = Some(now);
        }
        None => conditions.push(Condition {
            type_: BOOTSTRAPPED_CONDITION.into(),
            status: "True".into(),
            last_transition_time: Some(now),
            last_update_time: Some(now),
            reason: BOOTSTRAPPED_REASON.into(),
            message: BOOTSTRAPPED_MESSAGE.into(),
        }),
    }

    let resource_version = ext
        .resource_version()
        .ok_or_else(|| TrackerError::MissingResourceVersion(ext.name_any()))?;
    let patch = json!({
        "metadata": {"resourceVersion": resource_version},
        "status": {"conditions": conditions},
    });
    let namespace = ext.namespace().unwrap_or_default();
    store
        .patch_status::<Extension>(&namespace, &ext.name_any(), &patch)
        .await
        .map_err(TrackerError::Patch)?;

    info!("Marked Flux as bootstrapped");
    Ok(true)
}
