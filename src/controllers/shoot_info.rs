use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ObjectMeta;
use tracing::info;

use super::secrets::{MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use crate::api::extension::Shoot;
use crate::store::{ObjectStore, Operation, StoreResult, create_or_update};

pub static SHOOT_INFO_CONFIGMAP: &str = "shoot-info";

fn shoot_info(shoot: &Shoot) -> BTreeMap<String, String> {
    let status = shoot.status.clone().unwrap_or_default();
    BTreeMap::from([
        (
            "SHOOT_INFO_NAME".to_string(),
            shoot.metadata.name.clone().unwrap_or_default(),
        ),
        ("SHOOT_INFO_TECHNICAL_ID".to_string(), status.technical_id),
        (
            "SHOOT_INFO_CLUSTER_IDENTITY".to_string(),
            status.cluster_identity.unwrap_or_default(),
        ),
    ])
}

/// Publish facts about the shoot for Kustomization post-build substitution.
///
/// The ConfigMap data is owned entirely by the extension, foreign keys are dropped.
pub async fn reconcile_shoot_info<S: ObjectStore>(
    store: &S,
    namespace: &str,
    shoot: &Shoot,
) -> StoreResult<Operation> {
    let template = ConfigMap {
        metadata: ObjectMeta {
            name: Some(SHOOT_INFO_CONFIGMAP.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                MANAGED_BY_LABEL.to_string(),
                MANAGED_BY_VALUE.to_string(),
            )])),
            ..Default::default()
        },
        ..Default::default()
    };
    let data = shoot_info(shoot);
    let operation = create_or_update(store, &template, |cm: &mut ConfigMap| {
        cm.data = Some(data);
        cm.metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
    })
    .await?;
    if operation != Operation::Unchanged {
        info!(?operation, namespace, "Reconciled shoot-info ConfigMap");
    }
    Ok(operation)
}
