use k8s_openapi::api::core::v1::Secret;
use kube::Client;
use kube::config::{KubeConfigOptions, Kubeconfig};
use tracing::debug;

use super::ShootClientError;
use crate::store::ObjectStore;

/// Seed secrets holding a kubeconfig for the shoot, in order of preference.
pub static SHOOT_ACCESS_SECRETS: [&str; 2] = ["gardener-internal", "gardener"];
pub static KUBECONFIG_KEY: &str = "kubeconfig";

/// Read the shoot kubeconfig from the access secrets in the shoot's seed namespace.
pub async fn shoot_kubeconfig<S: ObjectStore>(
    seed: &S,
    namespace: &str,
) -> Result<Kubeconfig, ShootClientError> {
    for name in SHOOT_ACCESS_SECRETS {
        let Some(secret) = seed
            .get::<Secret>(namespace, name)
            .await
            .map_err(ShootClientError::Store)?
        else {
            debug!(secret = name, "Shoot access secret not found");
            continue;
        };

        let kubeconfig = secret
            .data
            .as_ref()
            .and_then(|data| data.get(KUBECONFIG_KEY))
            .ok_or_else(|| ShootClientError::MissingKubeconfig(name.to_string()))?;
        let kubeconfig = String::from_utf8_lossy(&kubeconfig.0);
        return Kubeconfig::from_yaml(&kubeconfig).map_err(ShootClientError::Kubeconfig);
    }
    Err(ShootClientError::MissingSecret(namespace.to_string()))
}

/// Build a client for the shoot of the seed namespace `namespace`.
pub async fn shoot_client<S: ObjectStore>(
    seed: &S,
    namespace: &str,
) -> Result<Client, ShootClientError> {
    let kubeconfig = shoot_kubeconfig(seed, namespace).await?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(ShootClientError::Kubeconfig)?;
    Client::try_from(config).map_err(ShootClientError::Client)
}
