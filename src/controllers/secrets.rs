use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt as _;
use kube::api::ObjectMeta;
use tracing::{debug, info, instrument};

use super::SecretSyncError;
use crate::api::extension::NamedResourceReference;
use crate::api::flux_config::FluxConfig;
use crate::store::{ObjectStore, create_or_update};

pub static MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub static MANAGED_BY_VALUE: &str = "gardener-extension-shoot-flux";
pub static COPY_LABELS_ANNOTATION: &str = "gardener-extension-shoot-flux/copy-labels";

/// Gardener copies referenced resources into the shoot namespace of the seed with this prefix.
pub static REFERENCED_RESOURCES_PREFIX: &str = "ref-";

/// A secret that has to exist in the shoot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRef {
    /// Name of an entry in `Shoot.spec.resources[]`.
    pub resource_name: String,
    /// Name of the shoot secret, defaults to the referenced resource's name.
    pub target_name: Option<String>,
}

/// Seed secret content to copy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedSecret {
    /// Name of the referenced resource, used when no target name is configured.
    pub default_name: String,
    pub data: Option<BTreeMap<String, ByteString>>,
    /// Labels to carry over to the shoot copy.
    pub labels: BTreeMap<String, String>,
}

/// Looks up the content of a named secret resource.
pub trait SecretResolver: Send + Sync {
    fn resolve(
        &self,
        resource_name: &str,
    ) -> impl Future<Output = Result<ResolvedSecret, SecretSyncError>> + Send;
}

/// Resolves `Shoot.spec.resources[]` entries against the copies Gardener keeps in the seed.
pub struct SeedSecretResolver<'a, S> {
    store: &'a S,
    namespace: &'a str,
    resources: &'a [NamedResourceReference],
}

impl<'a, S: ObjectStore> SeedSecretResolver<'a, S> {
    pub fn new(store: &'a S, namespace: &'a str, resources: &'a [NamedResourceReference]) -> Self {
        Self {
            store,
            namespace,
            resources,
        }
    }
}

/// Go-style boolean parsing, as used by Gardener annotations.
fn parse_bool(value: &str) -> bool {
    matches!(value, "1" | "t" | "T" | "true" | "TRUE" | "True")
}

impl<S: ObjectStore> SecretResolver for SeedSecretResolver<'_, S> {
    async fn resolve(&self, resource_name: &str) -> Result<ResolvedSecret, SecretSyncError> {
        let resource = self
            .resources
            .iter()
            .find(|r| r.name == resource_name)
            .ok_or_else(|| SecretSyncError::UnknownResource(resource_name.to_string()))?;
        if resource.resource_ref.kind != "Secret" {
            return Err(SecretSyncError::NotASecret {
                name: resource_name.to_string(),
                kind: resource.resource_ref.kind.clone(),
            });
        }

        let seed_name = format!("{REFERENCED_RESOURCES_PREFIX}{}", resource.resource_ref.name);
        let secret = self
            .store
            .get::<Secret>(self.namespace, &seed_name)
            .await
            .map_err(SecretSyncError::Read)?
            .ok_or_else(|| SecretSyncError::MissingSeedSecret {
                namespace: self.namespace.to_string(),
                name: seed_name.clone(),
            })?;

        let copy_labels = secret
            .annotations()
            .get(COPY_LABELS_ANNOTATION)
            .is_some_and(|v| parse_bool(v));
        let labels = if copy_labels {
            secret.labels().clone()
        } else {
            BTreeMap::new()
        };

        Ok(ResolvedSecret {
            default_name: resource.resource_ref.name.clone(),
            data: secret.data,
            labels,
        })
    }
}

/// All secrets the shoot needs: the additional resources plus the source credentials.
#[must_use]
pub fn required_secrets(config: &FluxConfig) -> Vec<SecretRef> {
    let mut required: Vec<SecretRef> = config
        .additional_secret_resources
        .iter()
        .map(|r| SecretRef {
            resource_name: r.name.clone(),
            target_name: r.target_name.clone().filter(|n| !n.is_empty()),
        })
        .collect();

    if let Some(source) = &config.source {
        if let (Some(resource_name), Some(secret_ref)) = (
            source.secret_resource_name.as_ref(),
            source.template.secret_ref_name(),
        ) {
            required.push(SecretRef {
                resource_name: resource_name.clone(),
                target_name: Some(secret_ref.to_string()),
            });
        }
    }
    required
}

/// Copy every required secret into `namespace` and delete managed secrets that are no longer
/// required. Returns the names of the secrets kept.
#[instrument(skip_all, fields(namespace = namespace), err)]
pub async fn sync_secrets<S, R>(
    store: &S,
    resolver: &R,
    namespace: &str,
    required: &[SecretRef],
) -> Result<BTreeSet<String>, SecretSyncError>
where
    S: ObjectStore,
    R: SecretResolver,
{
    let mut keep = BTreeSet::new();

    for secret_ref in required {
        let resolved = resolver.resolve(&secret_ref.resource_name).await?;
        let name = secret_ref
            .target_name
            .clone()
            .unwrap_or_else(|| resolved.default_name.clone());

        let template = Secret {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let operation = create_or_update(store, &template, |secret: &mut Secret| {
            secret.data.clone_from(&resolved.data);
            let mut labels = resolved.labels.clone();
            labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
            secret.metadata.labels = Some(labels);
        })
        .await
        .map_err(|source| SecretSyncError::Copy {
            name: name.clone(),
            source,
        })?;
        info!(secret = %name, ?operation, "Synced secret");
        keep.insert(name);
    }

    let selector = format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}");
    let managed = store
        .list::<Secret>(namespace, &selector)
        .await
        .map_err(SecretSyncError::List)?;
    for secret in managed {
        let name = secret.name_any();
        if keep.contains(&name) {
            continue;
        }
        match store.delete::<Secret>(namespace, &name).await {
            Ok(()) => info!(secret = %name, "Deleted secret that is no longer referenced"),
            Err(e) if e.is_not_found() => debug!(secret = %name, "Secret is already gone"),
            Err(source) => return Err(SecretSyncError::Delete { name, source }),
        }
    }

    Ok(keep)
}

#[cfg(test)]
pub(crate) mod tests {
    use k8s_openapi::api::autoscaling::v1::CrossVersionObjectReference;
    use serde_json::json;

    use super::*;
    use crate::store::fake::{Call, FakeStore};

    /// Resolves every resource name to a secret with one key holding the name.
    struct Echo;

    impl SecretResolver for Echo {
        async fn resolve(&self, resource_name: &str) -> Result<ResolvedSecret, SecretSyncError> {
            Ok(ResolvedSecret {
                default_name: resource_name.to_string(),
                data: Some(BTreeMap::from([(
                    "value".to_string(),
                    ByteString(resource_name.as_bytes().to_vec()),
                )])),
                labels: BTreeMap::new(),
            })
        }
    }

    fn refs(names: &[&str]) -> Vec<SecretRef> {
        names
            .iter()
            .map(|n| SecretRef {
                resource_name: n.to_string(),
                target_name: None,
            })
            .collect()
    }

    fn managed(store: &FakeStore) -> Vec<String> {
        store.names::<Secret>("flux-system")
    }

    pub(crate) fn seed_resource(name: &str, kind: &str) -> NamedResourceReference {
        NamedResourceReference {
            name: name.to_string(),
            resource_ref: CrossVersionObjectReference {
                api_version: Some("v1".into()),
                kind: kind.to_string(),
                name: format!("{name}-secret"),
            },
        }
    }

    pub(crate) fn seed_secret(name: &str, annotations: &[(&str, &str)]) -> Secret {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {
                "name": format!("ref-{name}-secret"),
                "namespace": "shoot--project--name",
                "labels": {"origin": "project"},
                "annotations": annotations.iter().copied().collect::<BTreeMap<_, _>>(),
            },
            "data": {"token": "c2VjcmV0"},
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn subset_removes_extras() {
        let store = FakeStore::new();
        sync_secrets(&store, &Echo, "flux-system", &refs(&["a", "b", "c"]))
            .await
            .unwrap();
        sync_secrets(&store, &Echo, "flux-system", &refs(&["a"]))
            .await
            .unwrap();
        assert_eq!(managed(&store), ["a"]);
    }

    #[tokio::test]
    async fn disjoint_sets_replace_everything() {
        let store = FakeStore::new();
        sync_secrets(&store, &Echo, "flux-system", &refs(&["a", "b"]))
            .await
            .unwrap();
        let kept = sync_secrets(&store, &Echo, "flux-system", &refs(&["c", "d"]))
            .await
            .unwrap();
        assert_eq!(kept, BTreeSet::from(["c".to_string(), "d".to_string()]));
        assert_eq!(managed(&store), ["c", "d"]);
    }

    #[tokio::test]
    async fn equal_sets_delete_nothing() {
        let store = FakeStore::new();
        sync_secrets(&store, &Echo, "flux-system", &refs(&["a", "b"]))
            .await
            .unwrap();
        let writes = store.calls().len();
        sync_secrets(&store, &Echo, "flux-system", &refs(&["a", "b"]))
            .await
            .unwrap();
        assert_eq!(store.calls().len(), writes);
        assert_eq!(managed(&store), ["a", "b"]);
    }

    #[tokio::test]
    async fn secret_deleted_concurrently_is_not_an_error() {
        let store = FakeStore::new();
        sync_secrets(&store, &Echo, "flux-system", &refs(&["a", "b"]))
            .await
            .unwrap();
        store.remove_after_list::<Secret>("flux-system", "b");

        let kept = sync_secrets(&store, &Echo, "flux-system", &refs(&["a"]))
            .await
            .unwrap();

        assert_eq!(kept, BTreeSet::from(["a".to_string()]));
        assert_eq!(managed(&store), ["a"]);
        assert_eq!(
            store.calls().last(),
            Some(&Call::Delete {
                kind: "Secret".into(),
                name: "b".into()
            })
        );
    }

    #[tokio::test]
    async fn unmanaged_secrets_are_left_alone() {
        let store = FakeStore::new();
        let mut foreign = Secret::default();
        foreign.metadata.name = Some("sops-gpg".into());
        foreign.metadata.namespace = Some("flux-system".into());
        store.insert(&foreign);

        sync_secrets(&store, &Echo, "flux-system", &[]).await.unwrap();

        assert_eq!(managed(&store), ["sops-gpg"]);
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn target_name_overrides_resource_name() {
        let store = FakeStore::new();
        let required = [SecretRef {
            resource_name: "a".into(),
            target_name: Some("flux-system".into()),
        }];
        sync_secrets(&store, &Echo, "flux-system", &required)
            .await
            .unwrap();
        let secret = store.fetch::<Secret>("flux-system", "flux-system").unwrap();
        assert_eq!(
            secret.labels().get(MANAGED_BY_LABEL).map(String::as_str),
            Some(MANAGED_BY_VALUE)
        );
    }

    #[tokio::test]
    async fn seed_resolver_copies_labels_on_request() {
        let seed = FakeStore::new();
        seed.insert(&seed_secret("plain", &[]));
        seed.insert(&seed_secret("labelled", &[(COPY_LABELS_ANNOTATION, "true")]));
        let resources = [
            seed_resource("plain", "Secret"),
            seed_resource("labelled", "Secret"),
        ];
        let resolver = SeedSecretResolver::new(&seed, "shoot--project--name", &resources);

        let plain = resolver.resolve("plain").await.unwrap();
        assert_eq!(plain.default_name, "plain-secret");
        assert!(plain.labels.is_empty());
        assert_eq!(
            plain.data.unwrap()["token"],
            ByteString(b"secret".to_vec())
        );

        let labelled = resolver.resolve("labelled").await.unwrap();
        assert_eq!(labelled.labels.get("origin").map(String::as_str), Some("project"));
    }

    #[tokio::test]
    async fn seed_resolver_errors() {
        let seed = FakeStore::new();
        let resources = [
            seed_resource("missing", "Secret"),
            seed_resource("settings", "ConfigMap"),
        ];
        let resolver = SeedSecretResolver::new(&seed, "shoot--project--name", &resources);

        assert!(matches!(
            resolver.resolve("unknown").await,
            Err(SecretSyncError::UnknownResource(_))
        ));
        assert!(matches!(
            resolver.resolve("settings").await,
            Err(SecretSyncError::NotASecret { .. })
        ));
        assert!(matches!(
            resolver.resolve("missing").await,
            Err(SecretSyncError::MissingSeedSecret { .. })
        ));
    }

    #[tokio::test]
    async fn resolution_failure_aborts_before_garbage_collection() {
        let store = FakeStore::new();
        sync_secrets(&store, &Echo, "flux-system", &refs(&["a"]))
            .await
            .unwrap();
        let seed = FakeStore::new();
        let resolver = SeedSecretResolver::new(&seed, "shoot--project--name", &[]);

        let err = sync_secrets(&store, &resolver, "flux-system", &refs(&["b"]))
            .await
            .unwrap_err();

        assert!(matches!(err, SecretSyncError::UnknownResource(_)));
        assert_eq!(managed(&store), ["a"]);
        assert!(
            !store
                .calls()
                .iter()
                .any(|c| matches!(c, Call::Delete { .. }))
        );
    }

    #[test]
    fn source_credentials_are_required() {
        let config = FluxConfig::decode(Some(&json!({
            "source": {
                "template": {
                    "kind": "GitRepository",
                    "spec": {"url": "https://example.com/repo", "ref": {"branch": "main"}},
                },
                "secretResourceName": "git-credentials",
            },
            "additionalSecretResources": [{"name": "sops", "targetName": "sops-age"}],
        })))
        .unwrap();

        assert_eq!(
            required_secrets(&config),
            [
                SecretRef {
                    resource_name: "sops".into(),
                    target_name: Some("sops-age".into()),
                },
                SecretRef {
                    resource_name: "git-credentials".into(),
                    target_name: Some("flux-system".into()),
                },
            ]
        );
    }
}
