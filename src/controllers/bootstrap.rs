use k8s_openapi::api::core::v1::Namespace;
use kube::{Resource, ResourceExt};
use kube::api::ObjectMeta;
use kube::core::object::{HasSpec, HasStatus};
use tracing::{info, instrument};

use super::poller::{Readiness, WaitConfig, wait_for_object};
use super::{BootstrapError, HealthError};
use crate::api::comparable::ResourceDiff;
use crate::api::flux::{FluxStatus, READY_CONDITION};
use crate::api::flux_config::{Source, SourceTemplate};
use crate::store::{GetApi, ObjectStore, StoreObject, create_or_update};

/// A Flux object reconciled from a template and reporting a `Ready` condition.
pub trait FluxObject:
    StoreObject
    + GetApi<Namespace = str>
    + ResourceDiff
    + HasSpec<Spec: Clone + Send + Sync>
    + HasStatus<Status = FluxStatus>
{
}

impl<K> FluxObject for K where
    K: StoreObject
        + GetApi<Namespace = str>
        + ResourceDiff
        + HasSpec<Spec: Clone + Send + Sync>
        + HasStatus<Status = FluxStatus>
{
}

/// Union labels and annotations of `from` into `into`; nothing is ever removed.
pub fn merge_meta(from: &ObjectMeta, into: &mut ObjectMeta) {
    if let Some(labels) = &from.labels {
        into.labels
            .get_or_insert_with(Default::default)
            .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    if let Some(annotations) = &from.annotations {
        into.annotations
            .get_or_insert_with(Default::default)
            .extend(annotations.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
}

/// Flux objects are done once `Ready` is set either way for their current generation.
pub fn check_flux_object<K>(obj: &K) -> Readiness
where
    K: Resource + HasStatus<Status = FluxStatus>,
{
    let status = obj.status();
    if let Some(expected) = obj.meta().generation {
        let observed = status.and_then(|s| s.observed_generation).unwrap_or_default();
        if observed < expected {
            return Readiness::NotReady(HealthError::OutdatedGeneration { observed, expected });
        }
    }
    match status.and_then(|status| status.condition(READY_CONDITION)) {
        Some(ready) if ready.status == "True" => Readiness::Ready,
        Some(ready) if ready.status == "False" => {
            Readiness::Failed(HealthError::ReconciliationFailed(ready.message.clone()))
        }
        _ => Readiness::NotReady(HealthError::NotReconciled),
    }
}

/// Create namespace `name` unless it already exists.
pub async fn ensure_namespace<S: ObjectStore>(store: &S, name: &str) -> Result<(), BootstrapError> {
    let err = |source| BootstrapError::Namespace {
        namespace: name.to_string(),
        source,
    };
    if store.get::<Namespace>(&(), name).await.map_err(err)?.is_some() {
        return Ok(());
    }

    let namespace = Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    match store.create(&namespace).await {
        Ok(_) => {
            info!(namespace = name, "Created namespace");
            Ok(())
        }
        Err(e) if e.is_already_exists() => Ok(()),
        Err(e) => Err(err(e)),
    }
}

/// Upsert `template` and wait for the resulting object to become ready.
///
/// The live object keeps labels and annotations it has beyond the template, its spec is
/// replaced by the template's spec.
#[instrument(skip_all, fields(kind = K::kind(&()).to_string(), name = template.name_any()), err)]
pub async fn bootstrap<S, K>(store: &S, template: &K, wait: WaitConfig) -> Result<K, BootstrapError>
where
    S: ObjectStore,
    K: FluxObject,
{
    let kind = K::kind(&()).to_string();
    let name = template.name_any();
    let namespace = template
        .namespace()
        .ok_or_else(|| BootstrapError::MissingNamespace { kind: kind.clone() })?;

    info!("Bootstrapping Flux {kind}");
    ensure_namespace(store, &namespace).await?;

    let operation = create_or_update(store, template, |live: &mut K| {
        merge_meta(template.meta(), live.meta_mut());
        *live.spec_mut() = template.spec().clone();
    })
    .await
    .map_err(|source| BootstrapError::Apply {
        kind: kind.clone(),
        source,
    })?;
    info!(?operation, "Applied {kind} template");

    info!("Waiting for {kind} to get ready");
    let ready = wait_for_object(store, namespace.as_str(), &name, wait, check_flux_object::<K>)
        .await
        .map_err(|source| BootstrapError::NotReady {
            kind: kind.clone(),
            namespace: namespace.clone(),
            name: name.clone(),
            source,
        })?;

    info!("Successfully bootstrapped Flux {kind}");
    Ok(ready)
}

/// Bootstrap whichever source kind the template holds.
pub async fn bootstrap_source<S: ObjectStore>(
    store: &S,
    source: &Source,
    wait: WaitConfig,
) -> Result<(), BootstrapError> {
    match &source.template {
        SourceTemplate::GitRepository(git) => bootstrap(store, git, wait).await.map(drop),
        SourceTemplate::OciRepository(oci) => bootstrap(store, oci, wait).await.map(drop),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeMap;

    use serde_json::{Value, json};

    use super::*;
    use crate::api::flux::{GitRepository, GitRepositoryRef, GitRepositorySpec, Kustomization};
    use crate::controllers::WaitError;
    use crate::store::fake::{Call, FakeStore};

    /// Mark every written object of `kind` with the given `Ready` condition.
    pub(crate) fn flux_ready(store: &FakeStore, kind: &str, status: &'static str, message: &'static str) {
        store.react(kind, move |obj: &mut Value| {
            obj["status"] = json!({
                "observedGeneration": obj["metadata"]["generation"],
                "conditions": [
                    {"type": "Ready", "status": status, "reason": "Test", "message": message},
                ],
            });
        });
    }

    fn git_repository() -> GitRepository {
        let mut git = GitRepository::new(
            "flux-system",
            GitRepositorySpec {
                url: "https://example.com/repo".into(),
                reference: Some(GitRepositoryRef {
                    branch: Some("main".into()),
                    ..Default::default()
                }),
                interval: Some("1m".into()),
                ..Default::default()
            },
        );
        git.metadata.namespace = Some("flux-system".into());
        git.metadata.labels = Some(BTreeMap::from([("team".to_string(), "a".to_string())]));
        git
    }

    #[test]
    fn merge_meta_is_additive() {
        let from = ObjectMeta {
            labels: Some(BTreeMap::from([("a".to_string(), "new".to_string())])),
            ..Default::default()
        };
        let mut into = ObjectMeta {
            labels: Some(BTreeMap::from([
                ("a".to_string(), "old".to_string()),
                ("b".to_string(), "kept".to_string()),
            ])),
            ..Default::default()
        };
        merge_meta(&from, &mut into);
        assert_eq!(
            into.labels,
            Some(BTreeMap::from([
                ("a".to_string(), "new".to_string()),
                ("b".to_string(), "kept".to_string()),
            ]))
        );
        assert_eq!(into.annotations, None);
    }

    #[test]
    fn ready_condition_states() {
        let mut git = git_repository();
        assert_eq!(
            check_flux_object(&git),
            Readiness::NotReady(HealthError::NotReconciled)
        );
        git.status = Some(serde_json::from_value(json!({"conditions": [
            {"type": "Ready", "status": "False", "message": "authentication required"},
        ]})).unwrap());
        let Readiness::Failed(err) = check_flux_object(&git) else {
            panic!("expected a terminal failure");
        };
        assert_eq!(err.to_string(), "reconciliation failed: authentication required");
    }

    #[test]
    fn ready_of_previous_generation_is_not_ready() {
        let mut git = git_repository();
        git.metadata.generation = Some(2);
        git.status = Some(serde_json::from_value(json!({
            "observedGeneration": 1,
            "conditions": [{"type": "Ready", "status": "False", "message": "authentication required"}],
        })).unwrap());
        assert_eq!(
            check_flux_object(&git),
            Readiness::NotReady(HealthError::OutdatedGeneration {
                observed: 1,
                expected: 2
            })
        );

        git.status.as_mut().unwrap().observed_generation = Some(2);
        assert!(matches!(check_flux_object(&git), Readiness::Failed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn bootstrap_creates_namespace_and_object() {
        let store = FakeStore::new();
        flux_ready(&store, "GitRepository", "True", "stored artifact");

        let ready = bootstrap(&store, &git_repository(), WaitConfig::BOOTSTRAP)
            .await
            .unwrap();

        assert_eq!(ready.spec.url, "https://example.com/repo");
        assert_eq!(
            store.calls(),
            [
                Call::Create {
                    kind: "Namespace".into(),
                    name: "flux-system".into()
                },
                Call::Create {
                    kind: "GitRepository".into(),
                    name: "flux-system".into()
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn bootstrap_twice_writes_nothing() {
        let store = FakeStore::new();
        flux_ready(&store, "GitRepository", "True", "stored artifact");
        bootstrap(&store, &git_repository(), WaitConfig::BOOTSTRAP)
            .await
            .unwrap();
        let writes = store.calls().len();
        let before = store.fetch::<GitRepository>("flux-system", "flux-system").unwrap();

        bootstrap(&store, &git_repository(), WaitConfig::BOOTSTRAP)
            .await
            .unwrap();

        assert_eq!(store.calls().len(), writes);
        let after = store.fetch::<GitRepository>("flux-system", "flux-system").unwrap();
        assert_eq!(after.resource_version(), before.resource_version());
    }

    #[tokio::test(start_paused = true)]
    async fn changed_template_replaces_spec_and_keeps_foreign_labels() {
        let store = FakeStore::new();
        flux_ready(&store, "GitRepository", "True", "stored artifact");
        let mut live = git_repository();
        live.spec.url = "https://example.com/old".into();
        live.spec.extra.insert("timeout".into(), json!("60s"));
        live.labels_mut().insert("kustomize.toolkit.fluxcd.io/name".into(), "flux-system".into());
        store.insert(&live);

        bootstrap(&store, &git_repository(), WaitConfig::BOOTSTRAP)
            .await
            .unwrap();

        let updated = store.fetch::<GitRepository>("flux-system", "flux-system").unwrap();
        assert_eq!(updated.spec, git_repository().spec);
        assert_eq!(updated.labels().get("team").map(String::as_str), Some("a"));
        assert!(updated.labels().contains_key("kustomize.toolkit.fluxcd.io/name"));
    }

    #[tokio::test(start_paused = true)]
    async fn changed_spec_waits_for_flux_to_observe_it() {
        let store = FakeStore::new();
        flux_ready(&store, "GitRepository", "True", "stored artifact");
        bootstrap(&store, &git_repository(), WaitConfig::BOOTSTRAP)
            .await
            .unwrap();
        // source-controller stops reconciling, the status stays at the first generation
        store.react("GitRepository", |obj: &mut Value| {
            obj["status"]["observedGeneration"] = json!(1);
        });
        let mut moved = git_repository();
        moved.spec.url = "https://example.com/moved".into();

        let err = bootstrap(&store, &moved, WaitConfig::BOOTSTRAP)
            .await
            .unwrap_err();

        assert!(matches!(
            &err,
            BootstrapError::NotReady {
                source: WaitError::Unhealthy(HealthError::OutdatedGeneration {
                    observed: 1,
                    expected: 2
                }),
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_kustomization_reports_condition_message() {
        let store = FakeStore::new();
        flux_ready(&store, "Kustomization", "False", "kustomization path not found");
        let mut kustomization = Kustomization::new("flux-system", Default::default());
        kustomization.metadata.namespace = Some("flux-system".into());

        let err = bootstrap(&store, &kustomization, WaitConfig::BOOTSTRAP)
            .await
            .unwrap_err();

        assert!(matches!(
            &err,
            BootstrapError::NotReady { source: WaitError::Unhealthy(_), .. }
        ));
        assert!(
            err.to_string()
                .ends_with("reconciliation failed: kustomization path not found")
        );
    }
}
