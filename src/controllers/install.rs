use std::future::Future;
use std::path::PathBuf;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::ResourceExt as _;
use kube::api::DynamicObject;
use serde::Deserialize as _;
use tokio::process::Command;
use tracing::{debug, info, instrument};

use super::poller::{Readiness, WaitConfig, wait_for_object};
use super::{HealthError, InstallError};
use crate::api::flux::SOURCE_GROUP;
use crate::api::flux_config::FluxInstallation;
use crate::store::ObjectStore;

pub static SOURCE_CONTROLLER: &str = "source-controller";

/// Parameters handed to the manifest generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOptions {
    pub version: String,
    pub registry: String,
    pub namespace: String,
    pub components: Vec<String>,
    pub components_extra: Vec<String>,
}

impl From<&FluxInstallation> for InstallOptions {
    fn from(flux: &FluxInstallation) -> Self {
        Self {
            version: flux.version.clone(),
            registry: flux.registry.clone(),
            namespace: flux.namespace.clone(),
            components: flux.components.clone(),
            components_extra: flux.components_extra.clone(),
        }
    }
}

/// Produces the multi-document install manifest of Flux.
pub trait ManifestGenerator: Send + Sync {
    fn generate(
        &self,
        options: &InstallOptions,
    ) -> impl Future<Output = Result<String, InstallError>> + Send;
}

/// Generates manifests with `flux install --export`.
#[derive(Debug, Clone)]
pub struct FluxCli {
    binary: PathBuf,
    manifests_base: Option<PathBuf>,
}

impl FluxCli {
    #[must_use]
    pub fn new(binary: impl Into<PathBuf>, manifests_base: Option<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            manifests_base,
        }
    }

    fn args(&self, options: &InstallOptions) -> Vec<String> {
        let mut args = vec![
            "install".to_string(),
            "--export".to_string(),
            format!("--version={}", options.version),
            format!("--namespace={}", options.namespace),
            format!("--registry={}", options.registry),
        ];
        if !options.components.is_empty() {
            args.push(format!("--components={}", options.components.join(",")));
        }
        if !options.components_extra.is_empty() {
            args.push(format!(
                "--components-extra={}",
                options.components_extra.join(",")
            ));
        }
        if let Some(base) = &self.manifests_base {
            args.push(format!("--manifests={}", base.display()));
        }
        args
    }
}

impl ManifestGenerator for FluxCli {
    async fn generate(&self, options: &InstallOptions) -> Result<String, InstallError> {
        let args = self.args(options);
        debug!(binary = %self.binary.display(), ?args, "Generating install manifest");
        let output = Command::new(&self.binary)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(InstallError::Spawn)?;

        if !output.status.success() {
            return Err(InstallError::Generate(format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        String::from_utf8(output.stdout).map_err(|e| InstallError::Generate(e.to_string()))
    }
}

fn apply_order(obj: &DynamicObject) -> u8 {
    match obj.types.as_ref().map(|t| t.kind.as_str()) {
        Some("Namespace") => 0,
        Some("CustomResourceDefinition") => 1,
        _ => 2,
    }
}

/// Split a multi-document manifest into objects, Namespaces first, then CRDs, then the rest.
pub fn parse_manifest(manifest: &str) -> Result<Vec<DynamicObject>, InstallError> {
    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(manifest) {
        let value = serde_yaml::Value::deserialize(document).map_err(InstallError::Manifest)?;
        if value.is_null() {
            continue;
        }
        let obj: DynamicObject = serde_yaml::from_value(value).map_err(InstallError::Manifest)?;
        if obj.types.is_none() {
            return Err(InstallError::IncompleteObject(obj.name_any()));
        }
        objects.push(obj);
    }
    objects.sort_by_key(apply_order);
    Ok(objects)
}

fn condition_true<'a>(
    conditions: impl IntoIterator<Item = (&'a str, &'a str, Option<&'a str>)>,
    type_: &str,
) -> Result<(), HealthError> {
    match conditions.into_iter().find(|(t, _, _)| *t == type_) {
        None => Err(HealthError::ConditionMissing(type_.to_string())),
        Some((_, "True", _)) => Ok(()),
        Some((_, status, message)) => Err(HealthError::ConditionStatus {
            type_: type_.to_string(),
            status: status.to_string(),
            message: message.unwrap_or_default().to_string(),
        }),
    }
}

/// A CRD is healthy once its names are accepted and it is established.
pub fn check_crd(crd: &CustomResourceDefinition) -> Readiness {
    if crd.metadata.deletion_timestamp.is_some() {
        return Readiness::NotReady(HealthError::Terminating);
    }
    let conditions = crd
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_deref())
        .unwrap_or_default();
    let conditions = || {
        conditions
            .iter()
            .map(|c| (c.type_.as_str(), c.status.as_str(), c.message.as_deref()))
    };
    match condition_true(conditions(), "NamesAccepted")
        .and_then(|()| condition_true(conditions(), "Established"))
    {
        Ok(()) => Readiness::Ready,
        Err(e) => Readiness::NotReady(e),
    }
}

/// A Deployment is healthy once its current generation is observed and available.
pub fn check_deployment(deployment: &Deployment) -> Readiness {
    let Some(status) = deployment.status.as_ref() else {
        return Readiness::NotReady(HealthError::ConditionMissing("Available".into()));
    };
    let expected = deployment.metadata.generation.unwrap_or_default();
    let observed = status.observed_generation.unwrap_or_default();
    if observed < expected {
        return Readiness::NotReady(HealthError::OutdatedGeneration { observed, expected });
    }

    let conditions = status.conditions.as_deref().unwrap_or_default();
    if let Some(progressing) = conditions
        .iter()
        .find(|c| c.type_ == "Progressing" && c.status == "False")
    {
        return Readiness::NotReady(HealthError::ConditionStatus {
            type_: progressing.type_.clone(),
            status: progressing.status.clone(),
            message: progressing.message.clone().unwrap_or_default(),
        });
    }
    match condition_true(
        conditions
            .iter()
            .map(|c| (c.type_.as_str(), c.status.as_str(), c.message.as_deref())),
        "Available",
    ) {
        Ok(()) => Readiness::Ready,
        Err(e) => Readiness::NotReady(e),
    }
}

/// Apply the generated install manifest and wait for the installation to come up.
///
/// The GitRepository CRD gates on the API surface being installed, the source-controller
/// Deployment gates on the configured registry and version actually serving images.
#[instrument(skip_all, fields(version = %flux.version, namespace = %flux.namespace), err)]
pub async fn install_flux<S, G>(
    store: &S,
    generator: &G,
    flux: &FluxInstallation,
    wait: WaitConfig,
) -> Result<(), InstallError>
where
    S: ObjectStore,
    G: ManifestGenerator,
{
    info!("Installing Flux");
    let manifest = generator.generate(&InstallOptions::from(flux)).await?;

    for obj in parse_manifest(&manifest)? {
        store.apply(&obj).await.map_err(InstallError::Apply)?;
    }

    info!("Waiting for Flux installation to get ready");
    let crd_name = format!("gitrepositories.{SOURCE_GROUP}");
    wait_for_object::<_, CustomResourceDefinition, _>(store, &(), &crd_name, wait, check_crd)
        .await
        .map_err(|source| InstallError::CrdNotReady {
            name: crd_name.clone(),
            source,
        })?;

    wait_for_object::<_, Deployment, _>(
        store,
        &flux.namespace,
        SOURCE_CONTROLLER,
        wait,
        check_deployment,
    )
    .await
    .map_err(|source| InstallError::DeploymentNotReady {
        namespace: flux.namespace.clone(),
        name: SOURCE_CONTROLLER.to_string(),
        source,
    })?;

    info!("Successfully installed Flux");
    Ok(())
}
