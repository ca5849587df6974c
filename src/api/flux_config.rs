//! The extension's providerConfig: decoding, defaulting and the typed configuration the
//! reconciler consumes.

use kube::{Resource as _, ResourceExt as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::flux::{
    CrossNamespaceSourceReference, GitRepository, Kustomization, LocalObjectReference,
    OCIRepository,
};

// renovate:flux-version
pub static DEFAULT_FLUX_VERSION: &str = "v2.7.5";
pub static DEFAULT_REGISTRY: &str = "ghcr.io/fluxcd";
pub static DEFAULT_NAMESPACE: &str = "flux-system";
pub static DEFAULT_OBJECT_NAME: &str = "flux-system";
pub static DEFAULT_INTERVAL: &str = "1m";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("error decoding providerConfig: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("invalid source configuration: {0}")]
    InvalidSource(String),

    #[error("invalid kustomization configuration: {0}")]
    InvalidKustomization(String),

    #[error("invalid providerConfig: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Invalid(Vec<FieldError>),
}

/// A single validation failure, addressed by its path in the providerConfig.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub path: String,
    pub message: String,
}

impl FieldError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// How Flux is kept in sync after the first successful bootstrap.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SyncMode {
    /// Install Flux and the bootstrap objects once, never touch the shoot again.
    #[default]
    Once,
    /// Install Flux once, keep secrets and bootstrap objects in sync.
    ManifestsOnly,
}

/// Flux installation options after defaulting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FluxInstallation {
    pub version: String,
    pub registry: String,
    pub namespace: String,
    pub components: Vec<String>,
    pub components_extra: Vec<String>,
}

/// Secret resource to copy to the shoot.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AdditionalResource {
    /// Name of an entry in `Shoot.spec.resources[]`.
    pub name: String,
    /// Overrides the name of the secret in the shoot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_name: Option<String>,
}

/// Template of the Flux source object.
#[derive(Clone, Debug)]
pub enum SourceTemplate {
    GitRepository(GitRepository),
    OciRepository(OCIRepository),
}

#[derive(Clone, Debug)]
pub struct Source {
    pub template: SourceTemplate,
    /// Name of an entry in `Shoot.spec.resources[]` holding the source credentials.
    pub secret_resource_name: Option<String>,
}

#[derive(Clone, Debug)]
pub struct FluxConfig {
    pub flux: FluxInstallation,
    pub source: Option<Source>,
    pub kustomization: Option<Kustomization>,
    pub sync_mode: SyncMode,
    pub additional_secret_resources: Vec<AdditionalResource>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RawFluxConfig {
    #[serde(default)]
    flux: Option<RawInstallation>,
    #[serde(default)]
    source: Option<RawSource>,
    #[serde(default)]
    kustomization: Option<RawKustomization>,
    #[serde(default)]
    sync_mode: Option<SyncMode>,
    #[serde(default)]
    additional_secret_resources: Vec<AdditionalResource>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RawInstallation {
    version: Option<String>,
    registry: Option<String>,
    namespace: Option<String>,
    #[serde(default)]
    components: Vec<String>,
    #[serde(default)]
    components_extra: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSource {
    #[serde(default)]
    template: Option<Value>,
    secret_resource_name: Option<String>,
}

#[derive(Deserialize)]
struct RawKustomization {
    #[serde(default)]
    template: Option<Value>,
}

fn non_empty(value: Option<String>, default: &str) -> String {
    value
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Prepare an embedded object for typed decoding.
fn normalize_template(mut template: Value) -> Value {
    if let Some(object) = template.as_object_mut() {
        object
            .entry("metadata")
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        object
            .entry("spec")
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        object.remove("status");
    }
    template
}

fn check_api_version(template: &Value, expected: &str, kind: &str) -> Result<(), String> {
    match template.get("apiVersion").and_then(Value::as_str) {
        Some(api_version) if !api_version.is_empty() && api_version != expected => Err(format!(
            "unsupported apiVersion {api_version} for {kind}, expected {expected}"
        )),
        _ => Ok(()),
    }
}

impl SourceTemplate {
    /// Build the sum type from decoded variants, rejecting both and neither.
    pub fn from_variants(
        git: Option<GitRepository>,
        oci: Option<OCIRepository>,
    ) -> Result<Self, ConfigError> {
        match (git, oci) {
            (Some(git), None) => Ok(SourceTemplate::GitRepository(git)),
            (None, Some(oci)) => Ok(SourceTemplate::OciRepository(oci)),
            (Some(_), Some(_)) => Err(ConfigError::InvalidSource(
                "template must be either a GitRepository or an OCIRepository, not both".into(),
            )),
            (None, None) => Err(ConfigError::InvalidSource(
                "template must be a GitRepository or an OCIRepository".into(),
            )),
        }
    }

    /// Parse a source template, dispatching on its `kind`.
    pub fn parse(template: Value) -> Result<Self, ConfigError> {
        let kind = template
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let template = normalize_template(template);

        let (git, oci) = match kind.as_str() {
            "GitRepository" => {
                check_api_version(&template, &GitRepository::api_version(&()), &kind)
                    .map_err(ConfigError::InvalidSource)?;
                let git = serde_json::from_value(template).map_err(|e| {
                    ConfigError::InvalidSource(format!("failed to decode GitRepository: {e}"))
                })?;
                (Some(git), None)
            }
            "OCIRepository" => {
                check_api_version(&template, &OCIRepository::api_version(&()), &kind)
                    .map_err(ConfigError::InvalidSource)?;
                let oci = serde_json::from_value(template).map_err(|e| {
                    ConfigError::InvalidSource(format!("failed to decode OCIRepository: {e}"))
                })?;
                (None, Some(oci))
            }
            "" => (None, None),
            other => {
                return Err(ConfigError::InvalidSource(format!(
                    "unsupported kind {other}, expected GitRepository or OCIRepository"
                )));
            }
        };

        Self::from_variants(git, oci)
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            SourceTemplate::GitRepository(_) => "GitRepository",
            SourceTemplate::OciRepository(_) => "OCIRepository",
        }
    }

    #[must_use]
    pub fn name(&self) -> String {
        match self {
            SourceTemplate::GitRepository(git) => git.name_any(),
            SourceTemplate::OciRepository(oci) => oci.name_any(),
        }
    }

    #[must_use]
    pub fn namespace(&self) -> Option<String> {
        match self {
            SourceTemplate::GitRepository(git) => git.namespace(),
            SourceTemplate::OciRepository(oci) => oci.namespace(),
        }
    }

    /// Name of the credentials secret the source expects, if any.
    #[must_use]
    pub fn secret_ref_name(&self) -> Option<&str> {
        let secret_ref = match self {
            SourceTemplate::GitRepository(git) => git.spec.secret_ref.as_ref(),
            SourceTemplate::OciRepository(oci) => oci.spec.secret_ref.as_ref(),
        };
        secret_ref.map(|r| r.name.as_str()).filter(|n| !n.is_empty())
    }

    fn set_defaults(&mut self, namespace: &str, with_secret: bool) {
        let (meta, interval, secret_ref) = match self {
            SourceTemplate::GitRepository(git) => (
                &mut git.metadata,
                &mut git.spec.interval,
                &mut git.spec.secret_ref,
            ),
            SourceTemplate::OciRepository(oci) => (
                &mut oci.metadata,
                &mut oci.spec.interval,
                &mut oci.spec.secret_ref,
            ),
        };
        if meta.name.as_deref().unwrap_or_default().is_empty() {
            meta.name = Some(DEFAULT_OBJECT_NAME.to_string());
        }
        if meta.namespace.as_deref().unwrap_or_default().is_empty() {
            meta.namespace = Some(namespace.to_string());
        }
        if interval.as_deref().unwrap_or_default().is_empty() {
            *interval = Some(DEFAULT_INTERVAL.to_string());
        }
        let has_secret_ref = secret_ref.as_ref().is_some_and(|r| !r.name.is_empty());
        if with_secret && !has_secret_ref {
            *secret_ref = Some(LocalObjectReference {
                name: DEFAULT_OBJECT_NAME.to_string(),
            });
        }
    }
}

fn parse_kustomization(template: Value) -> Result<Kustomization, ConfigError> {
    if let Some(kind) = template.get("kind").and_then(Value::as_str) {
        if !kind.is_empty() && kind != "Kustomization" {
            return Err(ConfigError::InvalidKustomization(format!(
                "unsupported kind {kind}, expected Kustomization"
            )));
        }
    }
    check_api_version(&template, &Kustomization::api_version(&()), "Kustomization")
        .map_err(ConfigError::InvalidKustomization)?;
    serde_json::from_value(normalize_template(template))
        .map_err(|e| ConfigError::InvalidKustomization(format!("failed to decode template: {e}")))
}

impl FluxConfig {
    /// Decode and default a providerConfig. A missing providerConfig yields the defaults.
    pub fn decode(provider_config: Option<&Value>) -> Result<Self, ConfigError> {
        let raw: RawFluxConfig = match provider_config {
            None | Some(Value::Null) => RawFluxConfig::default(),
            Some(value) => serde_json::from_value(value.clone()).map_err(ConfigError::Decode)?,
        };

        let flux = raw.flux.unwrap_or_default();
        let flux = FluxInstallation {
            version: non_empty(flux.version, DEFAULT_FLUX_VERSION),
            registry: non_empty(flux.registry, DEFAULT_REGISTRY),
            namespace: non_empty(flux.namespace, DEFAULT_NAMESPACE),
            components: flux.components,
            components_extra: flux.components_extra,
        };

        let source = raw
            .source
            .map(|source| -> Result<Source, ConfigError> {
                let template = source.template.ok_or_else(|| {
                    ConfigError::InvalidSource("template is required".into())
                })?;
                Ok(Source {
                    template: SourceTemplate::parse(template)?,
                    secret_resource_name: source.secret_resource_name.filter(|n| !n.is_empty()),
                })
            })
            .transpose()?;

        let kustomization = raw
            .kustomization
            .map(|k| {
                k.template
                    .map(parse_kustomization)
                    .unwrap_or_else(|| Ok(Kustomization::new("", Default::default())))
            })
            .transpose()?;

        let mut config = FluxConfig {
            flux,
            source,
            kustomization,
            sync_mode: raw.sync_mode.unwrap_or_default(),
            additional_secret_resources: raw.additional_secret_resources,
        };
        config.set_defaults();
        Ok(config)
    }

    fn set_defaults(&mut self) {
        let namespace = self.flux.namespace.clone();

        if let Some(source) = self.source.as_mut() {
            let with_secret = source.secret_resource_name.is_some();
            source.template.set_defaults(&namespace, with_secret);
        }

        if let Some(kustomization) = self.kustomization.as_mut() {
            let meta = &mut kustomization.metadata;
            if meta.name.as_deref().unwrap_or_default().is_empty() {
                meta.name = Some(DEFAULT_OBJECT_NAME.to_string());
            }
            if meta.namespace.as_deref().unwrap_or_default().is_empty() {
                meta.namespace = Some(namespace.clone());
            }

            let spec = &mut kustomization.spec;
            if spec.interval.as_deref().unwrap_or_default().is_empty() {
                spec.interval = Some(DEFAULT_INTERVAL.to_string());
            }
            let source_ref: &mut CrossNamespaceSourceReference = &mut spec.source_ref;
            let (kind, name, source_namespace) = match self.source.as_ref() {
                Some(source) => (
                    source.template.kind().to_string(),
                    source.template.name(),
                    source.template.namespace().unwrap_or_else(|| namespace.clone()),
                ),
                None => (
                    "GitRepository".to_string(),
                    DEFAULT_OBJECT_NAME.to_string(),
                    namespace.clone(),
                ),
            };
            if source_ref.kind.is_empty() {
                source_ref.kind = kind;
            }
            if source_ref.name.is_empty() {
                source_ref.name = name;
            }
            if source_ref.namespace.as_deref().unwrap_or_default().is_empty() {
                source_ref.namespace = Some(source_namespace);
            }
        }
    }

    /// Flux namespace on the shoot.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.flux.namespace
    }
}
