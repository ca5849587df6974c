//! Semantic checks of a decoded [`FluxConfig`] against the shoot it is configured for.

use super::extension::Shoot;
use super::flux::{GitRepository, OCIRepository};
use super::flux_config::{ConfigError, FieldError, FluxConfig, FluxInstallation, SourceTemplate};

static REQUIRED_COMPONENTS: [&str; 2] = ["kustomize-controller", "source-controller"];

fn is_dns1123_label(value: &str) -> bool {
    let bytes = value.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= 63
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
        && bytes.first().is_some_and(u8::is_ascii_alphanumeric)
        && bytes.last().is_some_and(u8::is_ascii_alphanumeric)
}

fn is_dns1123_subdomain(value: &str) -> bool {
    value.len() <= 253 && value.split('.').all(is_dns1123_label)
}

/// Collect every violation in `config`, failing with all of them at once.
pub fn validate(config: &FluxConfig, shoot: &Shoot) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    validate_installation(&config.flux, &mut errors);

    match (&config.source, &config.kustomization) {
        (None, Some(_)) => errors.push(FieldError::new(
            "source",
            "must specify a source if a kustomization is specified",
        )),
        (Some(_), None) => errors.push(FieldError::new(
            "kustomization",
            "must specify a kustomization if a source is specified",
        )),
        _ => {}
    }

    if let Some(source) = &config.source {
        match &source.template {
            SourceTemplate::GitRepository(git) => validate_git_repository(git, &mut errors),
            SourceTemplate::OciRepository(oci) => validate_oci_repository(oci, &mut errors),
        }

        let has_secret_ref = source.template.secret_ref_name().is_some();
        match (has_secret_ref, source.secret_resource_name.as_deref()) {
            (true, None) => errors.push(FieldError::new(
                "source.secretResourceName",
                "must specify a secret resource name if source.template.spec.secretRef is specified",
            )),
            (false, Some(_)) => errors.push(FieldError::new(
                "source.template.spec.secretRef",
                "must specify a secret ref if source.secretResourceName is specified",
            )),
            _ => {}
        }
        if let Some(name) = source.secret_resource_name.as_deref() {
            validate_secret_resource(shoot, "source.secretResourceName", name, &mut errors);
        }
    }

    if let Some(kustomization) = &config.kustomization {
        if kustomization.spec.path.as_deref().unwrap_or_default().is_empty() {
            errors.push(FieldError::new(
                "kustomization.template.spec.path",
                "Kustomization must have a path",
            ));
        }
    }

    for (i, resource) in config.additional_secret_resources.iter().enumerate() {
        if let Some(target) = resource.target_name.as_deref().filter(|t| !t.is_empty()) {
            if !is_dns1123_subdomain(target) {
                errors.push(FieldError::new(
                    format!("additionalSecretResources[{i}].targetName"),
                    format!("{target:?} must be a valid resource name"),
                ));
            }
        }
        validate_secret_resource(
            shoot,
            &format!("additionalSecretResources[{i}].name"),
            &resource.name,
            &mut errors,
        );
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Invalid(errors))
    }
}

fn validate_installation(flux: &FluxInstallation, errors: &mut Vec<FieldError>) {
    if !is_dns1123_label(&flux.namespace) {
        errors.push(FieldError::new(
            "flux.namespace",
            format!("{:?} must be a valid namespace name", flux.namespace),
        ));
    }

    if !flux.components.is_empty() {
        for required in REQUIRED_COMPONENTS {
            let wanted = flux
                .components
                .iter()
                .chain(&flux.components_extra)
                .any(|c| c == required);
            if !wanted {
                errors.push(FieldError::new(
                    "flux.components",
                    format!("missing required component {required}"),
                ));
            }
        }
    }
}

fn validate_git_repository(git: &GitRepository, errors: &mut Vec<FieldError>) {
    if git.spec.reference.as_ref().is_none_or(|r| r.is_empty()) {
        errors.push(FieldError::new(
            "source.template.spec.ref",
            "GitRepository must have a reference",
        ));
    }
    if git.spec.url.is_empty() {
        errors.push(FieldError::new(
            "source.template.spec.url",
            "GitRepository must have a URL",
        ));
    }
}

fn validate_oci_repository(oci: &OCIRepository, errors: &mut Vec<FieldError>) {
    if oci.spec.url.is_empty() {
        errors.push(FieldError::new(
            "source.template.spec.url",
            "OCIRepository must have a URL",
        ));
    } else if !oci.spec.url.starts_with("oci://") {
        errors.push(FieldError::new(
            "source.template.spec.url",
            format!("{:?} must start with oci://", oci.spec.url),
        ));
    }

    match &oci.spec.reference {
        None => errors.push(FieldError::new(
            "source.template.spec.ref",
            "OCIRepository must have a reference",
        )),
        Some(r) if r.tag.is_none() && r.semver.is_none() && r.digest.is_none() => {
            errors.push(FieldError::new(
                "source.template.spec.ref",
                "must specify tag, semver, or digest",
            ));
        }
        Some(_) => {}
    }
}

fn validate_secret_resource(shoot: &Shoot, path: &str, name: &str, errors: &mut Vec<FieldError>) {
    match shoot.resource(name) {
        None => errors.push(FieldError::new(
            path,
            format!(
                "{name:?} does not match any of the resource names in Shoot.spec.resources[].name"
            ),
        )),
        Some(resource) if resource.resource_ref.kind != "Secret" => {
            errors.push(FieldError::new(
                path,
                format!("{name:?} references a Shoot.spec.resources[], which is not a secret"),
            ));
        }
        Some(_) => {}
    }
}
