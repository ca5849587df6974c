//! Sequences installation, secret sync and bootstrapping of Flux for one shoot.

use kube::ResourceExt as _;
use tracing::{info, instrument};

use super::bootstrap::{bootstrap, bootstrap_source};
use super::install::{ManifestGenerator, install_flux};
use super::poller::WaitConfig;
use super::secrets::{SeedSecretResolver, required_secrets, sync_secrets};
use super::shoot_info::reconcile_shoot_info;
use super::tracker::{is_bootstrapped, mark_bootstrapped};
use super::{ReconcileError, SecretSyncError, Step, StepError};
use crate::api::extension::{Cluster, Extension, Shoot};
use crate::api::flux_config::{FluxConfig, SyncMode};
use crate::api::validation::validate;
use crate::metrics::Metrics;
use crate::store::ObjectStore;

/// Steps to run, in order, for the given sync mode and bootstrap state.
#[must_use]
pub fn plan(sync_mode: SyncMode, bootstrapped: bool, has_source: bool, has_target: bool) -> Vec<Step> {
    let mut steps = Vec::with_capacity(5);
    match (sync_mode, bootstrapped) {
        (SyncMode::Once, true) => return steps,
        (SyncMode::ManifestsOnly, true) => {}
        (_, false) => steps.push(Step::InstallAgent),
    }
    steps.push(Step::SyncSecrets);
    if has_source {
        steps.push(Step::BootstrapSource);
    }
    if has_target {
        steps.push(Step::BootstrapTarget);
    }
    steps.push(Step::MarkBootstrapped);
    steps
}

/// Reconciles the Flux installation of a shoot.
///
/// `seed` holds the Extension and the copies of the shoot's referenced resources, `shoot`
/// is the cluster Flux gets installed into.
pub struct Actuator<'a, Seed, ShootStore, G> {
    pub seed: &'a Seed,
    pub shoot: &'a ShootStore,
    pub generator: &'a G,
    pub metrics: &'a Metrics,
    pub install_wait: WaitConfig,
    pub bootstrap_wait: WaitConfig,
}

impl<Seed, ShootStore, G> Actuator<'_, Seed, ShootStore, G>
where
    Seed: ObjectStore,
    ShootStore: ObjectStore,
    G: ManifestGenerator,
{
    /// Run every step the current state calls for and return the steps that ran.
    ///
    /// The first failing step aborts the sequence, the next call starts over from the
    /// bootstrap check.
    pub async fn reconcile(
        &self,
        ext: &Extension,
        cluster: &Cluster,
    ) -> Result<Vec<Step>, ReconcileError> {
        let shoot = &cluster.spec.shoot;
        let config = FluxConfig::decode(ext.spec.provider_config.as_ref())?;
        validate(&config, shoot)?;

        let steps = plan(
            config.sync_mode,
            is_bootstrapped(ext),
            config.source.is_some(),
            config.kustomization.is_some(),
        );
        if steps.is_empty() {
            info!("Flux is already bootstrapped, skipping");
            return Ok(steps);
        }

        for &step in &steps {
            self.run(step, ext, &config, shoot)
                .await
                .map_err(|source| ReconcileError::Step { step, source })?;
        }
        Ok(steps)
    }

    #[instrument(skip_all, fields(step = %step), err)]
    async fn run(
        &self,
        step: Step,
        ext: &Extension,
        config: &FluxConfig,
        shoot: &Shoot,
    ) -> Result<(), StepError> {
        let _timer = self.metrics.measure_step(step);
        match step {
            Step::InstallAgent => {
                install_flux(self.shoot, self.generator, &config.flux, self.install_wait).await?;
            }
            Step::SyncSecrets => {
                let namespace = ext.namespace().unwrap_or_default();
                let resolver = SeedSecretResolver::new(self.seed, &namespace, &shoot.spec.resources);
                sync_secrets(
                    self.shoot,
                    &resolver,
                    config.namespace(),
                    &required_secrets(config),
                )
                .await?;
                reconcile_shoot_info(self.shoot, config.namespace(), shoot)
                    .await
                    .map_err(SecretSyncError::ShootInfo)?;
            }
            Step::BootstrapSource => {
                if let Some(source) = &config.source {
                    bootstrap_source(self.shoot, source, self.bootstrap_wait).await?;
                }
            }
            Step::BootstrapTarget => {
                if let Some(kustomization) = &config.kustomization {
                    bootstrap(self.shoot, kustomization, self.bootstrap_wait).await?;
                }
            }
            Step::MarkBootstrapped => {
                mark_bootstrapped(self.seed, ext).await?;
            }
        }
        Ok(())
    }
}
