use crate::api::extension::{Cluster, Extension};
use crate::config::Settings;
use crate::controllers::actuator::Actuator;
use crate::controllers::Step;
use crate::controllers::install::FluxCli;
use crate::controllers::operation::{record_outcome, record_processing};
use crate::controllers::shoot::shoot_client;
use crate::metrics::Diagnostics;
use crate::store::{KubeStore, ObjectStore};
use crate::{EXTENSION_TYPE, Error, Metrics, Result, telemetry};
use chrono::Utc;

use futures::StreamExt;
use kube::api::{Api, ListParams};
use kube::client::Client;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::{Event, EventType};
use kube::runtime::{finalizer, watcher};
use kube::{Resource, ResourceExt};
use opentelemetry::trace::TraceId;
use prometheus::Registry;
use prometheus::proto::MetricFamily;

use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::field::display;
use tracing::{Span, debug, error, info, instrument, warn};

pub static FINALIZER: &str = "extensions.gardener.cloud/shoot-flux";

// Context for the reconciler
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client of the seed
    pub client: Client,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prom metrics
    pub metrics: Metrics,
    pub settings: Settings,
    /// Renders the Flux install manifest
    pub generator: FluxCli,
}

#[instrument(skip(ext, ctx), fields(trace_id, name = ext.name_any(), namespace = ext.namespace()))]
pub async fn reconcile(ext: Arc<Extension>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    if trace_id != TraceId::INVALID {
        Span::current().record("trace_id", display(&trace_id));
    }
    let _timer = ctx.metrics.count_and_measure();
    ctx.diagnostics.write().await.last_event = Utc::now();

    if ext.spec.type_ != EXTENSION_TYPE {
        debug!(type_ = %ext.spec.type_, "Ignoring Extension of another type");
        return Ok(Action::await_change());
    }

    let namespace = ext
        .namespace()
        .ok_or_else(|| Error::MissingNamespace(ext.name_any()))?;
    let api: Api<Extension> = Api::namespaced(ctx.client.clone(), &namespace);

    debug!("Reconciling");
    finalizer(&api, FINALIZER, ext, |event| async {
        match event {
            finalizer::Event::Apply(ext) => apply(ext, ctx.clone()).await,
            finalizer::Event::Cleanup(ext) => cleanup(ext, ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::FinalizerError(Box::new(e)))
}

async fn apply(ext: Arc<Extension>, ctx: Arc<Context>) -> Result<Action> {
    let seed = KubeStore::new(ctx.client.clone(), ctx.settings.field_manager.clone());
    let ext = record_processing(&seed, &ext).await?;

    let steps = match reconcile_flux(&seed, &ext, &ctx).await {
        Ok(steps) => steps,
        Err(e) => {
            if let Err(status_error) = record_outcome(&seed, &ext, Some(&e.to_string())).await {
                warn!(error = %status_error, "Failed to record reconcile error");
            }
            return Err(e);
        }
    };
    record_outcome(&seed, &ext, None).await?;

    if !steps.is_empty() {
        let steps: Vec<_> = steps.iter().map(ToString::to_string).collect();
        info!(steps = ?steps, "Reconciled Flux");
        publish(
            &ctx,
            &ext,
            Event {
                type_: EventType::Normal,
                reason: "Reconciled".into(),
                note: Some(format!("Reconciled Flux: {}", steps.join(", "))),
                action: "Reconciling".into(),
                secondary: None,
            },
        )
        .await?;
    }

    Ok(Action::requeue(ctx.settings.resync_period()))
}

async fn reconcile_flux(seed: &KubeStore, ext: &Extension, ctx: &Context) -> Result<Vec<Step>> {
    let namespace = ext
        .namespace()
        .ok_or_else(|| Error::MissingNamespace(ext.name_any()))?;
    let cluster = seed
        .get::<Cluster>(&(), &namespace)
        .await?
        .ok_or_else(|| Error::MissingCluster(namespace.clone()))?;
    let shoot = KubeStore::new(
        shoot_client(seed, &namespace).await?,
        ctx.settings.field_manager.clone(),
    );

    let actuator = Actuator {
        seed,
        shoot: &shoot,
        generator: &ctx.generator,
        metrics: &ctx.metrics,
        install_wait: ctx.settings.install_wait(),
        bootstrap_wait: ctx.settings.bootstrap_wait(),
    };
    Ok(actuator.reconcile(ext, &cluster).await?)
}

// Flux stays on the shoot, it is removed together with the shoot.
async fn cleanup(ext: Arc<Extension>, ctx: Arc<Context>) -> Result<Action> {
    publish(
        &ctx,
        &ext,
        Event {
            type_: EventType::Normal,
            reason: "DeleteRequested".into(),
            note: Some(format!("Delete `{}`", ext.name_any())),
            action: "Deleting".into(),
            secondary: None,
        },
    )
    .await?;
    Ok(Action::await_change())
}

async fn publish(ctx: &Context, ext: &Extension, event: Event) -> Result<()> {
    match ctx
        .diagnostics
        .read()
        .await
        .recorder(ctx.client.clone())
        .publish(&event, &ext.object_ref(&()))
        .await
    {
        // Ignore forbidden errors on namespace deletion
        Err(kube::Error::Api(e)) if &e.reason == "Forbidden" => (),
        e => e?,
    }
    Ok(())
}

// Runs synchronously, the error itself is recorded in the Extension status by `apply`.
#[allow(clippy::needless_pass_by_value)]
pub fn error_policy(ext: Arc<Extension>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {error:?}");
    ctx.metrics.reconcile_failure(ext, error);
    Action::requeue(ctx.settings.error_requeue())
}

/// State shared between the controller and the web server
#[derive(Clone)]
pub struct State {
    /// Diagnostics populated by the reconciler
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics
    metrics: Metrics,
    registry: Registry,
}

impl State {
    /// Create the state with freshly registered metrics.
    ///
    /// # Errors
    ///
    /// Returns `prometheus::Error` if the metrics cannot be registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::default();
        let metrics = Metrics::default().register(&registry)?;
        Ok(Self {
            diagnostics: Arc::default(),
            metrics,
            registry,
        })
    }

    /// Metrics getter
    #[must_use]
    pub fn metrics(&self) -> Vec<MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    // Create a Controller Context that can update State
    #[must_use]
    pub fn to_context(&self, client: Client, settings: Settings) -> Arc<Context> {
        let generator = FluxCli::new(settings.flux_cli.clone(), settings.manifests_base.clone());
        Arc::new(Context {
            client,
            diagnostics: self.diagnostics.clone(),
            metrics: self.metrics.clone(),
            settings,
            generator,
        })
    }
}

/// Run the Extension controller until a shutdown signal is received.
///
/// # Errors
///
/// Fails if no client can be created or the Extension API is not served.
pub async fn run(state: State, settings: Settings) -> Result<()> {
    let client = Client::try_default().await?;
    let extensions = Api::<Extension>::all(client.clone());
    if let Err(e) = extensions.list(&ListParams::default().limit(1)).await {
        error!("Extension CRD is not queryable; {e:?}. Is the CRD installed?");
        return Err(e.into());
    }

    info!("Starting shoot-flux extension controller");
    Controller::new(extensions, watcher::Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile, error_policy, state.to_context(client, settings))
        .for_each(|result| async move {
            match result {
                Ok(obj) => debug!(?obj, "Reconciled"),
                Err(e) => debug!(error = %e, "Reconcile loop error"),
            }
        })
        .await;
    Ok(())
}
