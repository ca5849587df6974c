use std::sync::Arc;

use crate::Error;
use crate::controllers::Step;
use chrono::{DateTime, Utc};
use kube::{
    Client, ResourceExt,
    runtime::events::{Recorder, Reporter},
};
use prometheus::{
    Histogram, HistogramVec, IntCounter, IntCounterVec, Registry, histogram_opts, opts,
};
use serde::Serialize;
use tokio::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounter,
    pub failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
    pub step_duration: HistogramVec,
}

impl Default for Metrics {
    fn default() -> Self {
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "shoot_flux_controller_reconcile_duration_seconds",
                "The duration of reconcile to complete in seconds"
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60., 300.]),
            &[],
        )
        .unwrap();
        let step_duration = HistogramVec::new(
            histogram_opts!(
                "shoot_flux_controller_step_duration_seconds",
                "The duration of a reconcile step in seconds"
            )
            .buckets(vec![0.1, 0.5, 1., 5., 15., 30., 60., 120., 300.]),
            &["step"],
        )
        .unwrap();
        let failures = IntCounterVec::new(
            opts!(
                "shoot_flux_controller_reconciliation_errors_total",
                "reconciliation errors",
            ),
            &["instance", "error"],
        )
        .unwrap();
        let reconciliations =
            IntCounter::new("shoot_flux_controller_reconciliations_total", "reconciliations")
                .unwrap();
        Metrics {
            reconciliations,
            failures,
            reconcile_duration,
            step_duration,
        }
    }
}

impl Metrics {
    /// Register metrics with the provided registry.
    ///
    /// # Errors
    ///
    /// Returns `prometheus::Error` if a metric with the same name is already registered.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.step_duration.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.reconciliations.clone()))?;
        Ok(self)
    }

    #[allow(clippy::needless_pass_by_value)]
    pub fn reconcile_failure<C: kube::Resource>(&self, obj: Arc<C>, e: &Error) {
        let instance = format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any());
        self.failures
            .with_label_values(&[instance, e.metric_label()])
            .inc();
    }

    #[must_use]
    pub fn count_and_measure(&self) -> DurationMeasurer {
        self.reconciliations.inc();
        DurationMeasurer {
            start: Instant::now(),
            metric: self.reconcile_duration.with_label_values::<&str>(&[]),
        }
    }

    /// Observe the duration of `step` once the returned measurer is dropped.
    #[must_use]
    pub fn measure_step(&self, step: Step) -> DurationMeasurer {
        DurationMeasurer {
            start: Instant::now(),
            metric: self.step_duration.with_label_values(&[step.as_str()]),
        }
    }
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "gardener-extension-shoot-flux".into(),
        }
    }
}

impl Diagnostics {
    pub fn recorder(&self, client: Client) -> Recorder {
        Recorder::new(client, self.reporter.clone())
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram,
/// so an aborted step is measured as well.
pub struct DurationMeasurer {
    start: Instant,
    metric: Histogram,
}

impl Drop for DurationMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric.observe(duration);
    }
}
