use clap::ValueEnum;
use opentelemetry::trace::TraceId;
use thiserror::Error;
use tracing_subscriber::{EnvFilter, Registry, prelude::*};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("failed to install subscriber: {0}")]
    Subscriber(#[from] tracing::subscriber::SetGlobalDefaultError),

    #[error("failed to initialize tracer: {0}")]
    Tracer(String),
}

/// Fetch an `opentelemetry::trace::TraceId` as hex through the full tracing stack
#[must_use]
pub fn get_trace_id() -> TraceId {
    use opentelemetry::trace::TraceContextExt as _;
    use tracing_opentelemetry::OpenTelemetrySpanExt as _;

    tracing::Span::current()
        .context()
        .span()
        .span_context()
        .trace_id()
}

/// Initialize tracing. Spans are exported over OTLP with the `telemetry` feature, the
/// collector is read from `OPENTELEMETRY_ENDPOINT_URL`.
pub fn init(format: LogFormat) -> Result<(), TelemetryError> {
    let logger = match format {
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
        LogFormat::Compact => tracing_subscriber::fmt::layer().compact().boxed(),
    };
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    let collector = Registry::default().with(logger).with(env_filter);

    #[cfg(feature = "telemetry")]
    let collector = {
        use opentelemetry::trace::TracerProvider as _;
        use opentelemetry_otlp::WithExportConfig as _;

        let endpoint = std::env::var("OPENTELEMETRY_ENDPOINT_URL")
            .unwrap_or_else(|_| "http://localhost:4317".to_string());
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| TelemetryError::Tracer(e.to_string()))?;
        let provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
            .with_resource(
                opentelemetry_sdk::Resource::builder()
                    .with_service_name("gardener-extension-shoot-flux")
                    .build(),
            )
            .with_batch_exporter(exporter)
            .build();
        opentelemetry::global::set_tracer_provider(provider.clone());
        let tracer = provider.tracer("gardener-extension-shoot-flux");
        collector.with(tracing_opentelemetry::layer().with_tracer(tracer))
    };

    tracing::subscriber::set_global_default(collector)?;
    Ok(())
}
