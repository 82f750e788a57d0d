//! Tracing, metrics and logs for the occupation service.
//!
//! Every process (the `spoolctl` binary, test harnesses) calls
//! [`init_telemetry`] once. With an OTLP collector configured, spans, the
//! `occupation.*` instruments and `tracing` records all ship to it and are
//! echoed compactly to stderr. Without one, records go to stderr only and
//! metric instruments record into the no-op global provider.

pub mod metrics;
pub mod occupation;

use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;

use crate::error::{Error, Result};

/// Instrumentation scope for spans emitted by this crate.
const TRACER_SCOPE: &str = "spool-occupation";

/// Where and how the service reports.
pub struct TelemetryConfig {
    /// OTLP gRPC collector, e.g. "http://localhost:4317". `None` keeps
    /// everything on stderr.
    pub endpoint: Option<String>,
    /// `service.name` on every exported signal.
    pub service_name: String,
    /// Filter used when `RUST_LOG` is not set.
    pub log_level: String,
}

/// Owns the OTLP providers. Dropping it flushes and shuts them down, so
/// hold it until the process exits.
pub struct TelemetryGuard {
    exporters: Option<Exporters>,
}

struct Exporters {
    traces: SdkTracerProvider,
    metrics: SdkMeterProvider,
    logs: SdkLoggerProvider,
}

impl TelemetryGuard {
    /// Push out anything still buffered. A no-op on the stderr-only setup.
    pub fn force_flush(&self) {
        if let Some(exporters) = &self.exporters {
            let _ = exporters.traces.force_flush();
            let _ = exporters.metrics.force_flush();
            let _ = exporters.logs.force_flush();
        }
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        // Logs first so shutdown records from the other pipelines still ship.
        if let Some(exporters) = self.exporters.take() {
            let _ = exporters.logs.shutdown();
            let _ = exporters.metrics.shutdown();
            let _ = exporters.traces.shutdown();
        }
    }
}

/// Install the global subscriber (and, with an endpoint, the OTLP
/// providers).
///
/// # Errors
///
/// Fails if an OTLP exporter cannot be built, or if a global subscriber is
/// already installed in this process.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    use opentelemetry::trace::TracerProvider as _;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let Some(endpoint) = config.endpoint else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(|e| Error::Other(format!("failed to init tracing subscriber: {e}")))?;
        return Ok(TelemetryGuard { exporters: None });
    };

    let exporters = otlp_exporters(&endpoint, service_resource(config.service_name))?;
    opentelemetry::global::set_meter_provider(exporters.metrics.clone());

    let spans = tracing_opentelemetry::layer().with_tracer(exporters.traces.tracer(TRACER_SCOPE));
    let records =
        opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new(&exporters.logs);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .with(spans)
        .with(records)
        .try_init()
        .map_err(|e| Error::Other(format!("failed to init tracing subscriber: {e}")))?;

    Ok(TelemetryGuard {
        exporters: Some(exporters),
    })
}

fn service_resource(service_name: String) -> Resource {
    Resource::builder()
        .with_service_name(service_name)
        .with_attribute(opentelemetry::KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
            env!("CARGO_PKG_VERSION"),
        ))
        .build()
}

/// Traces and logs are batched; metrics export on the SDK's periodic reader.
fn otlp_exporters(endpoint: &str, resource: Resource) -> Result<Exporters> {
    use opentelemetry_otlp::WithExportConfig as _;

    let exporter_error =
        |signal: &str, e: opentelemetry_otlp::ExporterBuildError| {
            Error::Other(format!("failed to create OTLP {signal} exporter: {e}"))
        };

    let span_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| exporter_error("span", e))?;
    let metric_exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| exporter_error("metric", e))?;
    let log_exporter = opentelemetry_otlp::LogExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| exporter_error("log", e))?;

    Ok(Exporters {
        traces: SdkTracerProvider::builder()
            .with_batch_exporter(span_exporter)
            .with_resource(resource.clone())
            .build(),
        metrics: SdkMeterProvider::builder()
            .with_periodic_exporter(metric_exporter)
            .with_resource(resource.clone())
            .build(),
        logs: SdkLoggerProvider::builder()
            .with_batch_exporter(log_exporter)
            .with_resource(resource)
            .build(),
    })
}
