//! Observability
//!
//! Console logging through `tracing-subscriber`, plus OTLP span export when
//! `OTEL_EXPORTER_OTLP_ENDPOINT` is set.

use opentelemetry::trace::TracerProvider;
use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::{propagation::TraceContextPropagator, runtime, trace as sdktrace, Resource};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

pub const DEFAULT_FILTER: &str = "evidence_locker=info,tower_http=info";
pub const OTLP_ENDPOINT_VAR: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

/// Flushes exported spans on drop. Hold it for the life of the process.
pub struct OtelGuard {
    exporting: bool,
}

impl OtelGuard {
    pub fn is_exporting(&self) -> bool {
        self.exporting
    }
}

impl Drop for OtelGuard {
    fn drop(&mut self) {
        if self.exporting {
            global::shutdown_tracer_provider();
        }
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber. Must run inside the Tokio runtime when
/// OTLP export is enabled.
pub fn init_telemetry(service_name: &str) -> anyhow::Result<OtelGuard> {
    let otlp_enabled = std::env::var(OTLP_ENDPOINT_VAR)
        .map(|v| !v.trim().is_empty())
        .unwrap_or(false);

    if !otlp_enabled {
        Registry::default()
            .with(env_filter())
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()?;
        return Ok(OtelGuard { exporting: false });
    }

    global::set_text_map_propagator(TraceContextPropagator::new());

    let exporter = opentelemetry_otlp::new_exporter().tonic().build_span_exporter()?;

    let trace_config = sdktrace::Config::default().with_resource(Resource::new(vec![
        KeyValue::new("service.name", service_name.to_string()),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ]));

    let provider = sdktrace::TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_config(trace_config)
        .build();

    global::set_tracer_provider(provider.clone());

    // sdktrace::Tracer, not the boxed global one: the layer needs PreSampledTracer.
    let tracer = provider.tracer(service_name.to_string());
    let telemetry = tracing_opentelemetry::layer().with_tracer(tracer);

    Registry::default()
        .with(env_filter())
        .with(telemetry)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()?;

    Ok(OtelGuard { exporting: true })
}
