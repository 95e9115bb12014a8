use anyhow::Result;
use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::Protocol;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, trace as sdktrace};
use opentelemetry_stdout::SpanExporter;
use std::borrow::Cow;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::{Registry, prelude::*};

/// Output format of the fmt layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl LogFormat {
    pub fn parse(mode: &str) -> Self {
        match mode {
            "json" => LogFormat::Json,
            "pretty" => LogFormat::Pretty,
            _ => LogFormat::Compact,
        }
    }
}

/// `RUST_LOG` wins, otherwise info for everything.
fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize tracing + OpenTelemetry tracer provider.
///
/// Spans go to the OTLP endpoint when one is given, else to stdout. The
/// returned provider should be shut down on exit to flush pending spans.
pub fn init(
    service_name: &str,
    otlp_endpoint: Option<&str>,
    logging_mode: &str,
) -> Result<sdktrace::SdkTracerProvider> {
    let resource = Resource::builder()
        .with_service_name(Cow::Owned(service_name.to_string()))
        .with_attributes(vec![KeyValue::new("service.version", env!("CARGO_PKG_VERSION"))])
        .build();

    let tracer_provider = match otlp_endpoint.filter(|e| !e.is_empty()) {
        Some(endpoint) => {
            let exporter = opentelemetry_otlp::SpanExporter::builder()
                .with_http()
                .with_protocol(Protocol::HttpBinary)
                .with_endpoint(endpoint)
                .build()?;
            sdktrace::SdkTracerProvider::builder()
                .with_batch_exporter(exporter)
                .with_resource(resource)
                .build()
        }
        None => sdktrace::SdkTracerProvider::builder()
            .with_simple_exporter(SpanExporter::default())
            .with_resource(resource)
            .build(),
    };

    let tracer = tracer_provider.tracer(Cow::Owned(service_name.to_string()));
    let otel_layer = OpenTelemetryLayer::new(tracer);

    // boxed so the three formats unify
    let fmt_layer: Box<dyn tracing_subscriber::Layer<_> + Send + Sync> = match LogFormat::parse(logging_mode) {
        LogFormat::Json => Box::new(
            fmt::layer()
                .json()
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_filter(env_filter()),
        ),
        LogFormat::Pretty => Box::new(fmt::layer().pretty().with_filter(env_filter())),
        LogFormat::Compact => Box::new(fmt::layer().with_filter(env_filter())),
    };

    let subscriber = Registry::default().with(fmt_layer).with(otel_layer);
    tracing::subscriber::set_global_default(subscriber)?;

    Ok(tracer_provider)
}
