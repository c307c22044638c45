//! Subscriber setup for the server binary.

#[cfg(feature = "otel")]
use opentelemetry::trace::TracerProvider as _;
use tracing_subscriber::Layer as _;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

pub const SERVICE_NAME: &str = "ditto-credits";

#[derive(Clone, Debug, Default)]
pub struct TelemetryOptions {
    pub json_logs: bool,
    /// Export spans over OTLP/HTTP. Requires the `otel` feature.
    pub otel: bool,
    pub otel_endpoint: Option<String>,
}

/// Flushes pending spans when dropped. Keep it alive for the process lifetime.
#[derive(Debug, Default)]
pub struct TelemetryGuard {
    #[cfg(feature = "otel")]
    provider: Option<opentelemetry_sdk::trace::SdkTracerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        #[cfg(feature = "otel")]
        if let Some(provider) = self.provider.take() {
            let _ = provider.shutdown();
        }
    }
}

pub fn init_tracing(
    options: &TelemetryOptions,
) -> Result<TelemetryGuard, Box<dyn std::error::Error>> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let fmt_layer = if options.json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(false).boxed()
    };

    let registry = tracing_subscriber::registry().with(env_filter).with(fmt_layer);

    if options.otel {
        #[cfg(feature = "otel")]
        {
            let provider = otel_provider(options.otel_endpoint.as_deref())?;
            let tracer = provider.tracer(SERVICE_NAME);
            registry
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()?;
            return Ok(TelemetryGuard {
                provider: Some(provider),
            });
        }
        #[cfg(not(feature = "otel"))]
        return Err("--otel requires the `otel` feature".into());
    }

    registry.try_init()?;
    Ok(TelemetryGuard::default())
}

#[cfg(feature = "otel")]
fn otel_provider(
    endpoint: Option<&str>,
) -> Result<opentelemetry_sdk::trace::SdkTracerProvider, Box<dyn std::error::Error>> {
    use opentelemetry_otlp::WithExportConfig as _;

    let mut exporter = opentelemetry_otlp::SpanExporter::builder().with_http();
    if let Some(endpoint) = endpoint {
        exporter = exporter.with_endpoint(endpoint.to_string());
    }
    let exporter = exporter.build()?;

    let provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(
            opentelemetry_sdk::Resource::builder_empty()
                .with_service_name(SERVICE_NAME)
                .build(),
        )
        .build();
    opentelemetry::global::set_tracer_provider(provider.clone());
    Ok(provider)
}
