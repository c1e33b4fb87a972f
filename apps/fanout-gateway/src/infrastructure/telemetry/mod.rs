//! Logging and Trace Export
//!
//! Gateway logs go to stdout through `tracing-subscriber`. Hub, pump and
//! store events carry `client_id`, `event_type` and `reason` as fields
//! rather than in the message text. When `OTEL_ENABLED` is not "false",
//! spans are also exported over OTLP to `OTEL_EXPORTER_OTLP_ENDPOINT`
//! under `OTEL_SERVICE_NAME`.
//!
//! `RUST_LOG` extends the built-in filter, which keeps the gateway at
//! `info` and quiets the HTTP and Redis client crates.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Service name attached to exported spans.
const DEFAULT_SERVICE_NAME: &str = "fanout-gateway";

/// Collector address when `OTEL_EXPORTER_OTLP_ENDPOINT` is unset.
const DEFAULT_OTLP_ENDPOINT: &str = "http://localhost:4318";

/// Filter directives applied on top of `RUST_LOG`.
const LOG_DIRECTIVES: [&str; 4] = [
    "fanout_gateway=info",
    "axum=info",
    "hyper=warn",
    "redis=warn",
];

/// Flushes and stops span export when dropped. Hold it for the life of
/// the process.
pub struct TelemetryGuard {
    tracer_provider: Option<SdkTracerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.tracer_provider.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("span export did not flush cleanly: {e}");
        }
    }
}

/// Span export settings. Stdout logging is always on.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Export spans over OTLP.
    pub enabled: bool,
    /// Collector address.
    pub otlp_endpoint: String,
    /// `service.name` resource attribute.
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            otlp_endpoint: DEFAULT_OTLP_ENDPOINT.to_string(),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
        }
    }
}

impl TelemetryConfig {
    /// Read the `OTEL_*` variables from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the `OTEL_*` variables through `lookup`.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let enabled = lookup("OTEL_ENABLED").is_none_or(|v| !v.eq_ignore_ascii_case("false"));

        let otlp_endpoint =
            lookup("OTEL_EXPORTER_OTLP_ENDPOINT").unwrap_or_else(|| DEFAULT_OTLP_ENDPOINT.to_string());

        let service_name =
            lookup("OTEL_SERVICE_NAME").unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string());

        Self {
            enabled,
            otlp_endpoint,
            service_name,
        }
    }
}

/// Install the global subscriber using `OTEL_*` variables.
#[must_use]
pub fn init() -> TelemetryGuard {
    init_with_config(TelemetryConfig::from_env())
}

/// Install the global subscriber.
///
/// If the OTLP exporter cannot be built the gateway keeps logging to
/// stdout without span export.
#[must_use]
pub fn init_with_config(config: TelemetryConfig) -> TelemetryGuard {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    let exporter = config.enabled.then(|| {
        opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(&config.otlp_endpoint)
            .build()
    });

    let (tracer_provider, export_error) = match exporter {
        Some(Ok(exporter)) => {
            let provider = SdkTracerProvider::builder()
                .with_batch_exporter(exporter)
                .with_resource(
                    opentelemetry_sdk::Resource::builder()
                        .with_service_name(config.service_name.clone())
                        .build(),
                )
                .build();
            (Some(provider), None)
        }
        Some(Err(e)) => (None, Some(e.to_string())),
        None => (None, None),
    };

    let otel_layer = tracer_provider.as_ref().map(|provider| {
        tracing_opentelemetry::layer().with_tracer(provider.tracer(config.service_name.clone()))
    });

    tracing_subscriber::registry()
        .with(log_filter())
        .with(fmt_layer)
        .with(otel_layer)
        .init();

    if let Some(error) = export_error {
        tracing::warn!(
            endpoint = %config.otlp_endpoint,
            error = %error,
            "OTLP exporter unavailable, spans will not be exported"
        );
    }

    TelemetryGuard { tracer_provider }
}

/// `RUST_LOG` plus the gateway's own directives.
fn log_filter() -> EnvFilter {
    LOG_DIRECTIVES
        .iter()
        .filter_map(|raw| raw.parse::<Directive>().ok())
        .fold(EnvFilter::from_default_env(), EnvFilter::add_directive)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = TelemetryConfig::default();
        assert!(config.enabled);
        assert_eq!(config.otlp_endpoint, DEFAULT_OTLP_ENDPOINT);
        assert_eq!(config.service_name, DEFAULT_SERVICE_NAME);
    }

    #[test]
    fn log_directives_parse() {
        for raw in LOG_DIRECTIVES {
            assert!(raw.parse::<Directive>().is_ok(), "{raw}");
        }
    }

    #[test]
    fn otel_can_be_switched_off() {
        let config = TelemetryConfig::from_lookup(|key| {
            (key == "OTEL_ENABLED").then(|| "FALSE".to_string())
        });
        assert!(!config.enabled);
        assert_eq!(config.service_name, "fanout-gateway");
    }

    #[test]
    fn overrides_endpoint_and_service_name() {
        let config = TelemetryConfig::from_lookup(|key| match key {
            "OTEL_EXPORTER_OTLP_ENDPOINT" => Some("http://collector:4317".to_string()),
            "OTEL_SERVICE_NAME" => Some("gateway-eu".to_string()),
            _ => None,
        });
        assert!(config.enabled);
        assert_eq!(config.otlp_endpoint, "http://collector:4317");
        assert_eq!(config.service_name, "gateway-eu");
    }
}
