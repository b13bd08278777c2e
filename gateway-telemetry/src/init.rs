//! Telemetry initialization and configuration.

use std::sync::Once;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Configuration for the telemetry system. Built either explicitly or
/// from the process environment via [`TelemetryConfig::from_env`].
#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub otlp_endpoint: Option<String>,
    pub default_level: Option<String>,
    pub log_directives: Vec<String>,
    pub json: bool,
}

impl TelemetryConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self { service_name: service_name.into(), ..Default::default() }
    }

    /// Enable OTLP export to the specified collector endpoint.
    pub fn with_otlp(mut self, endpoint: impl Into<String>) -> Self {
        self.otlp_endpoint = Some(endpoint.into());
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.default_level = Some(level.into());
        self
    }

    pub fn with_log_directive(mut self, directive: impl Into<String>) -> Self {
        self.log_directives.push(directive.into());
        self
    }

    pub fn with_json(mut self) -> Self {
        self.json = true;
        self
    }

    /// Loads configuration from the process environment.
    ///
    /// - `GATEWAY_SERVICE_NAME` (default: "gateway")
    /// - `GATEWAY_OTLP_ENDPOINT`
    /// - `GATEWAY_LOG_LEVEL` (default: "info")
    /// - `GATEWAY_LOG_JSON` ("true" to switch the console layer to JSON)
    pub fn from_env() -> Self {
        let service_name = std::env::var("GATEWAY_SERVICE_NAME").unwrap_or_else(|_| "gateway".to_string());
        let otlp_endpoint = std::env::var("GATEWAY_OTLP_ENDPOINT").ok();
        let default_level = std::env::var("GATEWAY_LOG_LEVEL").ok();
        let json = std::env::var("GATEWAY_LOG_JSON").map(|v| v == "true").unwrap_or(false);

        Self { service_name, otlp_endpoint, default_level, log_directives: Vec::new(), json }
    }
}

/// Initializes telemetry with console logging only.
pub fn init_telemetry(service_name: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_with_config(TelemetryConfig::new(service_name))
}

/// Initializes telemetry with OpenTelemetry OTLP trace export in addition
/// to console logging.
pub fn init_with_otlp(service_name: &str, endpoint: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_with_config(TelemetryConfig::new(service_name).with_otlp(endpoint))
}

/// Shuts down the global tracer provider, flushing any pending spans.
pub fn shutdown_telemetry() {
    opentelemetry::global::shutdown_tracer_provider();
}

/// Unified initialization, called once per process regardless of how many
/// times it's invoked — later calls are silently ignored.
pub fn init_with_config(config: TelemetryConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    INIT.call_once(|| {
        let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            let level = config.default_level.as_deref().unwrap_or("info");
            EnvFilter::try_new(level).expect("invalid default log level")
        });

        for directive in &config.log_directives {
            filter = filter.add_directive(directive.parse().expect("invalid log directive"));
        }

        let fmt_layer = tracing_subscriber::fmt::layer().with_target(true).with_thread_ids(true).with_line_number(true);

        let otlp_layer = config.otlp_endpoint.as_ref().map(|endpoint| {
            use opentelemetry_otlp::WithExportConfig;
            use tracing_opentelemetry::OpenTelemetryLayer;

            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(opentelemetry_otlp::new_exporter().tonic().with_endpoint(endpoint))
                .with_trace_config(opentelemetry_sdk::trace::config().with_resource(opentelemetry_sdk::Resource::new(
                    vec![opentelemetry::KeyValue::new("service.name", config.service_name.clone())],
                )))
                .install_batch(opentelemetry_sdk::runtime::Tokio)
                .expect("failed to install OTLP pipeline");

            OpenTelemetryLayer::new(tracer)
        });

        let registry = tracing_subscriber::registry().with(filter).with(fmt_layer).with(otlp_layer);
        registry.init();

        tracing::info!(
            service.name = config.service_name,
            otlp.enabled = config.otlp_endpoint.is_some(),
            log.level = config.default_level.as_deref().unwrap_or("env"),
            "telemetry initialized",
        );
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_env_defaults_service_name_when_unset() {
        unsafe {
            std::env::remove_var("GATEWAY_SERVICE_NAME");
        }
        let config = TelemetryConfig::from_env();
        assert_eq!(config.service_name, "gateway");
    }

    #[test]
    fn builder_methods_set_expected_fields() {
        let config = TelemetryConfig::new("gateway-proxy").with_otlp("http://localhost:4317").with_log_level("debug");
        assert_eq!(config.otlp_endpoint.as_deref(), Some("http://localhost:4317"));
        assert_eq!(config.default_level.as_deref(), Some("debug"));
    }
}
