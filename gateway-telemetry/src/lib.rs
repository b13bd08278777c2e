//! Structured logging and optional OTLP tracing export, shared by every
//! `gateway-*` binary.

mod init;

pub use init::{TelemetryConfig, init_telemetry, init_with_config, init_with_otlp, shutdown_telemetry};
