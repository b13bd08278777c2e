//! Gateway-wide configuration: a flat struct loaded from a YAML file and
//! then overridden field-by-field from the process environment, in the
//! same plain-struct-plus-env-var style `gateway-telemetry`'s
//! `TelemetryConfig::from_env` uses — no `config` crate, no generic
//! deserialize-from-env layer.

use std::path::Path;

use gateway_core::GatewaySchedulingConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: String, source: std::io::Error },
    #[error("failed to parse config file {path}: {source}")]
    Parse { path: String, source: serde_yaml::Error },
    #[error("invalid value for env var {name}: {value}")]
    InvalidEnvValue { name: String, value: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub database_url: String,
    pub redis_url: String,
    pub master_secret: String,
    pub simple_mode: bool,
    pub pricing_refresh_url: Option<String>,
    pub max_body_size: usize,
    pub overload_cooldown_minutes: i64,
    pub check_interval_minutes: u64,
    pub refresh_before_expiry_hours: i64,
    pub max_retries: u32,
    pub retry_backoff_seconds: u64,
    #[serde(flatten)]
    pub scheduling: GatewaySchedulingConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/gateway".to_string(),
            redis_url: "redis://localhost:6379".to_string(),
            master_secret: String::new(),
            simple_mode: false,
            pricing_refresh_url: None,
            max_body_size: 10 * 1024 * 1024,
            overload_cooldown_minutes: 5,
            check_interval_minutes: 5,
            refresh_before_expiry_hours: 1,
            max_retries: 3,
            retry_backoff_seconds: 2,
            scheduling: GatewaySchedulingConfig::default(),
        }
    }
}

impl GatewayConfig {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.display().to_string(), source })?;
        let config = serde_yaml::from_str(&contents)
            .map_err(|source| ConfigError::Parse { path: path.display().to_string(), source })?;
        Ok(config)
    }

    /// Loads from `path` if it exists, falling back to defaults, then
    /// applies `GATEWAY__*` environment overrides on top.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = if path.exists() { Self::from_yaml_file(path)? } else { Self::default() };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Applies `GATEWAY__SECTION__FIELD`-style overrides. Top-level fields
    /// use `GATEWAY__FIELD`; scheduling fields nest under
    /// `GATEWAY__SCHEDULING__FIELD`.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(v) = std::env::var("GATEWAY__DATABASE_URL") {
            self.database_url = v;
        }
        if let Ok(v) = std::env::var("GATEWAY__REDIS_URL") {
            self.redis_url = v;
        }
        if let Ok(v) = std::env::var("GATEWAY__MASTER_SECRET") {
            self.master_secret = v;
        }
        if let Ok(v) = std::env::var("GATEWAY__SIMPLE_MODE") {
            self.simple_mode = parse_bool("GATEWAY__SIMPLE_MODE", &v)?;
        }
        if let Ok(v) = std::env::var("GATEWAY__PRICING_REFRESH_URL") {
            self.pricing_refresh_url = Some(v);
        }
        if let Ok(v) = std::env::var("GATEWAY__MAX_BODY_SIZE") {
            self.max_body_size = parse_num("GATEWAY__MAX_BODY_SIZE", &v)?;
        }
        if let Ok(v) = std::env::var("GATEWAY__OVERLOAD_COOLDOWN_MINUTES") {
            self.overload_cooldown_minutes = parse_num("GATEWAY__OVERLOAD_COOLDOWN_MINUTES", &v)?;
        }
        if let Ok(v) = std::env::var("GATEWAY__CHECK_INTERVAL_MINUTES") {
            self.check_interval_minutes = parse_num("GATEWAY__CHECK_INTERVAL_MINUTES", &v)?;
        }
        if let Ok(v) = std::env::var("GATEWAY__REFRESH_BEFORE_EXPIRY_HOURS") {
            self.refresh_before_expiry_hours = parse_num("GATEWAY__REFRESH_BEFORE_EXPIRY_HOURS", &v)?;
        }
        if let Ok(v) = std::env::var("GATEWAY__MAX_RETRIES") {
            self.max_retries = parse_num("GATEWAY__MAX_RETRIES", &v)?;
        }
        if let Ok(v) = std::env::var("GATEWAY__RETRY_BACKOFF_SECONDS") {
            self.retry_backoff_seconds = parse_num("GATEWAY__RETRY_BACKOFF_SECONDS", &v)?;
        }
        if let Ok(v) = std::env::var("GATEWAY__SCHEDULING__RESPONSE_HEADER_TIMEOUT_SECS") {
            self.scheduling.response_header_timeout_secs = parse_num("GATEWAY__SCHEDULING__RESPONSE_HEADER_TIMEOUT_SECS", &v)?;
        }
        if let Ok(v) = std::env::var("GATEWAY__SCHEDULING__FAILOVER_ON_400") {
            self.scheduling.failover_on_400 = parse_bool("GATEWAY__SCHEDULING__FAILOVER_ON_400", &v)?;
        }
        if let Ok(v) = std::env::var("GATEWAY__SCHEDULING__INJECT_BETA_FOR_APIKEY") {
            self.scheduling.inject_beta_for_apikey = parse_bool("GATEWAY__SCHEDULING__INJECT_BETA_FOR_APIKEY", &v)?;
        }
        if let Ok(v) = std::env::var("GATEWAY__SCHEDULING__MAX_UPSTREAM_CLIENTS") {
            self.scheduling.max_upstream_clients = parse_num("GATEWAY__SCHEDULING__MAX_UPSTREAM_CLIENTS", &v)?;
        }

        Ok(())
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(ConfigError::InvalidEnvValue { name: name.to_string(), value: value.to_string() }),
    }
}

fn parse_num<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidEnvValue { name: name.to_string(), value: value.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_are_sane() {
        let config = GatewayConfig::default();
        assert!(!config.simple_mode);
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn env_override_replaces_database_url() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe {
            std::env::set_var("GATEWAY__DATABASE_URL", "postgres://override/gateway");
        }
        let mut config = GatewayConfig::default();
        config.apply_env_overrides().unwrap();
        assert_eq!(config.database_url, "postgres://override/gateway");
        unsafe {
            std::env::remove_var("GATEWAY__DATABASE_URL");
        }
    }

    #[test]
    fn invalid_bool_override_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe {
            std::env::set_var("GATEWAY__SIMPLE_MODE", "maybe");
        }
        let mut config = GatewayConfig::default();
        let result = config.apply_env_overrides();
        assert!(result.is_err());
        unsafe {
            std::env::remove_var("GATEWAY__SIMPLE_MODE");
        }
    }

    #[test]
    fn missing_yaml_file_falls_back_to_defaults() {
        let config = GatewayConfig::load("/nonexistent/gateway.yaml").unwrap();
        assert_eq!(config.database_url, GatewayConfig::default().database_url);
    }
}
