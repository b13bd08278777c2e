use serde::{Deserialize, Serialize};

/// Connection-pool keying strategy for `gateway-httpclient`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPoolIsolation {
    Proxy,
    Account,
    AccountProxy,
}

impl Default for ConnectionPoolIsolation {
    fn default() -> Self {
        Self::AccountProxy
    }
}

/// The `gateway-scheduling` config subtree, resolved once at
/// startup from YAML plus env overrides and handed by value to the
/// scheduler, concurrency manager, and HTTP client pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySchedulingConfig {
    pub sticky_session_max_waiting: usize,
    pub sticky_session_wait_timeout_secs: u64,
    pub fallback_max_waiting: usize,
    pub fallback_wait_timeout_secs: u64,
    pub load_batch_enabled: bool,
    pub slot_cleanup_interval_secs: u64,
    pub concurrency_slot_ttl_minutes: u64,
    pub connection_pool_isolation: ConnectionPoolIsolation,
    pub response_header_timeout_secs: u64,
    pub failover_on_400: bool,
    pub inject_beta_for_apikey: bool,
    pub max_upstream_clients: usize,
    pub client_idle_ttl_seconds: u64,
    pub overload_cooldown_minutes: i64,
    /// TTL for the sticky-session-id -> account-id affinity record.
    pub sticky_affinity_ttl_secs: u64,
}

impl Default for GatewaySchedulingConfig {
    fn default() -> Self {
        Self {
            sticky_session_max_waiting: 16,
            sticky_session_wait_timeout_secs: 30,
            fallback_max_waiting: 64,
            fallback_wait_timeout_secs: 30,
            load_batch_enabled: true,
            slot_cleanup_interval_secs: 60,
            concurrency_slot_ttl_minutes: 10,
            connection_pool_isolation: ConnectionPoolIsolation::default(),
            response_header_timeout_secs: 30,
            failover_on_400: false,
            inject_beta_for_apikey: true,
            max_upstream_clients: 256,
            client_idle_ttl_seconds: 300,
            overload_cooldown_minutes: 5,
            sticky_affinity_ttl_secs: 3600,
        }
    }
}
