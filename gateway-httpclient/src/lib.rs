//! HTTP Client Pool: an LRU cache of tuned `reqwest::Client`s keyed by
//! account/proxy identity, with optional SOCKS5/HTTP proxy dialers.
//!
//! Bounded `HashMap` + access-order `VecDeque` rather than an indexmap
//! dependency, hand-rolling the LRU eviction instead of reaching for a
//! dedicated crate.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use gateway_core::{AccountId, ConnectionPoolIsolation, ProxyId};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ClientPoolError {
    #[error("failed to build http client: {0}")]
    Build(#[from] reqwest::Error),
    #[error("proxy construction failed and strict_proxy is enabled: {0}")]
    StrictProxyFailure(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey {
    pub proxy_url: Option<String>,
    pub isolation_id: String,
    pub response_header_timeout_secs: Option<u64>,
    pub insecure: bool,
}

impl ClientKey {
    pub fn new(
        isolation: ConnectionPoolIsolation,
        account_id: &AccountId,
        proxy_id: Option<&ProxyId>,
        proxy_url: Option<String>,
        response_header_timeout_secs: Option<u64>,
        insecure: bool,
    ) -> Self {
        let isolation_id = match isolation {
            ConnectionPoolIsolation::Proxy => {
                proxy_id.map(|p| p.as_str().to_string()).unwrap_or_else(|| "direct".to_string())
            }
            ConnectionPoolIsolation::Account => account_id.as_str().to_string(),
            ConnectionPoolIsolation::AccountProxy => format!(
                "{}:{}",
                account_id.as_str(),
                proxy_id.map(|p| p.as_str()).unwrap_or("direct")
            ),
        };
        Self { proxy_url, isolation_id, response_header_timeout_secs, insecure }
    }
}

struct Entry {
    client: reqwest::Client,
    last_used: Instant,
}

/// Whether a proxy that fails to parse/construct should hard-fail the
/// request (strict) or fall back to a direct client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrictProxyMode {
    Strict,
    FallbackToDirect,
}

pub struct ClientPool {
    entries: Mutex<HashMap<ClientKey, Entry>>,
    order: Mutex<VecDeque<ClientKey>>,
    max_clients: usize,
    idle_ttl: Duration,
    strict_proxy: StrictProxyMode,
}

impl ClientPool {
    pub fn new(max_clients: usize, idle_ttl: Duration, strict_proxy: StrictProxyMode) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            order: Mutex::new(VecDeque::new()),
            max_clients,
            idle_ttl,
            strict_proxy,
        }
    }

    pub fn get_or_build(&self, key: &ClientKey) -> Result<reqwest::Client, ClientPoolError> {
        self.evict_idle();

        {
            let mut entries = self.entries.lock().unwrap();
            if let Some(entry) = entries.get_mut(key) {
                entry.last_used = Instant::now();
                self.touch_order(key);
                return Ok(entry.client.clone());
            }
        }

        let client = self.build_client(key)?;
        self.insert(key.clone(), client.clone());
        Ok(client)
    }

    fn build_client(&self, key: &ClientKey) -> Result<reqwest::Client, ClientPoolError> {
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(32)
            .danger_accept_invalid_certs(key.insecure);

        if let Some(secs) = key.response_header_timeout_secs {
            if secs > 0 {
                builder = builder.connect_timeout(Duration::from_secs(secs));
            }
        }

        if let Some(proxy_url) = &key.proxy_url {
            match build_proxy(proxy_url) {
                Ok(proxy) => builder = builder.proxy(proxy),
                Err(err) => match self.strict_proxy {
                    StrictProxyMode::Strict => {
                        return Err(ClientPoolError::StrictProxyFailure(err));
                    }
                    StrictProxyMode::FallbackToDirect => {
                        warn!(%err, "proxy construction failed, falling back to direct client");
                    }
                },
            }
        }

        Ok(builder.build()?)
    }

    fn insert(&self, key: ClientKey, client: reqwest::Client) {
        let mut entries = self.entries.lock().unwrap();
        let mut order = self.order.lock().unwrap();

        while entries.len() >= self.max_clients {
            if let Some(oldest) = order.pop_front() {
                entries.remove(&oldest);
            } else {
                break;
            }
        }

        entries.insert(key.clone(), Entry { client, last_used: Instant::now() });
        order.push_back(key);
    }

    fn touch_order(&self, key: &ClientKey) {
        let mut order = self.order.lock().unwrap();
        order.retain(|k| k != key);
        order.push_back(key.clone());
    }

    fn evict_idle(&self) {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        let mut order = self.order.lock().unwrap();
        let expired: Vec<ClientKey> = entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_used) > self.idle_ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            entries.remove(&key);
            order.retain(|k| k != &key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

fn build_proxy(proxy_url: &str) -> Result<reqwest::Proxy, String> {
    let scheme = proxy_url.split("://").next().unwrap_or("");
    match scheme {
        "http" | "https" | "socks5" | "socks5h" => {
            reqwest::Proxy::all(proxy_url).map_err(|e| e.to_string())
        }
        other => Err(format!("unsupported proxy scheme: {other}")),
    }
}

pub type SharedClientPool = Arc<ClientPool>;

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str) -> ClientKey {
        ClientKey {
            proxy_url: None,
            isolation_id: id.to_string(),
            response_header_timeout_secs: None,
            insecure: false,
        }
    }

    #[test]
    fn reuses_client_for_same_key() {
        let pool = ClientPool::new(8, Duration::from_secs(300), StrictProxyMode::FallbackToDirect);
        pool.get_or_build(&key("acc-1")).unwrap();
        pool.get_or_build(&key("acc-1")).unwrap();
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn evicts_oldest_beyond_capacity() {
        let pool = ClientPool::new(2, Duration::from_secs(300), StrictProxyMode::FallbackToDirect);
        pool.get_or_build(&key("a")).unwrap();
        pool.get_or_build(&key("b")).unwrap();
        pool.get_or_build(&key("c")).unwrap();
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn unsupported_proxy_scheme_is_rejected() {
        assert!(build_proxy("ftp://example.com").is_err());
        assert!(build_proxy("socks5h://example.com:1080").is_ok());
    }
}
