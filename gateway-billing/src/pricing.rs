//! Versioned price table, refreshed periodically from a remote URL and
//! verified against a sha256 sidecar, with a bundled fallback used when
//! the remote is unreachable or the hash never checks out.

use std::collections::HashMap;
use std::sync::Arc;

use gateway_core::PriceTableEntry;
use sha2::{Digest, Sha256};
use tracing::warn;

/// Atomic replace-pointer: readers always see a complete table, writers
/// swap the whole `Arc` rather than mutating entries in place.
#[derive(Clone, Default)]
pub struct PriceTable {
    inner: Arc<HashMap<String, PriceTableEntry>>,
}

impl PriceTable {
    pub fn new(entries: HashMap<String, PriceTableEntry>) -> Self {
        Self { inner: Arc::new(entries) }
    }

    pub fn get(&self, model: &str) -> Option<PriceTableEntry> {
        self.inner.get(model).copied()
    }

    pub fn bundled_fallback() -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            "claude-3-5-sonnet".to_string(),
            PriceTableEntry { input: 3.0e-6, output: 15.0e-6, cache_read: 0.3e-6, cache_creation_5m: 3.75e-6, cache_creation_1h: 6.0e-6 },
        );
        entries.insert(
            "claude-opus-4".to_string(),
            PriceTableEntry { input: 15.0e-6, output: 75.0e-6, cache_read: 1.5e-6, cache_creation_5m: 18.75e-6, cache_creation_1h: 30.0e-6 },
        );
        entries.insert(
            "gpt-4.1".to_string(),
            PriceTableEntry { input: 2.0e-6, output: 8.0e-6, cache_read: 0.5e-6, cache_creation_5m: 0.0, cache_creation_1h: 0.0 },
        );
        entries.insert(
            "gemini-2.5-pro".to_string(),
            PriceTableEntry { input: 1.25e-6, output: 10.0e-6, cache_read: 0.31e-6, cache_creation_5m: 0.0, cache_creation_1h: 0.0 },
        );
        Self::new(entries)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PricingRefreshError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error("sha256 mismatch: expected {expected}, computed {computed}")]
    HashMismatch { expected: String, computed: String },
    #[error("invalid price table body: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Fetches `{url}` and `{url}.sha256`, verifies the body against the
/// sidecar digest. On a hash
/// mismatch the caller retries once after a short delay before falling
/// back, since the sidecar may have been published slightly ahead of the
/// body (a publish race, not a corrupt table).
pub async fn fetch_verified(client: &reqwest::Client, url: &str) -> Result<PriceTable, PricingRefreshError> {
    let body = client.get(url).send().await?.bytes().await?;
    let sidecar = client.get(format!("{url}.sha256")).send().await?.text().await?;
    let expected = sidecar.trim().to_string();

    let mut hasher = Sha256::new();
    hasher.update(&body);
    let computed = hex_encode(&hasher.finalize());

    if computed != expected {
        return Err(PricingRefreshError::HashMismatch { expected, computed });
    }

    let entries: HashMap<String, PriceTableEntry> = serde_json::from_slice(&body)?;
    Ok(PriceTable::new(entries))
}

/// Retry-once-then-fallback loop per the Open Question resolution above.
pub async fn refresh_with_fallback(client: &reqwest::Client, url: &str, retry_delay: std::time::Duration) -> PriceTable {
    match fetch_verified(client, url).await {
        Ok(table) => return table,
        Err(err) => warn!(%err, "pricing refresh failed, retrying once"),
    }

    tokio::time::sleep(retry_delay).await;

    match fetch_verified(client, url).await {
        Ok(table) => table,
        Err(err) => {
            warn!(%err, "pricing refresh failed again, falling back to bundled table");
            PriceTable::bundled_fallback()
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_fallback_covers_all_four_platforms() {
        let table = PriceTable::bundled_fallback();
        assert!(table.get("claude-3-5-sonnet").is_some());
        assert!(table.get("gpt-4.1").is_some());
        assert!(table.get("gemini-2.5-pro").is_some());
    }

    #[test]
    fn unknown_model_returns_none() {
        let table = PriceTable::bundled_fallback();
        assert!(table.get("does-not-exist").is_none());
    }
}
