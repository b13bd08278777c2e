use std::sync::Arc;
use std::time::Duration;

use gateway_auth::Authenticator;
use gateway_billing::{BillingConfig, BillingPipeline, PriceTable};
use gateway_concurrency::ConcurrencySlots;
use gateway_config::GatewayConfig;
use gateway_crypto::MasterKey;
use gateway_httpclient::{ClientPool, StrictProxyMode};
use gateway_kv::RedisKvStore;
use gateway_proxy::ProxyEngine;
use gateway_scheduler::Scheduler;
use gateway_server::{AppState, router};
use gateway_store::{PgAccountRepository, PgApiKeyRepository, PgSubscriptionRepository, PgUsageStore, PgUserRepository};
use sqlx::postgres::PgPoolOptions;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    gateway_telemetry::init_with_config(gateway_telemetry::TelemetryConfig::from_env())
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    let config = GatewayConfig::load("gateway.yaml")?;
    let master_key = MasterKey::from_passphrase(&config.master_secret);

    let pool = PgPoolOptions::new().max_connections(20).connect(&config.database_url).await?;
    let kv: Arc<dyn gateway_kv::KvStore> = Arc::new(RedisKvStore::connect(&config.redis_url).await?);

    let accounts = Arc::new(PgAccountRepository::new(pool.clone(), master_key));
    let users = Arc::new(PgUserRepository::new(pool.clone()));
    let api_keys = Arc::new(PgApiKeyRepository::new(pool.clone()));
    let subscriptions = Arc::new(PgSubscriptionRepository::new(pool.clone()));
    let usage_store = Arc::new(PgUsageStore::new(pool.clone()));

    let concurrency = Arc::new(ConcurrencySlots::new(
        kv.clone(),
        Duration::from_secs(config.scheduling.concurrency_slot_ttl_minutes * 60),
    ));
    tokio::spawn(concurrency.clone().run_sweeper(Duration::from_secs(config.scheduling.slot_cleanup_interval_secs)));

    let scheduler = Scheduler::new(accounts.clone(), concurrency, kv.clone(), config.scheduling.clone());

    let clients = Arc::new(ClientPool::new(
        config.scheduling.max_upstream_clients,
        Duration::from_secs(config.scheduling.client_idle_ttl_seconds),
        StrictProxyMode::FallbackToDirect,
    ));

    let proxy = ProxyEngine::new(scheduler, accounts, clients, config.scheduling.clone(), config.max_retries);

    let prices = match &config.pricing_refresh_url {
        Some(url) => {
            let client = reqwest::Client::new();
            gateway_billing::pricing::refresh_with_fallback(&client, url, Duration::from_secs(5)).await
        }
        None => PriceTable::bundled_fallback(),
    };

    let billing = BillingPipeline {
        users: users.clone(),
        subscriptions,
        usage_store,
        prices,
        config: BillingConfig { simple_mode: config.simple_mode },
    };

    let auth = Authenticator::new(api_keys, users);

    let state = Arc::new(AppState { auth, proxy, billing, max_body_size: config.max_body_size });

    let app = router(state);
    let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
    tracing::info!("gateway listening on 0.0.0.0:8080");
    axum::serve(listener, app).await?;

    Ok(())
}
