//! Gateway entry point: configuration, store, caches, background workers,
//! HTTP server.

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use llmgate::adaptor::AdaptorRegistry;
use llmgate::balance::BalanceClient;
use llmgate::cache::CacheLayer;
use llmgate::config::Config;
use llmgate::db::Store;
use llmgate::relay::health::{BanPolicy, HealthRegistry};
use llmgate::relay::pipeline::RelayDeps;
use llmgate::server::{self, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(Config::from_env().context("loading configuration")?);

    let store = Store::open(&config.database.sqlite_path, config.database.busy_timeout)
        .await
        .with_context(|| format!("opening database at {}", config.database.sqlite_path))?;
    tracing::info!(path = %config.database.sqlite_path, "database ready");

    let cache = Arc::new(
        CacheLayer::new(store.clone())
            .await
            .context("building caches")?,
    );

    let deps = Arc::new(RelayDeps {
        store: store.clone(),
        cache: cache.clone(),
        health: Arc::new(HealthRegistry::new(BanPolicy {
            error_rate: config.relay.ban_error_rate,
            window: config.relay.ban_window,
        })),
        registry: Arc::new(AdaptorRegistry::builtin()),
        http: reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(30))
            .build()
            .context("building HTTP client")?,
        relay: config.relay.clone(),
    });

    let balance = config.balance.upstream_url.as_ref().map(|url| {
        Arc::new(BalanceClient::new(deps.http.clone(), url.clone()))
    });

    if let Some(client) = balance.clone() {
        tokio::spawn(llmgate::balance::run_sync(
            store,
            cache,
            client,
            config.balance.sync_interval,
            config.balance.min_sync_interval,
        ));
    } else {
        tracing::info!("UPSTREAM_BALANCE_URL unset; login provisioning and balance sync disabled");
    }

    server::serve(AppState {
        deps,
        config,
        balance,
    })
    .await
}
