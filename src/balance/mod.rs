//! Upstream balance integration: login validation and the periodic sync
//! worker for auto-provisioned tokens.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::cache::CacheLayer;
use crate::db::Store;
use crate::error::{ErrorKind, RelayError};

/// Client for the upstream balance endpoint (`GET /api/v3/balance`,
/// Bearer-authenticated). A key is considered valid iff the endpoint
/// accepts it.
pub struct BalanceClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    data: BalanceData,
}

#[derive(Debug, Deserialize)]
struct BalanceData {
    balance: Decimal,
}

impl BalanceClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    /// Validate `key` against the upstream and return its balance.
    pub async fn fetch_balance(&self, key: &str) -> Result<Decimal, RelayError> {
        let url = format!("{}/api/v3/balance", self.base_url.trim_end_matches('/'));
        let resp = self
            .http
            .get(&url)
            .bearer_auth(key)
            .timeout(Duration::from_secs(15))
            .send()
            .await
            .map_err(|e| {
                RelayError::new(
                    ErrorKind::UpstreamRefused,
                    format!("balance endpoint unreachable: {e}"),
                )
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(RelayError::unauthorized(format!(
                "balance endpoint rejected the key (status {status})"
            )));
        }

        let body: BalanceResponse = resp.json().await.map_err(|e| {
            RelayError::new(
                ErrorKind::UpstreamBadResponse,
                format!("invalid balance response: {e}"),
            )
        })?;
        Ok(body.data.balance)
    }
}

/// Merge an upstream balance with the locally tracked quota.
///
/// The local value already reflects debits since the last sync, so taking
/// the maximum never clobbers in-flight spend downward while still picking
/// up top-ups.
pub fn merge_balance(upstream: Decimal, local: Decimal) -> Decimal {
    upstream.max(local)
}

/// One pass over the auto-provisioned tokens: refresh quota for every token
/// whose last sync is older than `min_interval`.
pub async fn sync_once(
    store: &Store,
    cache: &CacheLayer,
    client: &BalanceClient,
    min_interval: Duration,
) {
    let tokens = match store.list_provisioned_tokens().await {
        Ok(tokens) => tokens,
        Err(err) => {
            tracing::error!(error = %err, "balance sync: listing tokens failed");
            return;
        }
    };

    let mut synced = 0usize;
    let mut skipped = 0usize;
    let mut failed = 0usize;

    for token in tokens {
        let recently_synced = token.balance_last_sync.is_some_and(|last| {
            (Utc::now() - last).to_std().unwrap_or(Duration::ZERO) < min_interval
        });
        if recently_synced {
            skipped += 1;
            continue;
        }

        match client.fetch_balance(&token.key).await {
            Ok(upstream) => {
                let merged = merge_balance(upstream, token.quota);
                if let Err(err) = store.set_token_balance(token.id, merged).await {
                    tracing::error!(token_id = token.id, error = %err, "balance update failed");
                    failed += 1;
                    continue;
                }
                cache.invalidate_token(&token.key);
                synced += 1;
            }
            Err(err) => {
                tracing::warn!(
                    token_id = token.id,
                    error = %err,
                    "balance fetch failed, keeping local quota"
                );
                failed += 1;
            }
        }
    }

    if synced + failed > 0 {
        tracing::info!(synced, skipped, failed, "balance sync pass finished");
    }
}

/// Periodic sync loop. Runs one pass immediately, then every `interval`.
pub async fn run_sync(
    store: Store,
    cache: Arc<CacheLayer>,
    client: Arc<BalanceClient>,
    interval: Duration,
    min_interval: Duration,
) {
    tracing::info!(interval_secs = interval.as_secs(), "balance sync worker started");
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        sync_once(&store, &cache, &client, min_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::model::{Group, GroupStatus, Token, TokenStatus, UserType};

    #[test]
    fn merge_never_reduces_local_quota() {
        assert_eq!(merge_balance(dec!(100), dec!(40)), dec!(100));
        assert_eq!(merge_balance(dec!(10), dec!(40)), dec!(40));
        assert_eq!(merge_balance(dec!(0), dec!(0)), dec!(0));
    }

    #[tokio::test]
    async fn fetch_balance_parses_payload() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/balance"))
            .and(header("authorization", "Bearer key-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": 200,
                "data": {"balance": 12.5}
            })))
            .mount(&server)
            .await;

        let client = BalanceClient::new(reqwest::Client::new(), server.uri());
        assert_eq!(client.fetch_balance("key-1").await.unwrap(), dec!(12.5));
    }

    #[tokio::test]
    async fn fetch_balance_rejects_on_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/balance"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = BalanceClient::new(reqwest::Client::new(), server.uri());
        let err = client.fetch_balance("bad").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unauthorized);
    }

    async fn provisioned_store(last_sync: Option<chrono::DateTime<Utc>>) -> (Store, i64) {
        let store = Store::open_in_memory().await.unwrap();
        store
            .insert_group(&Group {
                id: "key-1".into(),
                status: GroupStatus::Enabled,
                rpm_ratio: 1.0,
                tpm_ratio: 1.0,
                available_sets: vec!["default".into()],
                model_mapping: Default::default(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let id = store
            .insert_token(&Token {
                id: 0,
                key: "key-1".into(),
                group_id: "key-1".into(),
                name: "key-1".into(),
                status: TokenStatus::Enabled,
                quota: dec!(40),
                subnets: vec![],
                user_type: UserType::Regular,
                is_provisioned: true,
                balance_last_sync: last_sync,
                model_limits: Default::default(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        (store, id)
    }

    #[tokio::test]
    async fn sync_pass_merges_and_stamps() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/balance"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {"balance": 100.0}
            })))
            .mount(&server)
            .await;

        let (store, id) = provisioned_store(None).await;
        let cache = CacheLayer::new(store.clone()).await.unwrap();
        let client = BalanceClient::new(reqwest::Client::new(), server.uri());

        sync_once(&store, &cache, &client, Duration::from_secs(300)).await;

        let token = store.get_token_by_id(id).await.unwrap();
        assert_eq!(token.quota, dec!(100));
        assert!(token.balance_last_sync.is_some());
    }

    #[tokio::test]
    async fn recently_synced_tokens_are_skipped() {
        let server = MockServer::start().await;
        // Zero expected calls: a fetch would panic on mock verification.
        Mock::given(method("GET"))
            .and(path("/api/v3/balance"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {"balance": 1000.0}
            })))
            .expect(0)
            .mount(&server)
            .await;

        let (store, id) = provisioned_store(Some(Utc::now())).await;
        let cache = CacheLayer::new(store.clone()).await.unwrap();
        let client = BalanceClient::new(reqwest::Client::new(), server.uri());

        sync_once(&store, &cache, &client, Duration::from_secs(300)).await;

        let token = store.get_token_by_id(id).await.unwrap();
        assert_eq!(token.quota, dec!(40));
    }
}
