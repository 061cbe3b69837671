//! The relay pipeline: the request-scoped state machine that carries every
//! inference call from admission to settlement.
//!
//! ```text
//! ENTRY -> AUTH -> ADMIT -> ROUTE -> PRE_USAGE -> DISPATCH -> TRANSLATE -> POST_USAGE -> DONE
//!                             ^                        |
//!                             +-- retryable failure ---+   (fatal -> FAIL)
//! ```
//!
//! AUTH/ADMIT live in the server's middleware; everything from ROUTE on is
//! here. Retryable failures re-enter ROUTE with the failed channel
//! excluded. Streaming responses settle through a guard that fires when the
//! response body is dropped, which also covers client disconnects.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde_json::Value;

use crate::adaptor::sse::SharedOutcome;
use crate::adaptor::{Adaptor, AdaptorRegistry, RelayPayload};
use crate::cache::{CacheLayer, ModelSnapshot};
use crate::config::RelayConfig;
use crate::db::Store;
use crate::error::{ErrorKind, RelayError};
use crate::model::{Channel, Group, Token};
use crate::relay::billing::{self, Outcome, SettleContext};
use crate::relay::estimate;
use crate::relay::health::HealthRegistry;
use crate::relay::meta::RequestMeta;
use crate::relay::mode::Mode;
use crate::relay::router;

/// Shared collaborators the pipeline needs; the server composes one at boot.
pub struct RelayDeps {
    pub store: Store,
    pub cache: Arc<CacheLayer>,
    pub health: Arc<HealthRegistry>,
    pub registry: Arc<AdaptorRegistry>,
    pub http: reqwest::Client,
    pub relay: RelayConfig,
}

/// Outcome of admission, attached to the request by the auth middleware.
#[derive(Clone)]
pub struct Admission {
    pub token: Arc<Token>,
    pub group: Arc<Group>,
    pub snapshot: Arc<ModelSnapshot>,
    pub is_admin: bool,
}

/// One client request as seen by the pipeline.
pub struct RelayRequest {
    pub mode: Mode,
    pub body: Bytes,
    pub content_type: Option<String>,
    /// Model taken from the URL path (Gemini-native), overriding the body.
    pub model_hint: Option<String>,
    /// Streaming negotiated outside the body (Accept header, path action).
    pub stream_hint: bool,
}

/// What goes back to the client.
pub enum RelayResponse {
    Json {
        status: u16,
        content_type: String,
        body: Bytes,
    },
    Stream {
        status: u16,
        stream: BoxStream<'static, Result<Bytes, RelayError>>,
    },
}

impl std::fmt::Debug for RelayResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayResponse::Json {
                status,
                content_type,
                body,
            } => f
                .debug_struct("Json")
                .field("status", status)
                .field("content_type", content_type)
                .field("body", body)
                .finish(),
            RelayResponse::Stream { status, .. } => {
                f.debug_struct("Stream").field("status", status).finish()
            }
        }
    }
}

/// Relay one request end to end. Exactly one log row is produced: here for
/// errors and buffered responses, by the stream guard for streams.
pub async fn relay(
    deps: &RelayDeps,
    admission: Admission,
    request: RelayRequest,
) -> Result<RelayResponse, RelayError> {
    let mut meta = RequestMeta::new(
        request.mode,
        admission.token.clone(),
        admission.group.clone(),
        admission.is_admin,
    );
    meta.request_content_type = request.content_type.clone();

    match run(deps, &admission, &request, &mut meta).await {
        Ok(response) => Ok(response),
        Err(error) => {
            tracing::warn!(
                request_id = %meta.request_id,
                mode = %meta.mode,
                model = %meta.origin_model,
                kind = error.kind.as_str(),
                error = %error.message,
                "relay failed"
            );
            let ctx = SettleContext::from_meta(&meta, deps.store.clone(), deps.cache.clone());
            billing::settle(
                ctx,
                Outcome::Error {
                    error: error.clone(),
                },
            )
            .await;
            Err(error)
        }
    }
}

async fn run(
    deps: &RelayDeps,
    admission: &Admission,
    request: &RelayRequest,
    meta: &mut RequestMeta,
) -> Result<RelayResponse, RelayError> {
    let parsed: Option<Value> = if request.mode.has_json_body() {
        if request.body.is_empty() {
            return Err(RelayError::validation("request body is required"));
        }
        Some(serde_json::from_slice(&request.body)?)
    } else {
        None
    };

    // ROUTE stage A: resolve the model name.
    let requested = request
        .model_hint
        .clone()
        .or_else(|| {
            parsed
                .as_ref()
                .and_then(|v| v.get("model"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .ok_or_else(|| RelayError::validation("model is required").with_param("model"))?;

    let (origin, actual) = router::resolve_model(&requested, &admission.group);
    meta.origin_model = origin;
    meta.upstream_model = actual.clone();
    meta.actual_model = actual;

    let config = admission
        .snapshot
        .model_config(&meta.actual_model)
        .cloned()
        .ok_or_else(|| {
            RelayError::new(
                ErrorKind::NotFound,
                format!("model {} does not exist", meta.actual_model),
            )
            .with_param("model")
        })?;
    if !meta.mode.accepts_catalog_mode(config.mode) {
        return Err(RelayError::validation(format!(
            "model {} is a {} model and cannot serve {}",
            meta.actual_model, config.mode, meta.mode
        )));
    }
    meta.model_config = Some(config.clone());

    meta.stream = request.stream_hint
        || parsed
            .as_ref()
            .and_then(|v| v.get("stream"))
            .and_then(Value::as_bool)
            .unwrap_or(false);

    // PRE_USAGE: admission-only estimate, never billed.
    if !meta.is_admin {
        let estimated = parsed
            .as_ref()
            .map(|v| estimate::estimate_input_tokens(meta.mode, v))
            .unwrap_or(0);
        billing::admission_check(&config, meta.token.quota, estimated)?;
    }

    // ROUTE stage B + DISPATCH, with failover.
    let max_attempts = deps.relay.max_retry.max(1);
    let timeout = deps.relay.timeout_for(meta.mode);
    let mut exclude: HashSet<i64> = HashSet::new();
    let mut last_error: Option<RelayError> = None;

    loop {
        let channel = match router::pick_channel(
            &admission.snapshot,
            &deps.registry,
            &deps.health,
            &admission.group,
            meta.mode,
            &meta.actual_model,
            &exclude,
        ) {
            Ok(channel) => channel,
            // When exclusions emptied the candidate set, the last upstream
            // failure is more useful to the caller than NoChannel.
            Err(err) => return Err(last_error.unwrap_or(err)),
        };
        let adaptor = deps.registry.get(channel.channel_type).ok_or_else(|| {
            RelayError::internal(format!(
                "no adaptor registered for channel type {}",
                channel.channel_type.as_str()
            ))
        })?;
        meta.set_channel(channel.clone());

        match attempt(deps, meta, adaptor.as_ref(), &channel, &request.body, timeout).await {
            Ok(payload) => {
                deps.health.record_success(channel.id, &meta.actual_model);
                return Ok(finish(deps, meta, payload).await);
            }
            Err(error) => {
                if error.retryable() {
                    deps.health.record_error(channel.id, &meta.actual_model);
                    if deps.health.ban_streak(channel.id, &meta.actual_model)
                        >= crate::relay::health::AUTO_DISABLE_BAN_STREAK
                    {
                        auto_disable_channel(deps, channel.id).await;
                    }
                }
                meta.attempts += 1;
                if error.retryable() && meta.attempts < max_attempts {
                    tracing::warn!(
                        request_id = %meta.request_id,
                        channel_id = channel.id,
                        attempt = meta.attempts,
                        error = %error.message,
                        "upstream attempt failed, re-routing"
                    );
                    exclude.insert(channel.id);
                    last_error = Some(error);
                    continue;
                }
                return Err(error);
            }
        }
    }
}

/// A channel whose error rate keeps re-tripping the ban is taken out of
/// rotation durably until an operator re-enables it.
async fn auto_disable_channel(deps: &RelayDeps, channel_id: i64) {
    tracing::warn!(channel_id, "auto-disabling channel after repeated ban cycles");
    if let Err(err) = deps
        .store
        .update_channel_status(channel_id, crate::model::ChannelStatus::AutoDisabled)
        .await
    {
        tracing::error!(channel_id, error = %err, "channel auto-disable failed");
        return;
    }
    if let Err(err) = deps.cache.reload_snapshot().await {
        tracing::error!(error = %err, "snapshot reload after auto-disable failed");
    }
}

/// One DISPATCH + TRANSLATE attempt against a chosen channel.
async fn attempt(
    deps: &RelayDeps,
    meta: &RequestMeta,
    adaptor: &dyn Adaptor,
    channel: &Channel,
    body: &Bytes,
    timeout: std::time::Duration,
) -> Result<RelayPayload, RelayError> {
    let converted = adaptor.convert_request(meta, channel, body)?;
    let resp = adaptor.do_request(&deps.http, timeout, converted).await?;

    let status = resp.status();
    if !status.is_success() {
        let status = status.as_u16();
        let body = resp.bytes().await.unwrap_or_default();
        return Err(adaptor.handle_error(status, &body));
    }

    adaptor.do_response(meta, resp).await
}

/// POST_USAGE: buffered payloads settle inline; streams hand settlement to
/// the accounting guard.
async fn finish(deps: &RelayDeps, meta: &mut RequestMeta, payload: RelayPayload) -> RelayResponse {
    let ctx = SettleContext::from_meta(meta, deps.store.clone(), deps.cache.clone());
    match payload {
        RelayPayload::Json {
            status,
            content_type,
            body,
            usage,
        } => {
            meta.usage.absorb(&usage);
            billing::settle(
                ctx,
                Outcome::Success { usage: meta.usage },
            )
            .await;
            RelayResponse::Json {
                status,
                content_type,
                body,
            }
        }
        RelayPayload::Stream {
            status,
            stream,
            outcome,
        } => RelayResponse::Stream {
            status,
            stream: AccountedStream {
                inner: stream,
                outcome,
                settle: Some(ctx),
            }
            .boxed(),
        },
    }
}

/// Wraps a translated frame stream and settles billing exactly once when
/// the body is dropped: on normal completion (terminal frame observed) as a
/// success, otherwise as a client abort. Dropping the wrapper also drops
/// the upstream connection.
struct AccountedStream {
    inner: BoxStream<'static, Result<Bytes, RelayError>>,
    outcome: SharedOutcome,
    settle: Option<SettleContext>,
}

impl Stream for AccountedStream {
    type Item = Result<Bytes, RelayError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl Drop for AccountedStream {
    fn drop(&mut self) {
        let Some(ctx) = self.settle.take() else {
            return;
        };
        let (usage, done) = {
            let guard = self.outcome.lock().unwrap_or_else(|e| e.into_inner());
            (guard.final_usage(), guard.done_seen)
        };
        let outcome = if done {
            Outcome::Success { usage }
        } else {
            tracing::debug!(
                request_id = %ctx.request_id,
                output_tokens = usage.output_tokens,
                "stream dropped before completion"
            );
            Outcome::ClientAborted { usage }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(billing::settle(ctx, outcome));
            }
            Err(_) => {
                tracing::error!(
                    request_id = %ctx.request_id,
                    "stream dropped outside a runtime; settlement lost"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use chrono::Utc;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::model::{
        Channel, ChannelStatus, ChannelType, Group, GroupStatus, LogStatus, ModelConfig, Token,
        TokenStatus, UserType,
    };
    use crate::relay::health::BanPolicy;

    async fn seeded_deps(channels: Vec<Channel>) -> (RelayDeps, Admission, i64) {
        let store = Store::open_in_memory().await.unwrap();

        store
            .insert_group(&Group {
                id: "acme".into(),
                status: GroupStatus::Enabled,
                rpm_ratio: 1.0,
                tpm_ratio: 1.0,
                available_sets: vec!["default".into()],
                model_mapping: HashMap::new(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let token_id = store
            .insert_token(&Token {
                id: 0,
                key: "sk-abc".into(),
                group_id: "acme".into(),
                name: "ci".into(),
                status: TokenStatus::Enabled,
                quota: dec!(100),
                subnets: vec![],
                user_type: UserType::Regular,
                is_provisioned: false,
                balance_last_sync: None,
                model_limits: HashMap::new(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        for channel in &channels {
            store.insert_channel(channel).await.unwrap();
        }
        store
            .upsert_model_config(&ModelConfig {
                model: "gpt-4o".into(),
                mode: Mode::ChatCompletions,
                owner: "openai".into(),
                input_price: dec!(0.001),
                output_price: dec!(0.002),
                per_request_price: dec!(0),
                rpm: None,
                tpm: None,
                max_input_tokens: None,
            })
            .await
            .unwrap();

        let cache = Arc::new(CacheLayer::new(store.clone()).await.unwrap());
        let token = cache.token("sk-abc").await.unwrap();
        let group = cache.group("acme").await.unwrap();
        let snapshot = cache.snapshot();

        let deps = RelayDeps {
            store,
            cache,
            health: Arc::new(HealthRegistry::new(BanPolicy::default())),
            registry: Arc::new(AdaptorRegistry::builtin()),
            http: reqwest::Client::new(),
            relay: RelayConfig::default(),
        };
        let admission = Admission {
            token,
            group,
            snapshot,
            is_admin: false,
        };
        (deps, admission, token_id)
    }

    fn openai_channel(id_hint: &str, base_url: &str, priority: i32) -> Channel {
        Channel {
            id: 0,
            channel_type: ChannelType::OpenAi,
            name: id_hint.to_string(),
            key: "sk-upstream".into(),
            base_url: Some(base_url.to_string()),
            priority,
            weight: 1,
            status: ChannelStatus::Enabled,
            models: ["gpt-4o".to_string()].into_iter().collect(),
            model_mapping: HashMap::new(),
            sets: vec!["default".into()],
            created_at: Utc::now(),
        }
    }

    fn chat_request(stream: bool) -> RelayRequest {
        let body = serde_json::json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": stream,
        });
        RelayRequest {
            mode: Mode::ChatCompletions,
            body: Bytes::from(body.to_string()),
            content_type: Some("application/json".into()),
            model_hint: None,
            stream_hint: false,
        }
    }

    fn completion_body() -> serde_json::Value {
        serde_json::json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "model": "gpt-4o",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "hello"},
                         "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15},
        })
    }

    async fn wait_for_log(store: &Store, request_id_count: usize) -> Vec<crate::model::RequestLog> {
        for _ in 0..50 {
            let logs = store.list_logs(None, 50).await.unwrap();
            if logs.len() >= request_id_count {
                return logs;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("expected {request_id_count} log rows");
    }

    #[tokio::test]
    async fn happy_path_buffered_debits_and_logs() {
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body()))
            .mount(&upstream)
            .await;

        let base = format!("{}/v1", upstream.uri());
        let (deps, admission, token_id) = seeded_deps(vec![openai_channel("a", &base, 0)]).await;

        let response = relay(&deps, admission, chat_request(false)).await.unwrap();
        let RelayResponse::Json { status, body, .. } = response else {
            panic!("expected buffered response");
        };
        assert_eq!(status, 200);
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["choices"][0]["message"]["content"], "hello");

        let logs = wait_for_log(&deps.store, 1).await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, LogStatus::Success);
        assert_eq!(logs[0].retry_count, 0);
        assert_eq!(logs[0].usage.input_tokens, 10);

        // cost = 10*0.001 + 5*0.002
        let token = deps.store.get_token_by_id(token_id).await.unwrap();
        assert_eq!(token.quota, dec!(100) - dec!(0.02));
    }

    #[tokio::test]
    async fn streaming_forwards_frames_and_settles_on_drop() {
        let sse_body = concat!(
            "data: {\"id\":\"c\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"hel\"}}]}\n\n",
            "data: {\"id\":\"c\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: {\"id\":\"c\",\"choices\":[],\"usage\":{\"prompt_tokens\":10,\"completion_tokens\":5}}\n\n",
            "data: [DONE]\n\n",
        );
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(sse_body, "text/event-stream"),
            )
            .mount(&upstream)
            .await;

        let base = format!("{}/v1", upstream.uri());
        let (deps, admission, token_id) = seeded_deps(vec![openai_channel("a", &base, 0)]).await;

        let response = relay(&deps, admission, chat_request(true)).await.unwrap();
        let RelayResponse::Stream { status, mut stream } = response else {
            panic!("expected stream response");
        };
        assert_eq!(status, 200);

        let mut frames: Vec<String> = Vec::new();
        while let Some(frame) = stream.next().await {
            frames.push(String::from_utf8(frame.unwrap().to_vec()).unwrap());
        }
        drop(stream);

        // One downstream frame per upstream frame, in order, [DONE] last.
        assert_eq!(frames.len(), 4);
        assert!(frames[0].contains("hel"));
        assert!(frames[1].contains("lo"));
        assert_eq!(frames[3], "data: [DONE]\n\n");

        let logs = wait_for_log(&deps.store, 1).await;
        assert_eq!(logs[0].status, LogStatus::Success);
        assert_eq!(logs[0].usage.output_tokens, 5);

        let token = deps.store.get_token_by_id(token_id).await.unwrap();
        assert_eq!(token.quota, dec!(100) - dec!(0.02));
    }

    #[tokio::test]
    async fn client_abort_settles_partial_usage() {
        let sse_body = concat!(
            "data: {\"id\":\"c\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"hello wor\"}}]}\n\n",
            "data: {\"id\":\"c\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"ld!\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(sse_body, "text/event-stream"),
            )
            .mount(&upstream)
            .await;

        let base = format!("{}/v1", upstream.uri());
        let (deps, admission, _) = seeded_deps(vec![openai_channel("a", &base, 0)]).await;

        let response = relay(&deps, admission, chat_request(true)).await.unwrap();
        let RelayResponse::Stream { mut stream, .. } = response else {
            panic!("expected stream response");
        };

        // Read one frame, then disconnect.
        let first = stream.next().await.unwrap().unwrap();
        assert!(first.starts_with(b"data: "));
        drop(stream);

        let logs = wait_for_log(&deps.store, 1).await;
        assert_eq!(logs[0].status, LogStatus::ClientAborted);
        // Fallback output estimate from flushed content.
        assert!(logs[0].usage.output_tokens > 0);
    }

    #[tokio::test]
    async fn retry_then_succeed_excludes_failed_channel() {
        let failing = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(503).set_body_string("upstream down"))
            .expect(1)
            .mount(&failing)
            .await;

        let healthy = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body()))
            .expect(1)
            .mount(&healthy)
            .await;

        // The failing channel has the higher priority so it is tried first.
        let (deps, admission, _) = seeded_deps(vec![
            openai_channel("failing", &format!("{}/v1", failing.uri()), 10),
            openai_channel("healthy", &format!("{}/v1", healthy.uri()), 0),
        ])
        .await;

        let response = relay(&deps, admission, chat_request(false)).await.unwrap();
        let RelayResponse::Json { status, .. } = response else {
            panic!("expected buffered response");
        };
        assert_eq!(status, 200);

        let logs = wait_for_log(&deps.store, 1).await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, LogStatus::Success);
        assert_eq!(logs[0].retry_count, 1);

        // The failed channel's error counter moved.
        assert_eq!(deps.health.error_count(1, "gpt-4o"), 1);
    }

    #[tokio::test]
    async fn quota_exhausted_rejects_before_upstream() {
        let upstream = MockServer::start().await;
        // No mocks mounted: any upstream call would 404 and fail the test
        // via the error-kind assertion below.
        let base = format!("{}/v1", upstream.uri());
        let (deps, mut admission, token_id) =
            seeded_deps(vec![openai_channel("a", &base, 0)]).await;

        deps.store.debit_quota(token_id, dec!(99.9999)).await.unwrap();
        deps.cache.invalidate_token("sk-abc");
        admission.token = deps.cache.token("sk-abc").await.unwrap();

        let err = relay(&deps, admission, chat_request(false)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::QuotaExhausted);
        assert_eq!(err.status().as_u16(), 402);

        let logs = wait_for_log(&deps.store, 1).await;
        assert_eq!(logs[0].status, LogStatus::Error);
        assert_eq!(logs[0].error_kind.as_deref(), Some("quota_exhausted"));
    }

    #[tokio::test]
    async fn all_channels_banned_is_no_channel() {
        let (deps, admission, _) =
            seeded_deps(vec![openai_channel("a", "https://unused.invalid/v1", 0)]).await;
        deps.health.force_ban(1, "gpt-4o", Duration::from_secs(60));

        let err = relay(&deps, admission, chat_request(false)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoChannel);
        assert_eq!(err.status().as_u16(), 503);

        let logs = wait_for_log(&deps.store, 1).await;
        assert_eq!(logs[0].status, LogStatus::Error);
        assert_eq!(logs[0].error_kind.as_deref(), Some("no_channel"));
    }

    #[tokio::test]
    async fn unknown_model_is_not_found() {
        let (deps, admission, _) = seeded_deps(vec![]).await;
        let body = serde_json::json!({"model": "gpt-99", "messages": []});
        let request = RelayRequest {
            mode: Mode::ChatCompletions,
            body: Bytes::from(body.to_string()),
            content_type: None,
            model_hint: None,
            stream_hint: false,
        };
        let err = relay(&deps, admission, request).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn admin_skips_quota_and_debit() {
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body()))
            .mount(&upstream)
            .await;

        let base = format!("{}/v1", upstream.uri());
        let (deps, mut admission, token_id) =
            seeded_deps(vec![openai_channel("a", &base, 0)]).await;
        admission.is_admin = true;

        relay(&deps, admission, chat_request(false)).await.unwrap();

        let logs = wait_for_log(&deps.store, 1).await;
        assert_eq!(logs[0].status, LogStatus::Success);
        assert_eq!(logs[0].cost, dec!(0));
        let token = deps.store.get_token_by_id(token_id).await.unwrap();
        assert_eq!(token.quota, dec!(100));
    }
}
