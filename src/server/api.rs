//! Admin REST surface: status, login, CRUD for channels/tokens/groups/model
//! configs, channel health monitoring and request logs.
//!
//! Reads are allowed to any valid token (filtered to its own group); writes
//! require the AdminKey or a token with the admin user type.

use std::collections::HashMap;

use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Extension, Json, Router};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::balance::merge_balance;
use crate::error::RelayError;
use crate::model::{
    Channel, ChannelStatus, ChannelType, Group, GroupStatus, ModelConfig, Token, TokenStatus,
    UserType, mask_key,
};
use crate::relay::meta::RequestMeta;
use crate::relay::mode::Mode;

use super::AppState;

/// Uniform admin API envelope.
#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

fn ok(data: impl Serialize) -> Response {
    let data = serde_json::to_value(data).unwrap_or_default();
    Json(ApiResponse {
        success: true,
        data: Some(data),
        message: None,
    })
    .into_response()
}

fn fail(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ApiResponse {
            success: false,
            data: None,
            message: Some(message.into()),
        }),
    )
        .into_response()
}

fn fail_store(err: crate::error::StoreError) -> Response {
    if err.is_not_found() {
        fail(StatusCode::NOT_FOUND, err.to_string())
    } else {
        fail(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

/// Who is calling the admin API.
#[derive(Debug, Clone)]
pub struct ApiIdentity {
    pub user_type: UserType,
    /// The caller's group for reads; `None` for the AdminKey itself.
    pub group_id: Option<String>,
}

impl ApiIdentity {
    fn is_admin(&self) -> bool {
        self.user_type == UserType::Admin
    }
}

pub fn router(state: AppState) -> Router<AppState> {
    let authed = Router::new()
        .route("/channels", get(list_channels))
        .route("/channels/type_metas", get(channel_type_metas))
        .route("/channel", post(create_channel))
        .route("/channel/{id}", put(update_channel))
        .route("/channel/{id}/status", post(update_channel_status))
        .route("/channel/{id}", delete(delete_channel))
        .route("/channel/{id}/test", get(test_channel))
        .route("/channel/{id}/balance", get(channel_balance))
        .route("/tokens", get(list_tokens))
        .route("/token", post(create_token))
        .route("/token/{id}/status", post(update_token_status))
        .route("/token/{id}", delete(delete_token))
        .route("/groups", get(list_groups))
        .route("/group", post(create_group))
        .route("/group/{id}/status", post(update_group_status))
        .route("/group/{id}", delete(delete_group))
        .route("/model_configs", get(list_model_configs))
        .route("/model_configs", post(upsert_model_config))
        .route("/model_configs/{model}", delete(delete_model_config))
        .route("/monitor", get(monitor))
        .route("/logs", get(list_logs))
        .route_layer(middleware::from_fn_with_state(state, admin_auth));

    Router::new()
        .route("/status", get(status))
        .route("/auth/login", post(login))
        .merge(authed)
}

/// Admin-surface authentication: AdminKey or a valid token, from the
/// `Authorization` header or the `key` query parameter.
async fn admin_auth(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let key = header_key(request.headers()).or_else(|| query_key(&request));
    let Some(key) = key else {
        return fail(
            StatusCode::UNAUTHORIZED,
            "unauthorized, no access token provided",
        );
    };

    let identity = if state.config.auth.is_admin_key(&key) {
        ApiIdentity {
            user_type: UserType::Admin,
            group_id: None,
        }
    } else {
        match state.deps.cache.token(&key).await {
            Ok(token) if token.status == TokenStatus::Enabled => ApiIdentity {
                user_type: token.user_type,
                group_id: Some(token.group_id.clone()),
            },
            Ok(_) => return fail(StatusCode::UNAUTHORIZED, "token is disabled"),
            Err(err) if err.is_not_found() => {
                return fail(StatusCode::UNAUTHORIZED, "invalid access token");
            }
            Err(err) => return fail(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        }
    };

    request.extensions_mut().insert(identity);
    next.run(request).await
}

fn header_key(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get("authorization")?.to_str().ok()?.trim();
    let key = raw.strip_prefix("Bearer ").unwrap_or(raw);
    let key = key.strip_prefix("sk-").unwrap_or(key).trim();
    (!key.is_empty()).then(|| key.to_string())
}

fn query_key(request: &Request) -> Option<String> {
    let query = request.uri().query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find_map(|(k, v)| (k == "key").then(|| v.into_owned()))
        .filter(|s| !s.is_empty())
}

fn require_admin(identity: &ApiIdentity) -> Result<(), Response> {
    if identity.is_admin() {
        Ok(())
    } else {
        Err(fail(StatusCode::FORBIDDEN, "admin privileges required"))
    }
}

// -- Status --

async fn status(State(state): State<AppState>) -> Response {
    ok(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "channels": state.deps.cache.snapshot().channels.len(),
    }))
}

// -- Login --

#[derive(Debug, Deserialize)]
struct LoginRequest {
    token: String,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    success: bool,
    user_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    token_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    group_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    balance: Option<Decimal>,
}

/// Login flow: AdminKey short-circuits; any other key is validated against
/// the upstream balance endpoint and auto-provisioned on first sight
/// (group id = token key, initial quota = upstream balance). Idempotent:
/// repeat logins return the same token and group ids.
async fn login(State(state): State<AppState>, Json(request): Json<LoginRequest>) -> Response {
    let key = request.token.trim().to_string();
    if key.len() < 6 {
        return fail(StatusCode::BAD_REQUEST, "token must be at least 6 characters");
    }

    if state.config.auth.is_admin_key(&key) {
        return ok(LoginResponse {
            success: true,
            user_type: UserType::Admin.as_str(),
            token_id: None,
            group_id: None,
            balance: None,
        });
    }

    let Some(client) = &state.balance else {
        return fail(
            StatusCode::SERVICE_UNAVAILABLE,
            "login is not configured (UPSTREAM_BALANCE_URL unset)",
        );
    };

    let balance = match client.fetch_balance(&key).await {
        Ok(balance) => balance,
        Err(err) => {
            tracing::warn!(error = %err.message, "login key validation failed");
            return fail(StatusCode::UNAUTHORIZED, format!("invalid token: {}", err.message));
        }
    };

    let store = &state.deps.store;
    let (token_id, group_id) = match store.get_token_by_key(&key).await {
        Ok(existing) => {
            let merged = merge_balance(balance, existing.quota);
            if let Err(err) = store.set_token_balance(existing.id, merged).await {
                tracing::warn!(error = %err, "login balance refresh failed");
            }
            state.deps.cache.invalidate_token(&key);
            (existing.id, existing.group_id)
        }
        Err(err) if err.is_not_found() => {
            let group = Group {
                id: key.clone(),
                status: GroupStatus::Enabled,
                rpm_ratio: 1.0,
                tpm_ratio: 1.0,
                available_sets: vec!["default".to_string()],
                model_mapping: HashMap::new(),
                created_at: Utc::now(),
            };
            if let Err(err) = store.insert_group(&group).await {
                return fail_store(err);
            }

            let mut token = Token {
                id: 0,
                key: key.clone(),
                group_id: key.clone(),
                name: mask_key(&key),
                status: TokenStatus::Enabled,
                quota: balance,
                subnets: vec![],
                user_type: UserType::Regular,
                is_provisioned: true,
                balance_last_sync: Some(Utc::now()),
                model_limits: HashMap::new(),
                created_at: Utc::now(),
            };
            match store.insert_token(&token).await {
                Ok(id) => {
                    token.id = id;
                    state.deps.cache.insert_token(token);
                    tracing::info!(token_id = id, "provisioned new login token");
                    (id, key.clone())
                }
                Err(err) => return fail_store(err),
            }
        }
        Err(err) => return fail_store(err),
    };

    ok(LoginResponse {
        success: true,
        user_type: UserType::Regular.as_str(),
        token_id: Some(token_id),
        group_id: Some(group_id),
        balance: Some(balance),
    })
}

// -- Channels --

fn channel_to_json(channel: &Channel) -> serde_json::Value {
    let mut value = serde_json::to_value(channel).unwrap_or_default();
    if let Some(obj) = value.as_object_mut() {
        obj.insert("key".into(), json!(mask_key(&channel.key)));
    }
    value
}

async fn list_channels(
    State(state): State<AppState>,
    Extension(identity): Extension<ApiIdentity>,
) -> Response {
    if let Err(resp) = require_admin(&identity) {
        return resp;
    }
    match state.deps.store.list_channels().await {
        Ok(channels) => ok(channels.iter().map(channel_to_json).collect::<Vec<_>>()),
        Err(err) => fail_store(err),
    }
}

async fn channel_type_metas(State(state): State<AppState>) -> Response {
    ok(state.deps.registry.type_metas())
}

#[derive(Debug, Deserialize)]
struct ChannelUpsert {
    #[serde(rename = "type")]
    channel_type: ChannelType,
    name: String,
    key: String,
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default)]
    priority: i32,
    #[serde(default = "default_weight")]
    weight: u32,
    models: Vec<String>,
    #[serde(default)]
    model_mapping: HashMap<String, String>,
    #[serde(default = "default_sets")]
    sets: Vec<String>,
}

fn default_weight() -> u32 {
    1
}

fn default_sets() -> Vec<String> {
    vec!["default".to_string()]
}

impl ChannelUpsert {
    fn into_channel(self, id: i64, status: ChannelStatus) -> Channel {
        Channel {
            id,
            channel_type: self.channel_type,
            name: self.name,
            key: self.key,
            base_url: self.base_url,
            priority: self.priority,
            weight: self.weight,
            status,
            models: self.models.into_iter().collect(),
            model_mapping: self.model_mapping,
            sets: self.sets,
            created_at: Utc::now(),
        }
    }
}

async fn create_channel(
    State(state): State<AppState>,
    Extension(identity): Extension<ApiIdentity>,
    Json(request): Json<ChannelUpsert>,
) -> Response {
    if let Err(resp) = require_admin(&identity) {
        return resp;
    }
    let Some(adaptor) = state.deps.registry.get(request.channel_type) else {
        return fail(StatusCode::BAD_REQUEST, "unsupported channel type");
    };
    if let Err(err) = adaptor.validate_key(&request.key) {
        return fail(StatusCode::BAD_REQUEST, format!("invalid key: {}", err.message));
    }

    let channel = request.into_channel(0, ChannelStatus::Enabled);
    match state.deps.store.insert_channel(&channel).await {
        Ok(id) => {
            reload_snapshot(&state).await;
            ok(json!({"id": id}))
        }
        Err(err) => fail_store(err),
    }
}

async fn update_channel(
    State(state): State<AppState>,
    Extension(identity): Extension<ApiIdentity>,
    Path(id): Path<i64>,
    Json(request): Json<ChannelUpsert>,
) -> Response {
    if let Err(resp) = require_admin(&identity) {
        return resp;
    }
    let existing = match state.deps.store.get_channel(id).await {
        Ok(channel) => channel,
        Err(err) => return fail_store(err),
    };
    let channel = request.into_channel(id, existing.status);
    match state.deps.store.update_channel(&channel).await {
        Ok(()) => {
            reload_snapshot(&state).await;
            ok(json!({"id": id}))
        }
        Err(err) => fail_store(err),
    }
}

#[derive(Debug, Deserialize)]
struct ChannelStatusUpdate {
    status: ChannelStatus,
}

async fn update_channel_status(
    State(state): State<AppState>,
    Extension(identity): Extension<ApiIdentity>,
    Path(id): Path<i64>,
    Json(request): Json<ChannelStatusUpdate>,
) -> Response {
    if let Err(resp) = require_admin(&identity) {
        return resp;
    }
    match state.deps.store.update_channel_status(id, request.status).await {
        Ok(()) => {
            reload_snapshot(&state).await;
            ok(json!({"id": id}))
        }
        Err(err) => fail_store(err),
    }
}

async fn delete_channel(
    State(state): State<AppState>,
    Extension(identity): Extension<ApiIdentity>,
    Path(id): Path<i64>,
) -> Response {
    if let Err(resp) = require_admin(&identity) {
        return resp;
    }
    match state.deps.store.delete_channel(id).await {
        Ok(()) => {
            reload_snapshot(&state).await;
            ok(json!({"id": id}))
        }
        Err(err) => fail_store(err),
    }
}

/// Fire a minimal chat completion through the channel to verify its
/// credential and connectivity.
async fn test_channel(
    State(state): State<AppState>,
    Extension(identity): Extension<ApiIdentity>,
    Path(id): Path<i64>,
) -> Response {
    if let Err(resp) = require_admin(&identity) {
        return resp;
    }
    let channel = match state.deps.store.get_channel(id).await {
        Ok(channel) => channel,
        Err(err) => return fail_store(err),
    };
    let Some(adaptor) = state.deps.registry.get(channel.channel_type) else {
        return fail(StatusCode::BAD_REQUEST, "unsupported channel type");
    };
    let Some(model) = channel.models.iter().next().cloned() else {
        return fail(StatusCode::BAD_REQUEST, "channel has no models configured");
    };

    let mut meta = RequestMeta::new(
        Mode::ChatCompletions,
        std::sync::Arc::new(Token::internal("channel-test")),
        std::sync::Arc::new(Group::internal(vec![])),
        true,
    );
    meta.origin_model = model.clone();
    meta.actual_model = model.clone();
    meta.set_channel(std::sync::Arc::new(channel.clone()));

    let body = json!({
        "model": model,
        "messages": [{"role": "user", "content": "ping"}],
        "max_tokens": 1,
    });
    let result: Result<(), RelayError> = async {
        let converted =
            adaptor.convert_request(&meta, &channel, body.to_string().as_bytes())?;
        let resp = adaptor
            .do_request(
                &state.deps.http,
                std::time::Duration::from_secs(30),
                converted,
            )
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.bytes().await.unwrap_or_default();
            return Err(adaptor.handle_error(status.as_u16(), &body));
        }
        Ok(())
    }
    .await;

    match result {
        Ok(()) => ok(json!({"id": id, "model": model})),
        Err(err) => fail(err.status(), err.message),
    }
}

/// Query the provider for the channel account's remaining balance. Most
/// providers do not expose one; those surface as 404.
async fn channel_balance(
    State(state): State<AppState>,
    Extension(identity): Extension<ApiIdentity>,
    Path(id): Path<i64>,
) -> Response {
    if let Err(resp) = require_admin(&identity) {
        return resp;
    }
    let channel = match state.deps.store.get_channel(id).await {
        Ok(channel) => channel,
        Err(err) => return fail_store(err),
    };
    let Some(adaptor) = state.deps.registry.get(channel.channel_type) else {
        return fail(StatusCode::BAD_REQUEST, "unsupported channel type");
    };
    match adaptor.get_balance(&state.deps.http, &channel).await {
        Ok(balance) => ok(json!({"id": id, "balance": balance})),
        Err(err) => fail(err.status(), err.message),
    }
}

// -- Tokens --

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    group: Option<String>,
    #[serde(default)]
    limit: Option<u32>,
}

/// Reads are group-scoped for regular callers.
fn effective_group(identity: &ApiIdentity, requested: Option<String>) -> Option<String> {
    if identity.is_admin() {
        requested
    } else {
        identity.group_id.clone()
    }
}

async fn list_tokens(
    State(state): State<AppState>,
    Extension(identity): Extension<ApiIdentity>,
    Query(query): Query<ListQuery>,
) -> Response {
    let group = effective_group(&identity, query.group);
    match state.deps.store.list_tokens(group.as_deref()).await {
        Ok(tokens) => ok(tokens),
        Err(err) => fail_store(err),
    }
}

#[derive(Debug, Deserialize)]
struct TokenCreate {
    #[serde(default)]
    key: Option<String>,
    name: String,
    group_id: String,
    #[serde(default)]
    quota: Decimal,
    #[serde(default)]
    subnets: Vec<String>,
}

async fn create_token(
    State(state): State<AppState>,
    Extension(identity): Extension<ApiIdentity>,
    Json(request): Json<TokenCreate>,
) -> Response {
    if let Err(resp) = require_admin(&identity) {
        return resp;
    }
    if let Err(err) = state.deps.store.get_group(&request.group_id).await {
        return fail_store(err);
    }

    let mut subnets = Vec::new();
    for raw in &request.subnets {
        match raw.parse() {
            Ok(net) => subnets.push(net),
            Err(_) => return fail(StatusCode::BAD_REQUEST, format!("invalid subnet {raw:?}")),
        }
    }

    let token = Token {
        id: 0,
        key: request
            .key
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string()),
        group_id: request.group_id,
        name: request.name,
        status: TokenStatus::Enabled,
        quota: request.quota,
        subnets,
        user_type: UserType::Regular,
        is_provisioned: false,
        balance_last_sync: None,
        model_limits: HashMap::new(),
        created_at: Utc::now(),
    };
    match state.deps.store.insert_token(&token).await {
        Ok(id) => ok(json!({"id": id, "key": token.key})),
        Err(err) => fail_store(err),
    }
}

#[derive(Debug, Deserialize)]
struct TokenStatusUpdate {
    status: TokenStatus,
}

async fn update_token_status(
    State(state): State<AppState>,
    Extension(identity): Extension<ApiIdentity>,
    Path(id): Path<i64>,
    Json(request): Json<TokenStatusUpdate>,
) -> Response {
    if let Err(resp) = require_admin(&identity) {
        return resp;
    }
    match state.deps.store.update_token_status(id, request.status).await {
        Ok(()) => {
            invalidate_token_by_id(&state, id).await;
            ok(json!({"id": id}))
        }
        Err(err) => fail_store(err),
    }
}

async fn delete_token(
    State(state): State<AppState>,
    Extension(identity): Extension<ApiIdentity>,
    Path(id): Path<i64>,
) -> Response {
    if let Err(resp) = require_admin(&identity) {
        return resp;
    }
    invalidate_token_by_id(&state, id).await;
    match state.deps.store.delete_token(id).await {
        Ok(()) => ok(json!({"id": id})),
        Err(err) => fail_store(err),
    }
}

async fn invalidate_token_by_id(state: &AppState, id: i64) {
    if let Ok(token) = state.deps.store.get_token_by_id(id).await {
        state.deps.cache.invalidate_token(&token.key);
    }
}

// -- Groups --

async fn list_groups(
    State(state): State<AppState>,
    Extension(identity): Extension<ApiIdentity>,
) -> Response {
    if let Err(resp) = require_admin(&identity) {
        return resp;
    }
    match state.deps.store.list_groups().await {
        Ok(groups) => ok(groups),
        Err(err) => fail_store(err),
    }
}

#[derive(Debug, Deserialize)]
struct GroupUpsert {
    id: String,
    #[serde(default = "default_ratio")]
    rpm_ratio: f64,
    #[serde(default = "default_ratio")]
    tpm_ratio: f64,
    #[serde(default = "default_sets")]
    available_sets: Vec<String>,
    #[serde(default)]
    model_mapping: HashMap<String, String>,
}

fn default_ratio() -> f64 {
    1.0
}

async fn create_group(
    State(state): State<AppState>,
    Extension(identity): Extension<ApiIdentity>,
    Json(request): Json<GroupUpsert>,
) -> Response {
    if let Err(resp) = require_admin(&identity) {
        return resp;
    }
    if request.id.is_empty() {
        return fail(StatusCode::BAD_REQUEST, "group id is required");
    }
    let group = Group {
        id: request.id.clone(),
        status: GroupStatus::Enabled,
        rpm_ratio: request.rpm_ratio,
        tpm_ratio: request.tpm_ratio,
        available_sets: request.available_sets,
        model_mapping: request.model_mapping,
        created_at: Utc::now(),
    };
    match state.deps.store.insert_group(&group).await {
        Ok(()) => ok(json!({"id": group.id})),
        Err(err) => fail_store(err),
    }
}

#[derive(Debug, Deserialize)]
struct GroupStatusUpdate {
    status: GroupStatus,
}

async fn update_group_status(
    State(state): State<AppState>,
    Extension(identity): Extension<ApiIdentity>,
    Path(id): Path<String>,
    Json(request): Json<GroupStatusUpdate>,
) -> Response {
    if let Err(resp) = require_admin(&identity) {
        return resp;
    }
    match state.deps.store.update_group_status(&id, request.status).await {
        Ok(()) => {
            state.deps.cache.invalidate_group(&id);
            ok(json!({"id": id}))
        }
        Err(err) => fail_store(err),
    }
}

async fn delete_group(
    State(state): State<AppState>,
    Extension(identity): Extension<ApiIdentity>,
    Path(id): Path<String>,
) -> Response {
    if let Err(resp) = require_admin(&identity) {
        return resp;
    }
    match state.deps.store.delete_group(&id).await {
        Ok(()) => {
            state.deps.cache.invalidate_group(&id);
            ok(json!({"id": id}))
        }
        Err(err) => fail_store(err),
    }
}

// -- Model configs --

async fn list_model_configs(State(state): State<AppState>) -> Response {
    match state.deps.store.list_model_configs().await {
        Ok(configs) => ok(configs),
        Err(err) => fail_store(err),
    }
}

async fn upsert_model_config(
    State(state): State<AppState>,
    Extension(identity): Extension<ApiIdentity>,
    Json(config): Json<ModelConfig>,
) -> Response {
    if let Err(resp) = require_admin(&identity) {
        return resp;
    }
    if config.model.is_empty() {
        return fail(StatusCode::BAD_REQUEST, "model name is required");
    }
    match state.deps.store.upsert_model_config(&config).await {
        Ok(()) => {
            reload_snapshot(&state).await;
            ok(json!({"model": config.model}))
        }
        Err(err) => fail_store(err),
    }
}

async fn delete_model_config(
    State(state): State<AppState>,
    Extension(identity): Extension<ApiIdentity>,
    Path(model): Path<String>,
) -> Response {
    if let Err(resp) = require_admin(&identity) {
        return resp;
    }
    match state.deps.store.delete_model_config(&model).await {
        Ok(()) => {
            reload_snapshot(&state).await;
            ok(json!({"model": model}))
        }
        Err(err) => fail_store(err),
    }
}

// -- Monitor & logs --

async fn monitor(
    State(state): State<AppState>,
    Extension(identity): Extension<ApiIdentity>,
) -> Response {
    if let Err(resp) = require_admin(&identity) {
        return resp;
    }
    ok(state.deps.health.report())
}

async fn list_logs(
    State(state): State<AppState>,
    Extension(identity): Extension<ApiIdentity>,
    Query(query): Query<ListQuery>,
) -> Response {
    let group = effective_group(&identity, query.group);
    let limit = query.limit.unwrap_or(100).min(1000);
    match state.deps.store.list_logs(group.as_deref(), limit).await {
        Ok(logs) => ok(logs),
        Err(err) => fail_store(err),
    }
}

async fn reload_snapshot(state: &AppState) {
    if let Err(err) = state.deps.cache.reload_snapshot().await {
        tracing::error!(error = %err, "snapshot reload after admin write failed");
    }
}
