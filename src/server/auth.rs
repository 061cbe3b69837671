//! Bearer-key authentication and admission for the relay surface.
//!
//! Key extraction tries `Authorization`, `X-Api-Key` and `X-Goog-Api-Key`
//! in that order and strips the `Bearer ` / `sk-` prefixes. The configured
//! AdminKey / InternalToken short-circuit into a synthesized internal
//! identity that skips subnet and quota checks.

use std::net::IpAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;

use crate::error::{ErrorKind, RelayError};
use crate::model::{Group, GroupStatus, Token, TokenStatus, mask_key};
use crate::relay::pipeline::Admission;

use super::{AppState, error_response_for_path};

/// Pull the caller's key out of the auth headers. First non-empty source
/// wins; `Bearer ` and `sk-` prefixes are stripped.
pub fn extract_key(headers: &HeaderMap) -> Option<String> {
    let raw = ["authorization", "x-api-key", "x-goog-api-key"]
        .iter()
        .find_map(|name| {
            headers
                .get(*name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|s| !s.is_empty())
        })?;

    let key = raw.strip_prefix("Bearer ").unwrap_or(raw);
    let key = key.strip_prefix("sk-").unwrap_or(key);
    let key = key.trim();
    (!key.is_empty()).then(|| key.to_string())
}

/// Best-effort client IP: proxy headers first, then the socket address.
pub fn client_ip(headers: &HeaderMap, request: &Request) -> IpAddr {
    let from_header = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse().ok())
        .or_else(|| {
            headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.split(',').next())
                .and_then(|s| s.trim().parse().ok())
        });

    from_header
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<std::net::SocketAddr>>()
                .map(|info| info.0.ip())
        })
        .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED))
}

/// Admission middleware for the relay routes: resolves the key into
/// Token + Group + model snapshot and attaches them to the request.
pub async fn relay_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let ip = client_ip(request.headers(), &request);

    match admit(&state, request.headers(), ip).await {
        Ok(admission) => {
            request.extensions_mut().insert(admission);
            next.run(request).await
        }
        Err(err) => error_response_for_path(&path, err),
    }
}

async fn admit(
    state: &AppState,
    headers: &HeaderMap,
    client_ip: IpAddr,
) -> Result<Admission, RelayError> {
    let key = extract_key(headers)
        .ok_or_else(|| RelayError::unauthorized("no access token provided"))?;

    let snapshot = state.deps.cache.snapshot();

    // Admin shortcut: synthesized identity, every model set available.
    let auth = &state.config.auth;
    if auth.is_admin_key(&key) || auth.is_internal_token(&key) {
        return Ok(Admission {
            token: Arc::new(Token::internal(&key)),
            group: Arc::new(Group::internal(snapshot.all_set_names())),
            snapshot,
            is_admin: true,
        });
    }

    let token = state.deps.cache.token(&key).await.map_err(|err| {
        if err.is_not_found() {
            RelayError::unauthorized("invalid access token")
        } else {
            RelayError::internal(format!("token lookup failed: {err}"))
        }
    })?;

    match token.status {
        TokenStatus::Enabled => {}
        TokenStatus::Disabled => {
            return Err(RelayError::unauthorized(format!(
                "token {} is disabled",
                mask_key(&token.key)
            )));
        }
        TokenStatus::Exhausted => {
            return Err(RelayError::new(
                ErrorKind::QuotaExhausted,
                format!("token {} has no remaining quota", mask_key(&token.key)),
            ));
        }
    }
    if token.quota <= rust_decimal::Decimal::ZERO {
        return Err(RelayError::new(
            ErrorKind::QuotaExhausted,
            format!("token {} has no remaining quota", mask_key(&token.key)),
        ));
    }

    if !token.subnets.is_empty() && !token.subnets.iter().any(|net| net.contains(&client_ip)) {
        return Err(RelayError::forbidden(format!(
            "token {} ({}) can only be used from {:?}, current ip: {client_ip}",
            token.name,
            mask_key(&token.key),
            token.subnets,
        )));
    }

    let group = state.deps.cache.group(&token.group_id).await.map_err(|err| {
        RelayError::internal(format!("group lookup failed: {err}"))
    })?;
    if !matches!(group.status, GroupStatus::Enabled | GroupStatus::Internal) {
        return Err(RelayError::forbidden(format!(
            "group {} is disabled",
            group.id
        )));
    }

    tracing::debug!(
        token_id = token.id,
        group = %group.id,
        ip = %client_ip,
        "request admitted"
    );

    Ok(Admission {
        token,
        group,
        snapshot,
        is_admin: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request as HttpRequest, StatusCode};
    use axum::routing::post;
    use axum::{Extension, Router, middleware};
    use tower::ServiceExt;

    use crate::model::{GroupStatus, TokenStatus};
    use crate::server::testutil::seeded_state;

    async fn echo_admission(Extension(admission): Extension<Admission>) -> String {
        format!(
            "admin={} group={} token={}",
            admission.is_admin, admission.group.id, admission.token.id
        )
    }

    fn router_for(state: AppState) -> Router {
        Router::new()
            .route("/v1/chat/completions", post(echo_admission))
            .route("/v1/messages", post(echo_admission))
            .route_layer(middleware::from_fn_with_state(state.clone(), relay_auth))
            .with_state(state)
    }

    fn request(path: &str, auth: Option<&str>, extra: &[(&str, &str)]) -> HttpRequest<Body> {
        let mut builder = HttpRequest::builder().method("POST").uri(path);
        if let Some(auth) = auth {
            builder = builder.header("authorization", auth);
        }
        for (name, value) in extra {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn key_extraction_order_and_prefixes() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_key(&headers), None);

        headers.insert("x-goog-api-key", "goog".parse().unwrap());
        assert_eq!(extract_key(&headers).as_deref(), Some("goog"));

        headers.insert("x-api-key", "xapi".parse().unwrap());
        assert_eq!(extract_key(&headers).as_deref(), Some("xapi"));

        headers.insert("authorization", "Bearer sk-abc".parse().unwrap());
        assert_eq!(extract_key(&headers).as_deref(), Some("abc"));

        headers.insert("authorization", "sk-plain".parse().unwrap());
        assert_eq!(extract_key(&headers).as_deref(), Some("plain"));
    }

    #[tokio::test]
    async fn missing_key_is_unauthorized() {
        let app = router_for(seeded_state(None).await);
        let resp = app
            .oneshot(request("/v1/chat/completions", None, &[]))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unknown_key_is_unauthorized() {
        let app = router_for(seeded_state(None).await);
        let resp = app
            .oneshot(request("/v1/chat/completions", Some("Bearer nope"), &[]))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn admin_key_synthesizes_internal_identity() {
        let app = router_for(seeded_state(None).await);
        let resp = app
            .oneshot(request(
                "/v1/chat/completions",
                Some("Bearer admin-secret"),
                &[],
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("admin=true"));
    }

    #[tokio::test]
    async fn valid_token_is_admitted() {
        let app = router_for(seeded_state(None).await);
        let resp = app
            .oneshot(request(
                "/v1/chat/completions",
                Some("Bearer key-abc"),
                &[],
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("group=acme"));
    }

    #[tokio::test]
    async fn subnet_restriction_enforced() {
        let state = seeded_state(None).await;
        {
            let store = &state.deps.store;
            let mut token = store.get_token_by_key("key-abc").await.unwrap();
            token.subnets = vec!["10.0.0.0/8".parse().unwrap()];
            // Re-create with subnets (no dedicated update helper for this).
            store.delete_token(token.id).await.unwrap();
            token.id = 0;
            store.insert_token(&token).await.unwrap();
            state.deps.cache.invalidate_token("key-abc");
        }

        let app = router_for(state.clone());
        let denied = app
            .clone()
            .oneshot(request(
                "/v1/chat/completions",
                Some("Bearer key-abc"),
                &[("x-real-ip", "8.8.8.8")],
            ))
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);

        let allowed = app
            .oneshot(request(
                "/v1/chat/completions",
                Some("Bearer key-abc"),
                &[("x-real-ip", "10.1.2.3")],
            ))
            .await
            .unwrap();
        assert_eq!(allowed.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn disabled_token_and_group_rejected() {
        let state = seeded_state(None).await;
        let token = state.deps.store.get_token_by_key("key-abc").await.unwrap();

        state
            .deps
            .store
            .update_token_status(token.id, TokenStatus::Disabled)
            .await
            .unwrap();
        state.deps.cache.invalidate_token("key-abc");
        let resp = router_for(state.clone())
            .oneshot(request(
                "/v1/chat/completions",
                Some("Bearer key-abc"),
                &[],
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        state
            .deps
            .store
            .update_token_status(token.id, TokenStatus::Enabled)
            .await
            .unwrap();
        state
            .deps
            .store
            .update_group_status("acme", GroupStatus::Disabled)
            .await
            .unwrap();
        state.deps.cache.invalidate_token("key-abc");
        state.deps.cache.invalidate_group("acme");
        let resp = router_for(state)
            .oneshot(request(
                "/v1/chat/completions",
                Some("Bearer key-abc"),
                &[],
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn anthropic_path_gets_anthropic_error_shape() {
        let app = router_for(seeded_state(None).await);
        let resp = app
            .oneshot(request("/v1/messages", None, &[]))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["error"]["type"], "authentication_error");
    }
}
