//! HTTP surface: the client-facing relay routes and the admin API.

pub mod api;
pub mod auth;
pub mod relay_routes;

use std::sync::Arc;

use axum::Json;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Router, middleware};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::balance::BalanceClient;
use crate::config::Config;
use crate::error::RelayError;
use crate::relay::pipeline::RelayDeps;

/// Shared application state. Cheap to clone into every handler.
#[derive(Clone)]
pub struct AppState {
    pub deps: Arc<RelayDeps>,
    pub config: Arc<Config>,
    /// Unset when `UPSTREAM_BALANCE_URL` is not configured; login
    /// auto-provisioning and balance sync are disabled then.
    pub balance: Option<Arc<BalanceClient>>,
}

/// Render a pipeline error in the wire flavor the caller expects: the
/// Anthropic and Gemini native endpoints re-encode the envelope, everyone
/// else gets the OpenAI shape.
pub(crate) fn error_response_for_path(path: &str, err: RelayError) -> Response {
    let status = err.status();
    let body = if path.starts_with("/v1/messages") {
        err.to_anthropic_body()
    } else if path.starts_with("/v1beta") {
        err.to_gemini_body()
    } else {
        err.to_openai_body()
    };
    (status, Json(body)).into_response()
}

/// Assemble the full router.
pub fn build_router(state: AppState) -> Router {
    let relay = Router::new()
        .route("/v1/chat/completions", post(relay_routes::chat_completions))
        .route("/v1/completions", post(relay_routes::completions))
        .route("/v1/embeddings", post(relay_routes::embeddings))
        .route("/v1/rerank", post(relay_routes::rerank))
        .route("/v1/audio/speech", post(relay_routes::audio_speech))
        .route("/v1/audio/transcriptions", post(relay_routes::audio_transcriptions))
        .route("/v1/images/generations", post(relay_routes::images_generations))
        .route("/v1/videos/generations", post(relay_routes::video_generations))
        .route("/v1/responses", post(relay_routes::responses))
        .route("/v1/parse/pdf", post(relay_routes::parse_pdf))
        .route("/v1/messages", post(relay_routes::anthropic_messages))
        .route("/v1beta/models/{model_action}", post(relay_routes::gemini_generate))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::relay_auth,
        ));

    let mut router = Router::new()
        .merge(relay)
        .nest("/api", api::router(state.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(CatchPanicLayer::new());

    if state.config.server.gzip_enabled {
        router = router.layer(CompressionLayer::new());
    }

    router.with_state(state)
}

/// Bind and serve until ctrl-c.
pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let addr = state.config.server.listen_addr.clone();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "llmgate listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;
    Ok(())
}
