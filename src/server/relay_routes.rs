//! Client-facing relay handlers: one per inference endpoint, all funneling
//! into the relay pipeline.

use axum::Extension;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::http::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use axum::response::Response;
use bytes::Bytes;

use crate::error::RelayError;
use crate::relay::mode::Mode;
use crate::relay::pipeline::{self, Admission, RelayRequest, RelayResponse};

use super::{AppState, error_response_for_path};

macro_rules! relay_handler {
    ($name:ident, $mode:expr) => {
        pub async fn $name(
            State(state): State<AppState>,
            Extension(admission): Extension<Admission>,
            headers: HeaderMap,
            body: Bytes,
        ) -> Response {
            handle(state, admission, $mode, headers, body, None, false).await
        }
    };
}

relay_handler!(chat_completions, Mode::ChatCompletions);
relay_handler!(completions, Mode::Completions);
relay_handler!(embeddings, Mode::Embeddings);
relay_handler!(rerank, Mode::Rerank);
relay_handler!(audio_speech, Mode::AudioSpeech);
relay_handler!(audio_transcriptions, Mode::AudioTranscription);
relay_handler!(images_generations, Mode::ImagesGenerations);
relay_handler!(video_generations, Mode::VideoGenerations);
relay_handler!(responses, Mode::Responses);
relay_handler!(parse_pdf, Mode::ParsePdf);
relay_handler!(anthropic_messages, Mode::AnthropicMessages);

/// Gemini-native entry: the path carries `{model}:{action}` and the action
/// decides streaming.
pub async fn gemini_generate(
    State(state): State<AppState>,
    Extension(admission): Extension<Admission>,
    Path(model_action): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let (model, action) = match model_action.split_once(':') {
        Some(parts) => parts,
        None => {
            return error_response_for_path(
                "/v1beta",
                RelayError::validation("expected path models/{model}:{action}"),
            );
        }
    };
    let stream = match action.split('?').next() {
        Some("generateContent") => false,
        Some("streamGenerateContent") => true,
        _ => {
            return error_response_for_path(
                "/v1beta",
                RelayError::validation(format!("unsupported action {action}")),
            );
        }
    };

    handle(
        state,
        admission,
        Mode::GeminiGenerate,
        headers,
        body,
        Some(model.to_string()),
        stream,
    )
    .await
}

async fn handle(
    state: AppState,
    admission: Admission,
    mode: Mode,
    headers: HeaderMap,
    body: Bytes,
    model_hint: Option<String>,
    stream_hint: bool,
) -> Response {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let accepts_sse = headers
        .get(ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("text/event-stream"));

    let request = RelayRequest {
        mode,
        body,
        content_type,
        model_hint,
        stream_hint: stream_hint || accepts_sse,
    };

    let path = client_path(mode);
    match pipeline::relay(&state.deps, admission, request).await {
        Ok(RelayResponse::Json {
            status,
            content_type,
            body,
        }) => Response::builder()
            .status(status)
            .header(CONTENT_TYPE, content_type)
            .body(Body::from(body))
            .unwrap_or_default(),
        Ok(RelayResponse::Stream { status, stream }) => Response::builder()
            .status(status)
            .header(CONTENT_TYPE, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .body(Body::from_stream(stream))
            .unwrap_or_default(),
        Err(err) => error_response_for_path(path, err),
    }
}

/// Canonical client path per mode, for error-envelope flavoring.
fn client_path(mode: Mode) -> &'static str {
    match mode {
        Mode::AnthropicMessages => "/v1/messages",
        Mode::GeminiGenerate => "/v1beta/models",
        _ => "/v1",
    }
}
