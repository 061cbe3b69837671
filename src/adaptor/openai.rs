//! The OpenAI adaptor: composition root for every OpenAI-shaped provider.
//!
//! Streaming responses pass frames through unchanged while harvesting usage;
//! buffered responses are forwarded byte-equivalent. Providers that only
//! differ in base URL or error format delegate here (see `compat`).

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

use crate::error::{ErrorKind, RelayError};
use crate::model::{Channel, Usage};
use crate::relay::meta::RequestMeta;
use crate::relay::mode::Mode;

use super::sse::{self, FrameTranslator, SharedOutcome, StreamOutcome};
use super::{Adaptor, AdaptorMetadata, ConvertedRequest, RelayPayload};

const BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Default)]
pub struct OpenAiAdaptor;

/// Upstream path per mode, relative to the versioned base URL.
pub(crate) fn path_for(mode: Mode) -> Option<&'static str> {
    Some(match mode {
        Mode::ChatCompletions => "/chat/completions",
        Mode::Completions => "/completions",
        Mode::Embeddings => "/embeddings",
        Mode::Rerank => "/rerank",
        Mode::AudioSpeech => "/audio/speech",
        Mode::AudioTranscription => "/audio/transcriptions",
        Mode::ImagesGenerations => "/images/generations",
        Mode::VideoGenerations => "/videos/generations",
        Mode::Responses => "/responses",
        Mode::ParsePdf => "/parse/pdf",
        Mode::AnthropicMessages | Mode::GeminiGenerate => return None,
    })
}

impl OpenAiAdaptor {
    /// Request conversion shared with the OpenAI-shaped family; `base` is
    /// the delegating adaptor's default base URL.
    pub(crate) fn convert_with_base(
        &self,
        base: &str,
        meta: &RequestMeta,
        channel: &Channel,
        body: &[u8],
    ) -> Result<ConvertedRequest, RelayError> {
        let path = path_for(meta.mode).ok_or_else(|| {
            RelayError::validation(format!("mode {} has no OpenAI-shaped path", meta.mode))
        })?;
        let base = channel.base_url.as_deref().unwrap_or(base);
        let url = format!("{}{}", base.trim_end_matches('/'), path);

        // Multipart modes pass through opaque; everything else is JSON with
        // the model rewritten to the channel's upstream name.
        let request = if meta.mode.has_json_body() {
            let mut value: Value = serde_json::from_slice(body)?;
            let obj = value
                .as_object_mut()
                .ok_or_else(|| RelayError::validation("request body must be a JSON object"))?;
            obj.insert("model".to_string(), Value::String(meta.upstream_model.clone()));
            if meta.stream && meta.mode == Mode::ChatCompletions {
                // Ask for the final usage chunk so billing sees real counts.
                let opts = obj
                    .entry("stream_options")
                    .or_insert_with(|| serde_json::json!({}));
                if let Some(opts) = opts.as_object_mut() {
                    opts.entry("include_usage").or_insert(Value::Bool(true));
                }
            }
            let body = serde_json::to_vec(&value)
                .map_err(|e| RelayError::internal(format!("re-encode request: {e}")))?;
            ConvertedRequest::json(url, Bytes::from(body), meta.stream)
        } else {
            ConvertedRequest {
                method: reqwest::Method::POST,
                url,
                headers: Vec::new(),
                body: Some(Bytes::copy_from_slice(body)),
                content_type: meta
                    .request_content_type
                    .clone()
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                streaming: false,
            }
        };

        Ok(request.bearer(&channel.key))
    }
}

#[async_trait]
impl Adaptor for OpenAiAdaptor {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn default_base_url(&self) -> &'static str {
        BASE_URL
    }

    fn supports_mode(&self, mode: Mode) -> bool {
        path_for(mode).is_some()
    }

    fn validate_key(&self, key: &str) -> Result<(), RelayError> {
        if key.trim().is_empty() {
            return Err(RelayError::validation("key must not be empty"));
        }
        Ok(())
    }

    fn convert_request(
        &self,
        meta: &RequestMeta,
        channel: &Channel,
        body: &[u8],
    ) -> Result<ConvertedRequest, RelayError> {
        self.convert_with_base(BASE_URL, meta, channel, body)
    }

    async fn do_response(
        &self,
        meta: &RequestMeta,
        resp: reqwest::Response,
    ) -> Result<RelayPayload, RelayError> {
        openai_response(meta, resp).await
    }

    fn metadata(&self) -> AdaptorMetadata {
        AdaptorMetadata {
            readme: "https://platform.openai.com/docs/api-reference",
            key_help: "sk-...",
            models: vec!["gpt-4o", "gpt-4o-mini", "o3-mini", "text-embedding-3-small"],
        }
    }
}

/// Response handling shared with the OpenAI-shaped family.
pub(crate) async fn openai_response(
    _meta: &RequestMeta,
    resp: reqwest::Response,
) -> Result<RelayPayload, RelayError> {
    let status = resp.status().as_u16();
    if is_event_stream(&resp) {
        let outcome: SharedOutcome = SharedOutcome::default();
        let stream = sse::translate_sse(resp, outcome.clone(), OpenAiFrames);
        return Ok(RelayPayload::Stream {
            status,
            stream,
            outcome,
        });
    }

    let content_type = response_content_type(&resp);
    let body = resp.bytes().await.map_err(|e| {
        RelayError::new(ErrorKind::UpstreamBadResponse, format!("read upstream body: {e}"))
    })?;
    if body.is_empty() {
        return Err(RelayError::new(
            ErrorKind::UpstreamBadResponse,
            "upstream returned an empty body",
        ));
    }
    Ok(json_payload(status, content_type, body))
}

/// Buffered payload with usage extracted; the body is forwarded
/// byte-equivalent.
pub(crate) fn json_payload(status: u16, content_type: String, body: Bytes) -> RelayPayload {
    let usage = serde_json::from_slice::<Value>(&body)
        .ok()
        .map(|value| usage_from_value(value.get("usage")))
        .unwrap_or_default();
    RelayPayload::Json {
        status,
        content_type,
        body,
        usage,
    }
}

pub(crate) fn is_event_stream(resp: &reqwest::Response) -> bool {
    resp.headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/event-stream"))
}

pub(crate) fn response_content_type(resp: &reqwest::Response) -> String {
    resp.headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_string()
}

/// Passthrough translator for OpenAI-shaped streams: forwards every frame
/// unchanged, accumulates usage and content length on the way.
pub(crate) struct OpenAiFrames;

impl FrameTranslator for OpenAiFrames {
    fn on_frame(&mut self, data: &str, outcome: &mut StreamOutcome) -> Option<String> {
        let trimmed = data.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed == "[DONE]" {
            outcome.done_seen = true;
            return Some(trimmed.to_string());
        }

        if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
            outcome.usage.absorb(&usage_from_value(value.get("usage")));
            if let Some(choices) = value.get("choices").and_then(Value::as_array) {
                for choice in choices {
                    if let Some(content) = choice
                        .pointer("/delta/content")
                        .and_then(Value::as_str)
                    {
                        outcome.content_len += content.len() as u64;
                    }
                }
            }
        }

        Some(trimmed.to_string())
    }
}

/// Map an OpenAI `usage` object into the gateway's counters.
pub(crate) fn usage_from_value(value: Option<&Value>) -> Usage {
    let Some(value) = value.filter(|v| !v.is_null()) else {
        return Usage::default();
    };

    let count = |ptr: &str| value.pointer(ptr).and_then(Value::as_u64).unwrap_or(0);

    Usage {
        input_tokens: count("/prompt_tokens").max(count("/input_tokens")),
        output_tokens: count("/completion_tokens").max(count("/output_tokens")),
        cached_tokens: count("/prompt_tokens_details/cached_tokens"),
        reasoning_tokens: count("/completion_tokens_details/reasoning_tokens"),
        image_count: 0,
        audio_seconds: 0,
    }
}

/// Normalize a non-2xx OpenAI-shaped upstream body into the uniform
/// envelope. OpenRouter wraps the true upstream error in
/// `error.metadata.raw`; that is unwrapped here so every delegating
/// provider benefits.
pub fn parse_upstream_error(status: u16, body: &[u8]) -> RelayError {
    let raw = String::from_utf8_lossy(body).into_owned();

    let mut status = status;
    let mut message = String::new();
    let mut wire_type: Option<String> = None;
    let mut param: Option<String> = None;

    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        if let Some(error) = value.get("error") {
            if let Some(m) = error.get("message").and_then(Value::as_str) {
                message = m.to_string();
            }
            wire_type = error
                .get("type")
                .and_then(Value::as_str)
                .map(str::to_string);
            param = error
                .get("param")
                .and_then(Value::as_str)
                .map(str::to_string);

            // Unwrap the real upstream error from OpenRouter's metadata.raw,
            // preserving the HTTP status.
            if let Some(raw_inner) = error
                .pointer("/metadata/raw")
                .and_then(Value::as_str)
            {
                if let Ok(inner) = serde_json::from_str::<Value>(raw_inner) {
                    if let Some(m) = inner.pointer("/error/message").and_then(Value::as_str) {
                        if !m.is_empty() {
                            message = m.to_string();
                            if let Some(t) = inner.pointer("/error/type").and_then(Value::as_str)
                            {
                                wire_type = Some(t.to_string());
                            }
                        }
                    }
                }
            }

            // A numeric error.code in the 4xx/5xx range overrides the
            // transport status.
            if let Some(code) = error.get("code").and_then(Value::as_i64) {
                if (400..600).contains(&code) {
                    status = code as u16;
                }
            }
        }
    }

    if message.is_empty() {
        message = if raw.trim().is_empty() {
            format!("bad response status code {status}")
        } else {
            raw.trim().to_string()
        };
    }

    // Model-capability complaints come back as 5xx from some providers but
    // are client errors.
    if message.starts_with("tools is not supported in this model.") {
        status = 400;
    }

    let kind = kind_for_status(status);
    let mut err = RelayError::new(kind, message)
        .with_status(status)
        .with_upstream_body(raw);
    if let Some(t) = wire_type {
        err = err.with_wire_type(t);
    }
    if let Some(p) = param {
        err = err.with_param(p);
    }
    err
}

/// Failure class implied by an upstream status: 429 retries on another
/// channel, 5xx is retryable, other 4xx surface verbatim.
pub(crate) fn kind_for_status(status: u16) -> ErrorKind {
    match status {
        429 => ErrorKind::RateLimited,
        s if s >= 500 => ErrorKind::UpstreamRefused,
        _ => ErrorKind::Validation,
    }
}
