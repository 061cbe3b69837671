//! Gemini adaptor: full translator for the `generateContent` protocol.
//!
//! Native `/v1beta` traffic passes through; OpenAI-mode chat requests are
//! converted to `contents`/`parts` and the responses (streamed or not)
//! translated back into the OpenAI shape.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::error::{ErrorKind, RelayError};
use crate::model::{Channel, Usage};
use crate::relay::meta::RequestMeta;
use crate::relay::mode::Mode;

use super::openai;
use super::sse::{self, FrameTranslator, SharedOutcome, StreamOutcome};
use super::{Adaptor, AdaptorMetadata, ConvertedRequest, RelayPayload};

const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Default)]
pub struct GeminiAdaptor;

#[async_trait]
impl Adaptor for GeminiAdaptor {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn default_base_url(&self) -> &'static str {
        BASE_URL
    }

    fn supports_mode(&self, mode: Mode) -> bool {
        matches!(mode, Mode::ChatCompletions | Mode::GeminiGenerate)
    }

    fn convert_request(
        &self,
        meta: &RequestMeta,
        channel: &Channel,
        body: &[u8],
    ) -> Result<ConvertedRequest, RelayError> {
        let value: Value = serde_json::from_slice(body)?;
        let converted = match meta.mode {
            Mode::GeminiGenerate => value,
            Mode::ChatCompletions => chat_to_generate(&value)?,
            other => {
                return Err(RelayError::validation(format!(
                    "gemini channels cannot serve mode {other}"
                )));
            }
        };

        let action = if meta.stream {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        let base = channel.base_url.as_deref().unwrap_or(BASE_URL);
        let url = format!(
            "{}/models/{}:{}",
            base.trim_end_matches('/'),
            meta.upstream_model,
            action
        );
        let body = serde_json::to_vec(&converted)
            .map_err(|e| RelayError::internal(format!("re-encode request: {e}")))?;

        Ok(ConvertedRequest::json(url, Bytes::from(body), meta.stream)
            .header("x-goog-api-key", channel.key.clone()))
    }

    async fn do_response(
        &self,
        meta: &RequestMeta,
        resp: reqwest::Response,
    ) -> Result<RelayPayload, RelayError> {
        let status = resp.status().as_u16();

        if openai::is_event_stream(&resp) {
            let outcome: SharedOutcome = SharedOutcome::default();
            let stream = match meta.mode {
                Mode::GeminiGenerate => sse::translate_sse(resp, outcome.clone(), NativeFrames),
                _ => sse::translate_sse(
                    resp,
                    outcome.clone(),
                    ToOpenAiFrames::new(&meta.actual_model),
                ),
            };
            return Ok(RelayPayload::Stream {
                status,
                stream,
                outcome,
            });
        }

        let content_type = openai::response_content_type(&resp);
        let body = resp.bytes().await.map_err(|e| {
            RelayError::new(
                ErrorKind::UpstreamBadResponse,
                format!("read upstream body: {e}"),
            )
        })?;
        let value: Value = serde_json::from_slice(&body).map_err(|e| {
            RelayError::new(
                ErrorKind::UpstreamBadResponse,
                format!("upstream returned invalid JSON: {e}"),
            )
        })?;
        let usage = native_usage(value.get("usageMetadata"));

        match meta.mode {
            Mode::GeminiGenerate => Ok(RelayPayload::Json {
                status,
                content_type,
                body,
                usage,
            }),
            _ => {
                let openai_body = generate_to_chat_completion(&value, &meta.actual_model, usage);
                let body = serde_json::to_vec(&openai_body)
                    .map_err(|e| RelayError::internal(format!("re-encode response: {e}")))?;
                Ok(RelayPayload::Json {
                    status,
                    content_type: "application/json".to_string(),
                    body: Bytes::from(body),
                    usage,
                })
            }
        }
    }

    fn handle_error(&self, status: u16, body: &[u8]) -> RelayError {
        let raw = String::from_utf8_lossy(body).into_owned();
        if let Ok(value) = serde_json::from_slice::<Value>(body) {
            if let Some(error) = value.get("error") {
                let message = error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("gemini error")
                    .to_string();
                let status = error
                    .get("code")
                    .and_then(Value::as_i64)
                    .filter(|c| (400..600).contains(c))
                    .map(|c| c as u16)
                    .unwrap_or(status);
                let mut err =
                    RelayError::new(openai::kind_for_status(status), message).with_status(status);
                if let Some(grpc) = error.get("status").and_then(Value::as_str) {
                    err = err.with_param(grpc.to_string());
                }
                return err.with_upstream_body(raw);
            }
        }
        openai::parse_upstream_error(status, body)
    }

    fn metadata(&self) -> AdaptorMetadata {
        AdaptorMetadata {
            readme: "https://ai.google.dev/gemini-api/docs",
            key_help: "AIza...",
            models: vec!["gemini-2.5-pro", "gemini-2.5-flash"],
        }
    }
}

/// OpenAI chat request -> Gemini `generateContent` request.
fn chat_to_generate(body: &Value) -> Result<Value, RelayError> {
    let messages = body
        .get("messages")
        .and_then(Value::as_array)
        .ok_or_else(|| RelayError::validation("messages is required").with_param("messages"))?;

    let mut system_parts: Vec<Value> = Vec::new();
    let mut contents: Vec<Value> = Vec::new();
    for message in messages {
        let role = message.get("role").and_then(Value::as_str).unwrap_or("user");
        let text = super::flatten_chat_content(message.get("content"));
        match role {
            "system" | "developer" => system_parts.push(json!({"text": text})),
            "assistant" => contents.push(json!({"role": "model", "parts": [{"text": text}]})),
            _ => contents.push(json!({"role": "user", "parts": [{"text": text}]})),
        }
    }

    let mut out = json!({ "contents": contents });
    let obj = out.as_object_mut().expect("literal object");
    if !system_parts.is_empty() {
        obj.insert("systemInstruction".into(), json!({"parts": system_parts}));
    }

    let mut generation_config = serde_json::Map::new();
    if let Some(t) = body.get("temperature").and_then(Value::as_f64) {
        generation_config.insert("temperature".into(), json!(t));
    }
    if let Some(p) = body.get("top_p").and_then(Value::as_f64) {
        generation_config.insert("topP".into(), json!(p));
    }
    if let Some(max) = body
        .get("max_tokens")
        .or_else(|| body.get("max_completion_tokens"))
        .and_then(Value::as_u64)
    {
        generation_config.insert("maxOutputTokens".into(), json!(max));
    }
    if !generation_config.is_empty() {
        obj.insert("generationConfig".into(), Value::Object(generation_config));
    }
    Ok(out)
}

fn candidate_text(value: &Value) -> String {
    value
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

fn finish_reason(value: &Value) -> Option<&'static str> {
    match value
        .pointer("/candidates/0/finishReason")
        .and_then(Value::as_str)
    {
        Some("STOP") => Some("stop"),
        Some("MAX_TOKENS") => Some("length"),
        Some("SAFETY") | Some("PROHIBITED_CONTENT") => Some("content_filter"),
        Some(_) => Some("stop"),
        None => None,
    }
}

/// Gemini response -> OpenAI chat completion.
fn generate_to_chat_completion(value: &Value, model: &str, usage: Usage) -> Value {
    json!({
        "id": format!("chatcmpl-{}", Uuid::new_v4().simple()),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": candidate_text(value)},
            "finish_reason": finish_reason(value).unwrap_or("stop"),
        }],
        "usage": {
            "prompt_tokens": usage.input_tokens,
            "completion_tokens": usage.output_tokens,
            "total_tokens": usage.total_tokens(),
        }
    })
}

fn native_usage(value: Option<&Value>) -> Usage {
    let Some(value) = value.filter(|v| !v.is_null()) else {
        return Usage::default();
    };
    let count = |key: &str| value.get(key).and_then(Value::as_u64).unwrap_or(0);
    Usage {
        input_tokens: count("promptTokenCount"),
        output_tokens: count("candidatesTokenCount"),
        cached_tokens: count("cachedContentTokenCount"),
        reasoning_tokens: count("thoughtsTokenCount"),
        image_count: 0,
        audio_seconds: 0,
    }
}

/// Passthrough translator for native streams. Gemini has no `[DONE]`
/// sentinel; completion is a frame with a finish reason.
struct NativeFrames;

impl FrameTranslator for NativeFrames {
    fn on_frame(&mut self, data: &str, outcome: &mut StreamOutcome) -> Option<String> {
        let trimmed = data.trim();
        if trimmed.is_empty() {
            return None;
        }
        if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
            outcome.usage.absorb(&native_usage(value.get("usageMetadata")));
            outcome.content_len += candidate_text(&value).len() as u64;
            if finish_reason(&value).is_some() {
                outcome.done_seen = true;
            }
        }
        Some(trimmed.to_string())
    }
}

/// Translates Gemini stream frames into OpenAI chat chunks.
struct ToOpenAiFrames {
    id: String,
    model: String,
    created: i64,
    role_sent: bool,
}

impl ToOpenAiFrames {
    fn new(model: &str) -> Self {
        Self {
            id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
            model: model.to_string(),
            created: chrono::Utc::now().timestamp(),
            role_sent: false,
        }
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> String {
        json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }]
        })
        .to_string()
    }
}

impl FrameTranslator for ToOpenAiFrames {
    fn on_frame(&mut self, data: &str, outcome: &mut StreamOutcome) -> Option<String> {
        let trimmed = data.trim();
        if trimmed.is_empty() {
            return None;
        }
        let value: Value = serde_json::from_str(trimmed).ok()?;
        outcome.usage.absorb(&native_usage(value.get("usageMetadata")));

        let text = candidate_text(&value);
        outcome.content_len += text.len() as u64;
        let reason = finish_reason(&value);
        if reason.is_some() {
            outcome.done_seen = true;
        }

        let mut delta = serde_json::Map::new();
        if !self.role_sent {
            delta.insert("role".into(), json!("assistant"));
            self.role_sent = true;
        }
        if !text.is_empty() {
            delta.insert("content".into(), json!(text));
        }
        Some(self.chunk(Value::Object(delta), reason))
    }
}
