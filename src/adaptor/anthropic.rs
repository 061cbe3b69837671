//! Anthropic adaptor: full translator, since the Messages API differs
//! materially from the OpenAI shape.
//!
//! Native `/v1/messages` traffic passes through with only the model
//! rewritten; OpenAI-mode chat requests are converted in both directions,
//! including event-by-event SSE translation.

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

const BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u64 = 4096;

#[derive(Debug, Default)]
pub struct AnthropicAdaptor;

#[async_trait]
impl Adaptor for AnthropicAdaptor {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn default_base_url(&self) -> &'static str {
        BASE_URL
    }

    fn supports_mode(&self, mode: Mode) -> bool {
        matches!(mode, Mode::ChatCompletions | Mode::AnthropicMessages)
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
        let value: Value = serde_json::from_slice(body)?;
        let converted = match meta.mode {
            Mode::AnthropicMessages => {
                let mut value = value;
                let obj = value.as_object_mut().ok_or_else(|| {
                    RelayError::validation("request body must be a JSON object")
                })?;
                obj.insert("model".into(), Value::String(meta.upstream_model.clone()));
                value
            }
            Mode::ChatCompletions => chat_to_messages(&value, &meta.upstream_model, meta.stream)?,
            other => {
                return Err(RelayError::validation(format!(
                    "anthropic channels cannot serve mode {other}"
                )));
            }
        };

        let base = channel.base_url.as_deref().unwrap_or(BASE_URL);
        let url = format!("{}/messages", base.trim_end_matches('/'));
        let body = serde_json::to_vec(&converted)
            .map_err(|e| RelayError::internal(format!("re-encode request: {e}")))?;

        Ok(ConvertedRequest::json(url, Bytes::from(body), meta.stream)
            .header("x-api-key", channel.key.clone())
            .header("anthropic-version", API_VERSION))
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
                Mode::AnthropicMessages => {
                    sse::translate_sse(resp, outcome.clone(), NativeFrames)
                }
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
        let usage = native_usage(value.get("usage"));

        match meta.mode {
            Mode::AnthropicMessages => Ok(RelayPayload::Json {
                status,
                content_type,
                body,
                usage,
            }),
            _ => {
                let openai_body = message_to_chat_completion(&value, &meta.actual_model, usage);
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
                let wire_type = error
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let message = error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("anthropic error")
                    .to_string();
                let status = match wire_type {
                    "authentication_error" => 401,
                    "permission_error" => 403,
                    "not_found_error" => 404,
                    "rate_limit_error" => 429,
                    "overloaded_error" => 503,
                    "invalid_request_error" => 400,
                    _ => status,
                };
                return RelayError::new(openai::kind_for_status(status), message)
                    .with_status(status)
                    .with_wire_type(wire_type.to_string())
                    .with_upstream_body(raw);
            }
        }
        openai::parse_upstream_error(status, body)
    }

    fn metadata(&self) -> AdaptorMetadata {
        AdaptorMetadata {
            readme: "https://docs.anthropic.com/en/api/messages",
            key_help: "sk-ant-...",
            models: vec!["claude-sonnet-4-20250514", "claude-3-5-haiku-20241022"],
        }
    }
}

/// OpenAI chat request -> Anthropic Messages request.
fn chat_to_messages(body: &Value, model: &str, stream: bool) -> Result<Value, RelayError> {
    let messages = body
        .get("messages")
        .and_then(Value::as_array)
        .ok_or_else(|| RelayError::validation("messages is required").with_param("messages"))?;

    let mut system_parts: Vec<String> = Vec::new();
    let mut converted: Vec<Value> = Vec::new();
    for message in messages {
        let role = message.get("role").and_then(Value::as_str).unwrap_or("user");
        let content = super::flatten_chat_content(message.get("content"));
        match role {
            "system" | "developer" => system_parts.push(content),
            "assistant" => converted.push(json!({"role": "assistant", "content": content})),
            _ => converted.push(json!({"role": "user", "content": content})),
        }
    }

    let max_tokens = body
        .get("max_tokens")
        .or_else(|| body.get("max_completion_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(DEFAULT_MAX_TOKENS);

    let mut out = json!({
        "model": model,
        "messages": converted,
        "max_tokens": max_tokens,
    });
    let obj = out.as_object_mut().expect("literal object");
    if !system_parts.is_empty() {
        obj.insert("system".into(), Value::String(system_parts.join("\n\n")));
    }
    if let Some(t) = body.get("temperature").and_then(Value::as_f64) {
        obj.insert("temperature".into(), json!(t));
    }
    if let Some(p) = body.get("top_p").and_then(Value::as_f64) {
        obj.insert("top_p".into(), json!(p));
    }
    if let Some(stop) = body.get("stop") {
        let sequences = match stop {
            Value::String(s) => vec![s.clone()],
            Value::Array(items) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => vec![],
        };
        if !sequences.is_empty() {
            obj.insert("stop_sequences".into(), json!(sequences));
        }
    }
    if stream {
        obj.insert("stream".into(), Value::Bool(true));
    }
    Ok(out)
}

/// Anthropic Messages response -> OpenAI chat completion.
fn message_to_chat_completion(value: &Value, model: &str, usage: Usage) -> Value {
    let content = value
        .get("content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();
    let finish_reason = finish_reason(value.get("stop_reason").and_then(Value::as_str));
    let id = value
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(chat_completion_id);

    json!({
        "id": id,
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": finish_reason,
        }],
        "usage": {
            "prompt_tokens": usage.input_tokens,
            "completion_tokens": usage.output_tokens,
            "total_tokens": usage.total_tokens(),
        }
    })
}

fn finish_reason(stop_reason: Option<&str>) -> &'static str {
    match stop_reason {
        Some("max_tokens") => "length",
        Some("tool_use") => "tool_calls",
        _ => "stop",
    }
}

fn chat_completion_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4().simple())
}

/// Anthropic usage blocks name their counters natively.
fn native_usage(value: Option<&Value>) -> Usage {
    let Some(value) = value.filter(|v| !v.is_null()) else {
        return Usage::default();
    };
    let count = |key: &str| value.get(key).and_then(Value::as_u64).unwrap_or(0);
    Usage {
        input_tokens: count("input_tokens"),
        output_tokens: count("output_tokens"),
        cached_tokens: count("cache_read_input_tokens"),
        reasoning_tokens: 0,
        image_count: 0,
        audio_seconds: 0,
    }
}

/// Passthrough translator for native `/v1/messages` streams.
struct NativeFrames;

impl FrameTranslator for NativeFrames {
    fn on_frame(&mut self, data: &str, outcome: &mut StreamOutcome) -> Option<String> {
        let trimmed = data.trim();
        if trimmed.is_empty() {
            return None;
        }
        if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
            match value.get("type").and_then(Value::as_str) {
                Some("message_start") => {
                    outcome
                        .usage
                        .absorb(&native_usage(value.pointer("/message/usage")));
                }
                Some("message_delta") => {
                    outcome.usage.absorb(&native_usage(value.get("usage")));
                }
                Some("content_block_delta") => {
                    if let Some(text) = value.pointer("/delta/text").and_then(Value::as_str) {
                        outcome.content_len += text.len() as u64;
                    }
                }
                Some("message_stop") => outcome.done_seen = true,
                _ => {}
            }
        }
        Some(trimmed.to_string())
    }
}

/// Translates Anthropic stream events into OpenAI chat chunks.
struct ToOpenAiFrames {
    id: String,
    model: String,
    created: i64,
}

impl ToOpenAiFrames {
    fn new(model: &str) -> Self {
        Self {
            id: chat_completion_id(),
            model: model.to_string(),
            created: chrono::Utc::now().timestamp(),
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

        match value.get("type").and_then(Value::as_str) {
            Some("message_start") => {
                outcome
                    .usage
                    .absorb(&native_usage(value.pointer("/message/usage")));
                Some(self.chunk(json!({"role": "assistant"}), None))
            }
            Some("content_block_delta") => {
                let text = value.pointer("/delta/text").and_then(Value::as_str)?;
                outcome.content_len += text.len() as u64;
                Some(self.chunk(json!({"content": text}), None))
            }
            Some("message_delta") => {
                outcome.usage.absorb(&native_usage(value.get("usage")));
                let reason =
                    finish_reason(value.pointer("/delta/stop_reason").and_then(Value::as_str));
                Some(self.chunk(json!({}), Some(reason)))
            }
            Some("message_stop") => {
                outcome.done_seen = true;
                Some("[DONE]".to_string())
            }
            // ping, content_block_start/stop carry nothing for the client
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;

    use chrono::Utc;

    use crate::model::{ChannelStatus, ChannelType, Group, Token};

    fn channel() -> Channel {
        Channel {
            id: 1,
            channel_type: ChannelType::Anthropic,
            name: "claude".into(),
            key: "sk-ant-x".into(),
            base_url: None,
            priority: 0,
            weight: 1,
            status: ChannelStatus::Enabled,
            models: HashSet::new(),
            model_mapping: HashMap::new(),
            sets: vec![],
            created_at: Utc::now(),
        }
    }

    fn meta(mode: Mode, stream: bool) -> RequestMeta {
        let mut meta = RequestMeta::new(
            mode,
            Arc::new(Token::internal("k")),
            Arc::new(Group::internal(vec![])),
            true,
        );
        meta.actual_model = "claude-sonnet-4-20250514".into();
        meta.upstream_model = "claude-sonnet-4-20250514".into();
        meta.stream = stream;
        meta
    }

    #[test]
    fn chat_request_converted_to_messages() {
        let body = json!({
            "model": "claude-sonnet-4-20250514",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hi"},
            ],
            "temperature": 0.5,
            "stop": ["END"],
        });
        let converted = AnthropicAdaptor
            .convert_request(
                &meta(Mode::ChatCompletions, false),
                &channel(),
                body.to_string().as_bytes(),
            )
            .unwrap();

        assert_eq!(converted.url, "https://api.anthropic.com/v1/messages");
        assert!(converted
            .headers
            .iter()
            .any(|(n, v)| *n == "x-api-key" && v == "sk-ant-x"));

        let value: Value = serde_json::from_slice(converted.body.as_ref().unwrap()).unwrap();
        assert_eq!(value["system"], "be brief");
        assert_eq!(value["messages"].as_array().unwrap().len(), 1);
        assert_eq!(value["max_tokens"], DEFAULT_MAX_TOKENS);
        assert_eq!(value["stop_sequences"][0], "END");
        assert!(value.get("stream").is_none());
    }

    #[test]
    fn native_request_passes_through_with_model_rewrite() {
        let body = json!({"model": "claude", "messages": [], "max_tokens": 100});
        let converted = AnthropicAdaptor
            .convert_request(
                &meta(Mode::AnthropicMessages, false),
                &channel(),
                body.to_string().as_bytes(),
            )
            .unwrap();
        let value: Value = serde_json::from_slice(converted.body.as_ref().unwrap()).unwrap();
        assert_eq!(value["model"], "claude-sonnet-4-20250514");
        assert_eq!(value["max_tokens"], 100);
    }

    #[test]
    fn non_stream_response_converted_to_openai_shape() {
        let value = json!({
            "id": "msg_123",
            "content": [{"type": "text", "text": "hello"}],
            "stop_reason": "end_turn",
        });
        let usage = Usage {
            input_tokens: 10,
            output_tokens: 4,
            ..Usage::default()
        };
        let out = message_to_chat_completion(&value, "claude-sonnet-4-20250514", usage);
        assert_eq!(out["object"], "chat.completion");
        assert_eq!(out["choices"][0]["message"]["content"], "hello");
        assert_eq!(out["choices"][0]["finish_reason"], "stop");
        assert_eq!(out["usage"]["total_tokens"], 14);
    }

    #[test]
    fn stream_translation_produces_openai_chunks() {
        let mut translator = ToOpenAiFrames::new("claude-sonnet-4-20250514");
        let mut outcome = StreamOutcome::default();

        let start = json!({
            "type": "message_start",
            "message": {"usage": {"input_tokens": 12, "output_tokens": 0}}
        });
        let role = translator
            .on_frame(&start.to_string(), &mut outcome)
            .unwrap();
        let role: Value = serde_json::from_str(&role).unwrap();
        assert_eq!(role["choices"][0]["delta"]["role"], "assistant");
        assert_eq!(outcome.usage.input_tokens, 12);

        let delta = json!({
            "type": "content_block_delta",
            "delta": {"type": "text_delta", "text": "hey"}
        });
        let chunk = translator
            .on_frame(&delta.to_string(), &mut outcome)
            .unwrap();
        let chunk: Value = serde_json::from_str(&chunk).unwrap();
        assert_eq!(chunk["choices"][0]["delta"]["content"], "hey");

        let stop = json!({
            "type": "message_delta",
            "delta": {"stop_reason": "max_tokens"},
            "usage": {"output_tokens": 9}
        });
        let finish = translator
            .on_frame(&stop.to_string(), &mut outcome)
            .unwrap();
        let finish: Value = serde_json::from_str(&finish).unwrap();
        assert_eq!(finish["choices"][0]["finish_reason"], "length");
        assert_eq!(outcome.usage.output_tokens, 9);

        assert_eq!(
            translator
                .on_frame(r#"{"type":"message_stop"}"#, &mut outcome)
                .as_deref(),
            Some("[DONE]")
        );
        assert!(outcome.done_seen);

        // ping frames are swallowed
        assert!(translator
            .on_frame(r#"{"type":"ping"}"#, &mut outcome)
            .is_none());
    }

    #[test]
    fn error_types_map_to_statuses() {
        let adaptor = AnthropicAdaptor;
        let err = adaptor.handle_error(
            400,
            br#"{"type":"error","error":{"type":"rate_limit_error","message":"busy"}}"#,
        );
        assert_eq!(err.status().as_u16(), 429);
        assert!(err.retryable());

        let err = adaptor.handle_error(
            200,
            br#"{"type":"error","error":{"type":"overloaded_error","message":"overloaded"}}"#,
        );
        assert_eq!(err.status().as_u16(), 503);
        assert!(err.retryable());
    }
}
