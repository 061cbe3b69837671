//! Provider adaptors: the uniform request/response contract every upstream
//! implements, and the registry mapping channel types to adaptors.
//!
//! Most providers expose OpenAI-shaped endpoints, so their adaptors hold an
//! [`openai::OpenAiAdaptor`] and override only the base URL and/or the error
//! handler. Anthropic and Gemini carry full translators because their wire
//! protocols differ materially.

pub mod anthropic;
pub mod compat;
pub mod gemini;
pub mod jina;
pub mod openai;
pub mod sse;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::error::{ErrorKind, RelayError};
use crate::model::{Channel, ChannelType, Usage};
use crate::relay::meta::RequestMeta;
use crate::relay::mode::Mode;
use sse::SharedOutcome;

/// Upstream HTTP request produced by `convert_request`.
#[derive(Debug)]
pub struct ConvertedRequest {
    pub method: reqwest::Method,
    pub url: String,
    pub headers: Vec<(&'static str, String)>,
    pub body: Option<Bytes>,
    pub content_type: String,
    /// Whether the caller negotiated a streamed response.
    pub streaming: bool,
}

impl ConvertedRequest {
    pub fn json(url: String, body: Bytes, streaming: bool) -> Self {
        Self {
            method: reqwest::Method::POST,
            url,
            headers: Vec::new(),
            body: Some(body),
            content_type: "application/json".to_string(),
            streaming,
        }
    }

    pub fn bearer(mut self, key: &str) -> Self {
        self.headers.push(("authorization", format!("Bearer {key}")));
        self
    }

    pub fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }
}

/// Converted upstream response handed back to the pipeline.
pub enum RelayPayload {
    /// Buffered JSON (or other non-streaming body), usage already known.
    Json {
        status: u16,
        content_type: String,
        body: Bytes,
        usage: Usage,
    },
    /// Frame stream; usage accumulates into `outcome` while bytes flow.
    Stream {
        status: u16,
        stream: BoxStream<'static, Result<Bytes, RelayError>>,
        outcome: SharedOutcome,
    },
}

/// Static description of a provider for the admin UI.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AdaptorMetadata {
    pub readme: &'static str,
    pub key_help: &'static str,
    /// Models the provider is known to serve, for channel bootstrap.
    pub models: Vec<&'static str>,
}

/// The uniform capability set every provider implements.
#[async_trait]
pub trait Adaptor: Send + Sync {
    fn name(&self) -> &'static str;

    fn default_base_url(&self) -> &'static str;

    fn supports_mode(&self, mode: Mode) -> bool;

    /// Cheap syntactic credential check used by admin channel creation.
    /// Providers without key structure fall back to accepting anything.
    fn validate_key(&self, _key: &str) -> Result<(), RelayError> {
        Ok(())
    }

    /// Rewrite the incoming request into the provider's native protocol.
    fn convert_request(
        &self,
        meta: &RequestMeta,
        channel: &Channel,
        body: &[u8],
    ) -> Result<ConvertedRequest, RelayError>;

    /// Issue the upstream request. The default covers plain HTTP providers;
    /// adaptors with exotic transports override this.
    async fn do_request(
        &self,
        client: &reqwest::Client,
        timeout: Duration,
        request: ConvertedRequest,
    ) -> Result<reqwest::Response, RelayError> {
        dispatch(client, timeout, request).await
    }

    /// Convert a successful upstream response for the client.
    async fn do_response(
        &self,
        meta: &RequestMeta,
        resp: reqwest::Response,
    ) -> Result<RelayPayload, RelayError>;

    /// Normalize a non-2xx upstream body into the uniform envelope.
    fn handle_error(&self, status: u16, body: &[u8]) -> RelayError {
        openai::parse_upstream_error(status, body)
    }

    /// Remaining balance on the channel's account, where the provider
    /// exposes one.
    async fn get_balance(
        &self,
        _client: &reqwest::Client,
        _channel: &Channel,
    ) -> Result<Decimal, RelayError> {
        Err(RelayError::new(
            ErrorKind::NotFound,
            "balance query not implemented for this provider",
        ))
    }

    fn metadata(&self) -> AdaptorMetadata {
        AdaptorMetadata::default()
    }
}

/// Shared HTTP dispatch: builds the reqwest call from a converted request
/// and classifies transport failures.
///
/// The per-attempt timeout bounds the whole exchange for buffered responses
/// but only the header phase for streams, so long generations are not cut
/// off mid-stream.
pub async fn dispatch(
    client: &reqwest::Client,
    timeout: Duration,
    request: ConvertedRequest,
) -> Result<reqwest::Response, RelayError> {
    let mut builder = client
        .request(request.method, &request.url)
        .header("content-type", request.content_type);
    for (name, value) in request.headers {
        builder = builder.header(name, value);
    }
    if let Some(body) = request.body {
        builder = builder.body(body);
    }
    if !request.streaming {
        builder = builder.timeout(timeout);
    }

    let send = builder.send();
    let resp = if request.streaming {
        match tokio::time::timeout(timeout, send).await {
            Ok(result) => result,
            Err(_) => {
                return Err(RelayError::new(
                    ErrorKind::UpstreamTimeout,
                    format!("upstream did not answer within {}s", timeout.as_secs()),
                ));
            }
        }
    } else {
        send.await
    };

    resp.map_err(classify_transport_error)
}

/// Chat message content may be a plain string or a list of typed parts;
/// native translators flatten it to text.
pub(crate) fn flatten_chat_content(content: Option<&serde_json::Value>) -> String {
    use serde_json::Value;
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

fn classify_transport_error(err: reqwest::Error) -> RelayError {
    let kind = if err.is_timeout() {
        ErrorKind::UpstreamTimeout
    } else {
        ErrorKind::UpstreamRefused
    };
    RelayError::new(kind, format!("upstream request failed: {err}"))
}

/// Channel type -> adaptor mapping, populated at process start.
pub struct AdaptorRegistry {
    map: HashMap<ChannelType, Arc<dyn Adaptor>>,
}

impl AdaptorRegistry {
    /// Registry with every built-in provider.
    pub fn builtin() -> Self {
        let openai_shaped = compat::openai_shaped_adaptors();

        let mut map: HashMap<ChannelType, Arc<dyn Adaptor>> = HashMap::new();
        map.insert(ChannelType::OpenAi, Arc::new(openai::OpenAiAdaptor::default()));
        map.insert(ChannelType::Anthropic, Arc::new(anthropic::AnthropicAdaptor::default()));
        map.insert(ChannelType::Gemini, Arc::new(gemini::GeminiAdaptor::default()));
        map.insert(ChannelType::Jina, Arc::new(jina::JinaAdaptor::default()));
        for (channel_type, adaptor) in openai_shaped {
            map.insert(channel_type, adaptor);
        }

        Self { map }
    }

    pub fn get(&self, channel_type: ChannelType) -> Option<Arc<dyn Adaptor>> {
        self.map.get(&channel_type).cloned()
    }

    /// Whether any registered adaptor can serve `mode`.
    pub fn any_supports(&self, mode: Mode) -> bool {
        self.map.values().any(|a| a.supports_mode(mode))
    }

    /// Provider descriptions for the admin UI.
    pub fn type_metas(&self) -> Vec<ChannelTypeMeta> {
        let mut metas: Vec<ChannelTypeMeta> = self
            .map
            .iter()
            .map(|(channel_type, adaptor)| {
                let meta = adaptor.metadata();
                ChannelTypeMeta {
                    channel_type: *channel_type,
                    name: adaptor.name(),
                    default_base_url: adaptor.default_base_url(),
                    key_help: meta.key_help,
                    models: meta.models,
                }
            })
            .collect();
        metas.sort_by_key(|m| m.channel_type.as_i64());
        metas
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelTypeMeta {
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    pub name: &'static str,
    pub default_base_url: &'static str,
    pub key_help: &'static str,
    pub models: Vec<&'static str>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_covers_every_channel_type() {
        let registry = AdaptorRegistry::builtin();
        for channel_type in ChannelType::ALL {
            assert!(
                registry.get(*channel_type).is_some(),
                "no adaptor registered for {channel_type:?}"
            );
        }
    }

    #[test]
    fn builtin_mode_coverage() {
        let registry = AdaptorRegistry::builtin();
        assert!(registry.any_supports(Mode::ChatCompletions));
        assert!(registry.any_supports(Mode::Embeddings));
        assert!(registry.any_supports(Mode::AnthropicMessages));
        assert!(registry.any_supports(Mode::GeminiGenerate));
    }

    #[test]
    fn type_metas_are_sorted_and_complete() {
        let registry = AdaptorRegistry::builtin();
        let metas = registry.type_metas();
        assert_eq!(metas.len(), ChannelType::ALL.len());
        for window in metas.windows(2) {
            assert!(window[0].channel_type.as_i64() < window[1].channel_type.as_i64());
        }
        for meta in &metas {
            assert!(meta.default_base_url.starts_with("https://"));
        }
    }
}
