//! The OpenAI-shaped provider family.
//!
//! These providers speak the OpenAI wire protocol; each adaptor holds the
//! shared [`OpenAiAdaptor`] and overrides its base URL, and where needed the
//! error handler (xAI, Qianfan) or response hook (Qianfan reports some
//! errors inside a 200 body).

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{ErrorKind, RelayError};
use crate::model::{Channel, ChannelType};
use crate::relay::meta::RequestMeta;
use crate::relay::mode::Mode;

use super::openai::{self, OpenAiAdaptor};
use super::{Adaptor, AdaptorMetadata, ConvertedRequest, RelayPayload};

/// A provider that differs from OpenAI only in name, base URL and key help.
pub struct CompatAdaptor {
    inner: OpenAiAdaptor,
    name: &'static str,
    base_url: &'static str,
    key_help: &'static str,
}

impl CompatAdaptor {
    pub fn new(name: &'static str, base_url: &'static str, key_help: &'static str) -> Self {
        Self {
            inner: OpenAiAdaptor,
            name,
            base_url,
            key_help,
        }
    }
}

#[async_trait]
impl Adaptor for CompatAdaptor {
    fn name(&self) -> &'static str {
        self.name
    }

    fn default_base_url(&self) -> &'static str {
        self.base_url
    }

    fn supports_mode(&self, mode: Mode) -> bool {
        self.inner.supports_mode(mode)
    }

    fn convert_request(
        &self,
        meta: &RequestMeta,
        channel: &Channel,
        body: &[u8],
    ) -> Result<ConvertedRequest, RelayError> {
        self.inner.convert_with_base(self.base_url, meta, channel, body)
    }

    async fn do_response(
        &self,
        meta: &RequestMeta,
        resp: reqwest::Response,
    ) -> Result<RelayPayload, RelayError> {
        openai::openai_response(meta, resp).await
    }

    fn metadata(&self) -> AdaptorMetadata {
        AdaptorMetadata {
            readme: "OpenAI-compatible endpoint",
            key_help: self.key_help,
            models: vec![],
        }
    }
}

/// xAI keeps the OpenAI shape but reports errors as `{code, error}`.
#[derive(Default)]
pub struct XaiAdaptor {
    inner: OpenAiAdaptor,
}

const XAI_BASE_URL: &str = "https://api.x.ai/v1";

#[async_trait]
impl Adaptor for XaiAdaptor {
    fn name(&self) -> &'static str {
        "xai"
    }

    fn default_base_url(&self) -> &'static str {
        XAI_BASE_URL
    }

    fn supports_mode(&self, mode: Mode) -> bool {
        matches!(mode, Mode::ChatCompletions | Mode::Completions)
    }

    fn convert_request(
        &self,
        meta: &RequestMeta,
        channel: &Channel,
        body: &[u8],
    ) -> Result<ConvertedRequest, RelayError> {
        self.inner.convert_with_base(XAI_BASE_URL, meta, channel, body)
    }

    async fn do_response(
        &self,
        meta: &RequestMeta,
        resp: reqwest::Response,
    ) -> Result<RelayPayload, RelayError> {
        openai::openai_response(meta, resp).await
    }

    fn handle_error(&self, status: u16, body: &[u8]) -> RelayError {
        if let Ok(value) = serde_json::from_slice::<Value>(body) {
            if let Some(message) = value.get("error").and_then(Value::as_str) {
                let code = value.get("code").and_then(Value::as_str).unwrap_or_default();
                return RelayError::new(
                    openai::kind_for_status(status),
                    message.to_string(),
                )
                .with_status(status)
                .with_param(code.to_string())
                .with_upstream_body(String::from_utf8_lossy(body).into_owned());
            }
        }
        openai::parse_upstream_error(status, body)
    }

    fn metadata(&self) -> AdaptorMetadata {
        AdaptorMetadata {
            readme: "https://docs.x.ai",
            key_help: "xai-...",
            models: vec!["grok-3", "grok-3-mini"],
        }
    }
}

/// Qianfan speaks OpenAI but flags safety rejections with
/// `code=system_unsafe`, sometimes inside a 200 response.
#[derive(Default)]
pub struct QianfanAdaptor {
    inner: OpenAiAdaptor,
}

const QIANFAN_BASE_URL: &str = "https://qianfan.baidubce.com/v2";

fn qianfan_unsafe(code: Option<&str>, wire_type: Option<&str>) -> bool {
    code == Some("system_unsafe") || wire_type == Some("unsafe_request")
}

#[async_trait]
impl Adaptor for QianfanAdaptor {
    fn name(&self) -> &'static str {
        "qianfan"
    }

    fn default_base_url(&self) -> &'static str {
        QIANFAN_BASE_URL
    }

    fn supports_mode(&self, mode: Mode) -> bool {
        matches!(
            mode,
            Mode::ChatCompletions | Mode::Completions | Mode::Embeddings
        )
    }

    fn convert_request(
        &self,
        meta: &RequestMeta,
        channel: &Channel,
        body: &[u8],
    ) -> Result<ConvertedRequest, RelayError> {
        self.inner
            .convert_with_base(QIANFAN_BASE_URL, meta, channel, body)
    }

    async fn do_response(
        &self,
        meta: &RequestMeta,
        resp: reqwest::Response,
    ) -> Result<RelayPayload, RelayError> {
        // Safety rejections can hide in a 200 JSON body; sniff before
        // forwarding.
        if !openai::is_event_stream(&resp) {
            let status = resp.status().as_u16();
            let content_type = openai::response_content_type(&resp);
            let body = resp.bytes().await.map_err(|e| {
                RelayError::new(
                    ErrorKind::UpstreamBadResponse,
                    format!("read upstream body: {e}"),
                )
            })?;

            if let Ok(value) = serde_json::from_slice::<Value>(&body) {
                let code = value.get("code").and_then(Value::as_str);
                let wire_type = value.pointer("/error/type").and_then(Value::as_str);
                if qianfan_unsafe(code, wire_type) {
                    return Err(self.handle_error(status, &body));
                }
            }
            return Ok(openai::json_payload(status, content_type, body));
        }

        openai::openai_response(meta, resp).await
    }

    fn handle_error(&self, status: u16, body: &[u8]) -> RelayError {
        let value = serde_json::from_slice::<Value>(body).ok();
        let code = value
            .as_ref()
            .and_then(|v| v.get("code").or_else(|| v.pointer("/error/code")))
            .and_then(Value::as_str)
            .map(str::to_string);
        let wire_type = value
            .as_ref()
            .and_then(|v| v.pointer("/error/type"))
            .and_then(Value::as_str)
            .map(str::to_string);

        if qianfan_unsafe(code.as_deref(), wire_type.as_deref()) {
            let message = value
                .as_ref()
                .and_then(|v| v.get("message").or_else(|| v.pointer("/error/message")))
                .and_then(Value::as_str)
                .unwrap_or("request was rejected by the content safety system");
            return RelayError::new(ErrorKind::UnsafeContent, message.to_string())
                .with_status(400)
                .with_upstream_body(String::from_utf8_lossy(body).into_owned());
        }

        openai::parse_upstream_error(status, body)
    }

    fn metadata(&self) -> AdaptorMetadata {
        AdaptorMetadata {
            readme: "https://cloud.baidu.com/doc/qianfan",
            key_help: "bce-v3/...",
            models: vec!["ernie-4.0-8k"],
        }
    }
}

/// OpenRouter: OpenAI shape; the shared error parser already unwraps its
/// `metadata.raw` indirection.
pub fn openrouter() -> CompatAdaptor {
    CompatAdaptor::new("openrouter", "https://openrouter.ai/api/v1", "sk-or-...")
}

/// All OpenAI-shaped providers keyed by channel type.
pub fn openai_shaped_adaptors() -> Vec<(ChannelType, Arc<dyn Adaptor>)> {
    vec![
        (
            ChannelType::GeminiOpenAi,
            Arc::new(CompatAdaptor::new(
                "gemini_openai",
                "https://generativelanguage.googleapis.com/v1beta/openai",
                "AIza...",
            )),
        ),
        (ChannelType::XAi, Arc::new(XaiAdaptor::default())),
        (
            ChannelType::Groq,
            Arc::new(CompatAdaptor::new(
                "groq",
                "https://api.groq.com/openai/v1",
                "gsk_...",
            )),
        ),
        (
            ChannelType::DeepSeek,
            Arc::new(CompatAdaptor::new(
                "deepseek",
                "https://api.deepseek.com/v1",
                "sk-...",
            )),
        ),
        (
            ChannelType::Moonshot,
            Arc::new(CompatAdaptor::new(
                "moonshot",
                "https://api.moonshot.cn/v1",
                "sk-...",
            )),
        ),
        (
            ChannelType::Mistral,
            Arc::new(CompatAdaptor::new(
                "mistral",
                "https://api.mistral.ai/v1",
                "api key",
            )),
        ),
        (
            ChannelType::Zhipu,
            Arc::new(CompatAdaptor::new(
                "zhipu",
                "https://open.bigmodel.cn/api/paas/v4",
                "id.secret",
            )),
        ),
        (
            ChannelType::Lingyiwanwu,
            Arc::new(CompatAdaptor::new(
                "lingyiwanwu",
                "https://api.lingyiwanwu.com/v1",
                "api key",
            )),
        ),
        (
            ChannelType::Ai360,
            Arc::new(CompatAdaptor::new("ai360", "https://ai.360.cn/v1", "api key")),
        ),
        (
            ChannelType::Tencent,
            Arc::new(CompatAdaptor::new(
                "tencent",
                "https://api.hunyuan.cloud.tencent.com/v1",
                "api key",
            )),
        ),
        (
            ChannelType::Xunfei,
            Arc::new(CompatAdaptor::new(
                "xunfei",
                "https://spark-api-open.xf-yun.com/v1",
                "app_id|app_token",
            )),
        ),
        (ChannelType::OpenRouter, Arc::new(openrouter())),
        (ChannelType::Qianfan, Arc::new(QianfanAdaptor::default())),
    ]
}
