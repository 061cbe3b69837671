//! Jina adaptor: embeddings and rerank over the OpenAI shape, with Jina's
//! FastAPI-style `detail` error format.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::RelayError;
use crate::model::Channel;
use crate::relay::meta::RequestMeta;
use crate::relay::mode::Mode;

use super::openai::{self, OpenAiAdaptor};
use super::{Adaptor, AdaptorMetadata, ConvertedRequest, RelayPayload};

const BASE_URL: &str = "https://api.jina.ai/v1";

#[derive(Default)]
pub struct JinaAdaptor {
    inner: OpenAiAdaptor,
}

#[async_trait]
impl Adaptor for JinaAdaptor {
    fn name(&self) -> &'static str {
        "jina"
    }

    fn default_base_url(&self) -> &'static str {
        BASE_URL
    }

    fn supports_mode(&self, mode: Mode) -> bool {
        matches!(mode, Mode::Embeddings | Mode::Rerank)
    }

    fn convert_request(
        &self,
        meta: &RequestMeta,
        channel: &Channel,
        body: &[u8],
    ) -> Result<ConvertedRequest, RelayError> {
        self.inner.convert_with_base(BASE_URL, meta, channel, body)
    }

    async fn do_response(
        &self,
        meta: &RequestMeta,
        resp: reqwest::Response,
    ) -> Result<RelayPayload, RelayError> {
        openai::openai_response(meta, resp).await
    }

    /// Jina reports errors as `{"detail": ...}` where detail is either a
    /// string or a list of `{loc, msg, type}` entries.
    fn handle_error(&self, status: u16, body: &[u8]) -> RelayError {
        let raw = String::from_utf8_lossy(body).into_owned();
        if let Ok(value) = serde_json::from_slice::<Value>(body) {
            if let Some(detail) = value.get("detail") {
                let (message, wire_type) = match detail {
                    Value::String(s) => (s.clone(), None),
                    Value::Array(items) => {
                        let first = items.first();
                        let message = first
                            .and_then(|d| d.get("msg"))
                            .and_then(Value::as_str)
                            .unwrap_or("unknown error")
                            .to_string();
                        let wire_type = first
                            .and_then(|d| d.get("type"))
                            .and_then(Value::as_str)
                            .map(str::to_string);
                        (message, wire_type)
                    }
                    _ => ("unknown error".to_string(), None),
                };
                let mut err = RelayError::new(openai::kind_for_status(status), message)
                    .with_status(status)
                    .with_upstream_body(raw);
                if let Some(t) = wire_type {
                    err = err.with_wire_type(t);
                }
                return err;
            }
        }
        openai::parse_upstream_error(status, body)
    }

    fn metadata(&self) -> AdaptorMetadata {
        AdaptorMetadata {
            readme: "https://jina.ai/embeddings",
            key_help: "jina_...",
            models: vec!["jina-embeddings-v3", "jina-reranker-v2-base-multilingual"],
        }
    }
}
