//! Server-sent-event plumbing for streamed upstream responses.
//!
//! Upstream bodies are split into frames by `eventsource-stream`; each frame
//! runs through a push-style translator which may emit one downstream frame.
//! Memory stays O(1) per request: nothing buffers the whole stream.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use futures::stream::BoxStream;

use crate::error::{ErrorKind, RelayError};
use crate::model::Usage;

/// Accumulated result of a streamed response, shared between the running
/// stream and the billing guard that settles when the stream ends.
#[derive(Debug, Default)]
pub struct StreamOutcome {
    pub usage: Usage,
    /// Bytes of generated content seen, for the token fallback when the
    /// upstream never reports usage.
    pub content_len: u64,
    /// Whether the terminal frame (`[DONE]`, `message_stop`, a finish
    /// reason) was observed. Unset on client abort.
    pub done_seen: bool,
}

impl StreamOutcome {
    /// Definitive usage: upstream-reported counts, or a content-length
    /// estimate when the final chunk carried none.
    pub fn final_usage(&self) -> Usage {
        let mut usage = self.usage;
        if usage.output_tokens == 0 && self.content_len > 0 {
            usage.output_tokens = (self.content_len / 4).max(1);
        }
        usage
    }
}

pub type SharedOutcome = Arc<Mutex<StreamOutcome>>;

/// Translates one upstream `data:` payload into at most one downstream
/// payload. Implementations harvest usage into the outcome as they go.
pub trait FrameTranslator: Send + 'static {
    fn on_frame(&mut self, data: &str, outcome: &mut StreamOutcome) -> Option<String>;
}

/// Wrap an upstream SSE response into a downstream byte stream, pushing
/// every frame through `translator`. Each emitted payload becomes exactly
/// one `data:` frame, in order.
pub fn translate_sse<T: FrameTranslator>(
    resp: reqwest::Response,
    outcome: SharedOutcome,
    mut translator: T,
) -> BoxStream<'static, Result<Bytes, RelayError>> {
    let shared = outcome;
    resp.bytes_stream()
        .eventsource()
        .filter_map(move |event| {
            let item = match event {
                Ok(event) => {
                    let mut guard = shared.lock().unwrap_or_else(|e| e.into_inner());
                    translator
                        .on_frame(&event.data, &mut guard)
                        .map(|payload| Ok(frame_bytes(&payload)))
                }
                Err(err) => {
                    tracing::warn!(error = %err, "upstream stream ended abnormally");
                    Some(Err(RelayError::new(
                        ErrorKind::UpstreamBadResponse,
                        format!("upstream stream error: {err}"),
                    )))
                }
            };
            futures::future::ready(item)
        })
        .boxed()
}

/// Render one downstream SSE frame.
pub fn frame_bytes(payload: &str) -> Bytes {
    Bytes::from(format!("data: {payload}\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper;

    impl FrameTranslator for Upper {
        fn on_frame(&mut self, data: &str, outcome: &mut StreamOutcome) -> Option<String> {
            if data == "[DONE]" {
                outcome.done_seen = true;
                return Some(data.to_string());
            }
            outcome.content_len += data.len() as u64;
            Some(data.to_uppercase())
        }
    }

    #[test]
    fn frame_rendering() {
        assert_eq!(frame_bytes("[DONE]").as_ref(), b"data: [DONE]\n\n");
    }

    #[test]
    fn final_usage_falls_back_to_content_length() {
        let outcome = StreamOutcome {
            content_len: 40,
            ..Default::default()
        };
        assert_eq!(outcome.final_usage().output_tokens, 10);

        let reported = StreamOutcome {
            usage: Usage {
                output_tokens: 7,
                ..Usage::default()
            },
            content_len: 40,
            ..Default::default()
        };
        assert_eq!(reported.final_usage().output_tokens, 7);

        let empty = StreamOutcome::default();
        assert_eq!(empty.final_usage().output_tokens, 0);
    }

    #[test]
    fn translator_state_accumulates() {
        let mut outcome = StreamOutcome::default();
        let mut translator = Upper;
        assert_eq!(
            translator.on_frame("hi", &mut outcome),
            Some("HI".to_string())
        );
        assert_eq!(
            translator.on_frame("[DONE]", &mut outcome),
            Some("[DONE]".to_string())
        );
        assert!(outcome.done_seen);
        assert_eq!(outcome.content_len, 2);
    }
}
