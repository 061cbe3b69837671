//! Pre-dispatch input-token estimation.
//!
//! Used only for quota admission, never billed. Chat counts are a tokenizer
//! approximation (~4 bytes per token plus per-message framing overhead);
//! TTS counts UTF-8 runes of `input`; embeddings sum their inputs.

use serde_json::Value;

use crate::relay::mode::Mode;

/// Framing overhead per chat message, mirroring the usual BPE accounting.
const TOKENS_PER_MESSAGE: u64 = 4;
const BYTES_PER_TOKEN: u64 = 4;

/// Estimate the input tokens of a parsed request body for admission.
/// Modes without a meaningful text payload return zero.
pub fn estimate_input_tokens(mode: Mode, body: &Value) -> u64 {
    match mode {
        Mode::ChatCompletions | Mode::Responses | Mode::AnthropicMessages => {
            chat_tokens(body)
        }
        Mode::GeminiGenerate => gemini_tokens(body),
        Mode::Completions => text_tokens(body.get("prompt")),
        Mode::AudioSpeech => body
            .get("input")
            .and_then(Value::as_str)
            .map(|s| s.chars().count() as u64)
            .unwrap_or(0),
        Mode::Embeddings | Mode::Rerank => embeddings_tokens(body),
        _ => 0,
    }
}

fn approx_tokens(text: &str) -> u64 {
    (text.len() as u64).div_ceil(BYTES_PER_TOKEN).max(1)
}

fn text_tokens(value: Option<&Value>) -> u64 {
    match value {
        Some(Value::String(s)) => approx_tokens(s),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(approx_tokens)
            .sum(),
        _ => 0,
    }
}

fn chat_tokens(body: &Value) -> u64 {
    let Some(messages) = body.get("messages").and_then(Value::as_array) else {
        return 0;
    };

    messages
        .iter()
        .map(|message| TOKENS_PER_MESSAGE + content_tokens(message.get("content")))
        .sum()
}

/// Chat content may be a string or a list of typed parts.
fn content_tokens(content: Option<&Value>) -> u64 {
    match content {
        Some(Value::String(s)) => approx_tokens(s),
        Some(Value::Array(parts)) => parts
            .iter()
            .map(|part| match part.get("text").and_then(Value::as_str) {
                Some(text) => approx_tokens(text),
                // Non-text parts (images, audio) get a flat charge.
                None => 85,
            })
            .sum(),
        _ => 0,
    }
}

fn gemini_tokens(body: &Value) -> u64 {
    let Some(contents) = body.get("contents").and_then(Value::as_array) else {
        return 0;
    };

    contents
        .iter()
        .map(|content| {
            let parts = content
                .get("parts")
                .and_then(Value::as_array)
                .map(|parts| {
                    parts
                        .iter()
                        .filter_map(|p| p.get("text").and_then(Value::as_str))
                        .map(approx_tokens)
                        .sum()
                })
                .unwrap_or(0);
            TOKENS_PER_MESSAGE + parts
        })
        .sum()
}

fn embeddings_tokens(body: &Value) -> u64 {
    let input = body.get("input").or_else(|| body.get("documents"));
    let from_input = text_tokens(input);
    let from_query = text_tokens(body.get("query"));
    from_input + from_query
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chat_counts_messages_and_content() {
        let body = json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hi"},
            ]
        });
        let estimate = estimate_input_tokens(Mode::ChatCompletions, &body);
        // 2 * framing + ceil(8/4) + ceil(2/4)
        assert_eq!(estimate, 8 + 2 + 1);
    }

    #[test]
    fn chat_multipart_content() {
        let body = json!({
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "what is this"},
                {"type": "image_url", "image_url": {"url": "data:..."}},
            ]}]
        });
        let estimate = estimate_input_tokens(Mode::ChatCompletions, &body);
        assert_eq!(estimate, 4 + 3 + 85);
    }

    #[test]
    fn tts_counts_runes_not_bytes() {
        let body = json!({"input": "héllo", "voice": "alloy"});
        assert_eq!(estimate_input_tokens(Mode::AudioSpeech, &body), 5);
    }

    #[test]
    fn embeddings_sum_inputs() {
        let body = json!({"input": ["abcd", "efgh"]});
        assert_eq!(estimate_input_tokens(Mode::Embeddings, &body), 2);

        let rerank = json!({"query": "abcd", "documents": ["efgh", "ijkl"]});
        assert_eq!(estimate_input_tokens(Mode::Rerank, &rerank), 3);
    }

    #[test]
    fn unknown_payload_estimates_zero() {
        assert_eq!(
            estimate_input_tokens(Mode::ImagesGenerations, &json!({"prompt": "a cat"})),
            0
        );
        assert_eq!(estimate_input_tokens(Mode::ChatCompletions, &json!({})), 0);
    }

    #[test]
    fn gemini_contents_counted() {
        let body = json!({"contents": [{"parts": [{"text": "hello there"}]}]});
        assert_eq!(estimate_input_tokens(Mode::GeminiGenerate, &body), 4 + 3);
    }
}
