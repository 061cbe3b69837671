//! Inference endpoint kinds.

use serde::{Deserialize, Serialize};

/// The kind of inference endpoint a request targets. Each mode maps to one
/// canonical client-facing path and to one upstream path shape per adaptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    ChatCompletions,
    Completions,
    Embeddings,
    Rerank,
    AudioSpeech,
    AudioTranscription,
    ImagesGenerations,
    VideoGenerations,
    Responses,
    ParsePdf,
    /// Anthropic-native `/v1/messages`.
    AnthropicMessages,
    /// Gemini-native `/v1beta/models/{model}:generateContent`.
    GeminiGenerate,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChatCompletions => "chat_completions",
            Self::Completions => "completions",
            Self::Embeddings => "embeddings",
            Self::Rerank => "rerank",
            Self::AudioSpeech => "audio_speech",
            Self::AudioTranscription => "audio_transcription",
            Self::ImagesGenerations => "images_generations",
            Self::VideoGenerations => "video_generations",
            Self::Responses => "responses",
            Self::ParsePdf => "parse_pdf",
            Self::AnthropicMessages => "anthropic_messages",
            Self::GeminiGenerate => "gemini_generate",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        Some(match s {
            "chat_completions" => Self::ChatCompletions,
            "completions" => Self::Completions,
            "embeddings" => Self::Embeddings,
            "rerank" => Self::Rerank,
            "audio_speech" => Self::AudioSpeech,
            "audio_transcription" => Self::AudioTranscription,
            "images_generations" => Self::ImagesGenerations,
            "video_generations" => Self::VideoGenerations,
            "responses" => Self::Responses,
            "parse_pdf" => Self::ParsePdf,
            "anthropic_messages" => Self::AnthropicMessages,
            "gemini_generate" => Self::GeminiGenerate,
            _ => return None,
        })
    }

    /// Whether a model catalogued under `catalog` may serve a request in
    /// this mode. The Anthropic/Gemini native modes and the Responses API
    /// ride on chat-mode models.
    pub fn accepts_catalog_mode(self, catalog: Mode) -> bool {
        if self == catalog {
            return true;
        }
        matches!(
            self,
            Self::AnthropicMessages | Self::GeminiGenerate | Self::Responses
        ) && catalog == Self::ChatCompletions
    }

    /// Whether request/response bodies in this mode are JSON the gateway may
    /// parse. Audio transcription is multipart and passed through opaque.
    pub fn has_json_body(self) -> bool {
        !matches!(self, Self::AudioTranscription)
    }

    /// Media generation runs far longer than chat.
    pub fn is_long_running(self) -> bool {
        matches!(self, Self::ImagesGenerations | Self::VideoGenerations)
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn str_roundtrip() {
        for mode in [
            Mode::ChatCompletions,
            Mode::Completions,
            Mode::Embeddings,
            Mode::Rerank,
            Mode::AudioSpeech,
            Mode::AudioTranscription,
            Mode::ImagesGenerations,
            Mode::VideoGenerations,
            Mode::Responses,
            Mode::ParsePdf,
            Mode::AnthropicMessages,
            Mode::GeminiGenerate,
        ] {
            assert_eq!(Mode::from_str_opt(mode.as_str()), Some(mode));
        }
        assert_eq!(Mode::from_str_opt("bogus"), None);
    }

    #[test]
    fn native_modes_accept_chat_catalog() {
        assert!(Mode::AnthropicMessages.accepts_catalog_mode(Mode::ChatCompletions));
        assert!(Mode::GeminiGenerate.accepts_catalog_mode(Mode::ChatCompletions));
        assert!(Mode::Responses.accepts_catalog_mode(Mode::ChatCompletions));
        assert!(!Mode::Embeddings.accepts_catalog_mode(Mode::ChatCompletions));
        assert!(Mode::Embeddings.accepts_catalog_mode(Mode::Embeddings));
    }
}
