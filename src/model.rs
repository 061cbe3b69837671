//! Domain types shared by the store, caches and the relay pipeline.
//!
//! These are in-memory snapshots: the cache layer owns them, consumers get
//! `Arc` copies. Durable rows live in SQLite and are reloaded on
//! invalidation.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::relay::mode::Mode;

/// Token lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    Enabled,
    Disabled,
    Exhausted,
}

impl TokenStatus {
    pub fn from_i64(v: i64) -> Self {
        match v {
            2 => Self::Disabled,
            3 => Self::Exhausted,
            _ => Self::Enabled,
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            Self::Enabled => 1,
            Self::Disabled => 2,
            Self::Exhausted => 3,
        }
    }
}

/// Group lifecycle status. `Internal` groups bypass quota accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Enabled,
    Disabled,
    Internal,
}

impl GroupStatus {
    pub fn from_i64(v: i64) -> Self {
        match v {
            2 => Self::Disabled,
            3 => Self::Internal,
            _ => Self::Enabled,
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            Self::Enabled => 1,
            Self::Disabled => 2,
            Self::Internal => 3,
        }
    }
}

/// Channel lifecycle status. `AutoDisabled` is set by the health monitor
/// when the rolling error rate crosses the ban threshold repeatedly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Enabled,
    AutoDisabled,
    Disabled,
}

impl ChannelStatus {
    pub fn from_i64(v: i64) -> Self {
        match v {
            2 => Self::AutoDisabled,
            3 => Self::Disabled,
            _ => Self::Enabled,
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            Self::Enabled => 1,
            Self::AutoDisabled => 2,
            Self::Disabled => 3,
        }
    }
}

/// Caller classification. Admins skip subnet and quota checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserType {
    Admin,
    Regular,
}

impl UserType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Regular => "regular",
        }
    }

    pub fn from_str_or_regular(s: &str) -> Self {
        match s {
            "admin" => Self::Admin,
            _ => Self::Regular,
        }
    }
}

/// Supported upstream provider kinds. Every enabled channel declares exactly
/// one; the adaptor registry maps each kind to its translator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    OpenAi,
    Anthropic,
    Gemini,
    GeminiOpenAi,
    XAi,
    Groq,
    DeepSeek,
    Moonshot,
    Mistral,
    Zhipu,
    Lingyiwanwu,
    Ai360,
    Tencent,
    Xunfei,
    OpenRouter,
    Qianfan,
    Jina,
}

impl ChannelType {
    pub const ALL: &'static [ChannelType] = &[
        Self::OpenAi,
        Self::Anthropic,
        Self::Gemini,
        Self::GeminiOpenAi,
        Self::XAi,
        Self::Groq,
        Self::DeepSeek,
        Self::Moonshot,
        Self::Mistral,
        Self::Zhipu,
        Self::Lingyiwanwu,
        Self::Ai360,
        Self::Tencent,
        Self::Xunfei,
        Self::OpenRouter,
        Self::Qianfan,
        Self::Jina,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
            Self::GeminiOpenAi => "gemini_openai",
            Self::XAi => "xai",
            Self::Groq => "groq",
            Self::DeepSeek => "deepseek",
            Self::Moonshot => "moonshot",
            Self::Mistral => "mistral",
            Self::Zhipu => "zhipu",
            Self::Lingyiwanwu => "lingyiwanwu",
            Self::Ai360 => "ai360",
            Self::Tencent => "tencent",
            Self::Xunfei => "xunfei",
            Self::OpenRouter => "openrouter",
            Self::Qianfan => "qianfan",
            Self::Jina => "jina",
        }
    }

    /// Stable numeric code used in the channels table.
    pub fn as_i64(self) -> i64 {
        match self {
            Self::OpenAi => 1,
            Self::Anthropic => 2,
            Self::Gemini => 3,
            Self::GeminiOpenAi => 4,
            Self::XAi => 5,
            Self::Groq => 6,
            Self::DeepSeek => 7,
            Self::Moonshot => 8,
            Self::Mistral => 9,
            Self::Zhipu => 10,
            Self::Lingyiwanwu => 11,
            Self::Ai360 => 12,
            Self::Tencent => 13,
            Self::Xunfei => 14,
            Self::OpenRouter => 15,
            Self::Qianfan => 16,
            Self::Jina => 17,
        }
    }

    pub fn from_i64(v: i64) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_i64() == v)
    }
}

/// API key issued to a caller. Carries quota and group membership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub id: i64,
    /// Opaque key string, unique across non-deleted tokens.
    pub key: String,
    pub group_id: String,
    pub name: String,
    pub status: TokenStatus,
    /// Remaining quota in opaque currency units. Never negative.
    pub quota: Decimal,
    /// Client IP allowlist. Empty means unrestricted.
    #[serde(default)]
    pub subnets: Vec<IpNet>,
    pub user_type: UserType,
    /// True for tokens auto-created by login against the upstream balance
    /// endpoint; these participate in periodic balance sync.
    #[serde(default)]
    pub is_provisioned: bool,
    pub balance_last_sync: Option<DateTime<Utc>>,
    /// Per-model request/token rate overrides, keyed by model name.
    #[serde(default)]
    pub model_limits: HashMap<String, RateLimit>,
    pub created_at: DateTime<Utc>,
}

/// Requests-per-minute / tokens-per-minute pair.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RateLimit {
    #[serde(default)]
    pub rpm: Option<u64>,
    #[serde(default)]
    pub tpm: Option<u64>,
}

impl Token {
    /// Synthesized identity for the configured AdminKey / InternalToken.
    /// Not persisted; skips subnet and quota checks.
    pub fn internal(key: &str) -> Self {
        Self {
            id: 0,
            key: key.to_string(),
            group_id: String::new(),
            name: "internal".to_string(),
            status: TokenStatus::Enabled,
            quota: Decimal::ZERO,
            subnets: Vec::new(),
            user_type: UserType::Admin,
            is_provisioned: false,
            balance_last_sync: None,
            model_limits: HashMap::new(),
            created_at: Utc::now(),
        }
    }
}

/// Mask a token key for logging.
pub fn mask_key(key: &str) -> String {
    if key.len() <= 8 {
        "*****".to_string()
    } else {
        format!("{}*****{}", &key[..4], &key[key.len() - 4..])
    }
}

/// Billing and isolation unit owning one or more tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub status: GroupStatus,
    pub rpm_ratio: f64,
    pub tpm_ratio: f64,
    /// Named model-set buckets this group may use.
    pub available_sets: Vec<String>,
    /// Per-group model alias map, applied before the channel's own mapping.
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl Group {
    /// Synthesized group for admin/internal callers: every set is available.
    pub fn internal(all_sets: Vec<String>) -> Self {
        Self {
            id: String::new(),
            status: GroupStatus::Internal,
            rpm_ratio: 1.0,
            tpm_ratio: 1.0,
            available_sets: all_sets,
            model_mapping: HashMap::new(),
            created_at: Utc::now(),
        }
    }
}

/// One configured credential/endpoint of an upstream provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    pub channel_type: ChannelType,
    pub name: String,
    /// Provider credential. Masked everywhere it is rendered.
    pub key: String,
    /// Overrides the adaptor's default base URL when set.
    pub base_url: Option<String>,
    /// Higher priority partitions are preferred; lower ones are failover.
    pub priority: i32,
    /// Weighted-random share within a priority partition.
    pub weight: u32,
    pub status: ChannelStatus,
    /// Upstream models this channel can serve (post-mapping names are the
    /// values of `model_mapping`; `models` holds the public names).
    pub models: HashSet<String>,
    /// Per-channel alias map: public name -> upstream name.
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,
    /// Model-set buckets this channel contributes to.
    pub sets: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Channel {
    /// Resolve the upstream model name for a public model name.
    pub fn upstream_model<'a>(&'a self, model: &'a str) -> &'a str {
        self.model_mapping.get(model).map(String::as_str).unwrap_or(model)
    }

    pub fn is_enabled(&self) -> bool {
        self.status == ChannelStatus::Enabled
    }
}

/// Public catalog entry for a model name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Canonical, globally unique model name.
    pub model: String,
    pub mode: Mode,
    pub owner: String,
    /// Price per input token.
    pub input_price: Decimal,
    /// Price per output token.
    pub output_price: Decimal,
    /// Flat price per request.
    pub per_request_price: Decimal,
    pub rpm: Option<u64>,
    pub tpm: Option<u64>,
    pub max_input_tokens: Option<u64>,
}

/// Structured consumption counters for one request. Monotonic within the
/// request; merged from translation output and upstream usage blocks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
    pub reasoning_tokens: u64,
    pub image_count: u64,
    pub audio_seconds: u64,
}

impl Usage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Take the field-wise maximum; upstream usage blocks are cumulative so
    /// a later frame never reports less than an earlier one.
    pub fn absorb(&mut self, other: &Usage) {
        self.input_tokens = self.input_tokens.max(other.input_tokens);
        self.output_tokens = self.output_tokens.max(other.output_tokens);
        self.cached_tokens = self.cached_tokens.max(other.cached_tokens);
        self.reasoning_tokens = self.reasoning_tokens.max(other.reasoning_tokens);
        self.image_count = self.image_count.max(other.image_count);
        self.audio_seconds = self.audio_seconds.max(other.audio_seconds);
    }
}

/// Terminal request status recorded in the log row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Success,
    Error,
    ClientAborted,
}

impl LogStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::ClientAborted => "client_aborted",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "error" => Self::Error,
            "client_aborted" => Self::ClientAborted,
            _ => Self::Success,
        }
    }
}

/// One row in the logs table: the source of truth for dashboards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLog {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub group_id: String,
    pub token_id: i64,
    pub token_name: String,
    pub channel_id: Option<i64>,
    pub model: String,
    pub mode: Mode,
    pub usage: Usage,
    pub cost: Decimal,
    pub latency_ms: i64,
    pub status: LogStatus,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: u32,
}
