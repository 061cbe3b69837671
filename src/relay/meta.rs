//! Per-request mutable state threaded through the relay pipeline.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::{Channel, Group, ModelConfig, Token, Usage};
use crate::relay::mode::Mode;

/// Request-scoped bag: created at request entry, destroyed on response
/// completion, never shared across requests. Replaces global state and
/// carries everything billing needs at settle time.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub request_id: String,
    pub mode: Mode,
    /// Model name exactly as the client requested it.
    pub origin_model: String,
    /// Public model name after the group's mapping.
    pub actual_model: String,
    /// Upstream model name after the chosen channel's mapping. Tracks
    /// `actual_model` until a channel is selected.
    pub upstream_model: String,
    pub token: Arc<Token>,
    pub group: Arc<Group>,
    pub channel: Option<Arc<Channel>>,
    pub model_config: Option<Arc<ModelConfig>>,
    /// Admin/internal callers skip quota accounting.
    pub is_admin: bool,
    /// Whether the client negotiated a streaming response.
    pub stream: bool,
    /// Content-Type of the incoming request, for passthrough modes.
    pub request_content_type: Option<String>,
    /// Usage accumulated during translation.
    pub usage: Usage,
    /// Dispatch attempts so far (0 on the first).
    pub attempts: u32,
    pub start: Instant,
    pub started_at: DateTime<Utc>,
}

impl RequestMeta {
    pub fn new(mode: Mode, token: Arc<Token>, group: Arc<Group>, is_admin: bool) -> Self {
        Self {
            request_id: Uuid::new_v4().simple().to_string(),
            mode,
            origin_model: String::new(),
            actual_model: String::new(),
            upstream_model: String::new(),
            token,
            group,
            channel: None,
            model_config: None,
            is_admin,
            stream: false,
            request_content_type: None,
            usage: Usage::default(),
            attempts: 0,
            start: Instant::now(),
            started_at: Utc::now(),
        }
    }

    /// Bind the chosen channel and resolve the upstream model name through
    /// its alias map.
    pub fn set_channel(&mut self, channel: Arc<Channel>) {
        self.upstream_model = channel.upstream_model(&self.actual_model).to_string();
        self.channel = Some(channel);
    }
}
