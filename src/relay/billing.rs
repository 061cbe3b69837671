//! Usage accounting: cost computation, quota debit and the single log row
//! every request produces.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::cache::CacheLayer;
use crate::db::Store;
use crate::error::{ErrorKind, RelayError};
use crate::model::{LogStatus, ModelConfig, RequestLog, Usage};
use crate::relay::meta::RequestMeta;
use crate::relay::mode::Mode;

/// Cost of one request at the model's configured rates.
pub fn compute_cost(config: &ModelConfig, usage: &Usage) -> Decimal {
    config.input_price * Decimal::from(usage.input_tokens)
        + config.output_price * Decimal::from(usage.output_tokens)
        + config.per_request_price
}

/// How the request ended. Error outcomes are zero-charge.
#[derive(Debug)]
pub enum Outcome {
    Success { usage: Usage },
    /// Client went away mid-stream. Partial usage is billed only when any
    /// output was actually flushed.
    ClientAborted { usage: Usage },
    Error { error: RelayError },
}

/// Everything settlement needs, detached from the request lifetime so the
/// streaming guard can finish the job after the response body is gone.
pub struct SettleContext {
    pub store: Store,
    pub cache: Arc<CacheLayer>,
    pub request_id: String,
    pub group_id: String,
    pub token_id: i64,
    pub token_key: String,
    pub token_name: String,
    pub channel_id: Option<i64>,
    pub model: String,
    pub mode: Mode,
    pub is_admin: bool,
    pub model_config: Option<Arc<ModelConfig>>,
    pub retry_count: u32,
    pub started_at: DateTime<Utc>,
    pub start: Instant,
}

impl SettleContext {
    pub fn from_meta(meta: &RequestMeta, store: Store, cache: Arc<CacheLayer>) -> Self {
        Self {
            store,
            cache,
            request_id: meta.request_id.clone(),
            group_id: meta.group.id.clone(),
            token_id: meta.token.id,
            token_key: meta.token.key.clone(),
            token_name: meta.token.name.clone(),
            channel_id: meta.channel.as_ref().map(|c| c.id),
            model: meta.origin_model.clone(),
            mode: meta.mode,
            is_admin: meta.is_admin,
            model_config: meta.model_config.clone(),
            retry_count: meta.attempts,
            started_at: meta.started_at,
            start: meta.start,
        }
    }
}

/// Record the request's terminal state: exactly one log row, plus the quota
/// debit on billable outcomes. Admin/internal callers are never debited.
/// Settlement never fails the request; store errors are logged and dropped.
pub async fn settle(ctx: SettleContext, outcome: Outcome) {
    let latency_ms = ctx.start.elapsed().as_millis() as i64;

    let (status, usage, error) = match outcome {
        Outcome::Success { usage } => (LogStatus::Success, usage, None),
        Outcome::ClientAborted { usage } => (LogStatus::ClientAborted, usage, None),
        Outcome::Error { error } => (LogStatus::Error, Usage::default(), Some(error)),
    };

    let billable = error.is_none()
        && !ctx.is_admin
        && !(status == LogStatus::ClientAborted && usage.output_tokens == 0);
    let cost = if billable {
        ctx.model_config
            .as_deref()
            .map(|config| compute_cost(config, &usage))
            .unwrap_or(Decimal::ZERO)
    } else {
        Decimal::ZERO
    };

    let log = RequestLog {
        request_id: ctx.request_id.clone(),
        timestamp: ctx.started_at,
        group_id: ctx.group_id.clone(),
        token_id: ctx.token_id,
        token_name: ctx.token_name.clone(),
        channel_id: ctx.channel_id,
        model: ctx.model.clone(),
        mode: ctx.mode,
        usage,
        cost,
        latency_ms,
        status,
        error_kind: error.as_ref().map(|e| e.kind.as_str().to_string()),
        error_message: error.as_ref().map(|e| e.message.clone()),
        retry_count: ctx.retry_count,
    };

    if let Err(err) = ctx.store.insert_log(&log).await {
        tracing::error!(
            request_id = %ctx.request_id,
            error = %err,
            "failed to append request log"
        );
    }

    if cost > Decimal::ZERO {
        match ctx.store.debit_quota(ctx.token_id, cost).await {
            Ok(remaining) => {
                tracing::debug!(
                    request_id = %ctx.request_id,
                    token_id = ctx.token_id,
                    %cost,
                    %remaining,
                    "quota debited"
                );
            }
            Err(err) => {
                tracing::error!(
                    request_id = %ctx.request_id,
                    token_id = ctx.token_id,
                    error = %err,
                    "quota debit failed"
                );
            }
        }
        // The cached snapshot no longer reflects the balance.
        ctx.cache.invalidate_token(&ctx.token_key);
    }
}

/// Pre-dispatch admission: would the estimated input cost overdraw the
/// token's remaining quota?
pub fn admission_check(
    config: &ModelConfig,
    quota: Decimal,
    estimated_input_tokens: u64,
) -> Result<(), RelayError> {
    let estimated_cost =
        config.input_price * Decimal::from(estimated_input_tokens) + config.per_request_price;
    if estimated_cost > Decimal::ZERO && quota < estimated_cost {
        return Err(RelayError::new(
            ErrorKind::QuotaExhausted,
            format!(
                "token quota {quota} cannot cover the estimated request cost {estimated_cost}"
            ),
        ));
    }
    Ok(())
}
