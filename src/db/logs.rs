//! Request log persistence. Logs are the source of truth for dashboards.

use libsql::params;

use crate::error::StoreError;
use crate::model::{LogStatus, RequestLog, Usage};
use crate::relay::mode::Mode;

use super::{
    Store, fmt_ts, from_json_text, get_decimal, get_i64, get_opt_i64, get_opt_text, get_text,
    get_ts, to_json_text,
};

const LOG_COLUMNS: &str = "request_id, timestamp, group_id, token_id, token_name, channel_id, \
     model, mode, usage, cost, latency_ms, status, error_kind, error_message, retry_count";

fn row_to_log(row: &libsql::Row) -> RequestLog {
    let usage: Usage = from_json_text(&get_text(row, 8));
    RequestLog {
        request_id: get_text(row, 0),
        timestamp: get_ts(row, 1),
        group_id: get_text(row, 2),
        token_id: get_i64(row, 3),
        token_name: get_text(row, 4),
        channel_id: get_opt_i64(row, 5),
        model: get_text(row, 6),
        mode: Mode::from_str_opt(&get_text(row, 7)).unwrap_or(Mode::ChatCompletions),
        usage,
        cost: get_decimal(row, 9),
        latency_ms: get_i64(row, 10),
        status: LogStatus::from_str_lossy(&get_text(row, 11)),
        error_kind: get_opt_text(row, 12),
        error_message: get_opt_text(row, 13),
        retry_count: get_i64(row, 14).max(0) as u32,
    }
}

impl Store {
    pub async fn insert_log(&self, log: &RequestLog) -> Result<(), StoreError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO logs ({LOG_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
                ),
                params![
                    log.request_id.as_str(),
                    fmt_ts(log.timestamp),
                    log.group_id.as_str(),
                    log.token_id,
                    log.token_name.as_str(),
                    log.channel_id,
                    log.model.as_str(),
                    log.mode.as_str(),
                    to_json_text(&log.usage)?,
                    log.cost.to_string(),
                    log.latency_ms,
                    log.status.as_str(),
                    log.error_kind.as_deref(),
                    log.error_message.as_deref(),
                    log.retry_count as i64,
                ],
            )
            .await?;
        Ok(())
    }

    /// Most recent logs first, optionally filtered to one group.
    pub async fn list_logs(
        &self,
        group: Option<&str>,
        limit: u32,
    ) -> Result<Vec<RequestLog>, StoreError> {
        let mut rows = match group {
            Some(group) => {
                self.conn()
                    .query(
                        &format!(
                            "SELECT {LOG_COLUMNS} FROM logs WHERE group_id = ?1 \
                             ORDER BY id DESC LIMIT ?2"
                        ),
                        params![group, limit as i64],
                    )
                    .await?
            }
            None => {
                self.conn()
                    .query(
                        &format!("SELECT {LOG_COLUMNS} FROM logs ORDER BY id DESC LIMIT ?1"),
                        params![limit as i64],
                    )
                    .await?
            }
        };

        let mut logs = Vec::new();
        while let Some(row) = rows.next().await? {
            logs.push(row_to_log(&row));
        }
        Ok(logs)
    }

    pub async fn count_logs_for_request(&self, request_id: &str) -> Result<u32, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM logs WHERE request_id = ?1",
                params![request_id],
            )
            .await?;
        let row = rows
            .next()
            .await?
            .ok_or_else(|| StoreError::Serialization("count returned no row".into()))?;
        Ok(get_i64(&row, 0).max(0) as u32)
    }
}
