//! Token persistence, including the compare-and-set quota debit.

use chrono::Utc;
use libsql::params;
use rust_decimal::Decimal;

use crate::error::StoreError;
use crate::model::{RateLimit, Token, TokenStatus, UserType};

use super::{
    Store, fmt_ts, from_json_text, get_decimal, get_i64, get_opt_ts, get_text, to_json_text,
};

const TOKEN_COLUMNS: &str = "id, key, group_id, name, status, quota, subnets, model_limits, \
     user_type, balance_last_sync, is_provisioned, created_at";

fn row_to_token(row: &libsql::Row) -> Token {
    let subnets: Vec<String> = from_json_text(&get_text(row, 6));
    let model_limits: std::collections::HashMap<String, RateLimit> =
        from_json_text(&get_text(row, 7));

    Token {
        id: get_i64(row, 0),
        key: get_text(row, 1),
        group_id: get_text(row, 2),
        name: get_text(row, 3),
        status: TokenStatus::from_i64(get_i64(row, 4)),
        quota: get_decimal(row, 5),
        subnets: subnets.iter().filter_map(|s| s.parse().ok()).collect(),
        model_limits,
        user_type: UserType::from_str_or_regular(&get_text(row, 8)),
        balance_last_sync: get_opt_ts(row, 9),
        is_provisioned: get_i64(row, 10) != 0,
        created_at: super::get_ts(row, 11),
    }
}

impl Store {
    pub async fn get_token_by_key(&self, key: &str) -> Result<Token, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TOKEN_COLUMNS} FROM tokens WHERE key = ?1"),
                params![key],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(row_to_token(&row)),
            None => Err(StoreError::not_found("token", crate::model::mask_key(key))),
        }
    }

    pub async fn get_token_by_id(&self, id: i64) -> Result<Token, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TOKEN_COLUMNS} FROM tokens WHERE id = ?1"),
                params![id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(row_to_token(&row)),
            None => Err(StoreError::not_found("token", id)),
        }
    }

    /// Insert a token and return its id. Fails on duplicate key.
    pub async fn insert_token(&self, token: &Token) -> Result<i64, StoreError> {
        let subnets: Vec<String> = token.subnets.iter().map(|s| s.to_string()).collect();

        self.conn()
            .execute(
                "INSERT INTO tokens \
                 (key, group_id, name, status, quota, subnets, model_limits, \
                  user_type, balance_last_sync, is_provisioned, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    token.key.as_str(),
                    token.group_id.as_str(),
                    token.name.as_str(),
                    token.status.as_i64(),
                    token.quota.to_string(),
                    to_json_text(&subnets)?,
                    to_json_text(&token.model_limits)?,
                    token.user_type.as_str(),
                    token.balance_last_sync.map(fmt_ts),
                    token.is_provisioned as i64,
                    fmt_ts(token.created_at),
                ],
            )
            .await
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("UNIQUE") {
                    StoreError::Conflict(format!("token key already exists: {msg}"))
                } else {
                    StoreError::from(e)
                }
            })?;

        let mut rows = self.conn().query("SELECT last_insert_rowid()", ()).await?;
        let row = rows
            .next()
            .await?
            .ok_or_else(|| StoreError::Serialization("no rowid returned".into()))?;
        Ok(get_i64(&row, 0))
    }

    pub async fn update_token_status(&self, id: i64, status: TokenStatus) -> Result<(), StoreError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE tokens SET status = ?1 WHERE id = ?2",
                params![status.as_i64(), id],
            )
            .await?;
        if affected == 0 {
            return Err(StoreError::not_found("token", id));
        }
        Ok(())
    }

    /// Atomically subtract `amount` from the token's quota.
    ///
    /// Compare-and-set: the write only lands when the quota still equals the
    /// value we read, so concurrent debits against the same token are
    /// linearized. Returns the post-debit quota. Quota floors at zero and the
    /// token is marked exhausted when it reaches it.
    pub async fn debit_quota(&self, id: i64, amount: Decimal) -> Result<Decimal, StoreError> {
        const MAX_CAS_ATTEMPTS: u32 = 8;

        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.get_token_by_id(id).await?;
            let new_quota = (current.quota - amount).max(Decimal::ZERO);
            let new_status = if new_quota <= Decimal::ZERO {
                TokenStatus::Exhausted
            } else {
                current.status
            };

            let affected = self
                .conn()
                .execute(
                    "UPDATE tokens SET quota = ?1, status = ?2 WHERE id = ?3 AND quota = ?4",
                    params![
                        new_quota.to_string(),
                        new_status.as_i64(),
                        id,
                        current.quota.to_string(),
                    ],
                )
                .await?;

            if affected > 0 {
                return Ok(new_quota);
            }
            // Lost the race; reread and try again.
        }

        Err(StoreError::Conflict(format!(
            "quota debit for token {id} kept losing the compare-and-set race"
        )))
    }

    /// Overwrite quota from a balance sync and stamp the sync time.
    pub async fn set_token_balance(&self, id: i64, balance: Decimal) -> Result<(), StoreError> {
        let status_sql = if balance > Decimal::ZERO {
            TokenStatus::Enabled.as_i64()
        } else {
            TokenStatus::Exhausted.as_i64()
        };
        let affected = self
            .conn()
            .execute(
                "UPDATE tokens SET quota = ?1, balance_last_sync = ?2, \
                 status = CASE WHEN status = 2 THEN status ELSE ?3 END \
                 WHERE id = ?4",
                params![balance.to_string(), fmt_ts(Utc::now()), status_sql, id],
            )
            .await?;
        if affected == 0 {
            return Err(StoreError::not_found("token", id));
        }
        Ok(())
    }

    pub async fn list_tokens(&self, group: Option<&str>) -> Result<Vec<Token>, StoreError> {
        let mut rows = match group {
            Some(group) => {
                self.conn()
                    .query(
                        &format!(
                            "SELECT {TOKEN_COLUMNS} FROM tokens WHERE group_id = ?1 ORDER BY id"
                        ),
                        params![group],
                    )
                    .await?
            }
            None => {
                self.conn()
                    .query(&format!("SELECT {TOKEN_COLUMNS} FROM tokens ORDER BY id"), ())
                    .await?
            }
        };

        let mut tokens = Vec::new();
        while let Some(row) = rows.next().await? {
            tokens.push(row_to_token(&row));
        }
        Ok(tokens)
    }

    /// Tokens created by login auto-provisioning; the balance sync worker
    /// iterates these.
    pub async fn list_provisioned_tokens(&self) -> Result<Vec<Token>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TOKEN_COLUMNS} FROM tokens WHERE is_provisioned = 1 ORDER BY id"
                ),
                (),
            )
            .await?;

        let mut tokens = Vec::new();
        while let Some(row) = rows.next().await? {
            tokens.push(row_to_token(&row));
        }
        Ok(tokens)
    }

    pub async fn delete_token(&self, id: i64) -> Result<(), StoreError> {
        let affected = self
            .conn()
            .execute("DELETE FROM tokens WHERE id = ?1", params![id])
            .await?;
        if affected == 0 {
            return Err(StoreError::not_found("token", id));
        }
        Ok(())
    }
}
