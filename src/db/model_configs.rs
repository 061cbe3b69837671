//! Model catalog persistence.

use libsql::params;

use crate::error::StoreError;
use crate::model::ModelConfig;
use crate::relay::mode::Mode;

use super::{Store, get_decimal, get_opt_i64, get_text};

const MODEL_CONFIG_COLUMNS: &str =
    "model, mode, owner, input_price, output_price, per_request_price, rpm, tpm, max_input_tokens";

fn row_to_model_config(row: &libsql::Row) -> Result<ModelConfig, StoreError> {
    let mode_raw = get_text(row, 1);
    let mode = Mode::from_str_opt(&mode_raw)
        .ok_or_else(|| StoreError::Serialization(format!("unknown mode {mode_raw:?}")))?;

    let opt_u64 = |idx: i32| -> Option<u64> { get_opt_i64(row, idx).map(|v| v.max(0) as u64) };

    Ok(ModelConfig {
        model: get_text(row, 0),
        mode,
        owner: get_text(row, 2),
        input_price: get_decimal(row, 3),
        output_price: get_decimal(row, 4),
        per_request_price: get_decimal(row, 5),
        rpm: opt_u64(6),
        tpm: opt_u64(7),
        max_input_tokens: opt_u64(8),
    })
}

impl Store {
    pub async fn get_model_config(&self, model: &str) -> Result<ModelConfig, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {MODEL_CONFIG_COLUMNS} FROM model_configs WHERE model = ?1"),
                params![model],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_model_config(&row),
            None => Err(StoreError::not_found("model_config", model)),
        }
    }

    pub async fn upsert_model_config(&self, config: &ModelConfig) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO model_configs \
                 (model, mode, owner, input_price, output_price, per_request_price, \
                  rpm, tpm, max_input_tokens) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
                 ON CONFLICT(model) DO UPDATE SET \
                 mode = ?2, owner = ?3, input_price = ?4, output_price = ?5, \
                 per_request_price = ?6, rpm = ?7, tpm = ?8, max_input_tokens = ?9",
                params![
                    config.model.as_str(),
                    config.mode.as_str(),
                    config.owner.as_str(),
                    config.input_price.to_string(),
                    config.output_price.to_string(),
                    config.per_request_price.to_string(),
                    config.rpm.map(|v| v as i64),
                    config.tpm.map(|v| v as i64),
                    config.max_input_tokens.map(|v| v as i64),
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn list_model_configs(&self) -> Result<Vec<ModelConfig>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {MODEL_CONFIG_COLUMNS} FROM model_configs ORDER BY model"),
                (),
            )
            .await?;

        let mut configs = Vec::new();
        while let Some(row) = rows.next().await? {
            configs.push(row_to_model_config(&row)?);
        }
        Ok(configs)
    }

    pub async fn delete_model_config(&self, model: &str) -> Result<(), StoreError> {
        let affected = self
            .conn()
            .execute("DELETE FROM model_configs WHERE model = ?1", params![model])
            .await?;
        if affected == 0 {
            return Err(StoreError::not_found("model_config", model));
        }
        Ok(())
    }
}
