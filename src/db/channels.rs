//! Channel persistence.

use libsql::params;

use crate::error::StoreError;
use crate::model::{Channel, ChannelStatus, ChannelType};

use super::{
    Store, fmt_ts, from_json_text, get_i64, get_opt_text, get_text, get_ts, to_json_text,
};

const CHANNEL_COLUMNS: &str =
    "id, type, name, key, base_url, priority, weight, status, models, model_mapping, sets, created_at";

fn row_to_channel(row: &libsql::Row) -> Result<Channel, StoreError> {
    let type_code = get_i64(row, 1);
    let channel_type = ChannelType::from_i64(type_code).ok_or_else(|| {
        StoreError::Serialization(format!("unknown channel type code {type_code}"))
    })?;

    let models: Vec<String> = from_json_text(&get_text(row, 8));

    Ok(Channel {
        id: get_i64(row, 0),
        channel_type,
        name: get_text(row, 2),
        key: get_text(row, 3),
        base_url: get_opt_text(row, 4),
        priority: get_i64(row, 5) as i32,
        weight: get_i64(row, 6).max(0) as u32,
        status: ChannelStatus::from_i64(get_i64(row, 7)),
        models: models.into_iter().collect(),
        model_mapping: from_json_text(&get_text(row, 9)),
        sets: from_json_text(&get_text(row, 10)),
        created_at: get_ts(row, 11),
    })
}

impl Store {
    pub async fn get_channel(&self, id: i64) -> Result<Channel, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CHANNEL_COLUMNS} FROM channels WHERE id = ?1"),
                params![id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_channel(&row),
            None => Err(StoreError::not_found("channel", id)),
        }
    }

    pub async fn insert_channel(&self, channel: &Channel) -> Result<i64, StoreError> {
        let models: Vec<&str> = channel.models.iter().map(String::as_str).collect();

        self.conn()
            .execute(
                "INSERT INTO channels \
                 (type, name, key, base_url, priority, weight, status, models, \
                  model_mapping, sets, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    channel.channel_type.as_i64(),
                    channel.name.as_str(),
                    channel.key.as_str(),
                    channel.base_url.as_deref(),
                    channel.priority as i64,
                    channel.weight as i64,
                    channel.status.as_i64(),
                    to_json_text(&models)?,
                    to_json_text(&channel.model_mapping)?,
                    to_json_text(&channel.sets)?,
                    fmt_ts(channel.created_at),
                ],
            )
            .await?;

        let mut rows = self.conn().query("SELECT last_insert_rowid()", ()).await?;
        let row = rows
            .next()
            .await?
            .ok_or_else(|| StoreError::Serialization("no rowid returned".into()))?;
        Ok(get_i64(&row, 0))
    }

    pub async fn update_channel(&self, channel: &Channel) -> Result<(), StoreError> {
        let models: Vec<&str> = channel.models.iter().map(String::as_str).collect();

        let affected = self
            .conn()
            .execute(
                "UPDATE channels SET type = ?1, name = ?2, key = ?3, base_url = ?4, \
                 priority = ?5, weight = ?6, status = ?7, models = ?8, \
                 model_mapping = ?9, sets = ?10 WHERE id = ?11",
                params![
                    channel.channel_type.as_i64(),
                    channel.name.as_str(),
                    channel.key.as_str(),
                    channel.base_url.as_deref(),
                    channel.priority as i64,
                    channel.weight as i64,
                    channel.status.as_i64(),
                    to_json_text(&models)?,
                    to_json_text(&channel.model_mapping)?,
                    to_json_text(&channel.sets)?,
                    channel.id,
                ],
            )
            .await?;
        if affected == 0 {
            return Err(StoreError::not_found("channel", channel.id));
        }
        Ok(())
    }

    pub async fn update_channel_status(
        &self,
        id: i64,
        status: ChannelStatus,
    ) -> Result<(), StoreError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE channels SET status = ?1 WHERE id = ?2",
                params![status.as_i64(), id],
            )
            .await?;
        if affected == 0 {
            return Err(StoreError::not_found("channel", id));
        }
        Ok(())
    }

    pub async fn list_channels(&self) -> Result<Vec<Channel>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CHANNEL_COLUMNS} FROM channels ORDER BY id"),
                (),
            )
            .await?;

        let mut channels = Vec::new();
        while let Some(row) = rows.next().await? {
            channels.push(row_to_channel(&row)?);
        }
        Ok(channels)
    }

    pub async fn delete_channel(&self, id: i64) -> Result<(), StoreError> {
        let affected = self
            .conn()
            .execute("DELETE FROM channels WHERE id = ?1", params![id])
            .await?;
        if affected == 0 {
            return Err(StoreError::not_found("channel", id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_channel() -> Channel {
        Channel {
            id: 0,
            channel_type: ChannelType::OpenAi,
            name: "openai-main".to_string(),
            key: "sk-upstream".to_string(),
            base_url: None,
            priority: 10,
            weight: 3,
            status: ChannelStatus::Enabled,
            models: ["gpt-4o".to_string()].into_iter().collect(),
            model_mapping: Default::default(),
            sets: vec!["default".to_string()],
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn insert_fetch_update_delete() {
        let store = Store::open_in_memory().await.unwrap();
        let id = store.insert_channel(&sample_channel()).await.unwrap();

        let mut channel = store.get_channel(id).await.unwrap();
        assert_eq!(channel.channel_type, ChannelType::OpenAi);
        assert!(channel.models.contains("gpt-4o"));

        channel.status = ChannelStatus::AutoDisabled;
        channel.base_url = Some("https://example.invalid/v1".to_string());
        store.update_channel(&channel).await.unwrap();

        let channel = store.get_channel(id).await.unwrap();
        assert_eq!(channel.status, ChannelStatus::AutoDisabled);
        assert_eq!(channel.base_url.as_deref(), Some("https://example.invalid/v1"));

        store.delete_channel(id).await.unwrap();
        assert!(store.get_channel(id).await.unwrap_err().is_not_found());
    }
}
