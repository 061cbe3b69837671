//! Group persistence.

use libsql::params;

use crate::error::StoreError;
use crate::model::{Group, GroupStatus};

use super::{Store, fmt_ts, from_json_text, get_f64, get_i64, get_text, get_ts, to_json_text};

const GROUP_COLUMNS: &str =
    "id, status, rpm_ratio, tpm_ratio, available_sets, model_mapping, created_at";

fn row_to_group(row: &libsql::Row) -> Group {
    Group {
        id: get_text(row, 0),
        status: GroupStatus::from_i64(get_i64(row, 1)),
        rpm_ratio: get_f64(row, 2),
        tpm_ratio: get_f64(row, 3),
        available_sets: from_json_text(&get_text(row, 4)),
        model_mapping: from_json_text(&get_text(row, 5)),
        created_at: get_ts(row, 6),
    }
}

impl Store {
    pub async fn get_group(&self, id: &str) -> Result<Group, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {GROUP_COLUMNS} FROM groups WHERE id = ?1"),
                params![id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(row_to_group(&row)),
            None => Err(StoreError::not_found("group", id)),
        }
    }

    /// Insert a group; a no-op when the id already exists (login
    /// auto-provisioning relies on this being idempotent).
    pub async fn insert_group(&self, group: &Group) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO groups \
                 (id, status, rpm_ratio, tpm_ratio, available_sets, model_mapping, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    group.id.as_str(),
                    group.status.as_i64(),
                    group.rpm_ratio,
                    group.tpm_ratio,
                    to_json_text(&group.available_sets)?,
                    to_json_text(&group.model_mapping)?,
                    fmt_ts(group.created_at),
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn update_group(&self, group: &Group) -> Result<(), StoreError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE groups SET status = ?1, rpm_ratio = ?2, tpm_ratio = ?3, \
                 available_sets = ?4, model_mapping = ?5 WHERE id = ?6",
                params![
                    group.status.as_i64(),
                    group.rpm_ratio,
                    group.tpm_ratio,
                    to_json_text(&group.available_sets)?,
                    to_json_text(&group.model_mapping)?,
                    group.id.as_str(),
                ],
            )
            .await?;
        if affected == 0 {
            return Err(StoreError::not_found("group", group.id.clone()));
        }
        Ok(())
    }

    pub async fn update_group_status(&self, id: &str, status: GroupStatus) -> Result<(), StoreError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE groups SET status = ?1 WHERE id = ?2",
                params![status.as_i64(), id],
            )
            .await?;
        if affected == 0 {
            return Err(StoreError::not_found("group", id));
        }
        Ok(())
    }

    pub async fn list_groups(&self) -> Result<Vec<Group>, StoreError> {
        let mut rows = self
            .conn()
            .query(&format!("SELECT {GROUP_COLUMNS} FROM groups ORDER BY id"), ())
            .await?;

        let mut groups = Vec::new();
        while let Some(row) = rows.next().await? {
            groups.push(row_to_group(&row));
        }
        Ok(groups)
    }

    pub async fn delete_group(&self, id: &str) -> Result<(), StoreError> {
        let affected = self
            .conn()
            .execute("DELETE FROM groups WHERE id = ?1", params![id])
            .await?;
        if affected == 0 {
            return Err(StoreError::not_found("group", id));
        }
        Ok(())
    }
}
