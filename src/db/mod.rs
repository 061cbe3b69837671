//! Durable store backed by embedded SQLite (libSQL).
//!
//! The store is the only cross-process synchronization point: quota debits
//! are linearized by compare-and-set writes here. Everything else reads
//! through the in-memory caches.

mod channels;
mod groups;
mod logs;
pub mod migrations;
mod model_configs;
mod tokens;

use std::path::Path;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::StoreError;

/// Handle to the SQLite database. Cheap to clone; connections share the
/// underlying database object.
#[derive(Clone)]
pub struct Store {
    conn: libsql::Connection,
    // Kept alive for the lifetime of the store.
    _db: std::sync::Arc<libsql::Database>,
}

impl Store {
    /// Open (or create) the database at `path` and run migrations.
    pub async fn open(path: impl AsRef<Path>, busy_timeout: std::time::Duration) -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(path.as_ref())
            .build()
            .await?;
        let conn = db.connect()?;

        // PRAGMA returns a result row, so this goes through query.
        conn.query(
            &format!("PRAGMA busy_timeout = {}", busy_timeout.as_millis()),
            (),
        )
        .await?;

        let store = Self {
            conn,
            _db: std::sync::Arc::new(db),
        };
        migrations::migrate(&store.conn).await?;
        Ok(store)
    }

    /// In-memory database for tests.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        Self::open(":memory:", std::time::Duration::from_millis(100)).await
    }

    pub(crate) fn conn(&self) -> &libsql::Connection {
        &self.conn
    }
}

// -- Row helpers --

pub(crate) fn get_text(row: &libsql::Row, idx: i32) -> String {
    row.get::<String>(idx).unwrap_or_default()
}

pub(crate) fn get_opt_text(row: &libsql::Row, idx: i32) -> Option<String> {
    match row.get_value(idx) {
        Ok(libsql::Value::Text(s)) if !s.is_empty() => Some(s),
        _ => None,
    }
}

pub(crate) fn get_opt_i64(row: &libsql::Row, idx: i32) -> Option<i64> {
    match row.get_value(idx) {
        Ok(libsql::Value::Integer(v)) => Some(v),
        _ => None,
    }
}

pub(crate) fn get_i64(row: &libsql::Row, idx: i32) -> i64 {
    row.get::<i64>(idx).unwrap_or_default()
}

pub(crate) fn get_f64(row: &libsql::Row, idx: i32) -> f64 {
    row.get::<f64>(idx).unwrap_or_default()
}

/// Timestamps are stored as RFC 3339 TEXT.
pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub(crate) fn get_ts(row: &libsql::Row, idx: i32) -> DateTime<Utc> {
    parse_ts(&get_text(row, idx))
}

pub(crate) fn get_opt_ts(row: &libsql::Row, idx: i32) -> Option<DateTime<Utc>> {
    get_opt_text(row, idx).map(|s| parse_ts(&s))
}

pub(crate) fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

/// Decimals are stored as TEXT to preserve precision.
pub(crate) fn get_decimal(row: &libsql::Row, idx: i32) -> Decimal {
    get_text(row, idx).parse().unwrap_or(Decimal::ZERO)
}

pub(crate) fn to_json_text<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

pub(crate) fn from_json_text<T: serde::de::DeserializeOwned + Default>(raw: &str) -> T {
    if raw.is_empty() {
        return T::default();
    }
    serde_json::from_str(raw).unwrap_or_default()
}
