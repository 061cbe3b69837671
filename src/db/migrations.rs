//! SQLite schema for the gateway.
//!
//! A single consolidated pass, idempotent via `IF NOT EXISTS` plus explicit
//! column probing for fields added after the initial release (SQLite cannot
//! `ADD COLUMN IF NOT EXISTS`).

use crate::error::StoreError;

/// Consolidated schema.
///
/// Type mapping conventions:
/// - money (`NUMERIC`) -> `TEXT`, parsed into `rust_decimal::Decimal`
/// - timestamps -> `TEXT` (RFC 3339)
/// - JSON maps/sets -> `TEXT` (JSON encoded)
pub const SCHEMA: &str = r#"

CREATE TABLE IF NOT EXISTS tokens (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL UNIQUE,
    group_id TEXT NOT NULL,
    name TEXT NOT NULL DEFAULT '',
    status INTEGER NOT NULL DEFAULT 1,
    quota TEXT NOT NULL DEFAULT '0',
    subnets TEXT NOT NULL DEFAULT '[]',
    model_limits TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_tokens_group ON tokens(group_id);

CREATE TABLE IF NOT EXISTS groups (
    id TEXT PRIMARY KEY,
    status INTEGER NOT NULL DEFAULT 1,
    rpm_ratio REAL NOT NULL DEFAULT 1.0,
    tpm_ratio REAL NOT NULL DEFAULT 1.0,
    available_sets TEXT NOT NULL DEFAULT '["default"]',
    model_mapping TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS channels (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    type INTEGER NOT NULL,
    name TEXT NOT NULL DEFAULT '',
    key TEXT NOT NULL DEFAULT '',
    base_url TEXT,
    priority INTEGER NOT NULL DEFAULT 0,
    weight INTEGER NOT NULL DEFAULT 1,
    status INTEGER NOT NULL DEFAULT 1,
    models TEXT NOT NULL DEFAULT '[]',
    model_mapping TEXT NOT NULL DEFAULT '{}',
    sets TEXT NOT NULL DEFAULT '["default"]',
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_channels_status ON channels(status);

CREATE TABLE IF NOT EXISTS model_configs (
    model TEXT PRIMARY KEY,
    mode TEXT NOT NULL,
    owner TEXT NOT NULL DEFAULT '',
    input_price TEXT NOT NULL DEFAULT '0',
    output_price TEXT NOT NULL DEFAULT '0',
    per_request_price TEXT NOT NULL DEFAULT '0',
    rpm INTEGER,
    tpm INTEGER,
    max_input_tokens INTEGER
);

CREATE TABLE IF NOT EXISTS logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    request_id TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    group_id TEXT NOT NULL DEFAULT '',
    token_id INTEGER NOT NULL DEFAULT 0,
    token_name TEXT NOT NULL DEFAULT '',
    channel_id INTEGER,
    model TEXT NOT NULL DEFAULT '',
    mode TEXT NOT NULL DEFAULT '',
    usage TEXT NOT NULL DEFAULT '{}',
    cost TEXT NOT NULL DEFAULT '0',
    latency_ms INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'success',
    error_kind TEXT,
    error_message TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);
CREATE INDEX IF NOT EXISTS idx_logs_group ON logs(group_id);
CREATE INDEX IF NOT EXISTS idx_logs_request ON logs(request_id);

CREATE TABLE IF NOT EXISTS options (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL DEFAULT ''
);

"#;

/// Columns added to `tokens` after the initial schema. Probed against the
/// live table before ALTER so the migration stays idempotent.
const TOKEN_COLUMNS: &[(&str, &str)] = &[
    (
        "user_type",
        "ALTER TABLE tokens ADD COLUMN user_type TEXT NOT NULL DEFAULT 'regular'",
    ),
    (
        "balance_last_sync",
        "ALTER TABLE tokens ADD COLUMN balance_last_sync TEXT",
    ),
    (
        "is_provisioned",
        "ALTER TABLE tokens ADD COLUMN is_provisioned INTEGER NOT NULL DEFAULT 0",
    ),
];

/// Run the full migration pass. Safe to call on every boot.
pub async fn migrate(conn: &libsql::Connection) -> Result<(), StoreError> {
    conn.execute_batch(SCHEMA)
        .await
        .map_err(|e| StoreError::Migration(e.to_string()))?;

    let existing = table_columns(conn, "tokens").await?;
    for (column, alter) in TOKEN_COLUMNS {
        if existing.iter().any(|c| c == column) {
            continue;
        }
        tracing::info!(column, "adding tokens column");
        conn.execute(alter, ())
            .await
            .map_err(|e| StoreError::Migration(format!("add column {column}: {e}")))?;
    }

    Ok(())
}

/// List column names of a table from the live schema.
async fn table_columns(
    conn: &libsql::Connection,
    table: &str,
) -> Result<Vec<String>, StoreError> {
    let mut rows = conn
        .query(
            "SELECT name FROM pragma_table_info(?1)",
            libsql::params![table],
        )
        .await?;

    let mut columns = Vec::new();
    while let Some(row) = rows.next().await? {
        columns.push(super::get_text(&row, 0));
    }
    Ok(columns)
}
