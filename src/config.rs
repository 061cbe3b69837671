//! Configuration for llmgate.
//!
//! Loaded once at boot from environment variables (plus an optional `.env`
//! file) and treated as immutable for the process lifetime.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use subtle::ConstantTimeEq;

use crate::error::ConfigError;

/// Main configuration for the gateway.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub relay: RelayConfig,
    pub balance: BalanceConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        Ok(Self {
            server: ServerConfig::from_env()?,
            database: DatabaseConfig::from_env()?,
            auth: AuthConfig::from_env()?,
            relay: RelayConfig::from_env()?,
            balance: BalanceConfig::from_env()?,
        })
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub gzip_enabled: bool,
}

impl ServerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            listen_addr: optional_env("LISTEN_ADDR")?
                .unwrap_or_else(|| "0.0.0.0:3000".to_string()),
            gzip_enabled: parse_bool("GZIP_ENABLED", optional_env("GZIP_ENABLED")?)?,
        })
    }
}

/// Embedded SQLite settings.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub sqlite_path: String,
    pub busy_timeout: Duration,
}

impl DatabaseConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let busy_timeout_ms = match optional_env("SQLITE_BUSY_TIMEOUT")? {
            Some(raw) => raw.parse::<u64>().map_err(|_| ConfigError::InvalidValue {
                key: "SQLITE_BUSY_TIMEOUT".to_string(),
                message: "must be milliseconds as an integer".to_string(),
            })?,
            None => 5_000,
        };

        Ok(Self {
            sqlite_path: optional_env("SQLITE_PATH")?
                .unwrap_or_else(|| "llmgate.db".to_string()),
            busy_timeout: Duration::from_millis(busy_timeout_ms),
        })
    }
}

/// Gateway-level secrets. The admin key grants full API access; the internal
/// token grants relay access without quota accounting.
#[derive(Clone)]
pub struct AuthConfig {
    admin_key: Option<SecretString>,
    internal_token: Option<SecretString>,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("has_admin_key", &self.admin_key.is_some())
            .field("has_internal_token", &self.internal_token.is_some())
            .finish()
    }
}

impl AuthConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            admin_key: optional_env("ADMIN_KEY")?.map(SecretString::from),
            internal_token: optional_env("INTERNAL_TOKEN")?.map(SecretString::from),
        })
    }

    /// Build from explicit secrets; used by embedders and tests.
    pub fn new(admin_key: Option<SecretString>, internal_token: Option<SecretString>) -> Self {
        Self {
            admin_key,
            internal_token,
        }
    }

    /// Constant-time check against the configured admin key.
    pub fn is_admin_key(&self, candidate: &str) -> bool {
        matches_secret(self.admin_key.as_ref(), candidate)
    }

    /// Constant-time check against the configured internal token.
    pub fn is_internal_token(&self, candidate: &str) -> bool {
        matches_secret(self.internal_token.as_ref(), candidate)
    }
}

fn matches_secret(secret: Option<&SecretString>, candidate: &str) -> bool {
    match secret {
        Some(secret) => {
            let secret = secret.expose_secret();
            !secret.is_empty()
                && bool::from(secret.as_bytes().ct_eq(candidate.as_bytes()))
        }
        None => false,
    }
}

/// Relay pipeline knobs: retries, bans, timeouts.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Maximum dispatch attempts per request.
    pub max_retry: u32,
    /// Rolling error rate at which a (channel, model) pair is banned.
    pub ban_error_rate: f64,
    /// Window over which the error rate is evaluated.
    pub ban_window: Duration,
    /// Per-attempt timeout for chat-class modes.
    pub chat_timeout: Duration,
    /// Per-attempt timeout for image/video generation.
    pub media_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_retry: 3,
            ban_error_rate: 0.5,
            ban_window: Duration::from_secs(60),
            chat_timeout: Duration::from_secs(120),
            media_timeout: Duration::from_secs(600),
        }
    }
}

impl RelayConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let max_retry = match optional_env("MAX_RETRY")? {
            Some(raw) => raw.parse::<u32>().map_err(|_| ConfigError::InvalidValue {
                key: "MAX_RETRY".to_string(),
                message: "must be a non-negative integer".to_string(),
            })?,
            None => defaults.max_retry,
        };

        let ban_error_rate = match optional_env("BAN_ERROR_RATE")? {
            Some(raw) => {
                let rate = raw.parse::<f64>().map_err(|_| ConfigError::InvalidValue {
                    key: "BAN_ERROR_RATE".to_string(),
                    message: "must be a float in (0, 1]".to_string(),
                })?;
                if !(0.0..=1.0).contains(&rate) || rate == 0.0 {
                    return Err(ConfigError::InvalidValue {
                        key: "BAN_ERROR_RATE".to_string(),
                        message: "must be a float in (0, 1]".to_string(),
                    });
                }
                rate
            }
            None => defaults.ban_error_rate,
        };

        Ok(Self {
            max_retry,
            ban_error_rate,
            ban_window: parse_secs("BAN_WINDOW_SECS", defaults.ban_window)?,
            chat_timeout: parse_secs("CHAT_TIMEOUT_SECS", defaults.chat_timeout)?,
            media_timeout: parse_secs("MEDIA_TIMEOUT_SECS", defaults.media_timeout)?,
        })
    }

    /// Per-attempt timeout for a given mode.
    pub fn timeout_for(&self, mode: crate::relay::mode::Mode) -> Duration {
        if mode.is_long_running() {
            self.media_timeout
        } else {
            self.chat_timeout
        }
    }
}

/// Upstream balance endpoint used by login auto-provisioning and the
/// periodic balance sync worker.
#[derive(Debug, Clone)]
pub struct BalanceConfig {
    /// Base URL of the upstream balance service; sync is disabled when unset.
    pub upstream_url: Option<String>,
    pub sync_interval: Duration,
    /// Per-token floor between consecutive syncs.
    pub min_sync_interval: Duration,
}

impl BalanceConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            upstream_url: optional_env("UPSTREAM_BALANCE_URL")?,
            sync_interval: parse_secs("BALANCE_SYNC_INTERVAL_SECS", Duration::from_secs(900))?,
            min_sync_interval: Duration::from_secs(300),
        })
    }
}

fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "not valid unicode".to_string(),
        }),
    }
}

fn parse_bool(key: &str, raw: Option<String>) -> Result<bool, ConfigError> {
    match raw.as_deref() {
        None => Ok(false),
        Some("1") | Some("true") | Some("TRUE") | Some("yes") => Ok(true),
        Some("0") | Some("false") | Some("FALSE") | Some("no") => Ok(false),
        Some(other) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a boolean, got {other:?}"),
        }),
    }
}

fn parse_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    match optional_env(key)? {
        Some(raw) => raw
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                message: "must be seconds as an integer".to_string(),
            }),
        None => Ok(default),
    }
}
