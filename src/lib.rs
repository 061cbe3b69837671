//! llmgate: a multi-tenant LLM API gateway.
//!
//! Accepts OpenAI-compatible (plus Anthropic- and Gemini-native) inference
//! requests, authenticates the caller, routes to a healthy upstream channel,
//! adapts the wire protocol, streams the response back and records
//! consumption against token and group quotas.

pub mod adaptor;
pub mod balance;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod relay;
pub mod server;

pub use config::Config;
pub use error::{ErrorKind, RelayError};
