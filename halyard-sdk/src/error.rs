//! Error type shared by every fallible engine operation.

use thiserror::Error;

use crate::event::ServerId;

/// Errors surfaced to engine callers.
///
/// Protocol anomalies on the wire never show up here: the codec returns a
/// best-effort parse and the session logs and moves on.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("invalid TLS server name: {0}")]
    ServerName(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("config file is not valid TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown server id: {0}")]
    UnknownServer(ServerId),

    #[error("server {0} is not connected")]
    NotConnected(ServerId),

    #[error("SASL error: {0}")]
    Sasl(String),

    #[error("STS policy store error: {0}")]
    Store(String),

    #[error("engine is shut down")]
    Closed,
}

/// Result alias used across the SDK.
pub type Result<T> = std::result::Result<T, Error>;
