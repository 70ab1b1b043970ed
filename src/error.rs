//! Error types for the broker daemon.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS: {0}")]
    Tls(#[from] rustls::Error),

    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("WebSocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Request: {0}")]
    Request(String),

    #[error("Config: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, BrokerError>;
