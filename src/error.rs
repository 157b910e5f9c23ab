use std::sync::Arc;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("invalid host: {0}")]
    InvalidHost(String),

    #[error("invalid host url: {0}")]
    Url(#[from] url::ParseError),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("tunnel rejected by relay: {code} - {message}")]
    Rejected { code: String, message: String },

    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("tunnel cancelled")]
    Cancelled,

    #[error("tunnel closed")]
    Closed,

    #[error("{0}")]
    Terminated(Arc<TunnelError>),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl TunnelError {
    /// Reconnect failures that end the tunnel instead of scheduling another attempt.
    pub fn is_fatal_on_reconnect(&self) -> bool {
        match self {
            TunnelError::Rejected { .. }
            | TunnelError::ReconnectExhausted { .. }
            | TunnelError::Cancelled
            | TunnelError::Closed => true,
            TunnelError::Terminated(inner) => inner.is_fatal_on_reconnect(),
            _ => false,
        }
    }
}

/// Reports whether `err` means the tunnel was closed by its owner.
pub fn is_closed(err: &TunnelError) -> bool {
    match err {
        TunnelError::Closed => true,
        TunnelError::Terminated(inner) => is_closed(inner),
        _ => false,
    }
}

pub type Result<T> = std::result::Result<T, TunnelError>;
