//! Error types for the realtime client.

use std::sync::Arc;

use tokio_tungstenite::tungstenite;

/// A boxed error type for the token callback.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors returned by this crate.
///
/// Variants are cheaply cloneable so a single connect failure can be
/// delivered to every caller waiting on the same in-flight attempt.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectionError {
    #[error("websocket error: {0}")]
    WebSocket(Arc<tungstenite::Error>),

    #[error("invalid endpoint URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("token fetch failed: {0}")]
    TokenFetch(Arc<dyn std::error::Error + Send + Sync>),

    #[error("credential not usable in a handshake header")]
    InvalidCredential,

    #[error("connection closed")]
    Closed,

    #[error("connection handle dropped")]
    Dropped,
}

impl From<tungstenite::Error> for ConnectionError {
    fn from(e: tungstenite::Error) -> Self {
        ConnectionError::WebSocket(Arc::new(e))
    }
}
