//! Error types for the HTTP layer.

/// Errors returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-2xx, non-401 response, carrying the server-provided message
    /// when one was present.
    #[error("api error ({status}): {message}")]
    Api { status: u16, message: String },

    /// A 401 that could not be recovered by refreshing the credential.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Refresh refused locally: throttled, failure cap reached, or no
    /// refresh token available.
    #[error("credential refresh unavailable: {0}")]
    RefreshUnavailable(&'static str),

    #[error("malformed token: {0}")]
    MalformedToken(String),
}

pub type ApiResult<T> = Result<T, ApiError>;
