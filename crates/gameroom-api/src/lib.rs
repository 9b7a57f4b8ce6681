//! HTTP layer for the gameroom frontend: credential storage, single-flight
//! token refresh, and an authorized request façade.
//!
//! Every call attaches the current bearer credential. A 401 answer routes
//! through the refresh coordinator, which guarantees at most one network
//! refresh no matter how many calls fail concurrently; each failed call is
//! then replayed exactly once with the renewed credential. Credentials are
//! persisted under stable keys and cleared in full on logout.
//!
//! # Example
//! ```no_run
//! use gameroom_api::{ApiClient, ApiConfig, CredentialStore, FileStorage};
//!
//! # async fn example() -> gameroom_api::ApiResult<()> {
//! let store = CredentialStore::new(Box::new(FileStorage::new("session.json")));
//! let client = ApiClient::new(ApiConfig::new("https://play.example.com"), store)?;
//!
//! client.login("player1", "secret").await?;
//! let rooms = client.get("/games/rooms").await?;
//! # let _ = rooms;
//!
//! // Hand the credential to the realtime layer.
//! let get_token = client.token_provider();
//! # let _ = get_token;
//! # Ok(())
//! # }
//! ```

mod client;
mod credentials;
mod error;
mod refresh;

pub use client::{ApiClient, ApiConfig, LoginResponse, ResponseBody};
pub use credentials::{
    CredentialStore, FileStorage, MemoryStorage, StoredCredentials, TokenStorage, decode_claims,
    token_expiry,
};
pub use error::{ApiError, ApiResult};
pub use refresh::RefreshConfig;
