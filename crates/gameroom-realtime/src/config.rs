//! Connection configuration: endpoint, credential transport, and the
//! reconnect policy.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::error::BoxError;

/// A future that resolves to the current access token.
pub type TokenFuture = Pin<Box<dyn Future<Output = Result<String, BoxError>> + Send>>;

/// Callback that returns the credential used to authorize the handshake.
///
/// Fetched fresh on every dial so a token renewed between reconnect
/// attempts is picked up automatically.
pub type TokenProvider = Box<dyn Fn() -> TokenFuture + Send + Sync>;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const BACKOFF_FACTOR: f64 = 1.5;

/// How the credential is carried during the WebSocket handshake. Which one
/// applies depends on the deployment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TokenTransport {
    /// A `token.{jwt}` entry in the `Sec-WebSocket-Protocol` header, for
    /// servers that cannot read Authorization headers during the upgrade.
    #[default]
    Subprotocol,
    /// A `token` query parameter on the connection URL.
    QueryParam,
}

/// Automatic reconnection policy, applied after an established channel is
/// lost unexpectedly. Delays grow multiplicatively and are capped; once
/// `max_attempts` have failed, a single `reconnect-failed` notification
/// fires and the connection stays closed.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based):
    /// `base_delay × 1.5^(attempt-1)`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(30);
        self.base_delay
            .mul_f64(BACKOFF_FACTOR.powi(exp as i32))
            .min(self.max_delay)
    }
}

/// Configuration for a [`Connection`](crate::Connection).
pub struct ConnectConfig {
    /// Base URL of the realtime endpoint, e.g. `wss://host/ws`.
    pub ws_base: String,
    /// Resource path, e.g. `/game/{game_id}/room/{room_id}`.
    pub endpoint: String,
    /// Extra query parameters (e.g. `user_id`).
    pub params: Option<HashMap<String, String>>,
    /// How the credential is attached to the handshake.
    pub transport: TokenTransport,
    /// Returns the credential for each dial.
    pub get_token: TokenProvider,
    /// Automatic reconnection. `None` means a lost channel stays closed
    /// until the caller reconnects explicitly.
    pub reconnect: Option<ReconnectPolicy>,
    /// Upper bound on token fetch plus WebSocket handshake.
    pub connect_timeout: Duration,
}

impl ConnectConfig {
    pub fn new(
        ws_base: impl Into<String>,
        endpoint: impl Into<String>,
        get_token: TokenProvider,
    ) -> Self {
        Self {
            ws_base: ws_base.into(),
            endpoint: endpoint.into(),
            params: None,
            transport: TokenTransport::default(),
            get_token,
            reconnect: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}
