//! Realtime client layer for the gameroom frontend.
//!
//! Owns the persistent WebSocket channel between the game client and the
//! game server: connection lifecycle with an explicit reconnect policy,
//! FIFO queueing of payloads sent while the channel is down, ordered
//! dispatch of inbound frames by their `type` tag, and the timed-decision
//! protocol (correlation by `request_id`, with a deadline that always
//! answers).
//!
//! # Features
//! - Idempotent connect: racing callers share one in-flight attempt
//! - Outbound queue that survives disconnects and drains in order on open
//! - Listener registry with ordered dispatch and a `message` wildcard
//! - Exponential reconnect backoff with a terminal `reconnect-failed`
//!   notification
//! - Decision tracking with exactly one response per request id
//!
//! # Example
//! ```no_run
//! use gameroom_realtime::{ConnectConfig, Connection, DecisionTracker, ExpiryPolicy, ReconnectPolicy};
//!
//! # async fn example() -> Result<(), gameroom_realtime::ConnectionError> {
//! let mut config = ConnectConfig::new(
//!     "wss://play.example.com/ws",
//!     "/game/6/room/42",
//!     Box::new(|| Box::pin(async { Ok("jwt".to_string()) })),
//! );
//! config.reconnect = Some(ReconnectPolicy::default());
//!
//! let conn = Connection::new(config);
//! conn.connect().await?;
//!
//! let registration = conn.on("game_update", |frame| println!("update: {frame}"));
//! conn.send(serde_json::json!({ "type": "get_game_state" }));
//!
//! let decisions = DecisionTracker::new(conn.clone());
//! # let _ = (registration, decisions);
//! # Ok(())
//! # }
//! ```

mod config;
mod connection;
mod decision;
mod error;
pub mod frame;
mod queue;
mod registry;

pub use config::{ConnectConfig, ReconnectPolicy, TokenFuture, TokenProvider, TokenTransport};
pub use connection::{Connection, ConnectionState};
pub use decision::{
    DeadlineHandle, DecisionTicket, DecisionTracker, ExpiryPolicy, start_deadline,
};
pub use error::{BoxError, ConnectionError};
pub use frame::{DecisionFrame, decision_response, frame_type};
pub use registry::ListenerId;
