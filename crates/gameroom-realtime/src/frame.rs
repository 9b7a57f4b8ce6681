//! Frame helpers for the JSON wire protocol.
//!
//! Every inbound frame is a JSON object with a required string `type`
//! discriminant; all other fields are type-specific and opaque to this
//! layer. Decision requests additionally carry `request_id` and
//! `expires_at`, and are answered with a single `request_response` frame
//! correlated by the same `request_id`.

use serde_json::{Map, Value};

/// Message types consumed generically by the connection layer.
pub mod frame_type {
    /// Wildcard registration: receives every inbound frame in addition to
    /// the type-specific listeners.
    pub const MESSAGE: &str = "message";
    /// Transport-level failures and server `error` frames.
    pub const ERROR: &str = "error";
    /// Channel close events (from the native close, not a frame).
    pub const CLOSE: &str = "close";
    /// Fired once after automatic reconnection gives up.
    pub const RECONNECT_FAILED: &str = "reconnect-failed";
    /// Outbound answer to a decision request.
    pub const REQUEST_RESPONSE: &str = "request_response";
}

/// Countdown used when a decision frame carries no usable deadline.
pub(crate) const DEFAULT_DECISION_WINDOW_SECS: u64 = 30;

/// A server-issued, time-boxed decision request.
///
/// Any frame satisfying the generic decision contract parses into this:
/// the `type` tag names the decision kind, `request_id` correlates the
/// response, and `expires_at` (epoch seconds) bounds it. Kind-specific
/// fields stay in `frame`.
#[derive(Debug, Clone)]
pub struct DecisionFrame {
    pub kind: String,
    pub request_id: String,
    pub expires_at: Option<i64>,
    pub frame: Value,
}

impl DecisionFrame {
    /// Extract the decision contract from a frame. Returns `None` when the
    /// frame has no string `type` or `request_id`.
    pub fn parse(frame: &Value) -> Option<Self> {
        let kind = frame.get("type")?.as_str()?.to_string();
        let request_id = frame.get("request_id")?.as_str()?.to_string();
        let expires_at = frame.get("expires_at").and_then(Value::as_i64);
        Some(Self {
            kind,
            request_id,
            expires_at,
            frame: frame.clone(),
        })
    }

    /// Seconds until expiry, clamped to the default window when the server
    /// gave no deadline or one that is already in the past.
    pub fn remaining_secs(&self, now_epoch: i64) -> u64 {
        match self.expires_at {
            Some(at) if at > now_epoch => (at - now_epoch) as u64,
            _ => DEFAULT_DECISION_WINDOW_SECS,
        }
    }
}

/// Build the response frame for a decision request. The correlation fields
/// always win over anything in `fields`.
pub fn decision_response(request_id: &str, fields: Map<String, Value>) -> Value {
    let mut obj = fields;
    obj.insert("type".into(), frame_type::REQUEST_RESPONSE.into());
    obj.insert("request_id".into(), request_id.into());
    Value::Object(obj)
}
