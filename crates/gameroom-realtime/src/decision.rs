//! Timed server decisions: correlation by request id, deadline countdowns,
//! and the exactly-one-response guarantee.
//!
//! The server issues a decision request (`{type, request_id, expires_at}`
//! plus kind-specific fields) and runs its own timeout; it expects exactly
//! one `request_response` back. [`DecisionTracker`] enforces that locally:
//! the first resolution path to fire (explicit submit, explicit cancel, or
//! deadline expiry) sends the response and clears the decision, and every
//! later path for the same request id is a no-op.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::connection::Connection;
use crate::frame::{self, DecisionFrame};

// ---------------------------------------------------------------------------
// Deadline primitive
// ---------------------------------------------------------------------------

/// Cancellation handle for a running deadline. Dropping it clears the
/// timer without firing.
pub struct DeadlineHandle {
    remaining_rx: watch::Receiver<u64>,
    task: JoinHandle<()>,
}

impl DeadlineHandle {
    /// Seconds left on the countdown.
    pub fn remaining(&self) -> u64 {
        *self.remaining_rx.borrow()
    }

    /// Watch the once-per-second countdown.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.remaining_rx.clone()
    }

    /// Stop the countdown without firing.
    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for DeadlineHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Start a countdown of `secs` seconds. The remaining time ticks down once
/// per second (observable through the handle) and `on_expire` runs exactly
/// once when it reaches zero, unless the handle is cancelled or dropped
/// first.
pub fn start_deadline(secs: u64, on_expire: impl FnOnce() + Send + 'static) -> DeadlineHandle {
    let (tx, rx) = watch::channel(secs);
    let task = tokio::spawn(async move {
        let mut left = secs;
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        // The first tick of an interval completes immediately.
        ticker.tick().await;
        while left > 0 {
            ticker.tick().await;
            left -= 1;
            let _ = tx.send(left);
        }
        on_expire();
    });
    DeadlineHandle {
        remaining_rx: rx,
        task,
    }
}

// ---------------------------------------------------------------------------
// Decision tracker
// ---------------------------------------------------------------------------

/// What to send when a pending decision expires or is cancelled without an
/// explicit selection. The server applies its own default if the client
/// stays silent, so expiry always answers rather than dropping the
/// decision.
#[derive(Debug, Clone)]
pub enum ExpiryPolicy {
    /// Data-entry decisions (e.g. discard selections): submit whatever
    /// partial selection was staged, or an empty selection.
    SubmitStaged,
    /// Choice decisions (e.g. card picks): send the kind's explicit
    /// fallback flag, such as `random_selection` or `random_discard`.
    Signal(String),
}

struct PendingDecision {
    kind: String,
    policy: ExpiryPolicy,
    staged: Map<String, Value>,
    deadline: DeadlineHandle,
}

/// A tracked decision: its request id and the live countdown.
pub struct DecisionTicket {
    pub request_id: String,
    pub remaining: watch::Receiver<u64>,
}

/// Tracks server-issued decision requests and guarantees exactly one
/// response per request id.
///
/// Cheap to clone; all clones share the same pending set, so the popup that
/// tracked a decision and the controller that resolves it can hold separate
/// handles.
#[derive(Clone)]
pub struct DecisionTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    outlet: Outlet,
    pending: Mutex<HashMap<String, PendingDecision>>,
}

/// Where responses go. Tests swap the connection for a channel.
enum Outlet {
    Connection(Connection),
    #[cfg(test)]
    Channel(tokio::sync::mpsc::UnboundedSender<Value>),
}

impl Outlet {
    fn send(&self, response: Value) {
        match self {
            Outlet::Connection(conn) => {
                conn.send(response);
            }
            #[cfg(test)]
            Outlet::Channel(tx) => {
                let _ = tx.send(response);
            }
        }
    }
}

impl DecisionTracker {
    pub fn new(connection: Connection) -> Self {
        Self::with_outlet(Outlet::Connection(connection))
    }

    #[cfg(test)]
    fn with_channel(tx: tokio::sync::mpsc::UnboundedSender<Value>) -> Self {
        Self::with_outlet(Outlet::Channel(tx))
    }

    fn with_outlet(outlet: Outlet) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                outlet,
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Begin tracking a decision frame and start its deadline. Returns
    /// `None` when the frame does not carry the decision contract (`type`
    /// plus `request_id`).
    ///
    /// Tracking a request id that is already pending replaces the earlier
    /// decision and silences its timer.
    pub fn track(&self, raw: &Value, policy: ExpiryPolicy) -> Option<DecisionTicket> {
        let decision = DecisionFrame::parse(raw)?;
        let secs = decision.remaining_secs(now_epoch());
        let request_id = decision.request_id;

        let weak = Arc::downgrade(&self.inner);
        let expire_id = request_id.clone();
        let deadline = start_deadline(secs, move || {
            if let Some(inner) = weak.upgrade() {
                inner.expire(&expire_id);
            }
        });
        let remaining = deadline.subscribe();

        let entry = PendingDecision {
            kind: decision.kind,
            policy,
            staged: Map::new(),
            deadline,
        };
        if self
            .inner
            .locked()
            .insert(request_id.clone(), entry)
            .is_some()
        {
            tracing::warn!(request_id = %request_id, "replacing decision already pending under this id");
        }
        Some(DecisionTicket {
            request_id,
            remaining,
        })
    }

    /// Replace the staged partial selection for a pending decision; this is
    /// what `SubmitStaged` kinds auto-submit on expiry. Returns `false` if
    /// the decision is no longer pending.
    pub fn stage(&self, request_id: &str, fields: Map<String, Value>) -> bool {
        let mut pending = self.inner.locked();
        let Some(entry) = pending.get_mut(request_id) else {
            return false;
        };
        entry.staged = fields;
        true
    }

    /// Send the explicit response for a pending decision. The deadline is
    /// cleared and the local state destroyed before anything else can fire.
    /// Returns `false` (and sends nothing) when the request id is unknown
    /// or already resolved.
    pub fn resolve(&self, request_id: &str, fields: Map<String, Value>) -> bool {
        let Some(entry) = self.inner.remove(request_id) else {
            tracing::debug!(request_id, "ignoring response for a decision that is not pending");
            return false;
        };
        entry.deadline.cancel();
        self.inner
            .outlet
            .send(frame::decision_response(request_id, fields));
        true
    }

    /// Answer with the kind's fallback (the explicit cancel / random path).
    /// Returns `false` when the decision is no longer pending.
    pub fn cancel(&self, request_id: &str) -> bool {
        let Some(entry) = self.inner.remove(request_id) else {
            return false;
        };
        entry.deadline.cancel();
        self.inner.send_fallback(request_id, entry);
        true
    }

    /// Drop a pending decision without responding, clearing its timer.
    /// For teardown paths where the decision no longer applies (the view
    /// went away, or the server resolved it out of band); the server's own
    /// timeout supplies the default.
    pub fn dismiss(&self, request_id: &str) -> bool {
        self.inner.remove(request_id).is_some()
    }

    /// Seconds left for a pending decision.
    pub fn remaining(&self, request_id: &str) -> Option<u64> {
        self.inner
            .locked()
            .get(request_id)
            .map(|entry| entry.deadline.remaining())
    }

    /// Number of decisions still awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.inner.locked().len()
    }
}

impl TrackerInner {
    fn locked(&self) -> MutexGuard<'_, HashMap<String, PendingDecision>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn remove(&self, request_id: &str) -> Option<PendingDecision> {
        self.locked().remove(request_id)
    }

    /// Deadline callback. A fire that raced with resolution finds no entry
    /// and does nothing.
    fn expire(&self, request_id: &str) {
        let Some(entry) = self.remove(request_id) else {
            return;
        };
        tracing::info!(request_id, kind = %entry.kind, "decision expired, sending automatic response");
        self.send_fallback(request_id, entry);
    }

    fn send_fallback(&self, request_id: &str, entry: PendingDecision) {
        let fields = match entry.policy {
            ExpiryPolicy::SubmitStaged => entry.staged,
            ExpiryPolicy::Signal(flag) => {
                let mut fields = Map::new();
                fields.insert(flag, Value::Bool(true));
                fields
            }
        };
        self.outlet.send(frame::decision_response(request_id, fields));
    }
}

fn now_epoch() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn decision_frame(request_id: &str, expires_in: i64) -> Value {
        json!({
            "type": "recipe_selection",
            "request_id": request_id,
            "expires_at": now_epoch() + expires_in,
        })
    }

    fn selection(key: &str, value: Value) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert(key.to_string(), value);
        fields
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_sends_signal_fallback() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tracker = DecisionTracker::with_channel(tx);
        tracker
            .track(
                &decision_frame("r1", 5),
                ExpiryPolicy::Signal("random_selection".into()),
            )
            .unwrap();

        let sent = rx.recv().await.unwrap();
        assert_eq!(sent["type"], "request_response");
        assert_eq!(sent["request_id"], "r1");
        assert_eq!(sent["random_selection"], true);
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_submits_staged_selection() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tracker = DecisionTracker::with_channel(tx);
        tracker
            .track(&decision_frame("r1", 3), ExpiryPolicy::SubmitStaged)
            .unwrap();
        assert!(tracker.stage("r1", selection("selected_cards", json!(["c1", "c2"]))));

        let sent = rx.recv().await.unwrap();
        assert_eq!(sent["request_id"], "r1");
        assert_eq!(sent["selected_cards"], json!(["c1", "c2"]));
    }

    #[tokio::test(start_paused = true)]
    async fn resolve_sends_once_and_silences_timer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tracker = DecisionTracker::with_channel(tx);
        tracker
            .track(
                &decision_frame("abc", 5),
                ExpiryPolicy::Signal("random_selection".into()),
            )
            .unwrap();

        assert!(tracker.resolve("abc", selection("selected_recipe", json!("r2"))));
        let sent = rx.recv().await.unwrap();
        assert_eq!(sent["selected_recipe"], "r2");

        // A second response for the same id is refused outright.
        assert!(!tracker.resolve("abc", selection("selected_recipe", json!("r3"))));

        // Ride past the original deadline: the cancelled timer must not
        // produce a second send.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn countdown_ticks_down() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let tracker = DecisionTracker::with_channel(tx);
        let ticket = tracker
            .track(&decision_frame("r1", 5), ExpiryPolicy::SubmitStaged)
            .unwrap();

        let mut remaining = ticket.remaining;
        remaining.changed().await.unwrap();
        assert_eq!(*remaining.borrow(), 4);
        remaining.changed().await.unwrap();
        assert_eq!(*remaining.borrow(), 3);
        assert_eq!(tracker.remaining("r1"), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_sends_fallback_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tracker = DecisionTracker::with_channel(tx);
        tracker
            .track(
                &decision_frame("r1", 30),
                ExpiryPolicy::Signal("random_discard".into()),
            )
            .unwrap();

        assert!(tracker.cancel("r1"));
        let sent = rx.recv().await.unwrap();
        assert_eq!(sent["random_discard"], true);
        assert!(!tracker.cancel("r1"));
    }

    #[tokio::test(start_paused = true)]
    async fn dismiss_clears_without_sending() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tracker = DecisionTracker::with_channel(tx);
        tracker
            .track(&decision_frame("r1", 2), ExpiryPolicy::SubmitStaged)
            .unwrap();

        assert!(tracker.dismiss("r1"));
        assert_eq!(tracker.pending_count(), 0);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn non_decision_frame_is_not_tracked() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let tracker = DecisionTracker::with_channel(tx);
        assert!(
            tracker
                .track(&json!({"type": "game_update"}), ExpiryPolicy::SubmitStaged)
                .is_none()
        );
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_deadline_falls_back_to_default_window() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tracker = DecisionTracker::with_channel(tx);
        let ticket = tracker
            .track(
                &json!({"type": "defense_request", "request_id": "r1"}),
                ExpiryPolicy::Signal("random_selection".into()),
            )
            .unwrap();
        assert_eq!(*ticket.remaining.borrow(), 30);

        let sent = rx.recv().await.unwrap();
        assert_eq!(sent["request_id"], "r1");
    }

    #[tokio::test(start_paused = true)]
    async fn stage_after_resolution_is_refused() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let tracker = DecisionTracker::with_channel(tx);
        tracker
            .track(&decision_frame("r1", 30), ExpiryPolicy::SubmitStaged)
            .unwrap();
        assert!(tracker.resolve("r1", Map::new()));
        assert!(!tracker.stage("r1", selection("selected_cards", json!([]))));
    }
}
