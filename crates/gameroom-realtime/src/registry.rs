//! Listener registry: a multimap from message-type string to an ordered
//! list of callbacks.

use std::collections::HashMap;

use serde_json::Value;

use crate::frame::frame_type;

/// Identifies one registration so it can be removed later. Registering the
/// same closure twice yields two ids and two invocations per frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);

pub(crate) type ListenerFn = Box<dyn FnMut(&Value) + Send>;

/// Registration order is invocation order; removal never reorders the
/// survivors.
#[derive(Default)]
pub(crate) struct ListenerRegistry {
    listeners: HashMap<String, Vec<(ListenerId, ListenerFn)>>,
}

impl ListenerRegistry {
    pub fn add(&mut self, kind: String, id: ListenerId, callback: ListenerFn) {
        self.listeners.entry(kind).or_default().push((id, callback));
    }

    pub fn remove(&mut self, kind: &str, id: ListenerId) {
        if let Some(list) = self.listeners.get_mut(kind) {
            list.retain(|(lid, _)| *lid != id);
            if list.is_empty() {
                self.listeners.remove(kind);
            }
        }
    }

    /// Deliver an inbound frame: type-specific listeners first, then the
    /// `message` wildcard listeners in addition, not instead.
    pub fn dispatch(&mut self, kind: &str, frame: &Value) {
        self.notify(kind, frame);
        if kind != frame_type::MESSAGE {
            self.notify(frame_type::MESSAGE, frame);
        }
    }

    /// Deliver to the listeners of one type only. Used for synthetic local
    /// events (`close`, `error`, `reconnect-failed`) that do not go through
    /// the wildcard.
    pub fn notify(&mut self, kind: &str, frame: &Value) {
        if let Some(list) = self.listeners.get_mut(kind) {
            for (_, callback) in list.iter_mut() {
                callback(frame);
            }
        }
    }
}
