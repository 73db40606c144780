//! Named-event publish/subscribe.
//!
//! Handlers are called in registration order. A handler returns `true` when
//! it handled the event, which stops delivery to the remaining handlers.

use std::collections::HashMap;

/// A new HTTP request without an `Upgrade` header.
pub const REQUEST: &str = "request";
/// An HTTP request carrying an `Upgrade` header.
pub const UPGRADE: &str = "upgrade";
/// A complete WebSocket message.
pub const MESSAGE: &str = "message";
/// A WebSocket connection finished closing.
pub const CLOSE: &str = "close";

/// Identifies a registered handler so it can be removed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Handler<A> = Box<dyn FnMut(&mut A) -> bool + Send>;

/// A set of named events, each with an ordered list of handlers.
pub struct EventSource<A: ?Sized> {
    listeners: HashMap<&'static str, Vec<(ListenerId, Handler<A>)>>,
    next_id: u64,
}

impl<A: ?Sized> EventSource<A> {
    pub fn new() -> Self {
        Self {
            listeners: HashMap::new(),
            next_id: 0,
        }
    }

    /// Add `handler` for `event`.
    pub fn on<F>(&mut self, event: &'static str, handler: F) -> ListenerId
    where
        F: FnMut(&mut A) -> bool + Send + 'static,
    {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.listeners
            .entry(event)
            .or_default()
            .push((id, Box::new(handler)));
        id
    }

    /// Remove a handler. Returns whether it was registered for `event`.
    pub fn off(&mut self, event: &str, id: ListenerId) -> bool {
        let Some(handlers) = self.listeners.get_mut(event) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(registered, _)| *registered != id);
        before != handlers.len()
    }

    /// Deliver `event` to its handlers until one reports it handled.
    pub fn emit(&mut self, event: &str, arg: &mut A) -> bool {
        let Some(handlers) = self.listeners.get_mut(event) else {
            return false;
        };
        handlers.iter_mut().any(|(_, handler)| handler(&mut *arg))
    }

    /// Number of handlers registered for `event`.
    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.get(event).map_or(0, Vec::len)
    }
}

impl<A: ?Sized> Default for EventSource<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: ?Sized> std::fmt::Debug for EventSource<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut counts: Vec<_> = self
            .listeners
            .iter()
            .map(|(event, handlers)| (*event, handlers.len()))
            .collect();
        counts.sort_unstable();
        f.debug_struct("EventSource").field("listeners", &counts).finish()
    }
}
