//! Socket plumbing: the per-handler outbound event queue with reconnect
//! replay, and the per-user registry of live handlers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use cq_domain::event::{Envelope, ServerEvent};

use crate::session::SessionHandler;
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outbound queue
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct OutboundInner {
    /// Sender for the socket pump currently attached, if any.
    tx: Option<mpsc::UnboundedSender<Envelope>>,
    /// Every event of the current turn, in send order.
    buffer: Vec<Envelope>,
    /// How many buffered events were confirmed written to a socket.
    delivered: usize,
    /// Bumped on every attach so a stale socket cannot detach its
    /// replacement.
    generation: u64,
}

/// Single-producer event queue for one handler.
///
/// Events are enveloped once and recorded in a per-turn buffer; on socket
/// swap the undelivered suffix is replayed to the new socket. There is no
/// client-side ack protocol, so a write that succeeded on a socket the
/// client never read from can still be lost; replay covers everything the
/// server did not confirm written.
pub struct Outbound {
    inner: Mutex<OutboundInner>,
}

impl Default for Outbound {
    fn default() -> Self {
        Self::new()
    }
}

impl Outbound {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(OutboundInner {
                tx: None,
                buffer: Vec::new(),
                delivered: 0,
                generation: 0,
            }),
        }
    }

    /// Envelope, record, and forward an event. Ordering is the lock order.
    pub fn send(&self, event: ServerEvent) {
        let envelope = event.into_envelope();
        let mut inner = self.inner.lock();
        inner.buffer.push(envelope.clone());
        if let Some(tx) = &inner.tx {
            let _ = tx.send(envelope);
        }
    }

    /// Reset the replay buffer at the start of a new turn.
    pub fn begin_turn(&self) {
        let mut inner = self.inner.lock();
        inner.buffer.clear();
        inner.delivered = 0;
    }

    /// Attach a new socket pump: swap in a fresh channel and return the
    /// receiver, the undelivered events to replay first, and the
    /// attachment generation (needed to detach safely).
    pub fn attach(&self) -> (mpsc::UnboundedReceiver<Envelope>, Vec<Envelope>, u64) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let replay = inner.buffer[inner.delivered..].to_vec();
        inner.tx = Some(tx);
        inner.generation += 1;
        let generation = inner.generation;
        (rx, replay, generation)
    }

    /// Record that one more event was written to the socket.
    pub fn mark_delivered(&self) {
        self.inner.lock().delivered += 1;
    }

    /// Drop the socket sender, unless a newer socket already attached.
    pub fn detach(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation == generation {
            inner.tx = None;
        }
    }

    #[cfg(test)]
    pub(crate) fn buffered(&self) -> usize {
        self.inner.lock().buffer.len()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Connection registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// At most one handler per user. A reconnect while a turn is running
/// re-attaches to the existing handler (the in-flight task is untouched);
/// otherwise a fresh handler replaces the old one.
pub struct ConnectionRegistry {
    handlers: RwLock<HashMap<i64, Arc<SessionHandler>>>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// The handler a new socket for `user_id` should attach to.
    pub fn handler_for(&self, state: &AppState, user_id: i64) -> Arc<SessionHandler> {
        let mut handlers = self.handlers.write();
        if let Some(existing) = handlers.get(&user_id) {
            if existing.is_running() {
                tracing::info!(user_id, "reattaching socket to running handler");
                return existing.clone();
            }
        }
        let handler = SessionHandler::new(state.clone(), user_id);
        handlers.insert(user_id, handler.clone());
        handler
    }

    /// Drop the handler entry if it is idle (called on disconnect). A
    /// handler mid-turn stays registered so a reconnect can pick it up.
    pub fn release_if_idle(&self, user_id: i64) {
        let mut handlers = self.handlers.write();
        if let Some(handler) = handlers.get(&user_id) {
            if !handler.is_running() {
                handlers.remove(&user_id);
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.handlers.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_without_socket_buffers() {
        let outbound = Outbound::new();
        outbound.send(ServerEvent::Done {
            conversation_id: 1,
            frame_id: 1,
        });
        assert_eq!(outbound.buffered(), 1);
    }

    #[tokio::test]
    async fn attach_replays_undelivered_events() {
        let outbound = Outbound::new();
        outbound.begin_turn();
        for i in 0..5 {
            outbound.send(ServerEvent::Error {
                error: format!("e{i}"),
                code: "INTERNAL_ERROR".into(),
            });
        }
        // First socket delivered two events, then dropped.
        let (mut rx, replay, _) = outbound.attach();
        assert!(replay.is_empty());
        for _ in 0..2 {
            rx.recv().await.unwrap();
            outbound.mark_delivered();
        }
        drop(rx);

        // Reconnect: the three undelivered events come back as replay.
        let (_rx2, replay2, _) = outbound.attach();
        assert_eq!(replay2.len(), 3);
    }

    #[tokio::test]
    async fn stale_socket_cannot_detach_its_replacement() {
        let outbound = Outbound::new();
        let (_rx1, _, gen1) = outbound.attach();
        let (mut rx2, _, _gen2) = outbound.attach();
        outbound.detach(gen1);
        // The second socket still receives events.
        outbound.send(ServerEvent::Done {
            conversation_id: 1,
            frame_id: 1,
        });
        assert!(rx2.recv().await.is_some());
    }

    #[tokio::test]
    async fn events_after_attach_flow_through_channel_not_replay() {
        let outbound = Outbound::new();
        let (mut rx, replay, _) = outbound.attach();
        assert!(replay.is_empty());
        outbound.send(ServerEvent::Done {
            conversation_id: 1,
            frame_id: 1,
        });
        let envelope = rx.recv().await.unwrap();
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "done");
    }

    #[test]
    fn begin_turn_clears_buffer() {
        let outbound = Outbound::new();
        outbound.send(ServerEvent::Done {
            conversation_id: 1,
            frame_id: 1,
        });
        outbound.begin_turn();
        assert_eq!(outbound.buffered(), 0);
    }
}
