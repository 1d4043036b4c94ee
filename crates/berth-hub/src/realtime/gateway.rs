//! Client registries and fan-out
//!
//! One registry per `(session, channel)` pair, created on the first
//! subscriber and dropped with the last. The producer never blocks on a
//! client: each client has its own bounded queue, and a client whose
//! queue is full is detached rather than allowed to stall the stream
//! (disconnect-on-backpressure). Per-session ordering is preserved
//! because each session has exactly one producing pump.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, mpsc};

use berth_core::types::SessionId;

use super::events::{ChannelKind, HubEvent, ServerFrame};

/// Per-client outbound queue depth. A client this far behind a terminal
/// stream is not keeping up and gets detached.
const CLIENT_QUEUE_CAPACITY: usize = 512;

/// Capacity of the hub-wide lifecycle broadcast
const EVENT_BROADCAST_CAPACITY: usize = 1024;

/// Identifies one attached client
pub type ClientId = u64;

/// Realtime gateway: client registries + fan-out
pub struct Gateway {
    /// Attached clients per (session, channel)
    clients: DashMap<(SessionId, ChannelKind), HashMap<ClientId, mpsc::Sender<ServerFrame>>>,
    /// Client id allocator
    next_client_id: AtomicU64,
    /// Hub-wide lifecycle events
    events_tx: broadcast::Sender<HubEvent>,
}

impl Gateway {
    /// Create a gateway
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_BROADCAST_CAPACITY);
        Self {
            clients: DashMap::new(),
            next_client_id: AtomicU64::new(1),
            events_tx,
        }
    }

    /// Attach a client to a session channel. Returns the client id and
    /// the frame stream to forward to the socket.
    ///
    /// `initial` frames (status snapshot, scrollback replay) are enqueued
    /// before the sender becomes visible to producers, so they are
    /// guaranteed to precede any live data.
    pub fn attach(
        &self,
        session_id: SessionId,
        kind: ChannelKind,
        initial: Vec<ServerFrame>,
    ) -> (ClientId, mpsc::Receiver<ServerFrame>) {
        let id = self.next_client_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_CAPACITY);

        for frame in initial {
            let _ = tx.try_send(frame);
        }

        self.clients
            .entry((session_id.clone(), kind))
            .or_default()
            .insert(id, tx);

        tracing::debug!("Client {} attached to {:?} of {}", id, kind, session_id);
        (id, rx)
    }

    /// Detach a client; the registry entry disappears with its last client
    pub fn detach(&self, session_id: &SessionId, kind: ChannelKind, client_id: ClientId) {
        let key = (session_id.clone(), kind);
        let mut empty = false;
        if let Some(mut entry) = self.clients.get_mut(&key) {
            entry.remove(&client_id);
            empty = entry.is_empty();
        }
        if empty {
            self.clients.remove_if(&key, |_, v| v.is_empty());
        }
        tracing::debug!("Client {} detached from {:?} of {}", client_id, kind, session_id);
    }

    /// Whether the channel currently has any viewers
    pub fn has_clients(&self, session_id: &SessionId, kind: ChannelKind) -> bool {
        self.clients
            .get(&(session_id.clone(), kind))
            .map(|c| !c.is_empty())
            .unwrap_or(false)
    }

    /// Fan a frame out to every client on a session channel
    pub fn send_to_channel(&self, session_id: &SessionId, kind: ChannelKind, frame: ServerFrame) {
        let key = (session_id.clone(), kind);
        let Some(mut entry) = self.clients.get_mut(&key) else {
            return;
        };

        let mut stale: Vec<ClientId> = Vec::new();
        for (client_id, tx) in entry.iter() {
            if tx.try_send(frame.clone()).is_err() {
                stale.push(*client_id);
            }
        }

        for client_id in stale {
            tracing::warn!(
                "Detaching client {} of {} ({:?}): queue full or closed",
                client_id,
                session_id,
                kind
            );
            entry.remove(&client_id);
        }
    }

    /// Fan agent terminal output out to the session's viewers
    pub fn agent_data(&self, session_id: &SessionId, data: &[u8]) {
        self.send_to_channel(session_id, ChannelKind::AgentTerminal, ServerFrame::output(data));
    }

    /// Fan shell terminal output out to the session's viewers
    pub fn shell_data(&self, session_id: &SessionId, data: &[u8]) {
        self.send_to_channel(session_id, ChannelKind::ShellTerminal, ServerFrame::output(data));
    }

    /// Broadcast a lifecycle event hub-wide and to the affected session's
    /// agent-terminal viewers
    pub fn broadcast(&self, event: HubEvent) {
        if let Some(session_id) = event_session(&event) {
            self.send_to_channel(
                &session_id,
                ChannelKind::AgentTerminal,
                ServerFrame::Event {
                    event: event.clone(),
                },
            );
        }
        // Lagging broadcast receivers drop old events; that is fine for
        // list views, which re-snapshot on reconnect.
        let _ = self.events_tx.send(event);
    }

    /// Subscribe to the hub-wide lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.events_tx.subscribe()
    }
}

impl Default for Gateway {
    fn default() -> Self {
        Self::new()
    }
}

fn event_session(event: &HubEvent) -> Option<SessionId> {
    match event {
        HubEvent::SessionActivated { session_id, .. }
        | HubEvent::SessionCompleted { session_id, .. }
        | HubEvent::SessionFailed { session_id }
        | HubEvent::NeedsInputChanged { session_id, .. } => Some(session_id.clone()),
        HubEvent::QueueChanged { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_attach_receive_detach() {
        let gateway = Gateway::new();
        let sid = SessionId::from("s1");

        let (client_id, mut rx) = gateway.attach(sid.clone(), ChannelKind::AgentTerminal, vec![]);
        assert!(gateway.has_clients(&sid, ChannelKind::AgentTerminal));

        gateway.agent_data(&sid, b"hello");
        match rx.recv().await {
            Some(ServerFrame::Output { .. }) => {}
            other => panic!("expected output frame, got {:?}", other),
        }

        gateway.detach(&sid, ChannelKind::AgentTerminal, client_id);
        assert!(!gateway.has_clients(&sid, ChannelKind::AgentTerminal));
    }

    #[tokio::test]
    async fn test_fanout_reaches_all_clients_in_order() {
        let gateway = Gateway::new();
        let sid = SessionId::from("s1");

        let (_a, mut rx_a) = gateway.attach(sid.clone(), ChannelKind::AgentTerminal, vec![]);
        let (_b, mut rx_b) = gateway.attach(sid.clone(), ChannelKind::AgentTerminal, vec![]);

        gateway.agent_data(&sid, b"one");
        gateway.agent_data(&sid, b"two");

        for rx in [&mut rx_a, &mut rx_b] {
            let frames: Vec<String> = [rx.recv().await, rx.recv().await]
                .into_iter()
                .map(|f| match f {
                    Some(ServerFrame::Output { data }) => data,
                    other => panic!("expected output, got {:?}", other),
                })
                .collect();
            assert_eq!(frames.len(), 2);
            use base64::Engine as _;
            let first = base64::engine::general_purpose::STANDARD
                .decode(&frames[0])
                .unwrap();
            assert_eq!(first, b"one");
        }
    }

    #[tokio::test]
    async fn test_slow_client_is_detached_not_blocking() {
        let gateway = Gateway::new();
        let sid = SessionId::from("s1");

        // Attach and never read: the queue fills, then the client drops.
        let (slow_id, _rx) = gateway.attach(sid.clone(), ChannelKind::AgentTerminal, vec![]);
        let _ = slow_id;

        for _ in 0..(CLIENT_QUEUE_CAPACITY + 8) {
            gateway.agent_data(&sid, b"chunk");
        }

        assert!(!gateway.has_clients(&sid, ChannelKind::AgentTerminal));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_subscriber() {
        let gateway = Gateway::new();
        let mut events = gateway.subscribe();

        gateway.broadcast(HubEvent::SessionFailed {
            session_id: SessionId::from("s1"),
        });

        match events.recv().await {
            Ok(HubEvent::SessionFailed { session_id }) => {
                assert_eq!(session_id.as_str(), "s1")
            }
            other => panic!("expected failure event, got {:?}", other),
        }
    }
}
