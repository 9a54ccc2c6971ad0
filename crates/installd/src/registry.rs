//! Attached connections and event fan-out.
//!
//! Each connection owns a bounded outbox drained by its socket writer.
//! Broadcasts never wait: a connection whose outbox is full or closed is
//! evicted, its socket is closed, and the client resyncs on reconnect.

use chrono::{DateTime, Utc};
use installer_common::{EventEnvelope, ServerMessage};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, warn};

use crate::auth::{PeerIdentity, Verdict};

/// A front-end connection. Carries no authority of its own.
#[derive(Debug, Clone)]
pub struct ClientConnection {
    pub id: u64,
    pub identity: PeerIdentity,
    pub verdict: Verdict,
    pub attached_at: DateTime<Utc>,
}

/// Sending side of a connection's frame queue.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<ServerMessage>,
    evicted: Arc<watch::Sender<bool>>,
}

impl Outbox {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (evicted, _) = watch::channel(false);
        (
            Self {
                tx,
                evicted: Arc::new(evicted),
            },
            rx,
        )
    }

    pub fn try_send(&self, message: ServerMessage) -> Result<(), TrySendError<ServerMessage>> {
        self.tx.try_send(message)
    }

    /// Queue a frame, waiting for room. Returns false if the connection is
    /// gone or has been evicted.
    pub async fn send(&self, message: ServerMessage) -> bool {
        tokio::select! {
            sent = self.tx.send(message) => sent.is_ok(),
            _ = self.evicted() => false,
        }
    }

    pub fn evict(&self) {
        self.evicted.send_replace(true);
    }

    /// Handle that can evict the connection without keeping its queue open.
    pub fn evictor(&self) -> Evictor {
        Evictor(Arc::clone(&self.evicted))
    }

    pub fn is_evicted(&self) -> bool {
        *self.evicted.borrow()
    }

    /// Resolves once the connection has been evicted.
    pub async fn evicted(&self) {
        let mut rx = self.evicted.subscribe();
        let _ = rx.wait_for(|evicted| *evicted).await;
    }
}

/// Eviction switch of one connection, held by its socket writer.
#[derive(Debug, Clone)]
pub struct Evictor(Arc<watch::Sender<bool>>);

impl Evictor {
    pub fn evict(&self) {
        self.0.send_replace(true);
    }
}

struct Attached {
    connection: ClientConnection,
    outbox: Outbox,
}

/// Zero-or-more attached connections.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    connections: Arc<RwLock<HashMap<u64, Attached>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a connection to broadcasts. Only the orchestrator calls
    /// this, between events, so the connection's snapshot and its first
    /// event line up.
    pub(crate) async fn attach(&self, connection: ClientConnection, outbox: Outbox) {
        debug!(conn = connection.id, "Attaching connection");
        self.connections
            .write()
            .await
            .insert(connection.id, Attached { connection, outbox });
    }

    /// Idempotent. Returns whether the connection was attached.
    pub async fn detach(&self, id: u64) -> bool {
        self.connections.write().await.remove(&id).is_some()
    }

    /// Deliver an event to every attached connection without waiting.
    /// Returns the number of connections that received it.
    pub async fn broadcast(&self, envelope: &EventEnvelope) -> usize {
        let mut delivered = 0;
        let mut failed = Vec::new();
        {
            let connections = self.connections.read().await;
            for (id, attached) in connections.iter() {
                match attached
                    .outbox
                    .try_send(ServerMessage::Event(envelope.clone()))
                {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => failed.push((*id, "outbox full")),
                    Err(TrySendError::Closed(_)) => failed.push((*id, "connection closed")),
                }
            }
        }

        if !failed.is_empty() {
            let mut connections = self.connections.write().await;
            for (id, why) in failed {
                if let Some(attached) = connections.remove(&id) {
                    warn!(
                        conn = id,
                        uid = attached.connection.identity.uid,
                        seq = envelope.seq,
                        "Evicting connection: {}",
                        why
                    );
                    attached.outbox.evict();
                }
            }
        }
        delivered
    }

    pub async fn connections(&self) -> Vec<ClientConnection> {
        let mut list: Vec<ClientConnection> = self
            .connections
            .read()
            .await
            .values()
            .map(|a| a.connection.clone())
            .collect();
        list.sort_by_key(|c| c.id);
        list
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use installer_common::{Event, InstallState};

    fn connection(id: u64) -> ClientConnection {
        ClientConnection {
            id,
            identity: PeerIdentity {
                uid: 1000,
                gid: 1000,
                pid: None,
            },
            verdict: Verdict {
                allowed: true,
                reason: "test".to_string(),
            },
            attached_at: Utc::now(),
        }
    }

    fn envelope(seq: u64) -> EventEnvelope {
        EventEnvelope {
            seq,
            session_id: None,
            timestamp: Utc::now(),
            event: Event::SessionStateChanged {
                state: InstallState::Running,
            },
        }
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_in_order() {
        let registry = SessionRegistry::new();
        let (a, mut rx_a) = Outbox::channel(8);
        let (b, mut rx_b) = Outbox::channel(8);
        registry.attach(connection(1), a).await;
        registry.attach(connection(2), b).await;

        for seq in 1..=3 {
            assert_eq!(registry.broadcast(&envelope(seq)).await, 2);
        }
        for rx in [&mut rx_a, &mut rx_b] {
            for expected in 1..=3 {
                match rx.recv().await.unwrap() {
                    ServerMessage::Event(e) => assert_eq!(e.seq, expected),
                    other => panic!("unexpected {:?}", other),
                }
            }
        }
    }

    #[tokio::test]
    async fn test_full_outbox_is_evicted_without_blocking_others() {
        let registry = SessionRegistry::new();
        let (slow, _slow_rx) = Outbox::channel(1);
        let (fast, mut fast_rx) = Outbox::channel(8);
        registry.attach(connection(1), slow.clone()).await;
        registry.attach(connection(2), fast).await;

        registry.broadcast(&envelope(1)).await;
        assert_eq!(registry.broadcast(&envelope(2)).await, 1);

        assert!(slow.is_evicted());
        slow.evicted().await;
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.connections().await[0].id, 2);
        fast_rx.recv().await.unwrap();
        fast_rx.recv().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_outbox_is_evicted() {
        let registry = SessionRegistry::new();
        let (outbox, rx) = Outbox::channel(4);
        registry.attach(connection(7), outbox).await;
        drop(rx);
        assert_eq!(registry.broadcast(&envelope(1)).await, 0);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_detach_is_idempotent() {
        let registry = SessionRegistry::new();
        let (outbox, _rx) = Outbox::channel(4);
        registry.attach(connection(3), outbox).await;
        assert!(registry.detach(3).await);
        assert!(!registry.detach(3).await);
        assert_eq!(registry.broadcast(&envelope(1)).await, 0);
    }

    #[tokio::test]
    async fn test_evictor_evicts_outbox() {
        let (outbox, rx) = Outbox::channel(1);
        let evictor = outbox.evictor();
        drop(rx);
        evictor.evict();
        assert!(outbox.is_evicted());
        outbox.evicted().await;
    }

    #[tokio::test]
    async fn test_send_fails_after_eviction() {
        let (outbox, _rx) = Outbox::channel(1);
        assert!(outbox.send(ServerMessage::Event(envelope(1))).await);
        outbox.evict();
        // Queue is full and the connection is evicted: send gives up
        assert!(!outbox.send(ServerMessage::Event(envelope(2))).await);
    }
}
