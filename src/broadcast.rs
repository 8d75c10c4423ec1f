//! Broadcaster (C7): fans out events to connected WebSocket dashboard peers.
//!
//! Grounded on the teacher's `proxy/streaming.rs` for the "forward events
//! over a channel until the socket write fails" shape, but replaces its
//! single `tokio::broadcast` channel with a per-peer registry
//! (`HashMap<PeerId, mpsc::UnboundedSender<...>>`) so a failed send can be
//! attributed to, and evicted for, exactly one peer rather than dropping a
//! lagging receiver's entire backlog.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, RwLock};

use crate::model::Event;

pub type PeerId = u64;

/// Cloning is cheap — clones share the same underlying data via `Arc`.
#[derive(Clone)]
pub struct Broadcaster {
    peers: Arc<RwLock<HashMap<PeerId, mpsc::UnboundedSender<Value>>>>,
    next_id: Arc<AtomicU64>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            peers: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Registers a new peer and returns its id plus the receiving half of
    /// its outbound queue. The caller (the `/ws` handler) is responsible for
    /// draining the receiver onto the actual socket and calling
    /// `remove_peer` on disconnect.
    pub async fn register(&self) -> (PeerId, mpsc::UnboundedReceiver<Value>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers.write().await.insert(id, tx);
        (id, rx)
    }

    pub async fn remove_peer(&self, id: PeerId) {
        self.peers.write().await.remove(&id);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Sends a one-shot greeting to a single newly-connected peer. Does not
    /// go through `broadcast` since it targets exactly one peer.
    pub async fn send_to(&self, id: PeerId, event_type: &str, data: Value) {
        let envelope = Event::new(event_type, data);
        let envelope = serde_json::to_value(&envelope).unwrap_or(Value::Null);
        let peers = self.peers.read().await;
        if let Some(tx) = peers.get(&id) {
            let _ = tx.send(envelope);
        }
    }

    /// Fans `{type, data, timestamp}` out to every connected peer, pruning
    /// any whose send fails (SPEC_FULL §4.6, §8 testable property 7).
    pub async fn broadcast(&self, event_type: &str, data: Value) {
        let peers = self.peers.read().await;
        if peers.is_empty() {
            return;
        }
        let envelope = Event::new(event_type, data);
        let envelope = match serde_json::to_value(&envelope) {
            Ok(v) => v,
            Err(_) => return,
        };
        let mut failed = Vec::new();
        for (id, tx) in peers.iter() {
            if tx.send(envelope.clone()).is_err() {
                failed.push(*id);
            }
        }
        drop(peers);
        if !failed.is_empty() {
            let mut peers = self.peers.write().await;
            for id in failed {
                peers.remove(&id);
            }
        }
    }

    /// Shutdown tail (C7): tell connected peers the server is going away,
    /// then drop every sender so each peer's read loop sees the channel
    /// close and exits instead of hanging on a socket nobody will write to
    /// again.
    pub async fn shutdown(&self) {
        self.broadcast("server_shutdown", Value::Null).await;
        self.peers.write().await.clear();
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}
