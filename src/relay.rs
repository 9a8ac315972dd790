//! Stateless fan-out broker.
//!
//! Every message handed to [`Relay::send`] is delivered, unmodified, to every
//! other participant joined at that moment. There are no rooms and nothing is
//! buffered for late joiners. The receiver returned by [`Relay::join`] is the
//! participant's inbound message stream.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RelayHandle(Uuid);

impl fmt::Display for RelayHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// DashMap keeps insert/remove/iterate safe across worker threads.
type PeerMap<M> = Arc<DashMap<RelayHandle, mpsc::UnboundedSender<M>>>;

pub struct Relay<M> {
    peers: PeerMap<M>,
}

impl<M> Clone for Relay<M> {
    fn clone(&self) -> Self {
        Self {
            peers: self.peers.clone(),
        }
    }
}

impl<M> Default for Relay<M> {
    fn default() -> Self {
        Self {
            peers: Arc::new(DashMap::new()),
        }
    }
}

impl<M: Clone> Relay<M> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self) -> (RelayHandle, mpsc::UnboundedReceiver<M>) {
        let handle = RelayHandle(Uuid::new_v4());
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers.insert(handle, tx);
        debug!(connection = %handle, peers = self.peers.len(), "joined relay");
        (handle, rx)
    }

    /// Broadcast to everyone but `from`. Returns how many peers took the message.
    pub fn send(&self, from: &RelayHandle, message: M) -> usize {
        if !self.peers.contains_key(from) {
            trace!(connection = %from, "dropping message from departed connection");
            return 0;
        }

        let mut delivered = 0;
        let mut gone = Vec::new();
        for peer in self.peers.iter() {
            if peer.key() == from {
                continue;
            }
            if peer.value().send(message.clone()).is_ok() {
                delivered += 1;
            } else {
                gone.push(*peer.key());
            }
        }

        // Removing while iterating would deadlock on the shard guard.
        for handle in gone {
            self.peers.remove(&handle);
            debug!(connection = %handle, "pruned closed connection");
        }
        delivered
    }

    pub fn leave(&self, handle: &RelayHandle) -> bool {
        let removed = self.peers.remove(handle).is_some();
        if removed {
            debug!(connection = %handle, peers = self.peers.len(), "left relay");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
