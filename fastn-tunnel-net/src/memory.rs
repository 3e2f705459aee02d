//! In-process [`Transport`] for tests and local experiments.
//!
//! ```
//! use fastn_tunnel_net::{MemoryTransport, PeerId, Transport};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let alice_id = PeerId::from_bytes([1; 32]);
//! let bob_id = PeerId::from_bytes([2; 32]);
//! let mut alice = MemoryTransport::new(alice_id);
//! let mut bob = MemoryTransport::new(bob_id);
//! alice.connect(&mut bob);
//!
//! alice.send(&bob_id, "hello".into()).unwrap();
//! let inbound = bob.recv().await.unwrap();
//! assert_eq!(inbound.peer, alice_id);
//! assert_eq!(&inbound.message[..], b"hello");
//! # }
//! ```

use std::collections::HashMap;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{Inbound, PeerId, SendError, Transport};

pub struct MemoryTransport {
    local: PeerId,
    peers: HashMap<PeerId, mpsc::UnboundedSender<Inbound>>,
    inbox_tx: mpsc::UnboundedSender<Inbound>,
    inbox: mpsc::UnboundedReceiver<Inbound>,
    max_message_size: usize,
}

impl MemoryTransport {
    pub fn new(local: PeerId) -> Self {
        Self::with_max_message_size(local, crate::MAX_MESSAGE_SIZE)
    }

    pub fn with_max_message_size(local: PeerId, max_message_size: usize) -> Self {
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        Self {
            local,
            peers: HashMap::new(),
            inbox_tx,
            inbox,
            max_message_size,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.local
    }

    /// Link two transports in both directions.
    pub fn connect(&mut self, other: &mut MemoryTransport) {
        self.peers.insert(other.local, other.inbox_tx.clone());
        other.peers.insert(self.local, self.inbox_tx.clone());
    }

    /// Forget the link to `peer`; later sends to it fail with `UnknownPeer`.
    pub fn disconnect(&mut self, peer: &PeerId) {
        self.peers.remove(peer);
    }

    /// Take a message that is already queued, without waiting.
    pub fn try_recv(&mut self) -> Option<Inbound> {
        self.inbox.try_recv().ok()
    }
}

impl Transport for MemoryTransport {
    fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    fn send(&mut self, peer: &PeerId, message: Bytes) -> Result<(), SendError> {
        if message.len() > self.max_message_size {
            return Err(SendError::TooLarge {
                size: message.len(),
                max: self.max_message_size,
            });
        }

        let inbox = self.peers.get(peer).ok_or(SendError::UnknownPeer(*peer))?;
        inbox
            .send(Inbound {
                peer: self.local,
                message,
            })
            .map_err(|_| SendError::Closed(*peer))
    }

    async fn recv(&mut self) -> Option<Inbound> {
        self.inbox.recv().await
    }
}
