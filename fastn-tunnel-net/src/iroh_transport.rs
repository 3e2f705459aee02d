//! [`Transport`] over iroh.
//!
//! Each peer gets one connection and one bidirectional stream. Link tasks
//! (reader, writer, accept loop) report to the owner through a single channel
//! so that "link up" is always observed before that link's first message.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;

use crate::{Inbound, PeerId, SendError, Transport};

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

struct Link {
    id: u64,
    outbound: mpsc::UnboundedSender<Bytes>,
}

enum LinkEvent {
    Up {
        peer: PeerId,
        id: u64,
        outbound: mpsc::UnboundedSender<Bytes>,
    },
    Message(Inbound),
    Down {
        peer: PeerId,
        id: u64,
    },
}

pub struct IrohTransport {
    endpoint: iroh::Endpoint,
    links: HashMap<PeerId, Link>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    events_rx: mpsc::UnboundedReceiver<LinkEvent>,
    accept_task: Option<tokio::task::JoinHandle<()>>,
    max_message_size: usize,
}

impl IrohTransport {
    pub fn new(endpoint: iroh::Endpoint) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            endpoint,
            links: HashMap::new(),
            events_tx,
            events_rx,
            accept_task: None,
            max_message_size: crate::MAX_MESSAGE_SIZE,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::from(self.endpoint.node_id())
    }

    /// Start accepting links from other peers.
    ///
    /// With `allowed` set, connections from any peer outside the set are
    /// closed right after the handshake.
    pub fn listen(&mut self, allowed: Option<HashSet<PeerId>>) {
        if self.accept_task.is_some() {
            return;
        }

        let endpoint = self.endpoint.clone();
        let events = self.events_tx.clone();
        let allowed = allowed.map(Arc::new);
        let max = self.max_message_size;

        self.accept_task = Some(tokio::spawn(async move {
            while let Some(incoming) = endpoint.accept().await {
                let events = events.clone();
                let allowed = allowed.clone();
                tokio::spawn(async move {
                    if let Err(e) = accept_link(incoming, allowed.as_deref(), events, max).await {
                        tracing::warn!("Incoming link failed: {e:?}");
                    }
                });
            }
            tracing::info!("Endpoint closed, no more incoming links");
        }));
    }

    /// Open a link to `peer`. A no-op if one is already up.
    #[tracing::instrument(skip(self))]
    pub async fn connect(&mut self, peer: &PeerId) -> eyre::Result<()> {
        if self.links.contains_key(peer) {
            return Ok(());
        }

        let conn = self
            .endpoint
            .connect(peer.to_node_id()?, crate::APNS_TUNNEL)
            .await?;
        let (send, recv) = conn.open_bi().await?;

        let id = NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed);
        let (outbound, queue) = mpsc::unbounded_channel();
        self.links.insert(*peer, Link { id, outbound });

        tokio::spawn(write_link(send, queue));
        tokio::spawn(read_link(
            conn,
            recv,
            *peer,
            id,
            self.events_tx.clone(),
            self.max_message_size,
        ));

        tracing::info!("Link to {peer} is up");
        Ok(())
    }
}

impl Drop for IrohTransport {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

impl Transport for IrohTransport {
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

        let link = self.links.get(peer).ok_or(SendError::UnknownPeer(*peer))?;
        if link.outbound.send(message).is_err() {
            self.links.remove(peer);
            return Err(SendError::Closed(*peer));
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<Inbound> {
        loop {
            match self.events_rx.recv().await? {
                LinkEvent::Up { peer, id, outbound } => {
                    tracing::info!("Link from {peer} is up");
                    self.links.insert(peer, Link { id, outbound });
                }
                LinkEvent::Down { peer, id } => {
                    if self.links.get(&peer).is_some_and(|link| link.id == id) {
                        tracing::info!("Link to {peer} is down");
                        self.links.remove(&peer);
                    }
                }
                LinkEvent::Message(inbound) => return Some(inbound),
            }
        }
    }
}

async fn accept_link(
    incoming: iroh::endpoint::Incoming,
    allowed: Option<&HashSet<PeerId>>,
    events: mpsc::UnboundedSender<LinkEvent>,
    max_message_size: usize,
) -> eyre::Result<()> {
    let conn = incoming.await?;
    let peer = PeerId::from(conn.remote_node_id()?);

    if allowed.is_some_and(|set| !set.contains(&peer)) {
        tracing::warn!("Rejecting link from {peer}: not in allow list");
        conn.close(1u8.into(), b"not allowed");
        return Ok(());
    }

    let (send, recv) = conn.accept_bi().await?;

    let id = NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed);
    let (outbound, queue) = mpsc::unbounded_channel();
    events
        .send(LinkEvent::Up { peer, id, outbound })
        .map_err(|_| eyre::anyhow!("transport dropped"))?;

    tokio::spawn(write_link(send, queue));
    read_link(conn, recv, peer, id, events, max_message_size).await;
    Ok(())
}

async fn write_link(mut send: iroh::endpoint::SendStream, mut queue: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(message) = queue.recv().await {
        let len = (message.len() as u32).to_be_bytes();
        if let Err(e) = send.write_all(&len).await {
            tracing::warn!("Link write failed: {e}");
            return;
        }
        if let Err(e) = send.write_all(&message).await {
            tracing::warn!("Link write failed: {e}");
            return;
        }
    }
    let _ = send.finish();
}

async fn read_link(
    conn: iroh::endpoint::Connection,
    recv: iroh::endpoint::RecvStream,
    peer: PeerId,
    id: u64,
    events: mpsc::UnboundedSender<LinkEvent>,
    max_message_size: usize,
) {
    let codec = tokio_util::codec::LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(max_message_size)
        .new_codec();
    let mut reader = tokio_util::codec::FramedRead::new(recv, codec);

    while let Some(message) = reader.next().await {
        match message {
            Ok(message) => {
                let inbound = Inbound {
                    peer,
                    message: message.freeze(),
                };
                if events.send(LinkEvent::Message(inbound)).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!("Dropping link to {peer}: {e}");
                break;
            }
        }
    }

    let _ = events.send(LinkEvent::Down { peer, id });
    conn.close(0u8.into(), b"done");
}
