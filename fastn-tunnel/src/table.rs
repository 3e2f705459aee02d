//! Live tunnels, indexed by connection id and by local socket.
//!
//! The table also owns the set of local sockets the event loop waits on.
//! Inserting or removing a tunnel updates both indices and that set in the
//! same call, so the loop never polls a socket the table has forgotten.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;

use bytes::Bytes;
use fastn_tunnel_net::PeerId;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_stream::{Stream, StreamExt, StreamMap};

use crate::frame::FrameBuf;

/// Random draws before [`TunnelTable::allocate_id`] falls back to a scan.
const RANDOM_ATTEMPTS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u16);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle for one local socket. Never reused within a table, so an event
/// from a socket that has already been removed cannot reach a newer tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketToken(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TableError {
    #[error("all 65536 connection ids are in use")]
    Full,

    #[error("connection id {0} is already in use")]
    DuplicateId(ConnectionId),
}

/// Why bytes could not be queued for a local socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("local socket is {0} writes behind")]
    Backlog(usize),

    #[error("local socket writer has stopped")]
    Stopped,
}

/// What happened on a tunnel's local socket.
#[derive(Debug)]
pub enum SocketEvent {
    /// Bytes read from the socket, already placed in a frame payload.
    Data(FrameBuf),
    Closed,
    ReadFailed(io::Error),
    WriteFailed(io::Error),
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type SocketStream = Pin<Box<dyn Stream<Item = SocketEvent> + Send>>;

/// The local end of a tunnel: a TCP connection or the process's stdio.
pub struct TunnelIo {
    reader: BoxedReader,
    writer: BoxedWriter,
}

impl TunnelIo {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    pub fn tcp(stream: tokio::net::TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self::new(reader, writer)
    }

    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }
}

impl std::fmt::Debug for TunnelIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TunnelIo")
    }
}

#[derive(Debug)]
pub struct Tunnel {
    pub id: ConnectionId,
    pub token: SocketToken,
    /// The only peer allowed to send data to or close this tunnel.
    pub owner: PeerId,
    outbound: mpsc::Sender<Bytes>,
}

impl Tunnel {
    /// Queue bytes for the local socket without waiting.
    ///
    /// Fails with [`QueueError::Backlog`] when the socket has not drained
    /// the writes already queued, and with [`QueueError::Stopped`] once the
    /// writer has exited; the failure that stopped it is reported separately
    /// as [`SocketEvent::WriteFailed`].
    pub fn write(&self, bytes: Bytes) -> Result<(), QueueError> {
        self.outbound.try_send(bytes).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => QueueError::Backlog(self.outbound.max_capacity()),
            mpsc::error::TrySendError::Closed(_) => QueueError::Stopped,
        })
    }
}

pub struct TunnelTable {
    by_id: HashMap<ConnectionId, SocketToken>,
    by_socket: HashMap<SocketToken, Tunnel>,
    readers: StreamMap<SocketToken, SocketStream>,
    writers: JoinSet<()>,
    write_failures_tx: mpsc::UnboundedSender<(SocketToken, io::Error)>,
    write_failures: mpsc::UnboundedReceiver<(SocketToken, io::Error)>,
    next_token: u64,
    chunk_size: usize,
    queue_depth: usize,
}

impl TunnelTable {
    /// `chunk_size` bounds a single socket read, and so the payload of one
    /// `TcpData` frame. `queue_depth` bounds the writes each tunnel may
    /// hold for its socket.
    pub fn new(chunk_size: usize, queue_depth: usize) -> Self {
        let (write_failures_tx, write_failures) = mpsc::unbounded_channel();
        Self {
            by_id: HashMap::new(),
            by_socket: HashMap::new(),
            readers: StreamMap::new(),
            writers: JoinSet::new(),
            write_failures_tx,
            write_failures,
            next_token: 0,
            chunk_size,
            queue_depth: queue_depth.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.by_socket.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_socket.is_empty()
    }

    /// Pick a free connection id.
    ///
    /// Random draws keep ids hard to guess; once those keep colliding, a
    /// wrapping scan from a random start settles it.
    pub fn allocate_id(&self) -> Result<ConnectionId, TableError> {
        let mut rng = rand::thread_rng();

        for _ in 0..RANDOM_ATTEMPTS {
            let id = ConnectionId(rng.r#gen());
            if !self.by_id.contains_key(&id) {
                return Ok(id);
            }
        }

        let start: u16 = rng.r#gen();
        (0..=u16::MAX)
            .map(|offset| ConnectionId(start.wrapping_add(offset)))
            .find(|id| !self.by_id.contains_key(id))
            .ok_or(TableError::Full)
    }

    /// Create a tunnel under a freshly allocated id.
    pub fn create(&mut self, io: TunnelIo, owner: PeerId) -> Result<&Tunnel, TableError> {
        let id = self.allocate_id()?;
        self.insert(id, io, owner)
    }

    /// Create a tunnel under an id chosen elsewhere, i.e. by the acceptor.
    pub fn insert(
        &mut self,
        id: ConnectionId,
        io: TunnelIo,
        owner: PeerId,
    ) -> Result<&Tunnel, TableError> {
        if self.by_id.contains_key(&id) {
            return Err(TableError::DuplicateId(id));
        }

        let token = SocketToken(self.next_token);
        self.next_token += 1;

        let (outbound, queue) = mpsc::channel(self.queue_depth);
        self.writers.spawn(write_socket(
            io.writer,
            queue,
            token,
            self.write_failures_tx.clone(),
        ));
        self.readers
            .insert(token, read_socket(io.reader, self.chunk_size));
        self.by_id.insert(id, token);

        tracing::debug!("Tunnel {id} registered for {owner}");
        Ok(self.by_socket.entry(token).or_insert(Tunnel {
            id,
            token,
            owner,
            outbound,
        }))
    }

    pub fn get_by_id(&self, id: ConnectionId) -> Option<&Tunnel> {
        self.by_id.get(&id).and_then(|token| self.by_socket.get(token))
    }

    pub fn get_by_token(&self, token: SocketToken) -> Option<&Tunnel> {
        self.by_socket.get(&token)
    }

    /// Whether the event loop is waiting on this socket.
    pub fn is_polled(&self, token: SocketToken) -> bool {
        self.readers.contains_key(&token)
    }

    /// Remove a tunnel from both indices and stop reading its socket.
    ///
    /// The write half closes once the bytes already queued for it are
    /// flushed. A second call for the same token returns `None`.
    pub fn remove(&mut self, token: SocketToken) -> Option<Tunnel> {
        let tunnel = self.by_socket.remove(&token)?;
        self.by_id.remove(&tunnel.id);
        self.readers.remove(&token);
        Some(tunnel)
    }

    pub fn remove_by_id(&mut self, id: ConnectionId) -> Option<Tunnel> {
        let token = *self.by_id.get(&id)?;
        self.remove(token)
    }

    /// Wait for the next event on any live socket.
    ///
    /// Pending forever while there is nothing to wait on, which keeps this
    /// usable as a `select!` branch.
    pub async fn next_event(&mut self) -> (SocketToken, SocketEvent) {
        loop {
            tokio::select! {
                Some((token, event)) = self.readers.next(), if !self.readers.is_empty() => {
                    if self.by_socket.contains_key(&token) {
                        return (token, event);
                    }
                }
                Some((token, e)) = self.write_failures.recv() => {
                    if self.by_socket.contains_key(&token) {
                        return (token, SocketEvent::WriteFailed(e));
                    }
                }
            }
        }
    }

    /// Collect writer tasks that have finished.
    pub fn reap(&mut self) {
        while self.writers.try_join_next().is_some() {}
    }

    /// Drop every tunnel and give writers up to `grace` to flush what they
    /// still hold.
    pub async fn close_all(&mut self, grace: std::time::Duration) {
        self.by_id.clear();
        self.by_socket.clear();
        self.readers = StreamMap::new();

        let drain = async { while self.writers.join_next().await.is_some() {} };
        if tokio::time::timeout(grace, drain).await.is_err() {
            tracing::warn!("Gave up flushing {} local sockets", self.writers.len());
            self.writers.abort_all();
        }
    }
}

fn read_socket(mut reader: BoxedReader, chunk_size: usize) -> SocketStream {
    Box::pin(async_stream::stream! {
        loop {
            let mut frame = FrameBuf::new(chunk_size);
            match frame.read_payload(&mut reader).await {
                Ok(0) => {
                    yield SocketEvent::Closed;
                    break;
                }
                Ok(_) => yield SocketEvent::Data(frame),
                Err(e) => {
                    yield SocketEvent::ReadFailed(e);
                    break;
                }
            }
        }
    })
}

async fn write_socket(
    mut writer: BoxedWriter,
    mut queue: mpsc::Receiver<Bytes>,
    token: SocketToken,
    failures: mpsc::UnboundedSender<(SocketToken, io::Error)>,
) {
    while let Some(bytes) = queue.recv().await {
        let result = match writer.write_all(&bytes).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            let _ = failures.send((token, e));
            return;
        }
    }

    if let Err(e) = writer.shutdown().await {
        tracing::debug!("Closing local socket: {e}");
    }
}
