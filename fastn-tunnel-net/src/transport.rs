use crate::PeerId;

/// One message delivered by the transport.
#[derive(Debug, Clone)]
pub struct Inbound {
    /// Authenticated sender, supplied by the transport.
    pub peer: PeerId,
    pub message: bytes::Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("no link to peer {0}")]
    UnknownPeer(PeerId),

    #[error("message of {size} bytes exceeds transport limit of {max} bytes")]
    TooLarge { size: usize, max: usize },

    #[error("link to peer {0} is closed")]
    Closed(PeerId),
}

/// Reliable, ordered, authenticated, peer-addressed message channel.
///
/// The tunnel event loop is the only caller. `send` must not wait on the
/// network: implementations queue the message and return. `recv` is awaited
/// by the loop alongside socket readiness and replaces a receive callback.
pub trait Transport: Send {
    /// Largest message `send` accepts and `recv` can deliver.
    fn max_message_size(&self) -> usize;

    fn send(&mut self, peer: &PeerId, message: bytes::Bytes) -> Result<(), SendError>;

    /// Next inbound message, or `None` once the transport is shut down.
    fn recv(&mut self) -> impl Future<Output = Option<Inbound>> + Send;

    /// Called on every scheduler tick.
    fn tick(&mut self) {}
}
