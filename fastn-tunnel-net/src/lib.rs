//! # fastn-tunnel-net
//!
//! Peer identity and message transport used by `fastn-tunnel`.
//!
//! Every peer on the network is identified by an ID52 - the 52-character
//! BASE32_DNSSEC encoding of its Ed25519 public key. The tunnel core never
//! talks to iroh directly; it sees a [`Transport`]: a reliable, ordered,
//! authenticated, peer-addressed message channel with a bounded message size.
//!
//! ```text
//! fastn-tunnel core
//!     │  send(peer, bytes) / recv() -> (peer, bytes) / tick()
//!     ▼
//! Transport ── IrohTransport   (one QUIC stream per peer, length-prefixed)
//!          └── MemoryTransport (in-process, used by tests)
//! ```
//!
//! ## Wire format between two endpoints
//!
//! Each peer pair shares a single iroh connection using the [`APNS_TUNNEL`]
//! ALPN and a single bidirectional stream. Every transport message is sent as
//! a 4-byte big-endian length followed by the message bytes. Ordering and
//! reliability come from QUIC; authentication comes from the TLS handshake
//! iroh performs against the peer's public key.

mod endpoint;
pub mod identity;
mod iroh_transport;
pub mod memory;
mod peer_id;
mod transport;

pub use endpoint::create_endpoint;
pub use iroh::SecretKey;
pub use identity::{IdentityError, load_or_create_key};
pub use iroh_transport::IrohTransport;
pub use memory::MemoryTransport;
pub use peer_id::{ParseId52Error, PeerId};
pub use transport::{Inbound, SendError, Transport};

/// Single ALPN protocol identifier for all tunnel connections.
pub const APNS_TUNNEL: &[u8] = b"/fastn/tunnel/0.1";

/// Largest message the iroh transport accepts, header included.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024;
