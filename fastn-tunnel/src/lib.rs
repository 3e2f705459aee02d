//! # fastn-tunnel
//!
//! Forward TCP connections between two peers on the fastn P2P network.
//!
//! One side runs as the **acceptor**: when a peer asks it to reach
//! `host:port`, it connects there and relays bytes. The other side runs as
//! the **requester**: it accepts local connections (or uses stdin/stdout)
//! and asks the acceptor for one tunnel per connection.
//!
//! ```text
//!  local client ──TCP──▶ requester ══ frames over Transport ══▶ acceptor ──TCP──▶ host:port
//! ```
//!
//! Everything in one process runs on a single [`EventLoop`]: it waits on the
//! [`fastn_tunnel_net::Transport`], every tunnel's local socket, and a short
//! ticker, and hands each decoded [`frame::Frame`] to [`dispatch::dispatch`].
//! What a process does with tunnel requests and replies is decided by its
//! [`Role`].
//!
//! ## Example
//!
//! ```no_run
//! use fastn_tunnel::{Acceptor, EventLoop, TunnelConfig};
//! use fastn_tunnel_net::{IrohTransport, create_endpoint, load_or_create_key};
//!
//! # async fn serve(home: &std::path::Path) -> eyre::Result<()> {
//! let secret_key = load_or_create_key(home, "tunnel").await?;
//! let mut transport = IrohTransport::new(create_endpoint(secret_key).await?);
//! transport.listen(None);
//! EventLoop::new(transport, Acceptor, TunnelConfig::default())
//!     .run()
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod acceptor;
mod config;
pub mod dispatch;
pub mod error;
mod event_loop;
pub mod frame;
mod ping;
mod requester;
mod role;
pub mod table;

pub use acceptor::Acceptor;
pub use config::TunnelConfig;
pub use dispatch::{Context, LoopEvent};
pub use error::{Category, DispatchError, Violation};
pub use event_loop::EventLoop;
pub use ping::Pinger;
pub use requester::{LocalSource, Requester};
pub use role::{Flow, Role};
pub use table::{ConnectionId, TunnelIo, TunnelTable};
