//! Frame handling shared by every role.
//!
//! [`dispatch`] routes a decoded frame. Keep-alive and tunnel traffic
//! (`PING`, `TCP_DATA`, `TCP_FIN`) are handled here the same way whichever
//! side we are; tunnel setup and pong handling go to the [`Role`].

use std::io;
use std::net::SocketAddr;

use bytes::Bytes;
use fastn_tunnel_net::{PeerId, Transport};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::config::TunnelConfig;
use crate::error::{DispatchError, Violation};
use crate::frame::{self, Frame, FrameBuf, PacketType};
use crate::role::Role;
use crate::table::{ConnectionId, QueueError, TunnelTable};

/// Completion of work the loop handed off to a task.
#[derive(Debug)]
pub enum LoopEvent {
    /// An outbound connect made for `peer`'s tunnel request has finished.
    Connected {
        peer: PeerId,
        host: String,
        port: u16,
        result: io::Result<TcpStream>,
    },
    /// A client connected to the local forwarding listener.
    LocalConnection { stream: TcpStream, addr: SocketAddr },
}

/// Everything a handler may touch: the transport, the tunnel table and the
/// means to start background work whose result comes back as a
/// [`LoopEvent`].
pub struct Context<T> {
    pub transport: T,
    pub table: TunnelTable,
    pub config: TunnelConfig,
    events: mpsc::UnboundedSender<LoopEvent>,
    tasks: JoinSet<()>,
    max_message_size: usize,
}

impl<T: Transport> Context<T> {
    pub fn new(transport: T, config: TunnelConfig) -> (Self, mpsc::UnboundedReceiver<LoopEvent>) {
        let max_message_size = config.effective_max_message_size(transport.max_message_size());
        let (events, events_rx) = mpsc::unbounded_channel();
        let ctx = Self {
            transport,
            table: TunnelTable::new(
                frame::max_payload(max_message_size),
                config.write_queue_depth,
            ),
            config,
            events,
            tasks: JoinSet::new(),
            max_message_size,
        };
        (ctx, events_rx)
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    pub fn max_payload(&self) -> usize {
        frame::max_payload(self.max_message_size)
    }

    /// Encode and send a frame whose payload is already in hand.
    pub fn send_frame(
        &mut self,
        peer: &PeerId,
        packet_type: PacketType,
        connection_id: u16,
        payload: &[u8],
    ) -> Result<(), DispatchError> {
        let bytes = FrameBuf::build(packet_type, connection_id, payload, self.max_payload())
            .map_err(|source| DispatchError::Encode {
                packet_type,
                source,
            })?;
        self.send_encoded(peer, packet_type, bytes)
    }

    pub fn send_encoded(
        &mut self,
        peer: &PeerId,
        packet_type: PacketType,
        bytes: Bytes,
    ) -> Result<(), DispatchError> {
        tracing::trace!("Sending {packet_type} ({} bytes) to {peer}", bytes.len());
        self.transport
            .send(peer, bytes)
            .map_err(|source| DispatchError::Send {
                peer: *peer,
                packet_type,
                source,
            })
    }

    /// Sender half of the loop's event channel, for tasks started with
    /// [`Context::spawn`].
    pub fn events(&self) -> mpsc::UnboundedSender<LoopEvent> {
        self.events.clone()
    }

    /// Run `task` in the background. It is aborted when the loop stops.
    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(task);
    }

    pub fn tasks_in_flight(&self) -> usize {
        self.tasks.len()
    }

    pub(crate) fn reap(&mut self) {
        while self.tasks.try_join_next().is_some() {}
        self.table.reap();
    }

    pub(crate) async fn shutdown(&mut self) {
        self.tasks.shutdown().await;
        self.table.close_all(self.config.shutdown_grace).await;
    }
}

/// Route one decoded frame.
pub fn dispatch<T: Transport, R: Role>(
    ctx: &mut Context<T>,
    role: &mut R,
    frame: &Frame<'_>,
) -> Result<(), DispatchError> {
    tracing::debug!(
        "Got {} for {} ({} bytes) from {}",
        frame.packet_type,
        frame.connection_id,
        frame.payload.len(),
        frame.origin
    );

    match frame.packet_type {
        PacketType::Ping => handle_ping(ctx, frame),
        PacketType::Pong => role.on_pong(ctx, frame),
        PacketType::TcpData => handle_tcp_data(ctx, role, frame),
        PacketType::TcpFin => handle_tcp_fin(ctx, role, frame),
        PacketType::RequestTunnel => role.on_request_tunnel(ctx, frame),
        PacketType::AckTunnel => role.on_ack_tunnel(ctx, frame),
        PacketType::RejectTunnel => role.on_reject_tunnel(ctx, frame),
    }
}

fn handle_ping<T: Transport>(ctx: &mut Context<T>, frame: &Frame<'_>) -> Result<(), DispatchError> {
    ctx.send_frame(
        &frame.origin,
        PacketType::Pong,
        frame.connection_id,
        frame.payload,
    )
}

fn handle_tcp_data<T: Transport, R: Role>(
    ctx: &mut Context<T>,
    role: &mut R,
    frame: &Frame<'_>,
) -> Result<(), DispatchError> {
    let id = ConnectionId(frame.connection_id);
    let tunnel = ctx.table.get_by_id(id).ok_or(DispatchError::LookupMiss {
        peer: frame.origin,
        packet_type: frame.packet_type,
        id,
    })?;

    if tunnel.owner != frame.origin {
        return Err(DispatchError::violation(
            frame.origin,
            Violation::NotOwner {
                id,
                owner: tunnel.owner,
            },
        ));
    }

    if frame.payload.is_empty() {
        return Ok(());
    }

    match tunnel.write(Bytes::copy_from_slice(frame.payload)) {
        Ok(()) => {}
        Err(QueueError::Stopped) => {
            tracing::debug!("Tunnel {id} writer has stopped, dropping {} bytes", frame.payload.len());
        }
        Err(e @ QueueError::Backlog(_)) => {
            // the peer is sending faster than the local socket drains
            tracing::warn!("Tunnel {id}: {e}, closing it and sending FIN to {}", frame.origin);
            if let Err(fin) = ctx.send_frame(&frame.origin, PacketType::TcpFin, id.0, &[]) {
                fin.report();
            }
            if let Some(tunnel) = ctx.table.remove_by_id(id) {
                role.on_tunnel_closed(ctx, &tunnel);
            }
        }
    }
    Ok(())
}

fn handle_tcp_fin<T: Transport, R: Role>(
    ctx: &mut Context<T>,
    role: &mut R,
    frame: &Frame<'_>,
) -> Result<(), DispatchError> {
    let id = ConnectionId(frame.connection_id);
    let tunnel = ctx.table.get_by_id(id).ok_or(DispatchError::LookupMiss {
        peer: frame.origin,
        packet_type: frame.packet_type,
        id,
    })?;

    if tunnel.owner != frame.origin {
        return Err(DispatchError::violation(
            frame.origin,
            Violation::NotOwner {
                id,
                owner: tunnel.owner,
            },
        ));
    }

    if let Some(tunnel) = ctx.table.remove_by_id(id) {
        tracing::info!("Deleting tunnel {id} on request of {}", frame.origin);
        role.on_tunnel_closed(ctx, &tunnel);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::decode;
    use crate::table::TunnelIo;
    use fastn_tunnel_net::MemoryTransport;
    use tokio::io::AsyncReadExt;

    struct Passive;
    impl Role for Passive {
        const NAME: &'static str = "test role";
    }

    struct Fixture {
        ctx: Context<MemoryTransport>,
        owner: MemoryTransport,
        stranger: MemoryTransport,
    }

    fn fixture() -> Fixture {
        fixture_with(TunnelConfig::default())
    }

    fn fixture_with(config: TunnelConfig) -> Fixture {
        let mut local = MemoryTransport::new(PeerId::from_bytes([1; 32]));
        let mut owner = MemoryTransport::new(PeerId::from_bytes([2; 32]));
        let mut stranger = MemoryTransport::new(PeerId::from_bytes([3; 32]));
        local.connect(&mut owner);
        local.connect(&mut stranger);
        let (ctx, _events) = Context::new(local, config);
        Fixture {
            ctx,
            owner,
            stranger,
        }
    }

    fn frame(packet_type: PacketType, connection_id: u16, payload: &[u8], origin: PeerId) -> Frame<'_> {
        Frame {
            packet_type,
            connection_id,
            payload,
            origin,
        }
    }

    fn open_tunnel(f: &mut Fixture) -> (ConnectionId, tokio::io::DuplexStream) {
        let (local, remote) = tokio::io::duplex(1024);
        let (r, w) = tokio::io::split(local);
        let id = f
            .ctx
            .table
            .create(TunnelIo::new(r, w), f.owner.peer_id())
            .unwrap()
            .id;
        (id, remote)
    }

    #[tokio::test]
    async fn test_ping_is_echoed_as_pong() {
        let mut f = fixture();
        let ping = frame(PacketType::Ping, 0, b"nonce", f.owner.peer_id());
        dispatch(&mut f.ctx, &mut Passive, &ping).unwrap();

        let reply = f.owner.try_recv().unwrap();
        let pong = decode(&reply.message, reply.peer, f.ctx.max_message_size()).unwrap();
        assert_eq!(pong.packet_type, PacketType::Pong);
        assert_eq!(pong.payload, b"nonce");
    }

    #[tokio::test]
    async fn test_data_for_unknown_tunnel_is_lookup_miss() {
        let mut f = fixture();
        let (id, mut remote) = open_tunnel(&mut f);
        let other = ConnectionId(id.0.wrapping_add(1));

        let data = frame(PacketType::TcpData, other.0, b"lost", f.owner.peer_id());
        let err = dispatch(&mut f.ctx, &mut Passive, &data).unwrap_err();
        assert!(matches!(err, DispatchError::LookupMiss { id, .. } if id == other));

        // nothing reached the live tunnel's socket
        drop(f.ctx.table.remove_by_id(id));
        let mut received = Vec::new();
        remote.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn test_data_from_owner_reaches_socket() {
        let mut f = fixture();
        let (id, mut remote) = open_tunnel(&mut f);

        let data = frame(PacketType::TcpData, id.0, b"GET / HTTP/1.0\r\n\r\n", f.owner.peer_id());
        dispatch(&mut f.ctx, &mut Passive, &data).unwrap();

        let mut buf = [0u8; 18];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GET / HTTP/1.0\r\n\r\n");
    }

    #[tokio::test]
    async fn test_socket_falling_behind_closes_tunnel() {
        let mut f = fixture_with(TunnelConfig {
            write_queue_depth: 2,
            ..Default::default()
        });
        let (id, mut remote) = open_tunnel(&mut f);
        let owner = f.owner.peer_id();

        // nothing drains the socket until this test awaits
        for chunk in [&b"one "[..], b"two "] {
            dispatch(&mut f.ctx, &mut Passive, &frame(PacketType::TcpData, id.0, chunk, owner)).unwrap();
        }
        assert!(f.owner.try_recv().is_none());

        let overflow = frame(PacketType::TcpData, id.0, b"three", owner);
        dispatch(&mut f.ctx, &mut Passive, &overflow).unwrap();
        assert!(f.ctx.table.get_by_id(id).is_none());

        let reply = f.owner.try_recv().unwrap();
        let fin = decode(&reply.message, reply.peer, f.ctx.max_message_size()).unwrap();
        assert_eq!((fin.packet_type, fin.connection_id), (PacketType::TcpFin, id.0));

        // what was queued before the overflow still arrives, then EOF
        let mut received = Vec::new();
        remote.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"one two ");
    }

    #[tokio::test]
    async fn test_data_from_stranger_is_refused() {
        let mut f = fixture();
        let (id, _remote) = open_tunnel(&mut f);

        let data = frame(PacketType::TcpData, id.0, b"inject", f.stranger.peer_id());
        let err = dispatch(&mut f.ctx, &mut Passive, &data).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::ProtocolViolation {
                violation: Violation::NotOwner { .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_fin_from_stranger_leaves_tunnel_polled() {
        let mut f = fixture();
        let (id, _remote) = open_tunnel(&mut f);
        let token = f.ctx.table.get_by_id(id).unwrap().token;

        let fin = frame(PacketType::TcpFin, id.0, b"", f.stranger.peer_id());
        assert!(dispatch(&mut f.ctx, &mut Passive, &fin).is_err());
        assert!(f.ctx.table.get_by_id(id).is_some());
        assert!(f.ctx.table.is_polled(token));
    }

    #[tokio::test]
    async fn test_fin_from_owner_closes_socket() {
        let mut f = fixture();
        let (id, mut remote) = open_tunnel(&mut f);
        let token = f.ctx.table.get_by_id(id).unwrap().token;

        let fin = frame(PacketType::TcpFin, id.0, b"", f.owner.peer_id());
        dispatch(&mut f.ctx, &mut Passive, &fin).unwrap();
        assert!(f.ctx.table.get_by_id(id).is_none());
        assert!(f.ctx.table.get_by_token(token).is_none());
        assert!(!f.ctx.table.is_polled(token));

        let mut received = Vec::new();
        remote.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());

        let again = dispatch(&mut f.ctx, &mut Passive, &fin).unwrap_err();
        assert!(matches!(again, DispatchError::LookupMiss { .. }));
    }

    #[tokio::test]
    async fn test_role_packets_default_to_violation() {
        let mut f = fixture();
        for packet_type in [
            PacketType::RequestTunnel,
            PacketType::AckTunnel,
            PacketType::RejectTunnel,
            PacketType::Pong,
        ] {
            let unexpected = frame(packet_type, 80, b"example.com", f.owner.peer_id());
            let err = dispatch(&mut f.ctx, &mut Passive, &unexpected).unwrap_err();
            assert!(matches!(
                err,
                DispatchError::ProtocolViolation {
                    violation: Violation::UnexpectedPacket { .. },
                    ..
                }
            ));
        }
        assert!(f.ctx.table.is_empty());
        assert!(f.owner.try_recv().is_none());
    }
}
