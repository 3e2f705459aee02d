//! The client side: asks a remote acceptor to forward local connections to
//! a fixed `host:port`.
//!
//! Only one `REQUEST_TUNNEL` is in flight at a time. The wire format has no
//! request identifier, so an `ACK_TUNNEL` or `REJECT_TUNNEL` always answers
//! the oldest waiting local connection; others queue behind it.
//!
//! A request left unanswered for `request_timeout` counts as rejected and
//! the next connection in line is requested. Should its `ACK_TUNNEL` turn up
//! after all with nothing waiting, the acceptor gets a `TCP_FIN` for it.

use std::collections::VecDeque;

use fastn_tunnel_net::{PeerId, Transport};
use tokio::net::TcpListener;
use tokio::time::Instant;

use crate::dispatch::{Context, LoopEvent};
use crate::error::{DispatchError, Violation};
use crate::frame::{Frame, PacketType};
use crate::role::{Flow, Role};
use crate::table::{ConnectionId, Tunnel, TunnelIo};

/// Where local connections come from.
#[derive(Debug)]
pub enum LocalSource {
    /// Every client accepted on this listener gets its own tunnel.
    Listener(TcpListener),
    /// A single tunnel over stdin/stdout; the loop ends when it closes.
    Pipe,
    /// Caller-provided local end, one tunnel, ends like `Pipe`.
    Io(TunnelIo),
}

#[derive(Debug)]
pub struct Requester {
    remote: PeerId,
    host: String,
    port: u16,
    source: Option<LocalSource>,
    single: bool,
    waiting: VecDeque<TunnelIo>,
    /// When the outstanding `REQUEST_TUNNEL` went out.
    requested_at: Option<Instant>,
    opened: usize,
    finished: bool,
    failure: Option<String>,
}

impl Requester {
    pub fn new(remote: PeerId, host: impl Into<String>, port: u16, source: LocalSource) -> Self {
        let single = !matches!(source, LocalSource::Listener(_));
        Self {
            remote,
            host: host.into(),
            port,
            source: Some(source),
            single,
            waiting: VecDeque::new(),
            requested_at: None,
            opened: 0,
            finished: false,
            failure: None,
        }
    }

    /// Tunnels this requester has had acknowledged so far.
    pub fn opened(&self) -> usize {
        self.opened
    }

    fn enqueue<T: Transport>(
        &mut self,
        ctx: &mut Context<T>,
        io: TunnelIo,
    ) -> Result<(), DispatchError> {
        self.waiting.push_back(io);
        self.request_next(ctx)
    }

    fn request_next<T: Transport>(&mut self, ctx: &mut Context<T>) -> Result<(), DispatchError> {
        if self.requested_at.is_some() || self.waiting.is_empty() {
            return Ok(());
        }

        tracing::info!(
            "Asking {} to forward to {}:{} ({} waiting)",
            self.remote,
            self.host,
            self.port,
            self.waiting.len()
        );
        match ctx.send_frame(
            &self.remote,
            PacketType::RequestTunnel,
            self.port,
            self.host.as_bytes(),
        ) {
            Ok(()) => {
                self.requested_at = Some(Instant::now());
                Ok(())
            }
            Err(e) => {
                self.waiting.pop_front();
                if self.single {
                    self.failure = Some(e.to_string());
                }
                Err(e)
            }
        }
    }

    fn check_origin(&self, frame: &Frame<'_>) -> Result<(), DispatchError> {
        if frame.origin != self.remote {
            return Err(DispatchError::violation(
                frame.origin,
                Violation::ForeignPeer {
                    packet_type: frame.packet_type,
                    expected: self.remote,
                },
            ));
        }
        if self.requested_at.is_none() {
            return Err(DispatchError::violation(
                frame.origin,
                Violation::Unsolicited {
                    packet_type: frame.packet_type,
                },
            ));
        }
        Ok(())
    }

    /// Give up on a request the acceptor has not answered in time.
    fn expire_request<T: Transport>(&mut self, ctx: &mut Context<T>) {
        let timeout = ctx.config.request_timeout;
        match self.requested_at {
            Some(sent) if sent.elapsed() >= timeout => {}
            _ => return,
        }

        tracing::warn!(
            "{} did not answer the request for {}:{} within {timeout:?}",
            self.remote,
            self.host,
            self.port
        );
        self.requested_at = None;
        self.waiting.pop_front();
        if self.single {
            self.failure = Some(format!("no answer within {timeout:?}"));
        }
        if let Err(e) = self.request_next(ctx) {
            e.report();
        }
    }
}

impl Role for Requester {
    const NAME: &'static str = "requester";

    fn start<T: Transport>(&mut self, ctx: &mut Context<T>) -> eyre::Result<()> {
        if self.host.is_empty() || self.host.len() > ctx.max_payload() {
            return Err(eyre::eyre!(
                "hostname must be 1 to {} bytes, got {}",
                ctx.max_payload(),
                self.host.len()
            ));
        }

        match self.source.take() {
            Some(LocalSource::Listener(listener)) => {
                let events = ctx.events();
                ctx.spawn(accept_local(listener, events));
            }
            Some(LocalSource::Pipe) => self.enqueue(ctx, TunnelIo::stdio())?,
            Some(LocalSource::Io(io)) => self.enqueue(ctx, io)?,
            None => {}
        }
        Ok(())
    }

    fn on_ack_tunnel<T: Transport>(
        &mut self,
        ctx: &mut Context<T>,
        frame: &Frame<'_>,
    ) -> Result<(), DispatchError> {
        let id = ConnectionId(frame.connection_id);
        if let Err(e) = self.check_origin(frame) {
            if frame.origin == self.remote {
                // answer to a request already given up on
                if let Err(fin) = ctx.send_frame(&self.remote, PacketType::TcpFin, id.0, &[]) {
                    fin.report();
                }
            }
            return Err(e);
        }
        self.requested_at = None;

        let Some(io) = self.waiting.pop_front() else {
            return self.request_next(ctx);
        };

        let inserted = ctx.table.insert(id, io, self.remote).map(|_| ());
        if let Err(e) = inserted {
            // the acceptor holds a socket for this id; have it let go
            if let Err(fin) = ctx.send_frame(&self.remote, PacketType::TcpFin, id.0, &[]) {
                fin.report();
            }
            if self.single {
                self.failure = Some(e.to_string());
            }
            self.request_next(ctx)?;
            return Err(e.into());
        }

        self.opened += 1;
        tracing::info!(
            "Tunnel {id} to {}:{} via {} is open",
            self.host,
            self.port,
            self.remote
        );
        self.request_next(ctx)
    }

    fn on_reject_tunnel<T: Transport>(
        &mut self,
        ctx: &mut Context<T>,
        frame: &Frame<'_>,
    ) -> Result<(), DispatchError> {
        self.check_origin(frame)?;
        self.requested_at = None;
        self.waiting.pop_front();

        let reason = String::from_utf8_lossy(frame.payload);
        tracing::warn!(
            "{} refused to forward to {}:{}: {reason}",
            self.remote,
            self.host,
            self.port
        );
        if self.single {
            self.failure = Some(reason.into_owned());
        }
        self.request_next(ctx)
    }

    fn on_event<T: Transport>(
        &mut self,
        ctx: &mut Context<T>,
        event: LoopEvent,
    ) -> Result<(), DispatchError> {
        match event {
            LoopEvent::LocalConnection { stream, addr } => {
                tracing::info!("Accepted local connection from {addr}");
                self.enqueue(ctx, TunnelIo::tcp(stream))
            }
            other => {
                tracing::debug!("Requester ignores {other:?}");
                Ok(())
            }
        }
    }

    fn on_tunnel_closed<T: Transport>(&mut self, _ctx: &mut Context<T>, tunnel: &Tunnel) {
        tracing::info!("Tunnel {} to {}:{} closed", tunnel.id, self.host, self.port);
        if self.single {
            self.finished = true;
        }
    }

    fn poll<T: Transport>(&mut self, ctx: &mut Context<T>) -> eyre::Result<Flow> {
        self.expire_request(ctx);
        if let Some(reason) = self.failure.take() {
            return Err(eyre::eyre!(
                "tunnel to {}:{} via {} failed: {reason}",
                self.host,
                self.port,
                self.remote
            ));
        }
        if self.finished {
            return Ok(Flow::Finish);
        }
        Ok(Flow::Continue)
    }
}

async fn accept_local(listener: TcpListener, events: tokio::sync::mpsc::UnboundedSender<LoopEvent>) {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Listening for local connections on {addr}");
    }
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                if events
                    .send(LoopEvent::LocalConnection { stream, addr })
                    .is_err()
                {
                    return;
                }
            }
            Err(e) => tracing::warn!("Accepting local connection failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TunnelConfig;
    use crate::dispatch::dispatch;
    use crate::frame::decode;
    use fastn_tunnel_net::MemoryTransport;
    use std::time::Duration;
    use tokio::io::duplex;

    struct Fixture {
        ctx: Context<MemoryTransport>,
        acceptor: MemoryTransport,
    }

    fn fixture() -> Fixture {
        let mut local = MemoryTransport::new(PeerId::from_bytes([1; 32]));
        let mut acceptor = MemoryTransport::new(PeerId::from_bytes([2; 32]));
        local.connect(&mut acceptor);
        let (ctx, _events) = Context::new(local, TunnelConfig::default());
        Fixture { ctx, acceptor }
    }

    fn local_io() -> (TunnelIo, tokio::io::DuplexStream) {
        let (local, remote) = duplex(1024);
        let (r, w) = tokio::io::split(local);
        (TunnelIo::new(r, w), remote)
    }

    fn next_sent(f: &mut Fixture) -> (PacketType, u16, Vec<u8>) {
        let msg = f.acceptor.try_recv().unwrap();
        let frame = decode(&msg.message, msg.peer, f.ctx.max_message_size()).unwrap();
        (frame.packet_type, frame.connection_id, frame.payload.to_vec())
    }

    #[tokio::test]
    async fn test_one_request_in_flight() {
        let mut f = fixture();
        let remote = f.acceptor.peer_id();
        let (first, _r1) = local_io();
        let mut requester = Requester::new(remote, "localhost", 22, LocalSource::Io(first));
        requester.start(&mut f.ctx).unwrap();

        assert_eq!(
            next_sent(&mut f),
            (PacketType::RequestTunnel, 22, b"localhost".to_vec())
        );

        let (second, _r2) = local_io();
        requester.enqueue(&mut f.ctx, second).unwrap();
        assert!(f.acceptor.try_recv().is_none());

        let ack = Frame {
            packet_type: PacketType::AckTunnel,
            connection_id: 900,
            payload: b"",
            origin: remote,
        };
        dispatch(&mut f.ctx, &mut requester, &ack).unwrap();
        assert_eq!(f.ctx.table.get_by_id(ConnectionId(900)).unwrap().owner, remote);
        assert_eq!(requester.opened(), 1);

        // the queued connection is requested only now
        assert_eq!(next_sent(&mut f).0, PacketType::RequestTunnel);
    }

    #[tokio::test]
    async fn test_reject_drops_waiting_connection() {
        let mut f = fixture();
        let remote = f.acceptor.peer_id();
        let (io, mut local_end) = local_io();
        let mut requester = Requester::new(remote, "10.0.0.1", 5432, LocalSource::Io(io));
        requester.start(&mut f.ctx).unwrap();
        next_sent(&mut f);

        let reject = Frame {
            packet_type: PacketType::RejectTunnel,
            connection_id: 5432,
            payload: b"connection refused",
            origin: remote,
        };
        dispatch(&mut f.ctx, &mut requester, &reject).unwrap();
        assert!(f.ctx.table.is_empty());

        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut local_end, &mut buf)
            .await
            .unwrap();
        assert!(buf.is_empty());

        let err = requester.poll(&mut f.ctx).unwrap_err();
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_unsolicited_ack_is_violation() {
        let mut f = fixture();
        let remote = f.acceptor.peer_id();
        let (listener_io, _r) = local_io();
        let mut requester = Requester::new(remote, "localhost", 22, LocalSource::Io(listener_io));

        let ack = Frame {
            packet_type: PacketType::AckTunnel,
            connection_id: 1,
            payload: b"",
            origin: remote,
        };
        let err = dispatch(&mut f.ctx, &mut requester, &ack).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::ProtocolViolation {
                violation: Violation::Unsolicited { .. },
                ..
            }
        ));
        assert!(f.ctx.table.is_empty());
    }

    #[tokio::test]
    async fn test_ack_from_other_peer_is_violation() {
        let mut f = fixture();
        let remote = f.acceptor.peer_id();
        let (io, _r) = local_io();
        let mut requester = Requester::new(remote, "localhost", 22, LocalSource::Io(io));
        requester.start(&mut f.ctx).unwrap();

        let ack = Frame {
            packet_type: PacketType::AckTunnel,
            connection_id: 1,
            payload: b"",
            origin: PeerId::from_bytes([9; 32]),
        };
        let err = dispatch(&mut f.ctx, &mut requester, &ack).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::ProtocolViolation {
                violation: Violation::ForeignPeer { .. },
                ..
            }
        ));
        assert!(f.ctx.table.is_empty());
    }

    #[tokio::test]
    async fn test_requester_refuses_tunnel_requests() {
        let mut f = fixture();
        let remote = f.acceptor.peer_id();
        let (io, _r) = local_io();
        let mut requester = Requester::new(remote, "localhost", 22, LocalSource::Io(io));

        let request = Frame {
            packet_type: PacketType::RequestTunnel,
            connection_id: 22,
            payload: b"localhost",
            origin: remote,
        };
        let err = dispatch(&mut f.ctx, &mut requester, &request).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::ProtocolViolation {
                violation: Violation::UnexpectedPacket { .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_single_tunnel_finishes_on_remote_fin() {
        let mut f = fixture();
        let remote = f.acceptor.peer_id();
        let (io, _r) = local_io();
        let mut requester = Requester::new(remote, "localhost", 22, LocalSource::Io(io));
        requester.start(&mut f.ctx).unwrap();

        let ack = Frame {
            packet_type: PacketType::AckTunnel,
            connection_id: 3,
            payload: b"",
            origin: remote,
        };
        dispatch(&mut f.ctx, &mut requester, &ack).unwrap();
        assert_eq!(requester.poll(&mut f.ctx).unwrap(), Flow::Continue);

        let fin = Frame {
            packet_type: PacketType::TcpFin,
            connection_id: 3,
            payload: b"",
            origin: remote,
        };
        dispatch(&mut f.ctx, &mut requester, &fin).unwrap();
        assert!(f.ctx.table.is_empty());
        assert_eq!(requester.poll(&mut f.ctx).unwrap(), Flow::Finish);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_request_gives_way_to_next() {
        let mut f = fixture();
        let remote = f.acceptor.peer_id();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut requester =
            Requester::new(remote, "localhost", 22, LocalSource::Listener(listener));

        let (first, mut first_end) = local_io();
        let (second, _second_end) = local_io();
        requester.enqueue(&mut f.ctx, first).unwrap();
        requester.enqueue(&mut f.ctx, second).unwrap();
        assert_eq!(next_sent(&mut f).0, PacketType::RequestTunnel);

        let timeout = f.ctx.config.request_timeout;
        tokio::time::advance(timeout - Duration::from_millis(1)).await;
        assert_eq!(requester.poll(&mut f.ctx).unwrap(), Flow::Continue);
        assert!(f.acceptor.try_recv().is_none());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(requester.poll(&mut f.ctx).unwrap(), Flow::Continue);
        assert_eq!(next_sent(&mut f).0, PacketType::RequestTunnel);
        assert_eq!(requester.waiting.len(), 1);

        // the abandoned local connection is closed
        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut first_end, &mut buf)
            .await
            .unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_single_request_fails() {
        let mut f = fixture();
        let remote = f.acceptor.peer_id();
        let (io, _r) = local_io();
        let mut requester = Requester::new(remote, "localhost", 22, LocalSource::Io(io));
        requester.start(&mut f.ctx).unwrap();
        next_sent(&mut f);

        tokio::time::advance(f.ctx.config.request_timeout).await;
        let err = requester.poll(&mut f.ctx).unwrap_err();
        assert!(err.to_string().contains("no answer"), "{err}");

        // the acceptor answers too late and is told to let go
        let ack = Frame {
            packet_type: PacketType::AckTunnel,
            connection_id: 41,
            payload: b"",
            origin: remote,
        };
        let err = dispatch(&mut f.ctx, &mut requester, &ack).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::ProtocolViolation {
                violation: Violation::Unsolicited { .. },
                ..
            }
        ));
        assert!(f.ctx.table.is_empty());
        assert_eq!(next_sent(&mut f), (PacketType::TcpFin, 41, vec![]));
    }

    #[tokio::test]
    async fn test_overlong_hostname_fails_start() {
        let mut f = fixture();
        let host = "h".repeat(f.ctx.max_payload() + 1);
        let (io, _r) = local_io();
        let mut requester = Requester::new(f.acceptor.peer_id(), host, 22, LocalSource::Io(io));
        assert!(requester.start(&mut f.ctx).is_err());
    }
}
