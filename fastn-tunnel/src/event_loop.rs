//! The scheduler: one task that owns the transport, the tunnel table and
//! the role, and reacts to whichever of them is ready first.

use fastn_tunnel_net::{Inbound, Transport};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::TunnelConfig;
use crate::dispatch::{self, Context, LoopEvent};
use crate::frame::{self, PacketType};
use crate::role::{Flow, Role};
use crate::table::{SocketEvent, SocketToken};

pub struct EventLoop<T, R> {
    ctx: Context<T>,
    role: R,
    events: mpsc::UnboundedReceiver<LoopEvent>,
    cancel: CancellationToken,
}

impl<T: Transport, R: Role> EventLoop<T, R> {
    pub fn new(transport: T, role: R, config: TunnelConfig) -> Self {
        let (ctx, events) = Context::new(transport, config);
        Self {
            ctx,
            role,
            events,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops [`EventLoop::run`] when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run until cancelled, until the transport shuts down, or until the
    /// role is done. Returns the role so callers can read its outcome.
    #[tracing::instrument(name = "event_loop", skip_all, fields(role = R::NAME))]
    pub async fn run(mut self) -> eyre::Result<R> {
        self.role.start(&mut self.ctx)?;

        let mut ticker = tokio::time::interval(self.ctx.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("Event loop cancelled");
                    break Ok(());
                }
                inbound = self.ctx.transport.recv() => match inbound {
                    Some(inbound) => self.on_inbound(inbound),
                    None => break Err(eyre::eyre!("transport shut down")),
                },
                (token, event) = self.ctx.table.next_event() => self.on_socket_event(token, event),
                Some(event) = self.events.recv() => {
                    if let Err(e) = self.role.on_event(&mut self.ctx, event) {
                        e.report();
                    }
                }
                _ = ticker.tick() => {
                    self.ctx.transport.tick();
                    self.ctx.reap();
                    match self.role.poll(&mut self.ctx) {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Finish) => break Ok(()),
                        Err(e) => break Err(e),
                    }
                }
            }
        };

        self.ctx.shutdown().await;
        outcome.map(|()| self.role)
    }

    fn on_inbound(&mut self, inbound: Inbound) {
        let max = self.ctx.max_message_size();
        let frame = match frame::decode(&inbound.message, inbound.peer, max) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Dropping {} byte message from {}: {e}", inbound.message.len(), inbound.peer);
                return;
            }
        };

        if let Err(e) = dispatch::dispatch(&mut self.ctx, &mut self.role, &frame) {
            e.report();
        }
    }

    fn on_socket_event(&mut self, token: SocketToken, event: SocketEvent) {
        match event {
            SocketEvent::Data(buf) => {
                let Some(tunnel) = self.ctx.table.get_by_token(token) else {
                    return;
                };
                let (owner, id) = (tunnel.owner, tunnel.id);
                tracing::trace!("Tunnel {id}: {} bytes from local socket", buf.payload_len());

                let bytes = buf.encode(PacketType::TcpData, id.0);
                if let Err(e) = self.ctx.send_encoded(&owner, PacketType::TcpData, bytes) {
                    tracing::warn!("{e}");
                }
            }
            SocketEvent::Closed => self.close_local(token, "closed"),
            SocketEvent::ReadFailed(e) => self.close_local(token, format_args!("read failed: {e}")),
            SocketEvent::WriteFailed(e) => {
                self.close_local(token, format_args!("write failed: {e}"))
            }
        }
    }

    /// The local end of a tunnel is gone: tell the owner, then forget it.
    fn close_local(&mut self, token: SocketToken, reason: impl std::fmt::Display) {
        let Some(tunnel) = self.ctx.table.get_by_token(token) else {
            return;
        };
        let (owner, id) = (tunnel.owner, tunnel.id);
        tracing::info!("Tunnel {id} local socket {reason}, sending FIN to {owner}");

        if let Err(e) = self.ctx.send_frame(&owner, PacketType::TcpFin, id.0, &[]) {
            tracing::warn!("{e}");
        }
        if let Some(tunnel) = self.ctx.table.remove(token) {
            self.role.on_tunnel_closed(&mut self.ctx, &tunnel);
        }
    }
}
