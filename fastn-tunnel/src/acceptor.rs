//! The serving side: connects to targets on behalf of remote peers.

use std::time::Duration;

use fastn_tunnel_net::{PeerId, Transport};
use tokio::net::TcpStream;

use crate::dispatch::{Context, LoopEvent};
use crate::error::{DispatchError, Violation};
use crate::frame::{Frame, PacketType};
use crate::role::Role;
use crate::table::TunnelIo;

#[derive(Debug, Default)]
pub struct Acceptor;

impl Role for Acceptor {
    const NAME: &'static str = "acceptor";

    /// Start connecting to `hostname:port`. The loop keeps running; the
    /// outcome arrives later as [`LoopEvent::Connected`].
    fn on_request_tunnel<T: Transport>(
        &mut self,
        ctx: &mut Context<T>,
        frame: &Frame<'_>,
    ) -> Result<(), DispatchError> {
        let host = std::str::from_utf8(frame.payload)
            .ok()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| DispatchError::violation(frame.origin, Violation::BadHostname))?
            .to_owned();
        let port = frame.connection_id;
        let peer = frame.origin;

        tracing::info!("{peer} asks to forward data to {host}:{port}");

        let events = ctx.events();
        let timeout = ctx.config.connect_timeout;
        ctx.spawn(async move {
            let result = connect(&host, port, timeout).await;
            let connected = LoopEvent::Connected {
                peer,
                host,
                port,
                result,
            };
            if events.send(connected).is_err() {
                tracing::debug!("Event loop stopped before connect to {port} finished");
            }
        });
        Ok(())
    }

    fn on_event<T: Transport>(
        &mut self,
        ctx: &mut Context<T>,
        event: LoopEvent,
    ) -> Result<(), DispatchError> {
        match event {
            LoopEvent::Connected {
                peer,
                host,
                port,
                result: Ok(stream),
            } => open_tunnel(ctx, peer, &host, port, stream),
            LoopEvent::Connected {
                peer,
                host,
                port,
                result: Err(e),
            } => {
                tracing::warn!("Could not connect to {host}:{port} for {peer}: {e}");
                reject(ctx, peer, port, &format!("could not connect to {host}:{port}: {e}"))
            }
            other => {
                tracing::debug!("Acceptor ignores {other:?}");
                Ok(())
            }
        }
    }
}

async fn connect(host: &str, port: u16, timeout: Duration) -> std::io::Result<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("no answer within {timeout:?}"),
        )),
    }
}

fn open_tunnel<T: Transport>(
    ctx: &mut Context<T>,
    peer: PeerId,
    host: &str,
    port: u16,
    stream: TcpStream,
) -> Result<(), DispatchError> {
    let created = ctx.table.create(TunnelIo::tcp(stream), peer).map(|tunnel| tunnel.id);
    let id = match created {
        Ok(id) => id,
        Err(e) => {
            reject(ctx, peer, port, &e.to_string())?;
            return Err(e.into());
        }
    };

    tracing::info!("Created tunnel {id} to {host}:{port} for {peer}");

    if let Err(e) = ctx.send_frame(&peer, PacketType::AckTunnel, id.0, &[]) {
        // the requester will never learn the id, so nothing can use it
        ctx.table.remove_by_id(id);
        return Err(e);
    }
    Ok(())
}

/// Tell `peer` its request for `port` failed. The reason is cut to fit in
/// one frame.
fn reject<T: Transport>(
    ctx: &mut Context<T>,
    peer: PeerId,
    port: u16,
    reason: &str,
) -> Result<(), DispatchError> {
    let reason = reason.as_bytes();
    let reason = &reason[..reason.len().min(ctx.max_payload())];
    ctx.send_frame(&peer, PacketType::RejectTunnel, port, reason)
}
