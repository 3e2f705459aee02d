use fastn_tunnel_net::Transport;

use crate::dispatch::{Context, LoopEvent};
use crate::error::{DispatchError, Violation};
use crate::frame::Frame;
use crate::table::Tunnel;

/// Whether the event loop should keep running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Finish,
}

/// The side of the tunnel protocol this process plays.
///
/// Picked once when the event loop is built. Every packet a role does not
/// expect is a protocol violation by default.
pub trait Role: Send {
    /// Used in logs and violation reports.
    const NAME: &'static str;

    /// Called once before the loop starts waiting.
    fn start<T: Transport>(&mut self, _ctx: &mut Context<T>) -> eyre::Result<()> {
        Ok(())
    }

    fn on_request_tunnel<T: Transport>(
        &mut self,
        _ctx: &mut Context<T>,
        frame: &Frame<'_>,
    ) -> Result<(), DispatchError> {
        Err(unexpected::<Self>(frame))
    }

    fn on_ack_tunnel<T: Transport>(
        &mut self,
        _ctx: &mut Context<T>,
        frame: &Frame<'_>,
    ) -> Result<(), DispatchError> {
        Err(unexpected::<Self>(frame))
    }

    fn on_reject_tunnel<T: Transport>(
        &mut self,
        _ctx: &mut Context<T>,
        frame: &Frame<'_>,
    ) -> Result<(), DispatchError> {
        Err(unexpected::<Self>(frame))
    }

    fn on_pong<T: Transport>(
        &mut self,
        _ctx: &mut Context<T>,
        frame: &Frame<'_>,
    ) -> Result<(), DispatchError> {
        Err(unexpected::<Self>(frame))
    }

    fn on_event<T: Transport>(
        &mut self,
        _ctx: &mut Context<T>,
        event: LoopEvent,
    ) -> Result<(), DispatchError> {
        tracing::debug!("{} ignores {event:?}", Self::NAME);
        Ok(())
    }

    /// A tunnel has been removed from the table, for whatever reason.
    fn on_tunnel_closed<T: Transport>(&mut self, _ctx: &mut Context<T>, _tunnel: &Tunnel) {}

    /// Called on every tick. An error stops the loop and is returned from
    /// [`crate::EventLoop::run`].
    fn poll<T: Transport>(&mut self, _ctx: &mut Context<T>) -> eyre::Result<Flow> {
        Ok(Flow::Continue)
    }
}

fn unexpected<R: Role + ?Sized>(frame: &Frame<'_>) -> DispatchError {
    DispatchError::violation(
        frame.origin,
        Violation::UnexpectedPacket {
            packet_type: frame.packet_type,
            role: R::NAME,
        },
    )
}
