use std::time::Duration;

use fastn_tunnel_net::{PeerId, Transport};
use rand::RngCore;
use tokio::time::Instant;

use crate::dispatch::Context;
use crate::error::{DispatchError, Violation};
use crate::frame::{Frame, PacketType};
use crate::role::{Flow, Role};

/// Liveness check: one `PING` to the remote, done when the matching `PONG`
/// comes back.
#[derive(Debug)]
pub struct Pinger {
    remote: PeerId,
    timeout: Duration,
    nonce: [u8; 8],
    sent_at: Option<Instant>,
    round_trip: Option<Duration>,
}

impl Pinger {
    pub fn new(remote: PeerId, timeout: Duration) -> Self {
        let mut nonce = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut nonce);
        Self {
            remote,
            timeout,
            nonce,
            sent_at: None,
            round_trip: None,
        }
    }

    pub fn round_trip(&self) -> Option<Duration> {
        self.round_trip
    }
}

impl Role for Pinger {
    const NAME: &'static str = "pinger";

    fn start<T: Transport>(&mut self, ctx: &mut Context<T>) -> eyre::Result<()> {
        ctx.send_frame(&self.remote, PacketType::Ping, 0, &self.nonce)?;
        self.sent_at = Some(Instant::now());
        tracing::info!("Sent ping to {}", self.remote);
        Ok(())
    }

    fn on_pong<T: Transport>(
        &mut self,
        _ctx: &mut Context<T>,
        frame: &Frame<'_>,
    ) -> Result<(), DispatchError> {
        if frame.origin != self.remote {
            return Err(DispatchError::violation(
                frame.origin,
                Violation::ForeignPeer {
                    packet_type: frame.packet_type,
                    expected: self.remote,
                },
            ));
        }

        match self.sent_at {
            Some(sent_at) if frame.payload == self.nonce => {
                let elapsed = sent_at.elapsed();
                tracing::info!("Pong from {} after {elapsed:?}", self.remote);
                self.round_trip = Some(elapsed);
            }
            _ => tracing::debug!("Ignoring pong that does not answer our ping"),
        }
        Ok(())
    }

    fn poll<T: Transport>(&mut self, _ctx: &mut Context<T>) -> eyre::Result<Flow> {
        if self.round_trip.is_some() {
            return Ok(Flow::Finish);
        }
        match self.sent_at {
            Some(sent_at) if sent_at.elapsed() > self.timeout => Err(eyre::eyre!(
                "no pong from {} within {:?}",
                self.remote,
                self.timeout
            )),
            _ => Ok(Flow::Continue),
        }
    }
}
