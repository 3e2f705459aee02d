use std::time::Duration;

use fastn_tunnel::{EventLoop, LocalSource, Pinger, Requester, TunnelConfig};
use fastn_tunnel_net::{IrohTransport, PeerId, SecretKey};

use super::{LocalForward, Target};

async fn connect(secret_key: SecretKey, peer: &PeerId) -> eyre::Result<IrohTransport> {
    let endpoint = fastn_tunnel_net::create_endpoint(secret_key).await?;
    let mut transport = IrohTransport::new(endpoint);
    tracing::info!("Connecting to {peer}");
    transport.connect(peer).await?;
    Ok(transport)
}

/// Listen on `127.0.0.1:<local port>` and open one tunnel per client.
#[tracing::instrument(skip(secret_key, config))]
pub async fn forward(
    secret_key: SecretKey,
    peer: PeerId,
    local: LocalForward,
    config: TunnelConfig,
) -> eyre::Result<()> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", local.local_port)).await?;
    let transport = connect(secret_key, &peer).await?;

    eprintln!(
        "🔗 Forwarding 127.0.0.1:{} to {}:{} via {peer}",
        local.local_port, local.target.host, local.target.port
    );

    let requester = Requester::new(
        peer,
        local.target.host,
        local.target.port,
        LocalSource::Listener(listener),
    );
    super::run_until_interrupted(EventLoop::new(transport, requester, config)).await?;
    Ok(())
}

/// Forward stdin/stdout. Nothing but tunnel data may go to stdout here.
#[tracing::instrument(skip(secret_key, config))]
pub async fn pipe(
    secret_key: SecretKey,
    peer: PeerId,
    target: Target,
    config: TunnelConfig,
) -> eyre::Result<()> {
    let transport = connect(secret_key, &peer).await?;
    let requester = Requester::new(peer, target.host, target.port, LocalSource::Pipe);
    super::run_until_interrupted(EventLoop::new(transport, requester, config)).await?;
    Ok(())
}

#[tracing::instrument(skip(secret_key, config))]
pub async fn ping(
    secret_key: SecretKey,
    peer: PeerId,
    timeout: Duration,
    config: TunnelConfig,
) -> eyre::Result<()> {
    let transport = connect(secret_key, &peer).await?;
    let pinger = super::run_until_interrupted(EventLoop::new(
        transport,
        Pinger::new(peer, timeout),
        config,
    ))
    .await?;

    match pinger.round_trip() {
        Some(rtt) => {
            println!("✅ Pong from {peer} in {rtt:?}");
            Ok(())
        }
        None => Err(eyre::eyre!("interrupted before {peer} answered")),
    }
}
