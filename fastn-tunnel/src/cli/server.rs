use fastn_tunnel::{Acceptor, EventLoop, TunnelConfig};
use fastn_tunnel_net::{IrohTransport, PeerId, SecretKey};

#[tracing::instrument(skip_all)]
pub async fn run(
    secret_key: SecretKey,
    allow: Vec<PeerId>,
    config: TunnelConfig,
) -> eyre::Result<()> {
    let endpoint = fastn_tunnel_net::create_endpoint(secret_key).await?;
    let mut transport = IrohTransport::new(endpoint);

    println!("🚀 fastn-tunnel server");
    println!("🔑 ID52: {}", transport.peer_id());

    if allow.is_empty() {
        tracing::warn!("No --allow given, accepting tunnels from any peer");
        transport.listen(None);
    } else {
        for peer in &allow {
            tracing::info!("Allowing {peer}");
        }
        transport.listen(Some(allow.into_iter().collect()));
    }

    let event_loop = EventLoop::new(transport, Acceptor, config);
    super::run_until_interrupted(event_loop).await?;
    Ok(())
}
