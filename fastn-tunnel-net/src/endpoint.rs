/// Create an iroh endpoint for this node.
///
/// One endpoint per process: it owns the UDP socket and discovery state, and
/// every peer link is a connection on it. The caller owns the returned value
/// and passes it to [`crate::IrohTransport`].
pub async fn create_endpoint(secret_key: iroh::SecretKey) -> eyre::Result<iroh::Endpoint> {
    tracing::debug!("Creating iroh endpoint");

    match iroh::Endpoint::builder()
        .discovery_n0()
        .discovery_local_network()
        .alpns(vec![crate::APNS_TUNNEL.into()])
        .secret_key(secret_key)
        .bind()
        .await
    {
        Ok(ep) => {
            tracing::info!(
                "Endpoint created: {}",
                crate::PeerId::from(ep.node_id())
            );
            Ok(ep)
        }
        Err(e) => {
            // https://github.com/n0-computer/iroh/issues/2741
            Err(eyre::anyhow!("failed to bind to iroh network: {e:?}"))
        }
    }
}
