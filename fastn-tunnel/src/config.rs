use std::time::Duration;

/// Runtime settings for one event loop.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// How often the loop ticks the transport and polls the role, even when
    /// nothing else is happening.
    pub poll_interval: Duration,
    /// Bound on an outbound connect made for a tunnel request.
    pub connect_timeout: Duration,
    /// How long a requester waits for `ACK_TUNNEL` or `REJECT_TUNNEL`
    /// before giving up on a request. Keep it above the acceptor's
    /// `connect_timeout`.
    pub request_timeout: Duration,
    /// Optional cap below the transport's own message size limit.
    pub max_message_size: Option<usize>,
    /// `TCP_DATA` payloads a tunnel may have waiting for its local socket.
    /// A peer that gets further ahead than this has its tunnel closed.
    pub write_queue_depth: usize,
    /// How long queued bytes may take to reach local sockets once the loop
    /// has stopped.
    pub shutdown_grace: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(20),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(15),
            max_message_size: None,
            write_queue_depth: 64,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

impl TunnelConfig {
    /// Message size limit given the transport's own.
    pub fn effective_max_message_size(&self, transport_max: usize) -> usize {
        match self.max_message_size {
            Some(max) => max.min(transport_max),
            None => transport_max,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cap_never_exceeds_transport() {
        let mut config = TunnelConfig::default();
        assert_eq!(config.effective_max_message_size(1000), 1000);

        config.max_message_size = Some(500);
        assert_eq!(config.effective_max_message_size(1000), 500);

        config.max_message_size = Some(5000);
        assert_eq!(config.effective_max_message_size(1000), 1000);
    }
}
