use fastn_tunnel_net::{PeerId, SendError};

use crate::frame::{EncodeError, PacketType};
use crate::table::{ConnectionId, TableError};

/// Why a frame was refused even though it decoded cleanly.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Violation {
    #[error("{packet_type} is not accepted by the {role}")]
    UnexpectedPacket {
        packet_type: PacketType,
        role: &'static str,
    },

    #[error("tunnel {id} belongs to {owner}")]
    NotOwner { id: ConnectionId, owner: PeerId },

    #[error("{packet_type} from a peer other than {expected}")]
    ForeignPeer {
        packet_type: PacketType,
        expected: PeerId,
    },

    #[error("{packet_type} with no tunnel request outstanding")]
    Unsolicited { packet_type: PacketType },

    #[error("tunnel request hostname is empty or not UTF-8")]
    BadHostname,
}

/// Outcome of handling one frame or loop event, other than success.
///
/// Nothing here is fatal: the frame is dropped, the error is logged via
/// [`DispatchError::report`], and the loop carries on.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Protocol violation by {peer}: {violation}")]
    ProtocolViolation { peer: PeerId, violation: Violation },

    #[error("{packet_type} from {peer} for unknown tunnel {id}")]
    LookupMiss {
        peer: PeerId,
        packet_type: PacketType,
        id: ConnectionId,
    },

    #[error("Failed to send {packet_type} to {peer}: {source}")]
    Send {
        peer: PeerId,
        packet_type: PacketType,
        source: SendError,
    },

    #[error("Failed to encode {packet_type}: {source}")]
    Encode {
        packet_type: PacketType,
        source: EncodeError,
    },

    #[error("Tunnel table error: {source}")]
    Table { source: TableError },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    ProtocolViolation,
    LookupMiss,
    Resource,
}

impl DispatchError {
    pub fn violation(peer: PeerId, violation: Violation) -> Self {
        DispatchError::ProtocolViolation { peer, violation }
    }

    pub fn category(&self) -> Category {
        match self {
            DispatchError::ProtocolViolation { .. } => Category::ProtocolViolation,
            DispatchError::LookupMiss { .. } => Category::LookupMiss,
            DispatchError::Send { .. }
            | DispatchError::Encode { .. }
            | DispatchError::Table { .. } => Category::Resource,
        }
    }

    /// Log this error at the level its category calls for.
    pub fn report(&self) {
        match self.category() {
            // frames racing a local close land here routinely
            Category::LookupMiss => tracing::debug!("{self}"),
            Category::ProtocolViolation => tracing::warn!("{self}"),
            Category::Resource => tracing::error!("{self}"),
        }
    }
}

impl From<TableError> for DispatchError {
    fn from(source: TableError) -> Self {
        DispatchError::Table { source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        let peer = PeerId::from_bytes([1; 32]);

        let miss = DispatchError::LookupMiss {
            peer,
            packet_type: PacketType::TcpData,
            id: ConnectionId(5),
        };
        assert_eq!(miss.category(), Category::LookupMiss);
        assert_eq!(
            miss.to_string(),
            format!("TCP_DATA from {peer} for unknown tunnel #5")
        );

        let full: DispatchError = TableError::Full.into();
        assert_eq!(full.category(), Category::Resource);

        let violation = DispatchError::violation(peer, Violation::BadHostname);
        assert_eq!(violation.category(), Category::ProtocolViolation);
    }
}
