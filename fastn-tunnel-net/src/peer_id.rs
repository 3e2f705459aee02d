/// Identity of a remote peer: its Ed25519 public key.
///
/// Displayed and parsed as ID52. The transport fills this in from the
/// authenticated connection; it is never read from untrusted message bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; 32]);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseId52Error {
    #[error("ID52 must be 52 characters, got {0}")]
    Length(usize),

    #[error("ID52 is not valid BASE32_DNSSEC: {0}")]
    Encoding(String),
}

impl PeerId {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn id52(&self) -> String {
        data_encoding::BASE32_DNSSEC.encode(&self.0)
    }

    /// Convert to an iroh node id. Fails if the bytes are not a valid
    /// Ed25519 point.
    pub fn to_node_id(&self) -> eyre::Result<iroh::NodeId> {
        Ok(iroh::PublicKey::from_bytes(self.as_bytes())?)
    }
}

impl From<iroh::PublicKey> for PeerId {
    fn from(key: iroh::PublicKey) -> Self {
        Self(*key.as_bytes())
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id52())
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let id52 = self.id52();
        write!(f, "PeerId({})", &id52[..10])
    }
}

impl std::str::FromStr for PeerId {
    type Err = ParseId52Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 52 {
            return Err(ParseId52Error::Length(s.len()));
        }

        let decoded = data_encoding::BASE32_DNSSEC
            .decode(s.as_bytes())
            .map_err(|e| ParseId52Error::Encoding(e.to_string()))?;

        let bytes: [u8; 32] = decoded
            .try_into()
            .map_err(|v: Vec<u8>| ParseId52Error::Encoding(format!("decoded to {} bytes", v.len())))?;

        Ok(Self(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id52_round_trip() {
        let peer = PeerId::from_bytes([7; 32]);
        let id52 = peer.to_string();

        assert_eq!(id52.len(), 52);
        assert!(id52.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert_eq!(id52.parse::<PeerId>().unwrap(), peer);
    }

    #[test]
    fn test_node_id_keeps_key_bytes() {
        let key = crate::identity::generate_key();
        let peer = PeerId::from(key.public());

        let node_id = peer.to_node_id().unwrap();
        assert_eq!(node_id.as_bytes(), peer.as_bytes());
        assert_eq!(PeerId::from(node_id), peer);
    }

    #[test]
    fn test_id52_rejects_wrong_length() {
        assert_eq!("abc".parse::<PeerId>(), Err(ParseId52Error::Length(3)));
    }

    #[test]
    fn test_id52_rejects_bad_alphabet() {
        let bad = "!".repeat(52);
        assert!(matches!(bad.parse::<PeerId>(), Err(ParseId52Error::Encoding(_))));
    }
}
