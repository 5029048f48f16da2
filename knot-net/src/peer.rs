//! Peer identifiers and dialing information.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use knot_base::base32;

/// Identifier of a peer on the network.
///
/// In a deployment backed by an authenticated transport this is the public
/// key the connection is dialed by. The in-process transport treats it as an
/// opaque 32 byte name.
#[derive(Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// Create a peer id from its raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The raw bytes of this peer id.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Generate a fresh random peer id.
    pub fn generate() -> Self {
        Self(rand::random())
    }

    /// Shortened base32 representation, for logging.
    pub fn fmt_short(&self) -> String {
        base32::fmt_short(self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", base32::fmt(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.fmt_short())
    }
}

impl FromStr for PeerId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(base32::parse_array(s)?))
    }
}

impl From<[u8; 32]> for PeerId {
    fn from(value: [u8; 32]) -> Self {
        Self(value)
    }
}

/// Dialing information for a peer: its identifier plus optional socket
/// address hints.
///
/// The address hints are carried in tickets so that a real transport can dial
/// without discovery. The in-process transport dials by peer id only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddr {
    /// The identifier of the peer.
    pub peer_id: PeerId,
    /// Socket addresses where the peer might be reachable.
    pub addrs: Vec<SocketAddr>,
}

impl PeerAddr {
    /// Create a new peer address with no socket address hints.
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            addrs: Vec::new(),
        }
    }

    /// Add socket address hints.
    pub fn with_addrs(mut self, addrs: impl IntoIterator<Item = SocketAddr>) -> Self {
        self.addrs.extend(addrs);
        self
    }
}

impl From<PeerId> for PeerAddr {
    fn from(peer_id: PeerId) -> Self {
        Self::new(peer_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_roundtrip() {
        let id = PeerId::generate();
        let text = id.to_string();
        assert_eq!(text.parse::<PeerId>().unwrap(), id);
        assert_eq!(PeerId::from_bytes(*id.as_bytes()), id);
    }
}
