//! Tickets for sharing documents with other peers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use knot_base::ticket::{self, Kind, Ticket};
use knot_docs::{Namespace, NamespaceId};
use knot_net::PeerAddr;

/// The capability a document ticket grants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Capability {
    /// Full access. Carries the namespace secret, so the receiver can write.
    Write(Namespace),
    /// The namespace identifier only. Enough to join the swarm and sync a
    /// document the receiver already holds.
    Read(NamespaceId),
}

impl Capability {
    /// The identifier of the document this capability refers to.
    pub fn id(&self) -> NamespaceId {
        match self {
            Capability::Write(namespace) => namespace.id(),
            Capability::Read(id) => *id,
        }
    }
}

/// A ticket to join the swarm of a document.
///
/// Contains the capability for the document plus the addresses of peers that
/// already carry it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocTicket {
    /// The capability for the document.
    pub capability: Capability,
    /// Peers that carry the document.
    pub peers: Vec<PeerAddr>,
}

impl DocTicket {
    /// Create a new document ticket.
    pub fn new(capability: Capability, peers: Vec<PeerAddr>) -> Self {
        Self { capability, peers }
    }
}

impl Ticket for DocTicket {
    const KIND: Kind = Kind::Doc;
}

impl fmt::Display for DocTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Ticket::serialize(self))
    }
}

impl FromStr for DocTicket {
    type Err = ticket::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ticket::deserialize(s)
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha12Rng;

    use knot_net::PeerId;

    use super::*;

    #[test]
    fn test_doc_ticket_roundtrip() {
        let mut rng = ChaCha12Rng::seed_from_u64(1);
        let namespace = Namespace::new(&mut rng);
        let peer = PeerAddr::new(PeerId::generate());
        let ticket = DocTicket::new(Capability::Write(namespace.clone()), vec![peer.clone()]);

        let encoded = ticket.to_string();
        assert!(encoded.starts_with("doc"));
        let decoded: DocTicket = encoded.parse().unwrap();
        assert_eq!(decoded.capability.id(), namespace.id());
        assert_eq!(decoded.peers, vec![peer]);
        assert!(matches!(decoded.capability, Capability::Write(_)));
    }

    #[test]
    fn test_read_ticket() {
        let mut rng = ChaCha12Rng::seed_from_u64(2);
        let namespace = Namespace::new(&mut rng);
        let ticket = DocTicket::new(Capability::Read(namespace.id()), vec![]);
        let decoded: DocTicket = ticket.to_string().parse().unwrap();
        assert!(matches!(decoded.capability, Capability::Read(id) if id == namespace.id()));
    }

    #[test]
    fn test_not_a_doc_ticket() {
        assert!("blobsomething".parse::<DocTicket>().is_err());
        assert!("garbage".parse::<DocTicket>().is_err());
    }
}
