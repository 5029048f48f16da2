//! Protocol state machine for gossip, free of any IO.
//!
//! The [`state::State`] multiplexes any number of topics. It is driven by
//! feeding [`state::InEvent`]s into [`state::State::handle`] and acting on
//! the returned [`state::OutEvent`]s: sending messages, scheduling timers,
//! emitting events to subscribers. This makes the whole protocol testable
//! without spawning tasks or opening connections.
//!
//! Membership per topic is a simple join handshake with a capped neighbor
//! set. Broadcast floods messages to all neighbors, with duplicate
//! suppression and per origin sequence numbers so that each origin's
//! messages are delivered in send order.

use std::fmt;
use std::hash::Hash;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use knot_base::base32;

pub mod state;
pub mod topic;

pub use state::{InEvent, Message, OutEvent, State, Timer};
pub use topic::{Command, Config, Event, ReceivedMessage};

/// The identifier of a peer, as seen by the protocol logic.
///
/// The state machine never inspects identities, it only compares, copies and
/// serializes them. Tests use small integers, the network layer uses
/// [`knot_net::PeerId`].
pub trait PeerIdentity:
    Send + Sync + Copy + Eq + Ord + Hash + fmt::Debug + Serialize + DeserializeOwned + 'static
{
}

impl<T> PeerIdentity for T where
    T: Send + Sync + Copy + Eq + Ord + Hash + fmt::Debug + Serialize + DeserializeOwned + 'static
{
}

/// The identifier of a gossip topic.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TopicId([u8; 32]);

impl TopicId {
    /// Create a topic id from its raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The raw bytes of this topic id.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", base32::fmt(self.0))
    }
}

impl fmt::Debug for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TopicId({})", base32::fmt_short(self.0))
    }
}

impl From<[u8; 32]> for TopicId {
    fn from(value: [u8; 32]) -> Self {
        Self(value)
    }
}
