use std::collections::HashMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use knot_docs::NamespaceId;
use knot_net::PeerId;

/// Why we started a sync request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub enum SyncReason {
    /// Direct join request via the API.
    DirectJoin,
    /// The peer showed up as a new neighbor in the gossip swarm.
    NewNeighbor,
    /// The peer told us it has content we are missing.
    Resync,
}

/// Why a sync exchange was performed.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub enum Origin {
    /// We initiated the exchange.
    Connect(SyncReason),
    /// A peer connected to us and we accepted the exchange.
    Accept,
}

/// The state of sync with one peer for one namespace.
#[derive(Debug, Clone, Default)]
pub enum SyncState {
    /// No sync exchange happened yet.
    #[default]
    Idle,
    /// A sync exchange is running.
    Syncing {
        /// When the exchange started.
        start: SystemTime,
        /// Why the exchange was started.
        origin: Origin,
    },
    /// The last sync exchange succeeded.
    Finished,
    /// The last sync exchange failed.
    Failed,
}

/// Tracks an entry for each actively synced namespace, and in there the sync
/// state for each peer we exchanged with.
#[derive(Debug, Default)]
pub struct NamespaceStates(HashMap<NamespaceId, NamespaceState>);

#[derive(Debug, Default)]
struct NamespaceState {
    peers: HashMap<PeerId, SyncState>,
}

impl NamespaceStates {
    /// Whether the namespace is in the set of synced namespaces.
    pub fn is_syncing(&self, namespace: &NamespaceId) -> bool {
        self.0.contains_key(namespace)
    }

    /// Add a namespace to the set of synced namespaces.
    pub fn insert(&mut self, namespace: NamespaceId) {
        self.0.entry(namespace).or_default();
    }

    /// Remove a namespace from the set of synced namespaces.
    ///
    /// Returns whether it was in the set.
    pub fn remove(&mut self, namespace: &NamespaceId) -> bool {
        self.0.remove(namespace).is_some()
    }

    /// Whether an outgoing sync to the peer should be started now.
    ///
    /// Never starts a second exchange while one is running, and does not
    /// dial a neighbor again that we already finished an exchange with.
    /// Transitions the peer state to [`SyncState::Syncing`] when it returns
    /// true.
    pub fn start_connect(
        &mut self,
        namespace: &NamespaceId,
        peer: PeerId,
        reason: SyncReason,
    ) -> bool {
        let Some(state) = self.entry(namespace, peer) else {
            debug!("abort connect: namespace is not in the sync set");
            return false;
        };
        match state {
            SyncState::Syncing { .. } => {
                debug!("abort connect: sync already running");
                false
            }
            SyncState::Finished if reason == SyncReason::NewNeighbor => {
                debug!("abort connect: already synced with this neighbor");
                false
            }
            _ => {
                *state = SyncState::Syncing {
                    start: SystemTime::now(),
                    origin: Origin::Connect(reason),
                };
                true
            }
        }
    }

    /// Record a finished sync exchange.
    ///
    /// Transitions the peer state to `Finished` or `Failed`, except that a
    /// finished accept never clobbers the state of a still running dial.
    /// Returns whether the namespace is in the sync set.
    pub fn finish(
        &mut self,
        namespace: &NamespaceId,
        peer: PeerId,
        origin: &Origin,
        ok: bool,
    ) -> bool {
        let Some(state) = self.entry(namespace, peer) else {
            return false;
        };
        if let SyncState::Syncing {
            origin: running, ..
        } = state
        {
            if running != origin && matches!(origin, Origin::Accept) {
                // our own dial is still in flight, leave its state alone
                return true;
            }
            if running != origin {
                warn!(?running, ?origin, "finished sync origin does not match state");
            }
        }
        *state = if ok {
            SyncState::Finished
        } else {
            SyncState::Failed
        };
        true
    }

    fn entry(&mut self, namespace: &NamespaceId, peer: PeerId) -> Option<&mut SyncState> {
        self.0
            .get_mut(namespace)
            .map(|state| state.peers.entry(peer).or_default())
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha12Rng;

    use knot_docs::Namespace;

    use super::*;

    fn namespace() -> NamespaceId {
        Namespace::new(&mut ChaCha12Rng::seed_from_u64(1)).id()
    }

    #[test]
    fn test_connect_lifecycle() {
        let mut states = NamespaceStates::default();
        let ns = namespace();
        let peer = PeerId::generate();

        // untracked namespaces never start syncs
        assert!(!states.start_connect(&ns, peer, SyncReason::DirectJoin));

        states.insert(ns);
        assert!(states.is_syncing(&ns));
        assert!(states.start_connect(&ns, peer, SyncReason::DirectJoin));
        // no second dial while one is running
        assert!(!states.start_connect(&ns, peer, SyncReason::NewNeighbor));

        assert!(states.finish(&ns, peer, &Origin::Connect(SyncReason::DirectJoin), true));
        // a neighbor event does not re-dial after a successful sync
        assert!(!states.start_connect(&ns, peer, SyncReason::NewNeighbor));
        // but an explicit resync does
        assert!(states.start_connect(&ns, peer, SyncReason::Resync));
    }

    #[test]
    fn test_failed_sync_is_retried() {
        let mut states = NamespaceStates::default();
        let ns = namespace();
        let peer = PeerId::generate();
        states.insert(ns);

        assert!(states.start_connect(&ns, peer, SyncReason::DirectJoin));
        assert!(states.finish(&ns, peer, &Origin::Connect(SyncReason::DirectJoin), false));
        assert!(states.start_connect(&ns, peer, SyncReason::NewNeighbor));
    }

    #[test]
    fn test_accept_does_not_clobber_running_dial() {
        let mut states = NamespaceStates::default();
        let ns = namespace();
        let peer = PeerId::generate();
        states.insert(ns);

        assert!(states.start_connect(&ns, peer, SyncReason::DirectJoin));
        // an incoming exchange finishes while our dial is running
        assert!(states.finish(&ns, peer, &Origin::Accept, true));
        // the dial is still considered running
        assert!(!states.start_connect(&ns, peer, SyncReason::Resync));
    }

    #[test]
    fn test_remove() {
        let mut states = NamespaceStates::default();
        let ns = namespace();
        states.insert(ns);
        assert!(states.remove(&ns));
        assert!(!states.remove(&ns));
        assert!(!states.is_syncing(&ns));
    }
}
