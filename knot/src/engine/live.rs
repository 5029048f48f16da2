use std::collections::{HashMap, HashSet};
use std::time::SystemTime;

use anyhow::{Context, Result};
use futures::{
    future::{BoxFuture, FutureExt},
    stream::{BoxStream, FuturesUnordered, SelectAll, StreamExt},
};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use knot_base::{Hash, HashAndFormat};
use knot_blobs::store::EntryStatus;
use knot_docs::{
    net::{run_alice, run_bob},
    sync::Event as ReplicaEvent,
    ContentStatus, Entry, NamespaceId, Replica, SignedEntry,
};
use knot_gossip::{
    net::{Event as GossipNetEvent, Gossip, GossipEvent, GossipSender},
    TopicId,
};
use knot_net::{Connection, Endpoint, PeerAddr, PeerId};

use super::state::{NamespaceStates, Origin, SyncReason};

/// Protocol identifier for document sync connections.
pub const SYNC_ALPN: &[u8] = b"/knot/sync/1";

/// An operation on a document, broadcast to the gossip swarm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Op {
    /// A new entry was inserted into the document.
    Put(SignedEntry),
    /// The sending peer now has the content for a hash available.
    ContentReady(Hash),
}

/// Events about the life of a synced document.
#[derive(Debug, Clone)]
pub enum LiveEvent {
    /// The document swarm was joined.
    ///
    /// Emitted once when sync is started for the document, before any
    /// neighbors are known.
    Joined,
    /// A local author inserted an entry.
    InsertLocal {
        /// The inserted entry.
        entry: Entry,
    },
    /// An entry was received from a peer.
    InsertRemote {
        /// The peer that delivered the entry.
        from: PeerId,
        /// The inserted entry.
        entry: Entry,
        /// Whether the content of the entry is available locally.
        content_status: ContentStatus,
    },
    /// The content of an entry was downloaded and is now available locally.
    ContentReady {
        /// The hash of the newly available content.
        hash: Hash,
    },
    /// A peer became a neighbor in the document swarm.
    NeighborUp(PeerId),
    /// A neighbor left the document swarm.
    NeighborDown(PeerId),
    /// A sync exchange with a peer finished.
    SyncFinished(SyncEvent),
    /// All content downloads queued from finished sync exchanges completed.
    PendingContentReady,
}

/// Summary of a finished sync exchange.
#[derive(Debug, Clone)]
pub struct SyncEvent {
    /// The namespace that was synced.
    pub namespace: NamespaceId,
    /// The peer we synced with.
    pub peer: PeerId,
    /// Why the exchange was performed.
    pub origin: Origin,
    /// When the exchange finished.
    pub finished: SystemTime,
    /// The result of the exchange.
    pub result: std::result::Result<(), String>,
}

#[derive(derive_more::Debug)]
pub(super) enum ToLiveActor {
    StartSync {
        namespace: NamespaceId,
        peers: Vec<PeerAddr>,
        reply: oneshot::Sender<Result<()>>,
    },
    Leave {
        namespace: NamespaceId,
        reply: oneshot::Sender<Result<()>>,
    },
    Subscribe {
        namespace: NamespaceId,
        #[debug("sender")]
        sender: flume::Sender<LiveEvent>,
        reply: oneshot::Sender<Result<()>>,
    },
    HandleConnection {
        conn: Connection,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

type SyncConnectFut = BoxFuture<'static, (NamespaceId, PeerId, Origin, Result<()>)>;
type SyncAcceptFut = BoxFuture<'static, (PeerId, Result<NamespaceId>)>;
type DownloadFut = BoxFuture<'static, (NamespaceId, Hash, Option<knot_blobs::TempTag>)>;

/// The actor that keeps documents live.
///
/// It listens on replica events to broadcast local inserts, on gossip events
/// to merge remote inserts and meet new neighbors, and drives sync exchanges
/// and content downloads as background futures. One peer failing never
/// aborts the exchanges with other peers.
pub(super) struct LiveActor {
    endpoint: Endpoint,
    gossip: Gossip,
    docs: knot_docs::Store,
    blobs: knot_blobs::Store,
    inbox: mpsc::Receiver<ToLiveActor>,

    /// Insert events from all open replicas, all feeding one channel.
    replica_events_tx: flume::Sender<ReplicaEvent>,
    replica_events_rx: flume::r#async::RecvStream<'static, ReplicaEvent>,

    /// Event streams of the gossip topics we subscribed, tagged by namespace.
    gossip_events: SelectAll<BoxStream<'static, (NamespaceId, Result<GossipNetEvent>)>>,
    gossip_senders: HashMap<NamespaceId, GossipSender>,

    /// Sync state per namespace and peer.
    state: NamespaceStates,
    /// Replicas we subscribed to.
    open: HashSet<NamespaceId>,

    running_sync_connect: FuturesUnordered<SyncConnectFut>,
    running_sync_accept: FuturesUnordered<SyncAcceptFut>,
    pending_downloads: FuturesUnordered<DownloadFut>,
    /// Number of running downloads per namespace.
    download_count: HashMap<NamespaceId, usize>,
    /// Namespaces waiting to emit [`LiveEvent::PendingContentReady`].
    pending_ready: HashSet<NamespaceId>,

    subscribers: HashMap<NamespaceId, Vec<flume::Sender<LiveEvent>>>,
}

impl LiveActor {
    pub fn new(
        endpoint: Endpoint,
        gossip: Gossip,
        docs: knot_docs::Store,
        blobs: knot_blobs::Store,
        inbox: mpsc::Receiver<ToLiveActor>,
    ) -> Self {
        let (replica_events_tx, replica_events_rx) = flume::unbounded();
        Self {
            endpoint,
            gossip,
            docs,
            blobs,
            inbox,
            replica_events_tx,
            replica_events_rx: replica_events_rx.into_stream(),
            gossip_events: SelectAll::new(),
            gossip_senders: HashMap::new(),
            state: NamespaceStates::default(),
            open: HashSet::new(),
            running_sync_connect: FuturesUnordered::new(),
            running_sync_accept: FuturesUnordered::new(),
            pending_downloads: FuturesUnordered::new(),
            download_count: HashMap::new(),
            pending_ready: HashSet::new(),
            subscribers: HashMap::new(),
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        let res = self.run_inner().await;
        if let Err(err) = self.shutdown().await {
            error!(?err, "failed to shutdown gracefully");
        }
        res
    }

    async fn run_inner(&mut self) -> Result<()> {
        loop {
            tokio::select! {
                biased;
                msg = self.inbox.recv() => {
                    let Some(msg) = msg else { break };
                    match msg {
                        ToLiveActor::Shutdown { reply } => {
                            reply.send(()).ok();
                            break;
                        }
                        ToLiveActor::StartSync { namespace, peers, reply } => {
                            let res = self.start_sync(namespace, peers).await;
                            reply.send(res).ok();
                        }
                        ToLiveActor::Leave { namespace, reply } => {
                            let res = self.leave(namespace).await;
                            reply.send(res).ok();
                        }
                        ToLiveActor::Subscribe { namespace, sender, reply } => {
                            let res = self.subscribe(namespace, sender);
                            reply.send(res).ok();
                        }
                        ToLiveActor::HandleConnection { conn } => {
                            self.handle_connection(conn);
                        }
                    }
                }
                Some(event) = self.replica_events_rx.next() => {
                    if let Err(err) = self.on_replica_event(event).await {
                        error!(?err, "failed to process replica event");
                    }
                }
                Some((namespace, event)) = self.gossip_events.next(), if !self.gossip_events.is_empty() => {
                    if let Err(err) = self.on_gossip_event(namespace, event).await {
                        error!(?namespace, ?err, "failed to process gossip event");
                    }
                }
                Some((namespace, peer, origin, res)) = self.running_sync_connect.next(), if !self.running_sync_connect.is_empty() => {
                    self.on_sync_finished(namespace, peer, origin, res);
                }
                Some((peer, res)) = self.running_sync_accept.next(), if !self.running_sync_accept.is_empty() => {
                    match res {
                        Ok(namespace) => self.on_sync_finished(namespace, peer, Origin::Accept, Ok(())),
                        Err(err) => warn!(peer = %peer.fmt_short(), ?err, "sync[accept]: failed"),
                    }
                }
                Some((namespace, hash, tag)) = self.pending_downloads.next(), if !self.pending_downloads.is_empty() => {
                    self.on_download_finished(namespace, hash, tag).await;
                }
            }
        }
        debug!("close (shutdown)");
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        for namespace in self.open.clone() {
            self.leave(namespace).await?;
        }
        Ok(())
    }

    async fn start_sync(&mut self, namespace: NamespaceId, peers: Vec<PeerAddr>) -> Result<()> {
        self.ensure_open(&namespace)?;
        self.state.insert(namespace);

        // join the gossip swarm for the document
        let topic = TopicId::from_bytes(*namespace.as_bytes());
        if self.gossip_senders.contains_key(&namespace) {
            if !peers.is_empty() {
                // already joined, only pass the new bootstrap peers along
                let _topic = self.gossip.subscribe(topic, peers.clone()).await?;
            }
        } else {
            let (sender, receiver) = self.gossip.subscribe(topic, peers.clone()).await?.split();
            self.gossip_senders.insert(namespace, sender);
            self.gossip_events
                .push(receiver.map(move |event| (namespace, event)).boxed());
        }

        // trigger an initial sync exchange with each peer
        for peer in peers {
            self.sync_with_peer(namespace, peer.peer_id, SyncReason::DirectJoin);
        }
        Ok(())
    }

    async fn leave(&mut self, namespace: NamespaceId) -> Result<()> {
        if self.state.remove(&namespace) {
            self.gossip
                .quit(TopicId::from_bytes(*namespace.as_bytes()))
                .await?;
            self.gossip_senders.remove(&namespace);
        }
        if self.open.remove(&namespace) {
            if let Some(replica) = self.docs.get_replica(&namespace) {
                replica.unsubscribe(&self.replica_events_tx);
            }
        }
        self.subscribers.remove(&namespace);
        self.download_count.remove(&namespace);
        self.pending_ready.remove(&namespace);
        debug!(?namespace, "left");
        Ok(())
    }

    /// Subscribe the actor to a replica's insert events, once.
    fn ensure_open(&mut self, namespace: &NamespaceId) -> Result<Replica> {
        let replica = self
            .docs
            .get_replica(namespace)
            .with_context(|| format!("replica {namespace} not found"))?;
        if self.open.insert(*namespace) {
            replica.subscribe(self.replica_events_tx.clone());
        }
        Ok(replica)
    }

    fn subscribe(&mut self, namespace: NamespaceId, sender: flume::Sender<LiveEvent>) -> Result<()> {
        self.ensure_open(&namespace)?;
        self.subscribers.entry(namespace).or_default().push(sender);
        Ok(())
    }

    fn sync_with_peer(&mut self, namespace: NamespaceId, peer: PeerId, reason: SyncReason) {
        if !self.state.start_connect(&namespace, peer, reason) {
            return;
        }
        let Some(replica) = self.docs.get_replica(&namespace) else {
            return;
        };
        debug!(?namespace, peer = %peer.fmt_short(), ?reason, "sync[dial]: start");
        let endpoint = self.endpoint.clone();
        let blobs = self.blobs.clone();
        let fut = async move {
            let res = connect_and_sync(&endpoint, &replica, peer, blobs).await;
            (namespace, peer, Origin::Connect(reason), res)
        }
        .boxed();
        self.running_sync_connect.push(fut);
    }

    pub fn handle_connection(&mut self, conn: Connection) {
        let peer = conn.remote_peer_id();
        debug!(peer = %peer.fmt_short(), "sync[accept]: incoming connection");
        let docs = self.docs.clone();
        let blobs = self.blobs.clone();
        let fut = async move {
            let res = accept_and_sync(conn, &docs, blobs).await;
            (peer, res)
        }
        .boxed();
        self.running_sync_accept.push(fut);
    }

    fn on_sync_finished(
        &mut self,
        namespace: NamespaceId,
        peer: PeerId,
        origin: Origin,
        result: Result<()>,
    ) {
        match &result {
            Ok(()) => debug!(?namespace, peer = %peer.fmt_short(), ?origin, "sync: done"),
            Err(err) => warn!(?namespace, peer = %peer.fmt_short(), ?origin, ?err, "sync: failed"),
        }
        if !self.state.finish(&namespace, peer, &origin, result.is_ok()) {
            return;
        }
        let event = SyncEvent {
            namespace,
            peer,
            origin,
            finished: SystemTime::now(),
            result: result.map_err(|err| format!("{err:?}")),
        };
        self.notify(namespace, LiveEvent::SyncFinished(event));
        if self.download_count.get(&namespace).copied().unwrap_or(0) == 0 {
            self.notify(namespace, LiveEvent::PendingContentReady);
        } else {
            self.pending_ready.insert(namespace);
        }
    }

    async fn on_replica_event(&mut self, event: ReplicaEvent) -> Result<()> {
        match event {
            ReplicaEvent::LocalInsert { namespace, entry } => {
                // spread the entry through the swarm
                if let Some(sender) = self.gossip_senders.get(&namespace) {
                    let message = postcard::to_stdvec(&Op::Put(entry.clone()))?;
                    sender.broadcast(message.into()).await?;
                }
                self.notify(
                    namespace,
                    LiveEvent::InsertLocal {
                        entry: entry.entry().clone(),
                    },
                );
            }
            ReplicaEvent::RemoteInsert {
                namespace,
                entry,
                from,
                content_status: _,
            } => {
                let from = PeerId::from(from);
                let hash = *entry.content_hash();
                let local_status = self.blobs.entry_status(&hash);
                if !entry.is_empty() && !matches!(local_status, EntryStatus::Complete) {
                    // the delivering peer is our only download candidate
                    self.queue_download(namespace, hash, from);
                }
                self.notify(
                    namespace,
                    LiveEvent::InsertRemote {
                        from,
                        entry: entry.entry().clone(),
                        content_status: entry_to_content_status(local_status),
                    },
                );
            }
        }
        Ok(())
    }

    async fn on_gossip_event(
        &mut self,
        namespace: NamespaceId,
        event: Result<GossipNetEvent>,
    ) -> Result<()> {
        let event = match event? {
            GossipNetEvent::Gossip(event) => event,
            GossipNetEvent::Lagged => {
                warn!(?namespace, "gossip stream lagged, some updates were missed");
                return Ok(());
            }
        };
        match event {
            GossipEvent::Joined => {
                debug!(?namespace, "joined");
                self.notify(namespace, LiveEvent::Joined);
            }
            GossipEvent::NeighborUp(peer) => {
                debug!(?namespace, peer = %peer.fmt_short(), "neighbor up");
                self.sync_with_peer(namespace, peer, SyncReason::NewNeighbor);
                self.notify(namespace, LiveEvent::NeighborUp(peer));
            }
            GossipEvent::NeighborDown(peer) => {
                debug!(?namespace, peer = %peer.fmt_short(), "neighbor down");
                self.notify(namespace, LiveEvent::NeighborDown(peer));
            }
            GossipEvent::Received(message) => match postcard::from_bytes(&message.content)? {
                Op::Put(entry) => {
                    debug!(?namespace, peer = %message.delivered_from.fmt_short(), "received entry via gossip");
                    let replica = self
                        .docs
                        .get_replica(&namespace)
                        .context("replica not open")?;
                    // the download is queued in the replica event handler
                    replica.insert_remote_entry(
                        entry,
                        *message.delivered_from.as_bytes(),
                        ContentStatus::Complete,
                    )?;
                }
                Op::ContentReady(hash) => {
                    if !matches!(self.blobs.entry_status(&hash), EntryStatus::Complete) {
                        self.queue_download(namespace, hash, message.delivered_from);
                    }
                }
            },
        }
        Ok(())
    }

    fn queue_download(&mut self, namespace: NamespaceId, hash: Hash, peer: PeerId) {
        debug!(?namespace, hash = %hash.fmt_short(), peer = %peer.fmt_short(), "queue download");
        *self.download_count.entry(namespace).or_default() += 1;
        let endpoint = self.endpoint.clone();
        let blobs = self.blobs.clone();
        let fut = async move {
            let res = knot_blobs::net::fetch(&endpoint, peer, &blobs, HashAndFormat::raw(hash)).await;
            match res {
                Ok((tag, _stats)) => (namespace, hash, Some(tag)),
                Err(err) => {
                    warn!(hash = %hash.fmt_short(), peer = %peer.fmt_short(), ?err, "download failed");
                    (namespace, hash, None)
                }
            }
        }
        .boxed();
        self.pending_downloads.push(fut);
    }

    async fn on_download_finished(
        &mut self,
        namespace: NamespaceId,
        hash: Hash,
        tag: Option<knot_blobs::TempTag>,
    ) {
        if tag.is_some() {
            self.notify(namespace, LiveEvent::ContentReady { hash });
            // tell our neighbors that the content is now available here
            if let Some(sender) = self.gossip_senders.get(&namespace) {
                if let Ok(message) = postcard::to_stdvec(&Op::ContentReady(hash)) {
                    sender.broadcast(message.into()).await.ok();
                }
            }
        }
        let count = self.download_count.entry(namespace).or_default();
        *count = count.saturating_sub(1);
        if *count == 0 && self.pending_ready.remove(&namespace) {
            self.notify(namespace, LiveEvent::PendingContentReady);
        }
        // the temp tag kept the content pinned until subscribers were told
        drop(tag);
    }

    fn notify(&mut self, namespace: NamespaceId, event: LiveEvent) {
        if let Some(subs) = self.subscribers.get_mut(&namespace) {
            subs.retain(|sender| match sender.try_send(event.clone()) {
                Ok(()) => true,
                Err(flume::TrySendError::Full(_)) => {
                    warn!(?namespace, "dropping event for slow subscriber");
                    true
                }
                Err(flume::TrySendError::Disconnected(_)) => false,
            });
            if subs.is_empty() {
                self.subscribers.remove(&namespace);
            }
        }
    }
}

async fn connect_and_sync(
    endpoint: &Endpoint,
    replica: &Replica,
    peer: PeerId,
    blobs: knot_blobs::Store,
) -> Result<()> {
    let conn = endpoint.connect(peer, SYNC_ALPN).await?;
    let (send, recv) = conn.open_bi().await?;
    run_alice(send, recv, replica, *peer.as_bytes(), move |hash| {
        entry_to_content_status(blobs.entry_status(&hash))
    })
    .await
}

async fn accept_and_sync(
    conn: Connection,
    docs: &knot_docs::Store,
    blobs: knot_blobs::Store,
) -> Result<NamespaceId> {
    let peer = conn.remote_peer_id();
    let (send, recv) = conn.accept_bi().await?;
    run_bob(send, recv, docs, *peer.as_bytes(), move |hash| {
        entry_to_content_status(blobs.entry_status(&hash))
    })
    .await
}

pub(super) fn entry_to_content_status(status: EntryStatus) -> ContentStatus {
    match status {
        EntryStatus::Complete => ContentStatus::Complete,
        EntryStatus::Partial => ContentStatus::Incomplete,
        EntryStatus::NotFound => ContentStatus::Missing,
    }
}
