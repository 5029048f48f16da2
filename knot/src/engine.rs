//! The live sync engine.
//!
//! The [`Engine`] ties the document store, the blob store, gossip and the
//! endpoint together. It spawns an actor that keeps joined documents in sync:
//! local inserts are broadcast over gossip, remote inserts are merged into
//! the replica and their content is fetched from the peer that announced it,
//! and new gossip neighbors trigger a reconciliation exchange.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, error_span, warn, Instrument};

use knot_base::HashAndFormat;
use knot_docs::{Namespace, NamespaceId};
use knot_gossip::net::{Gossip, GOSSIP_ALPN};
use knot_net::{Endpoint, Incoming, PeerAddr};

mod live;
mod state;

pub use live::{LiveEvent, Op, SyncEvent, SYNC_ALPN};
pub use state::{Origin, SyncReason};

use live::{LiveActor, ToLiveActor};

use crate::docs::Doc;
use crate::ticket::{Capability, DocTicket};

const ACTOR_CHANNEL_CAP: usize = 64;
const SUBSCRIBE_CHANNEL_CAP: usize = 64;

/// Handle to the sync engine.
///
/// Cheaply cloneable. All clones address the same actor, and the actor runs
/// until [`Engine::shutdown`] is called or all handles are dropped.
#[derive(Debug, Clone)]
pub struct Engine {
    endpoint: Endpoint,
    gossip: Gossip,
    docs: knot_docs::Store,
    blobs: knot_blobs::Store,
    to_live_actor: mpsc::Sender<ToLiveActor>,
    #[allow(dead_code)]
    actor_handle: Arc<tokio::task::JoinHandle<()>>,
}

impl Engine {
    /// Start the sync engine.
    ///
    /// Spawns the live actor and a loop accepting incoming connections on
    /// the endpoint, dispatching them by protocol to sync, blobs or gossip.
    pub fn spawn(
        endpoint: Endpoint,
        gossip: Gossip,
        docs: knot_docs::Store,
        blobs: knot_blobs::Store,
    ) -> Self {
        let (to_live_actor, inbox) = mpsc::channel(ACTOR_CHANNEL_CAP);
        let me = endpoint.peer_id();
        let mut actor = LiveActor::new(
            endpoint.clone(),
            gossip.clone(),
            docs.clone(),
            blobs.clone(),
            inbox,
        );
        let actor_handle = tokio::spawn(
            async move {
                if let Err(err) = actor.run().await {
                    error!(?err, "sync actor failed");
                }
            }
            .instrument(error_span!("sync", me = %me.fmt_short())),
        );
        let engine = Self {
            endpoint,
            gossip,
            docs,
            blobs,
            to_live_actor,
            actor_handle: Arc::new(actor_handle),
        };
        engine.spawn_accept_loop();
        engine
    }

    fn spawn_accept_loop(&self) {
        let engine = self.clone();
        let me = self.endpoint.peer_id();
        tokio::spawn(
            async move {
                while let Some(incoming) = engine.endpoint.accept().await {
                    if let Err(err) = engine.handle_incoming(incoming).await {
                        warn!(?err, "failed to handle incoming connection");
                    }
                }
            }
            .instrument(error_span!("accept", me = %me.fmt_short())),
        );
    }

    /// Dispatch an incoming connection to the protocol handler its ALPN
    /// names.
    async fn handle_incoming(&self, incoming: Incoming) -> Result<()> {
        let Incoming { alpn, conn } = incoming;
        if alpn == SYNC_ALPN {
            self.to_live_actor
                .send(ToLiveActor::HandleConnection { conn })
                .await?;
        } else if alpn == knot_blobs::net::ALPN {
            let blobs = self.blobs.clone();
            tokio::spawn(async move {
                if let Err(err) = knot_blobs::net::handle_connection(blobs, conn).await {
                    warn!(?err, "blob connection failed");
                }
            });
        } else if alpn == GOSSIP_ALPN {
            self.gossip.handle_connection(conn).await?;
        } else {
            bail!("ignoring connection with unsupported ALPN {alpn:?}");
        }
        Ok(())
    }

    /// Start to sync a document with a set of peers.
    pub async fn start_sync(&self, namespace: NamespaceId, peers: Vec<PeerAddr>) -> Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.to_live_actor
            .send(ToLiveActor::StartSync {
                namespace,
                peers,
                reply,
            })
            .await?;
        reply_rx.await?
    }

    /// Stop syncing a document and leave its swarm.
    pub async fn leave(&self, namespace: NamespaceId) -> Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.to_live_actor
            .send(ToLiveActor::Leave { namespace, reply })
            .await?;
        reply_rx.await?
    }

    /// Subscribe to the [`LiveEvent`]s of a document.
    ///
    /// Events for slow subscribers are dropped, the stream itself stays
    /// subscribed until the receiver is dropped.
    pub async fn subscribe(&self, namespace: NamespaceId) -> Result<flume::Receiver<LiveEvent>> {
        let (sender, receiver) = flume::bounded(SUBSCRIBE_CHANNEL_CAP);
        let (reply, reply_rx) = oneshot::channel();
        self.to_live_actor
            .send(ToLiveActor::Subscribe {
                namespace,
                sender,
                reply,
            })
            .await?;
        reply_rx.await??;
        Ok(receiver)
    }

    /// Shut down the engine and close the endpoint.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.to_live_actor.send(ToLiveActor::Shutdown { reply }).await?;
        reply_rx.await?;
        self.endpoint.close();
        Ok(())
    }

    /// Create a new, empty document.
    pub fn create_doc(&self) -> Result<Doc> {
        let replica = self.docs.new_replica(&mut rand::rngs::OsRng);
        Ok(Doc::new(self.clone(), replica.namespace()))
    }

    /// Open a document that exists in the local store.
    pub fn open_doc(&self, namespace: NamespaceId) -> Result<Doc> {
        self.docs
            .get_replica(&namespace)
            .with_context(|| format!("document {namespace} not found"))?;
        Ok(Doc::new(self.clone(), namespace))
    }

    /// Import a document from its namespace secret.
    pub fn import_doc(&self, namespace: Namespace) -> Doc {
        let replica = self.docs.open_replica(namespace);
        Doc::new(self.clone(), replica.namespace())
    }

    /// Import a document from a ticket and start to sync with the peers the
    /// ticket names.
    ///
    /// A write ticket carries the namespace secret and opens the document
    /// locally. A read ticket only carries the identifier, so it requires the
    /// document to already exist in the local store.
    pub async fn import_ticket(&self, ticket: DocTicket) -> Result<Doc> {
        let doc = match ticket.capability {
            Capability::Write(namespace) => self.import_doc(namespace),
            Capability::Read(id) => self.open_doc(id)?,
        };
        self.start_sync(doc.id(), ticket.peers).await?;
        Ok(doc)
    }

    /// The hashes of all live entries across all open documents.
    ///
    /// This is the protected set for blob garbage collection: content that a
    /// document still refers to must not be swept.
    pub fn content_roots(&self) -> Vec<HashAndFormat> {
        let mut roots = Vec::new();
        for namespace in self.docs.list_replicas() {
            let Some(replica) = self.docs.get_replica(&namespace) else {
                continue;
            };
            for entry in replica.all() {
                if !entry.is_empty() {
                    roots.push(HashAndFormat::raw(*entry.content_hash()));
                }
            }
        }
        roots
    }

    /// A callback suitable for [`knot_blobs::gc::gc_loop`] that protects all
    /// document content from collection.
    pub fn gc_protect_callback(&self) -> impl Fn() -> Vec<HashAndFormat> + Send + 'static {
        let engine = self.clone();
        move || engine.content_roots()
    }

    /// The endpoint this engine accepts connections on.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// The document store.
    pub fn docs(&self) -> &knot_docs::Store {
        &self.docs
    }

    /// The blob store.
    pub fn blobs(&self) -> &knot_blobs::Store {
        &self.blobs
    }
}
