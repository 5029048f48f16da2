//! In-process endpoints connected through a shared [`Network`].
//!
//! A [`Connection`] is a pair of stream queues: either side can open a
//! bidirectional stream, which shows up on the other side's `accept_bi`.
//! Streams are tokio duplex pipes, so everything that works on
//! `AsyncRead + AsyncWrite` works here.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tracing::trace;

use crate::peer::{PeerAddr, PeerId};

/// Errors from connecting and stream handling.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The remote peer is not registered on this network.
    #[error("peer {0} is not reachable")]
    PeerUnreachable(PeerId),
    /// The connection or endpoint was closed.
    #[error("connection closed")]
    Closed,
}

/// Buffer size of a single stream pipe.
const STREAM_BUF: usize = 1 << 16;
/// Capacity of the per-connection stream queue and the per-endpoint
/// connection queue.
const QUEUE_CAP: usize = 32;

/// Sending half of a bidirectional stream.
pub type SendStream = WriteHalf<tokio::io::DuplexStream>;
/// Receiving half of a bidirectional stream.
pub type RecvStream = ReadHalf<tokio::io::DuplexStream>;

/// An in-process network: a registry of endpoints that can dial each other.
///
/// All endpoints created from one `Network` share an address space. Cloning
/// is cheap and shares the registry.
#[derive(Debug, Clone, Default)]
pub struct Network {
    registry: Arc<Mutex<HashMap<PeerId, mpsc::Sender<Incoming>>>>,
}

impl Network {
    /// Create a new, empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an endpoint with a fresh random peer id.
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint_with_id(PeerId::generate())
    }

    /// Create an endpoint with the given peer id.
    pub fn endpoint_with_id(&self, peer_id: PeerId) -> Endpoint {
        let (tx, rx) = mpsc::channel(QUEUE_CAP);
        self.registry.lock().insert(peer_id, tx);
        Endpoint {
            peer_id,
            network: self.clone(),
            incoming: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }

    fn route(&self, peer: &PeerId) -> Result<mpsc::Sender<Incoming>, Error> {
        self.registry
            .lock()
            .get(peer)
            .cloned()
            .ok_or(Error::PeerUnreachable(*peer))
    }
}

/// An endpoint bound to a [`Network`].
#[derive(Debug, Clone)]
pub struct Endpoint {
    peer_id: PeerId,
    network: Network,
    incoming: Arc<tokio::sync::Mutex<mpsc::Receiver<Incoming>>>,
}

impl Endpoint {
    /// The peer id of this endpoint.
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Connect to a peer, negotiating the given protocol identifier.
    pub async fn connect(
        &self,
        addr: impl Into<PeerAddr>,
        alpn: &[u8],
    ) -> Result<Connection, Error> {
        let addr: PeerAddr = addr.into();
        let route = self.network.route(&addr.peer_id)?;
        let (local_tx, remote_rx) = mpsc::channel(QUEUE_CAP);
        let (remote_tx, local_rx) = mpsc::channel(QUEUE_CAP);
        let local = Connection {
            remote: addr.peer_id,
            outgoing: local_tx,
            incoming: Arc::new(tokio::sync::Mutex::new(local_rx)),
        };
        let remote = Connection {
            remote: self.peer_id,
            outgoing: remote_tx,
            incoming: Arc::new(tokio::sync::Mutex::new(remote_rx)),
        };
        trace!(me = %self.peer_id.fmt_short(), remote = %addr.peer_id.fmt_short(), "connect");
        route
            .send(Incoming {
                alpn: alpn.to_vec(),
                conn: remote,
            })
            .await
            .map_err(|_| Error::PeerUnreachable(addr.peer_id))?;
        Ok(local)
    }

    /// Accept the next incoming connection.
    ///
    /// Returns `None` once the endpoint is closed.
    pub async fn accept(&self) -> Option<Incoming> {
        self.incoming.lock().await.recv().await
    }

    /// Remove this endpoint from the network.
    ///
    /// Peers attempting to connect afterwards get [`Error::PeerUnreachable`].
    pub fn close(&self) {
        self.network.registry.lock().remove(&self.peer_id);
    }
}

/// An incoming connection, tagged with the negotiated protocol.
#[derive(Debug)]
pub struct Incoming {
    /// The protocol identifier the remote asked for.
    pub alpn: Vec<u8>,
    /// The connection itself.
    pub conn: Connection,
}

/// A connection between two endpoints.
#[derive(Debug, Clone)]
pub struct Connection {
    remote: PeerId,
    outgoing: mpsc::Sender<tokio::io::DuplexStream>,
    incoming: Arc<tokio::sync::Mutex<mpsc::Receiver<tokio::io::DuplexStream>>>,
}

impl Connection {
    /// The peer id of the remote side.
    pub fn remote_peer_id(&self) -> PeerId {
        self.remote
    }

    /// Open a bidirectional stream.
    pub async fn open_bi(&self) -> Result<(SendStream, RecvStream), Error> {
        let (local, remote) = tokio::io::duplex(STREAM_BUF);
        self.outgoing.send(remote).await.map_err(|_| Error::Closed)?;
        let (recv, send) = tokio::io::split(local);
        Ok((send, recv))
    }

    /// Accept a bidirectional stream opened by the remote.
    pub async fn accept_bi(&self) -> Result<(SendStream, RecvStream), Error> {
        let stream = self
            .incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or(Error::Closed)?;
        let (recv, send) = tokio::io::split(stream);
        Ok((send, recv))
    }
}
