//! Client API for working with documents.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use futures::StreamExt;

use knot_base::{BlobFormat, Hash, HashAndFormat};
use knot_blobs::fs::{AddProgress, WrapOption};
use knot_docs::{Author, AuthorId, NamespaceId, Query, Replica, SignedEntry};
use knot_net::PeerAddr;

use crate::engine::{Engine, LiveEvent};
use crate::ticket::{Capability, DocTicket};

/// Whether a shared ticket grants write access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareMode {
    /// The ticket only allows reading the document.
    Read,
    /// The ticket carries the namespace secret and allows writing.
    Write,
}

/// A single document.
///
/// A document is a multi-writer key-value store. Entries map an author and a
/// key to the hash of a content blob, which lives in the node's blob store.
/// Writing a key stores the content and the entry, reading resolves the
/// entry back to its content.
#[derive(Debug, Clone)]
pub struct Doc {
    engine: Engine,
    namespace: NamespaceId,
}

impl Doc {
    pub(crate) fn new(engine: Engine, namespace: NamespaceId) -> Self {
        Self { engine, namespace }
    }

    /// The identifier of this document.
    pub fn id(&self) -> NamespaceId {
        self.namespace
    }

    fn replica(&self) -> Result<Replica> {
        self.engine
            .docs()
            .get_replica(&self.namespace)
            .with_context(|| format!("document {} not found", self.namespace))
    }

    /// Store content and insert an entry for it under `key`.
    ///
    /// Returns the hash of the content.
    pub fn set_bytes(
        &self,
        author: &Author,
        key: impl AsRef<[u8]>,
        content: impl Into<Bytes>,
    ) -> Result<Hash> {
        let content = content.into();
        let len = content.len() as u64;
        // hold the tag until the entry protects the content
        let tag = self.engine.blobs().import_bytes(content, BlobFormat::Raw);
        let hash = *tag.hash();
        self.replica()?.insert(key, author, hash, len)?;
        drop(tag);
        Ok(hash)
    }

    /// Insert an entry for content that is already in the blob store.
    pub fn set_hash(
        &self,
        author: &Author,
        key: impl AsRef<[u8]>,
        hash: Hash,
        len: u64,
    ) -> Result<()> {
        self.replica()?.insert(key, author, hash, len)
    }

    /// Mark a key as deleted for this author.
    pub fn del(&self, author: &Author, key: impl AsRef<[u8]>) -> Result<()> {
        self.replica()?.delete(key, author)
    }

    /// Get the latest entry for an exact author and key.
    pub fn get_one(&self, author: AuthorId, key: impl AsRef<[u8]>) -> Result<Option<SignedEntry>> {
        self.engine.docs().get_one(self.namespace, author, key)
    }

    /// Get the entries matching a query.
    pub fn get_many(&self, query: impl Into<Query>) -> Result<Vec<SignedEntry>> {
        self.engine.docs().get_many(self.namespace, query)
    }

    /// The content bytes an entry points at, if available locally.
    pub fn content_bytes(&self, entry: &SignedEntry) -> Option<Bytes> {
        self.engine.blobs().get(entry.content_hash())
    }

    /// Import a file from the local filesystem and insert an entry for it.
    ///
    /// Returns the hash and size of the imported content. The file is read
    /// and hashed before the entry is written, so a failed import leaves the
    /// document untouched.
    pub async fn import_file(
        &self,
        author: &Author,
        key: impl AsRef<[u8]>,
        path: impl Into<PathBuf>,
    ) -> Result<(Hash, u64)> {
        let blobs = self.engine.blobs().clone();
        let mut stream = std::pin::pin!(knot_blobs::fs::import_path(
            blobs,
            path.into(),
            WrapOption::NoWrap
        ));
        while let Some(progress) = stream.next().await {
            match progress {
                AddProgress::AllDone { hash, .. } => {
                    let len = self
                        .engine
                        .blobs()
                        .get_size(&hash)
                        .context("imported blob missing from store")?;
                    self.set_hash(author, key, hash, len)?;
                    return Ok((hash, len));
                }
                AddProgress::Abort(reason) => bail!("import failed: {reason}"),
                AddProgress::Found { .. } | AddProgress::Progress { .. } | AddProgress::Done { .. } => {}
            }
        }
        bail!("import stream ended without a terminal event")
    }

    /// Export the content of an entry to a file on the local filesystem.
    pub async fn export_file(&self, entry: &SignedEntry, path: impl Into<PathBuf>) -> Result<()> {
        let content = HashAndFormat::raw(*entry.content_hash());
        knot_blobs::fs::export_path(self.engine.blobs().clone(), content, path.into()).await
    }

    /// Start to sync this document with a set of peers.
    pub async fn start_sync(&self, peers: Vec<PeerAddr>) -> Result<()> {
        self.engine.start_sync(self.namespace, peers).await
    }

    /// Stop syncing this document.
    pub async fn leave(&self) -> Result<()> {
        self.engine.leave(self.namespace).await
    }

    /// Subscribe to the live events of this document.
    pub async fn subscribe(&self) -> Result<flume::Receiver<LiveEvent>> {
        self.engine.subscribe(self.namespace).await
    }

    /// Create a ticket to share this document.
    ///
    /// The ticket names this node as bootstrap peer. Sharing in
    /// [`ShareMode::Write`] includes the namespace secret, so the receiver
    /// gains full write access.
    pub fn share(&self, mode: ShareMode) -> Result<DocTicket> {
        let capability = match mode {
            ShareMode::Write => Capability::Write(self.replica()?.secret()),
            ShareMode::Read => Capability::Read(self.namespace),
        };
        let me = PeerAddr::new(self.engine.endpoint().peer_id());
        Ok(DocTicket::new(capability, vec![me]))
    }
}
