//! Fetching blobs from peers and serving them.
//!
//! The protocol is a single request/response exchange per stream. The
//! requester sends a [`GetRequest`] and the provider answers with the root
//! blob, followed by every child blob if the root is a hash sequence. Each
//! blob is announced with a small header frame and then sent as raw bytes.
//! The requester verifies every blob by rehashing before it is stored, so a
//! misbehaving provider cannot poison the store.

use anyhow::{bail, ensure, Context, Result};
use bytes::Bytes;
use knot_base::{Hash, HashAndFormat};
use knot_net::{Connection, Endpoint, PeerAddr};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::hashseq::HashSeq;
use crate::store::Store;
use crate::util::TempTag;

/// The protocol identifier for blob transfer.
pub const ALPN: &[u8] = b"/knot/blobs/1";

/// Maximum size of a header frame.
const MAX_FRAME_SIZE: u32 = 1024;
/// Maximum size of a single blob accepted over the wire.
const MAX_BLOB_SIZE: u64 = 1 << 30;

/// A request for a blob or collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRequest {
    /// The root content to fetch.
    pub content: HashAndFormat,
}

/// Header announcing one blob in the response.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum BlobHeader {
    /// The provider does not have this blob.
    NotFound { hash: Hash },
    /// The blob follows as `size` raw bytes.
    Data { hash: Hash, size: u64 },
}

/// Statistics of a fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Number of blobs received and stored.
    pub blobs_fetched: usize,
    /// Number of blobs the provider did not have.
    pub blobs_missing: usize,
    /// Total payload bytes received.
    pub bytes_read: u64,
}

async fn write_frame<T: Serialize>(writer: &mut (impl AsyncWrite + Unpin), frame: &T) -> Result<()> {
    let data = postcard::to_stdvec(frame)?;
    ensure!(data.len() as u32 <= MAX_FRAME_SIZE, "frame too large");
    writer.write_u32(data.len() as u32).await?;
    writer.write_all(&data).await?;
    Ok(())
}

async fn read_frame<T: DeserializeOwned>(reader: &mut (impl AsyncRead + Unpin)) -> Result<T> {
    let len = reader.read_u32().await?;
    ensure!(len <= MAX_FRAME_SIZE, "frame of {len} bytes exceeds limit");
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(postcard::from_bytes(&buf)?)
}

/// Fetch content from a peer into the store.
///
/// Returns a temp tag pinning the fetched content along with transfer
/// statistics. Children the provider is missing are skipped and counted in
/// [`Stats::blobs_missing`]; a missing root is an error.
pub async fn fetch(
    endpoint: &Endpoint,
    peer: impl Into<PeerAddr>,
    store: &Store,
    content: HashAndFormat,
) -> Result<(TempTag, Stats)> {
    let peer: PeerAddr = peer.into();
    // pin first so nothing fetched so far is collected mid transfer
    let tag = store.temp_tag(content);
    let conn = endpoint
        .connect(peer.clone(), ALPN)
        .await
        .with_context(|| format!("failed to connect to {}", peer.peer_id))?;
    let (mut send, mut recv) = conn.open_bi().await?;
    write_frame(&mut send, &GetRequest { content }).await?;

    let mut stats = Stats::default();
    let root = recv_blob(&mut recv, content.hash, store, &mut stats)
        .await?
        .context("provider does not have the requested root")?;
    if content.format.is_hash_seq() {
        let seq = HashSeq::new(root)?;
        for hash in seq.iter() {
            let found = recv_blob(&mut recv, hash, store, &mut stats).await?;
            if found.is_none() {
                stats.blobs_missing += 1;
            }
        }
    }
    debug!(
        hash = %content.hash.fmt_short(),
        fetched = stats.blobs_fetched,
        missing = stats.blobs_missing,
        bytes = stats.bytes_read,
        "fetch done"
    );
    Ok((tag, stats))
}

/// Receive one announced blob, verify it and store it.
///
/// Returns the blob data, or `None` if the provider announced it as missing.
async fn recv_blob(
    recv: &mut (impl AsyncRead + Unpin),
    expected: Hash,
    store: &Store,
    stats: &mut Stats,
) -> Result<Option<Bytes>> {
    match read_frame::<BlobHeader>(recv).await? {
        BlobHeader::NotFound { hash } => {
            ensure!(hash == expected, "provider answered for the wrong hash");
            Ok(None)
        }
        BlobHeader::Data { hash, size } => {
            ensure!(hash == expected, "provider answered for the wrong hash");
            ensure!(size <= MAX_BLOB_SIZE, "blob of {size} bytes exceeds limit");
            let mut data = vec![0u8; size as usize];
            recv.read_exact(&mut data).await?;
            let data = Bytes::from(data);
            if Hash::new(&data) != expected {
                bail!("provider sent data that does not match hash {expected}");
            }
            store.import_bytes(data.clone(), knot_base::BlobFormat::Raw);
            stats.blobs_fetched += 1;
            stats.bytes_read += size;
            Ok(Some(data))
        }
    }
}

/// Serve blob requests on a connection until the peer goes away.
pub async fn handle_connection(store: Store, conn: Connection) -> Result<()> {
    while let Ok((mut send, mut recv)) = conn.accept_bi().await {
        let request: GetRequest = read_frame(&mut recv).await?;
        trace!(
            peer = %conn.remote_peer_id().fmt_short(),
            hash = %request.content.hash.fmt_short(),
            "incoming blob request"
        );
        let root = send_blob(&mut send, &store, request.content.hash).await?;
        if request.content.format.is_hash_seq() {
            if let Some(root) = root {
                let seq = HashSeq::new(root)?;
                for hash in seq.iter() {
                    send_blob(&mut send, &store, hash).await?;
                }
            }
        }
    }
    Ok(())
}

async fn send_blob(
    send: &mut (impl AsyncWrite + Unpin),
    store: &Store,
    hash: Hash,
) -> Result<Option<Bytes>> {
    match store.get(&hash) {
        Some(data) => {
            write_frame(
                send,
                &BlobHeader::Data {
                    hash,
                    size: data.len() as u64,
                },
            )
            .await?;
            send.write_all(&data).await?;
            Ok(Some(data))
        }
        None => {
            write_frame(send, &BlobHeader::NotFound { hash }).await?;
            Ok(None)
        }
    }
}
