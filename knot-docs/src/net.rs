//! Running a sync session over a byte stream.
//!
//! The initiating side calls [`run_alice`] with the replica to sync, the
//! accepting side calls [`run_bob`] with its store and learns from the first
//! message which namespace the peer wants to sync.

use anyhow::{anyhow, bail, ensure, Context, Result};
use bytes::{Buf, BufMut, BytesMut};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};
use tracing::debug;

use knot_base::Hash;

use crate::keys::NamespaceId;
use crate::ranger;
use crate::store::Store;
use crate::sync::{ContentStatus, PeerIdBytes, Replica, SignedEntry};

/// Messages exchanged in a sync session.
#[derive(Debug, Serialize, Deserialize)]
enum Message {
    /// The first message, sent by the initiating side.
    Init {
        namespace: NamespaceId,
        message: ranger::Message<SignedEntry>,
    },
    /// All further messages, from either side.
    Sync(ranger::Message<SignedEntry>),
}

const MAX_MESSAGE_SIZE: usize = 1024 * 1024 * 4;

/// Length-prefixed postcard framing for sync messages.
#[derive(Debug, Default)]
struct SyncCodec;

impl Decoder for SyncCodec {
    type Item = Message;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes(src[..4].try_into().expect("just checked")) as usize;
        ensure!(
            len <= MAX_MESSAGE_SIZE,
            "message of size {len} exceeds maximum of {MAX_MESSAGE_SIZE}"
        );
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }
        src.advance(4);
        let message = postcard::from_bytes(&src.split_to(len))?;
        Ok(Some(message))
    }
}

impl Encoder<Message> for SyncCodec {
    type Error = anyhow::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        let data = postcard::to_stdvec(&item)?;
        ensure!(
            data.len() <= MAX_MESSAGE_SIZE,
            "message of size {} exceeds maximum of {MAX_MESSAGE_SIZE}",
            data.len()
        );
        dst.put_u32(data.len() as u32);
        dst.extend_from_slice(&data);
        Ok(())
    }
}

/// Run the initiating side of a sync session.
///
/// `content_status_cb` supplies the content status sent along with outgoing
/// entries, `other_peer_id` is recorded as the source of received entries.
pub async fn run_alice<W, R>(
    writer: W,
    reader: R,
    replica: &Replica,
    other_peer_id: PeerIdBytes,
    content_status_cb: impl Fn(Hash) -> ContentStatus,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let mut reader = FramedRead::new(reader, SyncCodec);
    let mut writer = FramedWrite::new(writer, SyncCodec);

    debug!(namespace = %replica.namespace(), "sync out: start");
    writer
        .send(Message::Init {
            namespace: replica.namespace(),
            message: replica.sync_initial_message(),
        })
        .await?;

    while let Some(message) = reader.next().await {
        match message? {
            Message::Init { .. } => bail!("unexpected init message"),
            Message::Sync(message) => {
                match replica.sync_process_message(message, other_peer_id, &content_status_cb)? {
                    Some(reply) => writer.send(Message::Sync(reply)).await?,
                    None => break,
                }
            }
        }
    }
    debug!(namespace = %replica.namespace(), "sync out: done");
    Ok(())
}

/// Run the accepting side of a sync session.
///
/// The namespace to sync is taken from the init message; syncing a
/// namespace the store does not have is an error. Returns the namespace
/// that was synced.
pub async fn run_bob<W, R>(
    writer: W,
    reader: R,
    store: &Store,
    other_peer_id: PeerIdBytes,
    content_status_cb: impl Fn(Hash) -> ContentStatus,
) -> Result<NamespaceId>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let mut reader = FramedRead::new(reader, SyncCodec);
    let mut writer = FramedWrite::new(writer, SyncCodec);

    let mut replica: Option<Replica> = None;
    while let Some(message) = reader.next().await {
        match message? {
            Message::Init { namespace, message } => {
                ensure!(replica.is_none(), "double init message");
                let r = store
                    .get_replica(&namespace)
                    .ok_or_else(|| anyhow!("cannot sync unknown namespace {namespace}"))?;
                debug!(namespace = %namespace, "sync in: start");
                let reply = r.sync_process_message(message, other_peer_id, &content_status_cb)?;
                replica = Some(r);
                match reply {
                    Some(reply) => writer.send(Message::Sync(reply)).await?,
                    None => break,
                }
            }
            Message::Sync(message) => {
                let r = replica
                    .as_ref()
                    .context("sync message before init message")?;
                match r.sync_process_message(message, other_peer_id, &content_status_cb)? {
                    Some(reply) => writer.send(Message::Sync(reply)).await?,
                    None => break,
                }
            }
        }
    }

    let replica = replica.context("connection closed before init message")?;
    debug!(namespace = %replica.namespace(), "sync in: done");
    Ok(replica.namespace())
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha12Rng;

    use crate::keys::Namespace;
    use crate::store::Query;

    use super::*;

    fn status(_: Hash) -> ContentStatus {
        ContentStatus::Complete
    }

    #[tokio::test]
    async fn test_sync_session() -> Result<()> {
        let mut rng = ChaCha12Rng::seed_from_u64(4);
        let namespace = Namespace::new(&mut rng);

        let alice_store = Store::new();
        let alice_replica = alice_store.open_replica(namespace.clone());
        let alice_author = alice_store.new_author(&mut rng);
        for i in 0..10 {
            alice_replica.hash_and_insert(format!("alice/{i}"), &alice_author, b"a")?;
        }

        let bob_store = Store::new();
        let bob_replica = bob_store.open_replica(namespace);
        let bob_author = bob_store.new_author(&mut rng);
        for i in 0..10 {
            bob_replica.hash_and_insert(format!("bob/{i}"), &bob_author, b"b")?;
        }

        let (alice_stream, bob_stream) = tokio::io::duplex(1024);
        let (alice_read, alice_write) = tokio::io::split(alice_stream);
        let (bob_read, bob_write) = tokio::io::split(bob_stream);

        let alice = run_alice(alice_write, alice_read, &alice_replica, [2u8; 32], status);
        let bob = run_bob(bob_write, bob_read, &bob_store, [1u8; 32], status);
        let (alice_res, bob_res) = tokio::join!(alice, bob);
        alice_res?;
        assert_eq!(bob_res?, alice_replica.namespace());

        let namespace = alice_replica.namespace();
        let alice_entries = alice_store.get_many(namespace, Query::all())?;
        let bob_entries = bob_store.get_many(namespace, Query::all())?;
        assert_eq!(alice_entries.len(), 20);
        assert_eq!(alice_entries, bob_entries);
        Ok(())
    }

    #[tokio::test]
    async fn test_sync_unknown_namespace_fails() -> Result<()> {
        let mut rng = ChaCha12Rng::seed_from_u64(5);
        let alice_store = Store::new();
        let alice_replica = alice_store.new_replica(&mut rng);
        let author = alice_store.new_author(&mut rng);
        alice_replica.hash_and_insert("key", &author, b"data")?;

        // bob's store has no replica for alice's namespace
        let bob_store = Store::new();

        let (alice_stream, bob_stream) = tokio::io::duplex(1024);
        let (alice_read, alice_write) = tokio::io::split(alice_stream);
        let (bob_read, bob_write) = tokio::io::split(bob_stream);

        let alice = run_alice(alice_write, alice_read, &alice_replica, [2u8; 32], status);
        let bob = run_bob(bob_write, bob_read, &bob_store, [1u8; 32], status);
        let (alice_res, bob_res) = tokio::join!(alice, bob);
        assert!(bob_res.is_err());
        // alice sees the connection close without receiving a reply
        alice_res?;
        Ok(())
    }
}
