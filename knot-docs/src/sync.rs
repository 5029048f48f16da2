//! Replicas of a document and the signed entries they hold.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{ensure, Result};
use ed25519_dalek::{Signature, SignatureError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use knot_base::Hash;

use crate::keys::{Author, AuthorId, Namespace, NamespaceId};
use crate::ranger::{Fingerprint, InsertOutcome, Message, Peer, RangeEntry};

/// Whether the content referenced by an entry is available locally.
///
/// Travels alongside entries during sync, so the receiver knows whether the
/// sender could serve the content blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentStatus {
    /// The content is completely available.
    Complete,
    /// Some of the content is available.
    Incomplete,
    /// The content is missing.
    Missing,
}

/// The identifier of the peer that delivered an entry.
pub type PeerIdBytes = [u8; 32];

/// Events emitted from a replica to its subscribers.
#[derive(Debug, Clone)]
pub enum Event {
    /// An entry was inserted by a local author.
    LocalInsert {
        /// The namespace where the insert happened.
        namespace: NamespaceId,
        /// The inserted entry.
        entry: SignedEntry,
    },
    /// An entry was received from a peer.
    RemoteInsert {
        /// The namespace where the insert happened.
        namespace: NamespaceId,
        /// The inserted entry.
        entry: SignedEntry,
        /// The peer that delivered the entry.
        from: PeerIdBytes,
        /// Whether the peer has the content for the entry.
        content_status: ContentStatus,
    },
}

/// The metadata of an entry: when it was written, and what it points at.
///
/// The ordering of records is the conflict resolution function: for two
/// entries with the same identifier, the greater record wins. Later
/// timestamps beat earlier ones, ties go to the greater content hash, and
/// full equality means the entries are identical.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    timestamp: u64,
    len: u64,
    hash: Hash,
}

impl Record {
    /// Create a new record.
    pub fn new(timestamp: u64, len: u64, hash: Hash) -> Self {
        Self {
            timestamp,
            len,
            hash,
        }
    }

    /// A tombstone record: empty hash, zero length.
    pub fn empty(timestamp: u64) -> Self {
        Self::new(timestamp, 0, Hash::EMPTY)
    }

    /// The timestamp of this record, microseconds since the unix epoch as
    /// seen by the writing replica.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// The length of the content in bytes.
    pub fn content_len(&self) -> u64 {
        self.len
    }

    /// The hash of the content.
    pub fn content_hash(&self) -> &Hash {
        &self.hash
    }

    /// Whether this record is a tombstone.
    pub fn is_empty(&self) -> bool {
        self.hash == Hash::EMPTY
    }
}

impl PartialOrd for Record {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Record {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.hash.cmp(&other.hash))
            .then_with(|| self.len.cmp(&other.len))
    }
}

/// The identifier of an entry: namespace, author and key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordIdentifier {
    key: Vec<u8>,
    namespace: NamespaceId,
    author: AuthorId,
}

impl RecordIdentifier {
    /// Create a new record identifier.
    pub fn new(key: impl AsRef<[u8]>, namespace: NamespaceId, author: AuthorId) -> Self {
        Self {
            key: key.as_ref().to_vec(),
            namespace,
            author,
        }
    }

    /// The key of this entry.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// The namespace of this entry.
    pub fn namespace(&self) -> NamespaceId {
        self.namespace
    }

    /// The author of this entry.
    pub fn author(&self) -> AuthorId {
        self.author
    }
}

impl PartialOrd for RecordIdentifier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RecordIdentifier {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| self.author.cmp(&other.author))
            .then_with(|| self.namespace.cmp(&other.namespace))
    }
}

impl Default for RecordIdentifier {
    fn default() -> Self {
        // only used as the anchor key of full ranges, any valid value works.
        // [1, 0, ..] encodes the identity point, which is a valid key.
        let mut identity = [0u8; 32];
        identity[0] = 1;
        Self {
            key: Vec::new(),
            namespace: NamespaceId::from_bytes(&identity).expect("identity point is a valid key"),
            author: AuthorId::from_bytes(&identity).expect("identity point is a valid key"),
        }
    }
}

/// An entry in a document, not yet signed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    id: RecordIdentifier,
    record: Record,
}

impl Entry {
    /// Create a new entry.
    pub fn new(id: RecordIdentifier, record: Record) -> Self {
        Self { id, record }
    }

    /// The identifier of this entry.
    pub fn id(&self) -> &RecordIdentifier {
        &self.id
    }

    /// The record of this entry.
    pub fn record(&self) -> &Record {
        &self.record
    }

    /// The key of this entry.
    pub fn key(&self) -> &[u8] {
        self.id.key()
    }

    /// The author of this entry.
    pub fn author(&self) -> AuthorId {
        self.id.author()
    }

    /// The hash of the content this entry points at.
    pub fn content_hash(&self) -> &Hash {
        self.record.content_hash()
    }

    /// The length of the content this entry points at.
    pub fn content_len(&self) -> u64 {
        self.record.content_len()
    }

    /// Whether this entry is a tombstone.
    pub fn is_empty(&self) -> bool {
        self.record.is_empty()
    }

    /// The canonical byte encoding, used for signing.
    pub fn to_vec(&self) -> Vec<u8> {
        postcard::to_stdvec(self).expect("postcard::to_stdvec is infallible")
    }

    /// Sign this entry with both the author and the namespace key.
    pub fn sign(self, namespace: &Namespace, author: &Author) -> SignedEntry {
        let bytes = self.to_vec();
        let signature = EntrySignature {
            namespace_signature: namespace.sign(&bytes),
            author_signature: author.sign(&bytes),
        };
        SignedEntry {
            signature,
            entry: self,
        }
    }
}

/// Signatures over the canonical encoding of an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySignature {
    namespace_signature: Signature,
    author_signature: Signature,
}

/// An entry with the signatures that prove who wrote it and to which
/// document it belongs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEntry {
    signature: EntrySignature,
    entry: Entry,
}

impl SignedEntry {
    /// Verify both signatures.
    pub fn verify(&self) -> Result<(), SignatureError> {
        let bytes = self.entry.to_vec();
        self.entry
            .id
            .namespace()
            .verify(&bytes, &self.signature.namespace_signature)?;
        self.entry
            .id
            .author()
            .verify(&bytes, &self.signature.author_signature)?;
        Ok(())
    }

    /// The entry.
    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    /// The identifier of the entry.
    pub fn id(&self) -> &RecordIdentifier {
        &self.entry.id
    }

    /// The author of the entry.
    pub fn author(&self) -> AuthorId {
        self.entry.id.author()
    }

    /// The namespace of the entry.
    pub fn namespace(&self) -> NamespaceId {
        self.entry.id.namespace()
    }

    /// The key of the entry.
    pub fn key(&self) -> &[u8] {
        self.entry.id.key()
    }

    /// The timestamp of the entry.
    pub fn timestamp(&self) -> u64 {
        self.entry.record.timestamp()
    }

    /// The hash of the content the entry points at.
    pub fn content_hash(&self) -> &Hash {
        self.entry.record.content_hash()
    }

    /// The length of the content the entry points at.
    pub fn content_len(&self) -> u64 {
        self.entry.record.content_len()
    }

    /// Whether the entry is a tombstone.
    pub fn is_empty(&self) -> bool {
        self.entry.record.is_empty()
    }
}

impl RangeEntry for SignedEntry {
    type Key = RecordIdentifier;
    type Value = Record;

    fn key(&self) -> &Self::Key {
        &self.entry.id
    }

    fn value(&self) -> &Self::Value {
        &self.entry.record
    }

    fn as_fingerprint(&self) -> Fingerprint {
        Fingerprint(*blake3::hash(&self.entry.to_vec()).as_bytes())
    }
}

#[derive(Debug)]
struct InnerReplica {
    namespace: Namespace,
    peer: Peer<SignedEntry>,
    subscribers: Vec<flume::Sender<Event>>,
    /// The greatest timestamp issued or observed, in microseconds.
    clock: u64,
}

/// A local replica of a document.
///
/// Cheap to clone and shareable between threads. All mutation happens under
/// an internal lock. Events are delivered to subscribers without blocking:
/// a subscriber whose channel is full loses the event, a subscriber that
/// went away is silently dropped.
#[derive(Debug, Clone)]
pub struct Replica {
    inner: Arc<RwLock<InnerReplica>>,
}

impl Replica {
    /// Create a new replica for a namespace.
    pub fn new(namespace: Namespace) -> Self {
        Self {
            inner: Arc::new(RwLock::new(InnerReplica {
                namespace,
                peer: Peer::default(),
                subscribers: Vec::new(),
                clock: 0,
            })),
        }
    }

    /// The identifier of the namespace this replica belongs to.
    pub fn namespace(&self) -> NamespaceId {
        self.inner.read().namespace.id()
    }

    /// The namespace secret.
    ///
    /// This is the write capability; it ends up in write tickets.
    pub fn secret(&self) -> Namespace {
        self.inner.read().namespace.clone()
    }

    /// Subscribe to insert events.
    ///
    /// Events are sent with [`flume::Sender::try_send`], so a bounded
    /// subscriber that falls behind misses events instead of stalling
    /// writers. Use an unbounded channel for lossless delivery.
    pub fn subscribe(&self, sender: flume::Sender<Event>) {
        self.inner.write().subscribers.push(sender);
    }

    /// Remove a subscriber. Returns whether it was subscribed.
    pub fn unsubscribe(&self, sender: &flume::Sender<Event>) -> bool {
        let mut inner = self.inner.write();
        let len = inner.subscribers.len();
        inner.subscribers.retain(|s| !s.same_channel(sender));
        len != inner.subscribers.len()
    }

    /// Insert a new entry for a key, written by a local author.
    ///
    /// Timestamps come from a per-replica clock that is monotonic even when
    /// the wall clock regresses, and that never falls behind timestamps
    /// observed from remote entries. A local insert therefore always
    /// supersedes whatever the replica currently holds for that key and
    /// author.
    pub fn insert(
        &self,
        key: impl AsRef<[u8]>,
        author: &Author,
        hash: Hash,
        len: u64,
    ) -> Result<()> {
        ensure!(!key.as_ref().is_empty(), "key must not be empty");
        ensure!(
            hash != Hash::EMPTY || len == 0,
            "the empty hash must have length zero"
        );
        let mut inner = self.inner.write();
        let timestamp = inner.next_timestamp();
        let id = RecordIdentifier::new(key, inner.namespace.id(), author.id());
        let record = Record::new(timestamp, len, hash);
        let entry = Entry::new(id, record).sign(&inner.namespace, author);
        let outcome = inner.peer.put(entry.clone());
        debug_assert!(matches!(outcome, InsertOutcome::Inserted));
        let event = Event::LocalInsert {
            namespace: inner.namespace.id(),
            entry,
        };
        inner.notify(event);
        Ok(())
    }

    /// Hash content and insert an entry pointing at it.
    ///
    /// Only the entry is stored here; the content itself has to be put into
    /// a blob store separately.
    pub fn hash_and_insert(
        &self,
        key: impl AsRef<[u8]>,
        author: &Author,
        content: impl AsRef<[u8]>,
    ) -> Result<Hash> {
        let len = content.as_ref().len() as u64;
        let hash = Hash::new(content);
        self.insert(key, author, hash, len)?;
        Ok(hash)
    }

    /// Mark a key as deleted by writing a tombstone entry.
    pub fn delete(&self, key: impl AsRef<[u8]>, author: &Author) -> Result<()> {
        self.insert(key, author, Hash::EMPTY, 0)
    }

    /// Insert an entry received from a peer.
    ///
    /// The signatures are verified and the entry only replaces an existing
    /// entry for the same key and author if its record is greater. Inserting
    /// the same entry twice is a no-op, so replay during reconnects is
    /// harmless.
    pub fn insert_remote_entry(
        &self,
        entry: SignedEntry,
        received_from: PeerIdBytes,
        content_status: ContentStatus,
    ) -> Result<()> {
        entry.verify()?;
        let mut inner = self.inner.write();
        ensure!(
            entry.namespace() == inner.namespace.id(),
            "entry of namespace {} does not belong to replica {}",
            entry.namespace(),
            inner.namespace.id()
        );
        inner.clock = inner.clock.max(entry.timestamp());
        if let InsertOutcome::Inserted = inner.peer.put(entry.clone()) {
            let event = Event::RemoteInsert {
                namespace: inner.namespace.id(),
                entry,
                from: received_from,
                content_status,
            };
            inner.notify(event);
        }
        Ok(())
    }

    /// The number of entries in the replica, tombstones included.
    pub fn len(&self) -> usize {
        self.inner.read().peer.store().len()
    }

    /// Whether the replica holds no entries at all.
    pub fn is_empty(&self) -> bool {
        self.inner.read().peer.store().is_empty()
    }

    /// A snapshot of all entries, in identifier order. Tombstones included.
    pub fn all(&self) -> Vec<SignedEntry> {
        self.inner.read().peer.store().all().cloned().collect()
    }

    /// Get the entry for an exact author and key, tombstones included.
    pub fn get(&self, author: AuthorId, key: impl AsRef<[u8]>) -> Option<SignedEntry> {
        let inner = self.inner.read();
        let id = RecordIdentifier::new(key, inner.namespace.id(), author);
        inner.peer.store().get(&id).cloned()
    }

    /// Create the message that opens a sync session.
    pub fn sync_initial_message(&self) -> Message<SignedEntry> {
        self.inner.read().peer.initial_message()
    }

    /// Process one sync message and produce the response, if any.
    ///
    /// Incoming entries are verified and merged; `content_status_cb` supplies
    /// the local content status sent along with outgoing entries.
    pub fn sync_process_message(
        &self,
        message: Message<SignedEntry>,
        from_peer: PeerIdBytes,
        content_status_cb: impl Fn(Hash) -> ContentStatus,
    ) -> Result<Option<Message<SignedEntry>>> {
        let mut inner = self.inner.write();
        let expected_namespace = inner.namespace.id();
        let mut inserted: Vec<(SignedEntry, ContentStatus)> = Vec::new();
        let reply = inner.peer.process_message(
            message,
            |entry, _| entry.namespace() == expected_namespace && entry.verify().is_ok(),
            |entry, content_status| inserted.push((entry, content_status)),
            |entry| content_status_cb(*entry.content_hash()),
        );
        if !inserted.is_empty() {
            debug!(
                namespace = %expected_namespace,
                count = inserted.len(),
                "merged entries from sync"
            );
        }
        for (entry, content_status) in inserted {
            inner.clock = inner.clock.max(entry.timestamp());
            let event = Event::RemoteInsert {
                namespace: expected_namespace,
                entry,
                from: from_peer,
                content_status,
            };
            inner.notify(event);
        }
        Ok(reply)
    }
}

impl InnerReplica {
    fn next_timestamp(&mut self) -> u64 {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or_default();
        self.clock = now.max(self.clock + 1);
        self.clock
    }

    fn notify(&mut self, event: Event) {
        self.subscribers
            .retain(|sender| match sender.try_send(event.clone()) {
                Ok(()) => true,
                Err(flume::TrySendError::Full(_)) => {
                    debug!("dropping event for full subscriber channel");
                    true
                }
                Err(flume::TrySendError::Disconnected(_)) => false,
            });
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha12Rng;

    use super::*;

    fn rng() -> ChaCha12Rng {
        ChaCha12Rng::seed_from_u64(1)
    }

    #[test]
    fn test_insert_and_get() {
        let mut rng = rng();
        let namespace = Namespace::new(&mut rng);
        let author = Author::new(&mut rng);
        let replica = Replica::new(namespace);

        let hash = replica
            .hash_and_insert("greeting", &author, b"hello")
            .unwrap();
        let entry = replica.get(author.id(), "greeting").unwrap();
        assert_eq!(entry.content_hash(), &hash);
        assert_eq!(entry.content_len(), 5);
        assert_eq!(entry.key(), b"greeting");
        entry.verify().unwrap();
    }

    #[test]
    fn test_empty_key_rejected() {
        let mut rng = rng();
        let replica = Replica::new(Namespace::new(&mut rng));
        let author = Author::new(&mut rng);
        assert!(replica.insert("", &author, Hash::new(b"x"), 1).is_err());
    }

    #[test]
    fn test_local_insert_supersedes() {
        let mut rng = rng();
        let replica = Replica::new(Namespace::new(&mut rng));
        let author = Author::new(&mut rng);

        replica.hash_and_insert("key", &author, b"one").unwrap();
        replica.hash_and_insert("key", &author, b"two").unwrap();
        let entry = replica.get(author.id(), "key").unwrap();
        assert_eq!(entry.content_hash(), &Hash::new(b"two"));
        // old and new entry share the identifier, so only one is retained
        assert_eq!(replica.len(), 1);
    }

    #[test]
    fn test_tombstone() {
        let mut rng = rng();
        let replica = Replica::new(Namespace::new(&mut rng));
        let author = Author::new(&mut rng);

        replica.hash_and_insert("key", &author, b"data").unwrap();
        replica.delete("key", &author).unwrap();
        let entry = replica.get(author.id(), "key").unwrap();
        assert!(entry.is_empty());
        assert_eq!(entry.content_len(), 0);
    }

    #[test]
    fn test_remote_insert_verifies() {
        let mut rng = rng();
        let namespace = Namespace::new(&mut rng);
        let author = Author::new(&mut rng);
        let alice = Replica::new(namespace.clone());
        let bob = Replica::new(namespace);

        alice.hash_and_insert("key", &author, b"from alice").unwrap();
        let entry = alice.get(author.id(), "key").unwrap();
        bob.insert_remote_entry(entry.clone(), [1u8; 32], ContentStatus::Complete)
            .unwrap();
        assert_eq!(bob.get(author.id(), "key").unwrap(), entry);

        // replay is a no-op
        bob.insert_remote_entry(entry, [1u8; 32], ContentStatus::Complete)
            .unwrap();
        assert_eq!(bob.len(), 1);
    }

    #[test]
    fn test_remote_insert_wrong_namespace_rejected() {
        let mut rng = rng();
        let author = Author::new(&mut rng);
        let alice = Replica::new(Namespace::new(&mut rng));
        let other = Replica::new(Namespace::new(&mut rng));

        alice.hash_and_insert("key", &author, b"data").unwrap();
        let entry = alice.get(author.id(), "key").unwrap();
        assert!(other
            .insert_remote_entry(entry, [0u8; 32], ContentStatus::Complete)
            .is_err());
    }

    #[test]
    fn test_stale_remote_entry_loses() {
        let mut rng = rng();
        let namespace = Namespace::new(&mut rng);
        let author = Author::new(&mut rng);
        let alice = Replica::new(namespace.clone());
        let bob = Replica::new(namespace);

        // bob learns an entry from alice, then writes locally. his local
        // write must win even though alice's entry came from the future.
        alice.hash_and_insert("key", &author, b"old").unwrap();
        let old = alice.get(author.id(), "key").unwrap();
        bob.insert_remote_entry(old.clone(), [1u8; 32], ContentStatus::Complete)
            .unwrap();
        bob.hash_and_insert("key", &author, b"new").unwrap();
        let entry = bob.get(author.id(), "key").unwrap();
        assert_eq!(entry.content_hash(), &Hash::new(b"new"));
        assert!(entry.timestamp() > old.timestamp());

        // re-delivering the stale entry does not bring the old value back
        bob.insert_remote_entry(old, [1u8; 32], ContentStatus::Complete)
            .unwrap();
        let entry = bob.get(author.id(), "key").unwrap();
        assert_eq!(entry.content_hash(), &Hash::new(b"new"));
    }

    #[test]
    fn test_conflict_resolved_by_hash() {
        let mut rng = rng();
        let namespace = Namespace::new(&mut rng);
        let author = Author::new(&mut rng);
        let id = RecordIdentifier::new("key", namespace.id(), author.id());

        // two entries with the same timestamp, differing only in content
        let a = Entry::new(id.clone(), Record::new(7, 1, Hash::new(b"a")))
            .sign(&namespace, &author);
        let b = Entry::new(id, Record::new(7, 1, Hash::new(b"b"))).sign(&namespace, &author);
        let winner = if Hash::new(b"a") > Hash::new(b"b") { &a } else { &b };

        // both replicas converge on the same winner, regardless of order
        let first = Replica::new(namespace.clone());
        first
            .insert_remote_entry(a.clone(), [0u8; 32], ContentStatus::Complete)
            .unwrap();
        first
            .insert_remote_entry(b.clone(), [0u8; 32], ContentStatus::Complete)
            .unwrap();
        let second = Replica::new(namespace);
        second
            .insert_remote_entry(b.clone(), [0u8; 32], ContentStatus::Complete)
            .unwrap();
        second
            .insert_remote_entry(a.clone(), [0u8; 32], ContentStatus::Complete)
            .unwrap();
        assert_eq!(first.get(author.id(), "key").unwrap(), *winner);
        assert_eq!(first.get(author.id(), "key"), second.get(author.id(), "key"));
    }

    #[test]
    fn test_subscribe_events() {
        let mut rng = rng();
        let namespace = Namespace::new(&mut rng);
        let author = Author::new(&mut rng);
        let replica = Replica::new(namespace);
        let (tx, rx) = flume::unbounded();
        replica.subscribe(tx);

        replica.hash_and_insert("key", &author, b"data").unwrap();
        let event = rx.try_recv().unwrap();
        assert!(matches!(event, Event::LocalInsert { .. }));
    }

    #[test]
    fn test_full_subscriber_does_not_block_writers() {
        let mut rng = rng();
        let namespace = Namespace::new(&mut rng);
        let author = Author::new(&mut rng);
        let replica = Replica::new(namespace);
        let (tx, rx) = flume::bounded(1);
        replica.subscribe(tx);

        // the second insert finds the channel full and loses its event,
        // but must not stall while the receiver is not draining
        replica.hash_and_insert("one", &author, b"1").unwrap();
        replica.hash_and_insert("two", &author, b"2").unwrap();
        assert_eq!(replica.len(), 2);

        let event = rx.try_recv().unwrap();
        match event {
            Event::LocalInsert { entry, .. } => assert_eq!(entry.key(), b"one"),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx.try_recv().is_err());

        // the subscriber stays registered and sees later events
        replica.hash_and_insert("three", &author, b"3").unwrap();
        let event = rx.try_recv().unwrap();
        match event {
            Event::LocalInsert { entry, .. } => assert_eq!(entry.key(), b"three"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_sync_two_replicas() {
        let mut rng = rng();
        let namespace = Namespace::new(&mut rng);
        let alice_author = Author::new(&mut rng);
        let bob_author = Author::new(&mut rng);
        let alice = Replica::new(namespace.clone());
        let bob = Replica::new(namespace);

        for i in 0..5 {
            alice
                .hash_and_insert(format!("alice/{i}"), &alice_author, b"a")
                .unwrap();
            bob.hash_and_insert(format!("bob/{i}"), &bob_author, b"b")
                .unwrap();
        }

        let status = |_: Hash| ContentStatus::Complete;
        let mut message = Some(
            bob.sync_process_message(alice.sync_initial_message(), [1u8; 32], status)
                .unwrap(),
        )
        .flatten();
        let mut turn = 0;
        while let Some(msg) = message {
            turn += 1;
            assert!(turn < 100, "sync does not terminate");
            let replica = if turn % 2 == 1 { &alice } else { &bob };
            message = replica.sync_process_message(msg, [1u8; 32], status).unwrap();
        }

        assert_eq!(alice.len(), 10);
        assert_eq!(bob.len(), 10);
        assert_eq!(alice.all(), bob.all());
    }
}
