//! In-memory blob store.
//!
//! All blobs live on the heap behind a single [`parking_lot::RwLock`]. The
//! lock is never held across await points, so the store can be shared freely
//! between tasks. Garbage collection runs mark and sweep under one write lock
//! acquisition, which makes the reachable set a consistent snapshot.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use knot_base::{BlobFormat, Hash, HashAndFormat};
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::hashseq::HashSeq;
use crate::util::{LivenessTracker, Tag, TempTag};

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The blob is not in the store, or not complete.
    #[error("blob {0} not found")]
    NotFound(Hash),
    /// The blob is protected by a tag or temp tag.
    #[error("blob {0} is pinned")]
    Pinned(Hash),
    /// Data did not hash to the expected hash.
    #[error("hash mismatch, expected {expected} but data hashes to {actual}")]
    HashMismatch {
        /// The hash the data was stored under.
        expected: Hash,
        /// The hash of the actual data.
        actual: Hash,
    },
}

/// The status of a blob in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    /// The blob is completely available.
    Complete,
    /// The blob is partially available.
    Partial,
    /// The blob is not in the store.
    NotFound,
}

/// Information about a tagged collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionInfo {
    /// The tag pinning the collection.
    pub tag: Tag,
    /// The hash of the hash sequence root.
    pub hash: Hash,
    /// Number of blobs in the collection, including the root.
    pub total_blobs_count: u64,
    /// Total payload size of all blobs in the collection, including the root.
    pub total_blobs_size: u64,
}

/// Statistics of a garbage collection run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Number of blobs deleted, complete and partial.
    pub blobs_deleted: usize,
    /// Total payload bytes freed.
    pub bytes_deleted: u64,
}

#[derive(Debug, Default)]
struct State {
    complete: BTreeMap<Hash, Bytes>,
    partial: BTreeMap<Hash, Bytes>,
    tags: BTreeMap<Tag, HashAndFormat>,
    live: HashMap<HashAndFormat, u64>,
}

#[derive(Debug, Default)]
struct Inner {
    state: RwLock<State>,
}

impl LivenessTracker for Inner {
    fn on_clone(&self, inner: &HashAndFormat) {
        let mut state = self.state.write();
        *state.live.entry(*inner).or_default() += 1;
    }

    fn on_drop(&self, inner: &HashAndFormat) {
        let mut state = self.state.write();
        if let Some(count) = state.live.get_mut(inner) {
            *count -= 1;
            if *count == 0 {
                state.live.remove(inner);
            }
        }
    }
}

/// A complete in-memory blob store.
///
/// Cloning is cheap and shares the underlying storage.
#[derive(Debug, Clone, Default)]
pub struct Store(Arc<Inner>);

impl Store {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Import a blob from memory.
    ///
    /// Re-importing existing data is a no-op apart from the returned pin.
    /// The returned [`TempTag`] protects the blob from garbage collection
    /// until it is dropped, giving the caller time to tag or reference it.
    pub fn import_bytes(&self, data: Bytes, format: BlobFormat) -> TempTag {
        let hash = Hash::new(&data);
        let content = HashAndFormat { hash, format };
        // pin before inserting so a concurrent gc cannot collect the blob
        let tag = self.temp_tag(content);
        let mut state = self.0.state.write();
        state.partial.remove(&hash);
        state.complete.entry(hash).or_insert(data);
        trace!(hash = %hash.fmt_short(), "imported blob");
        tag
    }

    /// Read a complete blob.
    ///
    /// Partial blobs are not readable.
    pub fn get(&self, hash: &Hash) -> Option<Bytes> {
        self.0.state.read().complete.get(hash).cloned()
    }

    /// The size of a complete blob.
    pub fn get_size(&self, hash: &Hash) -> Option<u64> {
        self.0
            .state
            .read()
            .complete
            .get(hash)
            .map(|data| data.len() as u64)
    }

    /// The status of a blob.
    pub fn entry_status(&self, hash: &Hash) -> EntryStatus {
        let state = self.0.state.read();
        if state.complete.contains_key(hash) {
            EntryStatus::Complete
        } else if state.partial.contains_key(hash) {
            EntryStatus::Partial
        } else {
            EntryStatus::NotFound
        }
    }

    /// All complete blobs, in hash order.
    pub fn blobs(&self) -> Vec<Hash> {
        self.0.state.read().complete.keys().copied().collect()
    }

    /// All partial blobs, in hash order.
    pub fn partial_blobs(&self) -> Vec<Hash> {
        self.0.state.read().partial.keys().copied().collect()
    }

    /// Store unverified data for a blob that is being transferred.
    ///
    /// The data stays invisible to [`Self::get`] and [`Self::blobs`] until
    /// [`Self::complete_partial`] verifies it.
    pub fn insert_partial(&self, hash: Hash, data: Bytes) {
        let mut state = self.0.state.write();
        if !state.complete.contains_key(&hash) {
            state.partial.insert(hash, data);
        }
    }

    /// Verify a partial blob and promote it to complete.
    pub fn complete_partial(&self, hash: &Hash) -> Result<(), Error> {
        let mut state = self.0.state.write();
        if state.complete.contains_key(hash) {
            state.partial.remove(hash);
            return Ok(());
        }
        let data = state.partial.get(hash).ok_or(Error::NotFound(*hash))?;
        let actual = Hash::new(data);
        if actual != *hash {
            return Err(Error::HashMismatch {
                expected: *hash,
                actual,
            });
        }
        let data = state.partial.remove(hash).expect("just read");
        state.complete.insert(*hash, data);
        Ok(())
    }

    /// All tags with their targets, in tag order.
    pub fn tags(&self) -> Vec<(Tag, HashAndFormat)> {
        self.0
            .state
            .read()
            .tags
            .iter()
            .map(|(tag, value)| (tag.clone(), *value))
            .collect()
    }

    /// Set or delete a named tag.
    pub fn set_tag(&self, tag: Tag, value: Option<HashAndFormat>) {
        let mut state = self.0.state.write();
        match value {
            Some(value) => {
                state.tags.insert(tag, value);
            }
            None => {
                state.tags.remove(&tag);
            }
        }
    }

    /// Create an automatically named tag for the given target.
    pub fn create_tag(&self, value: HashAndFormat) -> Tag {
        let mut state = self.0.state.write();
        let mut tag = Tag::auto_generated(SystemTime::now());
        while state.tags.contains_key(&tag) {
            tag = tag.successor();
        }
        state.tags.insert(tag.clone(), value);
        tag
    }

    /// Pin content with a temp tag.
    ///
    /// The content does not have to exist yet. Fetch tasks pin before
    /// downloading so nothing is collected mid transfer.
    pub fn temp_tag(&self, value: HashAndFormat) -> TempTag {
        TempTag::new(value, Some(self.0.clone()))
    }

    /// Delete a blob.
    ///
    /// Fails if the blob is referenced by a named tag or pinned by a temp
    /// tag. Deleting an absent blob is a no-op.
    pub fn delete(&self, hash: &Hash) -> Result<(), Error> {
        let mut state = self.0.state.write();
        let pinned = state.live.keys().any(|value| value.hash == *hash)
            || state.tags.values().any(|value| value.hash == *hash);
        if pinned {
            return Err(Error::Pinned(*hash));
        }
        state.complete.remove(hash);
        state.partial.remove(hash);
        Ok(())
    }

    /// Information about every tagged hash sequence collection.
    ///
    /// Counts and sizes include the root blob. Children that are not yet
    /// complete locally contribute neither count nor size.
    pub fn list_collections(&self) -> Vec<CollectionInfo> {
        let state = self.0.state.read();
        let mut infos = Vec::new();
        for (tag, value) in state.tags.iter() {
            if !value.format.is_hash_seq() {
                continue;
            }
            let Some(root) = state.complete.get(&value.hash) else {
                continue;
            };
            let Ok(seq) = HashSeq::new(root.clone()) else {
                continue;
            };
            let mut count = 1u64;
            let mut size = root.len() as u64;
            for child in seq.iter() {
                if let Some(data) = state.complete.get(&child) {
                    count += 1;
                    size += data.len() as u64;
                }
            }
            infos.push(CollectionInfo {
                tag: tag.clone(),
                hash: value.hash,
                total_blobs_count: count,
                total_blobs_size: size,
            });
        }
        infos
    }

    /// Run one garbage collection pass.
    ///
    /// Everything reachable from named tags, temp tags and the additional
    /// `protected` roots survives. Reachability follows hash sequence blobs
    /// transitively. The walk tolerates cycles even though the format cannot
    /// produce them.
    pub fn gc(&self, protected: impl IntoIterator<Item = HashAndFormat>) -> GcStats {
        let mut state = self.0.state.write();
        let mut roots: Vec<HashAndFormat> = Vec::new();
        roots.extend(state.tags.values().copied());
        roots.extend(state.live.keys().copied());
        roots.extend(protected);

        let mut live = BTreeSet::new();
        let mut stack: Vec<HashAndFormat> = roots;
        while let Some(content) = stack.pop() {
            if !live.insert(content.hash) {
                continue;
            }
            if content.format.is_hash_seq() {
                if let Some(data) = state.complete.get(&content.hash) {
                    if let Ok(children) = HashSeq::new(data.clone()) {
                        for hash in children.iter() {
                            stack.push(HashAndFormat::raw(hash));
                        }
                    }
                }
            }
        }

        let mut stats = GcStats::default();
        state.complete.retain(|hash, data| {
            let keep = live.contains(hash);
            if !keep {
                stats.blobs_deleted += 1;
                stats.bytes_deleted += data.len() as u64;
            }
            keep
        });
        state.partial.retain(|hash, data| {
            let keep = live.contains(hash);
            if !keep {
                stats.blobs_deleted += 1;
                stats.bytes_deleted += data.len() as u64;
            }
            keep
        });
        if stats.blobs_deleted > 0 {
            debug!(
                blobs = stats.blobs_deleted,
                bytes = stats.bytes_deleted,
                "gc pass deleted blobs"
            );
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_import_and_read() {
        let store = Store::new();
        let tag = store.import_bytes(Bytes::from_static(b"hello"), BlobFormat::Raw);
        assert_eq!(tag.hash(), &Hash::new(b"hello"));
        assert_eq!(store.get(tag.hash()).unwrap().as_ref(), b"hello");
        assert_eq!(store.get_size(tag.hash()), Some(5));
        assert_eq!(store.entry_status(tag.hash()), EntryStatus::Complete);

        // importing again is a no-op
        let tag2 = store.import_bytes(Bytes::from_static(b"hello"), BlobFormat::Raw);
        assert_eq!(tag.hash(), tag2.hash());
        assert_eq!(store.blobs().len(), 1);
    }

    #[test]
    fn test_empty_blob() {
        let store = Store::new();
        let tag = store.import_bytes(Bytes::new(), BlobFormat::Raw);
        assert_eq!(tag.hash(), &Hash::EMPTY);
        assert_eq!(store.get_size(tag.hash()), Some(0));
        assert_eq!(store.get(tag.hash()).unwrap().len(), 0);
    }

    #[test]
    fn test_partial_blobs_hidden() {
        let store = Store::new();
        let hash = Hash::new(b"partial");
        store.insert_partial(hash, Bytes::from_static(b"part"));
        assert_eq!(store.entry_status(&hash), EntryStatus::Partial);
        assert!(store.get(&hash).is_none());
        assert!(store.blobs().is_empty());
        assert_eq!(store.partial_blobs(), vec![hash]);
    }

    #[test]
    fn test_complete_partial() {
        let store = Store::new();
        let hash = Hash::new(b"payload");
        store.insert_partial(hash, Bytes::from_static(b"payload"));
        store.complete_partial(&hash).unwrap();
        assert_eq!(store.entry_status(&hash), EntryStatus::Complete);
        assert_eq!(store.get(&hash).unwrap().as_ref(), b"payload");
    }

    #[test]
    fn test_complete_partial_mismatch() {
        let store = Store::new();
        let hash = Hash::new(b"expected");
        store.insert_partial(hash, Bytes::from_static(b"corrupted"));
        let err = store.complete_partial(&hash).unwrap_err();
        assert!(matches!(err, Error::HashMismatch { .. }));
        // the corrupt data stays partial
        assert_eq!(store.entry_status(&hash), EntryStatus::Partial);
    }

    #[test]
    fn test_delete_pinned() {
        let store = Store::new();
        let tag = store.import_bytes(Bytes::from_static(b"pinned"), BlobFormat::Raw);
        let hash = *tag.hash();
        assert!(matches!(store.delete(&hash), Err(Error::Pinned(_))));
        drop(tag);
        store.delete(&hash).unwrap();
        assert_eq!(store.entry_status(&hash), EntryStatus::NotFound);
        // deleting again is a no-op
        store.delete(&hash).unwrap();
    }

    #[test]
    fn test_delete_tagged_refused() {
        let store = Store::new();
        let tag = store.import_bytes(Bytes::from_static(b"tagged"), BlobFormat::Raw);
        let hash = *tag.hash();
        store.set_tag(Tag::from("keep"), Some(tag.hash_and_format()));
        drop(tag);
        assert!(matches!(store.delete(&hash), Err(Error::Pinned(_))));
        store.set_tag(Tag::from("keep"), None);
        store.delete(&hash).unwrap();
    }

    #[test]
    fn test_gc_basic() {
        let store = Store::new();
        let keep = store.import_bytes(Bytes::from_static(b"keep"), BlobFormat::Raw);
        store.set_tag(Tag::from("keep"), Some(keep.hash_and_format()));
        let drop_tag = store.import_bytes(Bytes::from_static(b"drop"), BlobFormat::Raw);
        let dropped = *drop_tag.hash();
        drop(keep);
        drop(drop_tag);

        let stats = store.gc([]);
        assert_eq!(stats.blobs_deleted, 1);
        assert_eq!(stats.bytes_deleted, 4);
        assert_eq!(store.entry_status(&dropped), EntryStatus::NotFound);
        assert_eq!(store.entry_status(&Hash::new(b"keep")), EntryStatus::Complete);
    }

    #[test]
    fn test_gc_follows_hash_seq() {
        let store = Store::new();
        let a = store.import_bytes(Bytes::from_static(b"child a"), BlobFormat::Raw);
        let b = store.import_bytes(Bytes::from_static(b"child b"), BlobFormat::Raw);
        let seq: crate::hashseq::HashSeq = [*a.hash(), *b.hash()].into_iter().collect();
        let root = store.import_bytes(seq.into_inner(), BlobFormat::HashSeq);
        store.set_tag(Tag::from("root"), Some(root.hash_and_format()));
        let (a, b) = (*a.hash(), *b.hash());
        drop(root);

        let stats = store.gc([]);
        assert_eq!(stats.blobs_deleted, 0);
        assert_eq!(store.entry_status(&a), EntryStatus::Complete);
        assert_eq!(store.entry_status(&b), EntryStatus::Complete);

        store.set_tag(Tag::from("root"), None);
        let stats = store.gc([]);
        assert_eq!(stats.blobs_deleted, 3);
        assert_eq!(store.entry_status(&a), EntryStatus::NotFound);
        assert_eq!(store.entry_status(&b), EntryStatus::NotFound);
    }

    #[test]
    fn test_gc_protected_roots() {
        let store = Store::new();
        let tag = store.import_bytes(Bytes::from_static(b"ext"), BlobFormat::Raw);
        let content = tag.hash_and_format();
        drop(tag);
        let stats = store.gc([content]);
        assert_eq!(stats.blobs_deleted, 0);
        assert_eq!(store.entry_status(&content.hash), EntryStatus::Complete);
    }

    #[test]
    fn test_gc_removes_partials() {
        let store = Store::new();
        let hash = Hash::new(b"incomplete");
        store.insert_partial(hash, Bytes::from_static(b"inco"));
        let stats = store.gc([]);
        assert_eq!(stats.blobs_deleted, 1);
        assert_eq!(store.entry_status(&hash), EntryStatus::NotFound);
    }

    #[test]
    fn test_gc_keeps_pinned_partial() {
        let store = Store::new();
        let hash = Hash::new(b"in flight");
        let pin = store.temp_tag(HashAndFormat::raw(hash));
        store.insert_partial(hash, Bytes::from_static(b"in "));
        let stats = store.gc([]);
        assert_eq!(stats.blobs_deleted, 0);
        drop(pin);
        let stats = store.gc([]);
        assert_eq!(stats.blobs_deleted, 1);
    }

    #[test]
    fn test_list_collections() {
        let store = Store::new();
        let a = store.import_bytes(Bytes::from_static(b"one"), BlobFormat::Raw);
        let b = store.import_bytes(Bytes::from_static(b"three"), BlobFormat::Raw);
        let seq: crate::hashseq::HashSeq = [*a.hash(), *b.hash()].into_iter().collect();
        let root = store.import_bytes(seq.into_inner(), BlobFormat::HashSeq);
        let tag = store.create_tag(root.hash_and_format());

        let infos = store.list_collections();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].tag, tag);
        assert_eq!(infos[0].hash, *root.hash());
        assert_eq!(infos[0].total_blobs_count, 3);
        // 3 + 5 payload bytes plus 64 bytes of root
        assert_eq!(infos[0].total_blobs_size, 72);
    }

    #[test]
    fn test_create_tag() {
        let store = Store::new();
        let tag = store.import_bytes(Bytes::from_static(b"auto"), BlobFormat::Raw);
        let name = store.create_tag(tag.hash_and_format());
        let tags = store.tags();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].0, name);
        assert_eq!(tags[0].1, tag.hash_and_format());
    }
}
