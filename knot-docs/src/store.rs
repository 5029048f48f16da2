//! Storage for replicas and authors, and queries over document entries.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use parking_lot::RwLock;
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};

use crate::keys::{Author, AuthorId, Namespace, NamespaceId};
use crate::sync::{Replica, SignedEntry};

/// In-memory store of replicas and author keys.
///
/// Cheap to clone, all clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct Store {
    replicas: Arc<RwLock<HashMap<NamespaceId, Replica>>>,
    authors: Arc<RwLock<HashMap<AuthorId, Author>>>,
}

impl Store {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a replica for a fresh namespace.
    pub fn new_replica<R: CryptoRngCore + ?Sized>(&self, rng: &mut R) -> Replica {
        self.open_replica(Namespace::new(rng))
    }

    /// Open the replica for a namespace, creating it if needed.
    pub fn open_replica(&self, namespace: Namespace) -> Replica {
        self.replicas
            .write()
            .entry(namespace.id())
            .or_insert_with(|| Replica::new(namespace))
            .clone()
    }

    /// Get an open replica.
    pub fn get_replica(&self, namespace: &NamespaceId) -> Option<Replica> {
        self.replicas.read().get(namespace).cloned()
    }

    /// The namespaces of all open replicas.
    pub fn list_replicas(&self) -> Vec<NamespaceId> {
        self.replicas.read().keys().copied().collect()
    }

    /// Remove a replica and all its entries. Returns whether it existed.
    pub fn drop_replica(&self, namespace: &NamespaceId) -> bool {
        self.replicas.write().remove(namespace).is_some()
    }

    /// Create and store a new author key.
    pub fn new_author<R: CryptoRngCore + ?Sized>(&self, rng: &mut R) -> Author {
        let author = Author::new(rng);
        self.import_author(author.clone());
        author
    }

    /// Import an existing author key.
    pub fn import_author(&self, author: Author) -> AuthorId {
        let id = author.id();
        self.authors.write().insert(id, author);
        id
    }

    /// Get a stored author key.
    pub fn get_author(&self, author: &AuthorId) -> Option<Author> {
        self.authors.read().get(author).cloned()
    }

    /// The ids of all stored authors.
    pub fn list_authors(&self) -> Vec<AuthorId> {
        self.authors.read().keys().copied().collect()
    }

    /// Query the entries of a replica.
    pub fn get_many(
        &self,
        namespace: NamespaceId,
        query: impl Into<Query>,
    ) -> Result<Vec<SignedEntry>> {
        let replica = self
            .get_replica(&namespace)
            .ok_or_else(|| anyhow!("replica {namespace} not found"))?;
        Ok(query.into().apply(replica.all()))
    }

    /// Get the entry for an exact author and key.
    ///
    /// Returns `None` if there is no entry or the latest entry is a
    /// tombstone.
    pub fn get_one(
        &self,
        namespace: NamespaceId,
        author: AuthorId,
        key: impl AsRef<[u8]>,
    ) -> Result<Option<SignedEntry>> {
        let replica = self
            .get_replica(&namespace)
            .ok_or_else(|| anyhow!("replica {namespace} not found"))?;
        Ok(replica.get(author, key).filter(|entry| !entry.is_empty()))
    }
}

/// Fields by which the returned entries are sorted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortBy {
    /// Sort by key, then author.
    #[default]
    KeyAuthor,
    /// Sort by author, then key.
    AuthorKey,
}

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    /// Ascending.
    #[default]
    Asc,
    /// Descending.
    Desc,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
enum KeyFilter {
    #[default]
    Any,
    Exact(Vec<u8>),
    Prefix(Vec<u8>),
}

impl KeyFilter {
    fn matches(&self, key: &[u8]) -> bool {
        match self {
            KeyFilter::Any => true,
            KeyFilter::Exact(k) => key == k,
            KeyFilter::Prefix(prefix) => key.starts_with(prefix),
        }
    }
}

/// A query over the entries of a replica.
///
/// Built with [`Query::all`] or [`Query::single_latest_per_key`] and refined
/// with the builder methods. Filters are applied first, then deduplication
/// for latest-per-key queries, then sorting, then offset and limit.
///
/// ```
/// use knot_docs::{Query, SortBy, SortDirection};
///
/// let query = Query::single_latest_per_key()
///     .key_prefix("posts/")
///     .sort_by(SortBy::KeyAuthor, SortDirection::Desc)
///     .limit(10);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    filter_author: Option<AuthorId>,
    filter_key: KeyFilter,
    latest_per_key: bool,
    include_empty: bool,
    sort_by: SortBy,
    direction: SortDirection,
    offset: u64,
    limit: Option<u64>,
}

impl Query {
    /// Query all entries.
    pub fn all() -> Self {
        Self::default()
    }

    /// Query the latest entry for each key, regardless of author.
    ///
    /// When several authors wrote to the same key, only the winning entry is
    /// returned.
    pub fn single_latest_per_key() -> Self {
        Self {
            latest_per_key: true,
            ..Self::default()
        }
    }

    /// Only return entries by this author.
    pub fn author(mut self, author: AuthorId) -> Self {
        self.filter_author = Some(author);
        self
    }

    /// Only return entries with this exact key.
    pub fn key_exact(mut self, key: impl AsRef<[u8]>) -> Self {
        self.filter_key = KeyFilter::Exact(key.as_ref().to_vec());
        self
    }

    /// Only return entries whose key starts with a prefix.
    pub fn key_prefix(mut self, prefix: impl AsRef<[u8]>) -> Self {
        self.filter_key = KeyFilter::Prefix(prefix.as_ref().to_vec());
        self
    }

    /// Include tombstone entries in the results.
    pub fn include_empty(mut self) -> Self {
        self.include_empty = true;
        self
    }

    /// Set the sort order.
    pub fn sort_by(mut self, sort_by: SortBy, direction: SortDirection) -> Self {
        self.sort_by = sort_by;
        self.direction = direction;
        self
    }

    /// Skip the first `offset` entries.
    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    /// Return at most `limit` entries. A limit of zero returns nothing.
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    fn compare(&self, a: &SignedEntry, b: &SignedEntry) -> Ordering {
        let ord = match self.sort_by {
            SortBy::KeyAuthor => a
                .key()
                .cmp(b.key())
                .then_with(|| a.author().cmp(&b.author())),
            SortBy::AuthorKey => a
                .author()
                .cmp(&b.author())
                .then_with(|| a.key().cmp(b.key())),
        };
        match self.direction {
            SortDirection::Asc => ord,
            SortDirection::Desc => ord.reverse(),
        }
    }

    pub(crate) fn apply(&self, entries: Vec<SignedEntry>) -> Vec<SignedEntry> {
        let mut entries: Vec<SignedEntry> = entries
            .into_iter()
            .filter(|entry| {
                self.filter_key.matches(entry.key())
                    && self
                        .filter_author
                        .map(|author| entry.author() == author)
                        .unwrap_or(true)
            })
            .collect();

        if self.latest_per_key {
            // pick the winner per key among all authors. tombstones take
            // part here so that a deletion can shadow older live entries.
            let mut latest: HashMap<&[u8], &SignedEntry> = HashMap::new();
            for entry in &entries {
                match latest.entry(entry.key()) {
                    std::collections::hash_map::Entry::Vacant(e) => {
                        e.insert(entry);
                    }
                    std::collections::hash_map::Entry::Occupied(mut e) => {
                        if entry.entry().record() > e.get().entry().record() {
                            e.insert(entry);
                        }
                    }
                }
            }
            let winners: Vec<SignedEntry> = latest.into_values().cloned().collect();
            entries = winners;
        }

        if !self.include_empty {
            entries.retain(|entry| !entry.is_empty());
        }

        entries.sort_by(|a, b| self.compare(a, b));

        entries
            .into_iter()
            .skip(self.offset as usize)
            .take(self.limit.map(|l| l as usize).unwrap_or(usize::MAX))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha12Rng;

    use super::*;

    fn store_with_entries() -> (Store, NamespaceId, Author, Author) {
        let mut rng = ChaCha12Rng::seed_from_u64(2);
        let store = Store::new();
        let replica = store.new_replica(&mut rng);
        let namespace = replica.namespace();
        // fix the author order so tests can reason about sorting
        let (alice, bob) = {
            let a = store.new_author(&mut rng);
            let b = store.new_author(&mut rng);
            if a.id() < b.id() {
                (a, b)
            } else {
                (b, a)
            }
        };
        for key in ["posts/1", "posts/2", "about"] {
            replica.hash_and_insert(key, &alice, b"alice").unwrap();
        }
        replica.hash_and_insert("posts/2", &bob, b"bob").unwrap();
        replica.hash_and_insert("misc", &bob, b"bob").unwrap();
        (store, namespace, alice, bob)
    }

    #[test]
    fn test_query_all() {
        let (store, namespace, _, _) = store_with_entries();
        let entries = store.get_many(namespace, Query::all()).unwrap();
        assert_eq!(entries.len(), 5);
        // default sort is by key, then author
        let keys: Vec<&[u8]> = entries.iter().map(|e| e.key()).collect();
        assert_eq!(
            keys,
            vec![
                b"about".as_slice(),
                b"misc",
                b"posts/1",
                b"posts/2",
                b"posts/2"
            ]
        );
    }

    #[test]
    fn test_query_author_and_key_filters() {
        let (store, namespace, alice, bob) = store_with_entries();
        let entries = store
            .get_many(namespace, Query::all().author(alice.id()))
            .unwrap();
        assert_eq!(entries.len(), 3);

        let entries = store
            .get_many(namespace, Query::all().key_prefix("posts/"))
            .unwrap();
        assert_eq!(entries.len(), 3);

        let entries = store
            .get_many(
                namespace,
                Query::all().key_exact("posts/2").author(bob.id()),
            )
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].author(), bob.id());
    }

    #[test]
    fn test_query_single_latest_per_key() {
        let (store, namespace, _, bob) = store_with_entries();
        let entries = store
            .get_many(namespace, Query::single_latest_per_key())
            .unwrap();
        assert_eq!(entries.len(), 4);
        // bob wrote posts/2 last, so his entry wins
        let winner = entries.iter().find(|e| e.key() == b"posts/2").unwrap();
        assert_eq!(winner.author(), bob.id());
    }

    #[test]
    fn test_query_latest_per_key_respects_tombstone() {
        let (store, namespace, _, bob) = store_with_entries();
        let replica = store.get_replica(&namespace).unwrap();
        replica.delete("posts/2", &bob).unwrap();

        // the tombstone wins the key and is then filtered out
        let entries = store
            .get_many(namespace, Query::single_latest_per_key())
            .unwrap();
        assert!(entries.iter().all(|e| e.key() != b"posts/2"));

        // with include_empty the tombstone itself is returned
        let entries = store
            .get_many(namespace, Query::single_latest_per_key().include_empty())
            .unwrap();
        let winner = entries.iter().find(|e| e.key() == b"posts/2").unwrap();
        assert!(winner.is_empty());
    }

    #[test]
    fn test_query_sorting() {
        let (store, namespace, alice, _) = store_with_entries();
        let entries = store
            .get_many(
                namespace,
                Query::all().sort_by(SortBy::KeyAuthor, SortDirection::Desc),
            )
            .unwrap();
        let mut expected = store.get_many(namespace, Query::all()).unwrap();
        expected.reverse();
        assert_eq!(entries, expected);

        let entries = store
            .get_many(
                namespace,
                Query::all().sort_by(SortBy::AuthorKey, SortDirection::Asc),
            )
            .unwrap();
        // alice sorts before bob, so her entries come first
        assert!(entries[..3].iter().all(|e| e.author() == alice.id()));
    }

    #[test]
    fn test_query_pagination() {
        let (store, namespace, _, _) = store_with_entries();
        let all = store.get_many(namespace, Query::all()).unwrap();

        let page = store
            .get_many(namespace, Query::all().offset(1).limit(2))
            .unwrap();
        assert_eq!(page, all[1..3].to_vec());

        let empty = store.get_many(namespace, Query::all().limit(0)).unwrap();
        assert!(empty.is_empty());

        let beyond = store.get_many(namespace, Query::all().offset(100)).unwrap();
        assert!(beyond.is_empty());
    }

    #[test]
    fn test_get_one_hides_tombstones() {
        let (store, namespace, alice, _) = store_with_entries();
        let replica = store.get_replica(&namespace).unwrap();

        let entry = store.get_one(namespace, alice.id(), "about").unwrap();
        assert!(entry.is_some());

        replica.delete("about", &alice).unwrap();
        let entry = store.get_one(namespace, alice.id(), "about").unwrap();
        assert!(entry.is_none());
    }

    #[test]
    fn test_unknown_replica_errors() {
        let mut rng = ChaCha12Rng::seed_from_u64(3);
        let store = Store::new();
        let namespace = Namespace::new(&mut rng).id();
        assert!(store.get_many(namespace, Query::all()).is_err());
    }

    #[test]
    fn test_authors_and_replicas_listing() {
        let (store, namespace, alice, bob) = store_with_entries();
        let mut authors = store.list_authors();
        authors.sort();
        let mut expected = vec![alice.id(), bob.id()];
        expected.sort();
        assert_eq!(authors, expected);
        assert_eq!(store.list_replicas(), vec![namespace]);

        assert!(store.drop_replica(&namespace));
        assert!(!store.drop_replica(&namespace));
        assert!(store.get_replica(&namespace).is_none());
    }
}
