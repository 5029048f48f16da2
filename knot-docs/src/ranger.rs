//! Set reconciliation based on "Range-Based Set Reconciliation" by Aljoscha
//! Meyer.
//!
//! Two peers compare fingerprints of key ranges. Matching fingerprints mean
//! the range is already in sync; differing fingerprints are either resolved
//! by sending the items of the range directly (small ranges) or by splitting
//! the range and recursing. Either peer can drive the exchange; it ends when
//! one side has nothing left to answer.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::Debug;

use serde::{Deserialize, Serialize};

use crate::sync::ContentStatus;

/// An entry that can be reconciled.
///
/// The key ordering defines the ranges, the value ordering decides which of
/// two entries for the same key wins.
pub trait RangeEntry: Debug + Clone {
    /// The key type of this entry.
    type Key: Debug + Ord + Clone + Serialize + 'static;
    /// The value type of this entry.
    type Value: Debug + Ord + Clone + 'static;

    /// Get the key for this entry.
    fn key(&self) -> &Self::Key;

    /// Get the value for this entry.
    fn value(&self) -> &Self::Value;

    /// Get the fingerprint for this entry.
    fn as_fingerprint(&self) -> Fingerprint;
}

/// A range of keys.
///
/// There are three possibilities
/// - x, x: All elements in a set
/// - [x, y): x < y: Includes x, but not y
/// - S \ [y, x) y < x: Includes x, but not y.
/// This means that ranges are "wrap around" conceptually.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Range<K> {
    x: K,
    y: K,
}

impl<K> Range<K> {
    /// Create a new range.
    pub fn new(x: K, y: K) -> Self {
        Range { x, y }
    }

    /// The inclusive start of the range.
    pub fn x(&self) -> &K {
        &self.x
    }

    /// The exclusive end of the range.
    pub fn y(&self) -> &K {
        &self.y
    }
}

impl<K: Ord> Range<K> {
    /// Whether this range covers the whole set.
    pub fn is_all(&self) -> bool {
        self.x() == self.y()
    }

    /// Whether the range contains the given key.
    pub fn contains(&self, t: &K) -> bool {
        match self.x().cmp(self.y()) {
            Ordering::Equal => true,
            Ordering::Less => self.x() <= t && t < self.y(),
            Ordering::Greater => self.x() <= t || t < self.y(),
        }
    }
}

/// The fingerprint of a set of entries: the XOR of the entry fingerprints.
///
/// XOR makes the fingerprint of a range computable incrementally and
/// independent of entry order.
#[derive(Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint(pub [u8; 32]);

impl Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fp({})", hex::encode(&self.0[..8]))
    }
}

impl Fingerprint {
    /// The fingerprint of the empty set.
    pub fn empty() -> Self {
        Fingerprint(*blake3::hash(&[]).as_bytes())
    }
}

impl std::ops::BitXorAssign for Fingerprint {
    fn bitxor_assign(&mut self, rhs: Self) {
        for (a, b) in self.0.iter_mut().zip(rhs.0.iter()) {
            *a ^= b;
        }
    }
}

/// A range and its fingerprint, sent to let the other side compare.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeFingerprint<K> {
    /// The range this fingerprint covers.
    #[serde(bound(
        serialize = "Range<K>: Serialize",
        deserialize = "Range<K>: Deserialize<'de>"
    ))]
    pub range: Range<K>,
    /// The fingerprint of all entries in `range`.
    pub fingerprint: Fingerprint,
}

/// The items of a range, sent when a range is small or exhausted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeItem<E: RangeEntry> {
    /// The range the items are from.
    #[serde(bound(
        serialize = "Range<E::Key>: Serialize",
        deserialize = "Range<E::Key>: Deserialize<'de>"
    ))]
    pub range: Range<E::Key>,
    /// The entries, each with the sender's status for its content blob.
    #[serde(bound(serialize = "E: Serialize", deserialize = "E: Deserialize<'de>"))]
    pub values: Vec<(E, ContentStatus)>,
    /// If false, the receiver should answer with its own items for the range.
    pub have_local: bool,
}

/// One part of a reconciliation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessagePart<E: RangeEntry> {
    /// A range fingerprint for comparison.
    #[serde(bound(
        serialize = "RangeFingerprint<E::Key>: Serialize",
        deserialize = "RangeFingerprint<E::Key>: Deserialize<'de>"
    ))]
    RangeFingerprint(RangeFingerprint<E::Key>),
    /// The items of a range.
    #[serde(bound(
        serialize = "RangeItem<E>: Serialize",
        deserialize = "RangeItem<E>: Deserialize<'de>"
    ))]
    RangeItem(RangeItem<E>),
}

/// A reconciliation message, a batch of parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message<E: RangeEntry> {
    #[serde(bound(
        serialize = "MessagePart<E>: Serialize",
        deserialize = "MessagePart<E>: Deserialize<'de>"
    ))]
    parts: Vec<MessagePart<E>>,
}

impl<E: RangeEntry> Message<E> {
    /// The parts of this message.
    pub fn parts(&self) -> &[MessagePart<E>] {
        &self.parts
    }

    /// All entries carried in this message.
    pub fn values(&self) -> impl Iterator<Item = &(E, ContentStatus)> {
        self.parts
            .iter()
            .filter_map(|part| match part {
                MessagePart::RangeFingerprint(_) => None,
                MessagePart::RangeItem(item) => Some(item.values.as_slice()),
            })
            .flatten()
    }

    /// Number of entries carried in this message.
    pub fn value_count(&self) -> usize {
        self.values().count()
    }
}

/// In-memory store of entries, ordered by key.
#[derive(Debug, Clone)]
pub struct SimpleStore<E: RangeEntry> {
    data: BTreeMap<E::Key, E>,
}

impl<E: RangeEntry> Default for SimpleStore<E> {
    fn default() -> Self {
        Self {
            data: BTreeMap::default(),
        }
    }
}

impl<E: RangeEntry> SimpleStore<E> {
    /// The first key in the store, or the default key if empty.
    pub fn get_first(&self) -> E::Key
    where
        E::Key: Default,
    {
        self.data
            .keys()
            .next()
            .cloned()
            .unwrap_or_default()
    }

    /// Get the entry for a key.
    pub fn get(&self, key: &E::Key) -> Option<&E> {
        self.data.get(key)
    }

    /// The number of entries in the store.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The fingerprint of all entries in the given range.
    pub fn get_fingerprint(&self, range: &Range<E::Key>) -> Fingerprint {
        let mut fp = Fingerprint::empty();
        for entry in self.get_range(range) {
            fp ^= entry.as_fingerprint();
        }
        fp
    }

    /// Insert an entry, replacing any entry with the same key.
    pub fn put(&mut self, entry: E) {
        self.data.insert(entry.key().clone(), entry);
    }

    /// All entries in the given range, in key order.
    pub fn get_range<'a>(&'a self, range: &'a Range<E::Key>) -> impl Iterator<Item = &'a E> + 'a {
        self.data
            .values()
            .filter(move |entry| range.contains(entry.key()))
    }

    /// All entries, in key order.
    pub fn all(&self) -> impl Iterator<Item = &E> {
        self.data.values()
    }

    /// Remove the entry for a key.
    pub fn remove(&mut self, key: &E::Key) -> Option<E> {
        self.data.remove(key)
    }
}

/// The outcome of a [`Peer::put`] operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The entry was not inserted because an equal or newer entry for the
    /// same key exists.
    NotInserted,
    /// The entry was inserted.
    Inserted,
}

/// One side of a reconciliation session.
#[derive(Debug, Clone)]
pub struct Peer<E: RangeEntry> {
    store: SimpleStore<E>,
    /// Up to how many values to send immediately, before sending only a fingerprint.
    max_set_size: usize,
    /// `k` in the protocol, how many splits to generate. At least 2.
    split_factor: usize,
}

impl<E: RangeEntry> Default for Peer<E> {
    fn default() -> Self {
        Peer {
            store: SimpleStore::default(),
            max_set_size: 1,
            split_factor: 2,
        }
    }
}

impl<E> Peer<E>
where
    E: RangeEntry + Serialize,
    E::Key: Default,
{
    /// Generate the initial message opening a session.
    pub fn initial_message(&self) -> Message<E> {
        let x = self.store.get_first();
        let range = Range::new(x.clone(), x);
        let fingerprint = self.store.get_fingerprint(&range);
        Message {
            parts: vec![MessagePart::RangeFingerprint(RangeFingerprint {
                range,
                fingerprint,
            })],
        }
    }

    /// Process an incoming message and produce a response.
    ///
    /// Returns `None` when the session is finished on our side.
    ///
    /// `validate_cb` is called for each incoming entry; entries it rejects
    /// are dropped. `on_insert_cb` is called for each entry that was actually
    /// inserted. `content_status_cb` supplies the status sent along with each
    /// outgoing entry.
    pub fn process_message<F, F2, F3>(
        &mut self,
        message: Message<E>,
        validate_cb: F,
        mut on_insert_cb: F2,
        content_status_cb: F3,
    ) -> Option<Message<E>>
    where
        F: Fn(&E, ContentStatus) -> bool,
        F2: FnMut(E, ContentStatus),
        F3: Fn(&E) -> ContentStatus,
    {
        let mut out = Vec::new();

        let mut items = Vec::new();
        let mut fingerprints = Vec::new();
        for part in message.parts {
            match part {
                MessagePart::RangeItem(item) => items.push(item),
                MessagePart::RangeFingerprint(fp) => fingerprints.push(fp),
            }
        }

        // Process item messages
        for RangeItem {
            range,
            values,
            have_local,
        } in items
        {
            let diff: Option<Vec<_>> = if have_local {
                None
            } else {
                // everything in our range that the peer either does not have
                // or has in an older version
                Some(
                    self.store
                        .get_range(&range)
                        .filter(|our_entry| {
                            !values.iter().any(|(their_entry, _)| {
                                our_entry.key() == their_entry.key()
                                    && their_entry.value() >= our_entry.value()
                            })
                        })
                        .cloned()
                        .map(|entry| {
                            let status = content_status_cb(&entry);
                            (entry, status)
                        })
                        .collect(),
                )
            };

            // Store incoming values
            for (entry, content_status) in values {
                if validate_cb(&entry, content_status) {
                    if let InsertOutcome::Inserted = self.put(entry.clone()) {
                        on_insert_cb(entry, content_status);
                    }
                }
            }

            if let Some(diff) = diff {
                if !diff.is_empty() {
                    out.push(MessagePart::RangeItem(RangeItem {
                        range,
                        values: diff,
                        have_local: true,
                    }));
                }
            }
        }

        // Process fingerprint messages
        for RangeFingerprint { range, fingerprint } in fingerprints {
            let local_fingerprint = self.store.get_fingerprint(&range);
            // Case 1: match, nothing to do
            if local_fingerprint == fingerprint {
                continue;
            }

            let local_values: Vec<E> = self.store.get_range(&range).cloned().collect();
            if local_values.len() <= 1 || fingerprint == Fingerprint::empty() {
                // Case 2: recursion anchor, send our values
                let values = local_values
                    .into_iter()
                    .map(|entry| {
                        let status = content_status_cb(&entry);
                        (entry, status)
                    })
                    .collect();
                out.push(MessagePart::RangeItem(RangeItem {
                    range,
                    values,
                    have_local: false,
                }));
            } else {
                // Case 3: split the range and recurse.
                // m0 = x < m1 < .. < mk = y, with k >= 2
                // such that [ml, ml+1) is nonempty
                let mut ranges = Vec::with_capacity(self.split_factor);
                let start_index = local_values
                    .iter()
                    .position(|el| el.key() >= range.x())
                    .unwrap_or(0);
                // a pivot value. pivots repeat every split_factor, so
                // pivot(i) == pivot(i + split_factor * x). it is guaranteed
                // that pivot(0) != x if local_values.len() >= 2
                let pivot = |i: usize| {
                    let i = i % self.split_factor;
                    let offset = (local_values.len() * (i + 1)) / self.split_factor;
                    let offset = (start_index + offset) % local_values.len();
                    local_values[offset].key()
                };
                if range.is_all() {
                    // the range is the whole set, so range.x and range.y
                    // do not matter. exactly one of the ranges will wrap
                    // around, so we cover the entire set.
                    for i in 0..self.split_factor {
                        let (x, y) = (pivot(i), pivot(i + 1));
                        if x != y {
                            ranges.push(Range::new(x.clone(), y.clone()));
                        }
                    }
                } else {
                    // non-empty because pivot(0) != x for len >= 2
                    ranges.push(Range::new(range.x().clone(), pivot(0).clone()));
                    for i in 0..self.split_factor - 2 {
                        let (x, y) = (pivot(i), pivot(i + 1));
                        if x != y {
                            ranges.push(Range::new(x.clone(), y.clone()));
                        }
                    }
                    // non-empty because the pivot is inside the range and y
                    // is its exclusive end
                    ranges.push(Range::new(
                        pivot(self.split_factor - 2).clone(),
                        range.y().clone(),
                    ));
                }

                for range in ranges {
                    let chunk: Vec<&E> = self.store.get_range(&range).collect();
                    if chunk.len() > self.max_set_size {
                        let fingerprint = self.store.get_fingerprint(&range);
                        out.push(MessagePart::RangeFingerprint(RangeFingerprint {
                            range,
                            fingerprint,
                        }));
                    } else {
                        let values = chunk
                            .into_iter()
                            .cloned()
                            .map(|entry| {
                                let status = content_status_cb(&entry);
                                (entry, status)
                            })
                            .collect();
                        out.push(MessagePart::RangeItem(RangeItem {
                            range,
                            values,
                            have_local: false,
                        }));
                    }
                }
            }
        }

        if !out.is_empty() {
            Some(Message { parts: out })
        } else {
            None
        }
    }

    /// Insert an entry.
    ///
    /// The entry is inserted if it compares strictly greater than an
    /// existing entry for the same key, per the `Ord` contract of
    /// [`RangeEntry::Value`]. This makes merging commutative, associative
    /// and idempotent.
    pub fn put(&mut self, entry: E) -> InsertOutcome {
        if let Some(existing) = self.store.get(entry.key()) {
            if entry.value() <= existing.value() {
                return InsertOutcome::NotInserted;
            }
        }
        self.store.put(entry);
        InsertOutcome::Inserted
    }

    /// A reference to the underlying store.
    pub fn store(&self) -> &SimpleStore<E> {
        &self.store
    }
}
