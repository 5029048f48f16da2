//! Multi-writer key-value documents, replicated via set reconciliation.
//!
//! A document is a namespace holding entries written by any number of
//! authors. Every entry maps a `(author, key)` pair to the hash of a content
//! blob, with a timestamp for conflict resolution: the entry with the higher
//! `(timestamp, hash)` wins, deterministically on every replica. Merging is
//! commutative, associative and idempotent, so replicas converge regardless
//! of the order in which entries arrive.
//!
//! Synchronization between two replicas uses range-based set reconciliation
//! ([`ranger`]), exchanging fingerprints of key ranges and recursing into
//! ranges that differ.

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod keys;
pub mod net;
pub mod ranger;
pub mod store;
pub mod sync;

pub use keys::{Author, AuthorId, Namespace, NamespaceId};
pub use store::{Query, SortBy, SortDirection, Store};
pub use sync::{ContentStatus, Entry, Event, Record, RecordIdentifier, Replica, SignedEntry};
