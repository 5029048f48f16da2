//! Peer-to-peer data layer combining content-addressed blobs with
//! multi-writer key-value documents.
//!
//! The building blocks live in their own crates: `knot-blobs` stores and
//! transfers content-addressed blobs, `knot-docs` holds replicated documents
//! and reconciles them between peers, `knot-gossip` spreads updates through
//! a swarm. This crate ties them together: the [`Engine`] keeps documents
//! live-synced with their swarms, and [`Doc`] is the handle applications
//! work with.

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod docs;
pub mod engine;
pub mod ticket;
pub mod util;

pub use docs::{Doc, ShareMode};
pub use engine::{Engine, LiveEvent, Origin, SyncEvent, SyncReason};
pub use ticket::{Capability, DocTicket};
