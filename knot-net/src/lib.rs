//! Transport layer for knot.
//!
//! Connection establishment, transport security and peer discovery are
//! consumed as opaque services by the rest of knot: everything above this
//! crate only needs a way to open a bidirectional byte stream to a peer for a
//! given protocol identifier (ALPN). This crate provides the peer addressing
//! types and an in-process [`Network`] implementation of that service, used
//! by the sync engine, the gossip layer and the test suites.
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

mod endpoint;
mod peer;

pub use endpoint::{Connection, Endpoint, Incoming, Network, RecvStream, SendStream};
pub use peer::{PeerAddr, PeerId};
