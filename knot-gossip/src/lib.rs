//! Topic based gossip broadcast.
//!
//! The protocol logic lives in [`proto`] as an IO-free state machine, driven
//! by feeding in events and acting on the returned output events. [`net`]
//! connects that state machine to actual peers and exposes the subscriber
//! API used by the sync engine.

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod net;
pub mod proto;

pub use proto::TopicId;
