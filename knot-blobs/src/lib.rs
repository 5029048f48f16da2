//! Content-addressed blob storage for knot.
//!
//! Blobs are immutable byte sequences addressed by their blake3 hash. The
//! store tracks complete and partial blobs, named [`Tag`]s and RAII
//! [`TempTag`]s that pin content, and runs mark and sweep garbage collection
//! over everything reachable from those pins. A blob in [`BlobFormat::HashSeq`]
//! format is itself a sequence of hashes, which is how directory imports are
//! represented as collections.

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod fs;
pub mod gc;
pub mod hashseq;
pub mod net;
pub mod store;
pub mod util;

pub use crate::store::Store;
pub use crate::util::{Tag, TempTag};
pub use knot_base::{BlobFormat, Hash, HashAndFormat};
