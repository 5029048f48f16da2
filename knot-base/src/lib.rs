//! Base types and encodings used throughout knot.
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod base32;
pub mod hash;
pub mod ticket;

pub use hash::{BlobFormat, Hash, HashAndFormat};
