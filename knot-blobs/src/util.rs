//! Tags and temp tags.

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use knot_base::HashAndFormat;
use serde::{Deserialize, Serialize};

/// A named pin on a [`HashAndFormat`].
///
/// Tags persist in the store and protect their target from garbage
/// collection. The name is an arbitrary byte string.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, derive_more::From,
)]
pub struct Tag(pub Bytes);

impl From<&str> for Tag {
    fn from(value: &str) -> Self {
        Self(Bytes::from(value.to_owned()))
    }
}

impl From<String> for Tag {
    fn from(value: String) -> Self {
        Self(Bytes::from(value))
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "\"{}\"", s),
            Err(_) => write!(f, "{}", hex::encode(&self.0)),
        }
    }
}

impl Tag {
    /// Create an automatically named tag from a timestamp.
    ///
    /// The name is unique enough for interactive use. Callers that need
    /// uniqueness under contention should retry with a later timestamp.
    pub fn auto_generated(time: SystemTime) -> Self {
        let duration = time
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default();
        Self::from(format!(
            "auto-{}.{:09}",
            duration.as_secs(),
            duration.subsec_nanos()
        ))
    }

    /// The next tag in tag order, used as an exclusive range end.
    pub fn successor(&self) -> Self {
        let mut bytes = self.0.to_vec();
        bytes.push(0);
        Self(bytes.into())
    }
}

/// A trait for things that can track liveness of blobs.
///
/// This trait works together with [`TempTag`] to keep track of blobs that are
/// still in use, even if they are not pinned by a named tag.
pub trait LivenessTracker: fmt::Debug + Send + Sync + 'static {
    /// Called when a temp tag is cloned.
    fn on_clone(&self, inner: &HashAndFormat);
    /// Called when a temp tag is dropped.
    fn on_drop(&self, inner: &HashAndFormat);
}

/// An ephemeral pin on a [`HashAndFormat`].
///
/// Holds the content alive for as long as the tag (or any clone of it) is
/// around, without persisting anything. Used during imports, fetches and sync
/// so content cannot be collected between being written and being referenced.
#[derive(Debug)]
pub struct TempTag {
    inner: HashAndFormat,
    liveness: Option<Arc<dyn LivenessTracker>>,
}

impl TempTag {
    /// Create a new temp tag for the given hash and format.
    ///
    /// This should only be used by store implementations. Use
    /// [`crate::store::Store::temp_tag`] to pin content in a store.
    pub fn new(inner: HashAndFormat, liveness: Option<Arc<dyn LivenessTracker>>) -> Self {
        if let Some(liveness) = liveness.as_ref() {
            liveness.on_clone(&inner);
        }
        Self { inner, liveness }
    }

    /// The hash of the pinned item.
    pub fn hash(&self) -> &knot_base::Hash {
        &self.inner.hash
    }

    /// The format of the pinned item.
    pub fn format(&self) -> knot_base::BlobFormat {
        self.inner.format
    }

    /// The hash and format of the pinned item.
    pub fn hash_and_format(&self) -> HashAndFormat {
        self.inner
    }

    /// Keep the item alive until the end of the process.
    pub fn leak(mut self) {
        // set the liveness tracker to None, so that the refcount is not
        // decreased on drop
        self.liveness = None;
    }
}

impl Clone for TempTag {
    fn clone(&self) -> Self {
        Self::new(self.inner, self.liveness.clone())
    }
}

impl Drop for TempTag {
    fn drop(&mut self) {
        if let Some(liveness) = self.liveness.as_ref() {
            liveness.on_drop(&self.inner);
        }
    }
}
