//! Periodic garbage collection.
//!
//! The store itself exposes a single synchronous [`Store::gc`] pass. This
//! module runs that pass on an interval, asking the caller for additional
//! roots before each pass. The sync engine uses the callback to protect
//! content that document entries reference but no tag points at.

use std::time::Duration;

use knot_base::HashAndFormat;
use tracing::debug;

use crate::store::Store;

/// Run garbage collection forever, one pass per interval tick.
///
/// `protected` is called before every pass and returns extra roots to keep
/// alive. The task never fails; it is meant to be spawned and aborted or
/// dropped on shutdown.
pub async fn gc_loop(
    store: Store,
    interval: Duration,
    protected: impl Fn() -> Vec<HashAndFormat> + Send + 'static,
) {
    let mut ticker = tokio::time::interval(interval);
    // the first tick fires immediately, skip it so freshly created stores
    // are not swept before anything was tagged
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let roots = protected();
        let stats = store.gc(roots);
        debug!(
            blobs = stats.blobs_deleted,
            bytes = stats.bytes_deleted,
            "gc pass done"
        );
    }
}
