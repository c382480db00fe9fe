use std::io::Read;

use anyhow::Result;

/// Contract between the graph store and a layer storage backend.
///
/// The driver owns the rootfs bytes of every layer; the graph owns only
/// metadata plus, for bundles, a canonical archived copy. Drivers need not
/// be transactional: the graph creates driver state first and renames
/// metadata into place last, and removes the driver layer again when a
/// later step fails.
///
/// Concurrent calls on distinct ids must be safe; the graph never issues
/// concurrent calls for the same id.
pub trait Driver: Send + Sync {
    /// Backend name, for logs.
    fn name(&self) -> &'static str;

    /// Whether the backend holds a layer for `id`.
    fn exists(&self, id: &str) -> bool;

    /// Create a layer on top of `parent` (or an empty one), ready for writes.
    fn create(&self, id: &str, parent: Option<&str>) -> Result<()>;

    /// Apply a tar diff stream onto the layer. Returns the bytes applied.
    fn apply_diff(&self, id: &str, parent: Option<&str>, diff: &mut dyn Read) -> Result<u64>;

    /// Bytes the layer adds over its parent.
    fn diff_size(&self, id: &str, parent: Option<&str>) -> Result<u64>;

    /// Remove the layer's storage. Ids the driver has never seen are not an
    /// error; callers rely on this to clear possibly-stale state.
    fn remove(&self, id: &str) -> Result<()>;

    /// Canonical tar of the layer's changes over its parent.
    fn tar_layer(&self, id: &str) -> Result<Box<dyn Read + Send>>;
}
