//! The object-store collaborator seam.
//!
//! The core never talks to the wire directly; everything it needs from
//! the backing store is expressed by [`ObjectStore`]. An in-memory
//! implementation ships in [`crate::mem_store`] for tests and embedding.

use bytes::Bytes;
use std::sync::Arc;

use crate::error::Result;
use crate::types::{Locker, PoolId, SnapContext, SnapId};

/// Receives notifications for one watch registration.
///
/// Callbacks fire on arbitrary threads. The returned bytes, if any, are
/// delivered back to the notifier as this watcher's acknowledgment
/// payload.
pub trait WatchHandler: Send + Sync {
    fn handle(&self, payload: &[u8]) -> Option<Vec<u8>>;
}

/// Identifies one watch registration on an object.
pub type WatchId = u64;

/// One watcher's acknowledgment to a notify.
#[derive(Debug, Clone)]
pub struct NotifyResponse {
    /// Client identity of the acknowledging watcher.
    pub client: String,
    pub payload: Option<Bytes>,
}

/// Narrow interface onto the backing object store.
///
/// One value of this type represents one client session: `client_id`
/// and `client_address` are stable for the session and distinct across
/// concurrently connected clients.
pub trait ObjectStore: Send + Sync {
    // --- identity ---

    fn client_id(&self) -> String;
    fn client_address(&self) -> String;

    // --- pools ---

    fn pool_list(&self) -> Result<Vec<(PoolId, String)>>;
    fn pool_lookup(&self, name: &str) -> Result<PoolId>;
    fn pool_name(&self, pool: PoolId) -> Result<String>;
    /// Base tier of a pool; equals the pool itself unless the pool is a
    /// cache tier.
    fn base_tier(&self, pool: PoolId) -> Result<PoolId>;
    /// Block until the client's view of pool topology is current.
    fn wait_for_latest_map(&self) -> Result<()>;

    // --- self-managed snapshot ids (pool scoped) ---

    fn allocate_snap_id(&self, pool: PoolId) -> Result<SnapId>;
    fn release_snap_id(&self, pool: PoolId, snap: SnapId) -> Result<()>;

    // --- object data ---

    /// Read up to `len` bytes at `off` from the object as of `snap`
    /// (`SNAP_HEAD` reads the live revision). Short reads past the end of
    /// the object are not an error.
    fn read(&self, pool: PoolId, oid: &str, snap: SnapId, off: u64, len: u64) -> Result<Bytes>;

    fn write(&self, pool: PoolId, oid: &str, off: u64, data: &[u8], snapc: &SnapContext)
        -> Result<()>;
    fn write_full(&self, pool: PoolId, oid: &str, data: &[u8], snapc: &SnapContext) -> Result<()>;
    fn zero(&self, pool: PoolId, oid: &str, off: u64, len: u64, snapc: &SnapContext) -> Result<()>;
    fn truncate(&self, pool: PoolId, oid: &str, size: u64, snapc: &SnapContext) -> Result<()>;
    fn remove(&self, pool: PoolId, oid: &str, snapc: &SnapContext) -> Result<()>;

    /// Create an empty object, failing if it already exists.
    fn create_exclusive(&self, pool: PoolId, oid: &str) -> Result<()>;

    /// Size of the object at `snap`, or `NotFound`.
    fn stat(&self, pool: PoolId, oid: &str, snap: SnapId) -> Result<u64>;

    /// Reset the live revision of the object to its state as of `snap`.
    fn rollback_object(&self, pool: PoolId, oid: &str, snap: SnapId, snapc: &SnapContext)
        -> Result<()>;

    /// Wait until every write this client issued to the pool is durable.
    fn flush(&self, pool: PoolId) -> Result<()>;

    // --- omap (per-object key/value) ---

    fn omap_get(&self, pool: PoolId, oid: &str, key: &str) -> Result<Option<Bytes>>;
    fn omap_set(&self, pool: PoolId, oid: &str, entries: &[(String, Bytes)]) -> Result<()>;
    fn omap_remove(&self, pool: PoolId, oid: &str, key: &str) -> Result<()>;
    /// All entries whose key starts with `prefix`, in key order.
    fn omap_list(&self, pool: PoolId, oid: &str, prefix: &str) -> Result<Vec<(String, Bytes)>>;
    /// Atomically replace `key` if its current value matches `expected`
    /// (`None` = absent). Returns false when the precondition failed.
    fn omap_compare_and_set(
        &self,
        pool: PoolId,
        oid: &str,
        key: &str,
        expected: Option<&[u8]>,
        value: Option<&[u8]>,
    ) -> Result<bool>;

    // --- legacy directory map ---

    fn tmap_set(&self, pool: PoolId, oid: &str, key: &str, value: &[u8]) -> Result<()>;
    fn tmap_remove(&self, pool: PoolId, oid: &str, key: &str) -> Result<()>;
    fn tmap_list(&self, pool: PoolId, oid: &str) -> Result<Vec<(String, Bytes)>>;

    // --- advisory locks ---

    fn lock_exclusive(
        &self,
        pool: PoolId,
        oid: &str,
        name: &str,
        cookie: &str,
        tag: &str,
        description: &str,
    ) -> Result<()>;
    fn lock_shared(
        &self,
        pool: PoolId,
        oid: &str,
        name: &str,
        cookie: &str,
        tag: &str,
        description: &str,
    ) -> Result<()>;
    fn unlock(&self, pool: PoolId, oid: &str, name: &str, cookie: &str) -> Result<()>;
    fn break_lock(&self, pool: PoolId, oid: &str, name: &str, client: &str, cookie: &str)
        -> Result<()>;
    fn list_lockers(&self, pool: PoolId, oid: &str, name: &str) -> Result<Vec<Locker>>;

    // --- watch / notify ---

    fn watch(
        &self,
        pool: PoolId,
        oid: &str,
        handler: Arc<dyn WatchHandler>,
    ) -> Result<WatchId>;
    fn unwatch(&self, pool: PoolId, oid: &str, watch: WatchId) -> Result<()>;
    /// Deliver `payload` to every watcher of the object (the notifier's
    /// own watchers included) and collect their acknowledgments.
    fn notify(&self, pool: PoolId, oid: &str, payload: &[u8]) -> Result<Vec<NotifyResponse>>;
}
