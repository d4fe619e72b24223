//! Client library for striped block images layered over an object
//! store.
//!
//! An image is a virtual block device whose contents are striped across
//! fixed-size objects in a pool. The crate implements the image control
//! plane — per-image state and its refresh protocol, the cooperative
//! exclusive lock, snapshots and clone parent/child lifecycle, and the
//! long-running structural operations — on top of a narrow
//! [`ObjectStore`] seam. An in-memory store ([`MemCluster`]) ships in
//! the crate for tests and embedding.
//!
//! ```
//! use blockimg::{Image, MemCluster};
//! use std::sync::Arc;
//!
//! let cluster = MemCluster::new();
//! let pool = cluster.create_pool("rbd");
//! let store: Arc<dyn blockimg::ObjectStore> = Arc::new(cluster.connect());
//!
//! blockimg::create(&store, pool, "img", 8 << 20, &Default::default()).unwrap();
//! let img = Image::open(store, pool, "img").unwrap();
//! img.write(0, b"hello").unwrap();
//! assert_eq!(&img.read(0, 5).unwrap()[..], b"hello");
//! img.close().unwrap();
//! ```

mod async_op;
mod error;
mod exclusive_lock;
mod image;
mod io;
mod mem_store;
mod metadata;
mod object_map;
mod operations;
mod store;
mod striping;
mod types;
mod watcher;

pub use async_op::{NoProgress, ProgressSink};
pub use error::{ImageError, Result};
pub use exclusive_lock::LockState;
pub use image::ImageCtx;
pub use io::ObjectCacher;
pub use mem_store::{MemCluster, MemObjectStore};
pub use object_map::{ObjectMap, ObjectState};
pub use operations::admin::{copy, create, list, remove, rename};
pub use operations::clone_image::clone;
pub use store::{NotifyResponse, ObjectStore, WatchHandler, WatchId};
pub use striping::{ExtentMapper, ObjectExtent, Striper};
pub use types::{
    Config, CreateOptions, Features, ImageFlags, ImageFormat, LockMode, Locker, ParentInfo,
    ParentSpec, PoolId, ProtectionStatus, SnapContext, SnapId, SnapInfo, SnapSelection,
    DEFAULT_ORDER, MAX_ORDER, MIN_ORDER, SNAP_HEAD,
};

use bytes::Bytes;
use std::sync::Arc;

/// Basic geometry of an open image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageStat {
    pub size: u64,
    pub order: u8,
    pub object_size: u64,
    pub num_objects: u64,
    pub object_prefix: String,
}

/// Handle to one open image.
///
/// Dropping the handle closes the image best-effort; call
/// [`Image::close`] to observe teardown errors.
pub struct Image {
    ctx: Arc<ImageCtx>,
    closed: bool,
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image").field("closed", &self.closed).finish()
    }
}

impl Image {
    pub fn open(store: Arc<dyn ObjectStore>, pool: PoolId, name: &str) -> Result<Image> {
        Self::open_with_config(store, pool, name, false, Config::default())
    }

    pub fn open_read_only(store: Arc<dyn ObjectStore>, pool: PoolId, name: &str) -> Result<Image> {
        Self::open_with_config(store, pool, name, true, Config::default())
    }

    pub fn open_with_config(
        store: Arc<dyn ObjectStore>,
        pool: PoolId,
        name: &str,
        read_only: bool,
        config: Config,
    ) -> Result<Image> {
        let ctx = ImageCtx::open(store, pool, name, read_only, config)?;
        Ok(Image { ctx, closed: false })
    }

    /// The underlying context, for callers composing their own
    /// operations.
    pub fn context(&self) -> &Arc<ImageCtx> {
        &self.ctx
    }

    // --- data path ---

    pub fn read(&self, off: u64, len: u64) -> Result<Bytes> {
        io::read(&self.ctx, off, len)
    }

    pub fn write(&self, off: u64, data: &[u8]) -> Result<()> {
        io::write(&self.ctx, off, data)
    }

    pub fn discard(&self, off: u64, len: u64) -> Result<()> {
        io::discard(&self.ctx, off, len)
    }

    /// All writes submitted before this call are durable when it
    /// returns.
    pub fn flush(&self) -> Result<()> {
        io::flush(&self.ctx)
    }

    // --- structure ---

    pub fn resize(&self, size: u64) -> Result<()> {
        self.resize_with_progress(size, Arc::new(NoProgress))
    }

    pub fn resize_with_progress(&self, size: u64, progress: Arc<dyn ProgressSink>) -> Result<()> {
        operations::resize::resize(&self.ctx, size, progress)
    }

    pub fn flatten(&self) -> Result<()> {
        self.flatten_with_progress(Arc::new(NoProgress))
    }

    pub fn flatten_with_progress(&self, progress: Arc<dyn ProgressSink>) -> Result<()> {
        operations::flatten::flatten(&self.ctx, progress)
    }

    pub fn rebuild_object_map(&self, progress: Arc<dyn ProgressSink>) -> Result<()> {
        operations::rebuild::rebuild_object_map(&self.ctx, progress)
    }

    pub fn update_features(&self, features: Features, enable: bool) -> Result<()> {
        operations::features::update_features(&self.ctx, features, enable)
    }

    // --- snapshots ---

    pub fn snap_create(&self, name: &str) -> Result<()> {
        operations::snapshot::snap_create(&self.ctx, name)
    }

    pub fn snap_remove(&self, name: &str) -> Result<()> {
        operations::snapshot::snap_remove(&self.ctx, name)
    }

    pub fn snap_rollback(&self, name: &str) -> Result<()> {
        self.snap_rollback_with_progress(name, Arc::new(NoProgress))
    }

    pub fn snap_rollback_with_progress(
        &self,
        name: &str,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<()> {
        operations::snapshot::snap_rollback(&self.ctx, name, progress)
    }

    pub fn snap_protect(&self, name: &str) -> Result<()> {
        operations::snapshot::snap_protect(&self.ctx, name)
    }

    pub fn snap_unprotect(&self, name: &str) -> Result<()> {
        operations::snapshot::snap_unprotect(&self.ctx, name)
    }

    pub fn snap_list(&self) -> Result<Vec<SnapInfo>> {
        operations::snapshot::snap_list(&self.ctx)
    }

    pub fn snap_is_protected(&self, name: &str) -> Result<bool> {
        operations::snapshot::snap_is_protected(&self.ctx, name)
    }

    /// Select a snapshot (or `None` for the head) as the view for
    /// subsequent reads.
    pub fn set_snap_selection(&self, name: Option<&str>) -> Result<()> {
        self.ctx.set_snap_selection(name)
    }

    // --- introspection ---

    pub fn stat(&self) -> Result<ImageStat> {
        image::refresh::check(&self.ctx)?;
        let snap = self.ctx.snap.read().unwrap();
        let size = snap.current_size();
        Ok(ImageStat {
            size,
            order: snap.order,
            object_size: snap.mapper.object_size(),
            num_objects: snap.mapper.object_count(size),
            object_prefix: snap.object_prefix.clone(),
        })
    }

    pub fn id(&self) -> String {
        self.ctx.id.clone()
    }

    pub fn format(&self) -> ImageFormat {
        self.ctx.format
    }

    pub fn size(&self) -> u64 {
        self.ctx.size()
    }

    pub fn features(&self) -> Features {
        self.ctx.features()
    }

    pub fn flags(&self) -> ImageFlags {
        self.ctx.flags()
    }

    pub fn is_exclusive_lock_owner(&self) -> bool {
        self.ctx.is_exclusive_lock_owner()
    }

    pub fn parent_info(&self) -> Option<ParentInfo> {
        self.ctx.parent.read().unwrap().info.clone()
    }

    /// Snapshot of the in-memory object map for the selected revision,
    /// when the feature is enabled.
    pub fn object_map(&self) -> Option<ObjectMap> {
        self.ctx.object_map.lock().unwrap().clone()
    }

    // --- user metadata ---

    pub fn metadata_get(&self, key: &str) -> Result<Option<Bytes>> {
        metadata::meta_get(self.ctx.store.as_ref(), self.ctx.pool, &self.ctx.id, key)
    }

    pub fn metadata_set(&self, key: &str, value: &[u8]) -> Result<()> {
        metadata::meta_set(self.ctx.store.as_ref(), self.ctx.pool, &self.ctx.id, key, value)
    }

    pub fn metadata_list(&self) -> Result<Vec<(String, Bytes)>> {
        metadata::meta_list(self.ctx.store.as_ref(), self.ctx.pool, &self.ctx.id)
    }

    // --- cooperative exclusive lock ---

    /// Try to become the exclusive-lock owner without waiting for a
    /// hand-off. Fails with [`ImageError::WouldBlock`] while a peer
    /// holds the lock.
    pub fn acquire_exclusive_lock(&self) -> Result<()> {
        if !self.features().contains(Features::EXCLUSIVE_LOCK) {
            return Err(ImageError::Unsupported(
                "exclusive-lock is not enabled".into(),
            ));
        }
        if exclusive_lock::try_acquire(&self.ctx)? {
            Ok(())
        } else {
            Err(ImageError::WouldBlock)
        }
    }

    /// Give the exclusive lock up if this client holds it.
    pub fn release_exclusive_lock(&self) -> Result<()> {
        exclusive_lock::release(&self.ctx)
    }

    // --- user-facing advisory locks ---

    pub fn list_lockers(&self) -> Result<Vec<Locker>> {
        self.ctx
            .store
            .list_lockers(self.ctx.pool, &self.ctx.header, metadata::HEADER_LOCK_NAME)
    }

    pub fn lock_exclusive(&self, cookie: &str) -> Result<()> {
        self.ctx.store.lock_exclusive(
            self.ctx.pool,
            &self.ctx.header,
            metadata::HEADER_LOCK_NAME,
            cookie,
            "",
            "user lock",
        )
    }

    pub fn lock_shared(&self, cookie: &str, tag: &str) -> Result<()> {
        self.ctx.store.lock_shared(
            self.ctx.pool,
            &self.ctx.header,
            metadata::HEADER_LOCK_NAME,
            cookie,
            tag,
            "user lock",
        )
    }

    pub fn unlock(&self, cookie: &str) -> Result<()> {
        self.ctx
            .store
            .unlock(self.ctx.pool, &self.ctx.header, metadata::HEADER_LOCK_NAME, cookie)
    }

    pub fn break_lock(&self, client: &str, cookie: &str) -> Result<()> {
        self.ctx.store.break_lock(
            self.ctx.pool,
            &self.ctx.header,
            metadata::HEADER_LOCK_NAME,
            client,
            cookie,
        )
    }

    // --- lifecycle ---

    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.ctx.close()
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.ctx.close();
        }
    }
}
