//! Per-image context: the in-memory mirror of one open image.
//!
//! # Lock order
//!
//! `owner` → `md` → `cache` → `snap` → `parent` → `refresh`. Forward
//! acquisition only; the single downgrade site (read → write → read on
//! `owner`) lives in the async-request envelope and holds no lower lock
//! across it. `object_map` is a leaf: nothing else is acquired while it
//! is held.

pub(crate) mod refresh;

use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, warn};

use crate::async_op::AsyncOpTracker;
use crate::error::{ImageError, Result};
use crate::exclusive_lock::{self, OwnerState};
use crate::io::ObjectCacher;
use crate::metadata;
use crate::object_map::ObjectMap;
use crate::store::ObjectStore;
use crate::striping::{ExtentMapper, Striper};
use crate::types::{
    Config, Features, ImageFlags, ImageFormat, Locker, ParentInfo, PoolId, SnapContext, SnapId,
    SnapInfo, SnapSelection,
};
use crate::watcher::{self, LockWaiters, RemoteRequests, WatcherHandle};

/// Everything guarded by the snapshot lock: sizes, features, flags, the
/// snapshot table and the current selection.
pub(crate) struct SnapState {
    /// Size of the head revision. Use [`SnapState::current_size`] for
    /// the selected view.
    pub size: u64,
    pub order: u8,
    pub features: Features,
    pub flags: ImageFlags,
    pub object_prefix: String,
    pub stripe_unit: u64,
    pub stripe_count: u64,
    pub snapc: SnapContext,
    pub snaps: Vec<SnapInfo>,
    pub lockers: Vec<Locker>,
    pub selection: SnapSelection,
    /// False when the selected snapshot was deleted underneath us.
    pub snap_exists: bool,
    pub mapper: Arc<dyn ExtentMapper>,
}

impl SnapState {
    pub(crate) fn snap_by_name(&self, name: &str) -> Option<&SnapInfo> {
        self.snaps.iter().find(|s| s.name == name)
    }

    pub(crate) fn snap_by_id(&self, id: SnapId) -> Option<&SnapInfo> {
        self.snaps.iter().find(|s| s.id == id)
    }

    /// Image size at the selected view.
    pub(crate) fn current_size(&self) -> u64 {
        match self.selection {
            SnapSelection::Head => self.size,
            SnapSelection::Snap(id) => self.snap_by_id(id).map(|s| s.size).unwrap_or(0),
        }
    }

    /// Snap id tagging reads for the selected view.
    pub(crate) fn read_snap(&self) -> SnapId {
        match self.selection {
            SnapSelection::Head => crate::types::SNAP_HEAD,
            SnapSelection::Snap(id) => id,
        }
    }

}

/// Parent edge plus the open parent context it resolves to. The child
/// exclusively owns the parent handle; closing the child closes it.
#[derive(Default)]
pub(crate) struct ParentState {
    pub info: Option<ParentInfo>,
    pub image: Option<Arc<ImageCtx>>,
}

#[derive(Debug, Default)]
pub(crate) struct RefreshCounters {
    /// Bumped on every notification and local metadata write.
    pub refresh_seq: u64,
    /// Last value for which an in-memory refresh completed.
    pub last_refresh: u64,
}

/// One open image.
pub struct ImageCtx {
    pub(crate) store: Arc<dyn ObjectStore>,
    pub(crate) client: String,
    pub(crate) pool: PoolId,
    pub(crate) name: String,
    pub(crate) id: String,
    pub(crate) header: String,
    pub(crate) format: ImageFormat,
    pub(crate) read_only: bool,
    pub(crate) config: Config,

    // Locks, in acquisition order.
    pub(crate) owner: RwLock<OwnerState>,
    pub(crate) md: RwLock<()>,
    pub(crate) cache: Mutex<Option<Arc<dyn ObjectCacher>>>,
    pub(crate) snap: RwLock<SnapState>,
    pub(crate) parent: RwLock<ParentState>,
    pub(crate) refresh: Mutex<RefreshCounters>,

    /// Object map of the selected revision, when the feature is on.
    pub(crate) object_map: Mutex<Option<ObjectMap>>,

    pub(crate) ops: AsyncOpTracker,
    pub(crate) remote: RemoteRequests,
    pub(crate) lock_waiters: LockWaiters,
    pub(crate) watcher: Mutex<Option<WatcherHandle>>,
}

fn initial_snap_state() -> SnapState {
    SnapState {
        size: 0,
        order: crate::types::DEFAULT_ORDER,
        features: Features::empty(),
        flags: ImageFlags::empty(),
        object_prefix: String::new(),
        stripe_unit: 0,
        stripe_count: 0,
        snapc: SnapContext::default(),
        snaps: Vec::new(),
        lockers: Vec::new(),
        selection: SnapSelection::Head,
        snap_exists: true,
        mapper: Arc::new(
            Striper::new(crate::types::DEFAULT_ORDER, 0, 0).expect("default layout is valid"),
        ),
    }
}

impl ImageCtx {
    fn new(
        store: Arc<dyn ObjectStore>,
        pool: PoolId,
        name: String,
        id: String,
        header: String,
        format: ImageFormat,
        read_only: bool,
        config: Config,
    ) -> Arc<ImageCtx> {
        let client = store.client_id();
        Arc::new(ImageCtx {
            store,
            client,
            pool,
            name,
            id,
            header,
            format,
            read_only,
            config,
            owner: RwLock::new(OwnerState::default()),
            md: RwLock::new(()),
            cache: Mutex::new(None),
            snap: RwLock::new(initial_snap_state()),
            parent: RwLock::new(ParentState::default()),
            refresh: Mutex::new(RefreshCounters {
                // Force the first refresh.
                refresh_seq: 1,
                last_refresh: 0,
            }),
            object_map: Mutex::new(None),
            ops: AsyncOpTracker::default(),
            remote: RemoteRequests::default(),
            lock_waiters: LockWaiters::default(),
            watcher: Mutex::new(None),
        })
    }

    /// Open an image by name, resolving its format from the directory.
    pub fn open(
        store: Arc<dyn ObjectStore>,
        pool: PoolId,
        name: &str,
        read_only: bool,
        config: Config,
    ) -> Result<Arc<ImageCtx>> {
        let ctx = match metadata::dir_lookup_id(store.as_ref(), pool, name)? {
            Some(id) => {
                let header = metadata::header_oid(&id);
                Self::new(
                    store,
                    pool,
                    name.to_string(),
                    id,
                    header,
                    ImageFormat::Modern,
                    read_only,
                    config,
                )
            }
            None => {
                let header = metadata::legacy_header_oid(name);
                if store
                    .stat(pool, &header, crate::types::SNAP_HEAD)
                    .is_err()
                {
                    return Err(ImageError::NotFound(format!("image {name}")));
                }
                Self::new(
                    store,
                    pool,
                    name.to_string(),
                    name.to_string(),
                    header,
                    ImageFormat::Legacy,
                    read_only,
                    config,
                )
            }
        };
        ctx.init()?;
        Ok(ctx)
    }

    /// Open a modern image by id. Parent contexts are opened this way;
    /// they are always read-only and unnamed.
    pub(crate) fn open_by_id(
        store: Arc<dyn ObjectStore>,
        pool: PoolId,
        id: &str,
        read_only: bool,
        config: Config,
    ) -> Result<Arc<ImageCtx>> {
        let header = metadata::header_oid(id);
        let ctx = Self::new(
            store,
            pool,
            String::new(),
            id.to_string(),
            header,
            ImageFormat::Modern,
            read_only,
            config,
        );
        ctx.init()?;
        Ok(ctx)
    }

    fn init(self: &Arc<Self>) -> Result<()> {
        if !self.read_only {
            watcher::register(self)?;
        }
        match refresh::refresh(self) {
            Ok(()) => Ok(()),
            Err(err) => {
                watcher::unregister(self);
                Err(err)
            }
        }
    }

    /// Select a revision to read: a snapshot by name, or the head.
    pub fn set_snap_selection(self: &Arc<Self>, snap_name: Option<&str>) -> Result<()> {
        refresh::check(self)?;
        let selection = {
            let mut snap = self.snap.write().unwrap();
            match snap_name {
                None => {
                    snap.selection = SnapSelection::Head;
                    snap.snap_exists = true;
                    SnapSelection::Head
                }
                Some(name) => {
                    let id = snap
                        .snap_by_name(name)
                        .map(|s| s.id)
                        .ok_or_else(|| ImageError::NotFound(format!("snapshot {name}")))?;
                    snap.selection = SnapSelection::Snap(id);
                    snap.snap_exists = true;
                    SnapSelection::Snap(id)
                }
            }
        };
        refresh::load_object_map(self, selection);
        Ok(())
    }

    pub(crate) fn set_snap_selection_by_id(self: &Arc<Self>, id: SnapId) -> Result<()> {
        {
            let mut snap = self.snap.write().unwrap();
            if snap.snap_by_id(id).is_none() {
                return Err(ImageError::NotFound(format!("snapshot id {id}")));
            }
            snap.selection = SnapSelection::Snap(id);
            snap.snap_exists = true;
        }
        refresh::load_object_map(self, SnapSelection::Snap(id));
        Ok(())
    }

    /// Block until every tracked long operation reaches a terminal
    /// state.
    pub fn flush_async_operations(&self) {
        self.ops.flush();
    }

    /// Signal all outstanding long operations and delegated requests for
    /// this context; each completes promptly with `Restart`.
    pub fn cancel_async_requests(&self) {
        self.ops.cancel_all();
        self.remote.cancel_all();
    }

    /// Drop cached object data without writing it back.
    pub fn invalidate_cache(&self) -> Result<()> {
        let cache = self.cache.lock().unwrap().clone();
        if let Some(cache) = cache {
            cache.invalidate()?;
        }
        Ok(())
    }

    /// Install a write-back object cache. The cache is the caller's; the
    /// context only drives flush and invalidation.
    pub fn set_object_cacher(&self, cacher: Arc<dyn ObjectCacher>) {
        *self.cache.lock().unwrap() = Some(cacher);
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn features(&self) -> Features {
        self.snap.read().unwrap().features
    }

    pub fn flags(&self) -> ImageFlags {
        self.snap.read().unwrap().flags
    }

    pub fn size(&self) -> u64 {
        self.snap.read().unwrap().current_size()
    }

    pub fn is_exclusive_lock_owner(&self) -> bool {
        exclusive_lock::is_owner(self)
    }

    /// Tear the context down: cancel and drain outstanding work, give up
    /// the lock, stop watching and close the parent chain.
    pub fn close(self: &Arc<Self>) -> Result<()> {
        debug!(image = %self.id, "closing image");
        self.cancel_async_requests();
        self.ops.flush();
        if !self.read_only {
            if let Err(err) = crate::io::flush(self) {
                warn!(error = %err, "flush on close failed");
            }
            exclusive_lock::release(self)?;
        }
        watcher::unregister(self);
        let parent = self.parent.write().unwrap().image.take();
        if let Some(parent) = parent {
            parent.close()?;
        }
        Ok(())
    }
}
