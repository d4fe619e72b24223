//! Object-map reconstruction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::async_op::{invoke_async_request, CancelToken, ProgressSink};
use crate::error::{ImageError, Result};
use crate::image::{refresh, ImageCtx};
use crate::metadata::{self, data_oid};
use crate::object_map::{self, ObjectMap, ObjectState};
use crate::operations::for_each_object;
use crate::types::{Features, ImageFlags, SnapId, SNAP_HEAD};
use crate::watcher::{self, RemoteOp};

pub fn rebuild_object_map(ctx: &Arc<ImageCtx>, progress: Arc<dyn ProgressSink>) -> Result<()> {
    invoke_async_request(
        ctx,
        RemoteOp::RebuildObjectMap,
        true,
        progress,
        |ctx, token, progress| execute(ctx, token, progress),
    )
}

/// Walk every object of the head and each snapshot, query existence,
/// write fresh maps, then clear the invalid flags.
pub(crate) fn execute(
    ctx: &Arc<ImageCtx>,
    token: &CancelToken,
    progress: &dyn ProgressSink,
) -> Result<()> {
    let (prefix, mapper, revisions, selection, flags, fast_diff) = {
        let snap = ctx.snap.read().unwrap();
        if !snap.features.contains(Features::OBJECT_MAP) {
            return Err(ImageError::Unsupported("object map is not enabled".into()));
        }
        let mut revisions: Vec<(SnapId, u64)> =
            snap.snaps.iter().map(|s| (s.id, s.size)).collect();
        revisions.push((SNAP_HEAD, snap.size));
        (
            snap.object_prefix.clone(),
            snap.mapper.clone(),
            revisions,
            snap.selection,
            snap.flags,
            snap.features.contains(Features::FAST_DIFF),
        )
    };
    let total: u64 = revisions.iter().map(|(_, size)| mapper.object_count(*size)).sum();
    let done = AtomicU64::new(0);
    debug!(image = %ctx.id, revisions = revisions.len(), total, "rebuilding object map");

    for (snap_id, size) in revisions {
        let count = mapper.object_count(size);
        let map = std::sync::Mutex::new(ObjectMap::new(count));
        for_each_object(0..count, ctx.config.concurrent_management_ops, token, |object_no| {
            let oid = data_oid(&prefix, object_no);
            if ctx.store.stat(ctx.pool, &oid, snap_id).is_ok() {
                map.lock().unwrap().set(object_no, ObjectState::Exists);
            }
            progress.update(done.fetch_add(1, Ordering::Relaxed) + 1, total);
            Ok(())
        })?;
        object_map::save(ctx.store.as_ref(), ctx.pool, &ctx.id, snap_id, &map.into_inner().unwrap())?;
    }

    // Fresh maps in hand; the invalid flags come off.
    let mut cleared = flags;
    cleared.remove(ImageFlags::OBJECT_MAP_INVALID);
    if fast_diff {
        cleared.remove(ImageFlags::FAST_DIFF_INVALID);
    }
    if cleared != flags {
        let _md = ctx.md.write().unwrap();
        metadata::set_flags(ctx.store.as_ref(), ctx.pool, &ctx.id, cleared)?;
    }
    {
        let mut snap = ctx.snap.write().unwrap();
        snap.flags = cleared;
    }
    refresh::load_object_map(ctx, selection);
    watcher::notify_header_update(ctx);
    Ok(())
}
