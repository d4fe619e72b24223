//! Copy-up of all parent data into a child, severing the parent edge.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::async_op::{invoke_async_request, CancelToken, ProgressSink};
use crate::error::{ImageError, Result};
use crate::image::{refresh, ImageCtx};
use crate::io;
use crate::metadata::{self, data_oid};
use crate::operations::for_each_object;
use crate::types::{ParentInfo, SNAP_HEAD};
use crate::watcher::{self, RemoteOp};

pub fn flatten(ctx: &Arc<ImageCtx>, progress: Arc<dyn ProgressSink>) -> Result<()> {
    invoke_async_request(ctx, RemoteOp::Flatten, false, progress, |ctx, token, progress| {
        execute(ctx, token, progress)
    })
}

/// Copy every object under the overlap from the parent, then atomically
/// clear the parent spec and drop the children-set entry. Re-running on
/// an image without a parent fails with `Invalid` and has no effect.
pub(crate) fn execute(
    ctx: &Arc<ImageCtx>,
    token: &CancelToken,
    progress: &dyn ProgressSink,
) -> Result<()> {
    let (parent_info, parent_image) = {
        let parent = ctx.parent.read().unwrap();
        match (&parent.info, &parent.image) {
            (Some(info), Some(image)) => (info.clone(), image.clone()),
            _ => return Err(ImageError::Invalid("image has no parent".into())),
        }
    };
    let (prefix, mapper, snapc) = {
        let snap = ctx.snap.read().unwrap();
        (
            snap.object_prefix.clone(),
            snap.mapper.clone(),
            snap.snapc.clone(),
        )
    };
    let object_size = mapper.object_size();
    let overlap_objects = mapper.object_count(parent_info.overlap);
    debug!(image = %ctx.id, overlap_objects, "flattening");

    let done = AtomicU64::new(0);
    for_each_object(
        0..overlap_objects,
        ctx.config.concurrent_management_ops,
        token,
        |object_no| {
            let oid = data_oid(&prefix, object_no);
            // An existing child object already broke sharing.
            if ctx.store.stat(ctx.pool, &oid, SNAP_HEAD).is_err() {
                let image_off = object_no * object_size;
                let len = object_size.min(parent_info.overlap - image_off);
                let data = io::read(&parent_image, image_off, len)?;
                if data.iter().any(|b| *b != 0) {
                    ctx.store.write(ctx.pool, &oid, 0, &data, &snapc)?;
                    io::set_map_state(ctx, object_no, crate::object_map::ObjectState::Exists)?;
                }
            }
            progress.update(done.fetch_add(1, Ordering::Relaxed) + 1, overlap_objects);
            Ok(())
        },
    )?;

    detach_parent(ctx, &parent_info)?;
    watcher::notify_header_update(ctx);
    progress.update(overlap_objects, overlap_objects);
    Ok(())
}

/// Clear the persisted parent spec, deregister from the children set in
/// this pool, and drop the open parent handle.
pub(crate) fn detach_parent(ctx: &Arc<ImageCtx>, parent_info: &ParentInfo) -> Result<()> {
    {
        let _md = ctx.md.write().unwrap();
        metadata::remove_parent(ctx.store.as_ref(), ctx.pool, &ctx.id)?;
        let children_pool = ctx.store.base_tier(ctx.pool)?;
        match metadata::remove_child(
            ctx.store.as_ref(),
            children_pool,
            &parent_info.spec,
            ctx.pool,
            &ctx.id,
        ) {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                warn!(image = %ctx.id, "child entry already absent");
            }
            Err(err) => return Err(err),
        }
    }
    refresh::refresh_parent(ctx, None)
}
