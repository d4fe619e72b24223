//! Image resize.

use std::sync::Arc;

use tracing::debug;

use crate::async_op::{invoke_async_request, CancelToken, ProgressSink};
use crate::error::Result;
use crate::image::ImageCtx;
use crate::metadata;
use crate::object_map;
use crate::operations::trim;
use crate::types::{Features, ImageFormat, SNAP_HEAD};
use crate::watcher::{self, RemoteOp};

pub fn resize(ctx: &Arc<ImageCtx>, size: u64, progress: Arc<dyn ProgressSink>) -> Result<()> {
    invoke_async_request(
        ctx,
        RemoteOp::Resize { size },
        false,
        progress,
        move |ctx, token, progress| execute(ctx, size, token, progress),
    )
}

/// Shrink: trim objects past the new tail, then persist the new size.
/// Grow: persist first; the new region reads as zero until written.
pub(crate) fn execute(
    ctx: &Arc<ImageCtx>,
    new_size: u64,
    token: &CancelToken,
    progress: &dyn ProgressSink,
) -> Result<()> {
    let old_size = {
        let snap = ctx.snap.read().unwrap();
        snap.size
    };
    if new_size == old_size {
        progress.update(0, 0);
        return Ok(());
    }
    debug!(image = %ctx.id, old_size, new_size, "resizing");

    if new_size < old_size {
        trim::trim_objects(ctx, new_size, old_size, token, progress)?;
    }

    persist_size(ctx, new_size)?;
    {
        let mut snap = ctx.snap.write().unwrap();
        snap.size = new_size;
    }

    resize_object_map(ctx, new_size)?;
    watcher::notify_header_update(ctx);
    progress.update(new_size, new_size);
    Ok(())
}

pub(crate) fn persist_size(ctx: &ImageCtx, new_size: u64) -> Result<()> {
    let _md = ctx.md.write().unwrap();
    match ctx.format {
        ImageFormat::Modern => metadata::set_size(ctx.store.as_ref(), ctx.pool, &ctx.id, new_size),
        ImageFormat::Legacy => {
            let mut header =
                metadata::read_legacy_header(ctx.store.as_ref(), ctx.pool, &ctx.name)?;
            header.image_size = new_size;
            metadata::write_legacy_header(ctx.store.as_ref(), ctx.pool, &ctx.name, &header)
        }
    }
}

fn resize_object_map(ctx: &Arc<ImageCtx>, new_size: u64) -> Result<()> {
    let enabled = {
        let snap = ctx.snap.read().unwrap();
        snap.features.contains(Features::OBJECT_MAP)
    };
    if !enabled {
        return Ok(());
    }
    let new_objects = {
        let snap = ctx.snap.read().unwrap();
        snap.mapper.object_count(new_size)
    };
    let mut guard = ctx.object_map.lock().unwrap();
    if let Some(map) = guard.as_mut() {
        map.resize(new_objects);
        object_map::save(ctx.store.as_ref(), ctx.pool, &ctx.id, SNAP_HEAD, map)?;
    }
    Ok(())
}
