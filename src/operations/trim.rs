//! Removal of data objects past a shrinking tail.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::async_op::{CancelToken, ProgressSink};
use crate::error::Result;
use crate::image::ImageCtx;
use crate::io;
use crate::metadata::data_oid;
use crate::object_map::ObjectState;
use crate::operations::for_each_object;
use crate::types::SNAP_HEAD;

/// Remove every object past the new tail and truncate the boundary
/// object. A remove that finds the object already gone is reported as a
/// warning and the trim is still considered successful.
pub(crate) fn trim_objects(
    ctx: &Arc<ImageCtx>,
    new_size: u64,
    old_size: u64,
    token: &CancelToken,
    progress: &dyn ProgressSink,
) -> Result<()> {
    let (prefix, mapper, snapc, stripe_count) = {
        let snap = ctx.snap.read().unwrap();
        (
            snap.object_prefix.clone(),
            snap.mapper.clone(),
            snap.snapc.clone(),
            snap.stripe_count.max(1),
        )
    };
    let old_objects = mapper.object_count(old_size);
    let new_objects = mapper.object_count(new_size);
    let total = old_objects.saturating_sub(new_objects);
    let done = AtomicU64::new(0);

    for_each_object(
        new_objects..old_objects,
        ctx.config.concurrent_management_ops,
        token,
        |object_no| {
            let oid = data_oid(&prefix, object_no);
            match ctx.store.remove(ctx.pool, &oid, &snapc) {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {
                    warn!(object = %oid, "trim of absent object");
                }
                Err(err) => return Err(err),
            }
            io::set_map_state(ctx, object_no, ObjectState::Nonexistent)?;
            progress.update(done.fetch_add(1, Ordering::Relaxed) + 1, total);
            Ok(())
        },
    )?;

    // Partial boundary object (canonical layout only; striped layouts
    // rely on the clipped size alone).
    if stripe_count == 1 && new_objects > 0 {
        let object_size = mapper.object_size();
        let boundary = new_size % object_size;
        if boundary != 0 {
            let object_no = new_objects - 1;
            let oid = data_oid(&prefix, object_no);
            if ctx.store.stat(ctx.pool, &oid, SNAP_HEAD).is_ok() {
                ctx.store.truncate(ctx.pool, &oid, boundary, &snapc)?;
            }
        }
    }
    progress.update(total, total);
    Ok(())
}
