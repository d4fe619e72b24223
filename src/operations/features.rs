//! Toggling the mutable feature bits after creation.

use std::sync::Arc;

use tracing::debug;

use crate::error::{ImageError, Result};
use crate::exclusive_lock;
use crate::image::{refresh, ImageCtx};
use crate::metadata;
use crate::object_map::{self, ObjectMap};
use crate::types::{Features, ImageFlags, ImageFormat, SNAP_HEAD};
use crate::watcher;

/// Enable or disable a subset of [`Features::MUTABLE`], enforcing the
/// implication chain in both directions.
pub fn update_features(ctx: &Arc<ImageCtx>, features: Features, enable: bool) -> Result<()> {
    refresh::check(ctx)?;
    if ctx.read_only {
        return Err(ImageError::ReadOnly);
    }
    if ctx.format == ImageFormat::Legacy {
        return Err(ImageError::Unsupported(
            "legacy images have no feature bits".into(),
        ));
    }
    if features.is_empty() || features.intersects(!Features::MUTABLE) {
        return Err(ImageError::Invalid(
            "only exclusive-lock, object-map and fast-diff can be toggled".into(),
        ));
    }

    let current = ctx.snap.read().unwrap().features;
    let updated = if enable {
        current | features
    } else {
        current & !features
    };
    if updated == current {
        return Err(ImageError::Invalid(if enable {
            "feature is already enabled".into()
        } else {
            "feature is already disabled".into()
        }));
    }
    updated
        .validate()
        .map_err(|msg| ImageError::Invalid(msg.into()))?;

    // Losing the lock feature means giving the lock up first.
    if !enable && features.contains(Features::EXCLUSIVE_LOCK) {
        exclusive_lock::release(ctx)?;
    }

    let mut flags = ctx.snap.read().unwrap().flags;
    if enable && features.intersects(Features::OBJECT_MAP | Features::FAST_DIFF) {
        if features.contains(Features::OBJECT_MAP) {
            // A fresh map is invalid until rebuilt.
            let count = {
                let snap = ctx.snap.read().unwrap();
                snap.mapper.object_count(snap.size)
            };
            object_map::save(
                ctx.store.as_ref(),
                ctx.pool,
                &ctx.id,
                SNAP_HEAD,
                &ObjectMap::new(count),
            )?;
            flags |= ImageFlags::OBJECT_MAP_INVALID;
        }
        if features.contains(Features::FAST_DIFF) {
            flags |= ImageFlags::FAST_DIFF_INVALID;
        }
    }
    if !enable && features.contains(Features::OBJECT_MAP) {
        let snap_ids: Vec<_> = {
            let snap = ctx.snap.read().unwrap();
            snap.snaps.iter().map(|s| s.id).collect()
        };
        for snap_id in snap_ids.into_iter().chain([SNAP_HEAD]) {
            match object_map::remove(ctx.store.as_ref(), ctx.pool, &ctx.id, snap_id) {
                Ok(()) | Err(ImageError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        flags.remove(ImageFlags::OBJECT_MAP_INVALID | ImageFlags::FAST_DIFF_INVALID);
    }
    if !enable && features.contains(Features::FAST_DIFF) {
        flags.remove(ImageFlags::FAST_DIFF_INVALID);
    }

    {
        let _md = ctx.md.write().unwrap();
        metadata::set_features(ctx.store.as_ref(), ctx.pool, &ctx.id, updated)?;
        metadata::set_flags(ctx.store.as_ref(), ctx.pool, &ctx.id, flags)?;
    }
    let selection = {
        let mut snap = ctx.snap.write().unwrap();
        snap.features = updated;
        snap.flags = flags;
        snap.selection
    };
    refresh::load_object_map(ctx, selection);
    debug!(image = %ctx.id, ?features, enable, "features updated");
    watcher::notify_header_update(ctx);
    Ok(())
}
