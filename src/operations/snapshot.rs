//! Snapshot lifecycle: create, remove, protect, unprotect, rollback.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::async_op::{invoke_async_request, CancelToken, ProgressSink};
use crate::error::{ImageError, Result};
use crate::image::{refresh, ImageCtx, SnapState};
use crate::io;
use crate::metadata::{self, data_oid, HEADER_LOCK_NAME};
use crate::object_map;
use crate::operations::{for_each_object, resize};
use crate::types::{
    Features, ImageFlags, ImageFormat, ParentSpec, ProtectionStatus, SnapContext, SnapId, SnapInfo,
};
use crate::watcher::{self, RemoteOp};

pub fn snap_create(ctx: &Arc<ImageCtx>, name: &str) -> Result<()> {
    let name = name.to_string();
    invoke_async_request(
        ctx,
        RemoteOp::SnapCreate { name: name.clone() },
        false,
        Arc::new(crate::async_op::NoProgress),
        move |ctx, _token, _progress| create_local(ctx, &name),
    )
}

pub fn snap_remove(ctx: &Arc<ImageCtx>, name: &str) -> Result<()> {
    let fast_diff = ctx
        .snap
        .read()
        .unwrap()
        .features
        .contains(Features::FAST_DIFF);
    if fast_diff {
        // Object-map bookkeeping must be linearized through the owner.
        let name = name.to_string();
        invoke_async_request(
            ctx,
            RemoteOp::SnapRemove { name: name.clone() },
            false,
            Arc::new(crate::async_op::NoProgress),
            move |ctx, _token, _progress| remove_local(ctx, &name),
        )
    } else {
        refresh::check(ctx)?;
        if ctx.read_only {
            return Err(ImageError::ReadOnly);
        }
        let _owner = ctx.owner.read().unwrap();
        remove_local(ctx, name)
    }
}

pub fn snap_rollback(
    ctx: &Arc<ImageCtx>,
    name: &str,
    progress: Arc<dyn ProgressSink>,
) -> Result<()> {
    let name = name.to_string();
    invoke_async_request(
        ctx,
        RemoteOp::SnapRollback { name: name.clone() },
        false,
        progress,
        move |ctx, token, progress| rollback_local(ctx, &name, token, progress),
    )
}

pub fn snap_protect(ctx: &Arc<ImageCtx>, name: &str) -> Result<()> {
    refresh::check(ctx)?;
    if ctx.read_only {
        return Err(ImageError::ReadOnly);
    }
    let _owner = ctx.owner.read().unwrap();
    protect_local(ctx, name)
}

pub fn snap_unprotect(ctx: &Arc<ImageCtx>, name: &str) -> Result<()> {
    refresh::check(ctx)?;
    if ctx.read_only {
        return Err(ImageError::ReadOnly);
    }
    let _owner = ctx.owner.read().unwrap();
    unprotect_local(ctx, name)
}

pub fn snap_list(ctx: &Arc<ImageCtx>) -> Result<Vec<SnapInfo>> {
    refresh::check(ctx)?;
    Ok(ctx.snap.read().unwrap().snaps.clone())
}

pub fn snap_is_protected(ctx: &Arc<ImageCtx>, name: &str) -> Result<bool> {
    refresh::check(ctx)?;
    let snap = ctx.snap.read().unwrap();
    snap.snap_by_name(name)
        .map(|s| s.protection == ProtectionStatus::Protected)
        .ok_or_else(|| ImageError::NotFound(format!("snapshot {name}")))
}

/// Allocate a snapshot id and register it on the header. The md lock is
/// write-held across the flush and the registration so every write
/// submitted before this point is attributed to the old snap context.
pub(crate) fn create_local(ctx: &Arc<ImageCtx>, name: &str) -> Result<()> {
    let md = ctx.md.write().unwrap();
    io::flush_store(ctx)?;

    let (head_size, old_snapc, features) = {
        let snap = ctx.snap.read().unwrap();
        if snap.snap_by_name(name).is_some() {
            return Err(ImageError::AlreadyExists(format!("snapshot {name}")));
        }
        (snap.size, snap.snapc.clone(), snap.features)
    };
    let parent = ctx.parent.read().unwrap().info.clone();

    let snap_id = ctx.store.allocate_snap_id(ctx.pool)?;
    if features.contains(Features::EXCLUSIVE_LOCK) {
        debug_assert!(
            ctx.store
                .list_lockers(ctx.pool, &ctx.header, HEADER_LOCK_NAME)
                .map(|lockers| lockers.iter().any(|l| l.client == ctx.client))
                .unwrap_or(true),
            "snapshot registered without holding the header lock"
        );
    }

    let mut snaps = old_snapc.snaps.clone();
    snaps.insert(0, snap_id);
    let new_snapc = SnapContext { seq: snap_id, snaps };
    let record = metadata::SnapRecord {
        name: name.to_string(),
        size: head_size,
        parent: parent.clone(),
        protection: ProtectionStatus::Unprotected,
        flags: ImageFlags::empty(),
    };
    metadata::add_snap(
        ctx.store.as_ref(),
        ctx.pool,
        &ctx.header,
        snap_id,
        &record,
        &new_snapc,
    )?;
    if ctx.format == ImageFormat::Legacy {
        bump_legacy_snap_counts(ctx, new_snapc.seq, new_snapc.snaps.len() as u32, name.len() as i64)?;
    }

    // Snapshot the object map alongside the data.
    if features.contains(Features::OBJECT_MAP) {
        let guard = ctx.object_map.lock().unwrap();
        if let Some(map) = guard.as_ref() {
            object_map::save(ctx.store.as_ref(), ctx.pool, &ctx.id, snap_id, map)?;
        }
    }

    // This client is the owner (or the feature is off), so the new snap
    // context becomes the write context immediately; peers pick it up on
    // their next refresh.
    {
        let mut snap = ctx.snap.write().unwrap();
        snap.snapc = new_snapc;
        snap.snaps.insert(
            0,
            SnapInfo {
                id: snap_id,
                name: name.to_string(),
                size: head_size,
                parent,
                protection: ProtectionStatus::Unprotected,
                flags: ImageFlags::empty(),
            },
        );
    }
    drop(md);
    debug!(image = %ctx.id, snap = %name, id = snap_id, "snapshot created");
    watcher::notify_header_update(ctx);
    Ok(())
}

/// Does any revision other than `exclude` still reference `spec`?
fn scan_for_parents(snap: &SnapState, spec: &ParentSpec, exclude: SnapId) -> bool {
    snap.snaps
        .iter()
        .any(|s| s.id != exclude && s.parent.as_ref().map(|p| &p.spec) == Some(spec))
}

pub(crate) fn remove_local(ctx: &Arc<ImageCtx>, name: &str) -> Result<()> {
    let (info, features, new_snapc, still_referenced) = {
        let snap = ctx.snap.read().unwrap();
        let info = snap
            .snap_by_name(name)
            .cloned()
            .ok_or_else(|| ImageError::NotFound(format!("snapshot {name}")))?;
        if info.protection != ProtectionStatus::Unprotected {
            return Err(ImageError::Busy(format!("snapshot {name} is protected")));
        }
        let mut snaps = snap.snapc.snaps.clone();
        snaps.retain(|id| *id != info.id);
        let new_snapc = SnapContext {
            seq: snap.snapc.seq,
            snaps,
        };
        let still_referenced = info
            .parent
            .as_ref()
            .map(|p| scan_for_parents(&snap, &p.spec, info.id))
            .unwrap_or(false);
        (info, snap.features, new_snapc, still_referenced)
    };

    if features.contains(Features::OBJECT_MAP) {
        match object_map::remove(ctx.store.as_ref(), ctx.pool, &ctx.id, info.id) {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
    }

    // Deregister this image from the parent's children when the removed
    // snapshot held the image's last reference to that parent.
    if let Some(parent) = &info.parent {
        let head_still_references = {
            let pstate = ctx.parent.read().unwrap();
            pstate.info.as_ref().map(|i| &i.spec) == Some(&parent.spec)
        };
        if !still_referenced && !head_still_references {
            let children_pool = ctx.store.base_tier(ctx.pool)?;
            match metadata::remove_child(
                ctx.store.as_ref(),
                children_pool,
                &parent.spec,
                ctx.pool,
                &ctx.id,
            ) {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
    }

    {
        let md = ctx.md.write().unwrap();
        metadata::remove_snap(ctx.store.as_ref(), ctx.pool, &ctx.header, info.id, &new_snapc)?;
        if ctx.format == ImageFormat::Legacy {
            bump_legacy_snap_counts(
                ctx,
                new_snapc.seq,
                new_snapc.snaps.len() as u32,
                -(name.len() as i64),
            )?;
        }
        drop(md);
    }
    {
        let mut snap = ctx.snap.write().unwrap();
        snap.snaps.retain(|s| s.id != info.id);
        snap.snapc = new_snapc;
        if let crate::types::SnapSelection::Snap(selected) = snap.selection {
            if selected == info.id {
                snap.snap_exists = false;
            }
        }
    }

    // Only after full deregistration is the store id given back.
    match ctx.store.release_snap_id(ctx.pool, info.id) {
        Ok(()) => {}
        Err(err) if err.is_not_found() => {
            warn!(snap = %name, "snap id already released");
        }
        Err(err) => return Err(err),
    }
    debug!(image = %ctx.id, snap = %name, "snapshot removed");
    watcher::notify_header_update(ctx);
    Ok(())
}

/// Restore head data to the named snapshot's content. The snapshot
/// itself is left intact.
pub(crate) fn rollback_local(
    ctx: &Arc<ImageCtx>,
    name: &str,
    token: &CancelToken,
    progress: &dyn ProgressSink,
) -> Result<()> {
    let (snap_id, snap_size) = {
        let snap = ctx.snap.read().unwrap();
        let info = snap
            .snap_by_name(name)
            .ok_or_else(|| ImageError::NotFound(format!("snapshot {name}")))?;
        (info.id, info.size)
    };

    // In-flight writes may carry provenance of their own; everything
    // dirty goes out and the cache is dropped before objects move.
    io::flush_store(ctx)?;
    ctx.invalidate_cache()?;

    resize::execute(ctx, snap_size, token, progress)?;

    let (prefix, mapper, snapc) = {
        let snap = ctx.snap.read().unwrap();
        (
            snap.object_prefix.clone(),
            snap.mapper.clone(),
            snap.snapc.clone(),
        )
    };
    let count = mapper.object_count(snap_size);
    let done = AtomicU64::new(0);
    for_each_object(0..count, ctx.config.concurrent_management_ops, token, |object_no| {
        let oid = data_oid(&prefix, object_no);
        match ctx.store.rollback_object(ctx.pool, &oid, snap_id, &snapc) {
            Ok(()) => {}
            // Object never existed on either revision.
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
        progress.update(done.fetch_add(1, Ordering::Relaxed) + 1, count);
        Ok(())
    })?;

    rollback_object_map(ctx, snap_id)?;
    debug!(image = %ctx.id, snap = %name, "rolled back");
    watcher::notify_header_update(ctx);
    Ok(())
}

fn rollback_object_map(ctx: &Arc<ImageCtx>, snap_id: SnapId) -> Result<()> {
    let enabled = {
        let snap = ctx.snap.read().unwrap();
        snap.features.contains(Features::OBJECT_MAP)
    };
    if !enabled {
        return Ok(());
    }
    match object_map::load(ctx.store.as_ref(), ctx.pool, &ctx.id, snap_id) {
        Ok(map) => {
            object_map::save(
                ctx.store.as_ref(),
                ctx.pool,
                &ctx.id,
                crate::types::SNAP_HEAD,
                &map,
            )?;
            *ctx.object_map.lock().unwrap() = Some(map);
        }
        Err(err) => {
            warn!(error = %err, "snapshot object map unavailable after rollback");
        }
    }
    Ok(())
}

pub(crate) fn protect_local(ctx: &Arc<ImageCtx>, name: &str) -> Result<()> {
    let snap_id = require_layering_snap(ctx, name)?;
    {
        let _md = ctx.md.write().unwrap();
        let mut record = metadata::read_snap(ctx.store.as_ref(), ctx.pool, &ctx.header, snap_id)?;
        if record.protection != ProtectionStatus::Unprotected {
            return Err(ImageError::Busy(format!("snapshot {name} is already protected")));
        }
        record.protection = ProtectionStatus::Protected;
        metadata::write_snap(ctx.store.as_ref(), ctx.pool, &ctx.header, snap_id, &record)?;
    }
    set_cached_protection(ctx, snap_id, ProtectionStatus::Protected);
    watcher::notify_header_update(ctx);
    Ok(())
}

/// UNPROTECTED is reachable only through UNPROTECTING, and only when no
/// pool's children set references the snapshot. Cache tiers are skipped:
/// a pool whose base tier is another pool holds no authoritative
/// children entries.
pub(crate) fn unprotect_local(ctx: &Arc<ImageCtx>, name: &str) -> Result<()> {
    let snap_id = require_layering_snap(ctx, name)?;
    {
        let _md = ctx.md.write().unwrap();
        let mut record = metadata::read_snap(ctx.store.as_ref(), ctx.pool, &ctx.header, snap_id)?;
        match record.protection {
            ProtectionStatus::Protected => {}
            ProtectionStatus::Unprotected => {
                return Err(ImageError::Invalid(format!("snapshot {name} is not protected")))
            }
            ProtectionStatus::Unprotecting => {
                return Err(ImageError::Busy(format!("snapshot {name} is mid-unprotect")))
            }
        }
        record.protection = ProtectionStatus::Unprotecting;
        metadata::write_snap(ctx.store.as_ref(), ctx.pool, &ctx.header, snap_id, &record)?;
    }
    set_cached_protection(ctx, snap_id, ProtectionStatus::Unprotecting);
    watcher::notify_header_update(ctx);

    ctx.store.wait_for_latest_map()?;
    let spec = ParentSpec {
        pool: ctx.pool,
        image_id: ctx.id.clone(),
        snap_id,
    };
    let mut children = 0usize;
    for (pool, _) in ctx.store.pool_list()? {
        if ctx.store.base_tier(pool)? != pool {
            continue;
        }
        children += metadata::list_children(ctx.store.as_ref(), pool, &spec)?.len();
        if children > 0 {
            break;
        }
    }

    let final_state = if children > 0 {
        ProtectionStatus::Protected
    } else {
        ProtectionStatus::Unprotected
    };
    {
        let _md = ctx.md.write().unwrap();
        let mut record = metadata::read_snap(ctx.store.as_ref(), ctx.pool, &ctx.header, snap_id)?;
        record.protection = final_state;
        metadata::write_snap(ctx.store.as_ref(), ctx.pool, &ctx.header, snap_id, &record)?;
    }
    set_cached_protection(ctx, snap_id, final_state);
    watcher::notify_header_update(ctx);

    if children > 0 {
        return Err(ImageError::Busy(format!("snapshot {name} has children")));
    }
    debug!(image = %ctx.id, snap = %name, "unprotected");
    Ok(())
}

fn require_layering_snap(ctx: &Arc<ImageCtx>, name: &str) -> Result<SnapId> {
    let snap = ctx.snap.read().unwrap();
    if !snap.features.contains(Features::LAYERING) {
        return Err(ImageError::Unsupported("layering is not enabled".into()));
    }
    snap.snap_by_name(name)
        .map(|s| s.id)
        .ok_or_else(|| ImageError::NotFound(format!("snapshot {name}")))
}

fn set_cached_protection(ctx: &Arc<ImageCtx>, snap_id: SnapId, protection: ProtectionStatus) {
    let mut snap = ctx.snap.write().unwrap();
    if let Some(info) = snap.snaps.iter_mut().find(|s| s.id == snap_id) {
        info.protection = protection;
    }
}

fn bump_legacy_snap_counts(
    ctx: &ImageCtx,
    snap_seq: SnapId,
    snap_count: u32,
    names_delta: i64,
) -> Result<()> {
    let mut header = metadata::read_legacy_header(ctx.store.as_ref(), ctx.pool, &ctx.name)?;
    header.snap_seq = snap_seq;
    header.snap_count = snap_count;
    header.snap_names_len = header.snap_names_len.saturating_add_signed(names_delta);
    metadata::write_legacy_header(ctx.store.as_ref(), ctx.pool, &ctx.name, &header)
}
