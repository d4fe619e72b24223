//! Reconciliation of the in-memory mirror with persisted metadata.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::error::{ImageError, Result};
use crate::image::ImageCtx;
use crate::metadata::{self, HEADER_LOCK_NAME};
use crate::object_map;
use crate::striping::Striper;
use crate::types::{
    Features, ImageFlags, ImageFormat, ParentInfo, SnapInfo, SnapSelection, SNAP_HEAD,
};

/// Bound on snapshot-gone restarts before giving up on one refresh.
const MAX_READ_RESTARTS: u32 = 5;

/// Ensure the mirror is current before an operation that depends on
/// metadata: refresh when any notification arrived since the last one.
pub(crate) fn check(ctx: &Arc<ImageCtx>) -> Result<()> {
    let stale = {
        let counters = ctx.refresh.lock().unwrap();
        counters.last_refresh != counters.refresh_seq
    };
    if stale {
        refresh(ctx)?;
    }
    Ok(())
}

/// Run one full refresh. The counter snapshot is taken before persisted
/// state is read, so a notification that lands mid-refresh forces
/// another pass.
pub(crate) fn refresh(ctx: &Arc<ImageCtx>) -> Result<()> {
    let target = ctx.refresh.lock().unwrap().refresh_seq;
    {
        let _owner = ctx.owner.read().unwrap();
        match ctx.format {
            ImageFormat::Modern => refresh_modern(ctx)?,
            ImageFormat::Legacy => refresh_legacy(ctx)?,
        }
    }
    let mut counters = ctx.refresh.lock().unwrap();
    counters.last_refresh = counters.last_refresh.max(target);
    trace!(image = %ctx.id, seq = counters.refresh_seq, "refresh complete");
    Ok(())
}

fn refresh_modern(ctx: &Arc<ImageCtx>) -> Result<()> {
    let mut restarts = 0u32;
    let (header, parent_edge, infos, lockers) = loop {
        let header = metadata::read_header(ctx.store.as_ref(), ctx.pool, &ctx.id)?;

        let missing = header.incompatible & !Features::SUPPORTED.bits();
        if missing != 0 {
            return Err(ImageError::UnsupportedIncompatible { missing });
        }

        let lockers = ctx
            .store
            .list_lockers(ctx.pool, &ctx.header, HEADER_LOCK_NAME)?;

        if !header.snapc.is_valid() {
            return Err(ImageError::Corrupt("invalid snap context".into()));
        }

        let mut infos = Vec::with_capacity(header.snapc.snaps.len());
        let mut gone = false;
        for &snap_id in &header.snapc.snaps {
            match metadata::read_snap(ctx.store.as_ref(), ctx.pool, &ctx.header, snap_id) {
                Ok(rec) => infos.push(SnapInfo {
                    id: snap_id,
                    name: rec.name,
                    size: rec.size,
                    parent: rec.parent,
                    protection: rec.protection,
                    flags: rec.flags,
                }),
                // A snapshot vanished between the snap-context read and
                // here; restart from the top.
                Err(err) if err.is_not_found() => {
                    gone = true;
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        if gone {
            restarts += 1;
            if restarts > MAX_READ_RESTARTS {
                return Err(ImageError::Restart);
            }
            continue;
        }
        let parent_edge = header.parent.clone();
        break (header, parent_edge, infos, lockers);
    };

    let (new_snap_appeared, selection) = {
        let mut snap = ctx.snap.write().unwrap();
        let new_snap_appeared = infos
            .iter()
            .any(|incoming| snap.snap_by_id(incoming.id).is_none());

        if let SnapSelection::Snap(selected) = snap.selection {
            // The caller may be trying to recover; flag, do not fail.
            if !infos.iter().any(|s| s.id == selected) {
                snap.snap_exists = false;
            }
        }

        snap.size = header.size;
        snap.order = header.order;
        snap.features = header.features;
        snap.flags = header.flags;
        snap.object_prefix = header.object_prefix.clone();
        snap.stripe_unit = header.stripe_unit;
        snap.stripe_count = header.stripe_count;
        snap.mapper = Arc::new(Striper::new(
            header.order,
            header.stripe_unit,
            header.stripe_count,
        )?);
        snap.snapc = header.snapc.clone();
        snap.snaps = infos;
        snap.lockers = lockers;
        (new_snap_appeared, snap.selection)
    };

    refresh_parent(ctx, parent_edge)?;
    load_object_map(ctx, selection);

    if new_snap_appeared {
        // Writes still in flight were tagged with the old snap context;
        // make them durable before anything observes the new one.
        crate::io::flush_store(ctx)?;
    }
    Ok(())
}

fn refresh_legacy(ctx: &Arc<ImageCtx>) -> Result<()> {
    let header = metadata::read_legacy_header(ctx.store.as_ref(), ctx.pool, &ctx.name)?;
    // Snapshot list is a separate read on the legacy path.
    let snaps = legacy_snap_list(ctx)?;
    let mut snap = ctx.snap.write().unwrap();
    snap.size = header.image_size;
    snap.order = header.order;
    snap.features = Features::empty();
    snap.flags = ImageFlags::empty();
    snap.object_prefix = format!("{}.", header.block_name);
    snap.stripe_unit = 0;
    snap.stripe_count = 0;
    snap.mapper = Arc::new(Striper::new(header.order, 0, 0)?);
    snap.snapc.seq = header.snap_seq;
    snap.snapc.snaps = snaps.iter().map(|s| s.id).collect();
    if let SnapSelection::Snap(selected) = snap.selection {
        if !snaps.iter().any(|s| s.id == selected) {
            snap.snap_exists = false;
        }
    }
    snap.snaps = snaps;
    snap.lockers = Vec::new();
    Ok(())
}

fn legacy_snap_list(ctx: &ImageCtx) -> Result<Vec<SnapInfo>> {
    let raw = ctx
        .store
        .omap_list(ctx.pool, &ctx.header, "snapshot_")?;
    let mut snaps = Vec::with_capacity(raw.len());
    for (key, _) in raw {
        let id = u64::from_str_radix(&key["snapshot_".len()..], 16)
            .map_err(|_| ImageError::Corrupt("bad legacy snapshot key".into()))?;
        let rec = metadata::read_snap(ctx.store.as_ref(), ctx.pool, &ctx.header, id)?;
        snaps.push(SnapInfo {
            id,
            name: rec.name,
            size: rec.size,
            parent: None,
            protection: crate::types::ProtectionStatus::Unprotected,
            flags: ImageFlags::empty(),
        });
    }
    snaps.sort_by(|a, b| b.id.cmp(&a.id));
    Ok(snaps)
}

/// Reconcile the parent edge: close the old parent when the edge
/// changed, open the new one when an edge exists and none is open.
/// Parents open read-only and refresh recursively.
pub(crate) fn refresh_parent(ctx: &Arc<ImageCtx>, edge: Option<ParentInfo>) -> Result<()> {
    let effective = edge.filter(|e| e.overlap > 0);
    let to_open = {
        let mut parent = ctx.parent.write().unwrap();
        let changed = match (&parent.info, &effective) {
            (Some(old), Some(new)) => old.spec != new.spec,
            (None, None) => false,
            _ => true,
        };
        if changed {
            if let Some(old_image) = parent.image.take() {
                debug!(image = %ctx.id, "parent edge changed, closing parent");
                if let Err(err) = old_image.close() {
                    warn!(error = %err, "closing replaced parent failed");
                }
            }
        }
        parent.info = effective.clone();
        match &effective {
            Some(info) if parent.image.is_none() => Some(info.clone()),
            _ => None,
        }
    };

    if let Some(info) = to_open {
        let parent_image = ImageCtx::open_by_id(
            ctx.store.clone(),
            info.spec.pool,
            &info.spec.image_id,
            true,
            ctx.config.clone(),
        )?;
        parent_image.set_snap_selection_by_id(info.spec.snap_id)?;
        let mut parent = ctx.parent.write().unwrap();
        // The edge may have moved again while the parent was opening.
        if parent.info.as_ref().map(|i| &i.spec) == Some(&info.spec) {
            parent.image = Some(parent_image);
        } else if let Err(err) = parent_image.close() {
            warn!(error = %err, "closing raced parent failed");
        }
    }
    Ok(())
}

/// Load the object map of the selected revision into memory.
pub(crate) fn load_object_map(ctx: &Arc<ImageCtx>, selection: SnapSelection) {
    let enabled = ctx
        .snap
        .read()
        .unwrap()
        .features
        .contains(Features::OBJECT_MAP);
    let mut map = ctx.object_map.lock().unwrap();
    if !enabled {
        *map = None;
        return;
    }
    let snap_id = match selection {
        SnapSelection::Head => SNAP_HEAD,
        SnapSelection::Snap(id) => id,
    };
    match object_map::load(ctx.store.as_ref(), ctx.pool, &ctx.id, snap_id) {
        Ok(loaded) => *map = Some(loaded),
        Err(err) => {
            warn!(image = %ctx.id, error = %err, "object map unavailable");
            *map = None;
        }
    }
}
