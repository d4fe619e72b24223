//! I/O front-end: clipping, extent mapping, gating and submission.

use bytes::Bytes;
use std::sync::Arc;

use tracing::{trace, warn};

use crate::error::{ImageError, Result};
use crate::exclusive_lock::{self, LockState};
use crate::image::{refresh, ImageCtx, SnapState};
use crate::metadata::data_oid;
use crate::object_map::{self, ObjectState};
use crate::types::{Features, SnapContext, SnapId, SNAP_HEAD};

/// Optional write-back object cache. The cache owns its own store handle
/// and write-back policy; the front-end only routes requests and drives
/// flush/invalidate.
pub trait ObjectCacher: Send + Sync {
    /// Serve a read from the cache; `None` means miss (caller falls
    /// through to the store).
    fn read(&self, oid: &str, snap: SnapId, off: u64, len: u64) -> Result<Option<Bytes>>;
    /// Absorb a write; the cache is responsible for eventual write-back.
    fn write(&self, oid: &str, off: u64, data: &[u8], snapc: &SnapContext) -> Result<()>;
    fn discard(&self, oid: &str, off: u64, len: u64) -> Result<()>;
    /// Write every dirty entry back to the store.
    fn flush(&self) -> Result<()>;
    /// Drop all cached state without write-back.
    fn invalidate(&self) -> Result<()>;
}

/// Clip an I/O against the selected view: past-the-end start is an
/// error, a spanning length is truncated, zero length is a no-op.
fn clip_io(snap: &SnapState, off: u64, len: u64) -> Result<u64> {
    let size = snap.current_size();
    if off > size || (off == size && len > 0) {
        return Err(ImageError::Invalid(format!(
            "offset {off} past end of image ({size})"
        )));
    }
    Ok(len.min(size - off))
}

fn writable(ctx: &ImageCtx, snap: &SnapState) -> Result<()> {
    if ctx.read_only || !snap.selection.is_head() {
        return Err(ImageError::ReadOnly);
    }
    Ok(())
}

/// Read `len` bytes at `off` from the selected view. Holes, unallocated
/// objects and the tail beyond the parent overlap read as zero.
pub(crate) fn read(ctx: &Arc<ImageCtx>, off: u64, len: u64) -> Result<Bytes> {
    refresh::check(ctx)?;
    let _owner = ctx.owner.read().unwrap();
    read_locked(ctx, off, len)
}

fn read_locked(ctx: &Arc<ImageCtx>, off: u64, len: u64) -> Result<Bytes> {
    let (clipped, extents, read_snap, prefix, snap_overlap) = {
        let snap = ctx.snap.read().unwrap();
        if !snap.snap_exists {
            return Err(ImageError::NotFound("selected snapshot was removed".into()));
        }
        let clipped = clip_io(&snap, off, len)?;
        let extents = snap.mapper.map_extents(off, clipped);
        // For a snapshot selection the overlap recorded at snap-create
        // time governs parent read-through; the head overlap lives under
        // the parent lock.
        let snap_overlap = match snap.selection {
            crate::types::SnapSelection::Head => None,
            crate::types::SnapSelection::Snap(id) => Some(
                snap.snap_by_id(id)
                    .and_then(|s| s.parent.as_ref())
                    .map(|p| p.overlap)
                    .unwrap_or(0),
            ),
        };
        (clipped, extents, snap.read_snap(), snap.object_prefix.clone(), snap_overlap)
    };
    if clipped == 0 {
        return Ok(Bytes::new());
    }

    let parent = {
        let pstate = ctx.parent.read().unwrap();
        let overlap = match snap_overlap {
            Some(overlap) => overlap,
            None => pstate.info.as_ref().map(|i| i.overlap).unwrap_or(0),
        };
        pstate
            .image
            .clone()
            .filter(|_| overlap > 0)
            .map(|image| (image, overlap))
    };
    let cache = ctx.cache.lock().unwrap().clone();

    let mut buf = vec![0u8; clipped as usize];
    for ext in &extents {
        let oid = data_oid(&prefix, ext.object_no);
        let dst_range = ext.buffer_offset as usize..(ext.buffer_offset + ext.length) as usize;
        let dst = &mut buf[dst_range];

        let skip_store = {
            let map = ctx.object_map.lock().unwrap();
            matches!(
                &*map,
                Some(m) if ext.object_no < m.len() && !m.get(ext.object_no).may_exist()
            )
        };

        if !skip_store {
            if let Some(cache) = &cache {
                if let Some(hit) = cache.read(&oid, read_snap, ext.offset, ext.length)? {
                    dst[..hit.len()].copy_from_slice(&hit);
                    continue;
                }
            }
        }

        let from_store = if skip_store {
            None
        } else {
            match ctx.store.read(ctx.pool, &oid, read_snap, ext.offset, ext.length) {
                Ok(bytes) => Some(bytes),
                Err(err) if err.is_not_found() => None,
                Err(err) => return Err(err),
            }
        };
        match from_store {
            // Short reads leave the sparse tail zeroed.
            Some(bytes) => dst[..bytes.len()].copy_from_slice(&bytes),
            None => {
                // Unallocated object: recurse into the parent for the
                // part under the overlap, zero beyond it.
                if let Some((parent_image, overlap)) = &parent {
                    let image_off = off + ext.buffer_offset;
                    if image_off < *overlap {
                        let parent_len = ext.length.min(overlap - image_off);
                        let parent_data = read(parent_image, image_off, parent_len)?;
                        dst[..parent_data.len()].copy_from_slice(&parent_data);
                    }
                }
            }
        }
    }
    trace!(image = %ctx.id, off, len = clipped, "read");
    Ok(Bytes::from(buf))
}

/// Write `data` at `off`. When the exclusive-lock feature is on and this
/// client is not the owner, the request suspends until ownership is
/// acquired; this is the only suspension point on the data path.
pub(crate) fn write(ctx: &Arc<ImageCtx>, off: u64, data: &[u8]) -> Result<()> {
    refresh::check(ctx)?;
    loop {
        let owner = ctx.owner.read().unwrap();
        let must_wait = {
            let snap = ctx.snap.read().unwrap();
            writable(ctx, &snap)?;
            snap.features.contains(Features::EXCLUSIVE_LOCK) && owner.state != LockState::Locked
        };
        if must_wait {
            drop(owner);
            exclusive_lock::wait_for_ownership(ctx)?;
            continue;
        }
        let _md = ctx.md.read().unwrap();
        return write_locked(ctx, off, data);
    }
}

/// Open parent handle and head overlap, when the image is a clone with
/// data still shared.
fn head_parent(ctx: &ImageCtx) -> Option<(Arc<ImageCtx>, u64)> {
    let pstate = ctx.parent.read().unwrap();
    let overlap = pstate.info.as_ref().map(|i| i.overlap).unwrap_or(0);
    pstate
        .image
        .clone()
        .filter(|_| overlap > 0)
        .map(|image| (image, overlap))
}

/// Seed a still-shared object from the parent before the first write to
/// it, so the rest of the object keeps reading the parent's bytes. Only
/// the canonical layout maps an object back to one image range.
fn copy_up(
    ctx: &Arc<ImageCtx>,
    oid: &str,
    object_no: u64,
    object_size: u64,
    snapc: &SnapContext,
    parent: &Option<(Arc<ImageCtx>, u64)>,
) -> Result<()> {
    let Some((parent_image, overlap)) = parent else {
        return Ok(());
    };
    let image_off = object_no * object_size;
    if image_off >= *overlap || ctx.store.stat(ctx.pool, oid, SNAP_HEAD).is_ok() {
        return Ok(());
    }
    let len = object_size.min(overlap - image_off);
    let data = read(parent_image, image_off, len)?;
    if data.iter().any(|b| *b != 0) {
        ctx.store.write_full(ctx.pool, oid, &data, snapc)?;
    }
    Ok(())
}

fn write_locked(ctx: &Arc<ImageCtx>, off: u64, data: &[u8]) -> Result<()> {
    let (clipped, extents, snapc, prefix, map_enabled, object_size, canonical) = {
        let snap = ctx.snap.read().unwrap();
        let clipped = clip_io(&snap, off, data.len() as u64)?;
        let extents = snap.mapper.map_extents(off, clipped);
        (
            clipped,
            extents,
            snap.snapc.clone(),
            snap.object_prefix.clone(),
            snap.features.contains(Features::OBJECT_MAP),
            snap.mapper.object_size(),
            snap.stripe_count <= 1,
        )
    };
    if clipped == 0 {
        return Ok(());
    }
    let parent = if canonical { head_parent(ctx) } else { None };

    if map_enabled {
        // Pessimistic pre-update: flip to EXISTS before touching data so
        // a crash can only leave the map claiming too much, never too
        // little.
        let mut guard = ctx.object_map.lock().unwrap();
        if let Some(map) = guard.as_mut() {
            let mut dirty = false;
            for ext in &extents {
                if ext.object_no < map.len() && map.get(ext.object_no) != ObjectState::Exists {
                    map.set(ext.object_no, ObjectState::Exists);
                    dirty = true;
                }
            }
            if dirty {
                object_map::save(ctx.store.as_ref(), ctx.pool, &ctx.id, SNAP_HEAD, map)?;
            }
        }
    }

    let cache = ctx.cache.lock().unwrap().clone();
    for ext in &extents {
        let oid = data_oid(&prefix, ext.object_no);
        copy_up(ctx, &oid, ext.object_no, object_size, &snapc, &parent)?;
        let chunk = &data[ext.buffer_offset as usize..(ext.buffer_offset + ext.length) as usize];
        match &cache {
            Some(cache) => cache.write(&oid, ext.offset, chunk, &snapc)?,
            None => ctx.store.write(ctx.pool, &oid, ext.offset, chunk, &snapc)?,
        }
    }
    trace!(image = %ctx.id, off, len = clipped, "write");
    Ok(())
}

/// Discard `[off, off+len)`: whole objects are removed, object suffixes
/// truncated, interior ranges zero-filled unless partial discards are
/// configured off.
pub(crate) fn discard(ctx: &Arc<ImageCtx>, off: u64, len: u64) -> Result<()> {
    refresh::check(ctx)?;
    loop {
        let owner = ctx.owner.read().unwrap();
        let must_wait = {
            let snap = ctx.snap.read().unwrap();
            writable(ctx, &snap)?;
            snap.features.contains(Features::EXCLUSIVE_LOCK) && owner.state != LockState::Locked
        };
        if must_wait {
            drop(owner);
            exclusive_lock::wait_for_ownership(ctx)?;
            continue;
        }
        let _md = ctx.md.read().unwrap();
        return discard_locked(ctx, off, len);
    }
}

fn discard_locked(ctx: &Arc<ImageCtx>, off: u64, len: u64) -> Result<()> {
    let (extents, snapc, prefix, object_size, map_enabled, canonical) = {
        let snap = ctx.snap.read().unwrap();
        let clipped = clip_io(&snap, off, len)?;
        let extents = snap.mapper.map_extents(off, clipped);
        (
            extents,
            snap.snapc.clone(),
            snap.object_prefix.clone(),
            snap.mapper.object_size(),
            snap.features.contains(Features::OBJECT_MAP),
            snap.stripe_count <= 1,
        )
    };
    let cache = ctx.cache.lock().unwrap().clone();
    let parent = if canonical { head_parent(ctx) } else { None };

    for ext in &extents {
        let oid = data_oid(&prefix, ext.object_no);
        if let Some(cache) = &cache {
            cache.discard(&oid, ext.offset, ext.length)?;
        }
        let shared = parent
            .as_ref()
            .map(|(_, overlap)| ext.object_no * object_size < *overlap)
            .unwrap_or(false);
        let whole_object = ext.offset == 0 && ext.length == object_size;
        if whole_object && shared {
            // Removing the object would expose the parent again; an
            // empty object keeps the range reading zero.
            ctx.store.truncate(ctx.pool, &oid, 0, &snapc)?;
            continue;
        }
        if whole_object {
            if map_enabled {
                set_map_state(ctx, ext.object_no, ObjectState::Pending)?;
            }
            match ctx.store.remove(ctx.pool, &oid, &snapc) {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {
                    warn!(object = %oid, "discard of absent object");
                }
                Err(err) => return Err(err),
            }
            if map_enabled {
                set_map_state(ctx, ext.object_no, ObjectState::Nonexistent)?;
            }
            continue;
        }
        if ctx.store.stat(ctx.pool, &oid, SNAP_HEAD).is_err() {
            // A shared object must be seeded first or the punched range
            // would keep reading the parent's bytes.
            if shared {
                copy_up(ctx, &oid, ext.object_no, object_size, &snapc, &parent)?;
            }
            // Nothing allocated, nothing to discard.
            if ctx.store.stat(ctx.pool, &oid, SNAP_HEAD).is_err() {
                continue;
            }
        }
        if ext.offset + ext.length == object_size {
            ctx.store.truncate(ctx.pool, &oid, ext.offset, &snapc)?;
        } else if !ctx.config.skip_partial_discard {
            ctx.store.zero(ctx.pool, &oid, ext.offset, ext.length, &snapc)?;
        }
    }
    Ok(())
}

pub(crate) fn set_map_state(ctx: &ImageCtx, object_no: u64, state: ObjectState) -> Result<()> {
    let mut guard = ctx.object_map.lock().unwrap();
    if let Some(map) = guard.as_mut() {
        if object_no < map.len() && map.get(object_no) != state {
            map.set(object_no, state);
            object_map::save(ctx.store.as_ref(), ctx.pool, &ctx.id, SNAP_HEAD, map)?;
        }
    }
    Ok(())
}

/// Drain locally queued async operations, then make every submitted
/// write durable. Writes submitted before this call complete before it
/// returns.
pub(crate) fn flush(ctx: &Arc<ImageCtx>) -> Result<()> {
    refresh::check(ctx)?;
    ctx.ops.flush();
    flush_store(ctx)
}

/// Cache write-back plus store flush, without draining async ops.
pub(crate) fn flush_store(ctx: &ImageCtx) -> Result<()> {
    let cache = ctx.cache.lock().unwrap().clone();
    if let Some(cache) = cache {
        cache.flush()?;
    }
    ctx.store.flush(ctx.pool)
}
