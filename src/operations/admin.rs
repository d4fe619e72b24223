//! Image lifecycle: create, remove, rename, list, copy.

use bytes::Bytes;
use rand::Rng;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::async_op::{CancelToken, ProgressSink};
use crate::error::{ImageError, Result};
use crate::exclusive_lock;
use crate::image::ImageCtx;
use crate::io;
use crate::metadata::{self, LegacyHeader};
use crate::object_map::{self, ObjectMap};
use crate::operations::{trim, Cleanup};
use crate::store::ObjectStore;
use crate::striping::{ExtentMapper, Striper};
use crate::types::{
    Config, CreateOptions, Features, ImageFormat, PoolId, MAX_ORDER, MIN_ORDER, SNAP_HEAD,
};

fn random_id() -> String {
    let mut rng = rand::thread_rng();
    (0..12)
        .map(|_| char::from_digit(rng.gen_range(0..16u32), 16).unwrap_or('0'))
        .collect()
}

/// Create a new image. Either every persisted artifact exists afterward
/// or none does.
pub fn create(
    store: &Arc<dyn ObjectStore>,
    pool: PoolId,
    name: &str,
    size: u64,
    opts: &CreateOptions,
) -> Result<()> {
    if name.is_empty() {
        return Err(ImageError::Invalid("empty image name".into()));
    }
    if !(MIN_ORDER..=MAX_ORDER).contains(&opts.order) {
        return Err(ImageError::Invalid(format!(
            "order {} outside [{MIN_ORDER}, {MAX_ORDER}]",
            opts.order
        )));
    }
    match opts.format {
        ImageFormat::Modern => create_modern(store, pool, name, size, opts),
        ImageFormat::Legacy => create_legacy(store, pool, name, size, opts),
    }
}

fn create_modern(
    store: &Arc<dyn ObjectStore>,
    pool: PoolId,
    name: &str,
    size: u64,
    opts: &CreateOptions,
) -> Result<()> {
    opts.features
        .validate()
        .map_err(|msg| ImageError::Invalid(msg.into()))?;
    let striper = Striper::new(opts.order, opts.stripe_unit, opts.stripe_count)?;
    if (opts.stripe_unit != 0 || opts.stripe_count > 1)
        && !opts.features.contains(Features::STRIPING_V2)
    {
        return Err(ImageError::Invalid(
            "custom striping requires the striping feature".into(),
        ));
    }

    let id = random_id();
    let id_oid = metadata::id_oid(name);
    let mut cleanup = Cleanup::new();

    // The id object claims the name.
    match store.create_exclusive(pool, &id_oid) {
        Ok(()) => {}
        Err(ImageError::AlreadyExists(_)) => {
            return Err(ImageError::AlreadyExists(name.to_string()))
        }
        Err(err) => return Err(err),
    }
    {
        let store = store.clone();
        let id_oid = id_oid.clone();
        cleanup.push(move || {
            let _ = store.remove(pool, &id_oid, &metadata::NO_SNAPC);
        });
    }
    store.omap_set(pool, &id_oid, &[("id".into(), Bytes::copy_from_slice(id.as_bytes()))])?;

    metadata::dir_add_image(store.as_ref(), pool, name, &id)?;
    {
        let store = store.clone();
        let name = name.to_string();
        let id = id.clone();
        cleanup.push(move || {
            let _ = metadata::dir_remove_image(store.as_ref(), pool, &name, &id);
        });
    }

    metadata::write_header(
        store.as_ref(),
        pool,
        &id,
        size,
        opts.order,
        opts.features,
        opts.stripe_unit,
        opts.stripe_count,
    )?;
    {
        let store = store.clone();
        let header = metadata::header_oid(&id);
        cleanup.push(move || {
            let _ = store.remove(pool, &header, &metadata::NO_SNAPC);
        });
    }

    if opts.features.contains(Features::OBJECT_MAP) {
        let map = ObjectMap::new(striper.object_count(size));
        object_map::save(store.as_ref(), pool, &id, SNAP_HEAD, &map)?;
    }

    cleanup.disarm();
    debug!(pool, name, id = %id, size, "created image");
    Ok(())
}

fn create_legacy(
    store: &Arc<dyn ObjectStore>,
    pool: PoolId,
    name: &str,
    size: u64,
    opts: &CreateOptions,
) -> Result<()> {
    metadata::dir_add_legacy(store.as_ref(), pool, name)?;
    let mut cleanup = Cleanup::new();
    {
        let store = store.clone();
        let name = name.to_string();
        cleanup.push(move || {
            let _ = metadata::dir_remove_legacy(store.as_ref(), pool, &name);
        });
    }

    let header = LegacyHeader {
        block_name: format!("blk.{pool}.{}", random_id()),
        image_size: size,
        order: opts.order,
        snap_seq: 0,
        snap_count: 0,
        snap_names_len: 0,
    };
    metadata::write_legacy_header(store.as_ref(), pool, name, &header)?;

    cleanup.disarm();
    debug!(pool, name, size, "created legacy image");
    Ok(())
}

/// Remove an image: trim every data object, then unregister its
/// metadata. Fails while the image still has snapshots.
pub fn remove(
    store: &Arc<dyn ObjectStore>,
    pool: PoolId,
    name: &str,
    progress: &dyn ProgressSink,
) -> Result<()> {
    let ctx = ImageCtx::open(store.clone(), pool, name, false, Config::default())?;
    let result = remove_open(&ctx, progress);
    let close_result = ctx.close();
    result?;
    close_result?;

    match ctx.format {
        ImageFormat::Modern => {
            match object_map::remove(store.as_ref(), pool, &ctx.id, SNAP_HEAD) {
                Ok(()) | Err(ImageError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
            store.remove(pool, &metadata::header_oid(&ctx.id), &metadata::NO_SNAPC)?;
            metadata::dir_remove_image(store.as_ref(), pool, name, &ctx.id)?;
            store.remove(pool, &metadata::id_oid(name), &metadata::NO_SNAPC)?;
        }
        ImageFormat::Legacy => {
            // The directory entry goes first and is not restored if the
            // header removal then fails.
            metadata::dir_remove_legacy(store.as_ref(), pool, name)?;
            if let Err(err) =
                store.remove(pool, &metadata::legacy_header_oid(name), &metadata::NO_SNAPC)
            {
                if !err.is_not_found() {
                    warn!(name, error = %err, "legacy header removal failed after directory update");
                    return Err(err);
                }
            }
        }
    }
    debug!(pool, name, "removed image");
    Ok(())
}

fn remove_open(ctx: &Arc<ImageCtx>, progress: &dyn ProgressSink) -> Result<()> {
    {
        let snap = ctx.snap.read().unwrap();
        if !snap.snaps.is_empty() {
            return Err(ImageError::Busy("image has snapshots".into()));
        }
    }
    let has_lock_feature = ctx
        .snap
        .read()
        .unwrap()
        .features
        .contains(Features::EXCLUSIVE_LOCK);
    if has_lock_feature && !exclusive_lock::try_acquire(ctx)? {
        return Err(ImageError::Busy("image is locked by another client".into()));
    }

    let size = ctx.snap.read().unwrap().size;
    let token = CancelToken::default();
    trim::trim_objects(ctx, 0, size, &token, progress)?;

    let parent_info = ctx.parent.read().unwrap().info.clone();
    if let Some(info) = parent_info {
        let children_pool = ctx.store.base_tier(ctx.pool)?;
        match metadata::remove_child(
            ctx.store.as_ref(),
            children_pool,
            &info.spec,
            ctx.pool,
            &ctx.id,
        ) {
            Ok(()) | Err(ImageError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Rename an image. Peers keep resolving the old name until their next
/// refresh: no notification is sent.
pub fn rename(store: &Arc<dyn ObjectStore>, pool: PoolId, from: &str, to: &str) -> Result<()> {
    if from == to {
        return Err(ImageError::Invalid("source and destination are the same".into()));
    }
    match metadata::dir_lookup_id(store.as_ref(), pool, from)? {
        Some(id) => {
            metadata::dir_rename_image(store.as_ref(), pool, from, to, &id)?;
        }
        None => rename_legacy(store, pool, from, to)?,
    }
    debug!(pool, from, to, "renamed image");
    Ok(())
}

fn rename_legacy(store: &Arc<dyn ObjectStore>, pool: PoolId, from: &str, to: &str) -> Result<()> {
    let old_oid = metadata::legacy_header_oid(from);
    let new_oid = metadata::legacy_header_oid(to);
    if store.stat(pool, &old_oid, SNAP_HEAD).is_err() {
        return Err(ImageError::NotFound(format!("image {from}")));
    }
    if store.stat(pool, &new_oid, SNAP_HEAD).is_ok() {
        return Err(ImageError::AlreadyExists(to.to_string()));
    }

    let len = store.stat(pool, &old_oid, SNAP_HEAD)?;
    let blob = store.read(pool, &old_oid, SNAP_HEAD, 0, len)?;
    store.write_full(pool, &new_oid, &blob, &metadata::NO_SNAPC)?;
    let entries = store.omap_list(pool, &old_oid, "")?;
    if !entries.is_empty() {
        store.omap_set(pool, &new_oid, &entries)?;
    }
    metadata::dir_add_legacy(store.as_ref(), pool, to)?;
    metadata::dir_remove_legacy(store.as_ref(), pool, from)?;
    store.remove(pool, &old_oid, &metadata::NO_SNAPC)?;
    Ok(())
}

/// All image names in the pool, modern and legacy.
pub fn list(store: &Arc<dyn ObjectStore>, pool: PoolId) -> Result<Vec<String>> {
    metadata::dir_list(store.as_ref(), pool)
}

/// Deep copy of the selected view of `src` into a fresh image. Progress
/// is byte-based; holes are skipped.
pub fn copy(
    src: &Arc<ImageCtx>,
    store: &Arc<dyn ObjectStore>,
    dest_pool: PoolId,
    dest_name: &str,
    opts: &CreateOptions,
    progress: &dyn ProgressSink,
) -> Result<()> {
    let size = src.size();
    create(store, dest_pool, dest_name, size, opts)?;
    let dest = ImageCtx::open(store.clone(), dest_pool, dest_name, false, src.config.clone())?;

    let chunk = {
        let snap = src.snap.read().unwrap();
        snap.mapper.object_size()
    };
    let mut off = 0u64;
    let result = loop {
        if off >= size {
            break Ok(());
        }
        let len = chunk.min(size - off);
        let data = match io::read(src, off, len) {
            Ok(data) => data,
            Err(err) => break Err(err),
        };
        if data.iter().any(|b| *b != 0) {
            if let Err(err) = io::write(&dest, off, &data) {
                break Err(err);
            }
        }
        off += len;
        progress.update(off, size);
    };
    let flush_result = result.and_then(|_| io::flush(&dest));
    let close_result = dest.close();
    flush_result?;
    close_result
}
