//! Cloning a child image from a protected parent snapshot.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{ImageError, Result};
use crate::image::{refresh, ImageCtx};
use crate::metadata;
use crate::operations::{admin, Cleanup};
use crate::store::ObjectStore;
use crate::types::{
    Config, CreateOptions, Features, ImageFormat, ParentInfo, ParentSpec, PoolId,
    ProtectionStatus,
};

/// Clone `parent_name@snap_name` into `child_pool/child_name`.
///
/// The parent snapshot must be protected; protection is re-checked after
/// the child is registered, and a race with unprotect rolls the whole
/// clone back.
pub fn clone(
    store: &Arc<dyn ObjectStore>,
    parent_pool: PoolId,
    parent_name: &str,
    snap_name: &str,
    child_pool: PoolId,
    child_name: &str,
    opts: &CreateOptions,
) -> Result<()> {
    if opts.format != ImageFormat::Modern || !opts.features.contains(Features::LAYERING) {
        return Err(ImageError::Invalid(
            "clones require a modern child with layering".into(),
        ));
    }

    let parent = ImageCtx::open(store.clone(), parent_pool, parent_name, true, Config::default())?;
    let result = clone_from_open_parent(store, &parent, snap_name, child_pool, child_name, opts);
    if let Err(err) = parent.close() {
        warn!(error = %err, "closing clone parent failed");
    }
    result
}

fn clone_from_open_parent(
    store: &Arc<dyn ObjectStore>,
    parent: &Arc<ImageCtx>,
    snap_name: &str,
    child_pool: PoolId,
    child_name: &str,
    opts: &CreateOptions,
) -> Result<()> {
    if parent.format != ImageFormat::Modern {
        return Err(ImageError::Invalid("parent is not a modern image".into()));
    }
    let (snap_id, snap_size, parent_order) = {
        let snap = parent.snap.read().unwrap();
        if !snap.features.contains(Features::LAYERING) {
            return Err(ImageError::Unsupported("parent has no layering".into()));
        }
        let info = snap
            .snap_by_name(snap_name)
            .ok_or_else(|| ImageError::NotFound(format!("snapshot {snap_name}")))?;
        if info.protection != ProtectionStatus::Protected {
            return Err(ImageError::Invalid(format!(
                "snapshot {snap_name} is not protected"
            )));
        }
        (info.id, info.size, snap.order)
    };

    // Child matches the parent's size; order follows the caller.
    let mut child_opts = opts.clone();
    if child_opts.order == 0 {
        child_opts.order = parent_order;
    }
    let mut cleanup = Cleanup::new();

    admin::create(store, child_pool, child_name, snap_size, &child_opts)?;
    {
        let store = store.clone();
        let child_name = child_name.to_string();
        cleanup.push(move || {
            if let Err(err) =
                admin::remove(&store, child_pool, &child_name, &crate::async_op::NoProgress)
            {
                warn!(error = %err, "clone unwind: child removal failed");
            }
        });
    }

    let child_id = metadata::dir_lookup_id(store.as_ref(), child_pool, child_name)?
        .ok_or_else(|| ImageError::Corrupt("created child missing from directory".into()))?;
    let spec = ParentSpec {
        pool: parent.pool,
        image_id: parent.id.clone(),
        snap_id,
    };

    metadata::set_parent(
        store.as_ref(),
        child_pool,
        &child_id,
        &ParentInfo {
            spec: spec.clone(),
            overlap: snap_size,
        },
    )?;
    {
        let store = store.clone();
        let child_id = child_id.clone();
        cleanup.push(move || {
            let _ = metadata::remove_parent(store.as_ref(), child_pool, &child_id);
        });
    }

    let children_pool = store.base_tier(child_pool)?;
    metadata::add_child(store.as_ref(), children_pool, &spec, child_pool, &child_id)?;
    {
        let store = store.clone();
        let spec = spec.clone();
        let child_id = child_id.clone();
        cleanup.push(move || {
            let _ =
                metadata::remove_child(store.as_ref(), children_pool, &spec, child_pool, &child_id);
        });
    }

    // Parent's user metadata carries over.
    for (key, value) in metadata::meta_list(store.as_ref(), parent.pool, &parent.id)? {
        metadata::meta_set(store.as_ref(), child_pool, &child_id, &key, &value)?;
    }

    // Unprotect may have raced the registration; re-read the parent and
    // abort if protection moved.
    refresh::refresh(parent)?;
    let still_protected = {
        let snap = parent.snap.read().unwrap();
        snap.snap_by_id(snap_id)
            .map(|s| s.protection == ProtectionStatus::Protected)
            .unwrap_or(false)
    };
    if !still_protected {
        return Err(ImageError::Invalid(format!(
            "snapshot {snap_name} lost protection during clone"
        )));
    }

    cleanup.disarm();
    debug!(
        parent = %parent.id, snap = snap_id, child = %child_id, "cloned"
    );
    Ok(())
}
