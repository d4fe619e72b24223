//! Administrative operations on images.

pub(crate) mod admin;
pub(crate) mod clone_image;
pub(crate) mod features;
pub(crate) mod flatten;
pub(crate) mod rebuild;
pub(crate) mod resize;
pub(crate) mod snapshot;
pub(crate) mod trim;

use std::sync::Arc;

use crate::async_op::{CancelToken, ProgressSink};
use crate::error::{ImageError, Result};
use crate::exclusive_lock::LockState;
use crate::image::{refresh, ImageCtx};
use crate::watcher::RemoteOp;

/// Run a delegated request on behalf of a peer. Called from the inbox
/// thread; the executor must still be the lock owner.
pub(crate) fn execute_remote(
    ctx: &Arc<ImageCtx>,
    op: &RemoteOp,
    progress: &dyn ProgressSink,
) -> Result<()> {
    refresh::check(ctx)?;
    let owner = ctx.owner.read().unwrap();
    if owner.state != LockState::Locked {
        // Ownership moved between the ack and now; the requester
        // re-drives.
        return Err(ImageError::Restart);
    }
    let handle = ctx.ops.start();
    let result = match op {
        RemoteOp::Resize { size } => resize::execute(ctx, *size, handle.token(), progress),
        RemoteOp::Flatten => flatten::execute(ctx, handle.token(), progress),
        RemoteOp::SnapCreate { name } => snapshot::create_local(ctx, name),
        RemoteOp::SnapRemove { name } => snapshot::remove_local(ctx, name),
        RemoteOp::SnapRollback { name } => {
            snapshot::rollback_local(ctx, name, handle.token(), progress)
        }
        RemoteOp::RebuildObjectMap => rebuild::execute(ctx, handle.token(), progress),
    };
    drop(handle);
    result
}

/// Compensation actions for multi-step mutations: registered in reverse
/// order as steps succeed, run automatically when the operation bails
/// out, disarmed on success.
pub(crate) struct Cleanup<'a> {
    actions: Vec<Box<dyn FnOnce() + 'a>>,
}

impl<'a> Cleanup<'a> {
    pub(crate) fn new() -> Self {
        Self { actions: Vec::new() }
    }

    pub(crate) fn push(&mut self, action: impl FnOnce() + 'a) {
        self.actions.push(Box::new(action));
    }

    pub(crate) fn disarm(mut self) {
        self.actions.clear();
    }
}

impl Drop for Cleanup<'_> {
    fn drop(&mut self) {
        while let Some(action) = self.actions.pop() {
            action();
        }
    }
}

/// Walk `range` with at most `bound` store operations in flight, checking
/// for cancellation between batches. `f` must tolerate being called out
/// of order within a batch.
pub(crate) fn for_each_object(
    range: std::ops::Range<u64>,
    bound: usize,
    token: &CancelToken,
    f: impl Fn(u64) -> Result<()> + Sync,
) -> Result<()> {
    let bound = bound.max(1);
    let f = &f;
    let objects: Vec<u64> = range.collect();
    for batch in objects.chunks(bound) {
        token.check()?;
        let mut first_err = None;
        std::thread::scope(|scope| {
            let handles: Vec<_> = batch
                .iter()
                .map(|&object_no| scope.spawn(move || f(object_no)))
                .collect();
            for handle in handles {
                match handle.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        if first_err.is_none() {
                            first_err = Some(err);
                        }
                    }
                    Err(_) => {
                        if first_err.is_none() {
                            first_err = Some(ImageError::Io("object worker panicked".into()));
                        }
                    }
                }
            }
        });
        if let Some(err) = first_err {
            return Err(err);
        }
    }
    Ok(())
}
