//! Cooperative exclusive-lock protocol.
//!
//! At most one client owns the advisory exclusive lock on the header
//! object at a time; only the owner mutates the image. Non-owners either
//! take the lock over (request-lock hand-off) or delegate the mutation
//! to the owner via the watch channel.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{ImageError, Result};
use crate::image::ImageCtx;
use crate::metadata::HEADER_LOCK_NAME;
use crate::watcher::{self, RequestLockAck};

/// Cookie and tag marking the cooperative lock, as opposed to
/// user-placed advisory locks on the same header.
pub(crate) const LOCK_COOKIE: &str = "internal";
pub(crate) const LOCK_TAG: &str = "internal";

/// Per-client lock subsystem state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockState {
    #[default]
    Unlocked,
    /// Advisory-lock acquisition in flight.
    TryLock,
    Locked,
    /// Flushing in-flight writes before giving the lock up.
    Releasing,
    /// The lock is held elsewhere and a hand-off has been requested.
    RequestPending,
}

#[derive(Debug, Default)]
pub(crate) struct OwnerState {
    pub(crate) state: LockState,
}

pub(crate) fn is_owner(ctx: &ImageCtx) -> bool {
    ctx.owner.read().unwrap().state == LockState::Locked
}

/// One attempt to take the advisory lock. Returns false when the lock is
/// held elsewhere; a request-lock notification is the caller's move.
pub(crate) fn try_acquire(ctx: &Arc<ImageCtx>) -> Result<bool> {
    {
        let mut owner = ctx.owner.write().unwrap();
        match owner.state {
            LockState::Locked => return Ok(true),
            LockState::Releasing => return Ok(false),
            _ => {}
        }
        owner.state = LockState::TryLock;
        match ctx.store.lock_exclusive(
            ctx.pool,
            &ctx.header,
            HEADER_LOCK_NAME,
            LOCK_COOKIE,
            LOCK_TAG,
            "cooperative image lock",
        ) {
            // AlreadyExists: our own registration survived a previous
            // session of this client.
            Ok(()) | Err(ImageError::AlreadyExists(_)) => {
                owner.state = LockState::Locked;
            }
            Err(ImageError::Busy(_)) => {
                owner.state = LockState::RequestPending;
                return Ok(false);
            }
            Err(err) => {
                owner.state = LockState::Unlocked;
                return Err(err);
            }
        }
    }
    debug!(image = %ctx.id, "exclusive lock acquired");
    // Writes parked on ownership may proceed.
    ctx.lock_waiters.signal();
    watcher::notify_lock_transition(ctx, true);
    Ok(true)
}

/// Block until this client owns the lock, requesting a hand-off from the
/// current holder as needed.
pub(crate) fn wait_for_ownership(ctx: &Arc<ImageCtx>) -> Result<()> {
    let mut attempts = 0u32;
    loop {
        if try_acquire(ctx)? {
            return Ok(());
        }
        let epoch = ctx.lock_waiters.epoch();
        match watcher::request_lock(ctx)? {
            RequestLockAck::Granted => {
                // Holder is releasing; wake on its released-lock
                // notification, or time out and retry.
                ctx.lock_waiters.wait_past(epoch, ctx.config.request_timeout);
            }
            RequestLockAck::Busy => {
                std::thread::sleep(retry_delay(attempts));
            }
            RequestLockAck::NoOwner => {
                // Holder not watching (stale registration or mid-restart);
                // give it a moment and retry the plain acquire.
                std::thread::sleep(retry_delay(attempts));
            }
        }
        attempts += 1;
        if attempts > ctx.config.request_retries {
            warn!(image = %ctx.id, "lock hand-off retries exhausted");
            return Err(ImageError::Timeout);
        }
    }
}

fn retry_delay(attempt: u32) -> Duration {
    let base = 20u64 << attempt.min(6);
    let jitter = rand::thread_rng().gen_range(0..base / 2 + 1);
    Duration::from_millis(base + jitter)
}

/// Give the lock up: drain local async operations and in-flight writes
/// first so every write tagged with the current snap context is durable,
/// then drop the advisory lock and tell the peers.
pub(crate) fn release(ctx: &Arc<ImageCtx>) -> Result<()> {
    {
        let mut owner = ctx.owner.write().unwrap();
        if owner.state != LockState::Locked {
            return Ok(());
        }
        owner.state = LockState::Releasing;
    }

    ctx.ops.flush();
    let flush_result = crate::io::flush_store(ctx);

    {
        let mut owner = ctx.owner.write().unwrap();
        if let Err(err) = flush_result {
            // Keep ownership; releasing with unflushed writes would hand
            // peers a stale view.
            owner.state = LockState::Locked;
            return Err(err);
        }
        match ctx.store.unlock(ctx.pool, &ctx.header, HEADER_LOCK_NAME, LOCK_COOKIE) {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => {
                owner.state = LockState::Locked;
                return Err(err);
            }
        }
        owner.state = LockState::Unlocked;
    }
    debug!(image = %ctx.id, "exclusive lock released");
    watcher::notify_lock_transition(ctx, false);
    Ok(())
}
