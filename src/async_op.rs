//! Uniform dispatch for mutating operations.
//!
//! Every admin mutation runs through [`invoke_async_request`]: the caller
//! either owns the cooperative exclusive lock (or the feature is off) and
//! executes locally, or delegates to the current owner over the header
//! watch channel. Local long ops are tracked so the context can flush or
//! cancel them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{ImageError, Result};
use crate::exclusive_lock::{self, LockState};
use crate::image::{refresh, ImageCtx};
use crate::types::Features;
use crate::watcher::{self, RemoteOp};

/// Receives progress for a long-running operation.
pub trait ProgressSink: Send + Sync {
    fn update(&self, offset: u64, total: u64);
}

/// Discards all progress reports.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn update(&self, _offset: u64, _total: u64) {}
}

impl<F: Fn(u64, u64) + Send + Sync> ProgressSink for F {
    fn update(&self, offset: u64, total: u64) {
        self(offset, total)
    }
}

/// Cooperative cancellation flag checked by long ops between batches.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Long ops call this between object batches; a cancelled op
    /// surfaces as `Restart` and reaches a terminal state promptly.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ImageError::Restart)
        } else {
            Ok(())
        }
    }

    fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }
}

#[derive(Default)]
struct TrackerState {
    tokens: Vec<CancelToken>,
}

/// Tracks in-flight local async operations for one image context.
#[derive(Default)]
pub struct AsyncOpTracker {
    state: Mutex<TrackerState>,
    cond: Condvar,
}

impl AsyncOpTracker {
    pub(crate) fn start(&self) -> OpHandle<'_> {
        let token = CancelToken::default();
        self.state.lock().unwrap().tokens.push(token.clone());
        OpHandle {
            tracker: self,
            token,
        }
    }

    pub(crate) fn active(&self) -> usize {
        self.state.lock().unwrap().tokens.len()
    }

    /// Block until every tracked operation has reached a terminal state.
    pub(crate) fn flush(&self) {
        let mut state = self.state.lock().unwrap();
        while !state.tokens.is_empty() {
            state = self.cond.wait(state).unwrap();
        }
    }

    /// Signal every tracked operation to stop.
    pub(crate) fn cancel_all(&self) {
        let state = self.state.lock().unwrap();
        for token in &state.tokens {
            token.cancel();
        }
    }
}

/// RAII registration of one running operation.
pub(crate) struct OpHandle<'a> {
    tracker: &'a AsyncOpTracker,
    token: CancelToken,
}

impl OpHandle<'_> {
    pub(crate) fn token(&self) -> &CancelToken {
        &self.token
    }
}

impl Drop for OpHandle<'_> {
    fn drop(&mut self) {
        let mut state = self.tracker.state.lock().unwrap();
        if let Some(pos) = state
            .tokens
            .iter()
            .position(|t| Arc::ptr_eq(&t.flag, &self.token.flag))
        {
            state.tokens.swap_remove(pos);
        }
        drop(state);
        self.tracker.cond.notify_all();
    }
}

/// One-shot completion slot for blocking waits.
#[derive(Default)]
pub(crate) struct Completion {
    state: Mutex<Option<Result<()>>>,
    cond: Condvar,
}

impl Completion {
    pub(crate) fn complete(&self, result: Result<()>) {
        let mut state = self.state.lock().unwrap();
        if state.is_none() {
            *state = Some(result);
        }
        drop(state);
        self.cond.notify_all();
    }

    pub(crate) fn wait_timeout(&self, timeout: Duration) -> Option<Result<()>> {
        let mut state = self.state.lock().unwrap();
        let (next, _) = self
            .cond
            .wait_timeout_while(state, timeout, |s| s.is_none())
            .unwrap();
        state = next;
        state.take()
    }
}

/// A RESTART is absorbed at most once per logical call.
const MAX_RESTARTS: u32 = 1;

fn backoff(attempt: u32) -> Duration {
    let base = 50u64 << attempt.min(5);
    let jitter = rand::thread_rng().gen_range(0..base / 2 + 1);
    Duration::from_millis(base + jitter)
}

/// The retry envelope shared by every mutating admin operation.
///
/// `local` runs with the owner lock read-held (when the feature is on,
/// this client is the owner for the duration); it must not reacquire the
/// owner lock itself.
pub(crate) fn invoke_async_request<F>(
    ctx: &Arc<ImageCtx>,
    op: RemoteOp,
    permit_snapshot: bool,
    progress: Arc<dyn ProgressSink>,
    local: F,
) -> Result<()>
where
    F: Fn(&Arc<ImageCtx>, &CancelToken, &dyn ProgressSink) -> Result<()>,
{
    let mut restarts = 0u32;
    let mut remote_failures = 0u32;
    loop {
        refresh::check(ctx)?;

        {
            let snap = ctx.snap.read().unwrap();
            if !snap.selection.is_head() && !permit_snapshot {
                return Err(ImageError::ReadOnly);
            }
        }
        if ctx.read_only {
            return Err(ImageError::ReadOnly);
        }

        let owner = ctx.owner.read().unwrap();
        let needs_lock = {
            let snap = ctx.snap.read().unwrap();
            snap.features.contains(Features::EXCLUSIVE_LOCK)
        };
        if needs_lock && owner.state != LockState::Locked {
            // Downgrade-upgrade: release the read side, try to become
            // the owner under the write side, then re-drive the loop.
            drop(owner);
            if exclusive_lock::try_acquire(ctx)? {
                continue;
            }
            match watcher::remote_request(ctx, &op, progress.clone()) {
                Ok(()) => return Ok(()),
                Err(ImageError::Timeout) | Err(ImageError::Restart) => {
                    remote_failures += 1;
                    if remote_failures > ctx.config.request_retries {
                        warn!(op = ?op, "remote request retries exhausted");
                        return Err(ImageError::Timeout);
                    }
                    std::thread::sleep(backoff(remote_failures));
                    continue;
                }
                Err(err) => return Err(err),
            }
        }

        let handle = ctx.ops.start();
        let result = local(ctx, handle.token(), progress.as_ref());
        drop(handle);
        drop(owner);

        match result {
            Err(ImageError::Restart) if restarts < MAX_RESTARTS => {
                debug!(op = ?op, "restarting async request");
                restarts += 1;
            }
            other => return other,
        }
    }
}
