//! Header-object watch channel.
//!
//! The header object is the rendezvous point for every client of an
//! image. Peers announce metadata updates and lock transitions on it and
//! delegate mutating operations to the current lock owner. Store
//! callbacks fire on arbitrary threads, so each open image runs an inbox
//! thread: the callback only bumps the refresh counter, decides cheap
//! acknowledgments and forwards work; the inbox performs lock hand-off
//! and executes delegated operations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::async_op::{Completion, ProgressSink};
use crate::error::{ImageError, Result};
use crate::exclusive_lock::{self, LockState};
use crate::image::ImageCtx;
use crate::metadata::{put_str, put_u64, take_str, take_u64};
use crate::operations;
use crate::store::WatchHandler;

// Acknowledgment payloads.
const ACK_OK: u8 = 0;
/// Owner is mid-mutation and defers the hand-off ("not now").
const ACK_BUSY: u8 = 1;
const ACK_NOT_OWNER: u8 = 2;
const ACK_UNKNOWN: u8 = 3;

/// An operation a non-owner may delegate to the lock owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOp {
    Resize { size: u64 },
    Flatten,
    SnapCreate { name: String },
    SnapRemove { name: String },
    SnapRollback { name: String },
    RebuildObjectMap,
}

/// Everything that travels over the header watch channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyMessage {
    HeaderUpdate,
    AcquiredLock { client: String },
    ReleasedLock { client: String },
    RequestLock { client: String },
    AsyncRequest { client: String, request_id: u64, op: RemoteOp },
    AsyncProgress { client: String, request_id: u64, offset: u64, total: u64 },
    AsyncComplete { client: String, request_id: u64, result: std::result::Result<(), (u8, String)> },
}

const TAG_HEADER_UPDATE: u8 = 1;
const TAG_ACQUIRED_LOCK: u8 = 2;
const TAG_RELEASED_LOCK: u8 = 3;
const TAG_REQUEST_LOCK: u8 = 4;
const TAG_ASYNC_REQUEST: u8 = 5;
const TAG_ASYNC_PROGRESS: u8 = 6;
const TAG_ASYNC_COMPLETE: u8 = 7;

const OP_RESIZE: u8 = 1;
const OP_FLATTEN: u8 = 2;
const OP_SNAP_CREATE: u8 = 3;
const OP_SNAP_REMOVE: u8 = 4;
const OP_SNAP_ROLLBACK: u8 = 5;
const OP_REBUILD_OBJECT_MAP: u8 = 6;

fn encode_op(buf: &mut Vec<u8>, op: &RemoteOp) {
    match op {
        RemoteOp::Resize { size } => {
            buf.push(OP_RESIZE);
            put_u64(buf, *size);
        }
        RemoteOp::Flatten => buf.push(OP_FLATTEN),
        RemoteOp::SnapCreate { name } => {
            buf.push(OP_SNAP_CREATE);
            put_str(buf, name);
        }
        RemoteOp::SnapRemove { name } => {
            buf.push(OP_SNAP_REMOVE);
            put_str(buf, name);
        }
        RemoteOp::SnapRollback { name } => {
            buf.push(OP_SNAP_ROLLBACK);
            put_str(buf, name);
        }
        RemoteOp::RebuildObjectMap => buf.push(OP_REBUILD_OBJECT_MAP),
    }
}

fn decode_op(cur: &mut &[u8]) -> Result<RemoteOp> {
    let (tag, rest) = cur
        .split_first()
        .ok_or_else(|| ImageError::Corrupt("short notification".into()))?;
    *cur = rest;
    Ok(match *tag {
        OP_RESIZE => RemoteOp::Resize { size: take_u64(cur)? },
        OP_FLATTEN => RemoteOp::Flatten,
        OP_SNAP_CREATE => RemoteOp::SnapCreate { name: take_str(cur)? },
        OP_SNAP_REMOVE => RemoteOp::SnapRemove { name: take_str(cur)? },
        OP_SNAP_ROLLBACK => RemoteOp::SnapRollback { name: take_str(cur)? },
        OP_REBUILD_OBJECT_MAP => RemoteOp::RebuildObjectMap,
        _ => return Err(ImageError::Corrupt("unknown remote op".into())),
    })
}

fn error_code(err: &ImageError) -> (u8, String) {
    match err {
        ImageError::ReadOnly => (1, String::new()),
        ImageError::NotFound(m) => (2, m.clone()),
        ImageError::AlreadyExists(m) => (3, m.clone()),
        ImageError::Invalid(m) => (4, m.clone()),
        ImageError::Unsupported(m) => (5, m.clone()),
        ImageError::Busy(m) => (6, m.clone()),
        ImageError::Timeout => (7, String::new()),
        ImageError::Restart => (8, String::new()),
        ImageError::Corrupt(m) => (9, m.clone()),
        ImageError::Io(m) => (10, m.clone()),
        ImageError::WouldBlock => (11, String::new()),
        ImageError::UnsupportedIncompatible { missing } => (12, format!("{missing:#x}")),
    }
}

fn error_from_code(code: u8, message: String) -> ImageError {
    match code {
        1 => ImageError::ReadOnly,
        2 => ImageError::NotFound(message),
        3 => ImageError::AlreadyExists(message),
        4 => ImageError::Invalid(message),
        5 => ImageError::Unsupported(message),
        6 => ImageError::Busy(message),
        7 => ImageError::Timeout,
        8 => ImageError::Restart,
        9 => ImageError::Corrupt(message),
        11 => ImageError::WouldBlock,
        12 => ImageError::UnsupportedIncompatible {
            missing: u64::from_str_radix(message.trim_start_matches("0x"), 16).unwrap_or(0),
        },
        _ => ImageError::Io(message),
    }
}

pub(crate) fn encode_message(msg: &NotifyMessage) -> Vec<u8> {
    let mut buf = Vec::new();
    match msg {
        NotifyMessage::HeaderUpdate => buf.push(TAG_HEADER_UPDATE),
        NotifyMessage::AcquiredLock { client } => {
            buf.push(TAG_ACQUIRED_LOCK);
            put_str(&mut buf, client);
        }
        NotifyMessage::ReleasedLock { client } => {
            buf.push(TAG_RELEASED_LOCK);
            put_str(&mut buf, client);
        }
        NotifyMessage::RequestLock { client } => {
            buf.push(TAG_REQUEST_LOCK);
            put_str(&mut buf, client);
        }
        NotifyMessage::AsyncRequest {
            client,
            request_id,
            op,
        } => {
            buf.push(TAG_ASYNC_REQUEST);
            put_str(&mut buf, client);
            put_u64(&mut buf, *request_id);
            encode_op(&mut buf, op);
        }
        NotifyMessage::AsyncProgress {
            client,
            request_id,
            offset,
            total,
        } => {
            buf.push(TAG_ASYNC_PROGRESS);
            put_str(&mut buf, client);
            put_u64(&mut buf, *request_id);
            put_u64(&mut buf, *offset);
            put_u64(&mut buf, *total);
        }
        NotifyMessage::AsyncComplete {
            client,
            request_id,
            result,
        } => {
            buf.push(TAG_ASYNC_COMPLETE);
            put_str(&mut buf, client);
            put_u64(&mut buf, *request_id);
            match result {
                Ok(()) => buf.push(0),
                Err((code, message)) => {
                    buf.push(*code);
                    put_str(&mut buf, message);
                }
            }
        }
    }
    buf
}

pub(crate) fn decode_message(raw: &[u8]) -> Result<NotifyMessage> {
    let mut cur = raw;
    let (tag, rest) = cur
        .split_first()
        .ok_or_else(|| ImageError::Corrupt("empty notification".into()))?;
    cur = rest;
    Ok(match *tag {
        TAG_HEADER_UPDATE => NotifyMessage::HeaderUpdate,
        TAG_ACQUIRED_LOCK => NotifyMessage::AcquiredLock { client: take_str(&mut cur)? },
        TAG_RELEASED_LOCK => NotifyMessage::ReleasedLock { client: take_str(&mut cur)? },
        TAG_REQUEST_LOCK => NotifyMessage::RequestLock { client: take_str(&mut cur)? },
        TAG_ASYNC_REQUEST => NotifyMessage::AsyncRequest {
            client: take_str(&mut cur)?,
            request_id: take_u64(&mut cur)?,
            op: decode_op(&mut cur)?,
        },
        TAG_ASYNC_PROGRESS => NotifyMessage::AsyncProgress {
            client: take_str(&mut cur)?,
            request_id: take_u64(&mut cur)?,
            offset: take_u64(&mut cur)?,
            total: take_u64(&mut cur)?,
        },
        TAG_ASYNC_COMPLETE => {
            let client = take_str(&mut cur)?;
            let request_id = take_u64(&mut cur)?;
            let (code, rest) = cur
                .split_first()
                .ok_or_else(|| ImageError::Corrupt("short notification".into()))?;
            cur = rest;
            let result = if *code == 0 {
                Ok(())
            } else {
                Err((*code, take_str(&mut cur)?))
            };
            NotifyMessage::AsyncComplete {
                client,
                request_id,
                result,
            }
        }
        _ => return Err(ImageError::Corrupt("unknown notification".into())),
    })
}

// --- pending remote requests ---

struct PendingRemote {
    completion: Arc<Completion>,
    progress: Arc<dyn ProgressSink>,
}

/// Requests this client has delegated and is waiting on.
#[derive(Default)]
pub(crate) struct RemoteRequests {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingRemote>>,
}

impl RemoteRequests {
    /// Fail every outstanding delegated request so callers re-drive.
    pub(crate) fn cancel_all(&self) {
        let pending = self.pending.lock().unwrap();
        for entry in pending.values() {
            entry.completion.complete(Err(ImageError::Restart));
        }
    }
}

/// Edge-triggered signal that some peer released or acquired the lock.
#[derive(Default)]
pub(crate) struct LockWaiters {
    epoch: Mutex<u64>,
    cond: Condvar,
}

impl LockWaiters {
    pub(crate) fn epoch(&self) -> u64 {
        *self.epoch.lock().unwrap()
    }

    pub(crate) fn signal(&self) {
        *self.epoch.lock().unwrap() += 1;
        self.cond.notify_all();
    }

    /// Wait until the epoch moves past `seen`; false on timeout.
    pub(crate) fn wait_past(&self, seen: u64, timeout: Duration) -> bool {
        let epoch = self.epoch.lock().unwrap();
        let (epoch, result) = self
            .cond
            .wait_timeout_while(epoch, timeout, |e| *e == seen)
            .unwrap();
        drop(epoch);
        !result.timed_out()
    }
}

// --- watch registration and the inbox thread ---

enum InboxCmd {
    ReleaseLock,
    ExecuteRemote {
        requester: String,
        request_id: u64,
        op: RemoteOp,
    },
    Shutdown,
}

pub(crate) struct WatcherHandle {
    watch_id: crate::store::WatchId,
    tx: Sender<InboxCmd>,
    thread: Option<JoinHandle<()>>,
}

struct WatchDispatch {
    ctx: Weak<ImageCtx>,
    client: String,
    tx: Sender<InboxCmd>,
}

impl WatchHandler for WatchDispatch {
    fn handle(&self, payload: &[u8]) -> Option<Vec<u8>> {
        let Some(ctx) = self.ctx.upgrade() else {
            return None;
        };
        let msg = match decode_message(payload) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(error = %err, "dropping undecodable notification");
                return Some(vec![ACK_UNKNOWN]);
            }
        };

        // Every notification invalidates the in-memory mirror.
        {
            let mut counters = ctx.refresh.lock().unwrap();
            counters.refresh_seq += 1;
        }
        trace!(client = %self.client, msg = ?msg, "notification");

        let ack = match msg {
            NotifyMessage::HeaderUpdate => ACK_OK,
            NotifyMessage::AcquiredLock { client } | NotifyMessage::ReleasedLock { client } => {
                if client != self.client {
                    ctx.lock_waiters.signal();
                }
                ACK_OK
            }
            NotifyMessage::RequestLock { client } => {
                if client == self.client {
                    ACK_OK
                } else {
                    let owner = ctx.owner.read().unwrap();
                    match owner.state {
                        LockState::Locked => {
                            if ctx.ops.active() > 0 {
                                ACK_BUSY
                            } else {
                                let _ = self.tx.send(InboxCmd::ReleaseLock);
                                ACK_OK
                            }
                        }
                        _ => ACK_NOT_OWNER,
                    }
                }
            }
            NotifyMessage::AsyncRequest {
                client,
                request_id,
                op,
            } => {
                if client == self.client {
                    ACK_NOT_OWNER
                } else {
                    let owner = ctx.owner.read().unwrap();
                    if owner.state == LockState::Locked {
                        let _ = self.tx.send(InboxCmd::ExecuteRemote {
                            requester: client,
                            request_id,
                            op,
                        });
                        ACK_OK
                    } else {
                        ACK_NOT_OWNER
                    }
                }
            }
            NotifyMessage::AsyncProgress {
                client,
                request_id,
                offset,
                total,
            } => {
                if client == self.client {
                    let pending = ctx.remote.pending.lock().unwrap();
                    if let Some(entry) = pending.get(&request_id) {
                        entry.progress.update(offset, total);
                    }
                }
                ACK_OK
            }
            NotifyMessage::AsyncComplete {
                client,
                request_id,
                result,
            } => {
                if client == self.client {
                    let entry = ctx.remote.pending.lock().unwrap().remove(&request_id);
                    if let Some(entry) = entry {
                        entry
                            .completion
                            .complete(result.map_err(|(c, m)| error_from_code(c, m)));
                    }
                }
                ACK_OK
            }
        };
        Some(vec![ack])
    }
}

/// Progress sink that forwards to a delegating peer.
struct RemoteProgress {
    ctx: Arc<ImageCtx>,
    requester: String,
    request_id: u64,
}

impl ProgressSink for RemoteProgress {
    fn update(&self, offset: u64, total: u64) {
        let payload = encode_message(&NotifyMessage::AsyncProgress {
            client: self.requester.clone(),
            request_id: self.request_id,
            offset,
            total,
        });
        if let Err(err) = self.ctx.store.notify(self.ctx.pool, &self.ctx.header, &payload) {
            debug!(error = %err, "progress notification dropped");
        }
    }
}

fn run_inbox(ctx: Weak<ImageCtx>, rx: Receiver<InboxCmd>) {
    while let Ok(cmd) = rx.recv() {
        match cmd {
            InboxCmd::Shutdown => break,
            InboxCmd::ReleaseLock => {
                let Some(ctx) = ctx.upgrade() else { break };
                if let Err(err) = exclusive_lock::release(&ctx) {
                    warn!(error = %err, "lock hand-off failed");
                }
            }
            InboxCmd::ExecuteRemote {
                requester,
                request_id,
                op,
            } => {
                let Some(ctx) = ctx.upgrade() else { break };
                let progress = RemoteProgress {
                    ctx: ctx.clone(),
                    requester: requester.clone(),
                    request_id,
                };
                debug!(op = ?op, requester = %requester, "executing delegated request");
                let result = operations::execute_remote(&ctx, &op, &progress);
                let payload = encode_message(&NotifyMessage::AsyncComplete {
                    client: requester,
                    request_id,
                    result: result.map_err(|e| error_code(&e)),
                });
                if let Err(err) = ctx.store.notify(ctx.pool, &ctx.header, &payload) {
                    warn!(error = %err, "completion notification failed");
                }
            }
        }
    }
}

/// Register the header watch and start the inbox thread.
pub(crate) fn register(ctx: &Arc<ImageCtx>) -> Result<()> {
    let (tx, rx) = channel();
    let dispatch = Arc::new(WatchDispatch {
        ctx: Arc::downgrade(ctx),
        client: ctx.client.clone(),
        tx: tx.clone(),
    });
    let watch_id = ctx.store.watch(ctx.pool, &ctx.header, dispatch)?;
    let weak = Arc::downgrade(ctx);
    let thread = std::thread::Builder::new()
        .name(format!("img-watch-{}", ctx.id))
        .spawn(move || run_inbox(weak, rx))
        .map_err(|e| ImageError::Io(format!("spawn watcher: {e}")))?;
    *ctx.watcher.lock().unwrap() = Some(WatcherHandle {
        watch_id,
        tx,
        thread: Some(thread),
    });
    Ok(())
}

/// Tear down the watch registration; idempotent.
pub(crate) fn unregister(ctx: &ImageCtx) {
    let handle = ctx.watcher.lock().unwrap().take();
    if let Some(mut handle) = handle {
        let _ = ctx.store.unwatch(ctx.pool, &ctx.header, handle.watch_id);
        let _ = handle.tx.send(InboxCmd::Shutdown);
        if let Some(thread) = handle.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Announce a persisted metadata change to all peers.
pub(crate) fn notify_header_update(ctx: &ImageCtx) {
    let payload = encode_message(&NotifyMessage::HeaderUpdate);
    if let Err(err) = ctx.store.notify(ctx.pool, &ctx.header, &payload) {
        debug!(error = %err, "header update notification failed");
    }
}

pub(crate) fn notify_lock_transition(ctx: &ImageCtx, acquired: bool) {
    let msg = if acquired {
        NotifyMessage::AcquiredLock { client: ctx.client.clone() }
    } else {
        NotifyMessage::ReleasedLock { client: ctx.client.clone() }
    };
    if let Err(err) = ctx.store.notify(ctx.pool, &ctx.header, &encode_message(&msg)) {
        debug!(error = %err, "lock transition notification failed");
    }
}

/// What the current holder said to a request-lock notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestLockAck {
    /// Owner will release; wait for the released-lock signal and retry.
    Granted,
    /// Owner deferred; back off and retry.
    Busy,
    /// Nobody answered as owner.
    NoOwner,
}

pub(crate) fn request_lock(ctx: &ImageCtx) -> Result<RequestLockAck> {
    let payload = encode_message(&NotifyMessage::RequestLock { client: ctx.client.clone() });
    let acks = ctx.store.notify(ctx.pool, &ctx.header, &payload)?;
    let mut outcome = RequestLockAck::NoOwner;
    for ack in acks {
        if ack.client == ctx.client {
            continue;
        }
        match ack.payload.as_deref() {
            Some([ACK_BUSY]) => return Ok(RequestLockAck::Busy),
            Some([ACK_OK]) => outcome = RequestLockAck::Granted,
            _ => {}
        }
    }
    Ok(outcome)
}

/// Delegate `op` to the lock owner and wait for its completion.
pub(crate) fn remote_request(
    ctx: &Arc<ImageCtx>,
    op: &RemoteOp,
    progress: Arc<dyn ProgressSink>,
) -> Result<()> {
    let request_id = ctx.remote.next_id.fetch_add(1, Ordering::Relaxed) + 1;
    let completion = Arc::new(Completion::default());
    ctx.remote.pending.lock().unwrap().insert(
        request_id,
        PendingRemote {
            completion: completion.clone(),
            progress,
        },
    );

    let payload = encode_message(&NotifyMessage::AsyncRequest {
        client: ctx.client.clone(),
        request_id,
        op: op.clone(),
    });
    let acks = match ctx.store.notify(ctx.pool, &ctx.header, &payload) {
        Ok(acks) => acks,
        Err(err) => {
            ctx.remote.pending.lock().unwrap().remove(&request_id);
            return Err(err);
        }
    };
    let accepted = acks
        .iter()
        .any(|a| a.client != ctx.client && a.payload.as_deref() == Some(&[ACK_OK]));
    if !accepted {
        ctx.remote.pending.lock().unwrap().remove(&request_id);
        debug!(op = ?op, "no owner accepted delegated request");
        return Err(ImageError::Restart);
    }

    let result = completion.wait_timeout(ctx.config.request_timeout);
    ctx.remote.pending.lock().unwrap().remove(&request_id);
    match result {
        Some(result) => result,
        None => Err(ImageError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_codec_round_trips() {
        let messages = vec![
            NotifyMessage::HeaderUpdate,
            NotifyMessage::AcquiredLock { client: "client.1".into() },
            NotifyMessage::ReleasedLock { client: "client.2".into() },
            NotifyMessage::RequestLock { client: "client.3".into() },
            NotifyMessage::AsyncRequest {
                client: "client.4".into(),
                request_id: 9,
                op: RemoteOp::Resize { size: 1 << 30 },
            },
            NotifyMessage::AsyncRequest {
                client: "client.4".into(),
                request_id: 10,
                op: RemoteOp::SnapCreate { name: "s1".into() },
            },
            NotifyMessage::AsyncProgress {
                client: "client.5".into(),
                request_id: 10,
                offset: 3,
                total: 8,
            },
            NotifyMessage::AsyncComplete {
                client: "client.5".into(),
                request_id: 10,
                result: Ok(()),
            },
            NotifyMessage::AsyncComplete {
                client: "client.5".into(),
                request_id: 11,
                result: Err((6, "held".into())),
            },
        ];
        for msg in messages {
            let raw = encode_message(&msg);
            assert_eq!(decode_message(&raw).unwrap(), msg);
        }
    }

    #[test]
    fn complete_errors_map_back() {
        let err = error_from_code(6, "held".into());
        assert_eq!(err, ImageError::Busy("held".into()));
        let (code, msg) = error_code(&ImageError::NotFound("x".into()));
        assert_eq!(error_from_code(code, msg), ImageError::NotFound("x".into()));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_message(&[]).is_err());
        assert!(decode_message(&[99]).is_err());
    }
}
