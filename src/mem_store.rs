//! In-memory object store.
//!
//! A process-local stand-in for the real cluster, complete enough to run
//! every control-plane flow: object-level copy-on-write against
//! self-managed snapshot ids, omap with compare-and-set, advisory locks,
//! and watch/notify fan-out. One [`MemCluster`] is shared; each
//! [`MemObjectStore`] obtained from [`MemCluster::connect`] is one client
//! session with its own identity.

use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{ImageError, Result};
use crate::store::{NotifyResponse, ObjectStore, WatchHandler, WatchId};
use crate::types::{LockMode, Locker, PoolId, SnapContext, SnapId, SNAP_HEAD};

#[derive(Clone)]
struct MemClone {
    /// `head_seq` of the data at clone time; the clone serves reads for
    /// snap ids strictly above this.
    written_seq: SnapId,
    /// Newest snap id this clone preserves.
    covers_max: SnapId,
    data: Vec<u8>,
}

#[derive(Default)]
struct MemObject {
    head: Option<Vec<u8>>,
    /// Snap-context sequence of the last head write.
    head_seq: SnapId,
    clones: Vec<MemClone>,
    omap: BTreeMap<String, Bytes>,
    tmap: BTreeMap<String, Bytes>,
    lockers: Vec<LockRecord>,
}

#[derive(Clone)]
struct LockRecord {
    name: String,
    client: u64,
    cookie: String,
    tag: String,
    mode: LockMode,
}

struct PoolState {
    name: String,
    base_tier: PoolId,
    objects: BTreeMap<String, MemObject>,
    snap_seq: SnapId,
    live_snaps: BTreeSet<SnapId>,
}

#[derive(Default)]
struct Pools {
    by_id: BTreeMap<PoolId, PoolState>,
    next_pool: PoolId,
}

struct WatchEntry {
    client: u64,
    handler: Arc<dyn WatchHandler>,
}

#[derive(Default)]
struct ClusterState {
    pools: Mutex<Pools>,
    watches: Mutex<HashMap<(PoolId, String), HashMap<WatchId, WatchEntry>>>,
    next_client: AtomicU64,
    next_watch: AtomicU64,
}

/// Shared in-memory cluster. Cheap to clone.
#[derive(Clone, Default)]
pub struct MemCluster {
    state: Arc<ClusterState>,
}

impl MemCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_pool(&self, name: &str) -> PoolId {
        let mut pools = self.state.pools.lock().unwrap();
        let id = pools.next_pool;
        pools.next_pool += 1;
        pools.by_id.insert(
            id,
            PoolState {
                name: name.to_string(),
                base_tier: id,
                objects: BTreeMap::new(),
                snap_seq: 0,
                live_snaps: BTreeSet::new(),
            },
        );
        id
    }

    /// Create a pool acting as a cache tier over `base`.
    pub fn create_cache_pool(&self, name: &str, base: PoolId) -> PoolId {
        let id = self.create_pool(name);
        let mut pools = self.state.pools.lock().unwrap();
        if let Some(p) = pools.by_id.get_mut(&id) {
            p.base_tier = base;
        }
        id
    }

    /// Open a new client session.
    pub fn connect(&self) -> MemObjectStore {
        let client = self.state.next_client.fetch_add(1, Ordering::Relaxed);
        MemObjectStore {
            state: self.state.clone(),
            client,
        }
    }
}

/// One client session against a [`MemCluster`].
pub struct MemObjectStore {
    state: Arc<ClusterState>,
    client: u64,
}

fn client_name(id: u64) -> String {
    format!("client.{id}")
}

impl MemObjectStore {
    fn with_pool<T>(&self, pool: PoolId, f: impl FnOnce(&mut PoolState) -> Result<T>) -> Result<T> {
        let mut pools = self.state.pools.lock().unwrap();
        let state = pools
            .by_id
            .get_mut(&pool)
            .ok_or_else(|| ImageError::NotFound(format!("pool {pool}")))?;
        f(state)
    }

    fn with_object<T>(
        &self,
        pool: PoolId,
        oid: &str,
        f: impl FnOnce(&mut MemObject) -> Result<T>,
    ) -> Result<T> {
        self.with_pool(pool, |p| {
            let obj = p.objects.entry(oid.to_string()).or_default();
            let out = f(obj);
            if obj.is_empty() {
                p.objects.remove(oid);
            }
            out
        })
    }

    fn with_existing_object<T>(
        &self,
        pool: PoolId,
        oid: &str,
        f: impl FnOnce(&mut MemObject) -> Result<T>,
    ) -> Result<T> {
        self.with_pool(pool, |p| match p.objects.get_mut(oid) {
            Some(obj) => {
                let out = f(obj);
                if obj.is_empty() {
                    p.objects.remove(oid);
                }
                out
            }
            None => Err(ImageError::NotFound(format!("object {oid}"))),
        })
    }
}

impl MemObject {
    fn is_empty(&self) -> bool {
        self.head.is_none()
            && self.clones.is_empty()
            && self.omap.is_empty()
            && self.tmap.is_empty()
            && self.lockers.is_empty()
    }

    /// Preserve the current head before the first write under a newer
    /// snap context.
    fn maybe_clone(&mut self, snapc: &SnapContext) {
        let newest = snapc.snaps.first().copied().unwrap_or(0);
        if newest <= self.head_seq {
            return;
        }
        if let Some(head) = &self.head {
            self.clones.push(MemClone {
                written_seq: self.head_seq,
                covers_max: newest,
                data: head.clone(),
            });
        }
        self.head_seq = snapc.seq.max(newest);
    }

    /// Object content as of snap `s`, if the object existed then.
    fn at_snap(&self, s: SnapId) -> Option<&[u8]> {
        if s == SNAP_HEAD {
            return self.head.as_deref();
        }
        for clone in &self.clones {
            if clone.covers_max >= s {
                if clone.written_seq < s {
                    return Some(&clone.data);
                }
                return None;
            }
        }
        match &self.head {
            Some(head) if self.head_seq < s => Some(head),
            _ => None,
        }
    }
}

fn read_slice(data: &[u8], off: u64, len: u64) -> Bytes {
    if off >= data.len() as u64 {
        return Bytes::new();
    }
    let start = off as usize;
    let end = (off + len).min(data.len() as u64) as usize;
    Bytes::copy_from_slice(&data[start..end])
}

impl ObjectStore for MemObjectStore {
    fn client_id(&self) -> String {
        client_name(self.client)
    }

    fn client_address(&self) -> String {
        format!("mem:{}/0", self.client)
    }

    fn pool_list(&self) -> Result<Vec<(PoolId, String)>> {
        let pools = self.state.pools.lock().unwrap();
        Ok(pools
            .by_id
            .iter()
            .map(|(id, p)| (*id, p.name.clone()))
            .collect())
    }

    fn pool_lookup(&self, name: &str) -> Result<PoolId> {
        let pools = self.state.pools.lock().unwrap();
        pools
            .by_id
            .iter()
            .find(|(_, p)| p.name == name)
            .map(|(id, _)| *id)
            .ok_or_else(|| ImageError::NotFound(format!("pool {name}")))
    }

    fn pool_name(&self, pool: PoolId) -> Result<String> {
        self.with_pool(pool, |p| Ok(p.name.clone()))
    }

    fn base_tier(&self, pool: PoolId) -> Result<PoolId> {
        self.with_pool(pool, |p| Ok(p.base_tier))
    }

    fn wait_for_latest_map(&self) -> Result<()> {
        Ok(())
    }

    fn allocate_snap_id(&self, pool: PoolId) -> Result<SnapId> {
        self.with_pool(pool, |p| {
            p.snap_seq += 1;
            let id = p.snap_seq;
            p.live_snaps.insert(id);
            Ok(id)
        })
    }

    fn release_snap_id(&self, pool: PoolId, snap: SnapId) -> Result<()> {
        self.with_pool(pool, |p| {
            if p.live_snaps.remove(&snap) {
                Ok(())
            } else {
                Err(ImageError::NotFound(format!("snap id {snap}")))
            }
        })
    }

    fn read(&self, pool: PoolId, oid: &str, snap: SnapId, off: u64, len: u64) -> Result<Bytes> {
        self.with_pool(pool, |p| {
            let obj = p
                .objects
                .get(oid)
                .ok_or_else(|| ImageError::NotFound(format!("object {oid}")))?;
            let data = obj
                .at_snap(snap)
                .ok_or_else(|| ImageError::NotFound(format!("object {oid}")))?;
            Ok(read_slice(data, off, len))
        })
    }

    fn write(
        &self,
        pool: PoolId,
        oid: &str,
        off: u64,
        data: &[u8],
        snapc: &SnapContext,
    ) -> Result<()> {
        self.with_object(pool, oid, |obj| {
            obj.maybe_clone(snapc);
            obj.head_seq = obj.head_seq.max(snapc.seq);
            let head = obj.head.get_or_insert_with(Vec::new);
            let end = off as usize + data.len();
            if head.len() < end {
                head.resize(end, 0);
            }
            head[off as usize..end].copy_from_slice(data);
            Ok(())
        })
    }

    fn write_full(&self, pool: PoolId, oid: &str, data: &[u8], snapc: &SnapContext) -> Result<()> {
        self.with_object(pool, oid, |obj| {
            obj.maybe_clone(snapc);
            obj.head_seq = obj.head_seq.max(snapc.seq);
            obj.head = Some(data.to_vec());
            Ok(())
        })
    }

    fn zero(&self, pool: PoolId, oid: &str, off: u64, len: u64, snapc: &SnapContext) -> Result<()> {
        self.with_existing_object(pool, oid, |obj| {
            if obj.head.is_none() {
                return Err(ImageError::NotFound(format!("object {oid}")));
            }
            obj.maybe_clone(snapc);
            obj.head_seq = obj.head_seq.max(snapc.seq);
            let head = obj.head.as_mut().unwrap();
            let start = (off as usize).min(head.len());
            let end = ((off + len) as usize).min(head.len());
            head[start..end].fill(0);
            Ok(())
        })
    }

    fn truncate(&self, pool: PoolId, oid: &str, size: u64, snapc: &SnapContext) -> Result<()> {
        self.with_object(pool, oid, |obj| {
            obj.maybe_clone(snapc);
            obj.head_seq = obj.head_seq.max(snapc.seq);
            let head = obj.head.get_or_insert_with(Vec::new);
            head.resize(size as usize, 0);
            Ok(())
        })
    }

    fn remove(&self, pool: PoolId, oid: &str, snapc: &SnapContext) -> Result<()> {
        self.with_existing_object(pool, oid, |obj| {
            if obj.head.is_none() {
                return Err(ImageError::NotFound(format!("object {oid}")));
            }
            obj.maybe_clone(snapc);
            obj.head = None;
            Ok(())
        })
    }

    fn create_exclusive(&self, pool: PoolId, oid: &str) -> Result<()> {
        self.with_object(pool, oid, |obj| {
            if obj.head.is_some() {
                return Err(ImageError::AlreadyExists(format!("object {oid}")));
            }
            obj.head = Some(Vec::new());
            Ok(())
        })
    }

    fn stat(&self, pool: PoolId, oid: &str, snap: SnapId) -> Result<u64> {
        self.with_pool(pool, |p| {
            let obj = p
                .objects
                .get(oid)
                .ok_or_else(|| ImageError::NotFound(format!("object {oid}")))?;
            let data = obj
                .at_snap(snap)
                .ok_or_else(|| ImageError::NotFound(format!("object {oid}")))?;
            Ok(data.len() as u64)
        })
    }

    fn rollback_object(
        &self,
        pool: PoolId,
        oid: &str,
        snap: SnapId,
        snapc: &SnapContext,
    ) -> Result<()> {
        self.with_existing_object(pool, oid, |obj| {
            let restored = obj.at_snap(snap).map(<[u8]>::to_vec);
            obj.maybe_clone(snapc);
            obj.head_seq = obj.head_seq.max(snapc.seq);
            obj.head = restored;
            Ok(())
        })
    }

    fn flush(&self, _pool: PoolId) -> Result<()> {
        Ok(())
    }

    fn omap_get(&self, pool: PoolId, oid: &str, key: &str) -> Result<Option<Bytes>> {
        self.with_pool(pool, |p| {
            Ok(p.objects.get(oid).and_then(|o| o.omap.get(key).cloned()))
        })
    }

    fn omap_set(&self, pool: PoolId, oid: &str, entries: &[(String, Bytes)]) -> Result<()> {
        self.with_object(pool, oid, |obj| {
            for (k, v) in entries {
                obj.omap.insert(k.clone(), v.clone());
            }
            Ok(())
        })
    }

    fn omap_remove(&self, pool: PoolId, oid: &str, key: &str) -> Result<()> {
        self.with_existing_object(pool, oid, |obj| {
            obj.omap.remove(key);
            Ok(())
        })
    }

    fn omap_list(&self, pool: PoolId, oid: &str, prefix: &str) -> Result<Vec<(String, Bytes)>> {
        self.with_pool(pool, |p| {
            let Some(obj) = p.objects.get(oid) else {
                return Ok(Vec::new());
            };
            Ok(obj
                .omap
                .range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect())
        })
    }

    fn omap_compare_and_set(
        &self,
        pool: PoolId,
        oid: &str,
        key: &str,
        expected: Option<&[u8]>,
        value: Option<&[u8]>,
    ) -> Result<bool> {
        self.with_object(pool, oid, |obj| {
            let current = obj.omap.get(key).map(|b| b.as_ref());
            if current != expected {
                return Ok(false);
            }
            match value {
                Some(v) => {
                    obj.omap.insert(key.to_string(), Bytes::copy_from_slice(v));
                }
                None => {
                    obj.omap.remove(key);
                }
            }
            Ok(true)
        })
    }

    fn tmap_set(&self, pool: PoolId, oid: &str, key: &str, value: &[u8]) -> Result<()> {
        self.with_object(pool, oid, |obj| {
            obj.tmap
                .insert(key.to_string(), Bytes::copy_from_slice(value));
            Ok(())
        })
    }

    fn tmap_remove(&self, pool: PoolId, oid: &str, key: &str) -> Result<()> {
        self.with_existing_object(pool, oid, |obj| {
            obj.tmap
                .remove(key)
                .map(|_| ())
                .ok_or_else(|| ImageError::NotFound(format!("tmap key {key}")))
        })
    }

    fn tmap_list(&self, pool: PoolId, oid: &str) -> Result<Vec<(String, Bytes)>> {
        self.with_pool(pool, |p| {
            let Some(obj) = p.objects.get(oid) else {
                return Ok(Vec::new());
            };
            Ok(obj.tmap.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        })
    }

    fn lock_exclusive(
        &self,
        pool: PoolId,
        oid: &str,
        name: &str,
        cookie: &str,
        tag: &str,
        _description: &str,
    ) -> Result<()> {
        let client = self.client;
        self.with_object(pool, oid, |obj| {
            for l in obj.lockers.iter().filter(|l| l.name == name) {
                if l.client == client && l.cookie == cookie {
                    return Err(ImageError::AlreadyExists("lock".into()));
                }
                return Err(ImageError::Busy("lock held".into()));
            }
            obj.lockers.push(LockRecord {
                name: name.to_string(),
                client,
                cookie: cookie.to_string(),
                tag: tag.to_string(),
                mode: LockMode::Exclusive,
            });
            Ok(())
        })
    }

    fn lock_shared(
        &self,
        pool: PoolId,
        oid: &str,
        name: &str,
        cookie: &str,
        tag: &str,
        _description: &str,
    ) -> Result<()> {
        let client = self.client;
        self.with_object(pool, oid, |obj| {
            for l in obj.lockers.iter().filter(|l| l.name == name) {
                if l.client == client && l.cookie == cookie {
                    return Err(ImageError::AlreadyExists("lock".into()));
                }
                if l.mode == LockMode::Exclusive || l.tag != tag {
                    return Err(ImageError::Busy("lock held".into()));
                }
            }
            obj.lockers.push(LockRecord {
                name: name.to_string(),
                client,
                cookie: cookie.to_string(),
                tag: tag.to_string(),
                mode: LockMode::Shared,
            });
            Ok(())
        })
    }

    fn unlock(&self, pool: PoolId, oid: &str, name: &str, cookie: &str) -> Result<()> {
        let client = self.client;
        self.with_existing_object(pool, oid, |obj| {
            let before = obj.lockers.len();
            obj.lockers
                .retain(|l| !(l.name == name && l.client == client && l.cookie == cookie));
            if obj.lockers.len() == before {
                return Err(ImageError::NotFound("lock".into()));
            }
            Ok(())
        })
    }

    fn break_lock(
        &self,
        pool: PoolId,
        oid: &str,
        name: &str,
        client: &str,
        cookie: &str,
    ) -> Result<()> {
        self.with_existing_object(pool, oid, |obj| {
            let before = obj.lockers.len();
            obj.lockers
                .retain(|l| !(l.name == name && client_name(l.client) == client && l.cookie == cookie));
            if obj.lockers.len() == before {
                return Err(ImageError::NotFound("lock".into()));
            }
            Ok(())
        })
    }

    fn list_lockers(&self, pool: PoolId, oid: &str, name: &str) -> Result<Vec<Locker>> {
        self.with_pool(pool, |p| {
            let Some(obj) = p.objects.get(oid) else {
                return Ok(Vec::new());
            };
            Ok(obj
                .lockers
                .iter()
                .filter(|l| l.name == name)
                .map(|l| Locker {
                    client: client_name(l.client),
                    cookie: l.cookie.clone(),
                    address: format!("mem:{}/0", l.client),
                    tag: l.tag.clone(),
                    mode: l.mode,
                })
                .collect())
        })
    }

    fn watch(&self, pool: PoolId, oid: &str, handler: Arc<dyn WatchHandler>) -> Result<WatchId> {
        let id = self.state.next_watch.fetch_add(1, Ordering::Relaxed);
        let mut watches = self.state.watches.lock().unwrap();
        watches
            .entry((pool, oid.to_string()))
            .or_default()
            .insert(
                id,
                WatchEntry {
                    client: self.client,
                    handler,
                },
            );
        Ok(id)
    }

    fn unwatch(&self, pool: PoolId, oid: &str, watch: WatchId) -> Result<()> {
        let mut watches = self.state.watches.lock().unwrap();
        if let Some(entry) = watches.get_mut(&(pool, oid.to_string())) {
            if entry.remove(&watch).is_some() {
                return Ok(());
            }
        }
        Err(ImageError::NotFound("watch".into()))
    }

    fn notify(&self, pool: PoolId, oid: &str, payload: &[u8]) -> Result<Vec<NotifyResponse>> {
        // Snapshot the watcher list, then call handlers without holding
        // any store lock: handlers re-enter the store.
        let targets: Vec<(u64, Arc<dyn WatchHandler>)> = {
            let watches = self.state.watches.lock().unwrap();
            watches
                .get(&(pool, oid.to_string()))
                .map(|m| m.values().map(|w| (w.client, w.handler.clone())).collect())
                .unwrap_or_default()
        };
        let mut responses = Vec::with_capacity(targets.len());
        for (client, handler) in targets {
            let ack = handler.handle(payload);
            responses.push(NotifyResponse {
                client: client_name(client),
                payload: ack.map(Bytes::from),
            });
        }
        Ok(responses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(seq: SnapId, snaps: &[SnapId]) -> SnapContext {
        SnapContext {
            seq,
            snaps: snaps.to_vec(),
        }
    }

    #[test]
    fn snap_read_sees_preserved_content() {
        let cluster = MemCluster::new();
        let pool = cluster.create_pool("p");
        let store = cluster.connect();

        store.write(pool, "obj", 0, b"old", &ctx(0, &[])).unwrap();
        let snap = store.allocate_snap_id(pool).unwrap();
        store
            .write(pool, "obj", 0, b"new", &ctx(snap, &[snap]))
            .unwrap();

        assert_eq!(&store.read(pool, "obj", snap, 0, 8).unwrap()[..], b"old");
        assert_eq!(&store.read(pool, "obj", SNAP_HEAD, 0, 8).unwrap()[..], b"new");
    }

    #[test]
    fn object_created_after_snap_is_absent_at_snap() {
        let cluster = MemCluster::new();
        let pool = cluster.create_pool("p");
        let store = cluster.connect();

        let snap = store.allocate_snap_id(pool).unwrap();
        store
            .write(pool, "obj", 0, b"data", &ctx(snap, &[snap]))
            .unwrap();

        assert!(store.read(pool, "obj", snap, 0, 4).unwrap_err().is_not_found());
    }

    #[test]
    fn rollback_restores_snap_content() {
        let cluster = MemCluster::new();
        let pool = cluster.create_pool("p");
        let store = cluster.connect();

        store.write(pool, "obj", 0, b"aaaa", &ctx(0, &[])).unwrap();
        let snap = store.allocate_snap_id(pool).unwrap();
        let c = ctx(snap, &[snap]);
        store.write(pool, "obj", 0, b"bbbb", &c).unwrap();

        store.rollback_object(pool, "obj", snap, &c).unwrap();
        assert_eq!(&store.read(pool, "obj", SNAP_HEAD, 0, 4).unwrap()[..], b"aaaa");
    }

    #[test]
    fn compare_and_set_enforces_precondition() {
        let cluster = MemCluster::new();
        let pool = cluster.create_pool("p");
        let store = cluster.connect();

        assert!(store
            .omap_compare_and_set(pool, "obj", "k", None, Some(b"v1"))
            .unwrap());
        assert!(!store
            .omap_compare_and_set(pool, "obj", "k", None, Some(b"v2"))
            .unwrap());
        assert!(store
            .omap_compare_and_set(pool, "obj", "k", Some(b"v1"), Some(b"v2"))
            .unwrap());
        assert_eq!(
            store.omap_get(pool, "obj", "k").unwrap().as_deref(),
            Some(&b"v2"[..])
        );
    }

    #[test]
    fn exclusive_lock_conflicts() {
        let cluster = MemCluster::new();
        let pool = cluster.create_pool("p");
        let a = cluster.connect();
        let b = cluster.connect();

        a.lock_exclusive(pool, "hdr", "l", "c1", "", "").unwrap();
        let err = b.lock_exclusive(pool, "hdr", "l", "c2", "", "").unwrap_err();
        assert!(matches!(err, ImageError::Busy(_)));

        a.unlock(pool, "hdr", "l", "c1").unwrap();
        b.lock_exclusive(pool, "hdr", "l", "c2", "", "").unwrap();
        assert_eq!(b.list_lockers(pool, "hdr", "l").unwrap().len(), 1);
    }
}
