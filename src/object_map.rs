//! Per-object existence bitmap.
//!
//! Two bits per object, one map object per image revision. The map is
//! consulted to skip I/O against objects known to be absent and updated
//! ahead of writes so a crash leaves it pessimistic, never wrong in the
//! dangerous direction.

use crate::error::{ImageError, Result};
use crate::metadata::{self, NO_SNAPC};
use crate::store::ObjectStore;
use crate::types::{PoolId, SnapId, SNAP_HEAD};

/// Existence state of one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectState {
    Nonexistent = 0,
    Exists = 1,
    /// An update (discard, rollback) is in flight; treat as existing.
    Pending = 2,
    /// Exists and is known unchanged since the last snapshot.
    ExistsClean = 3,
}

impl ObjectState {
    fn from_bits(v: u8) -> ObjectState {
        match v & 0b11 {
            0 => ObjectState::Nonexistent,
            1 => ObjectState::Exists,
            2 => ObjectState::Pending,
            _ => ObjectState::ExistsClean,
        }
    }

    /// Whether I/O against the object can be skipped outright.
    pub fn may_exist(self) -> bool {
        self != ObjectState::Nonexistent
    }
}

/// In-memory bitmap for one image revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMap {
    num_objects: u64,
    bits: Vec<u8>,
}

fn bytes_for(num_objects: u64) -> usize {
    (num_objects as usize * 2).div_ceil(8)
}

impl ObjectMap {
    pub fn new(num_objects: u64) -> Self {
        Self {
            num_objects,
            bits: vec![0; bytes_for(num_objects)],
        }
    }

    pub fn len(&self) -> u64 {
        self.num_objects
    }

    pub fn is_empty(&self) -> bool {
        self.num_objects == 0
    }

    pub fn get(&self, object_no: u64) -> ObjectState {
        debug_assert!(object_no < self.num_objects);
        let bit = object_no as usize * 2;
        ObjectState::from_bits(self.bits[bit / 8] >> (bit % 8))
    }

    pub fn set(&mut self, object_no: u64, state: ObjectState) {
        debug_assert!(object_no < self.num_objects);
        let bit = object_no as usize * 2;
        let byte = &mut self.bits[bit / 8];
        *byte = (*byte & !(0b11 << (bit % 8))) | ((state as u8) << (bit % 8));
    }

    pub fn set_range(&mut self, start: u64, end: u64, state: ObjectState) {
        for object_no in start..end.min(self.num_objects) {
            self.set(object_no, state);
        }
    }

    /// Grow (new objects nonexistent) or shrink the map.
    pub fn resize(&mut self, num_objects: u64) {
        let mut next = ObjectMap::new(num_objects);
        for object_no in 0..num_objects.min(self.num_objects) {
            next.set(object_no, self.get(object_no));
        }
        *self = next;
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.bits.len());
        buf.extend_from_slice(&self.num_objects.to_be_bytes());
        buf.extend_from_slice(&self.bits);
        buf
    }

    fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < 8 {
            return Err(ImageError::Corrupt("short object map".into()));
        }
        let num_objects = u64::from_be_bytes(raw[..8].try_into().unwrap());
        let bits = raw[8..].to_vec();
        if bits.len() != bytes_for(num_objects) {
            return Err(ImageError::Corrupt("object map size mismatch".into()));
        }
        Ok(Self { num_objects, bits })
    }
}

pub fn load(
    store: &dyn ObjectStore,
    pool: PoolId,
    image_id: &str,
    snap: SnapId,
) -> Result<ObjectMap> {
    let oid = metadata::object_map_oid(image_id, snap);
    let size = store.stat(pool, &oid, SNAP_HEAD)?;
    let raw = store.read(pool, &oid, SNAP_HEAD, 0, size)?;
    ObjectMap::decode(&raw)
}

pub fn save(
    store: &dyn ObjectStore,
    pool: PoolId,
    image_id: &str,
    snap: SnapId,
    map: &ObjectMap,
) -> Result<()> {
    let oid = metadata::object_map_oid(image_id, snap);
    store.write_full(pool, &oid, &map.encode(), &NO_SNAPC)
}

pub fn remove(store: &dyn ObjectStore, pool: PoolId, image_id: &str, snap: SnapId) -> Result<()> {
    let oid = metadata::object_map_oid(image_id, snap);
    store.remove(pool, &oid, &NO_SNAPC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_pack_and_unpack() {
        let mut map = ObjectMap::new(9);
        assert_eq!(map.get(0), ObjectState::Nonexistent);
        map.set(0, ObjectState::Exists);
        map.set(3, ObjectState::Pending);
        map.set(8, ObjectState::ExistsClean);
        assert_eq!(map.get(0), ObjectState::Exists);
        assert_eq!(map.get(1), ObjectState::Nonexistent);
        assert_eq!(map.get(3), ObjectState::Pending);
        assert_eq!(map.get(8), ObjectState::ExistsClean);
    }

    #[test]
    fn resize_preserves_prefix() {
        let mut map = ObjectMap::new(4);
        map.set(1, ObjectState::Exists);
        map.set(3, ObjectState::Exists);
        map.resize(8);
        assert_eq!(map.len(), 8);
        assert_eq!(map.get(1), ObjectState::Exists);
        assert_eq!(map.get(3), ObjectState::Exists);
        assert_eq!(map.get(7), ObjectState::Nonexistent);
        map.resize(2);
        assert_eq!(map.get(1), ObjectState::Exists);
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut map = ObjectMap::new(100);
        map.set_range(10, 20, ObjectState::Exists);
        let raw = map.encode();
        assert_eq!(ObjectMap::decode(&raw).unwrap(), map);
    }

    #[test]
    fn decode_rejects_size_mismatch() {
        let map = ObjectMap::new(16);
        let mut raw = map.encode();
        raw.truncate(raw.len() - 1);
        assert!(matches!(ObjectMap::decode(&raw), Err(ImageError::Corrupt(_))));
    }
}
