//! Codec client for persisted image metadata.
//!
//! Everything the core persists lives in a handful of well-known objects
//! per pool: the directory, the children set, and per image an id
//! object, a header object and one object map per revision. The modern
//! header is omap-backed; the legacy header is a fixed byte blob with a
//! text signature.

use bytes::Bytes;

use crate::error::{ImageError, Result};
use crate::store::ObjectStore;
use crate::types::{
    Features, ImageFlags, ParentInfo, ParentSpec, PoolId, ProtectionStatus, SnapContext, SnapId,
    SNAP_HEAD,
};

pub const DIRECTORY_OID: &str = "img_directory";
pub const CHILDREN_OID: &str = "img_children";
pub const ID_PREFIX: &str = "img_id.";
pub const HEADER_PREFIX: &str = "img_header.";
pub const OBJECT_MAP_PREFIX: &str = "img_object_map.";
pub const DATA_PREFIX: &str = "img_data.";
pub const LEGACY_HEADER_SUFFIX: &str = ".img_head";
pub const HEADER_LOCK_NAME: &str = "img_lock";

/// Snap context writes and metadata updates carry no snapshot tagging of
/// their own.
pub const NO_SNAPC: SnapContext = SnapContext {
    seq: 0,
    snaps: Vec::new(),
};

pub fn id_oid(name: &str) -> String {
    format!("{ID_PREFIX}{name}")
}

pub fn header_oid(id: &str) -> String {
    format!("{HEADER_PREFIX}{id}")
}

pub fn legacy_header_oid(name: &str) -> String {
    format!("{name}{LEGACY_HEADER_SUFFIX}")
}

pub fn object_map_oid(id: &str, snap: SnapId) -> String {
    if snap == SNAP_HEAD {
        format!("{OBJECT_MAP_PREFIX}{id}")
    } else {
        format!("{OBJECT_MAP_PREFIX}{id}.{snap:016x}")
    }
}

pub fn data_object_prefix(id: &str) -> String {
    format!("{DATA_PREFIX}{id}.")
}

pub fn data_oid(prefix: &str, object_no: u64) -> String {
    format!("{prefix}{object_no:016x}")
}

// --- value codec helpers ---

fn dec_u64(b: &[u8]) -> Result<u64> {
    let arr: [u8; 8] = b
        .try_into()
        .map_err(|_| ImageError::Corrupt("bad u64 value".into()))?;
    Ok(u64::from_be_bytes(arr))
}

fn dec_u8(b: &[u8]) -> Result<u8> {
    match b {
        [v] => Ok(*v),
        _ => Err(ImageError::Corrupt("bad u8 value".into())),
    }
}

pub(crate) fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_be_bytes());
}

pub(crate) fn take_u64(cur: &mut &[u8]) -> Result<u64> {
    if cur.len() < 8 {
        return Err(ImageError::Corrupt("short metadata value".into()));
    }
    let (head, rest) = cur.split_at(8);
    *cur = rest;
    dec_u64(head)
}

pub(crate) fn put_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

pub(crate) fn take_str(cur: &mut &[u8]) -> Result<String> {
    if cur.len() < 4 {
        return Err(ImageError::Corrupt("short metadata value".into()));
    }
    let (head, rest) = cur.split_at(4);
    let len = u32::from_be_bytes(head.try_into().unwrap()) as usize;
    if rest.len() < len {
        return Err(ImageError::Corrupt("short metadata value".into()));
    }
    let (s, rest) = rest.split_at(len);
    *cur = rest;
    String::from_utf8(s.to_vec()).map_err(|_| ImageError::Corrupt("non-utf8 name".into()))
}

// --- directory ---

fn dir_name_key(name: &str) -> String {
    format!("name_{name}")
}

fn dir_id_key(id: &str) -> String {
    format!("id_{id}")
}

pub fn dir_lookup_id(store: &dyn ObjectStore, pool: PoolId, name: &str) -> Result<Option<String>> {
    match store.omap_get(pool, DIRECTORY_OID, &dir_name_key(name))? {
        Some(v) => Ok(Some(
            String::from_utf8(v.to_vec()).map_err(|_| ImageError::Corrupt("non-utf8 id".into()))?,
        )),
        None => Ok(None),
    }
}

/// Register `name -> id` and `id -> name`, failing when the name is
/// already taken.
pub fn dir_add_image(store: &dyn ObjectStore, pool: PoolId, name: &str, id: &str) -> Result<()> {
    let claimed = store.omap_compare_and_set(
        pool,
        DIRECTORY_OID,
        &dir_name_key(name),
        None,
        Some(id.as_bytes()),
    )?;
    if !claimed {
        return Err(ImageError::AlreadyExists(name.to_string()));
    }
    store.omap_set(
        pool,
        DIRECTORY_OID,
        &[(dir_id_key(id), Bytes::copy_from_slice(name.as_bytes()))],
    )
}

pub fn dir_remove_image(store: &dyn ObjectStore, pool: PoolId, name: &str, id: &str) -> Result<()> {
    store.omap_remove(pool, DIRECTORY_OID, &dir_name_key(name))?;
    store.omap_remove(pool, DIRECTORY_OID, &dir_id_key(id))
}

pub fn dir_rename_image(
    store: &dyn ObjectStore,
    pool: PoolId,
    from: &str,
    to: &str,
    id: &str,
) -> Result<()> {
    let claimed = store.omap_compare_and_set(
        pool,
        DIRECTORY_OID,
        &dir_name_key(to),
        None,
        Some(id.as_bytes()),
    )?;
    if !claimed {
        return Err(ImageError::AlreadyExists(to.to_string()));
    }
    store.omap_remove(pool, DIRECTORY_OID, &dir_name_key(from))?;
    store.omap_set(
        pool,
        DIRECTORY_OID,
        &[(dir_id_key(id), Bytes::copy_from_slice(to.as_bytes()))],
    )
}

/// Modern images from the directory omap plus legacy images from the
/// directory tmap.
pub fn dir_list(store: &dyn ObjectStore, pool: PoolId) -> Result<Vec<String>> {
    let mut names: Vec<String> = store
        .omap_list(pool, DIRECTORY_OID, "name_")?
        .into_iter()
        .map(|(k, _)| k["name_".len()..].to_string())
        .collect();
    for (name, _) in store.tmap_list(pool, DIRECTORY_OID)? {
        names.push(name);
    }
    names.sort();
    Ok(names)
}

pub fn dir_add_legacy(store: &dyn ObjectStore, pool: PoolId, name: &str) -> Result<()> {
    if !store.tmap_list(pool, DIRECTORY_OID)?.iter().all(|(n, _)| n != name) {
        return Err(ImageError::AlreadyExists(name.to_string()));
    }
    store.tmap_set(pool, DIRECTORY_OID, name, legacy_header_oid(name).as_bytes())
}

pub fn dir_remove_legacy(store: &dyn ObjectStore, pool: PoolId, name: &str) -> Result<()> {
    store.tmap_remove(pool, DIRECTORY_OID, name)
}

// --- modern header ---

const KEY_SIZE: &str = "size";
const KEY_ORDER: &str = "order";
const KEY_FEATURES: &str = "features";
const KEY_INCOMPAT: &str = "incompat_features";
const KEY_FLAGS: &str = "flags";
const KEY_OBJECT_PREFIX: &str = "object_prefix";
const KEY_STRIPE_UNIT: &str = "stripe_unit";
const KEY_STRIPE_COUNT: &str = "stripe_count";
const KEY_SNAPC: &str = "snapc";
const KEY_PARENT: &str = "parent";
const SNAP_KEY_PREFIX: &str = "snapshot_";

fn snap_key(id: SnapId) -> String {
    format!("{SNAP_KEY_PREFIX}{id:016x}")
}

/// Mutable header state read in one pass at refresh time.
#[derive(Debug, Clone)]
pub struct HeaderState {
    pub size: u64,
    pub order: u8,
    pub features: Features,
    pub incompatible: u64,
    pub flags: ImageFlags,
    pub object_prefix: String,
    pub stripe_unit: u64,
    pub stripe_count: u64,
    pub snapc: SnapContext,
    pub parent: Option<ParentInfo>,
}

fn require(value: Option<Bytes>, key: &str) -> Result<Bytes> {
    value.ok_or_else(|| ImageError::Corrupt(format!("header missing {key}")))
}

pub fn write_header(
    store: &dyn ObjectStore,
    pool: PoolId,
    id: &str,
    size: u64,
    order: u8,
    features: Features,
    stripe_unit: u64,
    stripe_count: u64,
) -> Result<()> {
    let oid = header_oid(id);
    store.create_exclusive(pool, &oid)?;
    let mut snapc = Vec::new();
    encode_snapc(&mut snapc, &SnapContext::default());
    store.omap_set(
        pool,
        &oid,
        &[
            (KEY_SIZE.into(), Bytes::copy_from_slice(&size.to_be_bytes())),
            (KEY_ORDER.into(), Bytes::copy_from_slice(&[order])),
            (
                KEY_FEATURES.into(),
                Bytes::copy_from_slice(&features.bits().to_be_bytes()),
            ),
            (
                KEY_INCOMPAT.into(),
                Bytes::copy_from_slice(&features.bits().to_be_bytes()),
            ),
            (KEY_FLAGS.into(), Bytes::copy_from_slice(&0u64.to_be_bytes())),
            (
                KEY_OBJECT_PREFIX.into(),
                Bytes::copy_from_slice(data_object_prefix(id).as_bytes()),
            ),
            (
                KEY_STRIPE_UNIT.into(),
                Bytes::copy_from_slice(&stripe_unit.to_be_bytes()),
            ),
            (
                KEY_STRIPE_COUNT.into(),
                Bytes::copy_from_slice(&stripe_count.to_be_bytes()),
            ),
            (KEY_SNAPC.into(), Bytes::from(snapc)),
        ],
    )
}

pub fn read_header(store: &dyn ObjectStore, pool: PoolId, id: &str) -> Result<HeaderState> {
    let oid = header_oid(id);
    if store.stat(pool, &oid, SNAP_HEAD).is_err() {
        return Err(ImageError::NotFound(format!("image {id}")));
    }
    let size = dec_u64(&require(store.omap_get(pool, &oid, KEY_SIZE)?, KEY_SIZE)?)?;
    let order = dec_u8(&require(store.omap_get(pool, &oid, KEY_ORDER)?, KEY_ORDER)?)?;
    let features_bits = dec_u64(&require(store.omap_get(pool, &oid, KEY_FEATURES)?, KEY_FEATURES)?)?;
    let incompatible = dec_u64(&require(store.omap_get(pool, &oid, KEY_INCOMPAT)?, KEY_INCOMPAT)?)?;
    let flags = match store.omap_get(pool, &oid, KEY_FLAGS)? {
        Some(v) => dec_u64(&v)?,
        None => 0,
    };
    let object_prefix = String::from_utf8(
        require(store.omap_get(pool, &oid, KEY_OBJECT_PREFIX)?, KEY_OBJECT_PREFIX)?.to_vec(),
    )
    .map_err(|_| ImageError::Corrupt("non-utf8 object prefix".into()))?;
    let stripe_unit = dec_u64(&require(
        store.omap_get(pool, &oid, KEY_STRIPE_UNIT)?,
        KEY_STRIPE_UNIT,
    )?)?;
    let stripe_count = dec_u64(&require(
        store.omap_get(pool, &oid, KEY_STRIPE_COUNT)?,
        KEY_STRIPE_COUNT,
    )?)?;
    let snapc = decode_snapc(&require(store.omap_get(pool, &oid, KEY_SNAPC)?, KEY_SNAPC)?)?;
    let parent = match store.omap_get(pool, &oid, KEY_PARENT)? {
        Some(v) => Some(decode_parent(&v)?),
        None => None,
    };
    Ok(HeaderState {
        size,
        order,
        features: Features::from_bits_truncate(features_bits),
        incompatible,
        flags: ImageFlags::from_bits_truncate(flags),
        object_prefix,
        stripe_unit,
        stripe_count,
        snapc,
        parent,
    })
}

pub fn set_size(store: &dyn ObjectStore, pool: PoolId, id: &str, size: u64) -> Result<()> {
    store.omap_set(
        pool,
        &header_oid(id),
        &[(KEY_SIZE.into(), Bytes::copy_from_slice(&size.to_be_bytes()))],
    )
}

pub fn set_features(
    store: &dyn ObjectStore,
    pool: PoolId,
    id: &str,
    features: Features,
) -> Result<()> {
    let bits = Bytes::copy_from_slice(&features.bits().to_be_bytes());
    store.omap_set(
        pool,
        &header_oid(id),
        &[(KEY_FEATURES.into(), bits.clone()), (KEY_INCOMPAT.into(), bits)],
    )
}

pub fn set_flags(store: &dyn ObjectStore, pool: PoolId, id: &str, flags: ImageFlags) -> Result<()> {
    store.omap_set(
        pool,
        &header_oid(id),
        &[(
            KEY_FLAGS.into(),
            Bytes::copy_from_slice(&flags.bits().to_be_bytes()),
        )],
    )
}

pub fn set_parent(
    store: &dyn ObjectStore,
    pool: PoolId,
    id: &str,
    parent: &ParentInfo,
) -> Result<()> {
    let mut buf = Vec::new();
    put_u64(&mut buf, parent.spec.pool);
    put_str(&mut buf, &parent.spec.image_id);
    put_u64(&mut buf, parent.spec.snap_id);
    put_u64(&mut buf, parent.overlap);
    store.omap_set(pool, &header_oid(id), &[(KEY_PARENT.into(), Bytes::from(buf))])
}

pub fn remove_parent(store: &dyn ObjectStore, pool: PoolId, id: &str) -> Result<()> {
    store.omap_remove(pool, &header_oid(id), KEY_PARENT)
}

fn decode_parent(v: &[u8]) -> Result<ParentInfo> {
    let mut cur = v;
    let pool = take_u64(&mut cur)?;
    let image_id = take_str(&mut cur)?;
    let snap_id = take_u64(&mut cur)?;
    let overlap = take_u64(&mut cur)?;
    Ok(ParentInfo {
        spec: ParentSpec {
            pool,
            image_id,
            snap_id,
        },
        overlap,
    })
}

fn encode_snapc(buf: &mut Vec<u8>, snapc: &SnapContext) {
    put_u64(buf, snapc.seq);
    buf.extend_from_slice(&(snapc.snaps.len() as u32).to_be_bytes());
    for id in &snapc.snaps {
        put_u64(buf, *id);
    }
}

fn decode_snapc(v: &[u8]) -> Result<SnapContext> {
    let mut cur = v;
    let seq = take_u64(&mut cur)?;
    if cur.len() < 4 {
        return Err(ImageError::Corrupt("short snap context".into()));
    }
    let (head, mut rest) = cur.split_at(4);
    let count = u32::from_be_bytes(head.try_into().unwrap()) as usize;
    let mut snaps = Vec::with_capacity(count);
    for _ in 0..count {
        snaps.push(take_u64(&mut rest)?);
    }
    Ok(SnapContext { seq, snaps })
}

// --- per-snapshot records ---

#[derive(Debug, Clone)]
pub struct SnapRecord {
    pub name: String,
    pub size: u64,
    pub parent: Option<ParentInfo>,
    pub protection: ProtectionStatus,
    pub flags: ImageFlags,
}

fn encode_snap_record(rec: &SnapRecord) -> Vec<u8> {
    let mut buf = Vec::new();
    put_str(&mut buf, &rec.name);
    put_u64(&mut buf, rec.size);
    buf.push(rec.protection.to_u8());
    put_u64(&mut buf, rec.flags.bits());
    match &rec.parent {
        Some(p) => {
            buf.push(1);
            put_u64(&mut buf, p.spec.pool);
            put_str(&mut buf, &p.spec.image_id);
            put_u64(&mut buf, p.spec.snap_id);
            put_u64(&mut buf, p.overlap);
        }
        None => buf.push(0),
    }
    buf
}

fn decode_snap_record(v: &[u8]) -> Result<SnapRecord> {
    let mut cur = v;
    let name = take_str(&mut cur)?;
    let size = take_u64(&mut cur)?;
    let (prot, rest) = cur
        .split_first()
        .ok_or_else(|| ImageError::Corrupt("short snapshot record".into()))?;
    cur = rest;
    let protection = ProtectionStatus::from_u8(*prot)
        .ok_or_else(|| ImageError::Corrupt("bad protection status".into()))?;
    let flags = ImageFlags::from_bits_truncate(take_u64(&mut cur)?);
    let (has_parent, rest) = cur
        .split_first()
        .ok_or_else(|| ImageError::Corrupt("short snapshot record".into()))?;
    cur = rest;
    let parent = if *has_parent != 0 {
        let pool = take_u64(&mut cur)?;
        let image_id = take_str(&mut cur)?;
        let snap_id = take_u64(&mut cur)?;
        let overlap = take_u64(&mut cur)?;
        Some(ParentInfo {
            spec: ParentSpec {
                pool,
                image_id,
                snap_id,
            },
            overlap,
        })
    } else {
        None
    };
    Ok(SnapRecord {
        name,
        size,
        parent,
        protection,
        flags,
    })
}

/// Register a snapshot on the header: record plus snap-context update.
pub fn add_snap(
    store: &dyn ObjectStore,
    pool: PoolId,
    header: &str,
    snap_id: SnapId,
    rec: &SnapRecord,
    snapc: &SnapContext,
) -> Result<()> {
    let mut buf = Vec::new();
    encode_snapc(&mut buf, snapc);
    store.omap_set(
        pool,
        header,
        &[
            (snap_key(snap_id), Bytes::from(encode_snap_record(rec))),
            (KEY_SNAPC.into(), Bytes::from(buf)),
        ],
    )
}

pub fn remove_snap(
    store: &dyn ObjectStore,
    pool: PoolId,
    header: &str,
    snap_id: SnapId,
    snapc: &SnapContext,
) -> Result<()> {
    let mut buf = Vec::new();
    encode_snapc(&mut buf, snapc);
    store.omap_set(pool, header, &[(KEY_SNAPC.into(), Bytes::from(buf))])?;
    store.omap_remove(pool, header, &snap_key(snap_id))
}

/// Read one snapshot record; `NotFound` means the snapshot vanished
/// between the snap-context read and this one.
pub fn read_snap(
    store: &dyn ObjectStore,
    pool: PoolId,
    header: &str,
    snap_id: SnapId,
) -> Result<SnapRecord> {
    match store.omap_get(pool, header, &snap_key(snap_id))? {
        Some(v) => decode_snap_record(&v),
        None => Err(ImageError::NotFound(format!("snap {snap_id}"))),
    }
}

pub fn write_snap(
    store: &dyn ObjectStore,
    pool: PoolId,
    header: &str,
    snap_id: SnapId,
    rec: &SnapRecord,
) -> Result<()> {
    store.omap_set(
        pool,
        header,
        &[(snap_key(snap_id), Bytes::from(encode_snap_record(rec)))],
    )
}

// --- user metadata (copied to clones) ---

const META_KEY_PREFIX: &str = "meta_";

pub fn meta_set(store: &dyn ObjectStore, pool: PoolId, id: &str, key: &str, value: &[u8]) -> Result<()> {
    store.omap_set(
        pool,
        &header_oid(id),
        &[(format!("{META_KEY_PREFIX}{key}"), Bytes::copy_from_slice(value))],
    )
}

pub fn meta_get(store: &dyn ObjectStore, pool: PoolId, id: &str, key: &str) -> Result<Option<Bytes>> {
    store.omap_get(pool, &header_oid(id), &format!("{META_KEY_PREFIX}{key}"))
}

pub fn meta_list(store: &dyn ObjectStore, pool: PoolId, id: &str) -> Result<Vec<(String, Bytes)>> {
    Ok(store
        .omap_list(pool, &header_oid(id), META_KEY_PREFIX)?
        .into_iter()
        .map(|(k, v)| (k[META_KEY_PREFIX.len()..].to_string(), v))
        .collect())
}

// --- children set ---

fn children_key(spec: &ParentSpec) -> String {
    format!("child_{:016x}_{}_{:016x}", spec.pool, spec.image_id, spec.snap_id)
}

fn encode_children(children: &[(PoolId, String)]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(children.len() as u32).to_be_bytes());
    for (pool, id) in children {
        put_u64(&mut buf, *pool);
        put_str(&mut buf, id);
    }
    buf
}

fn decode_children(v: &[u8]) -> Result<Vec<(PoolId, String)>> {
    let mut cur = v;
    if cur.len() < 4 {
        return Err(ImageError::Corrupt("short children entry".into()));
    }
    let (head, rest) = cur.split_at(4);
    cur = rest;
    let count = u32::from_be_bytes(head.try_into().unwrap()) as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let pool = take_u64(&mut cur)?;
        let id = take_str(&mut cur)?;
        out.push((pool, id));
    }
    Ok(out)
}

/// Add a child under the parent spec in `children_pool`'s children set.
/// Compare-and-update loop; concurrent updaters retry against the fresh
/// value.
pub fn add_child(
    store: &dyn ObjectStore,
    children_pool: PoolId,
    spec: &ParentSpec,
    child_pool: PoolId,
    child_id: &str,
) -> Result<()> {
    let key = children_key(spec);
    loop {
        let current = store.omap_get(children_pool, CHILDREN_OID, &key)?;
        let mut children = match &current {
            Some(v) => decode_children(v)?,
            None => Vec::new(),
        };
        if children.iter().any(|(p, id)| *p == child_pool && id == child_id) {
            return Ok(());
        }
        children.push((child_pool, child_id.to_string()));
        let updated = encode_children(&children);
        if store.omap_compare_and_set(
            children_pool,
            CHILDREN_OID,
            &key,
            current.as_deref(),
            Some(&updated),
        )? {
            return Ok(());
        }
    }
}

pub fn remove_child(
    store: &dyn ObjectStore,
    children_pool: PoolId,
    spec: &ParentSpec,
    child_pool: PoolId,
    child_id: &str,
) -> Result<()> {
    let key = children_key(spec);
    loop {
        let current = store.omap_get(children_pool, CHILDREN_OID, &key)?;
        let Some(v) = &current else {
            return Err(ImageError::NotFound("child entry".into()));
        };
        let mut children = decode_children(v)?;
        let before = children.len();
        children.retain(|(p, id)| !(*p == child_pool && id == child_id));
        if children.len() == before {
            return Err(ImageError::NotFound("child entry".into()));
        }
        let replacement = if children.is_empty() {
            None
        } else {
            Some(encode_children(&children))
        };
        if store.omap_compare_and_set(
            children_pool,
            CHILDREN_OID,
            &key,
            current.as_deref(),
            replacement.as_deref(),
        )? {
            return Ok(());
        }
    }
}

pub fn list_children(
    store: &dyn ObjectStore,
    children_pool: PoolId,
    spec: &ParentSpec,
) -> Result<Vec<(PoolId, String)>> {
    match store.omap_get(children_pool, CHILDREN_OID, &children_key(spec))? {
        Some(v) => decode_children(&v),
        None => Ok(Vec::new()),
    }
}

// --- legacy header blob ---

pub const LEGACY_SIGNATURE: &[u8; 24] = b"blockimg legacy image v1";
const LEGACY_VERSION: u32 = 1;
const LEGACY_HEADER_LEN: usize = 88;

/// Fixed-layout legacy header: signature, version, 24-byte block name,
/// image size, options triple (order, crypt, comp), snap bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyHeader {
    pub block_name: String,
    pub image_size: u64,
    pub order: u8,
    pub snap_seq: u64,
    pub snap_count: u32,
    pub snap_names_len: u64,
}

impl LegacyHeader {
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.block_name.len() > 24 {
            return Err(ImageError::Invalid("block name too long".into()));
        }
        let mut buf = Vec::with_capacity(LEGACY_HEADER_LEN);
        buf.extend_from_slice(LEGACY_SIGNATURE);
        buf.extend_from_slice(&LEGACY_VERSION.to_be_bytes());
        let mut name = [0u8; 24];
        name[..self.block_name.len()].copy_from_slice(self.block_name.as_bytes());
        buf.extend_from_slice(&name);
        buf.extend_from_slice(&self.image_size.to_be_bytes());
        buf.push(self.order);
        buf.push(0); // crypt_type: none
        buf.push(0); // comp_type: none
        buf.push(0);
        buf.extend_from_slice(&self.snap_seq.to_be_bytes());
        buf.extend_from_slice(&self.snap_count.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes()); // reserved
        buf.extend_from_slice(&self.snap_names_len.to_be_bytes());
        debug_assert_eq!(buf.len(), LEGACY_HEADER_LEN);
        Ok(buf)
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < LEGACY_HEADER_LEN || &raw[..24] != LEGACY_SIGNATURE {
            return Err(ImageError::Corrupt("unrecognized legacy header".into()));
        }
        let version = u32::from_be_bytes(raw[24..28].try_into().unwrap());
        if version != LEGACY_VERSION {
            return Err(ImageError::Corrupt(format!(
                "unrecognized legacy header version {version}"
            )));
        }
        let name_end = raw[28..52].iter().position(|b| *b == 0).unwrap_or(24);
        let block_name = String::from_utf8(raw[28..28 + name_end].to_vec())
            .map_err(|_| ImageError::Corrupt("non-utf8 block name".into()))?;
        let image_size = u64::from_be_bytes(raw[52..60].try_into().unwrap());
        let order = raw[60];
        let snap_seq = u64::from_be_bytes(raw[64..72].try_into().unwrap());
        let snap_count = u32::from_be_bytes(raw[72..76].try_into().unwrap());
        let snap_names_len = u64::from_be_bytes(raw[80..88].try_into().unwrap());
        Ok(Self {
            block_name,
            image_size,
            order,
            snap_seq,
            snap_count,
            snap_names_len,
        })
    }
}

pub fn read_legacy_header(store: &dyn ObjectStore, pool: PoolId, name: &str) -> Result<LegacyHeader> {
    let raw = store.read(
        pool,
        &legacy_header_oid(name),
        SNAP_HEAD,
        0,
        LEGACY_HEADER_LEN as u64,
    )?;
    LegacyHeader::decode(&raw)
}

pub fn write_legacy_header(
    store: &dyn ObjectStore,
    pool: PoolId,
    name: &str,
    header: &LegacyHeader,
) -> Result<()> {
    store.write_full(pool, &legacy_header_oid(name), &header.encode()?, &NO_SNAPC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem_store::MemCluster;

    #[test]
    fn legacy_header_round_trip() {
        let hdr = LegacyHeader {
            block_name: "blk.0.1".into(),
            image_size: 1 << 30,
            order: 22,
            snap_seq: 7,
            snap_count: 2,
            snap_names_len: 11,
        };
        let raw = hdr.encode().unwrap();
        assert_eq!(LegacyHeader::decode(&raw).unwrap(), hdr);
    }

    #[test]
    fn legacy_header_rejects_bad_signature() {
        let hdr = LegacyHeader {
            block_name: "b".into(),
            image_size: 0,
            order: 22,
            snap_seq: 0,
            snap_count: 0,
            snap_names_len: 0,
        };
        let mut raw = hdr.encode().unwrap();
        raw[0] ^= 0xFF;
        assert!(matches!(
            LegacyHeader::decode(&raw),
            Err(ImageError::Corrupt(_))
        ));
    }

    #[test]
    fn directory_add_conflicts_on_name() {
        let cluster = MemCluster::new();
        let pool = cluster.create_pool("p");
        let store = cluster.connect();
        dir_add_image(&store, pool, "img", "id1").unwrap();
        let err = dir_add_image(&store, pool, "img", "id2").unwrap_err();
        assert!(matches!(err, ImageError::AlreadyExists(_)));
        assert_eq!(dir_lookup_id(&store, pool, "img").unwrap().as_deref(), Some("id1"));
    }

    #[test]
    fn children_set_add_remove() {
        let cluster = MemCluster::new();
        let pool = cluster.create_pool("p");
        let store = cluster.connect();
        let spec = ParentSpec {
            pool,
            image_id: "pid".into(),
            snap_id: 4,
        };
        add_child(&store, pool, &spec, pool, "c1").unwrap();
        add_child(&store, pool, &spec, pool, "c2").unwrap();
        // Re-adding is a no-op.
        add_child(&store, pool, &spec, pool, "c1").unwrap();
        assert_eq!(list_children(&store, pool, &spec).unwrap().len(), 2);

        remove_child(&store, pool, &spec, pool, "c1").unwrap();
        remove_child(&store, pool, &spec, pool, "c2").unwrap();
        assert!(list_children(&store, pool, &spec).unwrap().is_empty());
        assert!(remove_child(&store, pool, &spec, pool, "c2").unwrap_err().is_not_found());
    }

    #[test]
    fn snap_records_round_trip() {
        let cluster = MemCluster::new();
        let pool = cluster.create_pool("p");
        let store = cluster.connect();
        write_header(&store, pool, "id1", 1 << 26, 22, Features::LAYERING, 0, 0).unwrap();

        let header = header_oid("id1");
        let rec = SnapRecord {
            name: "s1".into(),
            size: 1 << 26,
            parent: None,
            protection: ProtectionStatus::Unprotected,
            flags: ImageFlags::empty(),
        };
        let snapc = SnapContext { seq: 3, snaps: vec![3] };
        add_snap(&store, pool, &header, 3, &rec, &snapc).unwrap();

        let state = read_header(&store, pool, "id1").unwrap();
        assert_eq!(state.snapc.snaps, vec![3]);
        let back = read_snap(&store, pool, &header, 3).unwrap();
        assert_eq!(back.name, "s1");

        remove_snap(&store, pool, &header, 3, &SnapContext { seq: 3, snaps: vec![] }).unwrap();
        assert!(read_snap(&store, pool, &header, 3).unwrap_err().is_not_found());
    }
}
