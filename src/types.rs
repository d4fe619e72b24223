//! Shared types for images, snapshots, parents and lockers.

use bitflags::bitflags;
use std::fmt;
use std::time::Duration;

/// Pool identifier inside the object store.
pub type PoolId = u64;

/// Snapshot identifier, monotonically assigned by the object store per
/// pool.
pub type SnapId = u64;

/// Sentinel snap id naming the writable head revision.
pub const SNAP_HEAD: SnapId = u64::MAX;

/// Smallest accepted object size exponent (4 KiB objects).
pub const MIN_ORDER: u8 = 12;
/// Largest accepted object size exponent (32 MiB objects).
pub const MAX_ORDER: u8 = 25;
/// Default object size exponent (4 MiB objects).
pub const DEFAULT_ORDER: u8 = 22;

bitflags! {
    /// Image feature bits. Incompatible bits outside [`Features::SUPPORTED`]
    /// cause open to fail.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Features: u64 {
        /// Image may participate in parent/child layering.
        const LAYERING = 1 << 0;
        /// Striping parameters beyond the canonical layout.
        const STRIPING_V2 = 1 << 1;
        /// Cooperative exclusive lock on the header object.
        const EXCLUSIVE_LOCK = 1 << 2;
        /// Per-object existence bitmap.
        const OBJECT_MAP = 1 << 3;
        /// Object-map assisted diffing.
        const FAST_DIFF = 1 << 4;
    }
}

impl Features {
    /// Every bit this build understands.
    pub const SUPPORTED: Features = Features::all();

    /// Bits that may be toggled after creation.
    pub const MUTABLE: Features = Features::EXCLUSIVE_LOCK
        .union(Features::OBJECT_MAP)
        .union(Features::FAST_DIFF);

    /// Enforce the implication chain
    /// `FAST_DIFF ⇒ OBJECT_MAP ⇒ EXCLUSIVE_LOCK`.
    pub fn validate(self) -> std::result::Result<(), &'static str> {
        if self.contains(Features::FAST_DIFF) && !self.contains(Features::OBJECT_MAP) {
            return Err("fast-diff requires object-map");
        }
        if self.contains(Features::OBJECT_MAP) && !self.contains(Features::EXCLUSIVE_LOCK) {
            return Err("object-map requires exclusive-lock");
        }
        Ok(())
    }
}

bitflags! {
    /// Per-image and per-snapshot flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ImageFlags: u64 {
        const OBJECT_MAP_INVALID = 1 << 0;
        const FAST_DIFF_INVALID = 1 << 1;
    }
}

/// On-disk layout generation of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    /// Fixed header blob, no features, no layering.
    Legacy,
    /// Omap-backed header with features, snapshots and layering.
    Modern,
}

/// Identity of a clone parent: a snapshot of an image, possibly in
/// another pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParentSpec {
    pub pool: PoolId,
    pub image_id: String,
    pub snap_id: SnapId,
}

impl fmt::Display for ParentSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.pool, self.image_id, self.snap_id)
    }
}

/// Parent edge as stored on a child: the parent identity plus the number
/// of leading child bytes that still read through to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentInfo {
    pub spec: ParentSpec,
    pub overlap: u64,
}

/// Snapshot clone-protection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionStatus {
    Unprotected,
    Unprotecting,
    Protected,
}

impl ProtectionStatus {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            ProtectionStatus::Unprotected => 0,
            ProtectionStatus::Unprotecting => 1,
            ProtectionStatus::Protected => 2,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ProtectionStatus::Unprotected),
            1 => Some(ProtectionStatus::Unprotecting),
            2 => Some(ProtectionStatus::Protected),
            _ => None,
        }
    }
}

/// One snapshot as mirrored in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapInfo {
    pub id: SnapId,
    pub name: String,
    /// Image size at creation time; rollback restores to this.
    pub size: u64,
    /// Parent edge at creation time, if any.
    pub parent: Option<ParentInfo>,
    pub protection: ProtectionStatus,
    pub flags: ImageFlags,
}

/// Ordered list of snapshot ids tagging writes for object-level
/// copy-on-write. `seq` is the newest id ever issued for the image;
/// `snaps` lists live ids newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapContext {
    pub seq: SnapId,
    pub snaps: Vec<SnapId>,
}

impl SnapContext {
    /// A context is well-formed when `seq` dominates all ids and the ids
    /// are strictly descending.
    pub fn is_valid(&self) -> bool {
        if let Some(&first) = self.snaps.first() {
            if self.seq < first {
                return false;
            }
        }
        self.snaps.windows(2).all(|w| w[0] > w[1])
    }
}

/// Which revision of the image a context reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapSelection {
    Head,
    Snap(SnapId),
}

impl SnapSelection {
    pub fn is_head(self) -> bool {
        matches!(self, SnapSelection::Head)
    }
}

/// Advisory lock mode on the header object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Exclusive,
    Shared,
}

/// One holder of the header advisory lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locker {
    /// Store-assigned client identity.
    pub client: String,
    pub cookie: String,
    pub address: String,
    pub tag: String,
    pub mode: LockMode,
}

/// Creation-time image parameters.
#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub format: ImageFormat,
    pub order: u8,
    /// Ignored for legacy images.
    pub features: Features,
    pub stripe_unit: u64,
    pub stripe_count: u64,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            format: ImageFormat::Modern,
            order: DEFAULT_ORDER,
            features: Features::LAYERING | Features::EXCLUSIVE_LOCK,
            stripe_unit: 0,
            stripe_count: 0,
        }
    }
}

/// Runtime knobs for an open image.
#[derive(Debug, Clone)]
pub struct Config {
    /// Concurrency bound for long management walks (trim, flatten,
    /// rollback, rebuild).
    pub concurrent_management_ops: usize,
    /// Suppress the zero-fill case of discard for partial object extents.
    pub skip_partial_discard: bool,
    /// Deadline for one remote request round-trip.
    pub request_timeout: Duration,
    /// Remote request retries before a timeout is surfaced.
    pub request_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrent_management_ops: 10,
            skip_partial_discard: false,
            request_timeout: Duration::from_secs(5),
            request_retries: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_implications() {
        assert!(Features::LAYERING.validate().is_ok());
        assert!((Features::EXCLUSIVE_LOCK | Features::OBJECT_MAP)
            .validate()
            .is_ok());
        assert!(Features::OBJECT_MAP.validate().is_err());
        assert!((Features::FAST_DIFF | Features::OBJECT_MAP | Features::EXCLUSIVE_LOCK)
            .validate()
            .is_ok());
        assert!((Features::FAST_DIFF | Features::EXCLUSIVE_LOCK).validate().is_err());
    }

    #[test]
    fn snap_context_validity() {
        assert!(SnapContext::default().is_valid());
        let c = SnapContext { seq: 5, snaps: vec![5, 3, 1] };
        assert!(c.is_valid());
        let c = SnapContext { seq: 4, snaps: vec![5, 3] };
        assert!(!c.is_valid());
        let c = SnapContext { seq: 6, snaps: vec![3, 3] };
        assert!(!c.is_valid());
    }
}
