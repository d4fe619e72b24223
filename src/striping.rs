//! Mapping of image byte extents onto object extents.
//!
//! The heavy-duty striping math lives outside the core; this module
//! defines the seam plus the canonical layout used when no custom
//! mapper is supplied.

use crate::error::{ImageError, Result};

/// One piece of an image I/O landing inside a single object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectExtent {
    /// Object number within the image's data-object namespace.
    pub object_no: u64,
    /// Byte offset inside the object.
    pub offset: u64,
    pub length: u64,
    /// Offset of this piece inside the caller's buffer.
    pub buffer_offset: u64,
}

/// Maps image extents to object extents.
pub trait ExtentMapper: Send + Sync {
    fn object_size(&self) -> u64;

    /// Split `[offset, offset+length)` into per-object pieces, in image
    /// order.
    fn map_extents(&self, offset: u64, length: u64) -> Vec<ObjectExtent>;

    /// Number of objects that may hold data for an image of `size` bytes.
    fn object_count(&self, size: u64) -> u64;
}

/// The built-in layout. `stripe_unit == object_size && stripe_count == 1`
/// is the canonical unstriped case; other values follow the round-robin
/// stripe layout.
#[derive(Debug, Clone)]
pub struct Striper {
    object_size: u64,
    stripe_unit: u64,
    stripe_count: u64,
}

impl Striper {
    pub fn new(order: u8, stripe_unit: u64, stripe_count: u64) -> Result<Self> {
        let object_size = 1u64 << order;
        // Zeroed parameters select the canonical layout.
        let stripe_unit = if stripe_unit == 0 { object_size } else { stripe_unit };
        let stripe_count = if stripe_count == 0 { 1 } else { stripe_count };
        if stripe_unit > object_size || object_size % stripe_unit != 0 {
            return Err(ImageError::Invalid(format!(
                "stripe unit {stripe_unit} incompatible with object size {object_size}"
            )));
        }
        Ok(Self {
            object_size,
            stripe_unit,
            stripe_count,
        })
    }

    fn locate(&self, offset: u64) -> (u64, u64) {
        let su = self.stripe_unit;
        let sc = self.stripe_count;
        let stripes_per_object = self.object_size / su;

        let block_no = offset / su;
        let stripe_no = block_no / sc;
        let stripe_pos = block_no % sc;
        let object_set = stripe_no / stripes_per_object;
        let object_no = object_set * sc + stripe_pos;
        let object_off = (stripe_no % stripes_per_object) * su + offset % su;
        (object_no, object_off)
    }
}

impl ExtentMapper for Striper {
    fn object_size(&self) -> u64 {
        self.object_size
    }

    fn map_extents(&self, offset: u64, length: u64) -> Vec<ObjectExtent> {
        let mut extents: Vec<ObjectExtent> = Vec::new();
        let mut pos = offset;
        let end = offset + length;
        while pos < end {
            let (object_no, object_off) = self.locate(pos);
            // Stop at the next stripe-unit boundary.
            let unit_remaining = self.stripe_unit - pos % self.stripe_unit;
            let len = unit_remaining.min(end - pos);
            match extents.last_mut() {
                Some(last)
                    if last.object_no == object_no
                        && last.offset + last.length == object_off
                        && last.buffer_offset + last.length == pos - offset =>
                {
                    last.length += len;
                }
                _ => extents.push(ObjectExtent {
                    object_no,
                    offset: object_off,
                    length: len,
                    buffer_offset: pos - offset,
                }),
            }
            pos += len;
        }
        extents
    }

    fn object_count(&self, size: u64) -> u64 {
        if size == 0 {
            return 0;
        }
        let su = self.stripe_unit;
        let sc = self.stripe_count;
        let set_bytes = self.object_size * sc;
        let full_sets = size / set_bytes;
        let tail = size - full_sets * set_bytes;
        let tail_blocks = tail.div_ceil(su);
        full_sets * sc + tail_blocks.min(sc)
    }
}
