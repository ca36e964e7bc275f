use bincode::Options;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::*;

/*
 * Things that are stored on disk.
 */
pub trait OnDisk: Serialize + DeserializeOwned {}

/// Serialized size of a context file header (u32 signature + u64 version +
/// u32 per-owner trailer) under `ondisk_options()`.
pub const CTX_HEADER_SIZE: usize = 16;

/// Encoding for every durable context section: fixed-width integers,
/// little-endian.  Varint encoding would save a few bytes but would make the
/// section sizes depend on the values stored in them.
pub fn ondisk_options() -> impl bincode::Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .allow_trailing_bytes()
}

pub fn ondisk_encode_into<T: Serialize>(buf: &mut Vec<u8>, value: &T) {
    // Writing into a Vec cannot fail.
    ondisk_options().serialize_into(&mut *buf, value).unwrap()
}

pub fn ondisk_decode<T: DeserializeOwned>(buf: &[u8]) -> anyhow::Result<T> {
    Ok(ondisk_options().deserialize(buf)?)
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Ord, PartialOrd, Hash)]
pub struct SegmentId(pub u32);
impl OnDisk for SegmentId {}
impl Display for SegmentId {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(f, "{}", self.0)
    }
}
impl SegmentId {
    pub fn as_index(&self) -> usize {
        self.0 as usize
    }

    pub fn next(&self) -> SegmentId {
        SegmentId(self.0 + 1)
    }
}

/// Logical stripe id (LSID) across the array.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Ord, PartialOrd, Hash)]
pub struct StripeId(pub u32);
impl OnDisk for StripeId {}
impl Display for StripeId {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(f, "{}", self.0)
    }
}
impl StripeId {
    pub const UNMAP: StripeId = StripeId(u32::MAX);
}

/// Open-stripe write position: a stripe plus a block offset within it.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub struct VirtualBlockAddr {
    pub stripe_id: StripeId,
    pub offset: u32,
}
impl OnDisk for VirtualBlockAddr {}
impl VirtualBlockAddr {
    pub const UNMAP: VirtualBlockAddr = VirtualBlockAddr {
        stripe_id: StripeId::UNMAP,
        offset: u32::MAX,
    };
}

/// Array geometry, constant after init.  Provided by the partition layer.
#[derive(Debug, Copy, Clone)]
pub struct Geometry {
    pub stripes_per_segment: u32,
    pub blocks_per_stripe: u32,
    pub num_user_segments: u32,
}

impl Geometry {
    pub fn segment_of(&self, lsid: StripeId) -> SegmentId {
        SegmentId(lsid.0 / self.stripes_per_segment)
    }

    pub fn first_stripe_of(&self, segment: SegmentId) -> StripeId {
        StripeId(segment.0 * self.stripes_per_segment)
    }

    pub fn blocks_per_segment(&self) -> u32 {
        self.stripes_per_segment * self.blocks_per_stripe
    }
}
