//! Layout of the shared segment.
//!
//! The segment holds two communicator blocks of `comm_size` bytes each.
//! Block 0 carries host-to-accelerator traffic, block 1 the reverse.
//!
//! ```text
//! Communicator block:
//! +--------------------+ 0
//! | sender_flags  u32  |
//! | receiver_flags u32 |
//! +--------------------+ 8
//! | last_put      i64  |
//! +--------------------+ 16
//! | last_get      i64  |
//! +--------------------+ 24
//! | mailbox: N x u64   |
//! +--------------------+ 24 + 8N
//! | payload data area  |
//! +--------------------+ comm_size
//! ```

use crate::error::{Error, Result};
use crate::mailbox::{MAX_LEN, MAX_OFFSET};

pub const SENDER_FLAGS_OFFSET: usize = 0;
pub const RECEIVER_FLAGS_OFFSET: usize = 4;
pub const LAST_PUT_OFFSET: usize = 8;
pub const LAST_GET_OFFSET: usize = 16;
pub const MAILBOX_OFFSET: usize = 24;

/// Default number of mailbox slots per communicator.
pub const DEFAULT_SLOTS: u32 = 256;
/// Default size of one communicator block (64 MiB).
pub const DEFAULT_COMM_SIZE: usize = 64 << 20;

/// Sizes of the two communicator blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    slots: u32,
    comm_size: usize,
}

impl Geometry {
    /// Validates `slots` (a power of two) and `comm_size`.
    pub fn new(slots: u32, comm_size: usize) -> Result<Self> {
        if !slots.is_power_of_two() {
            return Err(Error::Config(format!(
                "slot count {slots} is not a power of two"
            )));
        }
        if !comm_size.is_multiple_of(8) {
            return Err(Error::Config(format!(
                "communicator size {comm_size} is not 8-byte aligned"
            )));
        }
        let geo = Self { slots, comm_size };
        if comm_size <= geo.data_offset() {
            return Err(Error::Config(format!(
                "communicator size {comm_size} leaves no room for data behind {slots} slots"
            )));
        }
        if geo.data_len() > MAX_OFFSET + 1 {
            return Err(Error::Config(format!(
                "data area of {} bytes exceeds the slot offset field",
                geo.data_len()
            )));
        }
        Ok(geo)
    }

    #[inline]
    pub fn slots(&self) -> u32 {
        self.slots
    }

    #[inline]
    pub fn comm_size(&self) -> usize {
        self.comm_size
    }

    /// Slot index of a request id.
    #[inline]
    pub fn slot_of(&self, req: i64) -> usize {
        (req as u64 & (self.slots as u64 - 1)) as usize
    }

    /// Offset of slot `slot` within a block.
    #[inline]
    pub fn mailbox_offset(&self, slot: usize) -> usize {
        debug_assert!(slot < self.slots as usize);
        MAILBOX_OFFSET + slot * 8
    }

    /// Offset of the data area within a block.
    #[inline]
    pub fn data_offset(&self) -> usize {
        MAILBOX_OFFSET + self.slots as usize * 8
    }

    /// Size of the data area of one block.
    #[inline]
    pub fn data_len(&self) -> usize {
        self.comm_size - self.data_offset()
    }

    /// Largest single payload the data area and slot word can carry.
    #[inline]
    pub fn max_payload(&self) -> usize {
        self.data_len().min(MAX_LEN)
    }

    /// Bytes of the full segment.
    #[inline]
    pub fn region_size(&self) -> usize {
        2 * self.comm_size
    }

    /// Offset of block `index` (0 or 1) within the segment.
    #[inline]
    pub fn block_offset(&self, index: usize) -> usize {
        debug_assert!(index < 2);
        index * self.comm_size
    }
}

/// Rounds `n` up to a multiple of eight.
#[inline]
pub const fn align8(n: usize) -> usize {
    (n + 7) & !7
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_geometry() {
        let geo = Geometry::new(DEFAULT_SLOTS, DEFAULT_COMM_SIZE).unwrap();
        assert_eq!(geo.data_offset(), 24 + 256 * 8);
        assert_eq!(geo.data_len(), (64 << 20) - 24 - 2048);
        assert_eq!(geo.region_size(), 128 << 20);
        assert_eq!(geo.block_offset(1), 64 << 20);
        assert_eq!(geo.slot_of(257), 1);
        assert_eq!(geo.slot_of(255), 255);
    }

    #[test]
    fn test_rejects_bad_geometry() {
        assert!(Geometry::new(100, 1 << 20).is_err());
        assert!(Geometry::new(256, 1000 + 4).is_err());
        assert!(Geometry::new(256, 24 + 256 * 8).is_err());
    }

    #[test]
    fn test_align8() {
        assert_eq!(align8(0), 0);
        assert_eq!(align8(1), 8);
        assert_eq!(align8(8), 8);
        assert_eq!(align8(4097), 4104);
    }
}
