//! Virtual offsets into a BGZF-compressed stream.

use std::fmt;

use noodles_bgzf as bgzf;

/// A 64-bit random-access pointer into a block-compressed stream.
///
/// Packs `(compressed_block_offset << 16) | intra_block_offset`. The packing
/// makes the type totally ordered in stream order, so offsets can be compared
/// and used directly as seek targets.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct VirtualOffset(u64);

impl VirtualOffset {
    /// The smallest possible offset (start of stream).
    pub const MIN: Self = Self(0);

    /// Build an offset from a compressed block position and an offset within
    /// the uncompressed block.
    #[must_use]
    pub const fn new(compressed: u64, intra_block: u16) -> Self {
        Self((compressed << 16) | intra_block as u64)
    }

    /// The byte offset of the compressed block in the file.
    #[must_use]
    pub const fn compressed(self) -> u64 {
        self.0 >> 16
    }

    /// The offset within the uncompressed block.
    #[must_use]
    pub const fn intra_block(self) -> u16 {
        (self.0 & 0xffff) as u16
    }
}

impl From<u64> for VirtualOffset {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<VirtualOffset> for u64 {
    fn from(offset: VirtualOffset) -> Self {
        offset.0
    }
}

impl From<bgzf::VirtualPosition> for VirtualOffset {
    fn from(pos: bgzf::VirtualPosition) -> Self {
        Self(u64::from(pos))
    }
}

impl From<VirtualOffset> for bgzf::VirtualPosition {
    fn from(offset: VirtualOffset) -> Self {
        bgzf::VirtualPosition::from(offset.0)
    }
}

impl fmt::Display for VirtualOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.compressed(), self.intra_block())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packing_round_trip() {
        let vo = VirtualOffset::new(0x1234_5678, 0x9abc);
        assert_eq!(vo.compressed(), 0x1234_5678);
        assert_eq!(vo.intra_block(), 0x9abc);
        assert_eq!(VirtualOffset::from(u64::from(vo)), vo);
    }

    #[test]
    fn test_ordering_follows_stream_order() {
        let a = VirtualOffset::new(100, 0);
        let b = VirtualOffset::new(100, 1);
        let c = VirtualOffset::new(101, 0);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(VirtualOffset::MIN, VirtualOffset::new(0, 0));
    }

    #[test]
    fn test_bgzf_conversion() {
        let vo = VirtualOffset::new(4096, 17);
        let pos = bgzf::VirtualPosition::from(vo);
        assert_eq!(pos.compressed(), 4096);
        assert_eq!(pos.uncompressed(), 17);
        assert_eq!(VirtualOffset::from(pos), vo);
    }

    #[test]
    fn test_display() {
        assert_eq!(VirtualOffset::new(42, 7).to_string(), "42:7");
    }
}
