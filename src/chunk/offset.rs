//! Chunk identifiers and on-disk/virtual offsets.
//!
//! An on-disk offset packs a 48-bit byte offset, a 15-bit "spare" page-span
//! count, and a 1-bit flag into a single `u64` (see §4.3 of the wire format).
//! A [`VirtualChunkOffset`] additionally carries the chunk's sequence number
//! so that stale references from superseded metadata can be detected once the
//! physical chunk has been recycled and reused for a new generation.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrieError};

/// Disk page size. All I/O is a multiple of one page.
pub const PAGE_SIZE: usize = 4096;

/// Sequential identifier of a physical chunk within the pool.
pub type ChunkId = u32;

/// Monotonically increasing generation counter for a chunk.
pub type Sequence = u64;

const SPARE_BITS: u32 = 15;
const OFFSET_BITS: u32 = 48;
const MAX_DISK_OFFSET: u64 = (1u64 << OFFSET_BITS) - 1;
const MAX_SPARE_PAGES: u16 = (1u16 << SPARE_BITS) - 1;

/// `{chunk_id, byte_offset_within_chunk}` plus the page-span ("spare")
/// recorded alongside it on disk.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkOffset {
    pub chunk_id: ChunkId,
    byte_offset: u64,
    /// Number of 4 KiB pages that must be read to fully materialize the
    /// node that starts at this offset (1..=2^15).
    spare_pages: u16,
}

impl ChunkOffset {
    /// A distinguished value meaning "no node here" (the empty-trie root).
    pub const NULL: ChunkOffset = ChunkOffset {
        chunk_id: ChunkId::MAX,
        byte_offset: u64::MAX,
        spare_pages: 0,
    };

    pub fn new(chunk_id: ChunkId, byte_offset: u64, span_pages: u16) -> Result<Self> {
        if byte_offset > MAX_DISK_OFFSET {
            return Err(TrieError::corrupt_node(
                VirtualChunkOffset::invalid(),
                format!("byte offset {} exceeds 48-bit field", byte_offset),
            ));
        }
        if span_pages == 0 || span_pages > MAX_SPARE_PAGES {
            return Err(TrieError::corrupt_node(
                VirtualChunkOffset::invalid(),
                format!("node span {} pages exceeds 15-bit spare field", span_pages),
            ));
        }
        Ok(ChunkOffset {
            chunk_id,
            byte_offset,
            spare_pages: span_pages,
        })
    }

    pub fn is_null(&self) -> bool {
        *self == ChunkOffset::NULL
    }

    pub fn byte_offset(&self) -> u64 {
        self.byte_offset
    }

    pub fn span_pages(&self) -> u16 {
        self.spare_pages
    }

    /// Number of bytes spanned by the node starting at this offset, rounded
    /// up to a whole number of pages.
    pub fn span_bytes(&self) -> usize {
        self.spare_pages as usize * PAGE_SIZE
    }

    /// Packs `(chunk_id, byte_offset, spare_pages)` into the 63-bit on-disk
    /// field described in §4.3 (48 bits offset, 15 bits spare; the high flag
    /// bit is reserved by the node codec for the child "present" marker and
    /// is not part of this packing). The 48-bit `disk_offset` is a *global*
    /// byte offset into the pool's flattened chunk address space
    /// (`chunk_id * chunk_size + byte_offset`), not an offset relative to
    /// `chunk_id` alone — a child record otherwise has no way to name which
    /// chunk it lives in, since the wire format carries no separate
    /// `chunk_id` field per child.
    pub fn pack(&self, chunk_size: u64) -> u64 {
        let global = self.chunk_id as u64 * chunk_size + self.byte_offset;
        debug_assert!(global <= MAX_DISK_OFFSET, "global offset exceeds 48-bit field; pool capacity (total_chunks * chunk_size) must stay under 2^48 bytes");
        (global & MAX_DISK_OFFSET) | ((self.spare_pages as u64) << OFFSET_BITS)
    }

    /// Inverse of [`ChunkOffset::pack`]: splits the global offset back into
    /// `(chunk_id, byte_offset)` using the same `chunk_size` the pool was
    /// opened with.
    pub fn unpack(chunk_size: u64, packed: u64) -> Result<Self> {
        let global = packed & MAX_DISK_OFFSET;
        let spare_pages = (packed >> OFFSET_BITS) as u16;
        let chunk_id = (global / chunk_size) as ChunkId;
        let byte_offset = global % chunk_size;
        ChunkOffset::new(chunk_id, byte_offset, spare_pages)
    }
}

impl fmt::Debug for ChunkOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "ChunkOffset(null)")
        } else {
            write!(
                f,
                "ChunkOffset(chunk={}, off={}, pages={})",
                self.chunk_id, self.byte_offset, self.spare_pages
            )
        }
    }
}

/// A [`ChunkOffset`] plus the chunk's sequence number at the time the
/// reference was taken. Used as the node cache key and as the authoritative
/// reference a reader resolves: if the chunk has since been recycled to a
/// newer generation, the sequence number mismatch is detected before any
/// stale bytes are read.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct VirtualChunkOffset {
    pub offset: ChunkOffset,
    pub sequence: Sequence,
}

impl VirtualChunkOffset {
    pub fn new(offset: ChunkOffset, sequence: Sequence) -> Self {
        VirtualChunkOffset { offset, sequence }
    }

    /// Sentinel used as the "empty slot" key in the node cache's backing
    /// array, mirroring `virtual_chunk_offset_t::invalid_value()`.
    pub fn invalid() -> Self {
        VirtualChunkOffset {
            offset: ChunkOffset::NULL,
            sequence: Sequence::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.offset.is_null()
    }
}

impl fmt::Debug for VirtualChunkOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}@seq{}", self.offset, self.sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_round_trips() {
        let chunk_size = 1u64 << 20;
        let off = ChunkOffset::new(7, 123_456, 3).unwrap();
        let packed = off.pack(chunk_size);
        let back = ChunkOffset::unpack(chunk_size, packed).unwrap();
        assert_eq!(off, back);
    }

    #[test]
    fn pack_unpack_recovers_chunk_id_different_from_caller_context() {
        // the packed field carries no chunk_id of its own; unpacking must
        // recover it purely from the global offset, regardless of whatever
        // chunk a caller happens to be decoding relative to.
        let chunk_size = 65_536u64;
        let off = ChunkOffset::new(42, 1024, 1).unwrap();
        let packed = off.pack(chunk_size);
        let back = ChunkOffset::unpack(chunk_size, packed).unwrap();
        assert_eq!(back.chunk_id, 42);
        assert_eq!(back.byte_offset(), 1024);
    }

    #[test]
    fn rejects_oversized_span() {
        assert!(ChunkOffset::new(0, 0, (1u16 << 15)).is_err());
    }

    #[test]
    fn null_is_distinguished() {
        assert!(ChunkOffset::NULL.is_null());
        assert!(!ChunkOffset::new(0, 0, 1).unwrap().is_null());
    }
}
