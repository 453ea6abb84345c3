//! Chunk-level storage primitives (C1): identifiers, offsets, and the pool
//! that owns backing devices.

pub mod offset;
pub mod pool;

pub use offset::{ChunkId, ChunkOffset, Sequence, VirtualChunkOffset, PAGE_SIZE};
pub use pool::{ChunkHandle, Ring, StoragePool};
