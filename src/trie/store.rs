//! Node storage: binds the storage pool (C1), node codec (C3), and node
//! cache (C5) into the single read/write surface the trie algorithms (C4)
//! consume. Not named directly in the distilled spec, but required by it:
//! §4.4.2 says "each newly constructed node is appended to the fast ring via
//! C2 and its virtual offset recorded in the parent child record" — this is
//! the bump allocator that makes that append concrete.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::chunk::offset::{ChunkId, ChunkOffset, Sequence, VirtualChunkOffset, PAGE_SIZE};
use crate::chunk::pool::{Ring, StoragePool};
use crate::error::{Result, TrieError};
use crate::node::cache::NodeCache;
use crate::node::codec::Node;

/// Append cursor into the ring currently receiving new node writes. Chunks
/// are filled front-to-back; when a node would not fit in the remaining
/// space the cursor rolls to a freshly advanced chunk.
struct WriteCursor {
    chunk_id: Option<ChunkId>,
    sequence: Sequence,
    next_offset: u64,
}

/// Read/write access to trie nodes, backed by a [`StoragePool`] and fronted
/// by a [`NodeCache`]. One `NodeStore` is shared by the writer and by every
/// reader; only the writer side (`write_node`, `roll_ring`) requires the
/// pool to be writable.
pub struct NodeStore {
    pool: Arc<StoragePool>,
    cache: NodeCache,
    fast: Mutex<WriteCursor>,
    slow: Mutex<WriteCursor>,
}

impl NodeStore {
    pub fn new(pool: Arc<StoragePool>, cache_bytes: usize) -> Self {
        NodeStore {
            pool,
            cache: NodeCache::new(cache_bytes),
            fast: Mutex::new(WriteCursor {
                chunk_id: None,
                sequence: 0,
                next_offset: 0,
            }),
            slow: Mutex::new(WriteCursor {
                chunk_id: None,
                sequence: 0,
                next_offset: 0,
            }),
        }
    }

    pub fn cache(&self) -> &NodeCache {
        &self.cache
    }

    pub fn pool(&self) -> &StoragePool {
        &self.pool
    }

    /// Resolves and decodes the node at `offset`, consulting the cache
    /// first. On a cache miss this performs a blocking read against the
    /// pool: `find`'s child-load step is on the synchronous caller's stack
    /// (a reader walking one key at a time has nothing to overlap a miss
    /// with), so it stays on `FileExt` rather than round-tripping through
    /// `io_uring`'s submit/poll cycle for a single dependent read. The write
    /// path below has no such dependency between node writes within one
    /// batch, so it is the one routed through [`crate::io::engine::IoEngine`]
    /// (via [`crate::chunk::pool::StoragePool::write_via_engine`]).
    ///
    /// The wire format does not carry a chunk generation alongside a child
    /// offset (§4.3), so the current generation is resolved from the pool at
    /// read time. This is sound because compaction always rewrites a node
    /// forward — updating its parent's child record — before the chunk
    /// holding the old copy is recycled (§4.7): a reachable offset for a
    /// live version is therefore always backed by the chunk's current
    /// generation.
    pub fn read_node(&self, offset: ChunkOffset) -> Result<Arc<Node>> {
        let sequence = self.pool.current_sequence(offset.chunk_id).ok_or_else(|| {
            TrieError::corrupt_node(
                VirtualChunkOffset::new(offset, 0),
                "child offset refers to an out-of-range chunk id".to_string(),
            )
        })?;
        let key = VirtualChunkOffset::new(offset, sequence);
        if let Some(node) = self.cache.find(&key) {
            return Ok(node);
        }
        let handle = self.pool.activate_chunk(sequence, offset.chunk_id)?;
        let mut buf = vec![0u8; offset.span_bytes()];
        handle.read_at(offset.byte_offset(), &mut buf)?;
        let node = Arc::new(Node::decode(&buf, 0, offset, self.pool.chunk_size)?);
        self.cache.insert(key, node.clone());
        Ok(node)
    }

    /// Serializes and appends `node` to the given ring, returning the
    /// virtual offset it was written at. Always allocates fresh space (no
    /// in-place update) — nodes are immutable once written, per the
    /// copy-on-write model.
    pub fn write_node(&self, node: &Node, ring: Ring) -> Result<VirtualChunkOffset> {
        self.pool.require_writable()?;
        let chunk_size = self.pool.chunk_size;
        let encoded = node.encode(chunk_size);
        let span_pages = ((encoded.len() + PAGE_SIZE - 1) / PAGE_SIZE).max(1) as u16;
        let span_bytes = span_pages as usize * PAGE_SIZE;
        let mut padded = encoded;
        padded.resize(span_bytes, 0);

        let cursor_lock = match ring {
            Ring::Fast => &self.fast,
            Ring::Slow => &self.slow,
        };
        let mut cursor = cursor_lock.lock();
        if cursor.chunk_id.is_none() || cursor.next_offset + span_bytes as u64 > chunk_size {
            let id = match ring {
                Ring::Fast => self.pool.advance_fast()?,
                Ring::Slow => self.pool.advance_slow()?,
            };
            cursor.chunk_id = Some(id);
            cursor.sequence = self.pool.current_sequence(id).unwrap();
            cursor.next_offset = 0;
        }
        let chunk_id = cursor.chunk_id.unwrap();
        let handle = self.pool.activate_chunk(cursor.sequence, chunk_id)?;
        self.pool.write_via_engine(&handle, cursor.next_offset, &padded)?;
        let offset = ChunkOffset::new(chunk_id, cursor.next_offset, span_pages)?;
        let vco = VirtualChunkOffset::new(offset, cursor.sequence);
        cursor.next_offset += span_bytes as u64;
        drop(cursor);

        self.cache.insert(vco, Arc::new(node.clone()));
        Ok(vco)
    }

    pub fn current_fast_sequence(&self) -> Sequence {
        self.fast.lock().sequence
    }
}
