//! Compaction / expiration (C7): rewrites reachable nodes out of chunks
//! flagged for reclamation, cascading the rewrite to the root, then frees
//! the source chunk.

use std::sync::Arc;

use crate::chunk::offset::ChunkId;
use crate::chunk::pool::{Ring, StoragePool};
use crate::error::Result;
use crate::node::codec::{hash_node, ChildRecord, Node};
use crate::stats::CompactionStats;
use crate::trie::store::NodeStore;

/// Rewrites every node reachable from `root` that lives in `reclaim_chunk`
/// forward into the slow ring, cascading the rewrite to every ancestor on
/// the path (§4.7). Returns the new root (unchanged if nothing in the
/// subtree needed rewriting) so the caller can `publish` it if it differs.
pub fn compact_reachable(
    store: &NodeStore,
    stats: &CompactionStats,
    root: Arc<Node>,
    reclaim_chunk: ChunkId,
) -> Result<Arc<Node>> {
    let (new_root, touched) = rewrite(store, stats, &root, reclaim_chunk)?;
    Ok(if touched { Arc::new(new_root) } else { root })
}

/// Returns `(node, touched)` where `touched` is true if this node or any
/// descendant was rewritten (and therefore the caller must persist a new
/// copy of `node` itself, since its child offsets changed).
///
/// Every child is read and recursed into regardless of which chunk it lives
/// in: the reclaim target is typically the oldest chunk, whose nodes' own
/// parents have long since been rewritten forward into newer chunks, so a
/// live reference into `reclaim_chunk` is generally several levels below the
/// nearest ancestor that itself still lives outside it. Stopping the
/// recursion at the first child not in `reclaim_chunk` would leave any
/// deeper reclaimed node unrewritten and then freed out from under it.
fn rewrite(
    store: &NodeStore,
    stats: &CompactionStats,
    node: &Node,
    reclaim_chunk: ChunkId,
) -> Result<(Node, bool)> {
    let mut new_children = Vec::with_capacity(node.children.len());
    let mut any_touched = false;

    for child in &node.children {
        stats.record_read_io();
        let child_node = store.read_node(child.offset)?;
        let (rewritten_child, descendant_touched) = rewrite(store, stats, &child_node, reclaim_chunk)?;
        let in_reclaim_chunk = child.offset.chunk_id == reclaim_chunk;

        if !in_reclaim_chunk && !descendant_touched {
            new_children.push(child.clone());
            continue;
        }

        let chunk_size = store.pool().chunk_size;
        let bytes = rewritten_child.encode(chunk_size).len() as u64;
        if in_reclaim_chunk {
            stats.record_bytes_before(child.offset.span_bytes() as u64);
        }
        let hash = hash_node(&rewritten_child.encode(chunk_size));
        let vco = store.write_node(&rewritten_child, Ring::Slow)?;
        stats.record_copy_fast_to_slow(bytes);
        new_children.push(ChildRecord::written(vco.offset, hash, Arc::new(rewritten_child)));
        any_touched = true;
    }

    let new_node = Node {
        mask: node.mask,
        path: node.path.clone(),
        value: node.value.clone(),
        children: new_children,
    };
    Ok((new_node, any_touched))
}

/// Runs compaction against the storage pool's current free-list pressure:
/// for every chunk flagged `recycled` that is not yet actually reusable
/// because it's still referenced (the caller determines this by whether
/// `root` still points into it after the fact), rewrites and releases.
/// The simple, synchronous policy named in §4.7: callers invoke this
/// interleaved with writes rather than on a background thread.
pub fn compact_and_release(
    store: &NodeStore,
    stats: &CompactionStats,
    root: Arc<Node>,
    reclaim_chunk: ChunkId,
) -> Result<Arc<Node>> {
    let new_root = compact_reachable(store, stats, root, reclaim_chunk)?;
    store.pool().release_chunk(reclaim_chunk)?;
    Ok(new_root)
}
