//! Node cursors and the structural outcomes of `find` (§4.4.1, §7).

use std::sync::Arc;

use crate::node::codec::Node;

/// A position within the trie: a node plus how many of its own path
/// nibbles have already been consumed matching the key walked so far.
///
/// Returned even on failure outcomes (`KeyMismatch`, `KeyEndsInsideNode`):
/// `upsert`'s structural-repair path depends on receiving the partial
/// cursor, not just an error (see DESIGN NOTES, Open Questions).
#[derive(Clone)]
pub struct NodeCursor {
    pub node: Option<Arc<Node>>,
    pub prefix_index: usize,
}

impl NodeCursor {
    pub fn root(node: Arc<Node>) -> Self {
        NodeCursor {
            node: Some(node),
            prefix_index: 0,
        }
    }

    pub fn empty() -> Self {
        NodeCursor {
            node: None,
            prefix_index: 0,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.node.is_some()
    }
}

/// The structural outcome of a `find` walk, distinct from the collapsed
/// public-surface [`crate::error::DbError`].
#[derive(Debug)]
pub enum FindOutcome {
    /// Key fully consumed; the terminal node holds a value.
    Success(Vec<u8>),
    /// Key fully consumed but the terminal node holds no value at this
    /// depth (over-run past where the key ends).
    KeyEndsInsideNode { prefix_index: usize },
    /// A node's inline path nibble did not match the key at `prefix_index`.
    KeyMismatch { prefix_index: usize },
    /// The child mask had no bit set for the next key nibble.
    BranchMissing { nibble: u8 },
    /// The trie is empty.
    RootIsNull,
    /// The requested version fell below `min_version` partway through the
    /// walk (a child reference could not be resolved because its chunk has
    /// since been recycled below the retained window).
    VersionExpired,
}

pub struct FindResult {
    pub cursor: NodeCursor,
    pub outcome: FindOutcome,
}
