//! Trie node representation, wire codec (C3), and in-memory cache (C5).

pub mod cache;
pub mod codec;

pub use cache::NodeCache;
pub use codec::{hash_node, ChildRecord, Hash, Node};
