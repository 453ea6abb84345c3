//! Read-only view (C8): a concurrent reader over a sampled root. Readers
//! never block the writer and never observe a torn root — they sample once
//! and keep working against that snapshot until they choose to re-sample.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{DbError, Result};
use crate::node::codec::Node;
use crate::trie::cursor::{FindOutcome, NodeCursor};
use crate::trie::nibbles::bytes_to_nibbles;
use crate::trie::store::NodeStore;

/// Shared root pointer the writer publishes into and readers sample from.
/// A plain `RwLock<Option<Arc<Node>>>` rather than anything fancier: the
/// critical section around a publish is a pointer swap, not I/O, so there is
/// no benefit to anything more elaborate (§4.8/§5).
pub struct RootPointer {
    root: RwLock<Option<Arc<Node>>>,
    version: AtomicU64,
}

impl RootPointer {
    pub fn new(root: Option<Arc<Node>>, version: u64) -> Self {
        RootPointer {
            root: RwLock::new(root),
            version: AtomicU64::new(version),
        }
    }

    pub fn publish(&self, root: Option<Arc<Node>>, version: u64) {
        *self.root.write() = root;
        self.version.store(version, Ordering::Release);
    }

    /// Takes a shared lock and returns a snapshot: the root pointer plus the
    /// version it was published at. Readers that hold the returned `View`
    /// keep working against this snapshot even if the writer publishes
    /// again — they only see the new root by calling `sample` again.
    pub fn sample(&self) -> View {
        let root = self.root.read().clone();
        let version = self.version.load(Ordering::Acquire);
        View { root, version }
    }
}

/// A read-only snapshot of the trie at the version it was sampled.
#[derive(Clone)]
pub struct View {
    root: Option<Arc<Node>>,
    version: u64,
}

impl View {
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Exposes the sampled root directly to in-crate callers (`Db`) that
    /// need to seed the next `upsert`/compaction call; the public surface
    /// goes through `get`/`get_db` instead.
    pub(crate) fn root_for_writer(&self) -> Option<Arc<Node>> {
        self.root.clone()
    }

    /// Blocking `find` against this snapshot, using the version it was
    /// sampled at rather than whatever `min_version` the writer has moved to
    /// since (the snapshot's own version may have expired between sampling
    /// and calling `get`, which is reported as `VersionExpired` like any
    /// other expired read).
    pub fn get(&self, store: &NodeStore, min_version: &AtomicU64, key: &[u8]) -> Result<Vec<u8>> {
        let key_nibbles = bytes_to_nibbles(key);
        let cursor = match &self.root {
            Some(n) => NodeCursor::root(n.clone()),
            None => NodeCursor::empty(),
        };
        let result = crate::trie::algorithms::find(store, min_version, cursor, &key_nibbles, self.version)?;
        match result.outcome {
            FindOutcome::Success(v) => Ok(v),
            FindOutcome::RootIsNull
            | FindOutcome::KeyMismatch { .. }
            | FindOutcome::BranchMissing { .. }
            | FindOutcome::KeyEndsInsideNode { .. } => Err(crate::error::TrieError::KeyNotFound),
            FindOutcome::VersionExpired => Err(crate::error::TrieError::VersionExpired {
                version: self.version,
                min_version: min_version.load(Ordering::Acquire),
            }),
        }
    }

    /// As [`View::get`] but collapsed to the public [`DbError`] surface.
    pub fn get_db(&self, store: &NodeStore, min_version: &AtomicU64, key: &[u8]) -> std::result::Result<Vec<u8>, DbError> {
        self.get(store, min_version, key).map_err(DbError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::offset::PAGE_SIZE;
    use crate::chunk::pool::StoragePool;
    use crate::trie::algorithms::upsert;
    use crate::trie::update::Update;
    use std::io::Write;

    fn test_store() -> (tempfile::NamedTempFile, NodeStore) {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        let chunk_bytes = PAGE_SIZE as u64 * 8;
        f.write_all(&vec![0u8; (chunk_bytes * 8) as usize]).unwrap();
        f.flush().unwrap();
        let pool = StoragePool::open(&[f.path()], chunk_bytes, 8, false, false).unwrap();
        let store = NodeStore::new(Arc::new(pool), 1 << 20);
        (f, store)
    }

    #[test]
    fn reader_keeps_old_root_until_resample() {
        let (_f, store) = test_store();
        let key = bytes_to_nibbles(&[0xAB]);
        let root1 = upsert(&store, None, vec![Update::write(key.clone(), vec![1], 1)], 1)
            .unwrap()
            .unwrap();
        let pointer = RootPointer::new(Some(root1.clone()), 1);
        let min_version = AtomicU64::new(0);

        let view = pointer.sample();
        let root2 = upsert(&store, Some(root1), vec![Update::write(key.clone(), vec![2], 2)], 2)
            .unwrap()
            .unwrap();
        pointer.publish(Some(root2), 2);

        // the already-sampled view still sees the old value.
        assert_eq!(view.get(&store, &min_version, &[0xAB]).unwrap(), vec![1]);
        let fresh = pointer.sample();
        assert_eq!(fresh.get(&store, &min_version, &[0xAB]).unwrap(), vec![2]);
    }
}
