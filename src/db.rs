//! Top-level database surface: wires the storage pool (C1), node store
//! (C3+C5), trie algorithms (C4), metadata (C6), compaction (C7), and
//! read-only view (C8) together, collapsing the internal [`TrieError`]
//! taxonomy to [`DbError`] at this boundary (§7).

use std::sync::Arc;

use crate::chunk::offset::ChunkId;
use crate::chunk::pool::StoragePool;
use crate::compaction::compact_and_release;
use crate::config::Config;
use crate::error::{DbError, TrieError};
use crate::metadata::Metadata;
use crate::node::codec::Node;
use crate::stats::{CompactionSnapshot, CompactionStats};
use crate::trie::algorithms::{find, upsert};
use crate::trie::cursor::{FindOutcome, NodeCursor};
use crate::trie::nibbles::bytes_to_nibbles;
use crate::trie::store::NodeStore;
use crate::trie::update::Update;
use crate::view::{RootPointer, View};

/// Fixed chunk id reserved for the metadata block. `StoragePool::open`
/// excludes chunk 0 from its free list, so `advance_fast`/`advance_slow`
/// never hand it out for node storage.
const METADATA_CHUNK_ID: ChunkId = 0;

pub struct Db {
    pool: Arc<StoragePool>,
    store: NodeStore,
    metadata: Metadata,
    root: RootPointer,
    compaction_stats: CompactionStats,
    config: Config,
}

impl Db {
    /// Opens (creating the backing devices' content if empty) a database
    /// per `config`. The metadata block lives on a reserved chunk id; the
    /// returned `Db`'s root pointer is seeded from whatever `Metadata::open`
    /// resolves (`None` for a brand-new database).
    pub fn open(config: Config) -> Result<Self, DbError> {
        config.validate().map_err(DbError::from)?;
        let pool = Arc::new(
            StoragePool::open(
                &config.device_paths,
                config.chunk_size,
                config.total_chunks,
                config.open_read_only,
                !config.open_read_only,
            )
            .map_err(DbError::from)?,
        );
        pool.enable_write_engines(
            config.ring_entries,
            config.enable_io_polling,
            config.sq_thread_cpu,
            config.write_buffers,
            config.write_size,
        );

        let (metadata, root_offset) = Metadata::open(
            &pool,
            METADATA_CHUNK_ID,
            !config.open_read_only,
            config.history_length,
        )
        .map_err(DbError::from)?;
        let store = NodeStore::new(pool.clone(), config.node_cache_bytes);

        let root_node = match root_offset {
            Some(offset) => Some(store.read_node(offset).map_err(DbError::from)?),
            None => None,
        };
        let root = RootPointer::new(root_node, metadata.current_version());

        log::info!(
            "opened database at version {} (min_version {}), {} free chunks",
            metadata.current_version(),
            metadata.min_version(),
            pool.free_chunk_count()
        );

        Ok(Db {
            pool,
            store,
            metadata,
            root,
            compaction_stats: CompactionStats::default(),
            config,
        })
    }

    /// A read-only snapshot of the current root, for concurrent lookups
    /// (§4.8). Cheap: one `RwLock` read plus an `Arc` clone.
    pub fn view(&self) -> View {
        self.root.sample()
    }

    /// `find(root(version), key)` collapsed to the public error surface
    /// (§4.4.1, §7). Walks the root that was current *as of* `version`
    /// (resolved from the in-memory history `Metadata` retains), not the
    /// current trie — a query for an older, still-retained version must see
    /// that version's own value, not whatever the key holds today.
    pub fn get(&self, key: &[u8], version: u64) -> Result<Vec<u8>, DbError> {
        self.metadata.verify_version(version).map_err(DbError::from)?;
        let key_nibbles = bytes_to_nibbles(key);
        let cursor = match self.metadata.root_offset_for_version(version) {
            Some((offset, _sequence)) => {
                let node = self.store.read_node(offset).map_err(DbError::from)?;
                NodeCursor::root(node)
            }
            None => NodeCursor::empty(),
        };
        let result = find(&self.store, self.metadata.min_version_atomic(), cursor, &key_nibbles, version)
            .map_err(DbError::from)?;
        match result.outcome {
            FindOutcome::Success(v) => Ok(v),
            FindOutcome::VersionExpired => Err(DbError::VersionExpired {
                version,
                min_version: self.metadata.min_version(),
            }),
            _ => Err(DbError::KeyNotFound),
        }
    }

    /// Applies one version's batch of updates and commits it: `upsert` then
    /// `publish` under the dirty-bit protocol (§4.4.2, §4.4.3). The writer
    /// is expected to hold this `&mut Db` for the duration — the `&mut`
    /// receiver is the concrete form of "the writer holds the unique lock
    /// for the entire batch" (§5) for the synchronous API; the pipelined
    /// async variant would thread the same invariant through its own
    /// executor instead.
    pub fn commit(&mut self, updates: Vec<Update>, version: u64) -> Result<(), DbError> {
        if self.config.open_read_only {
            return Err(DbError::from(TrieError::ReadOnly));
        }
        let current_root = view_root(&self.root.sample());
        let new_root = upsert(&self.store, current_root, updates, version).map_err(DbError::from)?;

        let min_version = self.retained_min_version(version);
        let root_offset = match &new_root {
            Some(node) => {
                let vco = self.store.write_node(node, crate::chunk::pool::Ring::Fast).map_err(DbError::from)?;
                Some((vco.offset, vco.sequence))
            }
            None => None,
        };

        match root_offset {
            Some((offset, sequence)) => {
                self.metadata
                    .publish(&self.pool, version, offset, sequence, min_version)
                    .map_err(DbError::from)?;
            }
            None => {
                log::debug!("committing empty trie at version {}", version);
            }
        }
        self.metadata.expire_below(min_version);
        self.root.publish(new_root, version);
        Ok(())
    }

    /// Retained window per `history_length`: versions older than
    /// `version - history_length + 1` are expired (§4.6).
    fn retained_min_version(&self, version: u64) -> u64 {
        version.saturating_sub(self.config.history_length - 1)
    }

    /// Runs compaction for one reclaim-flagged chunk against the current
    /// root, publishing the rewritten root if anything changed (§4.7).
    pub fn compact_chunk(&mut self, reclaim_chunk: ChunkId) -> Result<(), DbError> {
        let current_root = match view_root(&self.root.sample()) {
            Some(n) => n,
            None => return Ok(()),
        };
        let version = self.metadata.current_version();
        let new_root = compact_and_release(&self.store, &self.compaction_stats, current_root, reclaim_chunk)
            .map_err(DbError::from)?;
        let vco = self
            .store
            .write_node(&new_root, crate::chunk::pool::Ring::Slow)
            .map_err(DbError::from)?;
        self.metadata
            .publish(&self.pool, version, vco.offset, vco.sequence, self.metadata.min_version())
            .map_err(DbError::from)?;
        self.root.publish(Some(new_root), version);
        Ok(())
    }

    pub fn compaction_stats(&self) -> CompactionSnapshot {
        self.compaction_stats.snapshot()
    }

    pub fn current_version(&self) -> u64 {
        self.metadata.current_version()
    }

    pub fn min_version(&self) -> u64 {
        self.metadata.min_version()
    }

    pub fn free_chunk_count(&self) -> usize {
        self.pool.free_chunk_count()
    }
}

fn view_root(view: &View) -> Option<Arc<Node>> {
    // `View` intentionally doesn't expose its root through the public
    // `get`/`get_db` surface; `Db` is the one internal caller allowed to
    // peek at it directly to seed the next `upsert`/`compact` call.
    view.root_for_writer()
}
