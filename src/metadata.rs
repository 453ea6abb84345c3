//! Metadata & history (C6): the two-slot pair-buffered root/version record.
//!
//! Layout of the dedicated metadata chunk (one page per slot, a third
//! "header" page in front):
//! `[magic:u32][format_version:u16][flags:u16][dirty:u8][pad:7]`
//! followed by two root slots, each `[root:8B ChunkOffset-packed +
//! chunk_id:u32][version:u64][min_version:u64][sequence_of_root_chunk:u64]`.
//! Writes alternate slots; `dirty` is set before either slot write and
//! cleared only after the new slot is fully written, enforced by ordering
//! (write slot, fence, clear dirty) rather than by a racy memcpy, per the
//! Open Questions resolution in DESIGN.md.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::chunk::offset::{ChunkId, ChunkOffset, Sequence, PAGE_SIZE};
use crate::chunk::pool::StoragePool;
use crate::error::{Result, TrieError};

const MAGIC: u32 = 0x4d50_5431; // "MPT1"
const FORMAT_VERSION: u16 = 1;
const HEADER_LEN: usize = PAGE_SIZE;
const SLOT_LEN: usize = PAGE_SIZE;

struct Slot {
    root_chunk_id: ChunkId,
    root_byte_offset: u64,
    root_span_pages: u16,
    root_chunk_sequence: Sequence,
    version: u64,
    min_version: u64,
}

impl Slot {
    fn empty() -> Self {
        Slot {
            root_chunk_id: ChunkId::MAX,
            root_byte_offset: u64::MAX,
            root_span_pages: 0,
            root_chunk_sequence: 0,
            version: 0,
            min_version: 0,
        }
    }

    fn encode(&self) -> [u8; SLOT_LEN] {
        let mut buf = [0u8; SLOT_LEN];
        buf[0..4].copy_from_slice(&self.root_chunk_id.to_le_bytes());
        buf[4..12].copy_from_slice(&self.root_byte_offset.to_le_bytes());
        buf[12..14].copy_from_slice(&self.root_span_pages.to_le_bytes());
        buf[14..22].copy_from_slice(&self.root_chunk_sequence.to_le_bytes());
        buf[22..30].copy_from_slice(&self.version.to_le_bytes());
        buf[30..38].copy_from_slice(&self.min_version.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Self {
        Slot {
            root_chunk_id: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            root_byte_offset: u64::from_le_bytes(buf[4..12].try_into().unwrap()),
            root_span_pages: u16::from_le_bytes(buf[12..14].try_into().unwrap()),
            root_chunk_sequence: u64::from_le_bytes(buf[14..22].try_into().unwrap()),
            version: u64::from_le_bytes(buf[22..30].try_into().unwrap()),
            min_version: u64::from_le_bytes(buf[30..38].try_into().unwrap()),
        }
    }

    fn root_offset(&self) -> Option<ChunkOffset> {
        if self.root_chunk_id == ChunkId::MAX {
            return None;
        }
        ChunkOffset::new(self.root_chunk_id, self.root_byte_offset, self.root_span_pages.max(1)).ok()
    }
}

/// The metadata block: the dedicated chunk holding the two root/version
/// slots, plus the atomics readers consult on every `find` (`min_version`,
/// `current_version`) without taking any lock.
///
/// The two on-disk slots exist only to make *publishing the latest root*
/// torn-write-safe; they do not themselves retain history. Per-version root
/// lookups (§3 "each version has exactly one root node offset", S3) are
/// served from `history`, an in-memory ring of the last `history_length`
/// `(version, root_offset, root_sequence)` triples. This means a historical
/// root is only recoverable while the process that wrote it is still
/// running: a fresh open only ever recovers the single latest root from the
/// on-disk slots (see DESIGN.md, Open Questions) — compaction still keeps
/// every *node* a live version's root can reach on disk, this only concerns
/// how a caller locates the right root to start the walk from.
pub struct Metadata {
    chunk_id: ChunkId,
    write_lock: Mutex<u8>, // which slot (0/1) was written last
    min_version: AtomicU64,
    current_version: AtomicU64,
    history_length: u64,
    history: Mutex<VecDeque<(u64, ChunkOffset, Sequence)>>,
}

impl Metadata {
    /// Opens (or initializes, if `create`) the metadata block on `chunk_id`.
    /// On open, the header's magic/format-version are validated and the
    /// dirty bit is sampled: if set with no writer on this host to finish
    /// the write, a read-only open refuses rather than risk reading a torn
    /// slot (§6 ambient addition).
    pub fn open(pool: &StoragePool, chunk_id: ChunkId, create: bool, history_length: u64) -> Result<(Self, Option<ChunkOffset>)> {
        let sequence = pool.current_sequence(chunk_id).unwrap_or(0);
        let handle = pool.activate_chunk(sequence, chunk_id).or_else(|_| {
            // freshly-created pool: chunk not yet activated via advance_*;
            // metadata owns a fixed, pre-reserved chunk id instead.
            pool.activate_chunk(0, chunk_id)
        })?;

        let mut header = vec![0u8; HEADER_LEN];
        handle.read_at(0, &mut header)?;
        let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());

        if magic == 0 && create {
            log::info!("initializing metadata block on chunk {}", chunk_id);
            let mut fresh_header = vec![0u8; HEADER_LEN];
            fresh_header[0..4].copy_from_slice(&MAGIC.to_le_bytes());
            fresh_header[4..6].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
            handle.write_at(0, &fresh_header)?;
            let empty = Slot::empty();
            let mut slot_buf = vec![0u8; SLOT_LEN];
            slot_buf[..SLOT_LEN].copy_from_slice(&empty.encode());
            handle.write_at(HEADER_LEN as u64, &slot_buf)?;
            handle.write_at((HEADER_LEN + SLOT_LEN) as u64, &slot_buf)?;

            return Ok((
                Metadata {
                    chunk_id,
                    write_lock: Mutex::new(1), // next publish writes slot 0
                    min_version: AtomicU64::new(0),
                    current_version: AtomicU64::new(0),
                    history_length: history_length.max(1),
                    history: Mutex::new(VecDeque::new()),
                },
                None,
            ));
        }

        if magic != MAGIC {
            return Err(TrieError::BadMetadataMagic { found: magic });
        }
        let format_version = u16::from_le_bytes(header[4..6].try_into().unwrap());
        if format_version > FORMAT_VERSION {
            return Err(TrieError::UnsupportedFormatVersion {
                found: format_version,
                max_supported: FORMAT_VERSION,
            });
        }
        let dirty = header[6];
        if dirty != 0 {
            // No cross-process coordination primitive exists at this layer;
            // a dirty bit observed at open means a previous writer never
            // completed `publish`. We refuse rather than guess which slot
            // is valid.
            return Err(TrieError::MetadataDirtyAtOpen);
        }

        let mut slot0_buf = vec![0u8; SLOT_LEN];
        let mut slot1_buf = vec![0u8; SLOT_LEN];
        handle.read_at(HEADER_LEN as u64, &mut slot0_buf)?;
        handle.read_at((HEADER_LEN + SLOT_LEN) as u64, &mut slot1_buf)?;
        let slot0 = Slot::decode(&slot0_buf);
        let slot1 = Slot::decode(&slot1_buf);
        let (latest, last_written) = if slot0.version >= slot1.version {
            (slot0, 0u8)
        } else {
            (slot1, 1u8)
        };

        let root = latest.root_offset();
        let mut history = VecDeque::new();
        if let Some(offset) = root {
            // Only the latest root survives a reopen; see the struct doc
            // comment for why earlier versions' roots are not recoverable.
            history.push_back((latest.version, offset, latest.root_chunk_sequence));
        }
        let metadata = Metadata {
            chunk_id,
            write_lock: Mutex::new(last_written),
            min_version: AtomicU64::new(latest.min_version),
            current_version: AtomicU64::new(latest.version),
            history_length: history_length.max(1),
            history: Mutex::new(history),
        };
        Ok((metadata, root))
    }

    pub fn current_version(&self) -> u64 {
        self.current_version.load(Ordering::Acquire)
    }

    pub fn min_version(&self) -> u64 {
        self.min_version.load(Ordering::Acquire)
    }

    pub fn min_version_atomic(&self) -> &AtomicU64 {
        &self.min_version
    }

    /// `verify_version(v)`: cheap check that `v` is within the retained
    /// window, used inside trie walks before any on-disk read.
    pub fn verify_version(&self, v: u64) -> Result<()> {
        let min_v = self.min_version();
        if v < min_v {
            return Err(TrieError::VersionExpired {
                version: v,
                min_version: min_v,
            });
        }
        Ok(())
    }

    /// `publish(version, root)`: set dirty, write the new slot, clear
    /// dirty. Only once this returns is the new version visible to readers
    /// sampling `current_version`/`min_version` (§4.4.3, §4.6).
    ///
    /// All three writes go through the blocking `FileExt` path rather than
    /// `StoragePool::write_via_engine`: they're three dependent writes to the
    /// same page-sized header slot, each required to land before the next is
    /// issued (dirty, then the slot body, then clean), so there's nothing for
    /// an async engine to overlap them with and the ordering would have to be
    /// re-serialized by hand regardless.
    pub fn publish(&self, pool: &StoragePool, version: u64, root: ChunkOffset, root_sequence: Sequence, min_version: u64) -> Result<()> {
        let sequence = pool.current_sequence(self.chunk_id).unwrap_or(0);
        let handle = pool.activate_chunk(sequence, self.chunk_id)?;

        let mut last_written = self.write_lock.lock();
        let target_slot = 1 - *last_written;

        let mut dirty_header = vec![0u8; 8];
        dirty_header[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        dirty_header[4..6].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        dirty_header[6] = 1;
        handle.write_at(0, &pad_to_page(&dirty_header))?;

        let slot = Slot {
            root_chunk_id: root.chunk_id,
            root_byte_offset: root.byte_offset(),
            root_span_pages: root.span_pages(),
            root_chunk_sequence: root_sequence,
            version,
            min_version,
        };
        let offset = HEADER_LEN as u64 + target_slot as u64 * SLOT_LEN as u64;
        handle.write_at(offset, &pad_to_page(&slot.encode()))?;

        let mut clean_header = dirty_header.clone();
        clean_header[6] = 0;
        handle.write_at(0, &pad_to_page(&clean_header))?;

        *last_written = target_slot;
        self.current_version.store(version, Ordering::Release);
        self.min_version.store(min_version, Ordering::Release);

        // Retains exactly the last `history_length` published versions —
        // assumes the normal one-commit-per-version usage pattern, so every
        // version in `[min_version, current_version]` has its own entry.
        let mut history = self.history.lock();
        history.push_back((version, root, root_sequence));
        while history.len() as u64 > self.history_length {
            history.pop_front();
        }

        log::debug!("published version {} (min_version {}) to slot {}", version, min_version, target_slot);
        Ok(())
    }

    /// Resolves the root that was current *as of* `version`: the entry with
    /// the greatest retained version `<= version` (point-in-time semantics,
    /// not an exact-match lookup — a query for a version between two commits
    /// sees whatever was last written at or before it). `None` means either
    /// the trie was empty at that point or no retained entry covers it (the
    /// caller is expected to have already rejected `version < min_version`
    /// via `verify_version`).
    pub fn root_offset_for_version(&self, version: u64) -> Option<(ChunkOffset, Sequence)> {
        self.history
            .lock()
            .iter()
            .rev()
            .find(|(v, _, _)| *v <= version)
            .map(|(_, offset, seq)| (*offset, *seq))
    }

    /// `expire_below(v)`: advances the retained window. Chunks whose max
    /// resident version falls below `v` become eligible for compaction's
    /// free-list return (§4.7 drives the actual chunk release).
    pub fn expire_below(&self, v: u64) {
        let prev = self.min_version.fetch_max(v, Ordering::AcqRel);
        if v > prev {
            log::info!("expired versions below {} (was {})", v, prev);
        }
    }
}

fn pad_to_page(bytes: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; PAGE_SIZE];
    buf[..bytes.len()].copy_from_slice(bytes);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn open_pool() -> (tempfile::NamedTempFile, StoragePool) {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        let chunk_bytes = PAGE_SIZE as u64 * 4;
        f.write_all(&vec![0u8; (chunk_bytes * 4) as usize]).unwrap();
        f.flush().unwrap();
        let pool = StoragePool::open(&[f.path()], chunk_bytes, 4, false, false).unwrap();
        (f, pool)
    }

    #[test]
    fn fresh_metadata_has_no_root() {
        let (_f, pool) = open_pool();
        let (_meta, root) = Metadata::open(&pool, 0, true, 4).unwrap();
        assert!(root.is_none());
    }

    #[test]
    fn publish_then_reopen_round_trips_root() {
        let (_f, pool) = open_pool();
        let (meta, _root) = Metadata::open(&pool, 0, true, 4).unwrap();
        let offset = ChunkOffset::new(1, 0, 1).unwrap();
        meta.publish(&pool, 1, offset, 1, 0).unwrap();
        assert_eq!(meta.current_version(), 1);

        let (meta2, root2) = Metadata::open(&pool, 0, false, 4).unwrap();
        assert_eq!(root2.unwrap(), offset);
        assert_eq!(meta2.current_version(), 1);
    }

    #[test]
    fn verify_version_rejects_expired() {
        let (_f, pool) = open_pool();
        let (meta, _root) = Metadata::open(&pool, 0, true, 4).unwrap();
        meta.expire_below(5);
        assert!(meta.verify_version(4).is_err());
        assert!(meta.verify_version(5).is_ok());
    }

    #[test]
    fn root_offset_for_version_resolves_point_in_time() {
        let (_f, pool) = open_pool();
        let (meta, _root) = Metadata::open(&pool, 0, true, 2).unwrap();
        let off1 = ChunkOffset::new(1, 0, 1).unwrap();
        let off2 = ChunkOffset::new(1, PAGE_SIZE as u64, 1).unwrap();
        let off3 = ChunkOffset::new(1, 2 * PAGE_SIZE as u64, 1).unwrap();
        meta.publish(&pool, 1, off1, 1, 0).unwrap();
        meta.publish(&pool, 2, off2, 1, 0).unwrap();
        meta.publish(&pool, 3, off3, 1, 1).unwrap();

        // history_length=2 keeps versions {2, 3}; version 1 has aged out.
        assert!(meta.root_offset_for_version(1).is_none());
        assert_eq!(meta.root_offset_for_version(2).unwrap().0, off2);
        // a query strictly between two publishes sees the last one at or before it.
        assert_eq!(meta.root_offset_for_version(3).unwrap().0, off3);
    }

    #[test]
    fn dirty_bit_at_open_is_rejected() {
        let (_f, pool) = open_pool();
        let (_meta, _root) = Metadata::open(&pool, 0, true, 4).unwrap();
        let handle = pool.activate_chunk(pool.current_sequence(0).unwrap(), 0).unwrap();
        let mut dirty_header = vec![0u8; PAGE_SIZE];
        dirty_header[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        dirty_header[4..6].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        dirty_header[6] = 1;
        handle.write_at(0, &dirty_header).unwrap();

        assert!(matches!(Metadata::open(&pool, 0, false, 4), Err(TrieError::MetadataDirtyAtOpen)));
    }
}
