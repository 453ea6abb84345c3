//! Error taxonomy for the trie storage core.
//!
//! `TrieError` is the full internal taxonomy described in the design: every
//! structural outcome of `find`, every codec/IO failure, and the metadata
//! open-time failures. `DbError` is the collapsed, public-surface variant set
//! that the top-level [`crate::db::Db`] returns to its callers.

use std::io;

use thiserror::Error;

use crate::chunk::offset::VirtualChunkOffset;

/// The full internal error taxonomy.
///
/// Most callers inside the crate work with this type; it is collapsed to
/// [`DbError`] only at the public `Db` boundary, per the propagation policy.
#[derive(Debug, Error)]
pub enum TrieError {
    /// The underlying I/O engine reported a failure. Not retried internally.
    #[error("i/o failure: {0}")]
    IoFailure(#[from] io::Error),

    /// Deserialization failed a size or shape invariant. Fatal for the
    /// operation; the offending offset is recorded for diagnosis.
    #[error("corrupt node at {offset:?}: {reason}")]
    CorruptNode {
        offset: VirtualChunkOffset,
        reason: String,
    },

    /// The requested version is below `min_version`.
    #[error("version {version} has expired (min retained version is {min_version})")]
    VersionExpired { version: u64, min_version: u64 },

    /// `find` consumed the whole key but the terminal node holds no value.
    #[error("key not found")]
    KeyNotFound,

    /// `find` hit a mismatching nibble inside a node's inline path.
    #[error("key mismatch at prefix index {prefix_index}")]
    KeyMismatch { prefix_index: usize },

    /// `find` indexed an unset bit in a node's child mask.
    #[error("branch does not exist for nibble {nibble}")]
    BranchMissing { nibble: u8 },

    /// The key was fully matched against the node's path but the path
    /// continues past the key (over-run).
    #[error("key ends inside node at prefix index {prefix_index}")]
    KeyEndsInsideNode { prefix_index: usize },

    /// The trie is empty; there is no root to search.
    #[error("root is null")]
    RootIsNull,

    /// Metadata block's magic number did not match.
    #[error("metadata block has unrecognized magic {found:#x}")]
    BadMetadataMagic { found: u32 },

    /// Metadata block format version is newer than this build understands.
    #[error("metadata format version {found} is not supported (max {max_supported})")]
    UnsupportedFormatVersion { found: u16, max_supported: u16 },

    /// Read-only open observed the dirty bit set with no writer present to
    /// finish the in-progress metadata write.
    #[error("metadata block is dirty at open and no writer is available to complete it")]
    MetadataDirtyAtOpen,

    /// A chunk generation referenced by a virtual offset has already been
    /// recycled (its sequence number moved on).
    #[error("chunk {chunk_id} sequence {sequence} has been recycled (current sequence {current})")]
    StaleChunkGeneration {
        chunk_id: u32,
        sequence: u64,
        current: u64,
    },

    /// Attempted a mutating operation against a read-only-opened pool/db.
    #[error("operation not permitted: database is open read-only")]
    ReadOnly,
}

impl TrieError {
    pub fn corrupt_node(offset: VirtualChunkOffset, reason: impl Into<String>) -> Self {
        TrieError::CorruptNode {
            offset,
            reason: reason.into(),
        }
    }
}

/// The collapsed error set returned by the public DB surface.
///
/// Per the propagation policy, only `KeyNotFound`, `VersionExpired`, and
/// `IoFailure` escape to DB clients; every other internal find/codec outcome
/// is folded into `IoFailure` (for corruption-class failures) or surfaced as
/// `KeyNotFound` (for the remaining structural `find` outcomes), since those
/// are not independently actionable by state-lookup callers.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("key not found")]
    KeyNotFound,

    #[error("version {version} has expired (min retained version is {min_version})")]
    VersionExpired { version: u64, min_version: u64 },

    #[error("i/o failure: {0}")]
    IoFailure(#[from] io::Error),
}

impl From<TrieError> for DbError {
    fn from(err: TrieError) -> Self {
        match err {
            TrieError::IoFailure(e) => DbError::IoFailure(e),
            TrieError::VersionExpired {
                version,
                min_version,
            } => DbError::VersionExpired {
                version,
                min_version,
            },
            TrieError::KeyNotFound
            | TrieError::KeyMismatch { .. }
            | TrieError::BranchMissing { .. }
            | TrieError::KeyEndsInsideNode { .. }
            | TrieError::RootIsNull => DbError::KeyNotFound,
            TrieError::CorruptNode { offset, reason } => {
                DbError::IoFailure(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("corrupt node at {:?}: {}", offset, reason),
                ))
            }
            other => DbError::IoFailure(io::Error::new(io::ErrorKind::Other, other.to_string())),
        }
    }
}

pub type Result<T> = std::result::Result<T, TrieError>;
