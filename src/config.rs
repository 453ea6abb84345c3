//! Configuration surface (C9): every option named in §6, validated at
//! construction rather than deep inside the components that consume it.

use serde::{Deserialize, Serialize};

use crate::chunk::offset::PAGE_SIZE;
use crate::error::{Result, TrieError};

fn invalid(msg: impl Into<String>) -> TrieError {
    TrieError::IoFailure(std::io::Error::new(std::io::ErrorKind::InvalidInput, msg.into()))
}

/// Full configuration for opening a database: storage layout, I/O engine
/// sizing, and trie-level policy. `serde`-derived so an external config-file
/// or CLI layer (out of scope for this crate) can load it without this crate
/// depending on any particular format.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Backing device paths; spread round-robin across devices.
    pub device_paths: Vec<String>,
    /// Bytes per chunk; must be a multiple of the page size.
    pub chunk_size: u64,
    /// Total number of chunks carved out of the backing devices.
    pub total_chunks: u32,

    /// Submission/completion queue depth for the async I/O engine; must be a
    /// power of two.
    pub ring_entries: u32,
    /// Use busy-polling kernel I/O; disables non-`O_DIRECT` I/O.
    pub enable_io_polling: bool,
    /// Pin the ring polling thread to a CPU, if set.
    pub sq_thread_cpu: Option<u32>,
    /// Number of registered read buffers.
    pub read_buffers: u32,
    /// Number of registered write buffers; zero for a read-only engine.
    pub write_buffers: u32,
    /// Per-buffer size for reads; power of two, at least one page.
    pub read_size: usize,
    /// Per-buffer size for writes; power of two, at least one page.
    pub write_size: usize,

    /// Weight cap (approximate bytes) of the node cache (C5).
    pub node_cache_bytes: usize,
    /// How many trailing versions are retained before expiration (C6/C7).
    pub history_length: u64,
    /// Open the database read-only; any mutating operation returns
    /// [`TrieError::ReadOnly`].
    pub open_read_only: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device_paths: Vec::new(),
            chunk_size: PAGE_SIZE as u64 * 256,
            total_chunks: 1024,
            ring_entries: 256,
            enable_io_polling: false,
            sq_thread_cpu: None,
            read_buffers: 64,
            write_buffers: 64,
            read_size: PAGE_SIZE,
            write_size: PAGE_SIZE,
            node_cache_bytes: 64 * 1024 * 1024,
            history_length: 16,
            open_read_only: false,
        }
    }
}

impl Config {
    /// Validates every constraint named in §6 (power-of-two sizing,
    /// page-multiple buffer sizes, at least one device) before any pool or
    /// engine is constructed from this config.
    pub fn validate(&self) -> Result<()> {
        if self.device_paths.is_empty() {
            return Err(invalid("config requires at least one device path"));
        }
        if self.chunk_size % PAGE_SIZE as u64 != 0 {
            return Err(invalid("chunk_size must be a multiple of the page size"));
        }
        if !self.ring_entries.is_power_of_two() {
            return Err(invalid("ring_entries must be a power of two"));
        }
        if !self.read_size.is_power_of_two() || self.read_size < PAGE_SIZE {
            return Err(invalid("read_size must be a power of two >= page size"));
        }
        if !self.write_size.is_power_of_two() || self.write_size < PAGE_SIZE {
            return Err(invalid("write_size must be a power of two >= page size"));
        }
        if !self.open_read_only && self.write_buffers == 0 {
            return Err(invalid("write_buffers must be nonzero unless open_read_only is set"));
        }
        if self.history_length == 0 {
            return Err(invalid("history_length must retain at least one version"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let mut cfg = Config::default();
        cfg.device_paths.push("/tmp/does-not-need-to-exist".to_string());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_non_power_of_two_ring_entries() {
        let mut cfg = Config::default();
        cfg.device_paths.push("/tmp/x".to_string());
        cfg.ring_entries = 100;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_write_buffers_when_writable() {
        let mut cfg = Config::default();
        cfg.device_paths.push("/tmp/x".to_string());
        cfg.write_buffers = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn allows_zero_write_buffers_when_read_only() {
        let mut cfg = Config::default();
        cfg.device_paths.push("/tmp/x".to_string());
        cfg.write_buffers = 0;
        cfg.open_read_only = true;
        assert!(cfg.validate().is_ok());
    }
}
