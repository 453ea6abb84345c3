//! Asynchronous direct I/O (C2): page-aligned registered buffers and the
//! `io_uring`-backed engine built over them.

pub mod buffers;
pub mod engine;

pub use buffers::BufferPool;
pub use engine::{IoEngine, OpHandle, ReadReceiver, WriteReceiver};
