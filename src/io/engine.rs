//! Asynchronous I/O engine (C2): a single-threaded-per-engine, cooperative
//! runtime built over a kernel submission/completion ring (`io_uring`).
//!
//! Every in-flight operation is a *connected operation*: a read or write
//! request linked with a receiver closure invoked with `Result<bytes_transferred>`
//! once its completion is observed. Completion ordering is not guaranteed
//! across distinct operations; callers that need ordering (e.g. walking a
//! trie path) issue the next read from inside the previous receiver.
//!
//! Only `poll`/`wait_until_done` block or yield control to the kernel;
//! receiver invocation happens synchronously on the thread that calls them.
//! An engine is not shareable across threads: the writer owns one on its own
//! OS thread, and every reader that performs async I/O owns its own.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};

use io_uring::{opcode, types, IoUring};

use crate::chunk::offset::PAGE_SIZE;
use crate::error::{Result, TrieError};
use crate::io::buffers::BufferPool;

/// A read completion callback: invoked once, synchronously, from within
/// `poll` or `wait_until_done`, with the bytes actually transferred (a slice
/// into the engine-owned buffer, valid only for the duration of the call) or
/// an I/O error.
pub type ReadReceiver = Box<dyn FnOnce(Result<&[u8]>) + Send>;

/// A write completion callback: invoked with the number of bytes written or
/// an I/O error.
pub type WriteReceiver = Box<dyn FnOnce(Result<usize>) + Send>;

enum OpKind {
    Read(ReadReceiver),
    Write(WriteReceiver),
}

struct PendingOp {
    kind: OpKind,
    /// Byte length requested, used to account write-buffer backpressure on
    /// completion regardless of outcome, and to bound the slice handed to a
    /// read receiver.
    len: usize,
    /// Registered-buffer index to release back to the owning pool on
    /// completion.
    buf_index: u16,
}

/// Opaque handle to a submitted operation. Individual operations cannot be
/// cancelled once submitted (see §4.2); the handle exists only so callers can
/// assert a specific op is still outstanding if desired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpHandle(pub u64);

/// A single engine instance: one ring, one read buffer pool, one (optional)
/// write buffer pool, all registered at construction.
pub struct IoEngine {
    ring: IoUring,
    fd: RawFd,
    read_buffers: BufferPool,
    write_buffers: Option<BufferPool>,
    next_user_data: AtomicU64,
    in_flight: HashMap<u64, PendingOp>,
    in_flight_write_bytes: usize,
}

impl IoEngine {
    /// Builds an engine against `fd`, registering `read_buffers`/
    /// `write_buffers` with the ring. A `write_buffers` pool of zero capacity
    /// means the engine is read-only (§6 `write_buffers: zero for read-only`).
    pub fn new(
        fd: RawFd,
        ring_entries: u32,
        enable_io_polling: bool,
        sq_thread_cpu: Option<u32>,
        read_buffers: BufferPool,
        write_buffers: Option<BufferPool>,
    ) -> Result<Self> {
        let mut builder = IoUring::builder();
        if enable_io_polling {
            builder.setup_iopoll();
        }
        if let Some(cpu) = sq_thread_cpu {
            builder.setup_sqpoll(1000).setup_sqpoll_cpu(cpu);
        }
        let ring = builder
            .build(ring_entries)
            .map_err(TrieError::IoFailure)?;

        let (read_ptr, read_len) = read_buffers.iovec();
        let mut iovecs = vec![libc::iovec {
            iov_base: read_ptr as *mut libc::c_void,
            iov_len: read_len,
        }];
        if let Some(wb) = &write_buffers {
            let (write_ptr, write_len) = wb.iovec();
            iovecs.push(libc::iovec {
                iov_base: write_ptr as *mut libc::c_void,
                iov_len: write_len,
            });
        }
        unsafe {
            ring.submitter()
                .register_buffers(&iovecs)
                .map_err(TrieError::IoFailure)?;
        }

        log::debug!(
            "io engine initialized: {} read buffers x {} bytes, {} write buffers",
            read_buffers.capacity(),
            read_buffers.buffer_size(),
            write_buffers.as_ref().map(|p| p.capacity()).unwrap_or(0)
        );

        Ok(IoEngine {
            ring,
            fd,
            read_buffers,
            write_buffers,
            next_user_data: AtomicU64::new(1),
            in_flight: HashMap::new(),
            in_flight_write_bytes: 0,
        })
    }

    pub fn read_buffers(&self) -> &BufferPool {
        &self.read_buffers
    }

    /// Per-buffer size of the write pool, if this engine was built with one.
    /// Callers that need to split a larger write into fixed-size registered
    /// pieces (every caller does — buffers are fixed-size) use this to size
    /// each piece.
    pub fn write_buffer_size(&self) -> Option<usize> {
        self.write_buffers.as_ref().map(|p| p.buffer_size())
    }

    fn next_id(&self) -> u64 {
        self.next_user_data.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a page-aligned read into an engine-owned buffer and submits
    /// it. `receiver` is invoked from `poll`/`wait_until_done` once the read
    /// completes.
    pub fn submit_read(
        &mut self,
        chunk_byte_offset: u64,
        length: usize,
        receiver: impl FnOnce(Result<&[u8]>) + Send + 'static,
    ) -> Result<OpHandle> {
        if chunk_byte_offset % PAGE_SIZE as u64 != 0 || length % PAGE_SIZE != 0 {
            return Err(TrieError::IoFailure(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "reads must be page-aligned",
            )));
        }
        let mut slot = self
            .read_buffers
            .acquire()
            .ok_or_else(|| {
                TrieError::IoFailure(std::io::Error::new(
                    std::io::ErrorKind::OutOfMemory,
                    "read buffer pool exhausted",
                ))
            })?;
        let id = self.next_id();
        let buf_index = slot.index();
        let ptr = slot.as_slice().as_mut_ptr();
        // The slot stays acquired (not dropped) for the duration of the op;
        // ownership transfers to `in_flight` bookkeeping and the buffer is
        // released back to the pool explicitly once the receiver runs.
        std::mem::forget(slot);

        let entry = opcode::ReadFixed::new(types::Fd(self.fd), ptr, length as u32, buf_index)
            .offset(chunk_byte_offset)
            .build()
            .user_data(id);

        unsafe {
            self.ring
                .submission()
                .push(&entry)
                .map_err(|_| {
                    TrieError::IoFailure(std::io::Error::new(
                        std::io::ErrorKind::WouldBlock,
                        "submission queue is full",
                    ))
                })?;
        }
        self.in_flight.insert(
            id,
            PendingOp {
                kind: OpKind::Read(Box::new(receiver)),
                len: length,
                buf_index,
            },
        );
        Ok(OpHandle(id))
    }

    /// Registers an append-style write. Writes must be page-aligned. Per
    /// §4.2, exhausting the write buffer pool (more in-flight write bytes
    /// requested than the pool can admit) is a fatal programmer error: the
    /// write path must count in-flight bytes and respect backpressure before
    /// calling this. This method aborts the process in that case rather than
    /// returning an error (see [`crate::fatal`]).
    pub fn submit_write(
        &mut self,
        chunk_byte_offset: u64,
        buffer_view: &[u8],
        receiver: impl FnOnce(Result<usize>) + Send + 'static,
    ) -> Result<OpHandle> {
        if chunk_byte_offset % PAGE_SIZE as u64 != 0 || buffer_view.len() % PAGE_SIZE != 0 {
            return Err(TrieError::IoFailure(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "writes must be page-aligned",
            )));
        }
        let pool = self.write_buffers.as_ref().unwrap_or_else(|| {
            crate::fatal!("submit_write called on a read-only-opened engine")
        });
        let mut slot = match pool.acquire() {
            Some(s) => s,
            None => crate::fatal!(
                "write buffer pool exhausted with {} bytes in flight: violates the \
                 backpressure contract of the write path",
                self.in_flight_write_bytes
            ),
        };
        let id = self.next_id();
        let buf_index = slot.index();
        let dst = slot.as_slice();
        dst[..buffer_view.len()].copy_from_slice(buffer_view);
        let ptr = dst.as_mut_ptr();
        std::mem::forget(slot);

        let entry = opcode::WriteFixed::new(
            types::Fd(self.fd),
            ptr,
            buffer_view.len() as u32,
            buf_index,
        )
        .offset(chunk_byte_offset)
        .build()
        .user_data(id);

        unsafe {
            self.ring.submission().push(&entry).map_err(|_| {
                TrieError::IoFailure(std::io::Error::new(
                    std::io::ErrorKind::WouldBlock,
                    "submission queue is full",
                ))
            })?;
        }
        self.in_flight_write_bytes += buffer_view.len();
        self.in_flight.insert(
            id,
            PendingOp {
                kind: OpKind::Write(Box::new(receiver)),
                len: buffer_view.len(),
                buf_index,
            },
        );
        Ok(OpHandle(id))
    }

    /// Drives any completions already available without blocking, invoking
    /// their receivers synchronously. Returns the number of completions
    /// processed.
    pub fn poll(&mut self) -> Result<usize> {
        self.ring.submit().map_err(TrieError::IoFailure)?;
        self.drain_completions()
    }

    /// Blocks until at least one completion is available (or all in-flight
    /// operations have completed), driving receivers as they arrive.
    pub fn wait_until_done(&mut self) -> Result<()> {
        while !self.in_flight.is_empty() {
            self.ring
                .submit_and_wait(1)
                .map_err(TrieError::IoFailure)?;
            self.drain_completions()?;
        }
        Ok(())
    }

    fn drain_completions(&mut self) -> Result<usize> {
        let completed: Vec<(u64, i32)> = self
            .ring
            .completion()
            .map(|cqe| (cqe.user_data(), cqe.result()))
            .collect();
        let n = completed.len();
        for (id, result) in completed {
            if let Some(op) = self.in_flight.remove(&id) {
                match op.kind {
                    OpKind::Write(receiver) => {
                        self.in_flight_write_bytes =
                            self.in_flight_write_bytes.saturating_sub(op.len);
                        let outcome = if result < 0 {
                            Err(TrieError::IoFailure(std::io::Error::from_raw_os_error(
                                -result,
                            )))
                        } else {
                            Ok(result as usize)
                        };
                        receiver(outcome);
                        if let Some(pool) = &self.write_buffers {
                            pool.release(op.buf_index);
                        }
                    }
                    OpKind::Read(receiver) => {
                        if result < 0 {
                            receiver(Err(TrieError::IoFailure(
                                std::io::Error::from_raw_os_error(-result),
                            )));
                        } else {
                            let bytes_read = (result as usize).min(op.len);
                            let full = unsafe { self.read_buffers.slice_mut(op.buf_index) };
                            receiver(Ok(&full[..bytes_read]));
                        }
                        self.read_buffers.release(op.buf_index);
                    }
                }
            }
        }
        Ok(n)
    }

    /// Number of operations submitted but not yet completed.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Drains all in-flight operations before returning, for a clean
    /// shutdown.
    pub fn shutdown(mut self) -> Result<()> {
        self.wait_until_done()
    }
}
