//! Deferred output queue.
//!
//! When a client's socket is not writable, reply bytes are parked here as a
//! FIFO of chunks and drained once the reactor reports the socket writable
//! again. The queue accounts each chunk's payload plus a fixed per-chunk
//! overhead so the configured output-buffer limit reflects real memory use.

use std::collections::VecDeque;
use std::io;

use bytes::Bytes;

/// Book-keeping cost charged per queued chunk on top of its payload.
pub const CHUNK_OVERHEAD: usize = std::mem::size_of::<Bytes>();

/// FIFO of pending output chunks with byte accounting.
#[derive(Debug, Default)]
pub struct DeferredQueue {
    chunks: VecDeque<Bytes>,
    bytes: usize,
}

impl DeferredQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Accounted size: payload bytes plus per-chunk overhead.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Append a chunk, charging `data.len() + CHUNK_OVERHEAD` against the
    /// accounted total. Returns `false` without retaining anything if the
    /// new total would exceed `max_bytes`; the caller is expected to expire
    /// the owning session.
    pub fn enqueue(&mut self, data: Bytes, max_bytes: usize) -> bool {
        debug_assert!(!data.is_empty());

        let alloc = data.len() + CHUNK_OVERHEAD;
        if self.bytes + alloc > max_bytes {
            return false;
        }

        self.bytes += alloc;
        self.chunks.push_back(data);
        true
    }

    /// Write queued chunks through `write` until the queue is empty or the
    /// sink stops accepting bytes.
    ///
    /// A partial write shrinks the head chunk in place and stops. A
    /// would-block or interrupted error leaves the queue intact and stops.
    /// Any other error is returned to the caller with the queue unchanged
    /// beyond what was already written. Never blocks.
    ///
    /// Returns the number of payload bytes written.
    pub fn drain<W>(&mut self, mut write: W) -> io::Result<usize>
    where
        W: FnMut(&[u8]) -> io::Result<usize>,
    {
        let mut written = 0;

        while let Some(head) = self.chunks.front_mut() {
            debug_assert!(!head.is_empty());
            debug_assert!(head.len() <= self.bytes);

            match write(head) {
                Ok(n) if n < head.len() => {
                    self.bytes -= n;
                    bytes::Buf::advance(head, n);
                    written += n;
                    break;
                }
                Ok(n) => {
                    self.bytes -= n + CHUNK_OVERHEAD;
                    self.chunks.pop_front();
                    written += n;
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted =>
                {
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        debug_assert!(!self.chunks.is_empty() || self.bytes == 0);
        Ok(written)
    }
}
