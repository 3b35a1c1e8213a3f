//! Byte ring buffer and the source/sink endpoint contract.
//!
//! The ring keeps explicit read/write positions plus an occupancy count, so
//! `available + free == capacity` holds at every observable moment and a full
//! ring is distinguishable from an empty one. Every copy is split into at
//! most two linear runs around the wrap point.

use crate::format::StreamFormat;

/// Fixed-capacity circular byte buffer.
#[derive(Debug)]
pub struct RingBuffer {
    data: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
    available: usize,
}

impl RingBuffer {
    /// Creates a ring with `capacity` bytes, zero-filled.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            read_pos: 0,
            write_pos: 0,
            available: 0,
        }
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes ready to be read.
    pub fn available(&self) -> usize {
        self.available
    }

    /// Bytes that can still be written.
    pub fn free(&self) -> usize {
        self.capacity() - self.available
    }

    /// Returns `true` when no data is buffered.
    pub fn is_empty(&self) -> bool {
        self.available == 0
    }

    /// Returns `true` when no space is left.
    pub fn is_full(&self) -> bool {
        self.available == self.capacity()
    }

    /// Current read position (for diagnostics).
    pub fn read_pos(&self) -> usize {
        self.read_pos
    }

    /// Current write position (for diagnostics).
    pub fn write_pos(&self) -> usize {
        self.write_pos
    }

    /// Drops all buffered data and rewinds both positions.
    pub fn clear(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
        self.available = 0;
    }

    /// Advances the write position by up to `bytes` already staged in place.
    ///
    /// Returns the number of bytes actually produced (clamped to free space).
    pub fn produce(&mut self, bytes: usize) -> usize {
        let n = bytes.min(self.free());
        self.write_pos = self.wrap(self.write_pos + n);
        self.available += n;
        n
    }

    /// Advances the read position by up to `bytes`.
    ///
    /// Returns the number of bytes actually consumed (clamped to available).
    pub fn consume(&mut self, bytes: usize) -> usize {
        let n = bytes.min(self.available);
        self.read_pos = self.wrap(self.read_pos + n);
        self.available -= n;
        n
    }

    /// Copies `data` in and produces it. Returns bytes written.
    ///
    /// The copy honors the wrap point: it is split into a head run up to the
    /// end of the backing storage and a tail run from its start.
    pub fn push(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.free());
        if n == 0 {
            return 0;
        }
        let head = n.min(self.capacity() - self.write_pos);
        self.data[self.write_pos..self.write_pos + head].copy_from_slice(&data[..head]);
        let tail = n - head;
        if tail > 0 {
            self.data[..tail].copy_from_slice(&data[head..n]);
        }
        self.produce(n)
    }

    /// Produces `bytes` of zeros. Returns bytes written.
    pub fn push_zeros(&mut self, bytes: usize) -> usize {
        let n = bytes.min(self.free());
        if n == 0 {
            return 0;
        }
        let head = n.min(self.capacity() - self.write_pos);
        self.data[self.write_pos..self.write_pos + head].fill(0);
        let tail = n - head;
        if tail > 0 {
            self.data[..tail].fill(0);
        }
        self.produce(n)
    }

    /// Copies up to `out.len()` bytes into `out` without consuming them.
    ///
    /// Returns bytes copied.
    pub fn peek(&self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.available);
        if n == 0 {
            return 0;
        }
        let head = n.min(self.capacity() - self.read_pos);
        out[..head].copy_from_slice(&self.data[self.read_pos..self.read_pos + head]);
        let tail = n - head;
        if tail > 0 {
            out[head..n].copy_from_slice(&self.data[..tail]);
        }
        n
    }

    /// Copies up to `out.len()` bytes into `out` and consumes them.
    ///
    /// Returns bytes copied.
    pub fn pop(&mut self, out: &mut [u8]) -> usize {
        let n = self.peek(out);
        self.consume(n)
    }

    /// The contiguous readable run starting at the read position.
    fn read_run(&self) -> (usize, usize) {
        let len = self.available.min(self.capacity() - self.read_pos);
        (self.read_pos, len)
    }

    /// The contiguous writable run starting at the write position.
    fn write_run(&self) -> (usize, usize) {
        let len = self.free().min(self.capacity() - self.write_pos);
        (self.write_pos, len)
    }

    fn wrap(&self, pos: usize) -> usize {
        let cap = self.capacity();
        if cap == 0 {
            return 0;
        }
        pos % cap
    }
}

/// Moves up to `bytes` from `src` to `dst`, honoring both wrap points.
///
/// The move degenerates into at most four linear copies. Returns the exact
/// number of bytes moved, which is `min(bytes, src.available, dst.free)`.
pub fn copy_ring(src: &mut RingBuffer, dst: &mut RingBuffer, bytes: usize) -> usize {
    let want = bytes.min(src.available()).min(dst.free());
    let mut moved = 0;
    while moved < want {
        let (rp, rlen) = src.read_run();
        let (wp, wlen) = dst.write_run();
        let n = (want - moved).min(rlen).min(wlen);
        if n == 0 {
            break;
        }
        dst.data[wp..wp + n].copy_from_slice(&src.data[rp..rp + n]);
        src.consume(n);
        dst.produce(n);
        moved += n;
    }
    moved
}

/// Read side of a stream endpoint.
///
/// Implemented by audio buffers and DP queues; modules in sink-source mode
/// move their own bytes exclusively through this contract.
pub trait SampleSource: Send + Sync {
    /// Stream format, once parameters have been applied.
    fn format(&self) -> Option<StreamFormat>;

    /// Bytes ready to read.
    fn available(&self) -> usize;

    /// Preferred minimum read granule in bytes.
    fn min_available(&self) -> usize;

    /// Copies up to `out.len()` bytes without consuming. Returns bytes copied.
    fn peek(&self, out: &mut [u8]) -> usize;

    /// Advances the read pointer. Returns bytes actually consumed.
    fn consume(&self, bytes: usize) -> usize;

    /// Peek-and-consume in one call. Returns bytes copied.
    fn read(&self, out: &mut [u8]) -> usize {
        let n = self.peek(out);
        self.consume(n)
    }

    /// Bytes consumed through this endpoint since the last call, for
    /// diagnostics.
    fn take_processed(&self) -> u64;
}

/// Write side of a stream endpoint.
pub trait SampleSink: Send + Sync {
    /// Stream format, once parameters have been applied.
    fn format(&self) -> Option<StreamFormat>;

    /// Bytes that can still be written.
    fn free(&self) -> usize;

    /// Preferred minimum write granule in bytes.
    fn min_free(&self) -> usize;

    /// Copies bytes in and produces them. Returns bytes written.
    fn write(&self, data: &[u8]) -> usize;

    /// Produces `bytes` of zeros. Returns bytes written.
    fn write_zeros(&self, bytes: usize) -> usize;

    /// Bytes produced through this endpoint since the last call, for
    /// diagnostics.
    fn take_processed(&self) -> u64;
}

/// Stack staging granule for endpoint-to-endpoint transfers.
const TRANSFER_CHUNK: usize = 256;

/// Moves up to `bytes` from `src` to `dst` through the endpoint contract.
///
/// Used by the LL shuttle between attached buffers and DP queues. Staging is
/// a fixed stack chunk, so the copy path never allocates. Returns bytes moved.
pub fn transfer(src: &dyn SampleSource, dst: &dyn SampleSink, bytes: usize) -> usize {
    let mut staged = [0u8; TRANSFER_CHUNK];
    let want = bytes.min(src.available()).min(dst.free());
    let mut moved = 0;
    while moved < want {
        let n = (want - moved).min(TRANSFER_CHUNK);
        let got = src.peek(&mut staged[..n]);
        if got == 0 {
            break;
        }
        let written = dst.write(&staged[..got]);
        src.consume(written);
        moved += written;
        if written < got {
            break;
        }
    }
    moved
}
