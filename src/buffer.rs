//! Shared audio buffer connecting two components.
//!
//! An [`AudioBuffer`] is a single-producer single-consumer byte ring with
//! attached stream parameters. The producing component holds the write side,
//! the consuming component the read side; both reach it through the
//! [`SampleSource`]/[`SampleSink`] endpoint contract so DP queues can stand in
//! transparently.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::error::EngineError;
use crate::format::StreamFormat;
use crate::memory::CacheMode;
use crate::stream::{RingBuffer, SampleSink, SampleSource};

/// Identifier of a buffer, unique within the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u32);

impl std::fmt::Display for BufferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "buf-{}", self.0)
    }
}

/// A shared ring buffer with stream parameters and cache attributes.
pub struct AudioBuffer {
    id: BufferId,
    ring: Mutex<RingBuffer>,
    format: Mutex<Option<StreamFormat>>,
    cache: CacheMode,
    /// Preferred read granule (set to the consumer period at prepare).
    min_available: AtomicUsize,
    /// Preferred write granule (set to the producer period at prepare).
    min_free: AtomicUsize,
}

impl AudioBuffer {
    /// Allocates a buffer of `capacity` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::CapacityNotAligned`] unless `capacity` is a
    /// non-zero multiple of `max_frame_bytes`.
    pub fn alloc(
        id: BufferId,
        capacity: usize,
        max_frame_bytes: usize,
        cache: CacheMode,
    ) -> Result<Arc<Self>, EngineError> {
        if capacity == 0 || max_frame_bytes == 0 || capacity % max_frame_bytes != 0 {
            return Err(EngineError::CapacityNotAligned {
                capacity,
                frame_bytes: max_frame_bytes,
            });
        }
        Ok(Arc::new(Self {
            id,
            ring: Mutex::new(RingBuffer::new(capacity)),
            format: Mutex::new(None),
            cache,
            min_available: AtomicUsize::new(max_frame_bytes),
            min_free: AtomicUsize::new(max_frame_bytes),
        }))
    }

    /// Buffer id.
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.ring.lock().capacity()
    }

    /// Bytes ready to read.
    pub fn available(&self) -> usize {
        self.ring.lock().available()
    }

    /// Bytes that can still be written.
    pub fn free(&self) -> usize {
        self.ring.lock().free()
    }

    /// Applies stream parameters.
    pub fn set_format(&self, format: StreamFormat) {
        *self.format.lock() = Some(format);
    }

    /// Stream parameters, once applied.
    pub fn format(&self) -> Option<StreamFormat> {
        *self.format.lock()
    }

    /// Cache attributes of the backing memory.
    pub fn cache(&self) -> &CacheMode {
        &self.cache
    }

    /// Sets the preferred endpoint granules, typically to one period each.
    pub fn set_watermarks(&self, min_available: usize, min_free: usize) {
        self.min_available.store(min_available, Ordering::Relaxed);
        self.min_free.store(min_free, Ordering::Relaxed);
    }

    /// Preferred read granule in bytes.
    pub fn min_available(&self) -> usize {
        self.min_available.load(Ordering::Relaxed)
    }

    /// Preferred write granule in bytes.
    pub fn min_free(&self) -> usize {
        self.min_free.load(Ordering::Relaxed)
    }

    /// Drops buffered data and rewinds positions; format is kept.
    pub fn reset(&self) {
        self.ring.lock().clear();
    }

    /// Zero-fills the buffered region in place (used on adapter reset).
    pub fn zero(&self) {
        let mut ring = self.ring.lock();
        let avail = ring.available();
        ring.clear();
        ring.push_zeros(avail);
    }

    /// Locks the backing ring for an in-place processing pass.
    pub(crate) fn lock_ring(&self) -> MutexGuard<'_, RingBuffer> {
        self.ring.lock()
    }

    /// Read-side endpoint handle.
    pub fn source(self: &Arc<Self>) -> BufferSource {
        BufferSource {
            buf: Arc::clone(self),
            processed: AtomicU64::new(0),
        }
    }

    /// Write-side endpoint handle.
    pub fn sink(self: &Arc<Self>) -> BufferSink {
        BufferSink {
            buf: Arc::clone(self),
            processed: AtomicU64::new(0),
        }
    }
}

impl std::fmt::Debug for AudioBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioBuffer")
            .field("id", &self.id)
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .field("format", &self.format())
            .finish()
    }
}

/// Read side of an [`AudioBuffer`].
pub struct BufferSource {
    buf: Arc<AudioBuffer>,
    processed: AtomicU64,
}

impl SampleSource for BufferSource {
    fn format(&self) -> Option<StreamFormat> {
        self.buf.format()
    }

    fn available(&self) -> usize {
        self.buf.available()
    }

    fn min_available(&self) -> usize {
        self.buf.min_available()
    }

    fn peek(&self, out: &mut [u8]) -> usize {
        let ring = self.buf.lock_ring();
        let n = out.len().min(ring.available());
        self.buf.cache.invalidate(n);
        ring.peek(out)
    }

    fn consume(&self, bytes: usize) -> usize {
        let n = self.buf.lock_ring().consume(bytes);
        self.processed.fetch_add(n as u64, Ordering::Relaxed);
        n
    }

    fn take_processed(&self) -> u64 {
        self.processed.swap(0, Ordering::Relaxed)
    }
}

/// Write side of an [`AudioBuffer`].
pub struct BufferSink {
    buf: Arc<AudioBuffer>,
    processed: AtomicU64,
}

impl SampleSink for BufferSink {
    fn format(&self) -> Option<StreamFormat> {
        self.buf.format()
    }

    fn free(&self) -> usize {
        self.buf.free()
    }

    fn min_free(&self) -> usize {
        self.buf.min_free()
    }

    fn write(&self, data: &[u8]) -> usize {
        let n = self.buf.lock_ring().push(data);
        self.buf.cache.writeback(n);
        self.processed.fetch_add(n as u64, Ordering::Relaxed);
        n
    }

    fn write_zeros(&self, bytes: usize) -> usize {
        let n = self.buf.lock_ring().push_zeros(bytes);
        self.buf.cache.writeback(n);
        self.processed.fetch_add(n as u64, Ordering::Relaxed);
        n
    }

    fn take_processed(&self) -> u64 {
        self.processed.swap(0, Ordering::Relaxed)
    }
}

/// `min(src.available, dst.free)` in frames, rounded down to the alignment
/// required by the module processing the pair.
pub fn avail_frames_aligned(
    src: &AudioBuffer,
    dst: &AudioBuffer,
    format: &StreamFormat,
    align_frames: usize,
) -> usize {
    let frames = format
        .bytes_to_frames(src.available())
        .min(format.bytes_to_frames(dst.free()));
    if align_frames <= 1 {
        frames
    } else {
        frames - frames % align_frames
    }
}
