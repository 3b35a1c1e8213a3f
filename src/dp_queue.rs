//! Double-buffered queue decoupling low-latency and deferred processing.
//!
//! A DP queue implements the same source/sink contract as a buffer but lets
//! the producer and consumer run on different cores or cadences. It is backed
//! by two rings: one is exposed to the producer, one to the consumer, and
//! they are exchanged atomically once the consumer's ring is drained and the
//! producer's holds at least the swap threshold. An observer therefore never
//! sees a torn buffer: everything readable was written before the last swap.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::format::StreamFormat;
use crate::memory::CacheMode;
use crate::stream::{RingBuffer, SampleSink, SampleSource};

/// Fill state of the queue as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DpQueueState {
    /// Neither ring holds data.
    Empty,
    /// Some data buffered, some room left.
    Partial,
    /// The producer ring has no room left.
    Full,
}

/// Backing-memory placement of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DpQueueMode {
    /// Producer and consumer share a core; plain memory.
    Local,
    /// Cross-core; swaps run cache maintenance on the exchanged rings.
    Shared,
}

struct DpInner {
    /// Ring the producer writes.
    write: RingBuffer,
    /// Ring the consumer reads.
    read: RingBuffer,
}

/// Two-slot swap queue straddling the LL/DP boundary or two cores.
pub struct DpQueue {
    mode: DpQueueMode,
    inner: Mutex<DpInner>,
    format: Mutex<Option<StreamFormat>>,
    cache: CacheMode,
    /// Producer fill at which a swap becomes possible.
    swap_threshold: usize,
}

impl DpQueue {
    /// Creates a queue shadowing a buffer with the given endpoint granules.
    ///
    /// Each ring holds `max(min_available, min_free)` bytes; the swap fires
    /// once the producer ring holds at least `min_available`.
    pub fn create(
        min_available: usize,
        min_free: usize,
        mode: DpQueueMode,
        cache: CacheMode,
    ) -> Arc<Self> {
        let size = min_available.max(min_free).max(1);
        Arc::new(Self {
            mode,
            inner: Mutex::new(DpInner {
                write: RingBuffer::new(size),
                read: RingBuffer::new(size),
            }),
            format: Mutex::new(None),
            cache,
            swap_threshold: min_available.clamp(1, size),
        })
    }

    /// Backing-memory placement.
    pub fn mode(&self) -> DpQueueMode {
        self.mode
    }

    /// Copies stream parameters from the shadowed buffer.
    pub fn set_format(&self, format: StreamFormat) {
        *self.format.lock() = Some(format);
    }

    /// Stream parameters, once copied.
    pub fn format(&self) -> Option<StreamFormat> {
        *self.format.lock()
    }

    /// Current fill state.
    pub fn state(&self) -> DpQueueState {
        let inner = self.inner.lock();
        if inner.read.is_empty() && inner.write.is_empty() {
            DpQueueState::Empty
        } else if inner.write.is_full() {
            DpQueueState::Full
        } else {
            DpQueueState::Partial
        }
    }

    /// Drops all buffered data on both rings.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.read.clear();
        inner.write.clear();
    }

    /// Exchanges the rings if the consumer ring is drained and the producer
    /// ring holds at least the swap threshold.
    fn try_swap(&self, inner: &mut DpInner) {
        if inner.read.is_empty() && inner.write.available() >= self.swap_threshold {
            if self.mode == DpQueueMode::Shared {
                // The producer's writes must be visible before the consumer
                // core reads the exchanged ring.
                self.cache.writeback(inner.write.available());
                self.cache.invalidate(inner.write.available());
            }
            std::mem::swap(&mut inner.read, &mut inner.write);
        }
    }

    /// Consumer-side endpoint handle.
    pub fn source(self: &Arc<Self>) -> DpSource {
        DpSource {
            queue: Arc::clone(self),
            processed: AtomicU64::new(0),
        }
    }

    /// Producer-side endpoint handle.
    pub fn sink(self: &Arc<Self>) -> DpSink {
        DpSink {
            queue: Arc::clone(self),
            processed: AtomicU64::new(0),
        }
    }
}

impl std::fmt::Debug for DpQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DpQueue")
            .field("mode", &self.mode)
            .field("state", &self.state())
            .field("swap_threshold", &self.swap_threshold)
            .finish()
    }
}

/// Consumer side of a [`DpQueue`].
pub struct DpSource {
    queue: Arc<DpQueue>,
    processed: AtomicU64,
}

impl SampleSource for DpSource {
    fn format(&self) -> Option<StreamFormat> {
        self.queue.format()
    }

    fn available(&self) -> usize {
        let mut inner = self.queue.inner.lock();
        self.queue.try_swap(&mut inner);
        inner.read.available()
    }

    fn min_available(&self) -> usize {
        self.queue.swap_threshold
    }

    fn peek(&self, out: &mut [u8]) -> usize {
        let mut inner = self.queue.inner.lock();
        self.queue.try_swap(&mut inner);
        inner.read.peek(out)
    }

    fn consume(&self, bytes: usize) -> usize {
        let mut inner = self.queue.inner.lock();
        let n = inner.read.consume(bytes);
        self.queue.try_swap(&mut inner);
        self.processed.fetch_add(n as u64, Ordering::Relaxed);
        n
    }

    fn take_processed(&self) -> u64 {
        self.processed.swap(0, Ordering::Relaxed)
    }
}

/// Producer side of a [`DpQueue`].
pub struct DpSink {
    queue: Arc<DpQueue>,
    processed: AtomicU64,
}

impl SampleSink for DpSink {
    fn format(&self) -> Option<StreamFormat> {
        self.queue.format()
    }

    fn free(&self) -> usize {
        self.queue.inner.lock().write.free()
    }

    fn min_free(&self) -> usize {
        self.queue.swap_threshold
    }

    fn write(&self, data: &[u8]) -> usize {
        let mut inner = self.queue.inner.lock();
        let n = inner.write.push(data);
        self.queue.try_swap(&mut inner);
        self.processed.fetch_add(n as u64, Ordering::Relaxed);
        n
    }

    fn write_zeros(&self, bytes: usize) -> usize {
        let mut inner = self.queue.inner.lock();
        let n = inner.write.push_zeros(bytes);
        self.queue.try_swap(&mut inner);
        self.processed.fetch_add(n as u64, Ordering::Relaxed);
        n
    }

    fn take_processed(&self) -> u64 {
        self.processed.swap(0, Ordering::Relaxed)
    }
}
