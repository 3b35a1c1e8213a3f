//! Cache maintenance hooks for non-coherent targets.
//!
//! Shared-memory regions on DSP platforms require explicit invalidate before
//! read and writeback after write. The portable runtime abstracts those as
//! [`CacheOps`]; coherent targets install the no-op [`Coherent`] and tests
//! install a counting fake.

use std::sync::Arc;

/// Platform cache maintenance operations.
///
/// Implementations are injected into buffers and DP queues at allocation
/// time; the hot path calls them unconditionally and relies on the coherent
/// implementation compiling down to nothing.
pub trait CacheOps: Send + Sync {
    /// Invalidate `bytes` of the region before the CPU reads it.
    fn invalidate(&self, bytes: usize);

    /// Write back `bytes` of the region after the CPU wrote it.
    fn writeback(&self, bytes: usize);
}

/// Cache behavior of a memory region.
#[derive(Clone)]
pub enum CacheMode {
    /// Hardware-coherent; maintenance is a no-op.
    Coherent,
    /// Non-coherent; maintenance calls the injected [`CacheOps`].
    NonCoherent(Arc<dyn CacheOps>),
}

impl CacheMode {
    /// Invalidate before read, if the region needs it.
    pub fn invalidate(&self, bytes: usize) {
        if let Self::NonCoherent(ops) = self {
            ops.invalidate(bytes);
        }
    }

    /// Write back after write, if the region needs it.
    pub fn writeback(&self, bytes: usize) {
        if let Self::NonCoherent(ops) = self {
            ops.writeback(bytes);
        }
    }
}

impl std::fmt::Debug for CacheMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Coherent => write!(f, "Coherent"),
            Self::NonCoherent(_) => write!(f, "NonCoherent"),
        }
    }
}

/// Counting fake for tests: records every maintenance call.
#[derive(Debug, Default)]
pub struct CountingCache {
    invalidates: std::sync::atomic::AtomicU64,
    writebacks: std::sync::atomic::AtomicU64,
}

impl CountingCache {
    /// Creates a fresh counter pair.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of invalidate calls seen.
    pub fn invalidates(&self) -> u64 {
        self.invalidates.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Number of writeback calls seen.
    pub fn writebacks(&self) -> u64 {
        self.writebacks.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl CacheOps for CountingCache {
    fn invalidate(&self, _bytes: usize) {
        self.invalidates
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }

    fn writeback(&self, _bytes: usize) {
        self.writebacks
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
}
