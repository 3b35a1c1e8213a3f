//! Status register, panic codes and the trace ring.
//!
//! Mirrors the firmware debug surface: a 32-bit status register receives
//! panic codes of the form `0x0DEAD000 | code`, trace points are appended to
//! a circular buffer of at least one host page, and a background task drains
//! the ring into `tracing` output at a fixed interval.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::HeapRb;
use tracing::trace;

/// Panic code base pattern.
pub const PANIC_MAGIC: u32 = 0x0DEA_D000;

/// Minimum trace ring capacity: one host page of entries.
const TRACE_RING_BYTES: usize = 4096;

/// Reasons the runtime declares itself dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PanicCode {
    /// Internal memory corruption detected.
    Corruption = 0x1,
    /// A component reached an impossible lifecycle state.
    BadState = 0x2,
    /// The IPC surface received an unprocessable message.
    Ipc = 0x3,
    /// Unclassified fatal condition.
    Unknown = 0xF,
}

/// The host-visible 32-bit status register.
#[derive(Debug, Default)]
pub struct StatusRegister {
    value: AtomicU32,
}

impl StatusRegister {
    /// Creates a cleared register.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Latches a panic code; the first panic wins.
    pub fn panic(&self, code: PanicCode) {
        let encoded = PANIC_MAGIC | code as u32;
        let _ = self
            .value
            .compare_exchange(0, encoded, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// Raw register value; zero when healthy.
    pub fn read(&self) -> u32 {
        self.value.load(Ordering::SeqCst)
    }

    /// Returns `true` once a panic code has been latched.
    pub fn is_panicked(&self) -> bool {
        self.read() & PANIC_MAGIC == PANIC_MAGIC
    }

    /// Clears the register (host acknowledgment).
    pub fn clear(&self) {
        self.value.store(0, Ordering::SeqCst);
    }
}

/// One trace point: a four-byte call-site tag plus a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceEntry {
    /// Call-site tag, conventionally four ASCII bytes.
    pub tag: [u8; 4],
    /// Event payload.
    pub value: u32,
}

/// Writer half of the trace ring; cheap to clone into components.
#[derive(Clone)]
pub struct Tracer {
    producer: Arc<Mutex<ringbuf::HeapProd<TraceEntry>>>,
    dropped: Arc<AtomicU64>,
}

impl Tracer {
    /// Records a trace point; drops it (and counts the drop) when the ring
    /// is full.
    pub fn point(&self, tag: [u8; 4], value: u32) {
        if self.producer.lock().try_push(TraceEntry { tag, value }).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Entries lost to a full ring since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Reader half of the trace ring.
pub struct TraceDrain {
    consumer: ringbuf::HeapCons<TraceEntry>,
}

impl TraceDrain {
    /// Pops every buffered entry into `tracing` output and returns how many
    /// were drained.
    pub fn drain(&mut self) -> usize {
        let mut drained = 0;
        while let Some(entry) = self.consumer.try_pop() {
            let tag = std::str::from_utf8(&entry.tag).unwrap_or("????");
            trace!(target: "wavepipe::trace", tag, value = entry.value, "trace point");
            drained += 1;
        }
        drained
    }

    /// Entries currently buffered.
    pub fn pending(&self) -> usize {
        self.consumer.occupied_len()
    }

    /// Pops a single entry, for inspection in tests and host tooling.
    pub fn pop(&mut self) -> Option<TraceEntry> {
        self.consumer.try_pop()
    }
}

/// Creates the trace ring pair, sized to at least one host page.
pub fn trace_ring() -> (Tracer, TraceDrain) {
    let capacity = TRACE_RING_BYTES / std::mem::size_of::<TraceEntry>();
    let ring = HeapRb::<TraceEntry>::new(capacity.max(1));
    let (producer, consumer) = ring.split();
    (
        Tracer {
            producer: Arc::new(Mutex::new(producer)),
            dropped: Arc::new(AtomicU64::new(0)),
        },
        TraceDrain { consumer },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_code_encoding() {
        let status = StatusRegister::new();
        assert!(!status.is_panicked());
        status.panic(PanicCode::BadState);
        assert_eq!(status.read(), 0x0DEA_D002);
        assert!(status.is_panicked());
    }

    #[test]
    fn test_first_panic_wins() {
        let status = StatusRegister::new();
        status.panic(PanicCode::Corruption);
        status.panic(PanicCode::Ipc);
        assert_eq!(status.read(), PANIC_MAGIC | PanicCode::Corruption as u32);
        status.clear();
        assert_eq!(status.read(), 0);
    }

    #[test]
    fn test_trace_round_trip() {
        let (tracer, mut drain) = trace_ring();
        tracer.point(*b"tick", 42);
        tracer.point(*b"xrun", 7);
        assert_eq!(drain.pending(), 2);

        let first = drain.pop().unwrap();
        assert_eq!(&first.tag, b"tick");
        assert_eq!(first.value, 42);
        assert_eq!(drain.drain(), 1);
        assert_eq!(drain.pending(), 0);
    }

    #[test]
    fn test_ring_holds_at_least_one_page() {
        let (tracer, drain) = trace_ring();
        let capacity = TRACE_RING_BYTES / std::mem::size_of::<TraceEntry>();
        for i in 0..capacity {
            tracer.point(*b"fill", i as u32);
        }
        assert_eq!(drain.pending(), capacity);
        // One more overflows and is counted, not blocked on.
        tracer.point(*b"over", 0);
        assert_eq!(tracer.dropped(), 1);
    }
}
