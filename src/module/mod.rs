//! Processing-module interface and the adapter that hosts it.
//!
//! A module is a plug-in DSP algorithm. Its capability set is one of four
//! ABI shapes, modelled as a tagged variant so exactly one `process` flavor
//! exists per instance:
//!
//! - [`AudioStreamModule`]: reads/writes the attached ring buffers directly
//! - [`RawDataModule`]: works on linearized scratch buffers the adapter fills
//! - [`SinkSourceModule`]: moves its own bytes through the endpoint contract
//! - [`EndpointModule`]: a HOST/DAI gateway owning the DMA transfer

mod adapter;

pub use adapter::{CopyContext, DpWorkerParts, ModuleAdapter, PrepareContext};

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::component::{PathStatus, Trigger};
use crate::error::{EngineError, ProcessError};
use crate::event::XrunKind;
use crate::format::StreamFormat;
use crate::stream::{RingBuffer, SampleSink, SampleSource};

/// Which scheduler domain runs the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingDomain {
    /// Timer-driven, deadline-bounded, non-blocking.
    LowLatency,
    /// Task-scheduled; may suspend on its queue endpoints.
    Deferred,
}

/// Periodicity information handed to modules at prepare time.
#[derive(Debug, Clone, Copy)]
pub struct ModuleParams {
    /// Stream format settled by the params stage.
    pub format: StreamFormat,
    /// Frames per scheduling period.
    pub period_frames: usize,
    /// Bytes per scheduling period.
    pub period_bytes: usize,
}

/// Position of one fragment inside a configuration blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentPosition {
    /// First of several fragments; declares the total blob size.
    First {
        /// Total size of the assembled blob in bytes.
        total_size: usize,
    },
    /// Neither first nor last.
    Middle,
    /// Final fragment.
    Last,
    /// The whole blob in one fragment.
    Single,
}

/// One fragment of an opaque configuration blob.
#[derive(Debug, Clone, Copy)]
pub struct ConfigFragment<'a> {
    /// Where this fragment sits in the blob.
    pub position: FragmentPosition,
    /// Fragment payload.
    pub data: &'a [u8],
}

/// A windowed view of a source ring, handed to in-place processing modules.
///
/// Reads are frame-aligned and wrap-aware; the view tracks how many bytes the
/// module consumed so the adapter can settle pointers afterwards.
pub struct SourceView<'a> {
    ring: MutexGuard<'a, RingBuffer>,
    format: StreamFormat,
    consumed: usize,
}

impl<'a> SourceView<'a> {
    pub(crate) fn new(ring: MutexGuard<'a, RingBuffer>, format: StreamFormat) -> Self {
        Self {
            ring,
            format,
            consumed: 0,
        }
    }

    /// Stream format of the underlying buffer.
    pub fn format(&self) -> StreamFormat {
        self.format
    }

    /// Whole frames ready to read.
    pub fn available_frames(&self) -> usize {
        self.format.bytes_to_frames(self.ring.available())
    }

    /// Reads whole frames into `out`, consuming them. Returns bytes read.
    pub fn read_frames(&mut self, out: &mut [u8]) -> usize {
        let fb = self.format.frame_bytes();
        let want = out.len().min(self.ring.available());
        let want = want - want % fb.max(1);
        let n = self.ring.pop(&mut out[..want]);
        self.consumed += n;
        n
    }

    /// Copies whole frames into `out` without consuming. Returns bytes read.
    pub fn peek_frames(&self, out: &mut [u8]) -> usize {
        let fb = self.format.frame_bytes();
        let want = out.len().min(self.ring.available());
        let want = want - want % fb.max(1);
        self.ring.peek(&mut out[..want])
    }

    /// Consumes `bytes` without copying. Returns bytes skipped.
    pub fn skip(&mut self, bytes: usize) -> usize {
        let n = self.ring.consume(bytes);
        self.consumed += n;
        n
    }

    /// Moves whole frames into another ring. Returns bytes moved.
    pub(crate) fn consume_into_ring(&mut self, dst: &mut RingBuffer, bytes: usize) -> usize {
        let fb = self.format.frame_bytes().max(1);
        let want = bytes.min(self.ring.available()).min(dst.free());
        let want = want - want % fb;
        let n = crate::stream::copy_ring(&mut self.ring, dst, want);
        self.consumed += n;
        n
    }

    /// Bytes consumed through this view so far.
    pub fn consumed(&self) -> usize {
        self.consumed
    }
}

/// A windowed view of a sink ring, handed to in-place processing modules.
pub struct SinkView<'a> {
    ring: MutexGuard<'a, RingBuffer>,
    format: StreamFormat,
    produced: usize,
}

impl<'a> SinkView<'a> {
    pub(crate) fn new(ring: MutexGuard<'a, RingBuffer>, format: StreamFormat) -> Self {
        Self {
            ring,
            format,
            produced: 0,
        }
    }

    /// Stream format of the underlying buffer.
    pub fn format(&self) -> StreamFormat {
        self.format
    }

    /// Whole frames that can still be written.
    pub fn free_frames(&self) -> usize {
        self.format.bytes_to_frames(self.ring.free())
    }

    /// Writes whole frames from `data`. Returns bytes written.
    pub fn write_frames(&mut self, data: &[u8]) -> usize {
        let fb = self.format.frame_bytes();
        let want = data.len().min(self.ring.free());
        let want = want - want % fb.max(1);
        let n = self.ring.push(&data[..want]);
        self.produced += n;
        n
    }

    /// Writes `frames` frames of silence. Returns bytes written.
    pub fn write_silence(&mut self, frames: usize) -> usize {
        let n = self
            .ring
            .push_zeros(self.format.frames_to_bytes(frames));
        self.produced += n;
        n
    }

    /// Moves whole frames in from another ring. Returns bytes moved.
    pub(crate) fn write_from_ring(&mut self, src: &mut RingBuffer, bytes: usize) -> usize {
        let fb = self.format.frame_bytes().max(1);
        let want = bytes.min(src.available()).min(self.ring.free());
        let want = want - want % fb;
        let n = crate::stream::copy_ring(src, &mut self.ring, want);
        self.produced += n;
        n
    }

    /// Bytes produced through this view so far.
    pub fn produced(&self) -> usize {
        self.produced
    }
}

/// Scratch sizes a raw-data module asks the adapter to allocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawLayout {
    /// Bytes the module consumes per processing call.
    pub in_buff_size: usize,
    /// Bytes the module produces per processing call.
    pub out_buff_size: usize,
}

/// A linear scratch buffer shuttled between the adapter and a raw-data
/// module.
#[derive(Debug)]
pub struct RawBuffer {
    data: Vec<u8>,
    len: usize,
    consumed: usize,
}

impl RawBuffer {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            len: 0,
            consumed: 0,
        }
    }

    /// Total scratch capacity.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// The valid bytes currently staged.
    pub fn valid(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Appends produced bytes. Returns bytes accepted.
    pub fn produce(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.data.len() - self.len);
        self.data[self.len..self.len + n].copy_from_slice(&src[..n]);
        self.len += n;
        n
    }

    /// Marks `bytes` of the staged input as consumed by the module.
    pub fn set_consumed(&mut self, bytes: usize) {
        self.consumed = bytes.min(self.len);
    }

    /// Bytes the module consumed from this buffer.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Bytes currently staged.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` when nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Stages bytes from a ring without consuming them; the caller settles
    /// the ring by the consumed count the module reports.
    pub(crate) fn stage_from_ring_peek(&mut self, ring: &RingBuffer, bytes: usize) -> usize {
        let n = bytes.min(self.data.len());
        let got = ring.peek(&mut self.data[..n]);
        self.len = got;
        self.consumed = 0;
        got
    }

    pub(crate) fn clear(&mut self) {
        self.data.fill(0);
        self.len = 0;
        self.consumed = 0;
    }
}

/// In-place processing over the attached buffers.
pub trait AudioStreamModule: Send {
    /// Called once per prepare, after parameters have settled.
    fn prepare(&mut self, params: &ModuleParams) -> Result<(), EngineError> {
        let _ = params;
        Ok(())
    }

    /// One processing pass over `frames` frames.
    ///
    /// Sources and sinks whose component state does not match the adapter's
    /// are omitted from the slices; the module must handle either side being
    /// shorter than its maximum.
    fn process(
        &mut self,
        sources: &mut [SourceView<'_>],
        sinks: &mut [SinkView<'_>],
        frames: usize,
    ) -> Result<(), ProcessError>;

    /// Applies an assembled configuration blob.
    fn set_config(&mut self, blob: &[u8]) -> Result<(), EngineError> {
        let _ = blob;
        Err(EngineError::NotSupported { what: "set_config" })
    }

    /// Reads back the current configuration blob.
    fn get_config(&self) -> Result<Vec<u8>, EngineError> {
        Err(EngineError::NotSupported { what: "get_config" })
    }

    /// Notification of a lifecycle trigger the adapter applied.
    fn on_trigger(&mut self, trigger: Trigger) {
        let _ = trigger;
    }

    /// Drops per-prepare state.
    fn reset(&mut self) {}

    /// When `true`, Pause leaves the component Active and stops the path.
    fn no_pause(&self) -> bool {
        false
    }

    /// Frame alignment the processing kernel requires.
    fn alignment_frames(&self) -> usize {
        1
    }

    /// Upper bound of source attachments.
    fn max_sources(&self) -> usize {
        1
    }

    /// Upper bound of sink attachments.
    fn max_sinks(&self) -> usize {
        1
    }

    /// Whether the module can process the given format.
    fn supports(&self, format: &StreamFormat) -> bool {
        let _ = format;
        true
    }
}

/// Processing over linearized scratch buffers with its own cadence.
pub trait RawDataModule: Send {
    /// Reports scratch sizes; called once per prepare.
    fn prepare(&mut self, params: &ModuleParams) -> Result<RawLayout, EngineError>;

    /// One processing call. Inputs carry staged bytes and receive consumed
    /// counts; outputs receive produced bytes via [`RawBuffer::produce`].
    fn process(
        &mut self,
        inputs: &mut [RawBuffer],
        outputs: &mut [RawBuffer],
    ) -> Result<(), ProcessError>;

    /// Output format derived from the input format (e.g. a rate change).
    fn output_format(&self, input: &StreamFormat) -> StreamFormat {
        *input
    }

    /// Applies an assembled configuration blob.
    fn set_config(&mut self, blob: &[u8]) -> Result<(), EngineError> {
        let _ = blob;
        Err(EngineError::NotSupported { what: "set_config" })
    }

    /// Reads back the current configuration blob.
    fn get_config(&self) -> Result<Vec<u8>, EngineError> {
        Err(EngineError::NotSupported { what: "get_config" })
    }

    /// Notification of a lifecycle trigger the adapter applied.
    fn on_trigger(&mut self, trigger: Trigger) {
        let _ = trigger;
    }

    /// Drops per-prepare state.
    fn reset(&mut self) {}

    /// When `true`, Pause leaves the component Active and stops the path.
    fn no_pause(&self) -> bool {
        false
    }

    /// Whether the module can process the given format.
    fn supports(&self, format: &StreamFormat) -> bool {
        let _ = format;
        true
    }
}

/// Processing that moves its own bytes through the endpoint contract.
pub trait SinkSourceModule: Send {
    /// Called once per prepare with the endpoint counts.
    fn prepare(
        &mut self,
        params: &ModuleParams,
        num_sources: usize,
        num_sinks: usize,
    ) -> Result<(), EngineError> {
        let _ = (params, num_sources, num_sinks);
        Ok(())
    }

    /// One processing pass; the module reads and writes the endpoints itself.
    fn process(
        &mut self,
        sources: &[&dyn SampleSource],
        sinks: &[&dyn SampleSink],
    ) -> Result<(), ProcessError>;

    /// Module-chosen period in microseconds, when it has one.
    ///
    /// Returning `None` lets the adapter derive the period from the sink
    /// granules.
    fn period_us(&self) -> Option<u32> {
        None
    }

    /// Applies an assembled configuration blob.
    fn set_config(&mut self, blob: &[u8]) -> Result<(), EngineError> {
        let _ = blob;
        Err(EngineError::NotSupported { what: "set_config" })
    }

    /// Reads back the current configuration blob.
    fn get_config(&self) -> Result<Vec<u8>, EngineError> {
        Err(EngineError::NotSupported { what: "get_config" })
    }

    /// Notification of a lifecycle trigger the adapter applied.
    fn on_trigger(&mut self, trigger: Trigger) {
        let _ = trigger;
    }

    /// Drops per-prepare state.
    fn reset(&mut self) {}

    /// When `true`, Pause leaves the component Active and stops the path.
    fn no_pause(&self) -> bool {
        false
    }

    /// Whether the module can process the given format.
    fn supports(&self, format: &StreamFormat) -> bool {
        let _ = format;
        true
    }
}

/// Which hardware boundary an endpoint bridges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    /// DMA to host memory.
    Host,
    /// DMA to the digital audio interface.
    Dai,
}

/// Stream position reported by an endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamPosition {
    /// Frames moved across the hardware boundary since start.
    pub frames: u64,
}

/// A HOST or DAI gateway. Skips the adapter's buffer machinery entirely and
/// owns the DMA transfer model.
pub trait EndpointModule: Send {
    /// Which boundary this endpoint bridges.
    fn kind(&self) -> EndpointKind;

    /// Validates and applies stream parameters.
    fn set_params(&mut self, format: &StreamFormat) -> Result<(), EngineError>;

    /// Called once per prepare with the settled periodicity.
    fn prepare(&mut self, params: &ModuleParams) -> Result<(), EngineError> {
        let _ = params;
        Ok(())
    }

    /// One DMA descriptor refill against the attached buffers.
    fn copy(
        &mut self,
        sources: &mut [SourceView<'_>],
        sinks: &mut [SinkView<'_>],
    ) -> Result<PathStatus, ProcessError>;

    /// Current stream position.
    fn position(&self) -> StreamPosition {
        StreamPosition::default()
    }

    /// The hardware-side format, when fixed by the interface.
    fn hw_format(&self) -> Option<StreamFormat> {
        None
    }

    /// Lifecycle trigger forwarded from the adapter.
    fn on_trigger(&mut self, trigger: Trigger) -> Result<(), EngineError> {
        let _ = trigger;
        Ok(())
    }

    /// Drains in-flight data on stop. Returns `true` once drained; the
    /// scheduler forces the stop after the configured timeout.
    fn drain(&mut self) -> bool {
        true
    }

    /// Reports and clears an xrun the endpoint observed during its last copy.
    fn take_xrun(&mut self) -> Option<XrunKind> {
        None
    }

    /// The application/hardware-facing side of the endpoint's backing ring.
    fn io_handle(&self) -> Option<crate::endpoint::EndpointHandle> {
        None
    }

    /// Drops per-prepare state.
    fn reset(&mut self) {}
}

/// The tagged capability variant: exactly one processing shape per instance.
pub enum ModuleKind {
    /// In-place processing over attached buffers.
    AudioStream(Box<dyn AudioStreamModule>),
    /// Scratch-buffer processing with its own cadence.
    RawData(Box<dyn RawDataModule>),
    /// Endpoint-contract processing; shareable with a DP task.
    SinkSource(Arc<Mutex<Box<dyn SinkSourceModule>>>),
    /// HOST/DAI gateway.
    Endpoint(Box<dyn EndpointModule>),
}

impl ModuleKind {
    /// Wraps a sink-source module for potential cross-task sharing.
    pub fn sink_source(module: impl SinkSourceModule + 'static) -> Self {
        Self::SinkSource(Arc::new(Mutex::new(Box::new(module))))
    }

    /// Short name of the variant, for logs.
    pub fn mode_name(&self) -> &'static str {
        match self {
            Self::AudioStream(_) => "audio-stream",
            Self::RawData(_) => "raw-data",
            Self::SinkSource(_) => "sink-source",
            Self::Endpoint(_) => "endpoint",
        }
    }
}

impl std::fmt::Debug for ModuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ModuleKind::{}", self.mode_name())
    }
}
