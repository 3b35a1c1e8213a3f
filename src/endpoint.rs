//! HOST and DAI endpoint models.
//!
//! Endpoints bridge the in-DSP graph to the outside world. The host side
//! stands in for a DMA region in host memory, the DAI side for a hardware
//! FIFO; both are modelled as rings with an application-facing handle so
//! tests and embedders feed or drain them directly. A `copy` is one DMA
//! descriptor refill: at most one period per tick.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::component::{ComponentId, PathStatus, Trigger};
use crate::error::{EngineError, ProcessError};
use crate::event::XrunKind;
use crate::format::StreamFormat;
use crate::module::{
    EndpointKind, EndpointModule, ModuleAdapter, ModuleKind, ModuleParams, SinkView, SourceView,
    StreamPosition,
};
use crate::pipeline::Direction;
use crate::registry::{ComponentDriver, ComponentSpec};
use crate::stream::RingBuffer;
use uuid::Uuid;

/// Default backing capacity of an endpoint ring, in periods.
const DEFAULT_RING_PERIODS: usize = 16;

/// Application-facing handle to an endpoint's backing ring.
///
/// For a playback host this is where the application writes PCM; for a
/// capture host, where it reads. For a DAI it models the hardware side of
/// the FIFO.
#[derive(Clone)]
pub struct EndpointHandle {
    ring: Arc<Mutex<RingBuffer>>,
}

impl EndpointHandle {
    /// Writes bytes into the backing ring. Returns bytes accepted.
    pub fn write(&self, data: &[u8]) -> usize {
        self.ring.lock().push(data)
    }

    /// Reads bytes out of the backing ring. Returns bytes copied.
    pub fn read(&self, out: &mut [u8]) -> usize {
        self.ring.lock().pop(out)
    }

    /// Bytes buffered on the backing ring.
    pub fn available(&self) -> usize {
        self.ring.lock().available()
    }

    /// Room left on the backing ring.
    pub fn free(&self) -> usize {
        self.ring.lock().free()
    }

    /// Drops everything buffered.
    pub fn clear(&self) {
        self.ring.lock().clear();
    }
}

/// DMA gateway to host memory.
///
/// Offers a list of supported formats; `set_params` rejects anything not in
/// the list (an empty list accepts everything).
pub struct HostEndpoint {
    direction: Direction,
    supported: Vec<StreamFormat>,
    format: Option<StreamFormat>,
    ring: Arc<Mutex<RingBuffer>>,
    capacity: usize,
    period_bytes: usize,
    position_frames: u64,
}

impl HostEndpoint {
    /// Creates a host endpoint with a `capacity`-byte DMA region.
    pub fn new(direction: Direction, capacity: usize, supported: Vec<StreamFormat>) -> Self {
        Self {
            direction,
            supported,
            format: None,
            ring: Arc::new(Mutex::new(RingBuffer::new(capacity.max(1)))),
            capacity: capacity.max(1),
            period_bytes: 0,
            position_frames: 0,
        }
    }

    /// The application-facing side of the DMA region.
    pub fn handle(&self) -> EndpointHandle {
        EndpointHandle {
            ring: Arc::clone(&self.ring),
        }
    }
}

impl EndpointModule for HostEndpoint {
    fn kind(&self) -> EndpointKind {
        EndpointKind::Host
    }

    fn set_params(&mut self, format: &StreamFormat) -> Result<(), EngineError> {
        if !self.supported.is_empty() && !self.supported.contains(format) {
            return Err(EngineError::UnsupportedFormat {
                reason: format!(
                    "host offers {} formats, {}-bit/{}Hz is not one of them",
                    self.supported.len(),
                    format.valid_bits,
                    format.rate
                ),
            });
        }
        self.format = Some(*format);
        Ok(())
    }

    fn prepare(&mut self, params: &ModuleParams) -> Result<(), EngineError> {
        self.period_bytes = params.period_bytes;
        // Grow the DMA region if one period does not fit it.
        if self.capacity < params.period_bytes {
            *self.ring.lock() = RingBuffer::new(params.period_bytes * 2);
            self.capacity = params.period_bytes * 2;
        }
        Ok(())
    }

    fn copy(
        &mut self,
        sources: &mut [SourceView<'_>],
        sinks: &mut [SinkView<'_>],
    ) -> Result<PathStatus, ProcessError> {
        let Some(format) = self.format else {
            return Ok(PathStatus::Stop);
        };
        match self.direction {
            // Playback: host memory feeds the first pipeline buffer.
            Direction::Playback => {
                let Some(sink) = sinks.first_mut() else {
                    return Err(ProcessError::NoSpace);
                };
                let mut ring = self.ring.lock();
                let moved = sink.write_from_ring(&mut ring, self.period_bytes);
                if moved == 0 {
                    return Err(if ring.is_empty() {
                        ProcessError::NoData
                    } else {
                        ProcessError::NoSpace
                    });
                }
                self.position_frames += format.bytes_to_frames(moved) as u64;
                trace!(moved, "host refill");
            }
            // Capture: the last pipeline buffer drains into host memory.
            Direction::Capture => {
                let Some(source) = sources.first_mut() else {
                    return Err(ProcessError::NoData);
                };
                let mut ring = self.ring.lock();
                let moved = source.consume_into_ring(&mut ring, self.period_bytes);
                if moved == 0 {
                    return Err(if ring.is_full() {
                        ProcessError::NoSpace
                    } else {
                        ProcessError::NoData
                    });
                }
                self.position_frames += format.bytes_to_frames(moved) as u64;
            }
        }
        Ok(PathStatus::Continue)
    }

    fn position(&self) -> StreamPosition {
        StreamPosition {
            frames: self.position_frames,
        }
    }

    fn on_trigger(&mut self, trigger: Trigger) -> Result<(), EngineError> {
        if trigger == Trigger::Reset {
            self.position_frames = 0;
        }
        Ok(())
    }

    fn io_handle(&self) -> Option<EndpointHandle> {
        Some(self.handle())
    }

    fn reset(&mut self) {
        self.position_frames = 0;
        self.ring.lock().clear();
    }
}

/// DMA gateway to the digital audio interface.
///
/// Records underruns (playback starved) and overruns (capture with no room)
/// and surfaces them as xruns once streaming has started.
pub struct DaiEndpoint {
    direction: Direction,
    hw_format: Option<StreamFormat>,
    format: Option<StreamFormat>,
    fifo: Arc<Mutex<RingBuffer>>,
    capacity: usize,
    period_bytes: usize,
    position_frames: u64,
    started: bool,
    underruns: u64,
    overruns: u64,
    pending_xrun: Option<XrunKind>,
}

impl DaiEndpoint {
    /// Creates a DAI endpoint with a `capacity`-byte FIFO.
    pub fn new(direction: Direction, capacity: usize, hw_format: Option<StreamFormat>) -> Self {
        Self {
            direction,
            hw_format,
            format: None,
            fifo: Arc::new(Mutex::new(RingBuffer::new(capacity.max(1)))),
            capacity: capacity.max(1),
            period_bytes: 0,
            position_frames: 0,
            started: false,
            underruns: 0,
            overruns: 0,
            pending_xrun: None,
        }
    }

    /// The hardware-facing side of the FIFO.
    pub fn handle(&self) -> EndpointHandle {
        EndpointHandle {
            ring: Arc::clone(&self.fifo),
        }
    }

    /// Underruns observed since start.
    pub fn underruns(&self) -> u64 {
        self.underruns
    }

    /// Overruns observed since start.
    pub fn overruns(&self) -> u64 {
        self.overruns
    }
}

impl EndpointModule for DaiEndpoint {
    fn kind(&self) -> EndpointKind {
        EndpointKind::Dai
    }

    fn set_params(&mut self, format: &StreamFormat) -> Result<(), EngineError> {
        if let Some(hw) = &self.hw_format {
            if hw != format {
                return Err(EngineError::UnsupportedFormat {
                    reason: format!(
                        "dai interface is fixed at {}-bit/{}Hz",
                        hw.valid_bits, hw.rate
                    ),
                });
            }
        }
        self.format = Some(*format);
        Ok(())
    }

    fn prepare(&mut self, params: &ModuleParams) -> Result<(), EngineError> {
        self.period_bytes = params.period_bytes;
        if self.capacity < params.period_bytes {
            *self.fifo.lock() = RingBuffer::new(params.period_bytes * 2);
            self.capacity = params.period_bytes * 2;
        }
        Ok(())
    }

    fn copy(
        &mut self,
        sources: &mut [SourceView<'_>],
        sinks: &mut [SinkView<'_>],
    ) -> Result<PathStatus, ProcessError> {
        let Some(format) = self.format else {
            return Ok(PathStatus::Stop);
        };
        match self.direction {
            // Playback: the last pipeline buffer refills the FIFO.
            Direction::Playback => {
                let Some(source) = sources.first_mut() else {
                    return Err(ProcessError::NoData);
                };
                let mut fifo = self.fifo.lock();
                let moved = source.consume_into_ring(&mut fifo, self.period_bytes);
                if moved == 0 {
                    if self.started && !fifo.is_full() {
                        self.underruns += 1;
                        self.pending_xrun = Some(XrunKind::DaiUnderrun);
                        warn!(underruns = self.underruns, "dai underrun");
                    }
                    return Err(ProcessError::NoData);
                }
                self.position_frames += format.bytes_to_frames(moved) as u64;
            }
            // Capture: the FIFO feeds the first pipeline buffer.
            Direction::Capture => {
                let Some(sink) = sinks.first_mut() else {
                    return Err(ProcessError::NoSpace);
                };
                let mut fifo = self.fifo.lock();
                let moved = sink.write_from_ring(&mut fifo, self.period_bytes);
                if moved == 0 {
                    if self.started && fifo.is_full() {
                        self.overruns += 1;
                        self.pending_xrun = Some(XrunKind::DaiOverrun);
                        warn!(overruns = self.overruns, "dai overrun");
                    }
                    return Err(ProcessError::NoData);
                }
                self.position_frames += format.bytes_to_frames(moved) as u64;
            }
        }
        Ok(PathStatus::Continue)
    }

    fn position(&self) -> StreamPosition {
        StreamPosition {
            frames: self.position_frames,
        }
    }

    fn hw_format(&self) -> Option<StreamFormat> {
        self.hw_format
    }

    fn on_trigger(&mut self, trigger: Trigger) -> Result<(), EngineError> {
        match trigger {
            Trigger::Start | Trigger::Release => self.started = true,
            Trigger::Stop | Trigger::Pause => self.started = false,
            Trigger::Reset => {
                self.started = false;
                self.position_frames = 0;
            }
            Trigger::Prepare => {}
        }
        Ok(())
    }

    fn drain(&mut self) -> bool {
        // The interface clocks the FIFO out on its own; stopping only has to
        // wait for the data already handed to the hardware.
        self.fifo.lock().is_empty()
    }

    fn take_xrun(&mut self) -> Option<XrunKind> {
        self.pending_xrun.take()
    }

    fn io_handle(&self) -> Option<EndpointHandle> {
        Some(self.handle())
    }

    fn reset(&mut self) {
        self.fifo.lock().clear();
        self.position_frames = 0;
        self.underruns = 0;
        self.overruns = 0;
        self.pending_xrun = None;
        self.started = false;
    }
}

/// Driver constructing host-copier components.
pub struct HostDriver;

impl ComponentDriver for HostDriver {
    fn uuid(&self) -> Uuid {
        Uuid::from_u128(0x8b9d_100c_6d78_418f_90a4_e065_4d66_ef2a)
    }

    fn name(&self) -> &str {
        "host"
    }

    fn create(&self, id: ComponentId, spec: &ComponentSpec) -> Result<ModuleAdapter, EngineError> {
        let direction = spec.direction.unwrap_or(Direction::Playback);
        let capacity = if spec.capacity > 0 {
            spec.capacity
        } else {
            DEFAULT_RING_PERIODS * 384
        };
        Ok(ModuleAdapter::new(
            id,
            "host",
            spec.domain,
            ModuleKind::Endpoint(Box::new(HostEndpoint::new(
                direction,
                capacity,
                spec.formats.clone(),
            ))),
        ))
    }
}

/// Driver constructing dai-copier components.
pub struct DaiDriver;

impl ComponentDriver for DaiDriver {
    fn uuid(&self) -> Uuid {
        Uuid::from_u128(0xc2b0_0c2b_3039_4b90_8a15_6b96_b2b4_b8f4)
    }

    fn name(&self) -> &str {
        "dai"
    }

    fn create(&self, id: ComponentId, spec: &ComponentSpec) -> Result<ModuleAdapter, EngineError> {
        let direction = spec.direction.unwrap_or(Direction::Playback);
        let capacity = if spec.capacity > 0 {
            spec.capacity
        } else {
            DEFAULT_RING_PERIODS * 384
        };
        let hw_format = spec.formats.first().copied();
        Ok(ModuleAdapter::new(
            id,
            "dai",
            spec.domain,
            ModuleKind::Endpoint(Box::new(DaiEndpoint::new(direction, capacity, hw_format))),
        ))
    }
}

pub(crate) fn host_driver() -> Arc<dyn ComponentDriver> {
    Arc::new(HostDriver)
}

pub(crate) fn dai_driver() -> Arc<dyn ComponentDriver> {
    Arc::new(DaiDriver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{AudioBuffer, BufferId};
    use crate::memory::CacheMode;
    use crate::stream::{SampleSink, SampleSource};

    fn fmt() -> StreamFormat {
        StreamFormat::s16(48_000, 2)
    }

    fn pipeline_buffer() -> Arc<AudioBuffer> {
        let buf = AudioBuffer::alloc(BufferId(1), 1536, 4, CacheMode::Coherent).unwrap();
        buf.set_format(fmt());
        buf
    }

    fn params() -> ModuleParams {
        ModuleParams {
            format: fmt(),
            period_frames: 48,
            period_bytes: fmt().period_bytes(1_000),
        }
    }

    #[test]
    fn test_host_playback_refills_one_period() {
        let mut host = HostEndpoint::new(Direction::Playback, 4096, vec![fmt()]);
        host.set_params(&fmt()).unwrap();
        host.prepare(&params()).unwrap();

        let payload = vec![7u8; 1000];
        host.handle().write(&payload);

        let buf = pipeline_buffer();
        let mut sinks = vec![SinkView::new(buf.lock_ring(), fmt())];
        host.copy(&mut [], &mut sinks).unwrap();
        drop(sinks);

        // One period only, frame-aligned.
        assert_eq!(buf.available(), fmt().period_bytes(1_000));
        assert_eq!(host.position().frames, 48);
    }

    #[test]
    fn test_host_empty_is_no_data() {
        let mut host = HostEndpoint::new(Direction::Playback, 4096, Vec::new());
        host.set_params(&fmt()).unwrap();
        host.prepare(&params()).unwrap();

        let buf = pipeline_buffer();
        let mut sinks = vec![SinkView::new(buf.lock_ring(), fmt())];
        let err = host.copy(&mut [], &mut sinks).unwrap_err();
        assert!(err.is_flow_control());
    }

    #[test]
    fn test_host_rejects_format_not_in_list() {
        let mut host =
            HostEndpoint::new(Direction::Playback, 4096, vec![StreamFormat::s16(48_000, 2)]);
        assert!(host.set_params(&StreamFormat::s32(48_000, 2)).is_err());
        assert!(host.set_params(&StreamFormat::s16(48_000, 2)).is_ok());
    }

    #[test]
    fn test_dai_playback_and_underrun_accounting() {
        let mut dai = DaiEndpoint::new(Direction::Playback, 4096, None);
        dai.set_params(&fmt()).unwrap();
        dai.prepare(&params()).unwrap();
        dai.on_trigger(Trigger::Start).unwrap();

        let buf = pipeline_buffer();
        buf.sink().write(&vec![3u8; 384]);

        let mut sources = vec![SourceView::new(buf.lock_ring(), fmt())];
        dai.copy(&mut sources, &mut []).unwrap();
        drop(sources);
        assert_eq!(dai.handle().available(), 192); // one period moved
        assert_eq!(dai.underruns(), 0);

        // Second period drains the buffer; the third refill finds nothing.
        let mut sources = vec![SourceView::new(buf.lock_ring(), fmt())];
        dai.copy(&mut sources, &mut []).unwrap();
        drop(sources);

        let mut sources = vec![SourceView::new(buf.lock_ring(), fmt())];
        let err = dai.copy(&mut sources, &mut []).unwrap_err();
        assert!(err.is_flow_control());
        assert_eq!(dai.underruns(), 1);
        assert_eq!(dai.take_xrun(), Some(XrunKind::DaiUnderrun));
        assert_eq!(dai.take_xrun(), None);
    }

    #[test]
    fn test_dai_capture_feeds_pipeline() {
        let mut dai = DaiEndpoint::new(Direction::Capture, 4096, None);
        dai.set_params(&fmt()).unwrap();
        dai.prepare(&params()).unwrap();
        dai.on_trigger(Trigger::Start).unwrap();

        dai.handle().write(&vec![9u8; 400]);
        let buf = pipeline_buffer();
        let mut sinks = vec![SinkView::new(buf.lock_ring(), fmt())];
        dai.copy(&mut [], &mut sinks).unwrap();
        drop(sinks);
        assert_eq!(buf.available(), 192);
    }

    #[test]
    fn test_dai_drain_tracks_fifo() {
        let mut dai = DaiEndpoint::new(Direction::Playback, 4096, None);
        assert!(dai.drain());
        dai.handle().write(&[0; 64]);
        assert!(!dai.drain());
        dai.handle().clear();
        assert!(dai.drain());
    }

    #[test]
    fn test_underrun_not_counted_before_start() {
        let mut dai = DaiEndpoint::new(Direction::Playback, 4096, None);
        dai.set_params(&fmt()).unwrap();
        dai.prepare(&params()).unwrap();

        let buf = pipeline_buffer();
        let mut sources = vec![SourceView::new(buf.lock_ring(), fmt())];
        let _ = dai.copy(&mut sources, &mut []);
        drop(sources);
        assert_eq!(dai.underruns(), 0);
    }
}
