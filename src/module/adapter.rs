//! The module adapter: polymorphic host bridging graph buffers to a module.
//!
//! The adapter owns the component lifecycle, resolves the attached buffers at
//! prepare, and translates each scheduler `copy` into whichever processing
//! call the hosted module's ABI shape requires. HOST/DAI endpoints skip the
//! buffer machinery and forward everything to their endpoint ops.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::buffer::{avail_frames_aligned, AudioBuffer, BufferId, BufferSink, BufferSource};
use crate::component::{
    transition, ComponentId, ComponentState, PathStatus, StateChange, Trigger,
};
use crate::dp_queue::{DpQueue, DpQueueMode, DpSink, DpSource};
use crate::error::{EngineError, ProcessError};
use crate::event::XrunKind;
use crate::format::StreamFormat;
use crate::memory::CacheMode;
use crate::module::{
    ConfigFragment, EndpointKind, FragmentPosition, ModuleKind, ModuleParams, ProcessingDomain,
    RawBuffer, RawLayout, SinkSourceModule, SinkView, SourceView, StreamPosition,
};
use crate::stream::{transfer, SampleSink, SampleSource};

/// Buffers and periodicity resolved by the pipeline for a prepare call.
pub struct PrepareContext {
    /// Attached source buffers in pin order.
    pub sources: Vec<Arc<AudioBuffer>>,
    /// Attached sink buffers in pin order.
    pub sinks: Vec<Arc<AudioBuffer>>,
    /// Scheduling period of the owning pipeline.
    pub period_us: u32,
    /// Cache attributes for adapter-allocated intermediate buffers.
    pub cache: CacheMode,
    /// Whether DP queues must assume cross-core backing memory.
    pub dp_shared: bool,
}

/// Peer lifecycle states gathered by the pipeline for a copy call, parallel
/// to the adapter's source/sink buffer lists.
pub struct CopyContext {
    /// State of the component producing into each source buffer.
    pub source_states: Vec<ComponentState>,
    /// State of the component consuming from each sink buffer.
    pub sink_states: Vec<ComponentState>,
}

impl CopyContext {
    /// A context that skips nothing, for components without peers.
    pub fn all_matching(state: ComponentState, sources: usize, sinks: usize) -> Self {
        Self {
            source_states: vec![state; sources],
            sink_states: vec![state; sinks],
        }
    }
}

/// Per-prepare state of a raw-data module.
struct RawState {
    layout: RawLayout,
    inputs: Vec<RawBuffer>,
    outputs: Vec<RawBuffer>,
    /// Intermediate buffers absorbing jitter between module output and the
    /// downstream rings, one per sink.
    intermediates: Vec<Arc<AudioBuffer>>,
}

/// Per-prepare state of a DP-domain sink-source module.
struct DpState {
    /// Shadow queues carrying data from the LL graph into the module.
    ll_to_dp: Vec<Arc<DpQueue>>,
    /// Shadow queues carrying processed data back to the LL graph.
    dp_to_ll: Vec<Arc<DpQueue>>,
    notify: Arc<Notify>,
    period_us: u32,
}

/// Per-prepare endpoint handles of an LL sink-source module.
struct SinkSourceState {
    sources: Vec<BufferSource>,
    sinks: Vec<BufferSink>,
}

/// A configuration blob mid-reassembly.
struct PendingConfig {
    expected: usize,
    data: Vec<u8>,
}

/// Everything a DP worker task needs to run one module.
pub struct DpWorkerParts {
    /// Hosting component, for logs.
    pub component: ComponentId,
    /// The shared module instance.
    pub module: Arc<Mutex<Box<dyn SinkSourceModule>>>,
    /// Module-side read endpoints.
    pub sources: Vec<DpSource>,
    /// Module-side write endpoints.
    pub sinks: Vec<DpSink>,
    /// Woken by the LL shuttle after each tick.
    pub notify: Arc<Notify>,
    /// Fallback period when no wakeup arrives.
    pub period_us: u32,
}

/// Component implementation hosting a plug-in processing module.
pub struct ModuleAdapter {
    id: ComponentId,
    name: String,
    domain: ProcessingDomain,
    state: ComponentState,
    module: ModuleKind,
    format: Option<StreamFormat>,
    period_bytes: usize,
    deep_buff_bytes: usize,
    deep_completed: bool,
    sources: Vec<Arc<AudioBuffer>>,
    sinks: Vec<Arc<AudioBuffer>>,
    raw: Option<RawState>,
    dp: Option<DpState>,
    sink_source: Option<SinkSourceState>,
    total_consumed: u64,
    total_produced: u64,
    pending_config: Option<PendingConfig>,
}

impl ModuleAdapter {
    /// Creates an adapter hosting `module`; the component comes up Ready.
    pub fn new(
        id: ComponentId,
        name: impl Into<String>,
        domain: ProcessingDomain,
        module: ModuleKind,
    ) -> Self {
        let name = name.into();
        debug!(component = %id, %name, mode = module.mode_name(), "module adapter created");
        Self {
            id,
            name,
            domain,
            state: ComponentState::Ready,
            module,
            format: None,
            period_bytes: 0,
            deep_buff_bytes: 0,
            deep_completed: false,
            sources: Vec::new(),
            sinks: Vec::new(),
            raw: None,
            dp: None,
            sink_source: None,
            total_consumed: 0,
            total_produced: 0,
            pending_config: None,
        }
    }

    /// Component id.
    pub fn id(&self) -> ComponentId {
        self.id
    }

    /// Component name, for logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Scheduler domain of the hosted module.
    pub fn domain(&self) -> ProcessingDomain {
        self.domain
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ComponentState {
        self.state
    }

    /// Stream format settled by params, if any.
    pub fn format(&self) -> Option<StreamFormat> {
        self.format
    }

    /// Bytes per scheduling period once prepared.
    pub fn period_bytes(&self) -> usize {
        self.period_bytes
    }

    /// Remaining deep-buffer warm-up threshold, zero once warm.
    pub fn deep_buff_bytes(&self) -> usize {
        self.deep_buff_bytes
    }

    /// Total bytes consumed and produced since prepare, for diagnostics.
    pub fn totals(&self) -> (u64, u64) {
        (self.total_consumed, self.total_produced)
    }

    /// Which endpoint boundary this component bridges, if it is one.
    pub fn endpoint_kind(&self) -> Option<EndpointKind> {
        match &self.module {
            ModuleKind::Endpoint(m) => Some(m.kind()),
            _ => None,
        }
    }

    /// Upper bound of source attachments.
    pub fn max_sources(&self) -> usize {
        match &self.module {
            ModuleKind::AudioStream(m) => m.max_sources(),
            ModuleKind::RawData(_) | ModuleKind::Endpoint(_) => 1,
            ModuleKind::SinkSource(_) => 4,
        }
    }

    /// Upper bound of sink attachments.
    pub fn max_sinks(&self) -> usize {
        match &self.module {
            ModuleKind::AudioStream(m) => m.max_sinks(),
            ModuleKind::RawData(_) | ModuleKind::Endpoint(_) => 1,
            ModuleKind::SinkSource(_) => 4,
        }
    }

    fn no_pause(&self) -> bool {
        match &self.module {
            ModuleKind::AudioStream(m) => m.no_pause(),
            ModuleKind::RawData(m) => m.no_pause(),
            ModuleKind::SinkSource(m) => m.lock().no_pause(),
            ModuleKind::Endpoint(_) => false,
        }
    }

    fn supports(&self, format: &StreamFormat) -> bool {
        match &self.module {
            ModuleKind::AudioStream(m) => m.supports(format),
            ModuleKind::RawData(m) => m.supports(format),
            ModuleKind::SinkSource(m) => m.lock().supports(format),
            ModuleKind::Endpoint(_) => true,
        }
    }

    /// Verifies and applies stream parameters.
    ///
    /// Returns the format presented downstream, which may differ from the
    /// input for rate-changing modules.
    ///
    /// # Errors
    ///
    /// Rejects invalid or unsupported formats, and calls outside the Ready or
    /// Prepare states.
    pub fn params(&mut self, format: &StreamFormat) -> Result<StreamFormat, EngineError> {
        if !matches!(self.state, ComponentState::Ready | ComponentState::Prepare) {
            return Err(EngineError::InvalidParams {
                reason: format!("{} cannot take params in state {:?}", self.id, self.state),
            });
        }
        format.validate()?;
        if !self.supports(format) {
            return Err(EngineError::UnsupportedFormat {
                reason: format!(
                    "{} ({}) rejects {}-bit/{}Hz/{}ch",
                    self.id, self.name, format.valid_bits, format.rate, format.channels
                ),
            });
        }
        if let ModuleKind::Endpoint(m) = &mut self.module {
            m.set_params(format)?;
        }
        self.format = Some(*format);
        let out = match &self.module {
            ModuleKind::RawData(m) => m.output_format(format),
            _ => *format,
        };
        debug!(component = %self.id, rate = format.rate, channels = format.channels,
               valid_bits = format.valid_bits, "params applied");
        Ok(out)
    }

    /// Allocates per-run resources and computes periodicity.
    ///
    /// Re-preparing an already prepared component is a no-op reporting
    /// [`PathStatus::Stop`], which keeps the xrun recovery path free of
    /// allocations.
    pub fn prepare(&mut self, ctx: PrepareContext) -> Result<PathStatus, EngineError> {
        // A shared component may already be running on behalf of another
        // pipeline; leave it alone and stop this path.
        if self.state == ComponentState::Active {
            return Ok(PathStatus::Stop);
        }
        if let StateChange::AlreadySet = transition(self.state, Trigger::Prepare)? {
            warn!(component = %self.id, "already prepared");
            return Ok(PathStatus::Stop);
        }

        let format = self.format.ok_or_else(|| EngineError::InvalidParams {
            reason: format!("{} prepared before params", self.id),
        })?;

        self.sources = ctx.sources;
        self.sinks = ctx.sinks;
        self.period_bytes = format.period_bytes(ctx.period_us);
        let params = ModuleParams {
            format,
            period_frames: format.period_frames(ctx.period_us),
            period_bytes: self.period_bytes,
        };

        // Settle endpoint granules to one period each.
        for buffer in self.sources.iter().chain(self.sinks.iter()) {
            let fmt = buffer.format().unwrap_or(format);
            let granule = fmt.period_bytes(ctx.period_us);
            buffer.set_watermarks(granule, granule);
        }

        match &mut self.module {
            // HOST/DAI components skip buffer allocation entirely.
            ModuleKind::Endpoint(m) => m.prepare(&params)?,
            ModuleKind::AudioStream(m) => {
                if self.sources.is_empty() && self.sinks.is_empty() {
                    return Err(EngineError::InvalidParams {
                        reason: format!("{} has no buffers connected", self.id),
                    });
                }
                if m.max_sources() > 1 && m.max_sinks() > 1 {
                    return Err(EngineError::InvalidParams {
                        reason: format!("{} cannot fan in and out simultaneously", self.id),
                    });
                }
                m.prepare(&params)?;
            }
            ModuleKind::RawData(m) => {
                let layout = m.prepare(&params)?;
                if layout.in_buff_size == 0 || layout.out_buff_size == 0 {
                    return Err(EngineError::InvalidParams {
                        reason: format!("{} reported a zero scratch size", self.id),
                    });
                }
                self.deep_buff_bytes =
                    deep_buffer_bytes(layout.in_buff_size, self.period_bytes);
                self.deep_completed = false;
                if self.raw.is_none() {
                    let out_local =
                        local_output_size(layout.out_buff_size, self.period_bytes);
                    let frame = format.frame_bytes();
                    let cap = round_up(out_local.max(frame), frame);
                    let in_cap = layout
                        .in_buff_size
                        .max(self.deep_buff_bytes)
                        .max(self.period_bytes);
                    let mut intermediates = Vec::with_capacity(self.sinks.len());
                    for (n, sink) in self.sinks.iter().enumerate() {
                        let buffer = AudioBuffer::alloc(
                            BufferId(u32::MAX - n as u32),
                            cap,
                            frame,
                            ctx.cache.clone(),
                        )?;
                        buffer.set_format(sink.format().unwrap_or(format));
                        intermediates.push(buffer);
                    }
                    self.raw = Some(RawState {
                        layout,
                        inputs: self
                            .sources
                            .iter()
                            .map(|_| RawBuffer::new(in_cap))
                            .collect(),
                        outputs: self
                            .sinks
                            .iter()
                            .map(|_| RawBuffer::new(layout.out_buff_size))
                            .collect(),
                        intermediates,
                    });
                }
            }
            ModuleKind::SinkSource(module) => {
                let mut m = module.lock();
                m.prepare(&params, self.sources.len(), self.sinks.len())?;
                if self.domain == ProcessingDomain::Deferred {
                    if self.dp.is_none() {
                        let mode = if ctx.dp_shared {
                            DpQueueMode::Shared
                        } else {
                            DpQueueMode::Local
                        };
                        let mut ll_to_dp = Vec::with_capacity(self.sources.len());
                        for buffer in &self.sources {
                            let q = DpQueue::create(
                                buffer.min_available(),
                                buffer.min_free(),
                                mode,
                                ctx.cache.clone(),
                            );
                            if let Some(fmt) = buffer.format() {
                                q.set_format(fmt);
                            }
                            ll_to_dp.push(q);
                        }
                        let mut dp_to_ll = Vec::with_capacity(self.sinks.len());
                        let mut period = u32::MAX;
                        for buffer in &self.sinks {
                            let q = DpQueue::create(
                                buffer.min_available(),
                                buffer.min_free(),
                                mode,
                                ctx.cache.clone(),
                            );
                            let fmt = buffer.format().unwrap_or(format);
                            q.set_format(fmt);
                            dp_to_ll.push(q);
                            // Time the module has to fill one sink granule.
                            let denom =
                                (fmt.frame_bytes() as u64).max(1) * u64::from(fmt.rate).max(1);
                            let sink_period =
                                (1_000_000u64 * buffer.min_free() as u64 / denom) as u32;
                            period = period.min(sink_period.max(1));
                        }
                        let period_us = m.period_us().unwrap_or(period);
                        debug!(component = %self.id, period_us, "deferred module period");
                        self.dp = Some(DpState {
                            ll_to_dp,
                            dp_to_ll,
                            notify: Arc::new(Notify::new()),
                            period_us,
                        });
                    }
                } else if self.sink_source.is_none() {
                    self.sink_source = Some(SinkSourceState {
                        sources: self.sources.iter().map(|b| b.source()).collect(),
                        sinks: self.sinks.iter().map(|b| b.sink()).collect(),
                    });
                }
            }
        }

        self.state = ComponentState::Prepare;
        debug!(component = %self.id, period_bytes = self.period_bytes,
               deep_buff_bytes = self.deep_buff_bytes, "prepared");
        Ok(PathStatus::Continue)
    }

    /// Applies a lifecycle trigger.
    pub fn trigger(&mut self, trigger: Trigger) -> Result<PathStatus, EngineError> {
        if trigger == Trigger::Pause && self.no_pause() && self.state == ComponentState::Active
        {
            // Keep the module running and tell the scheduler to stop the
            // path here.
            return Ok(PathStatus::Stop);
        }
        if let ModuleKind::Endpoint(m) = &mut self.module {
            m.on_trigger(trigger)?;
        }
        match transition(self.state, trigger)? {
            StateChange::AlreadySet => Ok(PathStatus::Continue),
            StateChange::Changed(next) => {
                trace!(component = %self.id, ?trigger, from = ?self.state, to = ?next,
                       "state change");
                self.state = next;
                match &mut self.module {
                    ModuleKind::AudioStream(m) => m.on_trigger(trigger),
                    ModuleKind::RawData(m) => m.on_trigger(trigger),
                    ModuleKind::SinkSource(m) => m.lock().on_trigger(trigger),
                    ModuleKind::Endpoint(_) => {}
                }
                Ok(PathStatus::Continue)
            }
        }
    }

    /// One processing pass. Only legal in the Active state.
    pub fn copy(&mut self, ctx: &CopyContext) -> Result<PathStatus, ProcessError> {
        if self.state != ComponentState::Active {
            return Ok(PathStatus::Stop);
        }
        let Some(format) = self.format else {
            // Missing parameters halt the path, not the pipeline.
            return Ok(PathStatus::Stop);
        };
        let result = match &mut self.module {
            ModuleKind::Endpoint(m) => {
                copy_endpoint(m.as_mut(), &self.sources, &self.sinks, format)
            }
            ModuleKind::AudioStream(m) => copy_audio_stream(
                m.as_mut(),
                &self.sources,
                &self.sinks,
                format,
                self.state,
                ctx,
            ),
            ModuleKind::RawData(m) => copy_raw_data(
                m.as_mut(),
                &self.sources,
                &self.sinks,
                self.raw.as_mut().ok_or_else(|| {
                    ProcessError::Fatal("raw-data copy before prepare".to_string())
                })?,
                &mut self.deep_buff_bytes,
                &mut self.deep_completed,
                self.period_bytes,
                self.state,
                ctx,
            ),
            ModuleKind::SinkSource(module) => match self.domain {
                ProcessingDomain::LowLatency => {
                    let state = self.sink_source.as_ref().ok_or_else(|| {
                        ProcessError::Fatal("sink-source copy before prepare".to_string())
                    })?;
                    copy_sink_source(&mut module.lock(), state)
                }
                ProcessingDomain::Deferred => {
                    let dp = self.dp.as_ref().ok_or_else(|| {
                        ProcessError::Fatal("deferred copy before prepare".to_string())
                    })?;
                    copy_dp_shuttle(dp, &self.sources, &self.sinks)
                }
            },
        };
        match result {
            Ok((status, consumed, produced)) => {
                self.total_consumed += consumed;
                self.total_produced += produced;
                Ok(status)
            }
            Err(e) if e.is_flow_control() => {
                // Source empty or sink full: clear per-iteration accounting
                // and yield the rest of the pass.
                trace!(component = %self.id, error = %e, "flow stop");
                Ok(PathStatus::Stop)
            }
            Err(e) => Err(e),
        }
    }

    /// Releases per-prepare resources and returns to Ready.
    ///
    /// Stream parameters survive, so a reset component is observably
    /// equivalent to a freshly created one with params applied.
    pub fn reset(&mut self) -> Result<(), EngineError> {
        match transition(self.state, Trigger::Reset)? {
            StateChange::AlreadySet => return Ok(()),
            StateChange::Changed(next) => self.state = next,
        }
        match &mut self.module {
            ModuleKind::AudioStream(m) => m.reset(),
            ModuleKind::RawData(m) => m.reset(),
            ModuleKind::SinkSource(m) => m.lock().reset(),
            ModuleKind::Endpoint(m) => m.reset(),
        }
        self.raw = None;
        self.dp = None;
        self.sink_source = None;
        self.deep_buff_bytes = 0;
        self.deep_completed = false;
        self.total_consumed = 0;
        self.total_produced = 0;
        self.pending_config = None;
        debug!(component = %self.id, "reset");
        Ok(())
    }

    /// Feeds one fragment of a configuration blob; forwards the assembled
    /// blob to the module on the final fragment.
    pub fn set_data(&mut self, fragment: ConfigFragment<'_>) -> Result<(), EngineError> {
        match fragment.position {
            FragmentPosition::Single => {
                self.pending_config = None;
                self.module_set_config(fragment.data)
            }
            FragmentPosition::First { total_size } => {
                if fragment.data.len() > total_size {
                    return Err(EngineError::ConfigFragment {
                        reason: "first fragment larger than declared total".to_string(),
                    });
                }
                self.pending_config = Some(PendingConfig {
                    expected: total_size,
                    data: fragment.data.to_vec(),
                });
                Ok(())
            }
            FragmentPosition::Middle | FragmentPosition::Last => {
                let Some(pending) = self.pending_config.as_mut() else {
                    return Err(EngineError::ConfigFragment {
                        reason: "continuation fragment without a first".to_string(),
                    });
                };
                pending.data.extend_from_slice(fragment.data);
                if pending.data.len() > pending.expected {
                    self.pending_config = None;
                    return Err(EngineError::ConfigFragment {
                        reason: "fragments exceed declared total".to_string(),
                    });
                }
                if fragment.position == FragmentPosition::Last {
                    let Some(pending) = self.pending_config.take() else {
                        unreachable!("pending config checked above");
                    };
                    if pending.data.len() != pending.expected {
                        return Err(EngineError::ConfigFragment {
                            reason: format!(
                                "assembled {} bytes, declared {}",
                                pending.data.len(),
                                pending.expected
                            ),
                        });
                    }
                    self.module_set_config(&pending.data)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Reads back the module's configuration blob.
    pub fn get_data(&self) -> Result<Vec<u8>, EngineError> {
        match &self.module {
            ModuleKind::AudioStream(m) => m.get_config(),
            ModuleKind::RawData(m) => m.get_config(),
            ModuleKind::SinkSource(m) => m.lock().get_config(),
            ModuleKind::Endpoint(_) => Err(EngineError::NotSupported { what: "get_data" }),
        }
    }

    fn module_set_config(&mut self, blob: &[u8]) -> Result<(), EngineError> {
        match &mut self.module {
            ModuleKind::AudioStream(m) => m.set_config(blob),
            ModuleKind::RawData(m) => m.set_config(blob),
            ModuleKind::SinkSource(m) => m.lock().set_config(blob),
            ModuleKind::Endpoint(_) => Err(EngineError::NotSupported { what: "set_data" }),
        }
    }

    /// Stream position, for endpoints.
    pub fn position(&self) -> Result<StreamPosition, EngineError> {
        match &self.module {
            ModuleKind::Endpoint(m) => Ok(m.position()),
            _ => Err(EngineError::NotSupported { what: "position" }),
        }
    }

    /// Hardware-side format, for endpoints.
    pub fn hw_format(&self) -> Result<Option<StreamFormat>, EngineError> {
        match &self.module {
            ModuleKind::Endpoint(m) => Ok(m.hw_format()),
            _ => Err(EngineError::NotSupported { what: "hw_params" }),
        }
    }

    /// Drives endpoint drain once; `true` when nothing is in flight.
    pub fn drain(&mut self) -> bool {
        match &mut self.module {
            ModuleKind::Endpoint(m) => m.drain(),
            _ => true,
        }
    }

    /// Reports and clears an xrun the endpoint observed.
    pub fn take_endpoint_xrun(&mut self) -> Option<XrunKind> {
        match &mut self.module {
            ModuleKind::Endpoint(m) => m.take_xrun(),
            _ => None,
        }
    }

    /// Application/hardware side of an endpoint's backing ring.
    pub fn endpoint_handle(&self) -> Option<crate::endpoint::EndpointHandle> {
        match &self.module {
            ModuleKind::Endpoint(m) => m.io_handle(),
            _ => None,
        }
    }

    /// Reports and clears the deep-buffer completion edge.
    pub fn take_deep_buffer_complete(&mut self) -> bool {
        std::mem::take(&mut self.deep_completed)
    }

    /// Hands out the pieces a DP worker task needs, if this component runs a
    /// deferred module.
    pub fn dp_worker_parts(&self) -> Option<DpWorkerParts> {
        let dp = self.dp.as_ref()?;
        let ModuleKind::SinkSource(module) = &self.module else {
            return None;
        };
        Some(DpWorkerParts {
            component: self.id,
            module: Arc::clone(module),
            sources: dp.ll_to_dp.iter().map(|q| q.source()).collect(),
            sinks: dp.dp_to_ll.iter().map(|q| q.sink()).collect(),
            notify: Arc::clone(&dp.notify),
            period_us: dp.period_us,
        })
    }
}

impl std::fmt::Debug for ModuleAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleAdapter")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("mode", &self.module.mode_name())
            .field("state", &self.state)
            .finish()
    }
}

/// `(in/period or period/in) rounded up, plus one period of slack`: how many
/// scratch windows the warm-up must cover.
fn buff_periods(a: usize, b: usize) -> usize {
    let (big, small) = if a > b { (a, b) } else { (b, a) };
    if small == 0 {
        return 1;
    }
    if big % small != 0 {
        big / small + 2
    } else {
        big / small + 1
    }
}

/// Bytes of input that must accumulate before processing starts producing
/// regular output; zero when the module window already matches the period.
fn deep_buffer_bytes(in_buff_size: usize, period_bytes: usize) -> usize {
    if in_buff_size == period_bytes || period_bytes == 0 {
        return 0;
    }
    in_buff_size.min(period_bytes) * buff_periods(in_buff_size, period_bytes)
}

/// Capacity of the intermediate buffer holding module output that the
/// downstream side consumes one period at a time.
fn local_output_size(out_buff_size: usize, period_bytes: usize) -> usize {
    out_buff_size.max(period_bytes) * buff_periods(out_buff_size, period_bytes)
}

fn round_up(value: usize, multiple: usize) -> usize {
    if multiple == 0 {
        return value;
    }
    value.div_ceil(multiple) * multiple
}

type CopyResult = Result<(PathStatus, u64, u64), ProcessError>;

fn copy_endpoint(
    module: &mut dyn crate::module::EndpointModule,
    sources: &[Arc<AudioBuffer>],
    sinks: &[Arc<AudioBuffer>],
    format: StreamFormat,
) -> CopyResult {
    let mut source_views: Vec<SourceView<'_>> = sources
        .iter()
        .map(|b| SourceView::new(b.lock_ring(), b.format().unwrap_or(format)))
        .collect();
    let mut sink_views: Vec<SinkView<'_>> = sinks
        .iter()
        .map(|b| SinkView::new(b.lock_ring(), b.format().unwrap_or(format)))
        .collect();
    let status = module.copy(&mut source_views, &mut sink_views)?;
    let consumed: usize = source_views.iter().map(SourceView::consumed).sum();
    let produced: usize = sink_views.iter().map(SinkView::produced).sum();
    drop(source_views);
    for (view_produced, buffer) in sink_views.iter().map(SinkView::produced).zip(sinks) {
        buffer.cache().writeback(view_produced);
    }
    Ok((status, consumed as u64, produced as u64))
}

fn copy_audio_stream(
    module: &mut dyn crate::module::AudioStreamModule,
    sources: &[Arc<AudioBuffer>],
    sinks: &[Arc<AudioBuffer>],
    format: StreamFormat,
    state: ComponentState,
    ctx: &CopyContext,
) -> CopyResult {
    if format.rate == 0 {
        return Ok((PathStatus::Stop, 0, 0));
    }
    let align = module.alignment_frames();

    // Peers in a different lifecycle state are skipped, not zero-filled.
    // The single-source state is deliberately not checked so mixout-style
    // modules can keep producing while their producer winds down.
    let active_sources: Vec<&Arc<AudioBuffer>> = if sources.len() > 1 {
        sources
            .iter()
            .zip(&ctx.source_states)
            .filter(|(_, s)| **s == state)
            .map(|(b, _)| b)
            .collect()
    } else {
        sources.iter().collect()
    };
    let active_sinks: Vec<&Arc<AudioBuffer>> = sinks
        .iter()
        .zip(&ctx.sink_states)
        .filter(|(_, s)| **s == state)
        .map(|(b, _)| b)
        .collect();

    if active_sinks.is_empty() {
        return Ok((PathStatus::Stop, 0, 0));
    }

    // The common side drives min(frames) across the fan.
    let mut frames = usize::MAX;
    for sink in &active_sinks {
        if active_sources.is_empty() {
            let f = format.bytes_to_frames(sink.free());
            frames = frames.min(if align > 1 { f - f % align } else { f });
        } else {
            for source in &active_sources {
                frames = frames.min(avail_frames_aligned(source, sink, &format, align));
            }
        }
    }
    if frames == 0 || frames == usize::MAX {
        return Ok((PathStatus::Stop, 0, 0));
    }

    for source in &active_sources {
        source
            .cache()
            .invalidate(format.frames_to_bytes(frames));
    }

    let mut source_views: Vec<SourceView<'_>> = active_sources
        .iter()
        .map(|b| SourceView::new(b.lock_ring(), b.format().unwrap_or(format)))
        .collect();
    let mut sink_views: Vec<SinkView<'_>> = active_sinks
        .iter()
        .map(|b| SinkView::new(b.lock_ring(), b.format().unwrap_or(format)))
        .collect();

    module.process(&mut source_views, &mut sink_views, frames)?;

    let consumed: usize = source_views.iter().map(SourceView::consumed).sum();
    let produced: usize = sink_views.iter().map(SinkView::produced).sum();
    drop(source_views);
    let produced_per_sink: Vec<usize> = sink_views.iter().map(SinkView::produced).collect();
    drop(sink_views);
    for (bytes, buffer) in produced_per_sink.iter().zip(&active_sinks) {
        buffer.cache().writeback(*bytes);
    }
    Ok((PathStatus::Continue, consumed as u64, produced as u64))
}

#[allow(clippy::too_many_arguments)]
fn copy_raw_data(
    module: &mut dyn crate::module::RawDataModule,
    sources: &[Arc<AudioBuffer>],
    sinks: &[Arc<AudioBuffer>],
    raw: &mut RawState,
    deep_buff_bytes: &mut usize,
    deep_completed: &mut bool,
    period_bytes: usize,
    state: ComponentState,
    ctx: &CopyContext,
) -> CopyResult {
    // Deep-buffer warm-up: feed the downstream side zeros until the module's
    // input window has filled, without consuming any input.
    if *deep_buff_bytes > 0 {
        let input_avail = sources.first().map_or(0, |b| b.available());
        if input_avail < *deep_buff_bytes {
            let mut produced = 0u64;
            for sink in sinks {
                let n = sink.sink().write_zeros(period_bytes);
                produced += n as u64;
            }
            return Ok((PathStatus::Continue, 0, produced));
        }
        trace!(gathered = input_avail, "deep buffering ended");
        *deep_buff_bytes = 0;
        *deep_completed = true;
    }

    let format = raw
        .intermediates
        .first()
        .and_then(|b| b.format())
        .unwrap_or_else(|| StreamFormat::s16(48_000, 2));
    let min_free_frames = raw
        .intermediates
        .iter()
        .map(|b| format.bytes_to_frames(b.free()))
        .min()
        .unwrap_or(0);

    // Stage source samples into the module input scratch without consuming;
    // pointers advance by whatever the module reports back.
    for (i, source) in sources.iter().enumerate() {
        if ctx.source_states.get(i).copied() != Some(state) {
            continue;
        }
        let fmt = source.format().unwrap_or(format);
        let frames = min_free_frames.min(fmt.bytes_to_frames(source.available()));
        let bytes = (frames * fmt.frame_bytes()).min(raw.layout.in_buff_size);
        source.cache().invalidate(bytes);
        let ring = source.lock_ring();
        raw.inputs[i].stage_from_ring_peek(&ring, bytes);
    }

    match module.process(&mut raw.inputs, &mut raw.outputs) {
        Ok(()) => {}
        Err(e) if e.is_flow_control() => {}
        Err(e) => {
            for input in &mut raw.inputs {
                input.clear();
            }
            for output in &mut raw.outputs {
                output.clear();
            }
            return Err(e);
        }
    }

    // Settle input pointers by the consumed counts the module reported.
    let mut consumed_total = 0u64;
    for (input, source) in raw.inputs.iter_mut().zip(sources) {
        let consumed = input.consumed();
        if consumed > 0 {
            source.lock_ring().consume(consumed);
            consumed_total += consumed as u64;
        }
        input.clear();
    }

    // Move produced output through the intermediate buffer, then hand the
    // downstream ring as much as it can take.
    let mut produced_total = 0u64;
    for ((output, intermediate), sink) in
        raw.outputs.iter_mut().zip(&raw.intermediates).zip(sinks)
    {
        let produced = output.len();
        if produced > 0 {
            intermediate.sink().write(output.valid());
        }
        output.clear();

        let inter_avail = intermediate.available();
        if produced == 0 && inter_avail < period_bytes {
            continue;
        }
        let fmt = sink.format().unwrap_or(format);
        let bytes = inter_avail.min(sink.free());
        let bytes = bytes - bytes % fmt.frame_bytes().max(1);
        if bytes == 0 {
            continue;
        }
        let mut inter_ring = intermediate.lock_ring();
        let mut sink_ring = sink.lock_ring();
        let moved = crate::stream::copy_ring(&mut inter_ring, &mut sink_ring, bytes);
        drop(sink_ring);
        drop(inter_ring);
        sink.cache().writeback(moved);
        produced_total += moved as u64;
    }

    Ok((PathStatus::Continue, consumed_total, produced_total))
}

fn copy_sink_source(
    module: &mut Box<dyn SinkSourceModule>,
    state: &SinkSourceState,
) -> CopyResult {
    // Drain stale per-pass counters before processing.
    for s in &state.sources {
        s.take_processed();
    }
    for s in &state.sinks {
        s.take_processed();
    }
    let sources: Vec<&dyn SampleSource> =
        state.sources.iter().map(|s| s as &dyn SampleSource).collect();
    let sinks: Vec<&dyn SampleSink> =
        state.sinks.iter().map(|s| s as &dyn SampleSink).collect();
    module.process(&sources, &sinks)?;
    let consumed: u64 = state.sources.iter().map(|s| s.take_processed()).sum();
    let produced: u64 = state.sinks.iter().map(|s| s.take_processed()).sum();
    Ok((PathStatus::Continue, consumed, produced))
}

fn copy_dp_shuttle(
    dp: &DpState,
    sources: &[Arc<AudioBuffer>],
    sinks: &[Arc<AudioBuffer>],
) -> CopyResult {
    // The LL tick does no DSP for a deferred module: it only shuttles bytes
    // between the attached buffers and the shadow queues in both directions.
    let mut consumed = 0u64;
    let mut produced = 0u64;
    for (buffer, queue) in sources.iter().zip(&dp.ll_to_dp) {
        let src = buffer.source();
        let dst = queue.sink();
        let to_copy = src.available().min(dst.free());
        consumed += transfer(&src, &dst, to_copy) as u64;
    }
    for (queue, buffer) in dp.dp_to_ll.iter().zip(sinks) {
        let src = queue.source();
        let dst = buffer.sink();
        let to_copy = src.available().min(dst.free());
        produced += transfer(&src, &dst, to_copy) as u64;
    }
    dp.notify.notify_one();
    Ok((PathStatus::Continue, consumed, produced))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::AudioStreamModule;

    struct PassThrough;

    impl AudioStreamModule for PassThrough {
        fn process(
            &mut self,
            sources: &mut [SourceView<'_>],
            sinks: &mut [SinkView<'_>],
            frames: usize,
        ) -> Result<(), ProcessError> {
            let mut scratch = [0u8; 1024];
            if let (Some(src), Some(dst)) = (sources.first_mut(), sinks.first_mut()) {
                let bytes = src.format().frames_to_bytes(frames).min(scratch.len());
                let n = src.read_frames(&mut scratch[..bytes]);
                dst.write_frames(&scratch[..n]);
            }
            Ok(())
        }
    }

    fn adapter() -> ModuleAdapter {
        ModuleAdapter::new(
            ComponentId(1),
            "copy",
            ProcessingDomain::LowLatency,
            ModuleKind::AudioStream(Box::new(PassThrough)),
        )
    }

    fn buffers() -> (Arc<AudioBuffer>, Arc<AudioBuffer>) {
        let a = AudioBuffer::alloc(BufferId(1), 384, 8, CacheMode::Coherent).unwrap();
        let b = AudioBuffer::alloc(BufferId(2), 384, 8, CacheMode::Coherent).unwrap();
        let fmt = StreamFormat::s32(48_000, 2);
        a.set_format(fmt);
        b.set_format(fmt);
        (a, b)
    }

    fn prepare_ctx(src: &Arc<AudioBuffer>, dst: &Arc<AudioBuffer>) -> PrepareContext {
        PrepareContext {
            sources: vec![Arc::clone(src)],
            sinks: vec![Arc::clone(dst)],
            period_us: 1_000,
            cache: CacheMode::Coherent,
            dp_shared: false,
        }
    }

    #[test]
    fn test_lifecycle_and_pass_through_copy() {
        let (src, dst) = buffers();
        let mut adapter = adapter();
        let fmt = StreamFormat::s32(48_000, 2);

        adapter.params(&fmt).unwrap();
        assert_eq!(
            adapter.prepare(prepare_ctx(&src, &dst)).unwrap(),
            PathStatus::Continue
        );
        adapter.trigger(Trigger::Start).unwrap();
        assert_eq!(adapter.state(), ComponentState::Active);

        let payload: Vec<u8> = (0..64u8).collect();
        src.sink().write(&payload);

        let ctx = CopyContext::all_matching(ComponentState::Active, 1, 1);
        assert_eq!(adapter.copy(&ctx).unwrap(), PathStatus::Continue);

        let mut out = vec![0u8; 64];
        dst.source().read(&mut out);
        assert_eq!(out, payload);
        assert_eq!(adapter.totals(), (64, 64));
    }

    #[test]
    fn test_copy_with_empty_source_stops_path() {
        let (src, dst) = buffers();
        let mut adapter = adapter();
        adapter.params(&StreamFormat::s32(48_000, 2)).unwrap();
        adapter.prepare(prepare_ctx(&src, &dst)).unwrap();
        adapter.trigger(Trigger::Start).unwrap();

        let ctx = CopyContext::all_matching(ComponentState::Active, 1, 1);
        assert_eq!(adapter.copy(&ctx).unwrap(), PathStatus::Stop);
        assert_eq!(dst.available(), 0);
        assert_eq!(adapter.totals(), (0, 0));
    }

    #[test]
    fn test_prepare_requires_params() {
        let (src, dst) = buffers();
        let mut adapter = adapter();
        assert!(adapter.prepare(prepare_ctx(&src, &dst)).is_err());
    }

    #[test]
    fn test_reprepare_is_a_stop_without_side_effects() {
        let (src, dst) = buffers();
        let mut adapter = adapter();
        adapter.params(&StreamFormat::s32(48_000, 2)).unwrap();
        adapter.prepare(prepare_ctx(&src, &dst)).unwrap();
        assert_eq!(
            adapter.prepare(prepare_ctx(&src, &dst)).unwrap(),
            PathStatus::Stop
        );
    }

    #[test]
    fn test_reset_returns_to_ready_and_keeps_params() {
        let (src, dst) = buffers();
        let mut adapter = adapter();
        adapter.params(&StreamFormat::s32(48_000, 2)).unwrap();
        adapter.prepare(prepare_ctx(&src, &dst)).unwrap();
        adapter.trigger(Trigger::Start).unwrap();
        adapter.trigger(Trigger::Stop).unwrap();
        adapter.reset().unwrap();

        assert_eq!(adapter.state(), ComponentState::Ready);
        assert!(adapter.format().is_some());
        assert_eq!(adapter.totals(), (0, 0));
        // Prepared again without a fresh params call.
        assert_eq!(
            adapter.prepare(prepare_ctx(&src, &dst)).unwrap(),
            PathStatus::Continue
        );
    }

    #[test]
    fn test_deep_buffer_heuristic() {
        // Window equal to the period needs no warm-up.
        assert_eq!(deep_buffer_bytes(384, 384), 0);
        // Window of 3 periods, no remainder: 4 periods of warm-up.
        assert_eq!(deep_buffer_bytes(3 * 384, 384), 384 * 4);
        // Non-integral ratio adds one extra period of slack.
        assert_eq!(deep_buffer_bytes(500, 384), 384 * 3);
        // Window smaller than the period mirrors the ratio.
        assert_eq!(deep_buffer_bytes(128, 384), 128 * 4);
    }

    #[test]
    fn test_local_output_sizing() {
        assert_eq!(local_output_size(384, 384), 384 * 2);
        assert_eq!(local_output_size(3 * 384, 384), 3 * 384 * 4);
    }

    #[test]
    fn test_config_fragment_reassembly() {
        struct Config {
            blob: Vec<u8>,
        }
        impl AudioStreamModule for Config {
            fn process(
                &mut self,
                _sources: &mut [SourceView<'_>],
                _sinks: &mut [SinkView<'_>],
                _frames: usize,
            ) -> Result<(), ProcessError> {
                Ok(())
            }
            fn set_config(&mut self, blob: &[u8]) -> Result<(), EngineError> {
                self.blob = blob.to_vec();
                Ok(())
            }
            fn get_config(&self) -> Result<Vec<u8>, EngineError> {
                Ok(self.blob.clone())
            }
        }

        let mut adapter = ModuleAdapter::new(
            ComponentId(9),
            "cfg",
            ProcessingDomain::LowLatency,
            ModuleKind::AudioStream(Box::new(Config { blob: Vec::new() })),
        );

        adapter
            .set_data(ConfigFragment {
                position: FragmentPosition::First { total_size: 6 },
                data: &[1, 2],
            })
            .unwrap();
        adapter
            .set_data(ConfigFragment {
                position: FragmentPosition::Middle,
                data: &[3, 4],
            })
            .unwrap();
        adapter
            .set_data(ConfigFragment {
                position: FragmentPosition::Last,
                data: &[5, 6],
            })
            .unwrap();
        assert_eq!(adapter.get_data().unwrap(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_config_fragment_size_mismatch_rejected() {
        struct Sip;
        impl AudioStreamModule for Sip {
            fn process(
                &mut self,
                _sources: &mut [SourceView<'_>],
                _sinks: &mut [SinkView<'_>],
                _frames: usize,
            ) -> Result<(), ProcessError> {
                Ok(())
            }
            fn set_config(&mut self, _blob: &[u8]) -> Result<(), EngineError> {
                Ok(())
            }
        }
        let mut adapter = ModuleAdapter::new(
            ComponentId(9),
            "cfg",
            ProcessingDomain::LowLatency,
            ModuleKind::AudioStream(Box::new(Sip)),
        );
        adapter
            .set_data(ConfigFragment {
                position: FragmentPosition::First { total_size: 4 },
                data: &[1, 2],
            })
            .unwrap();
        assert!(adapter
            .set_data(ConfigFragment {
                position: FragmentPosition::Last,
                data: &[3],
            })
            .is_err());

        // A continuation without a first fragment is also rejected.
        assert!(adapter
            .set_data(ConfigFragment {
                position: FragmentPosition::Middle,
                data: &[0],
            })
            .is_err());
    }

    #[test]
    fn test_no_pause_module_stays_active() {
        struct Unpausable;
        impl AudioStreamModule for Unpausable {
            fn process(
                &mut self,
                _sources: &mut [SourceView<'_>],
                _sinks: &mut [SinkView<'_>],
                _frames: usize,
            ) -> Result<(), ProcessError> {
                Ok(())
            }
            fn no_pause(&self) -> bool {
                true
            }
        }
        let (src, dst) = buffers();
        let mut adapter = ModuleAdapter::new(
            ComponentId(3),
            "nopause",
            ProcessingDomain::LowLatency,
            ModuleKind::AudioStream(Box::new(Unpausable)),
        );
        adapter.params(&StreamFormat::s32(48_000, 2)).unwrap();
        adapter.prepare(prepare_ctx(&src, &dst)).unwrap();
        adapter.trigger(Trigger::Start).unwrap();

        assert_eq!(adapter.trigger(Trigger::Pause).unwrap(), PathStatus::Stop);
        assert_eq!(adapter.state(), ComponentState::Active);
    }
}
