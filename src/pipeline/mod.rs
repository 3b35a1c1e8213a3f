//! Pipelines and the engine that owns the graph.
//!
//! A pipeline is the scheduling unit: a connected subgraph of components with
//! one period, deadline and priority. The [`Engine`] owns the arena and the
//! pipeline table; the async scheduler wraps it in a mutex and drives
//! [`Engine::tick`] from the timer domain. All engine methods are synchronous
//! and deterministic, so tests can drive ticks directly.

mod pass;
mod xrun;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::buffer::{AudioBuffer, BufferId};
use crate::component::{ComponentId, ComponentState, PathStatus, Trigger};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::event::{EngineEvent, EventCallback};
use crate::format::StreamFormat;
use crate::graph::{AttachDirection, AudioGraph};
use crate::memory::CacheMode;
use crate::module::{
    ConfigFragment, DpWorkerParts, ModuleAdapter, PrepareContext, ProcessingDomain,
    StreamPosition,
};
use crate::trace::{PanicCode, StatusRegister, TraceDrain, Tracer};

use xrun::XrunTracker;

/// Identifier of a pipeline, unique within the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipelineId(pub u32);

impl std::fmt::Display for PipelineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pipe-{}", self.0)
    }
}

/// Which clock drives a pipeline's copy pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeDomain {
    /// The low-latency periodic timer.
    Timer,
    /// DMA completion pacing (scheduled on the same timer in this model).
    Dma,
}

/// Stream direction of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host memory towards the audio interface.
    Playback,
    /// Audio interface towards host memory.
    Capture,
}

/// Static scheduling metadata of a pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Pipeline id.
    pub id: PipelineId,
    /// Core the LL pass runs on.
    pub core: u32,
    /// Scheduling priority; lower values run earlier within a tick.
    pub priority: u32,
    /// Deadline for one copy pass, in microseconds.
    pub deadline_us: u32,
    /// Scheduling period, in microseconds.
    pub period_us: u32,
    /// Driving clock.
    pub time_domain: TimeDomain,
    /// Stream direction.
    pub direction: Direction,
}

impl PipelineConfig {
    /// A 1 ms timer-domain playback pipeline on core 0.
    pub fn new(id: PipelineId) -> Self {
        Self {
            id,
            core: 0,
            priority: 0,
            deadline_us: 1_000,
            period_us: 1_000,
            time_domain: TimeDomain::Timer,
            direction: Direction::Playback,
        }
    }

    /// Sets the direction.
    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    /// Sets the priority (lower runs earlier).
    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets period and deadline together, the common case.
    pub fn period_us(mut self, period_us: u32) -> Self {
        self.period_us = period_us;
        self.deadline_us = period_us;
        self
    }
}

/// Resolved layout of a completed pipeline, for host tooling and tests.
#[derive(Debug, Clone)]
pub struct PipelineInfo {
    /// Lifecycle state.
    pub state: ComponentState,
    /// Components in copy order, source endpoint first.
    pub order: Vec<ComponentId>,
    /// The component feeding the pipeline.
    pub source_component: Option<ComponentId>,
    /// The component draining the pipeline.
    pub sink_component: Option<ComponentId>,
    /// The component owning the pipeline cadence: the interface side for
    /// playback, the capture source for capture.
    pub scheduling_component: Option<ComponentId>,
}

/// Runtime state of one pipeline.
pub(crate) struct Pipeline {
    pub config: PipelineConfig,
    pub complete: bool,
    pub state: ComponentState,
    /// Topological order, source endpoint first.
    pub order: Vec<ComponentId>,
    pub source_comp: Option<ComponentId>,
    pub sink_comp: Option<ComponentId>,
    pub sched_comp: Option<ComponentId>,
    pub xrun: XrunTracker,
}

impl Pipeline {
    fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            complete: false,
            state: ComponentState::Init,
            order: Vec::new(),
            source_comp: None,
            sink_comp: None,
            sched_comp: None,
            xrun: XrunTracker::new(),
        }
    }
}

/// Maximum frame size buffers must align their capacity to: eight channels
/// of 4-byte containers.
pub const MAX_FRAME_BYTES: usize = 32;

/// The pipeline runtime: graph arena, pipeline table and copy-pass driver.
pub struct Engine {
    pub(crate) config: EngineConfig,
    cache: CacheMode,
    pub(crate) graph: AudioGraph,
    pub(crate) pipelines: HashMap<PipelineId, Pipeline>,
    pub(crate) events: Option<EventCallback>,
    pub(crate) status: Arc<StatusRegister>,
    pub(crate) tracer: Tracer,
    trace_drain: Option<TraceDrain>,
    /// Workers staged by prepare, handed to the scheduler.
    pub(crate) pending_dp_workers: Vec<DpWorkerParts>,
    /// Global LL tick counter.
    pub(crate) tick_count: u64,
}

impl Engine {
    /// Creates an engine with the given configuration, coherent memory and
    /// no event callback.
    pub fn new(config: EngineConfig) -> Self {
        let (tracer, trace_drain) = crate::trace::trace_ring();
        Self {
            config,
            cache: CacheMode::Coherent,
            graph: AudioGraph::new(),
            pipelines: HashMap::new(),
            events: None,
            status: StatusRegister::new(),
            tracer,
            trace_drain: Some(trace_drain),
            pending_dp_workers: Vec::new(),
            tick_count: 0,
        }
    }

    /// Installs an event callback.
    pub fn with_event_callback(mut self, callback: EventCallback) -> Self {
        self.events = Some(callback);
        self
    }

    /// Selects the cache behavior of allocated buffers.
    pub fn with_cache(mut self, cache: CacheMode) -> Self {
        self.cache = cache;
        self
    }

    /// The host-visible status register.
    pub fn status(&self) -> Arc<StatusRegister> {
        Arc::clone(&self.status)
    }

    /// Writer handle for trace points.
    pub fn tracer(&self) -> Tracer {
        self.tracer.clone()
    }

    /// Takes the trace drain; the scheduler owns it afterwards.
    pub fn take_trace_drain(&mut self) -> Option<TraceDrain> {
        self.trace_drain.take()
    }

    pub(crate) fn emit(&self, event: EngineEvent) {
        if let Some(callback) = &self.events {
            callback(event);
        }
    }

    /// Creates an empty pipeline.
    pub fn new_pipeline(&mut self, config: PipelineConfig) -> Result<(), EngineError> {
        if self.pipelines.contains_key(&config.id) {
            return Err(EngineError::DuplicateId {
                what: config.id.to_string(),
            });
        }
        debug!(pipeline = %config.id, period_us = config.period_us, "pipeline created");
        self.pipelines.insert(config.id, Pipeline::new(config));
        Ok(())
    }

    /// Inserts a constructed component into a pipeline's subgraph.
    pub fn add_component(
        &mut self,
        pipeline: PipelineId,
        adapter: ModuleAdapter,
    ) -> Result<ComponentId, EngineError> {
        if !self.pipelines.contains_key(&pipeline) {
            return Err(EngineError::UnknownPipeline { id: pipeline });
        }
        let id = adapter.id();
        self.graph.insert_component(pipeline, adapter)?;
        Ok(id)
    }

    /// Allocates a buffer inside a pipeline.
    pub fn add_buffer(
        &mut self,
        pipeline: PipelineId,
        id: BufferId,
        capacity: usize,
    ) -> Result<(), EngineError> {
        if !self.pipelines.contains_key(&pipeline) {
            return Err(EngineError::UnknownPipeline { id: pipeline });
        }
        let buffer = AudioBuffer::alloc(id, capacity, MAX_FRAME_BYTES, self.cache.clone())?;
        self.graph.insert_buffer(pipeline, buffer)
    }

    /// Connects a component's output to a buffer.
    pub fn connect_producer(
        &mut self,
        component: ComponentId,
        buffer: BufferId,
    ) -> Result<(), EngineError> {
        self.graph.connect_producer(component, buffer)
    }

    /// Connects a buffer to a component's input.
    pub fn connect_consumer(
        &mut self,
        buffer: BufferId,
        component: ComponentId,
    ) -> Result<(), EngineError> {
        self.graph.connect_consumer(buffer, component)
    }

    /// Finalizes a pipeline: resolves topological order and the endpoint
    /// components, rejecting cyclic or disconnected graphs.
    ///
    /// On rejection every component and buffer created for the pipeline is
    /// freed, newest first, and the pipeline entry itself is removed.
    pub fn complete_pipeline(&mut self, id: PipelineId) -> Result<(), EngineError> {
        let pipeline = self
            .pipelines
            .get(&id)
            .ok_or(EngineError::UnknownPipeline { id })?;
        if pipeline.complete {
            return Err(EngineError::AlreadyComplete { pipeline: id });
        }
        let direction = pipeline.config.direction;

        let order = match self.graph.topo_order(id) {
            Ok(order) if !order.is_empty() => order,
            Ok(_) => {
                self.unwind_pipeline(id);
                return Err(EngineError::GraphDisconnected { pipeline: id });
            }
            Err(e) => {
                self.unwind_pipeline(id);
                return Err(e);
            }
        };

        let source_comp = order.first().copied();
        let sink_comp = order.last().copied();
        // The cadence owner sits at the hardware end of the stream.
        let sched_comp = match direction {
            Direction::Playback => sink_comp,
            Direction::Capture => source_comp,
        };

        let Some(pipeline) = self.pipelines.get_mut(&id) else {
            return Err(EngineError::UnknownPipeline { id });
        };
        pipeline.order = order;
        pipeline.source_comp = source_comp;
        pipeline.sink_comp = sink_comp;
        pipeline.sched_comp = sched_comp;
        pipeline.complete = true;
        pipeline.state = ComponentState::Ready;
        debug!(pipeline = %id, components = pipeline.order.len(), "pipeline complete");
        Ok(())
    }

    fn unwind_pipeline(&mut self, id: PipelineId) {
        warn!(pipeline = %id, "unwinding partially built pipeline");
        self.graph.remove_pipeline(id);
        self.pipelines.remove(&id);
    }

    /// Destroys a pipeline and everything it owns.
    pub fn free_pipeline(&mut self, id: PipelineId) -> Result<(), EngineError> {
        if !self.pipelines.contains_key(&id) {
            return Err(EngineError::UnknownPipeline { id });
        }
        self.unwind_pipeline(id);
        Ok(())
    }

    /// Applies stream parameters at a component and propagates them to every
    /// component downstream of it.
    ///
    /// Components that are already running (a shared mixer serving another
    /// pipeline) are left untouched and end the propagation on their branch.
    pub fn params(
        &mut self,
        component: ComponentId,
        format: &StreamFormat,
    ) -> Result<(), EngineError> {
        format.validate()?;
        let mut queue = vec![(component, *format)];
        let mut visited = std::collections::HashSet::new();
        while let Some((comp, fmt)) = queue.pop() {
            if !visited.insert(comp) {
                continue;
            }
            let node = self.graph.component(comp)?;
            if !matches!(
                node.adapter.state(),
                ComponentState::Ready | ComponentState::Prepare
            ) {
                continue;
            }
            let out = self.graph.component_mut(comp)?.adapter.params(&fmt)?;
            let sink_ids: Vec<BufferId> = self
                .graph
                .component(comp)?
                .attachments
                .iter()
                .filter(|a| a.direction == AttachDirection::Sink)
                .map(|a| a.buffer)
                .collect();
            for buffer_id in sink_ids {
                self.graph.buffer(buffer_id)?.set_format(out);
                if let Some(consumer) = self.graph.ends(buffer_id)?.consumer {
                    queue.push((consumer, out));
                }
            }
        }
        Ok(())
    }

    /// Applies a lifecycle trigger to a pipeline.
    ///
    /// Start and Release walk sink-to-source so consumers are armed before
    /// their producers feed them; everything else walks source-to-sink.
    /// A [`PathStatus::Stop`] return means a component refused the trigger
    /// (a `no_pause` module) and the pipeline state was left unchanged.
    ///
    /// An illegal transition is a fatal condition: the error is returned and
    /// the status register latches a panic code for the host.
    pub fn trigger(
        &mut self,
        id: PipelineId,
        trigger: Trigger,
    ) -> Result<PathStatus, EngineError> {
        let result = self.trigger_walk(id, trigger);
        if let Err(EngineError::InvalidTransition { .. }) = &result {
            self.status.panic(PanicCode::BadState);
        }
        result
    }

    fn trigger_walk(
        &mut self,
        id: PipelineId,
        trigger: Trigger,
    ) -> Result<PathStatus, EngineError> {
        let pipeline = self
            .pipelines
            .get(&id)
            .ok_or(EngineError::UnknownPipeline { id })?;
        if !pipeline.complete {
            return Err(EngineError::NotComplete { pipeline: id });
        }
        let mut order = pipeline.order.clone();
        if matches!(trigger, Trigger::Start | Trigger::Release) {
            order.reverse();
        }
        let period_us = pipeline.config.period_us;

        for comp in order {
            let status = match trigger {
                Trigger::Prepare => {
                    let ctx = PrepareContext {
                        sources: self.graph.source_buffers(comp),
                        sinks: self.graph.sink_buffers(comp),
                        period_us,
                        cache: self.cache.clone(),
                        dp_shared: false,
                    };
                    let node = self.graph.component_mut(comp)?;
                    let status = node.adapter.prepare(ctx)?;
                    if status == PathStatus::Continue
                        && node.adapter.domain() == ProcessingDomain::Deferred
                    {
                        if let Some(parts) = node.adapter.dp_worker_parts() {
                            self.pending_dp_workers.push(parts);
                        }
                    }
                    // A re-prepare or a shared, already-active component is
                    // an idempotent no-op; keep arming the rest.
                    PathStatus::Continue
                }
                Trigger::Reset => {
                    self.graph.component_mut(comp)?.adapter.reset()?;
                    PathStatus::Continue
                }
                _ => self.graph.component_mut(comp)?.adapter.trigger(trigger)?,
            };
            if status == PathStatus::Stop {
                debug!(pipeline = %id, component = %comp, ?trigger, "trigger stopped path");
                return Ok(PathStatus::Stop);
            }
        }

        let Some(pipeline) = self.pipelines.get_mut(&id) else {
            return Err(EngineError::UnknownPipeline { id });
        };
        let (next, name) = match trigger {
            Trigger::Prepare => (ComponentState::Prepare, "prepare"),
            Trigger::Start | Trigger::Release => (ComponentState::Active, "active"),
            Trigger::Pause => (ComponentState::Paused, "paused"),
            Trigger::Stop => (ComponentState::Prepare, "stopped"),
            Trigger::Reset => (ComponentState::Ready, "ready"),
        };
        pipeline.state = next;
        if trigger == Trigger::Reset {
            pipeline.xrun.reset();
        }
        self.emit(EngineEvent::PipelineState {
            pipeline: id,
            state: name,
        });
        Ok(PathStatus::Continue)
    }

    /// Feeds a configuration fragment to a component.
    pub fn set_data(
        &mut self,
        component: ComponentId,
        fragment: ConfigFragment<'_>,
    ) -> Result<(), EngineError> {
        self.graph.component_mut(component)?.adapter.set_data(fragment)
    }

    /// Reads a component's configuration blob back.
    pub fn get_data(&self, component: ComponentId) -> Result<Vec<u8>, EngineError> {
        self.graph.component(component)?.adapter.get_data()
    }

    /// Stream position of an endpoint component.
    pub fn position(&self, component: ComponentId) -> Result<StreamPosition, EngineError> {
        self.graph.component(component)?.adapter.position()
    }

    /// Current lifecycle state of a pipeline.
    pub fn pipeline_state(&self, id: PipelineId) -> Result<ComponentState, EngineError> {
        self.pipelines
            .get(&id)
            .map(|p| p.state)
            .ok_or(EngineError::UnknownPipeline { id })
    }

    /// Resolved layout of a pipeline after `complete`.
    pub fn pipeline_info(&self, id: PipelineId) -> Result<PipelineInfo, EngineError> {
        let pipeline = self
            .pipelines
            .get(&id)
            .ok_or(EngineError::UnknownPipeline { id })?;
        Ok(PipelineInfo {
            state: pipeline.state,
            order: pipeline.order.clone(),
            source_component: pipeline.source_comp,
            sink_component: pipeline.sink_comp,
            scheduling_component: pipeline.sched_comp,
        })
    }

    /// Current lifecycle state of a component.
    pub fn component_state(&self, id: ComponentId) -> Result<ComponentState, EngineError> {
        self.graph
            .component_state(id)
            .ok_or(EngineError::UnknownComponent { id })
    }

    /// Shared handle to a buffer, mainly for tests and host tooling.
    pub fn buffer(&self, id: BufferId) -> Result<Arc<AudioBuffer>, EngineError> {
        self.graph.buffer(id)
    }

    /// Consumed/produced byte totals of a component.
    pub fn component_totals(&self, id: ComponentId) -> Result<(u64, u64), EngineError> {
        Ok(self.graph.component(id)?.adapter.totals())
    }

    /// Endpoint components of a pipeline, for the scheduler's drain loop.
    pub fn endpoint_components(&self, id: PipelineId) -> Vec<ComponentId> {
        let Some(pipeline) = self.pipelines.get(&id) else {
            return Vec::new();
        };
        pipeline
            .order
            .iter()
            .copied()
            .filter(|c| {
                self.graph
                    .component(*c)
                    .map(|n| n.adapter.endpoint_kind().is_some())
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Endpoint kind of a component, if it is an endpoint.
    pub fn endpoint_kind(&self, id: ComponentId) -> Option<crate::module::EndpointKind> {
        self.graph
            .component(id)
            .ok()
            .and_then(|n| n.adapter.endpoint_kind())
    }

    /// Application/hardware side of an endpoint's backing ring, for feeding
    /// and draining from outside the graph.
    pub fn endpoint_handle(
        &self,
        id: ComponentId,
    ) -> Option<crate::endpoint::EndpointHandle> {
        self.graph
            .component(id)
            .ok()
            .and_then(|n| n.adapter.endpoint_handle())
    }

    /// Drives one drain step on an endpoint; `true` when drained.
    pub fn drain_component(&mut self, id: ComponentId) -> bool {
        self.graph
            .component_mut(id)
            .map(|n| n.adapter.drain())
            .unwrap_or(true)
    }

    /// Hands staged DP workers to the scheduler.
    pub fn take_dp_workers(&mut self) -> Vec<DpWorkerParts> {
        std::mem::take(&mut self.pending_dp_workers)
    }

    /// Ids of all pipelines.
    pub fn pipeline_ids(&self) -> Vec<PipelineId> {
        let mut ids: Vec<_> = self.pipelines.keys().copied().collect();
        ids.sort();
        ids
    }
}
