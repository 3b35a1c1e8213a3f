//! IPC-style construction and control surface.
//!
//! The handler consumes abstract topology messages - create pipeline, create
//! component, create buffer, connect, complete, trigger, params, config
//! blobs - and applies them to an engine. Configuration and resource errors
//! abort the message; `CompletePipeline` additionally unwinds everything the
//! rejected pipeline had created, newest object first.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::buffer::BufferId;
use crate::component::{ComponentId, Trigger};
use crate::error::EngineError;
use crate::format::StreamFormat;
use crate::module::FragmentPosition;
use crate::pipeline::{Direction, Engine, PipelineConfig, PipelineId};
use crate::registry::{ComponentRegistry, ComponentSpec};

/// Abstract topology/control messages.
#[derive(Debug, Clone)]
pub enum IpcMessage {
    /// Create an empty pipeline.
    NewPipeline {
        /// Scheduling metadata.
        config: PipelineConfig,
    },
    /// Create a component via a registered driver.
    NewComponent {
        /// Driver key.
        driver: Uuid,
        /// Id of the new component.
        id: ComponentId,
        /// Owning pipeline.
        pipeline: PipelineId,
        /// Construction parameters.
        spec: ComponentSpec,
    },
    /// Allocate a buffer.
    NewBuffer {
        /// Owning pipeline.
        pipeline: PipelineId,
        /// Id of the new buffer.
        id: BufferId,
        /// Capacity in bytes; a multiple of the maximum frame size.
        capacity: usize,
    },
    /// Connect a component's output to a buffer.
    Connect {
        /// Producing component.
        source: ComponentId,
        /// Receiving buffer.
        buffer: BufferId,
    },
    /// Connect a buffer to a component's input. The consumer may live in a
    /// different pipeline; that is how pipelines chain.
    ConnectBuffer {
        /// Source buffer.
        buffer: BufferId,
        /// Consuming component.
        sink: ComponentId,
    },
    /// Finalize a pipeline's graph.
    CompletePipeline {
        /// The pipeline to finalize.
        id: PipelineId,
    },
    /// Destroy a pipeline and everything it owns.
    FreePipeline {
        /// The pipeline to destroy.
        id: PipelineId,
    },
    /// Apply a lifecycle trigger.
    Trigger {
        /// Target pipeline.
        pipeline: PipelineId,
        /// Trigger to apply.
        trigger: Trigger,
    },
    /// Apply stream parameters at a component, propagating downstream.
    Params {
        /// Anchor component.
        component: ComponentId,
        /// Stream format.
        format: StreamFormat,
    },
    /// Deliver one configuration blob fragment.
    SetData {
        /// Target component.
        component: ComponentId,
        /// Fragment position; the first declares the total size.
        position: FragmentPosition,
        /// Fragment payload.
        data: Vec<u8>,
    },
    /// Read a component's configuration blob back.
    GetData {
        /// Target component.
        component: ComponentId,
    },
    /// Query an endpoint's stream position.
    Position {
        /// Target endpoint component.
        component: ComponentId,
    },
}

/// Reply to a successfully handled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpcReply {
    /// The message was applied.
    Done,
    /// Configuration blob payload.
    Data(Vec<u8>),
    /// Stream position in frames.
    Position(u64),
}

/// Applies [`IpcMessage`]s to an engine using a driver registry.
pub struct IpcHandler {
    engine: Arc<Mutex<Engine>>,
    registry: Arc<ComponentRegistry>,
}

impl IpcHandler {
    /// Creates a handler over a shared engine and registry.
    pub fn new(engine: Arc<Mutex<Engine>>, registry: Arc<ComponentRegistry>) -> Self {
        Self { engine, registry }
    }

    /// Shared engine handle.
    pub fn engine(&self) -> Arc<Mutex<Engine>> {
        Arc::clone(&self.engine)
    }

    /// Handles one message.
    pub fn handle(&self, message: IpcMessage) -> Result<IpcReply, EngineError> {
        let mut engine = self.engine.lock();
        match message {
            IpcMessage::NewPipeline { config } => {
                engine.new_pipeline(config)?;
                Ok(IpcReply::Done)
            }
            IpcMessage::NewComponent {
                driver,
                id,
                pipeline,
                spec,
            } => {
                let adapter = self.registry.new_component(driver, id, &spec)?;
                engine.add_component(pipeline, adapter)?;
                Ok(IpcReply::Done)
            }
            IpcMessage::NewBuffer {
                pipeline,
                id,
                capacity,
            } => {
                engine.add_buffer(pipeline, id, capacity)?;
                Ok(IpcReply::Done)
            }
            IpcMessage::Connect { source, buffer } => {
                engine.connect_producer(source, buffer)?;
                Ok(IpcReply::Done)
            }
            IpcMessage::ConnectBuffer { buffer, sink } => {
                engine.connect_consumer(buffer, sink)?;
                Ok(IpcReply::Done)
            }
            IpcMessage::CompletePipeline { id } => {
                engine.complete_pipeline(id)?;
                Ok(IpcReply::Done)
            }
            IpcMessage::FreePipeline { id } => {
                engine.free_pipeline(id)?;
                Ok(IpcReply::Done)
            }
            IpcMessage::Trigger { pipeline, trigger } => {
                engine.trigger(pipeline, trigger)?;
                Ok(IpcReply::Done)
            }
            IpcMessage::Params { component, format } => {
                engine.params(component, &format)?;
                Ok(IpcReply::Done)
            }
            IpcMessage::SetData {
                component,
                position,
                data,
            } => {
                engine.set_data(
                    component,
                    crate::module::ConfigFragment {
                        position,
                        data: &data,
                    },
                )?;
                Ok(IpcReply::Done)
            }
            IpcMessage::GetData { component } => {
                Ok(IpcReply::Data(engine.get_data(component)?))
            }
            IpcMessage::Position { component } => {
                Ok(IpcReply::Position(engine.position(component)?.frames))
            }
        }
    }

    /// Handles a batch, aborting on the first error. Pipelines the batch
    /// created but had not completed yet are unwound before returning.
    pub fn handle_all(&self, messages: Vec<IpcMessage>) -> Result<(), EngineError> {
        let mut created = Vec::new();
        let mut completed = Vec::new();
        for message in messages {
            match &message {
                IpcMessage::NewPipeline { config } => created.push(config.id),
                IpcMessage::CompletePipeline { id } => completed.push(*id),
                _ => {}
            }
            if let Err(e) = self.handle(message) {
                debug!(error = %e, "ipc batch aborted");
                let mut engine = self.engine.lock();
                for id in created.into_iter().rev() {
                    if !completed.contains(&id) {
                        let _ = engine.free_pipeline(id);
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }
}

/// Ids used by the demo topology.
pub mod demo {
    use super::{BufferId, ComponentId, PipelineId};

    /// Playback pipeline: host, gain, mixer, gain, dai.
    pub const PLAYBACK: PipelineId = PipelineId(1);
    /// Capture pipeline: dai, gain, host.
    pub const CAPTURE: PipelineId = PipelineId(2);
    /// Tone feeder pipeline: tone, src, gain into the playback mixer.
    pub const TONE_FEED: PipelineId = PipelineId(3);

    /// Playback host copier.
    pub const HOST_OUT: ComponentId = ComponentId(1);
    /// Playback input gain.
    pub const GAIN_IN: ComponentId = ComponentId(2);
    /// The shared mixer.
    pub const MIXER: ComponentId = ComponentId(3);
    /// Playback master gain.
    pub const GAIN_MAIN: ComponentId = ComponentId(4);
    /// Playback dai copier.
    pub const DAI_OUT: ComponentId = ComponentId(5);
    /// Capture dai copier.
    pub const DAI_IN: ComponentId = ComponentId(6);
    /// Capture gain.
    pub const GAIN_CAP: ComponentId = ComponentId(7);
    /// Capture host copier.
    pub const HOST_IN: ComponentId = ComponentId(8);
    /// Tone generator.
    pub const TONE: ComponentId = ComponentId(9);
    /// Tone-path sample-rate converter.
    pub const SRC: ComponentId = ComponentId(10);
    /// Tone-path gain.
    pub const GAIN_TONE: ComponentId = ComponentId(11);

    /// Host to input gain.
    pub const B20: BufferId = BufferId(20);
    /// Input gain to mixer.
    pub const B21: BufferId = BufferId(21);
    /// Mixer to master gain.
    pub const B22: BufferId = BufferId(22);
    /// Master gain to dai.
    pub const B23: BufferId = BufferId(23);
    /// Capture dai to gain.
    pub const B24: BufferId = BufferId(24);
    /// Capture gain to host.
    pub const B25: BufferId = BufferId(25);
    /// Tone to src.
    pub const B26: BufferId = BufferId(26);
    /// Src to tone gain.
    pub const B27: BufferId = BufferId(27);
    /// Tone gain to the playback mixer.
    pub const B28: BufferId = BufferId(28);
}

/// The default topology, equivalent to the classic static pipeline set:
/// a mixed playback path, a capture path, and a tone+SRC feeder mixed into
/// playback. Connection ids are unique per pipeline and every route
/// references a defined id.
pub fn demo_topology(registry: &ComponentRegistry, format: StreamFormat) -> Vec<IpcMessage> {
    use demo::*;

    let host = registry.uuid_of("host").unwrap_or_default();
    let dai = registry.uuid_of("dai").unwrap_or_default();
    let gain = registry.uuid_of("gain").unwrap_or_default();
    let mixer = registry.uuid_of("mixer").unwrap_or_default();
    let tone = registry.uuid_of("tone").unwrap_or_default();
    let src = registry.uuid_of("src").unwrap_or_default();

    let period = format.period_bytes(1_000);
    let playback_endpoint = ComponentSpec::low_latency()
        .with_direction(Direction::Playback)
        .with_formats(vec![format]);
    let capture_endpoint = ComponentSpec::low_latency()
        .with_direction(Direction::Capture)
        .with_formats(vec![format]);
    // Tone path: 3-period SRC window at the same rate.
    let src_blob: Vec<u8> = {
        let mut blob = format.rate.to_le_bytes().to_vec();
        blob.extend_from_slice(&3u32.to_le_bytes());
        blob
    };

    vec![
        // Playback: host -> B20 -> gain -> B21 -> mixer -> B22 -> gain -> B23 -> dai
        IpcMessage::NewPipeline {
            config: PipelineConfig::new(PLAYBACK),
        },
        IpcMessage::NewComponent {
            driver: host,
            id: HOST_OUT,
            pipeline: PLAYBACK,
            spec: playback_endpoint.clone(),
        },
        IpcMessage::NewComponent {
            driver: gain,
            id: GAIN_IN,
            pipeline: PLAYBACK,
            spec: ComponentSpec::low_latency(),
        },
        IpcMessage::NewComponent {
            driver: mixer,
            id: MIXER,
            pipeline: PLAYBACK,
            spec: ComponentSpec::low_latency(),
        },
        IpcMessage::NewComponent {
            driver: gain,
            id: GAIN_MAIN,
            pipeline: PLAYBACK,
            spec: ComponentSpec::low_latency(),
        },
        IpcMessage::NewComponent {
            driver: dai,
            id: DAI_OUT,
            pipeline: PLAYBACK,
            spec: playback_endpoint.clone(),
        },
        IpcMessage::NewBuffer {
            pipeline: PLAYBACK,
            id: B20,
            capacity: period * 2,
        },
        IpcMessage::NewBuffer {
            pipeline: PLAYBACK,
            id: B21,
            capacity: period * 2,
        },
        IpcMessage::NewBuffer {
            pipeline: PLAYBACK,
            id: B22,
            capacity: period * 2,
        },
        IpcMessage::NewBuffer {
            pipeline: PLAYBACK,
            id: B23,
            capacity: period * 2,
        },
        IpcMessage::Connect {
            source: HOST_OUT,
            buffer: B20,
        },
        IpcMessage::ConnectBuffer {
            buffer: B20,
            sink: GAIN_IN,
        },
        IpcMessage::Connect {
            source: GAIN_IN,
            buffer: B21,
        },
        IpcMessage::ConnectBuffer {
            buffer: B21,
            sink: MIXER,
        },
        IpcMessage::Connect {
            source: MIXER,
            buffer: B22,
        },
        IpcMessage::ConnectBuffer {
            buffer: B22,
            sink: GAIN_MAIN,
        },
        IpcMessage::Connect {
            source: GAIN_MAIN,
            buffer: B23,
        },
        IpcMessage::ConnectBuffer {
            buffer: B23,
            sink: DAI_OUT,
        },
        IpcMessage::CompletePipeline { id: PLAYBACK },
        // Capture: dai -> B24 -> gain -> B25 -> host
        IpcMessage::NewPipeline {
            config: PipelineConfig::new(CAPTURE).direction(Direction::Capture),
        },
        IpcMessage::NewComponent {
            driver: dai,
            id: DAI_IN,
            pipeline: CAPTURE,
            spec: capture_endpoint.clone(),
        },
        IpcMessage::NewComponent {
            driver: gain,
            id: GAIN_CAP,
            pipeline: CAPTURE,
            spec: ComponentSpec::low_latency(),
        },
        IpcMessage::NewComponent {
            driver: host,
            id: HOST_IN,
            pipeline: CAPTURE,
            spec: capture_endpoint,
        },
        IpcMessage::NewBuffer {
            pipeline: CAPTURE,
            id: B24,
            capacity: period * 2,
        },
        IpcMessage::NewBuffer {
            pipeline: CAPTURE,
            id: B25,
            capacity: period * 2,
        },
        IpcMessage::Connect {
            source: DAI_IN,
            buffer: B24,
        },
        IpcMessage::ConnectBuffer {
            buffer: B24,
            sink: GAIN_CAP,
        },
        IpcMessage::Connect {
            source: GAIN_CAP,
            buffer: B25,
        },
        IpcMessage::ConnectBuffer {
            buffer: B25,
            sink: HOST_IN,
        },
        IpcMessage::CompletePipeline { id: CAPTURE },
        // Tone feeder: tone -> B26 -> src -> B27 -> gain -> B28 -> (mixer)
        IpcMessage::NewPipeline {
            config: PipelineConfig::new(TONE_FEED).priority(1),
        },
        IpcMessage::NewComponent {
            driver: tone,
            id: TONE,
            pipeline: TONE_FEED,
            spec: ComponentSpec::low_latency(),
        },
        IpcMessage::NewComponent {
            driver: src,
            id: SRC,
            pipeline: TONE_FEED,
            spec: ComponentSpec::low_latency().with_blob(src_blob),
        },
        IpcMessage::NewComponent {
            driver: gain,
            id: GAIN_TONE,
            pipeline: TONE_FEED,
            spec: ComponentSpec::low_latency(),
        },
        IpcMessage::NewBuffer {
            pipeline: TONE_FEED,
            id: B26,
            capacity: period * 16,
        },
        IpcMessage::NewBuffer {
            pipeline: TONE_FEED,
            id: B27,
            capacity: period * 8,
        },
        IpcMessage::NewBuffer {
            pipeline: TONE_FEED,
            id: B28,
            capacity: period * 2,
        },
        IpcMessage::Connect {
            source: TONE,
            buffer: B26,
        },
        IpcMessage::ConnectBuffer {
            buffer: B26,
            sink: SRC,
        },
        IpcMessage::Connect {
            source: SRC,
            buffer: B27,
        },
        IpcMessage::ConnectBuffer {
            buffer: B27,
            sink: GAIN_TONE,
        },
        IpcMessage::Connect {
            source: GAIN_TONE,
            buffer: B28,
        },
        IpcMessage::ConnectBuffer {
            buffer: B28,
            sink: MIXER,
        },
        IpcMessage::CompletePipeline { id: TONE_FEED },
    ]
}
