//! # wavepipe
//!
//! **Note:** This crate is under active development. The API may change before 1.0.
//!
//! A real-time audio pipeline runtime: a graph of processing components and
//! ring buffers transporting samples between a host endpoint and an audio
//! interface endpoint under per-period deadlines.
//!
//! `wavepipe` provides the in-graph machinery of a DSP audio firmware as a
//! portable library: single-producer/single-consumer audio buffers, a
//! double-buffered queue decoupling low-latency and deferred processing, a
//! module adapter hosting plug-in DSP algorithms behind three ABI shapes, a
//! lifecycle state machine, a timer-domain scheduler with xrun recovery, and
//! an IPC-style construction surface.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use wavepipe::{
//!     demo_topology, ComponentRegistry, Engine, EngineConfig, IpcHandler, Scheduler,
//!     StreamFormat, Trigger,
//! };
//! use wavepipe::ipc::demo;
//! use std::sync::Arc;
//! use parking_lot::Mutex;
//!
//! # async fn run() -> Result<(), wavepipe::EngineError> {
//! let registry = Arc::new(ComponentRegistry::with_builtins());
//! let engine = Engine::new(EngineConfig::default());
//! let scheduler = Scheduler::spawn(engine);
//!
//! // Build the default topology over the IPC surface.
//! let handler = IpcHandler::new(scheduler.engine(), Arc::clone(&registry));
//! let format = StreamFormat::s32(48_000, 2);
//! handler.handle_all(demo_topology(&registry, format))?;
//!
//! // Feed the playback host endpoint and start streaming.
//! handler.handle(wavepipe::IpcMessage::Params { component: demo::HOST_OUT, format })?;
//! scheduler.trigger(demo::PLAYBACK, Trigger::Prepare).await?;
//! scheduler.trigger(demo::PLAYBACK, Trigger::Start).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! The crate keeps a strict split between the deadline path and everything
//! else:
//!
//! - **Copy passes**: synchronous, non-blocking, one topological walk per
//!   pipeline per tick
//! - **DP workers**: tokio tasks that may suspend, exchanging data with the
//!   timer domain only through swap queues
//! - **Control**: triggers posted into the scheduler, honored at the next
//!   scheduling point; stops drain endpoints under a bounded timeout

#![warn(missing_docs)]
// Audio code requires intentional numeric casts between sample formats
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_lossless
)]

mod buffer;
mod component;
mod config;
mod dp_queue;
pub mod endpoint;
mod error;
mod event;
mod format;
mod graph;
pub mod ipc;
mod memory;
mod module;
pub mod modules;
mod pipeline;
mod registry;
mod schedule;
mod stream;
mod trace;

pub use buffer::{avail_frames_aligned, AudioBuffer, BufferId, BufferSink, BufferSource};
pub use component::{
    transition, ComponentId, ComponentState, PathStatus, StateChange, Trigger,
};
pub use config::EngineConfig;
pub use dp_queue::{DpQueue, DpQueueMode, DpQueueState, DpSink, DpSource};
pub use endpoint::{DaiEndpoint, EndpointHandle, HostEndpoint};
pub use error::{EngineError, ProcessError};
pub use event::{event_callback, EngineEvent, EventCallback, XrunKind};
pub use format::{SampleType, StreamFormat};
pub use graph::{AttachDirection, Attachment, AudioGraph, BufferEnds};
pub use ipc::{demo_topology, IpcHandler, IpcMessage, IpcReply};
pub use memory::{CacheMode, CacheOps, CountingCache};
pub use module::{
    AudioStreamModule, ConfigFragment, CopyContext, DpWorkerParts, EndpointKind,
    EndpointModule, FragmentPosition, ModuleAdapter, ModuleKind, ModuleParams,
    PrepareContext, ProcessingDomain, RawBuffer, RawDataModule, RawLayout,
    SinkSourceModule, SinkView, SourceView, StreamPosition,
};
pub use pipeline::{
    Direction, Engine, PipelineConfig, PipelineId, PipelineInfo, TimeDomain, MAX_FRAME_BYTES,
};
pub use registry::{ComponentDriver, ComponentRegistry, ComponentSpec};
pub use schedule::Scheduler;
pub use stream::{copy_ring, transfer, RingBuffer, SampleSink, SampleSource};
pub use trace::{
    trace_ring, PanicCode, StatusRegister, TraceDrain, TraceEntry, Tracer, PANIC_MAGIC,
};
