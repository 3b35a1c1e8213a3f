//! Error types for the pipeline runtime.
//!
//! Errors are split into two categories:
//! - **Fatal errors** ([`EngineError`]): configuration, resource and state
//!   errors that abort the enclosing control operation
//! - **Flow-control results** ([`ProcessError`]): per-copy conditions; the
//!   empty/full variants are swallowed by the component that sees them and
//!   surfaced upward as a path stop, never as a failure

use crate::buffer::BufferId;
use crate::component::{ComponentId, ComponentState, Trigger};
use crate::pipeline::PipelineId;
use uuid::Uuid;

/// Fatal errors returned from construction and control paths.
///
/// These abort the enclosing IPC-style operation; any partially created
/// objects are unwound by the caller. Runtime flow conditions (source empty,
/// sink full) never appear here - see [`ProcessError`].
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Stream parameters were rejected.
    #[error("invalid parameters: {reason}")]
    InvalidParams {
        /// Why the parameters were rejected.
        reason: String,
    },

    /// A component cannot process the requested stream format.
    #[error("unsupported format: {reason}")]
    UnsupportedFormat {
        /// Description of the mismatch.
        reason: String,
    },

    /// A state transition was requested that the lifecycle machine forbids.
    #[error("invalid transition {trigger:?} from state {from:?}")]
    InvalidTransition {
        /// State the component was in.
        from: ComponentState,
        /// Trigger that was applied.
        trigger: Trigger,
    },

    /// The connected subgraph of a pipeline contains a cycle.
    #[error("pipeline {pipeline} graph contains a cycle")]
    GraphCycle {
        /// Pipeline whose completion was rejected.
        pipeline: PipelineId,
    },

    /// A pipeline's components do not form one connected subgraph.
    #[error("pipeline {pipeline} graph is disconnected")]
    GraphDisconnected {
        /// Pipeline whose completion was rejected.
        pipeline: PipelineId,
    },

    /// A connection referenced a component id that was never created.
    #[error("unknown component: {id}")]
    UnknownComponent {
        /// The missing component id.
        id: ComponentId,
    },

    /// A connection referenced a buffer id that was never created.
    #[error("unknown buffer: {id}")]
    UnknownBuffer {
        /// The missing buffer id.
        id: BufferId,
    },

    /// An operation referenced a pipeline id that was never created.
    #[error("unknown pipeline: {id}")]
    UnknownPipeline {
        /// The missing pipeline id.
        id: PipelineId,
    },

    /// No registered driver matches the requested key.
    #[error("no driver registered for {uuid}")]
    UnknownDriver {
        /// The unmatched driver key.
        uuid: Uuid,
    },

    /// An id was used twice within its namespace.
    #[error("duplicate id: {what}")]
    DuplicateId {
        /// Which id collided.
        what: String,
    },

    /// A buffer endpoint already has an occupant in that direction.
    #[error("buffer {buffer} already has a {side} component attached")]
    EndpointOccupied {
        /// The contested buffer.
        buffer: BufferId,
        /// `"producer"` or `"consumer"`.
        side: &'static str,
    },

    /// Buffer capacity is not a multiple of the maximum frame size.
    #[error("buffer capacity {capacity} is not a multiple of frame size {frame_bytes}")]
    CapacityNotAligned {
        /// Requested capacity in bytes.
        capacity: usize,
        /// Frame size the capacity must divide into.
        frame_bytes: usize,
    },

    /// A configuration blob's fragment framing was inconsistent.
    #[error("config fragment framing error: {reason}")]
    ConfigFragment {
        /// Description of the framing violation.
        reason: String,
    },

    /// The operation requires a completed pipeline.
    #[error("pipeline {pipeline} is not complete")]
    NotComplete {
        /// The incomplete pipeline.
        pipeline: PipelineId,
    },

    /// The pipeline was already completed.
    #[error("pipeline {pipeline} is already complete")]
    AlreadyComplete {
        /// The pipeline in question.
        pipeline: PipelineId,
    },

    /// The module or endpoint does not implement the requested operation.
    #[error("operation not supported: {what}")]
    NotSupported {
        /// The unsupported operation.
        what: &'static str,
    },

    /// Endpoint drain did not finish within the configured deadline.
    #[error("drain timeout on component {component}")]
    DrainTimeout {
        /// Endpoint component that failed to drain.
        component: ComponentId,
    },
}

/// Per-copy processing results from modules and endpoints.
///
/// `NoData` and `NoSpace` are flow control: the adapter clears its
/// per-iteration accounting and yields the rest of the pass. Any other
/// variant marks the pipeline xrun.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The source side had no data to process.
    #[error("source empty")]
    NoData,

    /// The sink side had no room for produced data.
    #[error("sink full")]
    NoSpace,

    /// The module failed; the pipeline records an xrun.
    #[error("processing failed: {0}")]
    Fatal(String),
}

impl ProcessError {
    /// Returns `true` for the flow-control variants that are swallowed
    /// locally instead of marking an xrun.
    pub fn is_flow_control(&self) -> bool {
        matches!(self, Self::NoData | Self::NoSpace)
    }
}
