//! Runtime events for monitoring pipeline health.
//!
//! Events are non-fatal notifications. The engine keeps running after any of
//! them is emitted - they exist for logging, metrics and host reporting, not
//! for error handling.

use std::sync::Arc;

use crate::component::ComponentId;
use crate::pipeline::PipelineId;

/// Classification of a missed real-time deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XrunKind {
    /// The copy pass overran the pipeline deadline.
    DeadlineOverrun,
    /// An active pipeline's source endpoint stayed empty past the deadline.
    SourceUnderflow,
    /// The DAI endpoint was starved of data while streaming.
    DaiUnderrun,
    /// The DAI endpoint had no room for captured data.
    DaiOverrun,
    /// A module reported a processing failure during the pass.
    ProcessingFailure,
}

/// Runtime events emitted by the engine and scheduler.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A pipeline missed a real-time deadline and will be recovered.
    Xrun {
        /// The affected pipeline.
        pipeline: PipelineId,
        /// What kind of deadline was missed.
        kind: XrunKind,
    },

    /// An xrun recovery sequence brought the pipeline back to Active.
    XrunRecovered {
        /// The recovered pipeline.
        pipeline: PipelineId,
    },

    /// Xruns repeated past the configured threshold; recovery was abandoned
    /// and the condition is host-visible.
    XrunStorm {
        /// The failing pipeline.
        pipeline: PipelineId,
        /// Number of xruns observed inside the window.
        count: u32,
    },

    /// An endpoint did not drain within its timeout; the stop was forced.
    DrainTimeout {
        /// Endpoint component that was forced.
        component: ComponentId,
    },

    /// A pipeline changed lifecycle state.
    PipelineState {
        /// The pipeline.
        pipeline: PipelineId,
        /// Human-readable state name.
        state: &'static str,
    },

    /// A raw-data module finished its deep-buffer warm-up and switched from
    /// zero-fill to processed output.
    DeepBufferComplete {
        /// The component hosting the module.
        component: ComponentId,
    },
}

/// Callback type for receiving runtime events.
///
/// # Example
///
/// ```
/// use wavepipe::{event_callback, EngineEvent};
///
/// let callback = event_callback(|event| {
///     tracing::warn!(?event, "pipeline event");
/// });
/// callback(EngineEvent::PipelineState {
///     pipeline: wavepipe::PipelineId(1),
///     state: "active",
/// });
/// ```
pub type EventCallback = Arc<dyn Fn(EngineEvent) + Send + Sync>;

/// Creates an [`EventCallback`] from a closure without manual `Arc` wrapping.
pub fn event_callback<F>(f: F) -> EventCallback
where
    F: Fn(EngineEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}
