//! Component identity and the lifecycle state machine.
//!
//! Every graph node carries a [`ComponentState`] driven by [`Trigger`]s. The
//! legal transitions form a small table; re-asserting the state a component is
//! already in is reported as [`StateChange::AlreadySet`] so callers can make
//! repeated triggers side-effect free.

use crate::error::EngineError;

/// Identifier of a component instance, unique within the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId(pub u32);

impl std::fmt::Display for ComponentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "comp-{}", self.0)
    }
}

/// Lifecycle state of a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentState {
    /// Allocated but not yet initialized by its driver.
    Init,
    /// Initialized; waiting for parameters and prepare.
    Ready,
    /// Per-run resources allocated; one trigger away from running.
    Prepare,
    /// Scheduled for copy passes.
    Active,
    /// Suspended; resources retained.
    Paused,
}

/// State-machine triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    /// `Ready -> Prepare`: allocate per-run resources.
    Prepare,
    /// `Prepare -> Active`: begin processing.
    Start,
    /// `Paused -> Active`: resume processing.
    Release,
    /// `Active -> Paused`: suspend processing.
    Pause,
    /// `Active | Paused -> Prepare`: stop processing, keep resources.
    Stop,
    /// `any post-Init -> Ready`: release per-run resources.
    Reset,
}

/// Result of applying a trigger to a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
    /// The component moved to a new state.
    Changed(ComponentState),
    /// The component was already in the target state; nothing happened.
    AlreadySet,
}

/// Sentinel a component returns to end the current pass for its pipeline
/// without marking an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStatus {
    /// Keep walking the pipeline.
    Continue,
    /// Skip the remaining components of this pass.
    Stop,
}

/// Applies `trigger` to `state` and returns the resulting change.
///
/// # Errors
///
/// Returns [`EngineError::InvalidTransition`] for any pair the lifecycle
/// machine forbids.
pub fn transition(
    state: ComponentState,
    trigger: Trigger,
) -> Result<StateChange, EngineError> {
    use ComponentState::{Active, Paused, Prepare, Ready};

    // `Some(next)` moves the component, `None` re-asserts the current state.
    let next = match (state, trigger) {
        (Ready, Trigger::Prepare) => Some(Prepare),
        (Prepare, Trigger::Prepare) => None,

        (Prepare, Trigger::Start) => Some(Active),
        (Active, Trigger::Start) => None,

        (Paused, Trigger::Release) => Some(Active),
        (Active, Trigger::Release) => None,

        (Active, Trigger::Pause) => Some(Paused),
        (Paused, Trigger::Pause) => None,

        (Active | Paused, Trigger::Stop) => Some(Prepare),
        (Prepare, Trigger::Stop) => None,

        (Ready, Trigger::Reset) => None,
        (Prepare | Active | Paused, Trigger::Reset) => Some(Ready),

        _ => {
            return Err(EngineError::InvalidTransition {
                from: state,
                trigger,
            })
        }
    };
    Ok(match next {
        Some(state) => StateChange::Changed(state),
        None => StateChange::AlreadySet,
    })
}
