//! The low-latency copy pass and xrun recovery.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::component::{ComponentState, PathStatus, Trigger};
use crate::event::{EngineEvent, XrunKind};
use crate::graph::AttachDirection;
use crate::module::CopyContext;

use super::{Engine, PipelineId};

impl Engine {
    /// Runs one tick of the timer domain: every Active pipeline whose period
    /// divides the current tick gets exactly one copy pass, producers of
    /// shared buffers before their consumers, then by ascending priority.
    pub fn tick(&mut self) {
        let tick_us = self.config.tick_period.as_micros().max(1) as u64;
        let current = self.tick_count;
        self.tick_count += 1;

        let mut due: Vec<PipelineId> = self
            .pipelines
            .values()
            .filter(|p| {
                p.complete
                    && p.state == ComponentState::Active
                    && current % (u64::from(p.config.period_us) / tick_us).max(1) == 0
            })
            .map(|p| p.config.id)
            .collect();
        due.sort_by_key(|id| {
            self.pipelines
                .get(id)
                .map(|p| p.config.priority)
                .unwrap_or(u32::MAX)
        });

        // Within one tick a producer pipeline runs no later than any
        // pipeline consuming from a buffer it fills.
        let edges = self.graph.pipeline_edges();
        let mut moved = true;
        let mut guard = 0;
        while moved && guard < due.len() * due.len() + 1 {
            moved = false;
            guard += 1;
            for (producer, consumer) in &edges {
                let (Some(pi), Some(ci)) = (
                    due.iter().position(|p| p == producer),
                    due.iter().position(|c| c == consumer),
                ) else {
                    continue;
                };
                if pi > ci {
                    let p = due.remove(pi);
                    due.insert(ci, p);
                    moved = true;
                }
            }
        }

        for id in due {
            self.run_pipeline_pass(id);
        }
    }

    /// One copy pass over a pipeline: strict topological order, each
    /// component exactly once. A path stop skips the remaining components;
    /// a processing failure or endpoint xrun triggers recovery.
    pub fn run_pipeline_pass(&mut self, id: PipelineId) {
        let Some(pipeline) = self.pipelines.get(&id) else {
            return;
        };
        if !pipeline.complete || pipeline.state != ComponentState::Active {
            return;
        }
        let order = pipeline.order.clone();
        let source_comp = pipeline.source_comp;
        let deadline = Duration::from_micros(u64::from(pipeline.config.deadline_us));
        let deadline_us = u64::from(pipeline.config.deadline_us);
        let period_us = u64::from(pipeline.config.period_us);

        let started = Instant::now();
        let mut starved = false;
        let mut failure: Option<XrunKind> = None;
        let mut warmed_up = Vec::new();

        for comp in order.iter().copied() {
            let ctx = CopyContext {
                source_states: self.graph.peer_states(comp, AttachDirection::Source),
                sink_states: self.graph.peer_states(comp, AttachDirection::Sink),
            };
            let Ok(node) = self.graph.component_mut(comp) else {
                continue;
            };
            let result = node.adapter.copy(&ctx);
            if node.adapter.take_deep_buffer_complete() {
                warmed_up.push(comp);
            }
            if let Some(kind) = node.adapter.take_endpoint_xrun() {
                failure = Some(kind);
                break;
            }
            match result {
                Ok(PathStatus::Continue) => {}
                Ok(PathStatus::Stop) => {
                    if Some(comp) == source_comp {
                        starved = true;
                    }
                    break;
                }
                Err(e) => {
                    warn!(pipeline = %id, component = %comp, error = %e, "copy failed");
                    failure = Some(XrunKind::ProcessingFailure);
                    break;
                }
            }
        }

        for comp in warmed_up {
            self.emit(EngineEvent::DeepBufferComplete { component: comp });
        }

        if let Some(kind) = failure {
            self.report_xrun(id, kind);
            return;
        }

        if started.elapsed() > deadline {
            self.report_xrun(id, XrunKind::DeadlineOverrun);
            return;
        }

        let Some(pipeline) = self.pipelines.get_mut(&id) else {
            return;
        };
        if starved {
            // A stalled source only yields path stops; it becomes an xrun
            // once the stall outlives the deadline.
            let ticks = u64::from(pipeline.xrun.starved_tick());
            if ticks * period_us > deadline_us {
                self.report_xrun(id, XrunKind::SourceUnderflow);
            }
        } else {
            pipeline.xrun.fed();
        }
    }

    /// Records an xrun and runs the stop/prepare/start recovery sequence.
    /// Repeats past the configured threshold abandon recovery and surface a
    /// host-visible storm event instead.
    pub(crate) fn report_xrun(&mut self, id: PipelineId, kind: XrunKind) {
        self.tracer.point(*b"xrun", id.0);
        warn!(pipeline = %id, ?kind, "xrun");
        self.emit(EngineEvent::Xrun { pipeline: id, kind });

        let window = self.config.xrun_window;
        let threshold = self.config.xrun_threshold;
        let Some(pipeline) = self.pipelines.get_mut(&id) else {
            return;
        };
        if pipeline.xrun.storm {
            return;
        }
        let count = pipeline.xrun.record(Instant::now(), window);
        if count > threshold {
            pipeline.xrun.storm = true;
            self.emit(EngineEvent::XrunStorm {
                pipeline: id,
                count,
            });
            if let Err(e) = self.trigger(id, Trigger::Stop) {
                warn!(pipeline = %id, error = %e, "storm stop failed");
            }
            return;
        }

        // The recovery path re-runs prepare, which is an allocation-free
        // no-op on an already prepared component.
        let recovered = self
            .trigger(id, Trigger::Stop)
            .and_then(|_| self.trigger(id, Trigger::Prepare))
            .and_then(|_| self.trigger(id, Trigger::Start));
        match recovered {
            Ok(_) => {
                debug!(pipeline = %id, "xrun recovered");
                self.emit(EngineEvent::XrunRecovered { pipeline: id });
            }
            Err(e) => warn!(pipeline = %id, error = %e, "xrun recovery failed"),
        }
    }
}
