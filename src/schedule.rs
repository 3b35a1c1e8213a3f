//! Timer-domain and deferred-processing scheduling.
//!
//! The [`Scheduler`] wraps an [`Engine`] in a mutex and drives it from tokio
//! tasks: a periodic low-latency task calling [`Engine::tick`], one worker
//! task per deferred module, and a slow drain task for the trace ring.
//! Triggers are posted over a command channel and honored at the next
//! scheduling point; stops drain the endpoints under a bounded timeout and
//! are forced when it expires.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::component::{PathStatus, Trigger};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::event::EngineEvent;
use crate::module::{DpWorkerParts, EndpointKind};
use crate::pipeline::{Engine, PipelineId};
use crate::stream::{SampleSink, SampleSource};

/// Safety bound on back-to-back processing calls per DP wakeup.
const DP_BURST_LIMIT: usize = 64;

/// Poll cadence while waiting for an endpoint to drain.
const DRAIN_POLL: Duration = Duration::from_micros(200);

enum SchedCommand {
    Trigger {
        pipeline: PipelineId,
        trigger: Trigger,
        reply: oneshot::Sender<Result<PathStatus, EngineError>>,
    },
}

/// Handle to the running scheduler tasks.
pub struct Scheduler {
    engine: Arc<Mutex<Engine>>,
    cmd_tx: mpsc::Sender<SchedCommand>,
    shutdown_tx: watch::Sender<bool>,
    ll_handle: Option<JoinHandle<()>>,
    trace_handle: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawns the scheduler tasks around an engine.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(mut engine: Engine) -> Self {
        let config = engine.config.clone();
        let trace_drain = engine.take_trace_drain();
        let engine = Arc::new(Mutex::new(engine));
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let ll_handle = tokio::spawn(ll_task(
            Arc::clone(&engine),
            config.clone(),
            cmd_rx,
            shutdown_rx.clone(),
        ));
        let trace_handle = trace_drain.map(|mut drain| {
            let interval = config.trace_drain_interval;
            let mut shutdown = shutdown_rx;
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {
                            let drained = drain.drain();
                            if drained > 0 {
                                trace!(drained, "trace ring drained");
                            }
                        }
                        _ = shutdown.changed() => {
                            drain.drain();
                            break;
                        }
                    }
                }
            })
        });

        Self {
            engine,
            cmd_tx,
            shutdown_tx,
            ll_handle: Some(ll_handle),
            trace_handle,
        }
    }

    /// Shared handle to the engine, for construction-time calls (IPC).
    pub fn engine(&self) -> Arc<Mutex<Engine>> {
        Arc::clone(&self.engine)
    }

    /// Posts a trigger; it is honored at the scheduler's next scheduling
    /// point. Stop triggers drain the pipeline's endpoints first, bounded by
    /// the configured timeouts.
    pub async fn trigger(
        &self,
        pipeline: PipelineId,
        trigger: Trigger,
    ) -> Result<PathStatus, EngineError> {
        let (reply, response) = oneshot::channel();
        self.cmd_tx
            .send(SchedCommand::Trigger {
                pipeline,
                trigger,
                reply,
            })
            .await
            .map_err(|_| EngineError::NotSupported {
                what: "scheduler stopped",
            })?;
        response.await.map_err(|_| EngineError::NotSupported {
            what: "scheduler stopped",
        })?
    }

    /// Stops all scheduler tasks, waiting briefly for them to wind down.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        for handle in [self.ll_handle.take(), self.trace_handle.take()]
            .into_iter()
            .flatten()
        {
            if tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .is_err()
            {
                warn!("scheduler task did not stop within timeout");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // Signal the tasks; they wind down on their own.
        let _ = self.shutdown_tx.send(true);
    }
}

async fn ll_task(
    engine: Arc<Mutex<Engine>>,
    config: EngineConfig,
    mut cmd_rx: mpsc::Receiver<SchedCommand>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(config.tick_period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    debug!(period = ?config.tick_period, "timer domain running");
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let workers = {
                    let mut engine = engine.lock();
                    engine.tick();
                    engine.take_dp_workers()
                };
                for parts in workers {
                    tokio::spawn(dp_worker(parts, shutdown.clone()));
                }
            }
            Some(cmd) = cmd_rx.recv() => {
                match cmd {
                    SchedCommand::Trigger { pipeline, trigger, reply } => {
                        if trigger == Trigger::Stop {
                            drain_endpoints(&engine, &config, pipeline).await;
                        }
                        let result = {
                            let mut engine = engine.lock();
                            let result = engine.trigger(pipeline, trigger);
                            // Prepare may stage new deferred workers.
                            for parts in engine.take_dp_workers() {
                                tokio::spawn(dp_worker(parts, shutdown.clone()));
                            }
                            result
                        };
                        let _ = reply.send(result);
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("timer domain stopped");
}

/// Waits for every endpoint of a pipeline to drain, forcing the stop and
/// emitting a [`EngineEvent::DrainTimeout`] when one exceeds its budget.
async fn drain_endpoints(engine: &Arc<Mutex<Engine>>, config: &EngineConfig, id: PipelineId) {
    let endpoints = engine.lock().endpoint_components(id);
    for component in endpoints {
        let budget = match engine.lock().endpoint_kind(component) {
            Some(EndpointKind::Host) => config.host_drain_timeout,
            Some(EndpointKind::Dai) => config.dai_drain_timeout,
            None => continue,
        };
        let done = tokio::time::timeout(budget, async {
            loop {
                if engine.lock().drain_component(component) {
                    break;
                }
                tokio::time::sleep(DRAIN_POLL).await;
            }
        })
        .await;
        if done.is_err() {
            warn!(component = %component, "endpoint drain timed out, forcing stop");
            engine
                .lock()
                .emit(EngineEvent::DrainTimeout { component });
        }
    }
}

/// One deferred-processing worker: wakes on the LL shuttle's notification or
/// its own period, then runs the module until its queue endpoints starve.
async fn dp_worker(parts: DpWorkerParts, mut shutdown: watch::Receiver<bool>) {
    let period = Duration::from_micros(u64::from(parts.period_us)).max(Duration::from_micros(100));
    debug!(component = %parts.component, ?period, "dp worker running");
    loop {
        tokio::select! {
            () = parts.notify.notified() => {}
            _ = tokio::time::sleep(period) => {}
            _ = shutdown.changed() => break,
        }
        for _ in 0..DP_BURST_LIMIT {
            let sources: Vec<&dyn SampleSource> = parts
                .sources
                .iter()
                .map(|s| s as &dyn SampleSource)
                .collect();
            let sinks: Vec<&dyn SampleSink> =
                parts.sinks.iter().map(|s| s as &dyn SampleSink).collect();
            match parts.module.lock().process(&sources, &sinks) {
                Ok(()) => {}
                Err(e) if e.is_flow_control() => break,
                Err(e) => {
                    warn!(component = %parts.component, error = %e, "dp processing failed");
                    break;
                }
            }
        }
    }
    debug!(component = %parts.component, "dp worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferId;
    use crate::component::ComponentId;
    use crate::format::StreamFormat;
    use crate::pipeline::{Direction, PipelineConfig};
    use crate::registry::{ComponentRegistry, ComponentSpec};

    /// host -> gain -> dai playback pipeline built directly on an engine.
    fn build_playback(engine: &mut Engine, registry: &ComponentRegistry) {
        let pid = PipelineId(1);
        engine.new_pipeline(PipelineConfig::new(pid)).unwrap();
        let fmt = StreamFormat::s16(48_000, 2);
        let endpoint_spec = ComponentSpec::low_latency()
            .with_direction(Direction::Playback)
            .with_formats(vec![fmt]);
        for (name, id, spec) in [
            ("host", 1, endpoint_spec.clone()),
            ("gain", 2, ComponentSpec::low_latency()),
            ("dai", 3, endpoint_spec),
        ] {
            let uuid = registry.uuid_of(name).unwrap();
            let adapter = registry
                .new_component(uuid, ComponentId(id), &spec)
                .unwrap();
            engine.add_component(pid, adapter).unwrap();
        }
        engine.add_buffer(pid, BufferId(10), 768).unwrap();
        engine.add_buffer(pid, BufferId(11), 768).unwrap();
        engine.connect_producer(ComponentId(1), BufferId(10)).unwrap();
        engine.connect_consumer(BufferId(10), ComponentId(2)).unwrap();
        engine.connect_producer(ComponentId(2), BufferId(11)).unwrap();
        engine.connect_consumer(BufferId(11), ComponentId(3)).unwrap();
        engine.complete_pipeline(pid).unwrap();
        engine.params(ComponentId(1), &fmt).unwrap();
    }

    #[tokio::test]
    async fn test_scheduler_trigger_round_trip() {
        let registry = ComponentRegistry::with_builtins();
        let mut engine = Engine::new(EngineConfig::default());
        build_playback(&mut engine, &registry);

        let scheduler = Scheduler::spawn(engine);
        let pid = PipelineId(1);
        scheduler.trigger(pid, Trigger::Prepare).await.unwrap();
        scheduler.trigger(pid, Trigger::Start).await.unwrap();
        assert_eq!(
            scheduler.engine().lock().pipeline_state(pid).unwrap(),
            crate::component::ComponentState::Active
        );

        scheduler.trigger(pid, Trigger::Stop).await.unwrap();
        assert_eq!(
            scheduler.engine().lock().pipeline_state(pid).unwrap(),
            crate::component::ComponentState::Prepare
        );
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_scheduler_ticks_move_audio() {
        let registry = ComponentRegistry::with_builtins();
        let mut engine = Engine::new(EngineConfig::default());
        build_playback(&mut engine, &registry);

        let scheduler = Scheduler::spawn(engine);
        let pid = PipelineId(1);
        scheduler.trigger(pid, Trigger::Prepare).await.unwrap();

        // Pre-fill the host DMA region with 25ms of audio.
        let host = scheduler
            .engine()
            .lock()
            .endpoint_handle(crate::component::ComponentId(1))
            .unwrap();
        host.write(&vec![0x11u8; 4800]);

        scheduler.trigger(pid, Trigger::Start).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let engine = scheduler.engine();
        let guard = engine.lock();
        assert_eq!(
            guard.pipeline_state(pid).unwrap(),
            crate::component::ComponentState::Active
        );
        // The DAI received audio through the graph.
        let dai = guard
            .endpoint_handle(crate::component::ComponentId(3))
            .unwrap();
        assert!(dai.available() > 0);
        drop(guard);
        scheduler.shutdown().await;
    }
}
