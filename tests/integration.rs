//! End-to-end scenarios over the public surface.
//!
//! These tests build graphs the way the IPC surface does, then drive the
//! timer domain tick by tick so every assertion is deterministic.

use std::sync::{Arc, Mutex as StdMutex};

use wavepipe::ipc::demo;
use wavepipe::{
    demo_topology, event_callback, BufferId, ComponentId, ComponentRegistry, ComponentSpec,
    ComponentState, CountingCache, Direction, Engine, EngineConfig, EngineError, EngineEvent,
    EventCallback, IpcHandler, IpcMessage, PipelineConfig, PipelineId, Scheduler, StreamFormat,
    Trigger, XrunKind,
};

/// Collects engine events for later assertions.
fn event_recorder() -> (EventCallback, Arc<StdMutex<Vec<EngineEvent>>>) {
    let log = Arc::new(StdMutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    (
        event_callback(move |event| sink.lock().unwrap().push(event)),
        log,
    )
}

struct Builder<'a> {
    engine: &'a mut Engine,
    registry: &'a ComponentRegistry,
    pipeline: PipelineId,
}

impl<'a> Builder<'a> {
    fn new(
        engine: &'a mut Engine,
        registry: &'a ComponentRegistry,
        config: PipelineConfig,
    ) -> Self {
        let pipeline = config.id;
        engine.new_pipeline(config).unwrap();
        Self {
            engine,
            registry,
            pipeline,
        }
    }

    fn component(&mut self, driver: &str, id: u32, spec: ComponentSpec) -> ComponentId {
        let uuid = self.registry.uuid_of(driver).unwrap();
        let adapter = self
            .registry
            .new_component(uuid, ComponentId(id), &spec)
            .unwrap();
        self.engine.add_component(self.pipeline, adapter).unwrap()
    }

    fn buffer(&mut self, id: u32, capacity: usize) -> BufferId {
        self.engine
            .add_buffer(self.pipeline, BufferId(id), capacity)
            .unwrap();
        BufferId(id)
    }

    fn link(&mut self, source: ComponentId, buffer: BufferId, sink: ComponentId) {
        self.engine.connect_producer(source, buffer).unwrap();
        self.engine.connect_consumer(buffer, sink).unwrap();
    }

    fn complete(self) -> PipelineId {
        self.engine.complete_pipeline(self.pipeline).unwrap();
        self.pipeline
    }
}

fn s16_frames(value: i16, frames: usize, channels: usize) -> Vec<u8> {
    std::iter::repeat(value.to_le_bytes())
        .take(frames * channels)
        .flatten()
        .collect()
}

fn as_i16(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

/// Scenario: host -> gain -> mixer playback at 48 kHz stereo 32-bit. The
/// mixer's output buffer carries one full period every tick and writebacks
/// land on the non-coherent sink each tick.
#[test]
fn host_gain_mixer_playback_produces_every_tick() {
    let counting = CountingCache::new();
    let registry = ComponentRegistry::with_builtins();
    let mut engine = Engine::new(EngineConfig::default())
        .with_cache(wavepipe::CacheMode::NonCoherent(counting.clone()));

    let fmt = StreamFormat::s32(48_000, 2);
    let period = fmt.period_bytes(1_000); // 48 frames * 8 bytes

    let mut b = Builder::new(&mut engine, &registry, PipelineConfig::new(PipelineId(1)));
    let host = b.component(
        "host",
        1,
        ComponentSpec::low_latency()
            .with_direction(Direction::Playback)
            .with_formats(vec![fmt]),
    );
    let gain = b.component("gain", 2, ComponentSpec::low_latency());
    let mixer = b.component("mixer", 3, ComponentSpec::low_latency());
    let b1 = b.buffer(10, period * 2);
    let b2 = b.buffer(11, period * 2);
    let out = b.buffer(12, period * 4);
    b.link(host, b1, gain);
    b.link(gain, b2, mixer);
    b.engine.connect_producer(mixer, out).unwrap();
    let pid = b.complete();

    engine.params(host, &fmt).unwrap();
    engine.trigger(pid, Trigger::Prepare).unwrap();
    engine.trigger(pid, Trigger::Start).unwrap();

    let host_io = engine.endpoint_handle(host).unwrap();
    let out_buf = engine.buffer(out).unwrap();

    for tick in 0..5 {
        // 48 frames per millisecond.
        host_io.write(&vec![0x5Au8; period]);
        engine.tick();

        let available = out_buf.available();
        assert!(
            available >= period,
            "tick {tick}: mixer sink has {available} bytes, want >= {period}"
        );
        // Drain like a downstream consumer would.
        let mut sink = vec![0u8; available];
        use wavepipe::SampleSource;
        out_buf.source().read(&mut sink);
    }
    let writebacks = counting.writebacks();
    assert!(writebacks >= 5, "no writeback observed: {writebacks}");
}

/// Scenario: two pipelines feed a shared mixer. While the second input is
/// still in Prepare it contributes nothing; the tick after it goes Active
/// the mix contains both inputs, never a torn tick.
#[test]
fn two_input_mixer_joins_on_tick_boundary() {
    let registry = ComponentRegistry::with_builtins();
    let mut engine = Engine::new(EngineConfig::default());

    let fmt = StreamFormat::s16(48_000, 2);
    let period = fmt.period_bytes(1_000); // 192 bytes

    // Pipeline A: host -> gain(1/2) -> mixer -> out
    let mut a = Builder::new(&mut engine, &registry, PipelineConfig::new(PipelineId(1)));
    let host_a = a.component(
        "host",
        1,
        ComponentSpec::low_latency()
            .with_direction(Direction::Playback)
            .with_formats(vec![fmt]),
    );
    // Half gain: 512 in Q10 fixed point.
    let gain_a = a.component(
        "gain",
        2,
        ComponentSpec::low_latency().with_blob(512u32.to_le_bytes().to_vec()),
    );
    let mixer = a.component("mixer", 3, ComponentSpec::low_latency());
    let a1 = a.buffer(10, period * 2);
    let a2 = a.buffer(11, period * 2);
    let out = a.buffer(12, period * 8);
    a.link(host_a, a1, gain_a);
    a.link(gain_a, a2, mixer);
    a.engine.connect_producer(mixer, out).unwrap();
    let pid_a = a.complete();

    // Pipeline B: host -> gain -> shared buffer -> (mixer of A)
    let mut b = Builder::new(&mut engine, &registry, PipelineConfig::new(PipelineId(2)));
    let host_b = b.component(
        "host",
        4,
        ComponentSpec::low_latency()
            .with_direction(Direction::Playback)
            .with_formats(vec![fmt]),
    );
    let gain_b = b.component("gain", 5, ComponentSpec::low_latency());
    let b1 = b.buffer(20, period * 2);
    let b2 = b.buffer(21, period * 2);
    b.link(host_b, b1, gain_b);
    b.engine.connect_producer(gain_b, b2).unwrap();
    b.engine.connect_consumer(b2, mixer).unwrap();
    let pid_b = b.complete();

    engine.params(host_a, &fmt).unwrap();
    engine.params(host_b, &fmt).unwrap();
    engine.trigger(pid_a, Trigger::Prepare).unwrap();
    engine.trigger(pid_a, Trigger::Start).unwrap();
    engine.trigger(pid_b, Trigger::Prepare).unwrap();

    let host_a_io = engine.endpoint_handle(host_a).unwrap();
    let host_b_io = engine.endpoint_handle(host_b).unwrap();
    let out_buf = engine.buffer(out).unwrap();
    use wavepipe::SampleSource;

    // Tick with B still in Prepare: output is A halved, B untouched.
    host_a_io.write(&s16_frames(1000, 48, 2));
    host_b_io.write(&s16_frames(300, 48, 2));
    engine.tick();
    let mut raw = vec![0u8; out_buf.available()];
    out_buf.source().read(&mut raw);
    let samples = as_i16(&raw);
    assert!(!samples.is_empty());
    assert!(samples.iter().all(|&s| s == 500), "expected A/2 only");

    // B joins between ticks; the next tick carries the full mix.
    engine.trigger(pid_b, Trigger::Start).unwrap();
    host_a_io.write(&s16_frames(1000, 48, 2));
    host_b_io.write(&s16_frames(300, 48, 2));
    engine.tick();
    let mut raw = vec![0u8; out_buf.available()];
    out_buf.source().read(&mut raw);
    let samples = as_i16(&raw);
    assert!(!samples.is_empty());
    assert!(
        samples.iter().all(|&s| s == 800),
        "expected A/2 + B, got {:?}",
        &samples[..4.min(samples.len())]
    );
}

/// Scenario: a stalled source past the deadline records an xrun and the
/// pipeline recovers to Active within two ticks without reallocating.
#[test]
fn xrun_recovery_after_source_stall() {
    let registry = ComponentRegistry::with_builtins();
    let (callback, events) = event_recorder();
    let mut engine = Engine::new(EngineConfig::default()).with_event_callback(callback);

    let fmt = StreamFormat::s16(48_000, 2);
    let period = fmt.period_bytes(1_000);

    let mut b = Builder::new(&mut engine, &registry, PipelineConfig::new(PipelineId(1)));
    let spec = ComponentSpec::low_latency()
        .with_direction(Direction::Playback)
        .with_formats(vec![fmt]);
    let host = b.component("host", 1, spec.clone());
    let gain = b.component("gain", 2, ComponentSpec::low_latency());
    let dai = b.component("dai", 3, spec);
    let b1 = b.buffer(10, period * 2);
    let b2 = b.buffer(11, period * 2);
    b.link(host, b1, gain);
    b.link(gain, b2, dai);
    let pid = b.complete();

    engine.params(host, &fmt).unwrap();
    engine.trigger(pid, Trigger::Prepare).unwrap();
    engine.trigger(pid, Trigger::Start).unwrap();

    let host_io = engine.endpoint_handle(host).unwrap();
    host_io.write(&s16_frames(123, 96, 2)); // two periods

    engine.tick();
    engine.tick();

    // Stall: two empty ticks exceed the 1000us deadline.
    engine.tick();
    engine.tick();

    let log = events.lock().unwrap();
    assert!(
        log.iter().any(|e| matches!(
            e,
            EngineEvent::Xrun {
                kind: XrunKind::SourceUnderflow,
                ..
            }
        )),
        "no source-underflow xrun recorded"
    );
    assert!(
        log.iter()
            .any(|e| matches!(e, EngineEvent::XrunRecovered { .. })),
        "pipeline did not recover"
    );
    drop(log);

    assert_eq!(engine.pipeline_state(pid).unwrap(), ComponentState::Active);

    // Flow resumes untouched after the stall ends.
    host_io.write(&s16_frames(77, 48, 2));
    engine.tick();
    let dai_io = engine.endpoint_handle(dai).unwrap();
    assert!(dai_io.available() > 0);
}

/// Scenario: an SRC with a three-period input window warms up by emitting
/// zeros for three ticks and switches to resampled output on the fourth,
/// with no DAI underrun anywhere.
#[test]
fn deep_buffer_warm_up_hides_src_latency() {
    let registry = ComponentRegistry::with_builtins();
    let (callback, events) = event_recorder();
    let mut engine = Engine::new(EngineConfig::default()).with_event_callback(callback);

    let fmt = StreamFormat::s16(48_000, 2);
    let period = fmt.period_bytes(1_000);

    let mut b = Builder::new(&mut engine, &registry, PipelineConfig::new(PipelineId(1)));
    let spec = ComponentSpec::low_latency()
        .with_direction(Direction::Playback)
        .with_formats(vec![fmt]);
    let host = b.component("host", 1, spec.clone());
    let src = b.component("src", 2, {
        let mut blob = 48_000u32.to_le_bytes().to_vec();
        blob.extend_from_slice(&3u32.to_le_bytes());
        ComponentSpec::low_latency().with_blob(blob)
    });
    let dai = b.component("dai", 3, spec);
    let b1 = b.buffer(10, period * 8);
    let b2 = b.buffer(11, period * 2);
    b.link(host, b1, src);
    b.link(src, b2, dai);
    let pid = b.complete();

    engine.params(host, &fmt).unwrap();
    engine.trigger(pid, Trigger::Prepare).unwrap();
    engine.trigger(pid, Trigger::Start).unwrap();

    let host_io = engine.endpoint_handle(host).unwrap();
    let dai_io = engine.endpoint_handle(dai).unwrap();

    let mut tick_payload = |value: i16| {
        host_io.write(&s16_frames(value, 48, 2));
    };

    // Warm-up: exactly one period of zeros per tick.
    for tick in 0..3 {
        tick_payload(1000);
        engine.tick();
        let mut raw = vec![0u8; dai_io.available()];
        dai_io.read(&mut raw);
        assert_eq!(raw.len(), period, "tick {tick} emitted a partial period");
        assert!(
            raw.iter().all(|&b| b == 0),
            "tick {tick} leaked non-silence during warm-up"
        );
    }

    // Fourth tick: the window is full, resampled samples flow with no gap.
    tick_payload(1000);
    engine.tick();
    let mut raw = vec![0u8; dai_io.available()];
    dai_io.read(&mut raw);
    assert!(!raw.is_empty(), "no output on the first warm tick");
    let samples = as_i16(&raw);
    assert!(
        samples.iter().any(|&s| s != 0),
        "expected resampled audio after warm-up"
    );

    let log = events.lock().unwrap();
    assert!(log
        .iter()
        .any(|e| matches!(e, EngineEvent::DeepBufferComplete { .. })));
    assert!(
        !log.iter()
            .any(|e| matches!(e, EngineEvent::Xrun { kind: XrunKind::DaiUnderrun, .. })),
        "DAI underran during warm-up"
    );
}

/// Scenario: a topology with mixer -> gain -> mixer is rejected at complete
/// and no component survives.
#[test]
fn graph_cycle_rejected_and_unwound() {
    let registry = ComponentRegistry::with_builtins();
    let mut engine = Engine::new(EngineConfig::default());

    let pid = PipelineId(1);
    engine.new_pipeline(PipelineConfig::new(pid)).unwrap();
    let mixer_uuid = registry.uuid_of("mixer").unwrap();
    let gain_uuid = registry.uuid_of("gain").unwrap();
    let mixer = engine
        .add_component(
            pid,
            registry
                .new_component(mixer_uuid, ComponentId(1), &ComponentSpec::low_latency())
                .unwrap(),
        )
        .unwrap();
    let gain = engine
        .add_component(
            pid,
            registry
                .new_component(gain_uuid, ComponentId(2), &ComponentSpec::low_latency())
                .unwrap(),
        )
        .unwrap();
    engine.add_buffer(pid, BufferId(10), 384).unwrap();
    engine.add_buffer(pid, BufferId(11), 384).unwrap();
    engine.connect_producer(mixer, BufferId(10)).unwrap();
    engine.connect_consumer(BufferId(10), gain).unwrap();
    engine.connect_producer(gain, BufferId(11)).unwrap();
    engine.connect_consumer(BufferId(11), mixer).unwrap();

    let err = engine.complete_pipeline(pid).unwrap_err();
    assert!(matches!(err, EngineError::GraphCycle { .. }));

    // Nothing is left allocated.
    assert!(engine.pipeline_ids().is_empty());
    assert!(engine.component_state(mixer).is_err());
    assert!(engine.component_state(gain).is_err());
    assert!(engine.buffer(BufferId(10)).is_err());
}

/// Scenario: the host endpoint offers a format list; parameters inside the
/// list pass prepare, a format outside the list is a configuration error.
#[test]
fn format_list_gates_params() {
    let registry = ComponentRegistry::with_builtins();
    let offered = vec![
        StreamFormat::s16(48_000, 2),
        StreamFormat::s32(48_000, 2),
        StreamFormat::s24_4(48_000, 2),
    ];

    let build = |engine: &mut Engine| -> (ComponentId, PipelineId) {
        let mut b = Builder::new(engine, &registry, PipelineConfig::new(PipelineId(1)));
        let host = b.component(
            "host",
            1,
            ComponentSpec::low_latency()
                .with_direction(Direction::Playback)
                .with_formats(offered.clone()),
        );
        let gain = b.component("gain", 2, ComponentSpec::low_latency());
        let buf = b.buffer(10, 768);
        b.link(host, buf, gain);
        let out = b.buffer(11, 768);
        b.engine.connect_producer(gain, out).unwrap();
        (host, b.complete())
    };

    // A 16-bit stream is in the host list and the gain accepts it.
    let mut engine = Engine::new(EngineConfig::default());
    let (host, pid) = build(&mut engine);
    engine.params(host, &StreamFormat::s16(48_000, 2)).unwrap();
    engine.trigger(pid, Trigger::Prepare).unwrap();

    // A float stream is not offered by the host.
    let mut engine = Engine::new(EngineConfig::default());
    let (host, _pid) = build(&mut engine);
    let err = engine
        .params(host, &StreamFormat::f32(48_000, 2))
        .unwrap_err();
    assert!(matches!(err, EngineError::UnsupportedFormat { .. }));
}

/// A deferred-domain module exchanges data with the timer domain only
/// through its swap queues: the LL tick shuttles bytes, the worker (driven
/// by hand here) processes on the queue endpoints, and output reaches the
/// graph one tick later.
#[test]
fn deferred_module_processes_through_dp_queues() {
    let registry = ComponentRegistry::with_builtins();
    let mut engine = Engine::new(EngineConfig::default());

    let fmt = StreamFormat::s16(48_000, 2);
    let period = fmt.period_bytes(1_000);

    let mut b = Builder::new(&mut engine, &registry, PipelineConfig::new(PipelineId(1)));
    let host = b.component(
        "host",
        1,
        ComponentSpec::low_latency()
            .with_direction(Direction::Playback)
            .with_formats(vec![fmt]),
    );
    let eq = b.component("eq", 2, ComponentSpec::deferred());
    let b1 = b.buffer(10, period * 2);
    let out = b.buffer(11, period * 4);
    b.link(host, b1, eq);
    b.engine.connect_producer(eq, out).unwrap();
    let pid = b.complete();

    engine.params(host, &fmt).unwrap();
    engine.trigger(pid, Trigger::Prepare).unwrap();
    let workers = engine.take_dp_workers();
    assert_eq!(workers.len(), 1, "deferred module staged no worker");
    let worker = &workers[0];
    engine.trigger(pid, Trigger::Start).unwrap();

    let host_io = engine.endpoint_handle(host).unwrap();
    let payload = s16_frames(4242, 48, 2);
    host_io.write(&payload);

    // Tick 1: the LL pass shuttles the period into the module-side queue;
    // nothing has reached the output buffer yet.
    engine.tick();
    let out_buf = engine.buffer(out).unwrap();
    assert_eq!(out_buf.available(), 0);

    // The worker runs on the queue endpoints (flat EQ passes bits through).
    {
        use wavepipe::{SampleSink, SampleSource};
        let sources: Vec<&dyn SampleSource> =
            worker.sources.iter().map(|s| s as &dyn SampleSource).collect();
        let sinks: Vec<&dyn SampleSink> =
            worker.sinks.iter().map(|s| s as &dyn SampleSink).collect();
        worker.module.lock().process(&sources, &sinks).unwrap();
    }

    // Tick 2: the shuttle moves the processed period back into the graph.
    host_io.write(&payload);
    engine.tick();
    assert_eq!(out_buf.available(), period);
    let mut raw = vec![0u8; period];
    use wavepipe::SampleSource;
    out_buf.source().read(&mut raw);
    assert_eq!(raw, payload, "flat EQ must be bit-exact");
}

/// Pass-through property: bytes fed to the host come out of the DAI
/// unchanged through a unity-gain path.
#[test]
fn pass_through_is_bit_exact() {
    let registry = ComponentRegistry::with_builtins();
    let mut engine = Engine::new(EngineConfig::default());

    let fmt = StreamFormat::s16(48_000, 2);
    let period = fmt.period_bytes(1_000);

    let mut b = Builder::new(&mut engine, &registry, PipelineConfig::new(PipelineId(1)));
    let spec = ComponentSpec::low_latency()
        .with_direction(Direction::Playback)
        .with_formats(vec![fmt]);
    let host = b.component("host", 1, spec.clone());
    let gain = b.component("gain", 2, ComponentSpec::low_latency());
    let dai = b.component("dai", 3, spec);
    let b1 = b.buffer(10, period * 2);
    let b2 = b.buffer(11, period * 2);
    b.link(host, b1, gain);
    b.link(gain, b2, dai);
    let pid = b.complete();

    engine.params(host, &fmt).unwrap();
    engine.trigger(pid, Trigger::Prepare).unwrap();
    engine.trigger(pid, Trigger::Start).unwrap();

    let host_io = engine.endpoint_handle(host).unwrap();
    let dai_io = engine.endpoint_handle(dai).unwrap();

    let payload: Vec<u8> = (0..period * 4).map(|i| (i % 251) as u8).collect();
    let mut received = Vec::new();
    let mut fed = 0;
    for _ in 0..6 {
        if fed < payload.len() {
            fed += host_io.write(&payload[fed..(fed + period).min(payload.len())]);
        }
        engine.tick();
        let mut out = vec![0u8; dai_io.available()];
        let n = dai_io.read(&mut out);
        received.extend_from_slice(&out[..n]);
    }
    assert_eq!(received.len(), payload.len());
    assert_eq!(received, payload);
}

/// Prepare and the trigger set are idempotent: re-asserting a state is a
/// no-op and a stop/reset round trip leaves the pipeline re-preparable.
#[test]
fn lifecycle_round_trip_is_idempotent() {
    let registry = ComponentRegistry::with_builtins();
    let mut engine = Engine::new(EngineConfig::default());

    let fmt = StreamFormat::s16(48_000, 2);
    let mut b = Builder::new(&mut engine, &registry, PipelineConfig::new(PipelineId(1)));
    let spec = ComponentSpec::low_latency()
        .with_direction(Direction::Playback)
        .with_formats(vec![fmt]);
    let host = b.component("host", 1, spec.clone());
    let gain = b.component("gain", 2, ComponentSpec::low_latency());
    let buf = b.buffer(10, 768);
    b.link(host, buf, gain);
    let out = b.buffer(11, 768);
    b.engine.connect_producer(gain, out).unwrap();
    let pid = b.complete();

    engine.params(host, &fmt).unwrap();
    engine.trigger(pid, Trigger::Prepare).unwrap();
    // Second prepare: already set, no side effects.
    engine.trigger(pid, Trigger::Prepare).unwrap();
    engine.trigger(pid, Trigger::Start).unwrap();
    engine.trigger(pid, Trigger::Start).unwrap();
    assert_eq!(engine.pipeline_state(pid).unwrap(), ComponentState::Active);

    engine.trigger(pid, Trigger::Stop).unwrap();
    engine.trigger(pid, Trigger::Reset).unwrap();
    assert_eq!(engine.pipeline_state(pid).unwrap(), ComponentState::Ready);

    // Parameters survive reset; the pipeline prepares again directly.
    engine.trigger(pid, Trigger::Prepare).unwrap();
    engine.trigger(pid, Trigger::Start).unwrap();
    assert_eq!(engine.pipeline_state(pid).unwrap(), ComponentState::Active);
}

/// An illegal lifecycle transition is fatal: the trigger is rejected and the
/// status register latches a panic code for the host.
#[test]
fn illegal_transition_latches_panic_code() {
    let registry = ComponentRegistry::with_builtins();
    let mut engine = Engine::new(EngineConfig::default());

    let mut b = Builder::new(&mut engine, &registry, PipelineConfig::new(PipelineId(1)));
    let tone = b.component("tone", 1, ComponentSpec::low_latency());
    let gain = b.component("gain", 2, ComponentSpec::low_latency());
    let buf = b.buffer(10, 768);
    b.link(tone, buf, gain);
    let out = b.buffer(11, 768);
    b.engine.connect_producer(gain, out).unwrap();
    let pid = b.complete();

    let status = engine.status();
    assert!(!status.is_panicked());

    // Start without prepare is not a legal edge.
    let err = engine.trigger(pid, Trigger::Start).unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));
    assert!(status.is_panicked());
    assert_eq!(status.read() & 0x0DEA_D000, 0x0DEA_D000);
}

/// The demo topology streams through the async scheduler: playback host in,
/// DAI out, tone feeder mixed in after its SRC warm-up.
#[tokio::test]
async fn demo_topology_streams_under_the_scheduler() {
    let registry = Arc::new(ComponentRegistry::with_builtins());
    let engine = Engine::new(EngineConfig::default());
    let scheduler = Scheduler::spawn(engine);
    let handler = IpcHandler::new(scheduler.engine(), Arc::clone(&registry));

    let fmt = StreamFormat::s32(48_000, 2);
    handler.handle_all(demo_topology(&registry, fmt)).unwrap();
    handler
        .handle(IpcMessage::Params {
            component: demo::HOST_OUT,
            format: fmt,
        })
        .unwrap();
    handler
        .handle(IpcMessage::Params {
            component: demo::TONE,
            format: fmt,
        })
        .unwrap();

    scheduler
        .trigger(demo::PLAYBACK, Trigger::Prepare)
        .await
        .unwrap();
    scheduler
        .trigger(demo::TONE_FEED, Trigger::Prepare)
        .await
        .unwrap();

    // Preload 40ms of playback audio.
    let host = scheduler
        .engine()
        .lock()
        .endpoint_handle(demo::HOST_OUT)
        .unwrap();
    let period = fmt.period_bytes(1_000);
    host.write(&vec![0x22u8; period * 16]);

    scheduler
        .trigger(demo::PLAYBACK, Trigger::Start)
        .await
        .unwrap();
    scheduler
        .trigger(demo::TONE_FEED, Trigger::Start)
        .await
        .unwrap();

    // Let the timer run and keep the DAI drained like hardware would.
    let dai = scheduler
        .engine()
        .lock()
        .endpoint_handle(demo::DAI_OUT)
        .unwrap();
    let mut total = 0;
    for _ in 0..40 {
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        let mut out = vec![0u8; dai.available()];
        total += dai.read(&mut out);
        host.write(&vec![0x22u8; period]);
    }
    assert!(total > 0, "no audio reached the DAI");

    scheduler
        .trigger(demo::PLAYBACK, Trigger::Stop)
        .await
        .unwrap();
    scheduler.shutdown().await;
}
