//! Fan-in mixer summing multiple sources into one sink.

use std::sync::Arc;

use crate::component::ComponentId;
use crate::error::{EngineError, ProcessError};
use crate::format::StreamFormat;
use crate::module::{
    AudioStreamModule, ModuleAdapter, ModuleKind, ModuleParams, SinkView, SourceView,
};
use crate::registry::{ComponentDriver, ComponentSpec};
use uuid::Uuid;

/// Upper bound of mixer inputs.
pub const MIXER_MAX_SOURCES: usize = 8;

/// Sums every active source into the sink, saturating to the container.
///
/// Sources in a different lifecycle state are filtered out by the adapter
/// before `process` runs, so mid-tick joiners only contribute starting with
/// the next full tick.
pub struct Mixer {
    /// Wide accumulator, one slot per sample of the current chunk.
    accum: Vec<i64>,
    scratch: Vec<u8>,
}

impl Mixer {
    /// Creates an idle mixer.
    pub fn new() -> Self {
        Self {
            accum: Vec::new(),
            scratch: Vec::new(),
        }
    }
}

impl Default for Mixer {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioStreamModule for Mixer {
    fn prepare(&mut self, params: &ModuleParams) -> Result<(), EngineError> {
        let chunk = params.period_bytes.max(params.format.frame_bytes());
        self.scratch.resize(chunk, 0);
        let samples = chunk / usize::from(params.format.container_bytes).max(1);
        self.accum.resize(samples, 0);
        Ok(())
    }

    fn process(
        &mut self,
        sources: &mut [SourceView<'_>],
        sinks: &mut [SinkView<'_>],
        frames: usize,
    ) -> Result<(), ProcessError> {
        let Some(sink) = sinks.first_mut() else {
            return Err(ProcessError::NoSpace);
        };
        if sources.is_empty() {
            return Err(ProcessError::NoData);
        }
        let format = sink.format();
        let container = usize::from(format.container_bytes);
        let mut remaining = format.frames_to_bytes(frames);
        while remaining > 0 {
            let chunk = remaining.min(self.scratch.len());
            let samples = chunk / container;
            self.accum[..samples].fill(0);

            for source in sources.iter_mut() {
                let got = source.read_frames(&mut self.scratch[..chunk]);
                for (slot, sample) in self.accum[..got / container]
                    .iter_mut()
                    .zip(self.scratch[..got].chunks_exact(container))
                {
                    *slot += super::read_sample(sample, format.container_bytes);
                }
            }

            for (slot, sample) in self.accum[..samples]
                .iter()
                .zip(self.scratch[..chunk].chunks_exact_mut(container))
            {
                super::write_sample(sample, format.container_bytes, *slot);
            }
            sink.write_frames(&self.scratch[..chunk]);
            remaining -= chunk;
        }
        Ok(())
    }

    fn max_sources(&self) -> usize {
        MIXER_MAX_SOURCES
    }

    fn supports(&self, format: &StreamFormat) -> bool {
        super::integer_pcm(format)
    }
}

/// Driver constructing mixer components.
pub struct MixerDriver;

impl ComponentDriver for MixerDriver {
    fn uuid(&self) -> Uuid {
        Uuid::from_u128(0xbc06_c037_12aa_417c_9a97_89282e321a76)
    }

    fn name(&self) -> &str {
        "mixer"
    }

    fn create(&self, id: ComponentId, spec: &ComponentSpec) -> Result<ModuleAdapter, EngineError> {
        Ok(ModuleAdapter::new(
            id,
            "mixer",
            spec.domain,
            ModuleKind::AudioStream(Box::new(Mixer::new())),
        ))
    }
}

pub(crate) fn driver() -> Arc<dyn ComponentDriver> {
    Arc::new(MixerDriver)
}
