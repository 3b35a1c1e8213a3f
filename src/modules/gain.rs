//! Fixed-point gain stage.

use std::sync::Arc;

use crate::component::ComponentId;
use crate::error::{EngineError, ProcessError};
use crate::format::StreamFormat;
use crate::module::{
    AudioStreamModule, ModuleAdapter, ModuleKind, ModuleParams, SinkView, SourceView,
};
use crate::registry::{ComponentDriver, ComponentSpec};
use uuid::Uuid;

/// Q10 fixed-point unity gain.
pub const GAIN_UNITY: u32 = 1 << 10;

/// A 1:1 gain applying a Q10 fixed-point coefficient per sample.
///
/// The configuration blob is a little-endian `u32` coefficient where
/// [`GAIN_UNITY`] passes samples through untouched.
pub struct Gain {
    coefficient: u32,
    scratch: Vec<u8>,
}

impl Gain {
    /// Creates a gain stage with the given Q10 coefficient.
    pub fn new(coefficient: u32) -> Self {
        Self {
            coefficient,
            scratch: Vec::new(),
        }
    }

    /// Current Q10 coefficient.
    pub fn coefficient(&self) -> u32 {
        self.coefficient
    }
}

impl Default for Gain {
    fn default() -> Self {
        Self::new(GAIN_UNITY)
    }
}

impl AudioStreamModule for Gain {
    fn prepare(&mut self, params: &ModuleParams) -> Result<(), EngineError> {
        // Processing chunk: one period, resized only outside the copy path.
        self.scratch
            .resize(params.period_bytes.max(params.format.frame_bytes()), 0);
        Ok(())
    }

    fn process(
        &mut self,
        sources: &mut [SourceView<'_>],
        sinks: &mut [SinkView<'_>],
        frames: usize,
    ) -> Result<(), ProcessError> {
        let (Some(source), Some(sink)) = (sources.first_mut(), sinks.first_mut()) else {
            return Err(ProcessError::NoData);
        };
        let format = source.format();
        let container = format.container_bytes as usize;
        let mut remaining = format.frames_to_bytes(frames);
        while remaining > 0 {
            let chunk = remaining.min(self.scratch.len());
            let got = source.read_frames(&mut self.scratch[..chunk]);
            if got == 0 {
                break;
            }
            for sample in self.scratch[..got].chunks_exact_mut(container) {
                let value = super::read_sample(sample, format.container_bytes);
                let scaled = (value * i64::from(self.coefficient)) >> 10;
                super::write_sample(sample, format.container_bytes, scaled);
            }
            sink.write_frames(&self.scratch[..got]);
            remaining -= got;
        }
        Ok(())
    }

    fn set_config(&mut self, blob: &[u8]) -> Result<(), EngineError> {
        let bytes: [u8; 4] = blob.try_into().map_err(|_| EngineError::InvalidParams {
            reason: format!("gain blob must be 4 bytes, got {}", blob.len()),
        })?;
        self.coefficient = u32::from_le_bytes(bytes);
        Ok(())
    }

    fn get_config(&self) -> Result<Vec<u8>, EngineError> {
        Ok(self.coefficient.to_le_bytes().to_vec())
    }

    fn supports(&self, format: &StreamFormat) -> bool {
        super::integer_pcm(format)
    }
}

/// Driver constructing gain components.
pub struct GainDriver;

impl ComponentDriver for GainDriver {
    fn uuid(&self) -> Uuid {
        // Stable driver key.
        Uuid::from_u128(0xb77e_677e_5ff4_4188_af14_fba8_bdbf_8682)
    }

    fn name(&self) -> &str {
        "gain"
    }

    fn create(&self, id: ComponentId, spec: &ComponentSpec) -> Result<ModuleAdapter, EngineError> {
        let mut gain = Gain::default();
        if !spec.blob.is_empty() {
            gain.set_config(&spec.blob)?;
        }
        Ok(ModuleAdapter::new(
            id,
            "gain",
            spec.domain,
            ModuleKind::AudioStream(Box::new(gain)),
        ))
    }
}

/// Registers the driver instance.
pub(crate) fn driver() -> Arc<dyn ComponentDriver> {
    Arc::new(GainDriver)
}
