//! Sine tone generator.

use std::sync::Arc;

use crate::component::ComponentId;
use crate::error::{EngineError, ProcessError};
use crate::format::StreamFormat;
use crate::module::{
    AudioStreamModule, ModuleAdapter, ModuleKind, ModuleParams, SinkView, SourceView,
};
use crate::registry::{ComponentDriver, ComponentSpec};
use uuid::Uuid;

/// Source-only component generating a sine wave into its sink.
///
/// The configuration blob is two little-endian `u32`s: frequency in Hz and
/// amplitude in thousandths of full scale.
pub struct Tone {
    frequency: u32,
    /// Amplitude in thousandths of full scale (1000 = 0 dBFS).
    amplitude_milli: u32,
    phase: f64,
    scratch: Vec<u8>,
}

impl Tone {
    /// Creates a generator for `frequency` Hz at `amplitude_milli`/1000 of
    /// full scale.
    pub fn new(frequency: u32, amplitude_milli: u32) -> Self {
        Self {
            frequency,
            amplitude_milli: amplitude_milli.min(1000),
            phase: 0.0,
            scratch: Vec::new(),
        }
    }
}

impl Default for Tone {
    fn default() -> Self {
        Self::new(997, 500)
    }
}

impl AudioStreamModule for Tone {
    fn prepare(&mut self, params: &ModuleParams) -> Result<(), EngineError> {
        self.scratch
            .resize(params.period_bytes.max(params.format.frame_bytes()), 0);
        Ok(())
    }

    fn process(
        &mut self,
        _sources: &mut [SourceView<'_>],
        sinks: &mut [SinkView<'_>],
        frames: usize,
    ) -> Result<(), ProcessError> {
        let Some(sink) = sinks.first_mut() else {
            return Err(ProcessError::NoSpace);
        };
        let format = sink.format();
        let container = usize::from(format.container_bytes);
        let full_scale = match format.container_bytes {
            2 => f64::from(i16::MAX),
            _ => f64::from(i32::MAX),
        };
        let amplitude = full_scale * f64::from(self.amplitude_milli) / 1000.0;
        let step = 2.0 * std::f64::consts::PI * f64::from(self.frequency)
            / f64::from(format.rate.max(1));

        let mut remaining = frames;
        while remaining > 0 {
            let chunk_frames = remaining.min(self.scratch.len() / format.frame_bytes().max(1));
            if chunk_frames == 0 {
                break;
            }
            let chunk = format.frames_to_bytes(chunk_frames);
            for frame in self.scratch[..chunk]
                .chunks_exact_mut(format.frame_bytes())
            {
                let value = (self.phase.sin() * amplitude) as i64;
                self.phase += step;
                for sample in frame.chunks_exact_mut(container) {
                    super::write_sample(sample, format.container_bytes, value);
                }
            }
            sink.write_frames(&self.scratch[..chunk]);
            remaining -= chunk_frames;
        }
        // Keep the phase bounded.
        self.phase %= 2.0 * std::f64::consts::PI;
        Ok(())
    }

    fn set_config(&mut self, blob: &[u8]) -> Result<(), EngineError> {
        if blob.len() != 8 {
            return Err(EngineError::InvalidParams {
                reason: format!("tone blob must be 8 bytes, got {}", blob.len()),
            });
        }
        self.frequency = u32::from_le_bytes([blob[0], blob[1], blob[2], blob[3]]);
        self.amplitude_milli =
            u32::from_le_bytes([blob[4], blob[5], blob[6], blob[7]]).min(1000);
        Ok(())
    }

    fn get_config(&self) -> Result<Vec<u8>, EngineError> {
        let mut blob = self.frequency.to_le_bytes().to_vec();
        blob.extend_from_slice(&self.amplitude_milli.to_le_bytes());
        Ok(blob)
    }

    fn reset(&mut self) {
        self.phase = 0.0;
    }

    fn max_sources(&self) -> usize {
        0
    }

    fn supports(&self, format: &StreamFormat) -> bool {
        super::integer_pcm(format)
    }
}

/// Driver constructing tone components.
pub struct ToneDriver;

impl ComponentDriver for ToneDriver {
    fn uuid(&self) -> Uuid {
        Uuid::from_u128(0x04e3_f894_2d81_4ed5_a9b7_6c337045c52c)
    }

    fn name(&self) -> &str {
        "tone"
    }

    fn create(&self, id: ComponentId, spec: &ComponentSpec) -> Result<ModuleAdapter, EngineError> {
        let mut tone = Tone::default();
        if !spec.blob.is_empty() {
            tone.set_config(&spec.blob)?;
        }
        Ok(ModuleAdapter::new(
            id,
            "tone",
            spec.domain,
            ModuleKind::AudioStream(Box::new(tone)),
        ))
    }
}

pub(crate) fn driver() -> Arc<dyn ComponentDriver> {
    Arc::new(ToneDriver)
}
