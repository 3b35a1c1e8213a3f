//! Peaking equalizer in sink-source mode.
//!
//! One biquad section per channel. Runs in either scheduler domain: in LL the
//! adapter hands it the attached buffer endpoints, in DP it runs on the
//! shadow queue endpoints inside a worker task.

use std::sync::Arc;

use crate::component::ComponentId;
use crate::error::{EngineError, ProcessError};
use crate::format::StreamFormat;
use crate::module::{ModuleAdapter, ModuleKind, ModuleParams, SinkSourceModule};
use crate::registry::{ComponentDriver, ComponentSpec};
use crate::stream::{SampleSink, SampleSource};
use uuid::Uuid;

/// Per-channel biquad state.
#[derive(Debug, Clone, Copy, Default)]
struct BiquadState {
    x1: f64,
    x2: f64,
    y1: f64,
    y2: f64,
}

/// Normalized biquad coefficients.
#[derive(Debug, Clone, Copy)]
struct Coefficients {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
}

impl Coefficients {
    fn identity() -> Self {
        Self {
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
        }
    }

    /// Peaking filter at `freq` Hz with `gain_db` boost/cut and quality `q`.
    fn peaking(rate: u32, freq: f64, gain_db: f64, q: f64) -> Self {
        let a = 10f64.powf(gain_db / 40.0);
        let w0 = 2.0 * std::f64::consts::PI * freq / f64::from(rate.max(1));
        let alpha = w0.sin() / (2.0 * q.max(0.01));
        let a0 = 1.0 + alpha / a;
        Self {
            b0: (1.0 + alpha * a) / a0,
            b1: (-2.0 * w0.cos()) / a0,
            b2: (1.0 - alpha * a) / a0,
            a1: (-2.0 * w0.cos()) / a0,
            a2: (1.0 - alpha / a) / a0,
        }
    }
}

/// Peaking EQ module.
///
/// The configuration blob is three little-endian `u32`s: center frequency in
/// Hz, gain in centi-dB as an offset from -128 dB, and Q in thousandths.
pub struct Eq {
    coefficients: Coefficients,
    states: Vec<BiquadState>,
    scratch: Vec<u8>,
    format: Option<StreamFormat>,
    pending: Option<(u32, f64, f64)>,
}

impl Eq {
    /// Creates a flat (identity) equalizer.
    pub fn new() -> Self {
        Self {
            coefficients: Coefficients::identity(),
            states: Vec::new(),
            scratch: Vec::new(),
            format: None,
            pending: None,
        }
    }

    /// Configures a peaking section; takes effect at prepare.
    pub fn set_peak(&mut self, freq: u32, gain_db: f64, q: f64) {
        self.pending = Some((freq, gain_db, q));
        if let Some(format) = self.format {
            self.coefficients = Coefficients::peaking(format.rate, f64::from(freq), gain_db, q);
        }
    }
}

impl Default for Eq {
    fn default() -> Self {
        Self::new()
    }
}

impl SinkSourceModule for Eq {
    fn prepare(
        &mut self,
        params: &ModuleParams,
        _num_sources: usize,
        _num_sinks: usize,
    ) -> Result<(), EngineError> {
        self.format = Some(params.format);
        self.states = vec![BiquadState::default(); usize::from(params.format.channels)];
        self.scratch
            .resize(params.period_bytes.max(params.format.frame_bytes()), 0);
        if let Some((freq, gain_db, q)) = self.pending {
            self.coefficients =
                Coefficients::peaking(params.format.rate, f64::from(freq), gain_db, q);
        }
        Ok(())
    }

    fn process(
        &mut self,
        sources: &[&dyn SampleSource],
        sinks: &[&dyn SampleSink],
    ) -> Result<(), ProcessError> {
        let (Some(source), Some(sink)) = (sources.first(), sinks.first()) else {
            return Err(ProcessError::NoData);
        };
        let Some(format) = self.format else {
            return Err(ProcessError::Fatal("eq not prepared".to_string()));
        };
        let frame_bytes = format.frame_bytes().max(1);
        let container = format.container_bytes;
        let cb = usize::from(container);
        let channels = usize::from(format.channels);

        let mut total = source.available().min(sink.free());
        total -= total % frame_bytes;
        if total == 0 {
            return if source.available() < frame_bytes {
                Err(ProcessError::NoData)
            } else {
                Err(ProcessError::NoSpace)
            };
        }

        let mut moved = 0;
        while moved < total {
            let scratch_len = self.scratch.len();
            let chunk = (total - moved).min(scratch_len);
            let chunk = chunk - chunk % frame_bytes;
            let got = {
                let staged = &mut self.scratch[..chunk];
                source.read(staged)
            };
            if got == 0 {
                break;
            }
            for frame in self.scratch[..got].chunks_exact_mut(frame_bytes) {
                for ch in 0..channels {
                    let sample = &mut frame[ch * cb..(ch + 1) * cb];
                    let x = super::read_sample(sample, container) as f64;
                    let y = {
                        let c = self.coefficients;
                        let s = &mut self.states[ch];
                        let y = c.b0 * x + c.b1 * s.x1 + c.b2 * s.x2 - c.a1 * s.y1 - c.a2 * s.y2;
                        s.x2 = s.x1;
                        s.x1 = x;
                        s.y2 = s.y1;
                        s.y1 = y;
                        y
                    };
                    super::write_sample(sample, container, y as i64);
                }
            }
            sink.write(&self.scratch[..got]);
            moved += got;
        }
        Ok(())
    }

    fn set_config(&mut self, blob: &[u8]) -> Result<(), EngineError> {
        if blob.len() != 12 {
            return Err(EngineError::InvalidParams {
                reason: format!("eq blob must be 12 bytes, got {}", blob.len()),
            });
        }
        let freq = u32::from_le_bytes([blob[0], blob[1], blob[2], blob[3]]);
        let gain_centi = u32::from_le_bytes([blob[4], blob[5], blob[6], blob[7]]);
        let q_milli = u32::from_le_bytes([blob[8], blob[9], blob[10], blob[11]]);
        let gain_db = f64::from(gain_centi) / 100.0 - 128.0;
        let q = f64::from(q_milli) / 1000.0;
        self.set_peak(freq, gain_db, q);
        Ok(())
    }

    fn reset(&mut self) {
        for state in &mut self.states {
            *state = BiquadState::default();
        }
    }

    fn supports(&self, format: &StreamFormat) -> bool {
        super::integer_pcm(format)
    }
}

/// Driver constructing EQ components.
pub struct EqDriver;

impl ComponentDriver for EqDriver {
    fn uuid(&self) -> Uuid {
        Uuid::from_u128(0x5150_c0e9_2053_4b73_ba4e_a68d_7a68_1e31)
    }

    fn name(&self) -> &str {
        "eq"
    }

    fn create(&self, id: ComponentId, spec: &ComponentSpec) -> Result<ModuleAdapter, EngineError> {
        let mut eq = Eq::new();
        if !spec.blob.is_empty() {
            eq.set_config(&spec.blob)?;
        }
        Ok(ModuleAdapter::new(
            id,
            "eq",
            spec.domain,
            ModuleKind::sink_source(eq),
        ))
    }
}

pub(crate) fn driver() -> Arc<dyn ComponentDriver> {
    Arc::new(EqDriver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{AudioBuffer, BufferId};
    use crate::memory::CacheMode;

    fn run_eq(eq: &mut Eq, input: &[i16]) -> Vec<i16> {
        let fmt = StreamFormat::s16(48_000, 1);
        eq.prepare(
            &ModuleParams {
                format: fmt,
                period_frames: 48,
                period_bytes: fmt.period_bytes(1_000),
            },
            1,
            1,
        )
        .unwrap();

        let src = AudioBuffer::alloc(BufferId(1), 1024, 2, CacheMode::Coherent).unwrap();
        let dst = AudioBuffer::alloc(BufferId(2), 1024, 2, CacheMode::Coherent).unwrap();
        src.set_format(fmt);
        dst.set_format(fmt);
        let bytes: Vec<u8> = input.iter().flat_map(|s| s.to_le_bytes()).collect();
        src.sink().write(&bytes);

        let source = src.source();
        let sink = dst.sink();
        eq.process(&[&source], &[&sink]).unwrap();

        let out_src = dst.source();
        let mut raw = vec![0u8; bytes.len()];
        let n = out_src.read(&mut raw);
        raw[..n]
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect()
    }

    #[test]
    fn test_identity_eq_is_bit_exact() {
        let mut eq = Eq::new();
        let input = [100i16, -200, 300, -400, 500];
        assert_eq!(run_eq(&mut eq, &input), input);
    }

    #[test]
    fn test_boost_changes_samples() {
        let mut eq = Eq::new();
        eq.set_peak(1_000, 12.0, 0.7);
        let input: Vec<i16> = (0..96)
            .map(|i| ((i as f64 * 0.13).sin() * 8000.0) as i16)
            .collect();
        let output = run_eq(&mut eq, &input);
        assert_eq!(output.len(), input.len());
        assert_ne!(output, input);
    }

    #[test]
    fn test_empty_source_is_flow_control() {
        let mut eq = Eq::new();
        let fmt = StreamFormat::s16(48_000, 1);
        eq.prepare(
            &ModuleParams {
                format: fmt,
                period_frames: 48,
                period_bytes: 96,
            },
            1,
            1,
        )
        .unwrap();
        let src = AudioBuffer::alloc(BufferId(1), 64, 2, CacheMode::Coherent).unwrap();
        let dst = AudioBuffer::alloc(BufferId(2), 64, 2, CacheMode::Coherent).unwrap();
        src.set_format(fmt);
        dst.set_format(fmt);
        let source = src.source();
        let sink = dst.sink();
        let err = eq.process(&[&source], &[&sink]).unwrap_err();
        assert!(err.is_flow_control());
    }

    #[test]
    fn test_config_blob_shape() {
        let mut eq = Eq::new();
        assert!(eq.set_config(&[0; 11]).is_err());
        // 6 dB boost encoded as centi-dB offset from -128 dB.
        let mut blob = 1_000u32.to_le_bytes().to_vec();
        blob.extend_from_slice(&13_400u32.to_le_bytes());
        blob.extend_from_slice(&700u32.to_le_bytes());
        assert!(eq.set_config(&blob).is_ok());
    }
}
