//! Windowed sample-rate converter.
//!
//! Linear-interpolation resampling over the block the adapter stages each
//! call. The module advertises an input window of several periods, so the
//! adapter's deep buffering feeds the DAI zeros until the window has filled.

use std::sync::Arc;

use crate::component::ComponentId;
use crate::error::{EngineError, ProcessError};
use crate::format::StreamFormat;
use crate::module::{
    ModuleAdapter, ModuleKind, ModuleParams, RawBuffer, RawDataModule, RawLayout,
};
use crate::registry::{ComponentDriver, ComponentSpec};
use uuid::Uuid;

/// Sample-rate converter in raw-data mode.
pub struct RateConverter {
    out_rate: u32,
    /// Input window in scheduling periods.
    window_periods: usize,
    in_format: Option<StreamFormat>,
}

impl RateConverter {
    /// Creates a converter producing `out_rate` with a `window_periods`-period
    /// input window.
    pub fn new(out_rate: u32, window_periods: usize) -> Self {
        Self {
            out_rate,
            window_periods: window_periods.max(1),
            in_format: None,
        }
    }

    /// Output sample rate.
    pub fn out_rate(&self) -> u32 {
        self.out_rate
    }

    fn resample_block(&self, format: &StreamFormat, input: &[u8], output: &mut RawBuffer) {
        let frame_bytes = format.frame_bytes();
        let in_frames = input.len() / frame_bytes.max(1);
        if in_frames == 0 {
            return;
        }
        let ratio = f64::from(self.out_rate) / f64::from(format.rate.max(1));
        let out_frames = (in_frames as f64 * ratio).ceil() as usize;
        let container = format.container_bytes;
        let channels = usize::from(format.channels);
        let cb = usize::from(container);

        // Largest supported frame: 8 channels of 4-byte containers.
        let mut frame = [0u8; 64];
        let frame = &mut frame[..frame_bytes.min(64)];
        for i in 0..out_frames {
            let src_pos = i as f64 / ratio;
            let idx = src_pos.floor() as usize;
            let frac = src_pos - idx as f64;
            for ch in 0..channels {
                let s1 = if idx < in_frames {
                    super::read_sample(&input[idx * frame_bytes + ch * cb..], container)
                } else {
                    super::read_sample(&input[(in_frames - 1) * frame_bytes + ch * cb..], container)
                };
                let value = if idx + 1 < in_frames {
                    let s2 =
                        super::read_sample(&input[(idx + 1) * frame_bytes + ch * cb..], container);
                    (s1 as f64 + (s2 - s1) as f64 * frac) as i64
                } else {
                    s1
                };
                super::write_sample(&mut frame[ch * cb..], container, value);
            }
            if output.produce(frame) < frame_bytes {
                break;
            }
        }
    }
}

impl RawDataModule for RateConverter {
    fn prepare(&mut self, params: &ModuleParams) -> Result<RawLayout, EngineError> {
        self.in_format = Some(params.format);
        let in_buff_size = params.period_bytes * self.window_periods;
        let ratio = f64::from(self.out_rate) / f64::from(params.format.rate.max(1));
        let in_frames = params.period_frames * self.window_periods;
        let out_frames = (in_frames as f64 * ratio).ceil() as usize + 1;
        Ok(RawLayout {
            in_buff_size,
            out_buff_size: out_frames * params.format.frame_bytes(),
        })
    }

    fn process(
        &mut self,
        inputs: &mut [RawBuffer],
        outputs: &mut [RawBuffer],
    ) -> Result<(), ProcessError> {
        let Some(format) = self.in_format else {
            return Err(ProcessError::Fatal("rate converter not prepared".to_string()));
        };
        let (Some(input), Some(output)) = (inputs.first_mut(), outputs.first_mut()) else {
            return Err(ProcessError::NoData);
        };
        if input.is_empty() {
            return Err(ProcessError::NoData);
        }
        let staged = input.len();
        self.resample_block(&format, input.valid(), output);
        input.set_consumed(staged);
        Ok(())
    }

    fn output_format(&self, input: &StreamFormat) -> StreamFormat {
        StreamFormat {
            rate: self.out_rate,
            ..*input
        }
    }

    fn supports(&self, format: &StreamFormat) -> bool {
        super::integer_pcm(format)
    }
}

/// Driver constructing sample-rate converter components.
///
/// The spec blob is two little-endian `u32`s: output rate and window size in
/// periods.
pub struct RateConverterDriver;

impl ComponentDriver for RateConverterDriver {
    fn uuid(&self) -> Uuid {
        Uuid::from_u128(0xc1c5_326d_8390_46b4_aa47_95c3_beca_6550)
    }

    fn name(&self) -> &str {
        "src"
    }

    fn create(&self, id: ComponentId, spec: &ComponentSpec) -> Result<ModuleAdapter, EngineError> {
        let (out_rate, window) = match spec.blob.len() {
            0 => (48_000, 1),
            8 => (
                u32::from_le_bytes([spec.blob[0], spec.blob[1], spec.blob[2], spec.blob[3]]),
                u32::from_le_bytes([spec.blob[4], spec.blob[5], spec.blob[6], spec.blob[7]])
                    as usize,
            ),
            n => {
                return Err(EngineError::InvalidParams {
                    reason: format!("src blob must be 8 bytes, got {n}"),
                })
            }
        };
        Ok(ModuleAdapter::new(
            id,
            "src",
            spec.domain,
            ModuleKind::RawData(Box::new(RateConverter::new(out_rate, window))),
        ))
    }
}

pub(crate) fn driver() -> Arc<dyn ComponentDriver> {
    Arc::new(RateConverterDriver)
}
