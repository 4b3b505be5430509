//! Sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! Whisper-style models need 16 kHz mono f32 while WAV files come at any
//! rate. `RateConverter` converts whole buffers: input is fed in fixed
//! `chunk_size` blocks, the tail block is zero-padded and the output is
//! trimmed back to the exact converted length.
//!
//! When source rate == target rate, `RateConverter` is a passthrough and no
//! rubato session is created at all.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::info;

use crate::error::{Result, WordtimeError};

/// Converts f32 mono audio from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` when source rate == target rate (passthrough mode).
    resampler: Option<FastFixedIn<f32>>,
    /// How many input samples rubato expects per process call.
    chunk_size: usize,
    ratio: f64,
    /// Pre-allocated output buffer: `[1][output_frames_max]`.
    output_buf: Vec<Vec<f32>>,
}

impl RateConverter {
    /// # Errors
    /// Returns `WordtimeError::AudioDecode` if rubato fails to initialise.
    pub fn new(source_rate: u32, target_rate: u32, chunk_size: usize) -> Result<Self> {
        let ratio = target_rate as f64 / source_rate as f64;
        if source_rate == target_rate {
            return Ok(Self {
                resampler: None,
                chunk_size,
                ratio,
                output_buf: Vec::new(),
            });
        }

        let resampler = FastFixedIn::<f32>::new(
            ratio,
            1.0, // fixed ratio
            PolynomialDegree::Cubic,
            chunk_size,
            1, // mono
        )
        .map_err(|e| WordtimeError::AudioDecode(format!("resampler init: {e}")))?;

        let max_out = resampler.output_frames_max();
        info!(source_rate, target_rate, chunk_size, "resampling enabled");

        Ok(Self {
            resampler: Some(resampler),
            chunk_size,
            ratio,
            output_buf: vec![vec![0f32; max_out]; 1],
        })
    }

    /// Convert a complete buffer.
    pub fn convert_all(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        let Some(ref mut resampler) = self.resampler else {
            return Ok(samples.to_vec());
        };

        let expected = (samples.len() as f64 * self.ratio).round() as usize;
        let mut result = Vec::with_capacity(expected + self.chunk_size);
        let mut block = vec![0f32; self.chunk_size];

        for chunk in samples.chunks(self.chunk_size) {
            block[..chunk.len()].copy_from_slice(chunk);
            block[chunk.len()..].fill(0.0);
            let (_consumed, produced) = resampler
                .process_into_buffer(&[&block[..]], &mut self.output_buf, None)
                .map_err(|e| WordtimeError::AudioDecode(format!("resampler process: {e}")))?;
            result.extend_from_slice(&self.output_buf[0][..produced]);
        }

        result.resize(expected, 0.0);
        Ok(result)
    }

    /// Returns `true` when source rate == target rate (no resampling occurs).
    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}
