//! Audio input helpers: loading, rate conversion and mel-frame utilities.
//!
//! Engines take mono `f32` samples already at the model's sample rate.
//! `AudioClip` carries samples plus their rate for callers that start from
//! a file; `pad_or_trim` and the frame-range helpers operate on the
//! `[n_mels, frames]` features a model produces.

pub mod mel;
pub mod resample;

use std::path::Path;

use ndarray::{s, Array2, ArrayView2, ArrayViewMut2, Axis};
use tracing::debug;

use crate::error::{Result, WordtimeError};

pub use mel::MelFrontend;
pub use resample::RateConverter;

/// A contiguous block of mono PCM samples at a known sample rate.
#[derive(Debug, Clone)]
pub struct AudioClip {
    /// Mono f32 samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
    /// Sample rate in Hz (e.g. 16000, 44100, 48000).
    pub sample_rate: u32,
}

impl AudioClip {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Read a WAV file, downmixing to mono.
    pub fn from_wav(path: &Path) -> Result<Self> {
        let mut reader =
            hound::WavReader::open(path).map_err(|e| WordtimeError::AudioDecode(e.to_string()))?;
        let spec = reader.spec();
        let channels = usize::from(spec.channels.max(1));

        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| WordtimeError::AudioDecode(e.to_string()))?,
            hound::SampleFormat::Int if spec.bits_per_sample <= 16 => reader
                .samples::<i16>()
                .map(|s| s.map(|v| v as f32 / i16::MAX as f32))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| WordtimeError::AudioDecode(e.to_string()))?,
            hound::SampleFormat::Int => {
                let max = ((1_i64 << (spec.bits_per_sample - 1)) - 1) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / max))
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| WordtimeError::AudioDecode(e.to_string()))?
            }
        };

        debug!(
            path = ?path,
            channels,
            sample_rate = spec.sample_rate,
            "decoded WAV file"
        );

        if channels == 1 {
            return Ok(Self::new(interleaved, spec.sample_rate));
        }
        let mono = interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect();
        Ok(Self::new(mono, spec.sample_rate))
    }

    /// Convert to `target_rate`, returning `self` untouched when already there.
    pub fn into_rate(self, target_rate: u32) -> Result<Self> {
        if self.sample_rate == target_rate {
            return Ok(self);
        }
        let mut converter = RateConverter::new(self.sample_rate, target_rate, 1024)?;
        let samples = converter.convert_all(&self.samples)?;
        Ok(Self::new(samples, target_rate))
    }

    /// Returns the duration of this clip in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Zero-pad or truncate features to exactly `n_frames` columns.
pub fn pad_or_trim(mel: ArrayView2<'_, f32>, n_frames: usize) -> Array2<f32> {
    let (n_mels, frames) = mel.dim();
    let mut out = Array2::<f32>::zeros((n_mels, n_frames));
    let keep = frames.min(n_frames);
    out.slice_mut(s![.., ..keep])
        .assign(&mel.slice(s![.., ..keep]));
    out
}

/// Zero the frames `[from, to)` of `mel`, clamped to its width.
pub fn mute_frames(mut mel: ArrayViewMut2<'_, f32>, from: usize, to: usize) {
    let width = mel.len_of(Axis(1));
    let (from, to) = (from.min(width), to.min(width));
    if from < to {
        mel.slice_mut(s![.., from..to]).fill(0.0);
    }
}

/// Copy frames `[from, to)` of `original` back into `mel`.
pub fn restore_frames(
    mut mel: ArrayViewMut2<'_, f32>,
    original: ArrayView2<'_, f32>,
    from: usize,
    to: usize,
) {
    let width = mel.len_of(Axis(1)).min(original.len_of(Axis(1)));
    let (from, to) = (from.min(width), to.min(width));
    if from < to {
        mel.slice_mut(s![.., from..to])
            .assign(&original.slice(s![.., from..to]));
    }
}

/// Convert seconds to a sample index at `sample_rate`.
pub fn secs_to_samples(secs: f64, sample_rate: u32) -> usize {
    (secs * sample_rate as f64).round().max(0.0) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn pad_or_trim_pads_with_zeros() {
        let mel = array![[1.0f32, 2.0], [3.0, 4.0]];
        let out = pad_or_trim(mel.view(), 4);
        assert_eq!(out, array![[1.0, 2.0, 0.0, 0.0], [3.0, 4.0, 0.0, 0.0]]);
    }

    #[test]
    fn pad_or_trim_truncates() {
        let mel = array![[1.0f32, 2.0, 3.0]];
        assert_eq!(pad_or_trim(mel.view(), 2), array![[1.0, 2.0]]);
    }

    #[test]
    fn mute_then_restore_round_trips_a_range() {
        let original = array![[1.0f32, 2.0, 3.0, 4.0]];
        let mut mel = original.clone();
        mute_frames(mel.view_mut(), 1, 3);
        assert_eq!(mel, array![[1.0, 0.0, 0.0, 4.0]]);
        restore_frames(mel.view_mut(), original.view(), 2, 10);
        assert_eq!(mel, array![[1.0, 0.0, 3.0, 4.0]]);
    }

    #[test]
    fn empty_ranges_are_ignored() {
        let mut mel = array![[1.0f32, 2.0]];
        mute_frames(mel.view_mut(), 2, 1);
        mute_frames(mel.view_mut(), 5, 9);
        assert_eq!(mel, array![[1.0, 2.0]]);
    }

    #[test]
    fn clip_duration() {
        let clip = AudioClip::new(vec![0.0; 8_000], 16_000);
        assert_eq!(clip.duration_secs(), 0.5);
        assert!(!clip.is_empty());
    }
}
