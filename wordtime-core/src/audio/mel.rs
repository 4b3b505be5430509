//! Whisper log-mel frontend.
//!
//! ## Parameters (must match training)
//!
//! | Parameter       | Value          |
//! |-----------------|----------------|
//! | Hann window     | 400 samples    |
//! | FFT size        | 400            |
//! | Frequency bins  | 201 (400/2+1)  |
//! | Hop length      | 160 (10 ms)    |
//! | Mel range       | 0–8 000 Hz     |
//!
//! ## Algorithm
//!
//! 1. Append the requested zero padding, then reflect-pad by `n_fft / 2` on
//!    both sides (centered STFT).
//! 2. One frame per hop; the trailing partial frame is dropped, so the
//!    output has `len / hop` frames.
//! 3. Power spectrum → slaney mel filterbank → `log10` (floored at 1e-10).
//! 4. Clamp to `max - 8`, then scale with `(x + 4) / 4`.
//!
//! Muted regions are zeroed *after* this transform by the engines, so the
//! frontend itself never sees masking.

use std::sync::Arc;

use ndarray::Array2;
use rustfft::{num_complex::Complex, FftPlanner};

/// Precomputed window, filterbank and FFT plan.
pub struct MelFrontend {
    n_fft: usize,
    hop: usize,
    n_mels: usize,
    mel_filters: Vec<Vec<f32>>,
    hann_window: Vec<f32>,
    fft: Arc<dyn rustfft::Fft<f32>>,
}

impl MelFrontend {
    pub fn new(n_mels: usize, n_fft: usize, hop: usize, sample_rate: u32) -> Self {
        Self {
            n_fft,
            hop,
            n_mels,
            mel_filters: build_mel_filters(n_fft, sample_rate, n_mels, 0.0, 8_000.0),
            hann_window: build_hann_window(n_fft),
            fft: Arc::from(FftPlanner::<f32>::new().plan_fft_forward(n_fft)),
        }
    }

    /// Whisper's 16 kHz frontend with `n_mels` bands.
    pub fn whisper(n_mels: usize) -> Self {
        Self::new(n_mels, 400, 160, 16_000)
    }

    pub fn n_mels(&self) -> usize {
        self.n_mels
    }

    /// Log-mel features `[n_mels, (samples.len() + padding) / hop]`.
    pub fn compute(&self, samples: &[f32], padding: usize) -> Array2<f32> {
        let mut padded = Vec::with_capacity(samples.len() + padding);
        padded.extend_from_slice(samples);
        padded.resize(samples.len() + padding, 0.0);

        let n_frames = padded.len() / self.hop;
        let mut mel = Array2::<f32>::zeros((self.n_mels, n_frames));
        if n_frames == 0 {
            return mel;
        }

        let centered = reflect_pad(&padded, self.n_fft / 2);
        let n_freqs = self.n_fft / 2 + 1;
        let mut fft_buf = vec![Complex::new(0.0f32, 0.0); self.n_fft];

        for frame in 0..n_frames {
            let start = frame * self.hop;
            for (i, v) in fft_buf.iter_mut().enumerate() {
                *v = Complex::new(centered[start + i] * self.hann_window[i], 0.0);
            }
            self.fft.process(&mut fft_buf);

            for m in 0..self.n_mels {
                let energy: f32 = (0..n_freqs)
                    .map(|k| self.mel_filters[m][k] * fft_buf[k].norm_sqr())
                    .sum();
                mel[[m, frame]] = energy;
            }
        }

        mel.mapv_inplace(|v| v.max(1e-10).log10());
        let max_val = mel.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        mel.mapv_inplace(|v| (v.max(max_val - 8.0) + 4.0) / 4.0);
        mel
    }
}

impl std::fmt::Debug for MelFrontend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MelFrontend")
            .field("n_fft", &self.n_fft)
            .field("hop", &self.hop)
            .field("n_mels", &self.n_mels)
            .finish_non_exhaustive()
    }
}

fn build_hann_window(n: usize) -> Vec<f32> {
    use std::f32::consts::PI;
    (0..n)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / n as f32).cos()))
        .collect()
}

fn build_mel_filters(
    fft_size: usize,
    sr: u32,
    n_mels: usize,
    fmin: f32,
    fmax: f32,
) -> Vec<Vec<f32>> {
    let n_freqs = fft_size / 2 + 1;
    let mel_min = hz_to_mel_slaney(fmin);
    let mel_max = hz_to_mel_slaney(fmax);

    let hz_pts: Vec<f32> = (0..=(n_mels + 1))
        .map(|i| mel_to_hz_slaney(mel_min + (mel_max - mel_min) * i as f32 / (n_mels + 1) as f32))
        .collect();

    (0..n_mels)
        .map(|m| {
            let (lower, center, upper) = (hz_pts[m], hz_pts[m + 1], hz_pts[m + 2]);
            let down_denom = (center - lower).max(1e-10);
            let up_denom = (upper - center).max(1e-10);
            let enorm = 2.0 / (upper - lower).max(1e-10);
            (0..n_freqs)
                .map(|k| {
                    let freq = k as f32 * sr as f32 / fft_size as f32;
                    let w = if freq >= lower && freq <= center {
                        (freq - lower) / down_denom
                    } else if freq > center && freq <= upper {
                        (upper - freq) / up_denom
                    } else {
                        0.0
                    };
                    (w * enorm).max(0.0)
                })
                .collect()
        })
        .collect()
}

fn reflect_pad(samples: &[f32], pad: usize) -> Vec<f32> {
    if pad == 0 {
        return samples.to_vec();
    }
    if samples.len() < 2 {
        let fill = samples.first().copied().unwrap_or(0.0);
        return vec![fill; samples.len() + pad * 2];
    }

    let n = samples.len() as isize;
    (-(pad as isize)..(n + pad as isize))
        .map(|i| samples[reflect_index(i, samples.len())])
        .collect()
}

fn reflect_index(mut i: isize, len: usize) -> usize {
    let max = len as isize - 1;
    while i < 0 || i > max {
        if i < 0 {
            i = -i;
        } else {
            i = 2 * max - i;
        }
    }
    i as usize
}

fn hz_to_mel_slaney(hz: f32) -> f32 {
    let f_sp = 200.0 / 3.0;
    let min_log_hz = 1_000.0;
    let min_log_mel = min_log_hz / f_sp; // 15
    let logstep = (6.4_f32).ln() / 27.0;
    if hz >= min_log_hz {
        min_log_mel + (hz / min_log_hz).ln() / logstep
    } else {
        hz / f_sp
    }
}

fn mel_to_hz_slaney(mel: f32) -> f32 {
    let f_sp = 200.0 / 3.0;
    let min_log_hz = 1_000.0;
    let min_log_mel = min_log_hz / f_sp;
    let logstep = (6.4_f32).ln() / 27.0;
    if mel >= min_log_mel {
        min_log_hz * (logstep * (mel - min_log_mel)).exp()
    } else {
        mel * f_sp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn tone(freq: f32, secs: f32) -> Vec<f32> {
        let n = (16_000.0 * secs) as usize;
        (0..n)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / 16_000.0).sin() * 0.5)
            .collect()
    }

    #[test]
    fn frame_count_follows_hop() {
        let fe = MelFrontend::whisper(80);
        let mel = fe.compute(&vec![0.0; 16_000], 201);
        assert_eq!(mel.dim(), (80, (16_000 + 201) / 160));
    }

    #[test]
    fn silence_is_flat() {
        let fe = MelFrontend::whisper(80);
        let mel = fe.compute(&vec![0.0; 3_200], 0);
        let first = mel[[0, 0]];
        assert!(mel.iter().all(|&v| (v - first).abs() < 1e-6));
    }

    #[test]
    fn tone_energy_peaks_in_low_band() {
        let fe = MelFrontend::whisper(80);
        let mel = fe.compute(&tone(440.0, 0.5), 0);
        let frame = 20;
        let (argmax, _) = (0..80).fold((0, f32::NEG_INFINITY), |(bi, bv), m| {
            let v = mel[[m, frame]];
            if v > bv {
                (m, v)
            } else {
                (bi, bv)
            }
        });
        // 440 Hz sits in the lower fifth of an 8 kHz slaney scale.
        assert!(argmax < 20, "argmax band={argmax}");
    }

    #[test]
    fn dynamic_range_is_clamped() {
        let fe = MelFrontend::whisper(80);
        let mel = fe.compute(&tone(1_000.0, 0.2), 0);
        let max = mel.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let min = mel.iter().copied().fold(f32::INFINITY, f32::min);
        assert!(max - min <= 2.0 + 1e-5);
    }

    #[test]
    fn reflect_pad_mirrors_edges() {
        assert_eq!(reflect_pad(&[1.0, 2.0, 3.0], 2), vec![3.0, 2.0, 1.0, 2.0, 3.0, 2.0, 1.0]);
        assert_relative_eq!(hz_to_mel_slaney(mel_to_hz_slaney(20.0)), 20.0, epsilon = 1e-3);
    }
}
