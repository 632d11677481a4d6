//! Spectral front-end: Hann-windowed STFT magnitude spectrogram.

use ndarray::Array2;
use num_complex::Complex32;
use rustfft::FftPlanner;

use crate::config::SpectralConfig;

fn hann_window(size: usize) -> Vec<f32> {
    (0..size)
        .map(|i| 0.5 - 0.5 * (2.0 * std::f32::consts::PI * i as f32 / (size - 1) as f32).cos())
        .collect()
}

/// Magnitude spectrogram, frames along axis 0 and frequency bins along axis
/// 1. Empty (`0 x n_bins`) when `samples` is shorter than `n_fft`.
pub fn spectrogram(samples: &[f32], cfg: SpectralConfig) -> Array2<f32> {
    let n_fft = cfg.n_fft;
    let hop = cfg.hop;
    let n_bins = n_fft / 2 + 1;

    if samples.len() < n_fft {
        return Array2::zeros((0, n_bins));
    }

    let window = hann_window(n_fft);
    let mut planner = FftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(n_fft);

    let num_frames = (samples.len() - n_fft) / hop + 1;
    let mut out = Array2::<f32>::zeros((num_frames, n_bins));

    let mut buf: Vec<Complex32> = vec![Complex32::new(0.0, 0.0); n_fft];
    for frame_idx in 0..num_frames {
        let start = frame_idx * hop;
        for i in 0..n_fft {
            buf[i] = Complex32::new(samples[start + i] * window[i], 0.0);
        }
        fft.process(&mut buf);
        for bin in 0..n_bins {
            out[[frame_idx, bin]] = buf[bin].norm();
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_cfg() -> SpectralConfig {
        SpectralConfig { sample_rate: 22050, n_fft: 2048, hop: 512 }
    }

    fn sine(freq: f32, sr: u32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / sr as f32).sin())
            .collect()
    }

    #[test]
    fn empty_on_short_input() {
        let cfg = default_cfg();
        let samples = vec![0.0f32; cfg.n_fft - 1];
        let spec = spectrogram(&samples, cfg);
        assert_eq!(spec.shape()[0], 0);
        assert_eq!(spec.shape()[1], cfg.n_fft / 2 + 1);
    }

    #[test]
    fn frame_count_matches_hop_arithmetic() {
        let cfg = default_cfg();
        let samples = vec![0.0f32; cfg.n_fft + cfg.hop * 3];
        let spec = spectrogram(&samples, cfg);
        let expected = (samples.len() - cfg.n_fft) / cfg.hop + 1;
        assert_eq!(spec.shape()[0], expected);
    }

    #[test]
    fn pure_tone_peaks_near_expected_bin() {
        let cfg = default_cfg();
        let samples = sine(1000.0, cfg.sample_rate, cfg.n_fft * 4);
        let spec = spectrogram(&samples, cfg);
        let mid_frame = spec.shape()[0] / 2;
        let row = spec.row(mid_frame);
        let (peak_bin, _) = row
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .unwrap();
        let expected_bin = (1000.0 * cfg.n_fft as f32 / cfg.sample_rate as f32).round() as usize;
        assert!((peak_bin as i64 - expected_bin as i64).abs() <= 1);
    }

    #[test]
    fn magnitude_not_power() {
        // A bin's value should scale linearly, not quadratically, with amplitude.
        let cfg = default_cfg();
        let low = sine(1000.0, cfg.sample_rate, cfg.n_fft * 2);
        let high: Vec<f32> = low.iter().map(|s| s * 2.0).collect();
        let spec_low = spectrogram(&low, cfg);
        let spec_high = spectrogram(&high, cfg);
        let frame = spec_low.shape()[0] / 2;
        let bin = spec_low
            .row(frame)
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .unwrap()
            .0;
        let ratio = spec_high[[frame, bin]] / spec_low[[frame, bin]];
        assert!((ratio - 2.0).abs() < 0.05);
    }
}
