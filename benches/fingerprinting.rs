use criterion::{black_box, criterion_group, criterion_main, Criterion};
use sonicgen_core::config::{LandmarkConfig, SpectralConfig};
use sonicgen_core::landmarks;
use sonicgen_core::spectral;
use uuid::Uuid;

fn tone(freq: f32, sr: u32, len: usize) -> Vec<f32> {
    (0..len)
        .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / sr as f32).sin())
        .collect()
}

fn fingerprint_benchmark(c: &mut Criterion) {
    let spectral_cfg = SpectralConfig { sample_rate: 22050, n_fft: 2048, hop: 512 };
    let landmark_cfg = LandmarkConfig {
        peak_delta_f: 20,
        peak_delta_t: 20,
        peak_percentile: 75.0,
        fan_dt_min: 1,
        fan_dt_max: 200,
        fan_df: 100,
        fan_out: 10,
        min_fingerprint_count: 1,
    };
    let samples = tone(1000.0, spectral_cfg.sample_rate, spectral_cfg.n_fft * 200);
    let source_id = Uuid::new_v4();

    c.bench_function("spectrogram_200_frames", |b| {
        b.iter(|| spectral::spectrogram(black_box(&samples), spectral_cfg))
    });

    let spec = spectral::spectrogram(&samples, spectral_cfg);
    c.bench_function("find_peaks_200_frames", |b| {
        b.iter(|| landmarks::find_peaks(black_box(&spec), landmark_cfg))
    });

    let peaks = landmarks::find_peaks(&spec, landmark_cfg);
    c.bench_function("pair_and_hash_200_frames", |b| {
        b.iter(|| landmarks::pair_and_hash(black_box(&peaks), source_id, landmark_cfg))
    });
}

criterion_group!(benches, fingerprint_benchmark);
criterion_main!(benches);
