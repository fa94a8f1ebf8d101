//! FFT-based spectral analysis
//!
//! Turns mono PCM into a fixed-size timbre vector: frame-level spectral
//! statistics plus log-spaced band energies, L2-normalized.

use std::sync::Arc;

use realfft::{RealFftPlanner, RealToComplex};
use rustfft::num_complex::Complex;

use crate::error::{WorkerError, WorkerResult};

/// Default FFT frame size (2048 samples = ~46ms at 44.1kHz)
pub const DEFAULT_FRAME_SIZE: usize = 2048;

/// Default hop size (512 samples = ~11.6ms at 44.1kHz, 75% overlap)
pub const DEFAULT_HOP_SIZE: usize = 512;

/// Log-spaced bands between [`LOWEST_BAND_HZ`] and Nyquist
pub const NUM_BANDS: usize = 27;

const LOWEST_BAND_HZ: f32 = 30.0;

/// Mean and std of centroid, flatness, rolloff, zero crossing rate and flux
const SCALAR_FEATURES: usize = 10;

/// Length of every vector produced by [`embed_samples`]
pub const EMBEDDING_DIMENSION: usize = SCALAR_FEATURES + 2 * NUM_BANDS;

/// Spectral analyzer with pre-computed FFT plan and window
pub struct SpectralAnalyzer {
    fft: Arc<dyn RealToComplex<f32>>,
    /// Pre-computed Hann window coefficients
    window: Vec<f32>,
    frame_size: usize,
    sample_rate: u32,
    scratch_input: Vec<f32>,
    scratch_output: Vec<Complex<f32>>,
}

impl SpectralAnalyzer {
    pub fn new(sample_rate: u32) -> Self {
        Self::with_frame_size(sample_rate, DEFAULT_FRAME_SIZE)
    }

    pub fn with_frame_size(sample_rate: u32, frame_size: usize) -> Self {
        let mut planner = RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(frame_size);

        let window: Vec<f32> = apodize::hanning_iter(frame_size)
            .map(|x| x as f32)
            .collect();

        Self {
            fft,
            window,
            frame_size,
            sample_rate,
            scratch_input: vec![0.0f32; frame_size],
            scratch_output: vec![Complex::new(0.0f32, 0.0f32); frame_size / 2 + 1],
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Windowed magnitude spectrum of one frame
    ///
    /// Frames shorter than `frame_size` are zero-padded.
    pub fn compute_spectrum(&mut self, frame: &[f32]) -> WorkerResult<Vec<f32>> {
        if frame.len() > self.frame_size {
            return Err(WorkerError::EmbeddingGeneration(format!(
                "frame of {} samples exceeds FFT size {}",
                frame.len(),
                self.frame_size
            )));
        }

        self.scratch_input.fill(0.0);
        for (slot, (&sample, &coef)) in self
            .scratch_input
            .iter_mut()
            .zip(frame.iter().zip(self.window.iter()))
        {
            *slot = sample * coef;
        }

        self.fft
            .process(&mut self.scratch_input, &mut self.scratch_output)
            .map_err(|e| WorkerError::EmbeddingGeneration(format!("FFT failed: {}", e)))?;

        Ok(self
            .scratch_output
            .iter()
            .map(|c| (c.re * c.re + c.im * c.im).sqrt())
            .collect())
    }

    fn bin_width(&self, spectrum: &[f32]) -> f32 {
        self.sample_rate as f32 / (2.0 * spectrum.len().max(1) as f32)
    }

    /// Weighted mean frequency in Hz
    pub fn spectral_centroid(&self, spectrum: &[f32]) -> f32 {
        let bin_width = self.bin_width(spectrum);
        let (weighted, total) = spectrum
            .iter()
            .enumerate()
            .fold((0.0f32, 0.0f32), |(w, t), (i, &m)| {
                (w + i as f32 * bin_width * m, t + m)
            });

        if total > f32::EPSILON {
            weighted / total
        } else {
            0.0
        }
    }

    /// Geometric over arithmetic mean: 0 for pure tones, 1 for white noise
    pub fn spectral_flatness(&self, spectrum: &[f32]) -> f32 {
        let valid: Vec<f32> = spectrum
            .iter()
            .copied()
            .filter(|&m| m > f32::EPSILON)
            .collect();
        if valid.is_empty() {
            return 0.0;
        }

        let n = valid.len() as f32;
        let geometric = (valid.iter().map(|m| m.ln()).sum::<f32>() / n).exp();
        let arithmetic = valid.iter().sum::<f32>() / n;

        if arithmetic > f32::EPSILON {
            (geometric / arithmetic).min(1.0)
        } else {
            0.0
        }
    }

    /// Frequency below which `percentile` of the energy lies
    pub fn spectral_rolloff(&self, spectrum: &[f32], percentile: f32) -> f32 {
        let bin_width = self.bin_width(spectrum);
        let total: f32 = spectrum.iter().map(|&m| m * m).sum();
        if total < f32::EPSILON {
            return 0.0;
        }

        let threshold = total * percentile.clamp(0.0, 1.0);
        let mut cumulative = 0.0f32;
        for (i, &m) in spectrum.iter().enumerate() {
            cumulative += m * m;
            if cumulative >= threshold {
                return (i as f32 + 1.0) * bin_width;
            }
        }
        spectrum.len() as f32 * bin_width
    }

    /// Energy per log-spaced band, as `ln(1 + energy)`
    pub fn log_band_energies(&self, spectrum: &[f32]) -> [f32; NUM_BANDS] {
        let mut bands = [0.0f32; NUM_BANDS];
        if spectrum.is_empty() {
            return bands;
        }

        let bin_width = self.bin_width(spectrum);
        let nyquist = self.sample_rate as f32 / 2.0;
        let ratio = (nyquist / LOWEST_BAND_HZ).max(1.0);

        for (band, slot) in bands.iter_mut().enumerate() {
            let low = LOWEST_BAND_HZ * ratio.powf(band as f32 / NUM_BANDS as f32);
            let high = LOWEST_BAND_HZ * ratio.powf((band + 1) as f32 / NUM_BANDS as f32);
            let low_bin = (low / bin_width).floor() as usize;
            let high_bin = ((high / bin_width).ceil() as usize).min(spectrum.len());
            if low_bin < high_bin {
                let energy: f32 = spectrum[low_bin..high_bin].iter().map(|&m| m * m).sum();
                *slot = energy.ln_1p();
            }
        }
        bands
    }
}

/// Positive spectral change between consecutive frames
pub fn spectral_flux(prev: &[f32], curr: &[f32]) -> f32 {
    prev.iter()
        .zip(curr.iter())
        .map(|(&p, &c)| (c - p).max(0.0))
        .sum()
}

/// Sign changes per sample, in [0, 1]
pub fn zero_crossing_rate(samples: &[f32]) -> f32 {
    if samples.len() < 2 {
        return 0.0;
    }
    let crossings = samples.windows(2).filter(|w| w[0] * w[1] < 0.0).count();
    crossings as f32 / (samples.len() - 1) as f32
}

/// Running mean and variance (Welford)
#[derive(Debug, Clone, Copy, Default)]
struct Stat {
    n: u32,
    mean: f32,
    m2: f32,
}

impl Stat {
    fn push(&mut self, value: f32) {
        self.n += 1;
        let delta = value - self.mean;
        self.mean += delta / self.n as f32;
        self.m2 += delta * (value - self.mean);
    }

    fn std(&self) -> f32 {
        if self.n < 2 {
            0.0
        } else {
            (self.m2 / (self.n - 1) as f32).sqrt()
        }
    }
}

/// Compute an L2-normalized [`EMBEDDING_DIMENSION`] vector from mono samples
pub fn embed_samples(samples: &[f32], sample_rate: u32) -> WorkerResult<Vec<f32>> {
    if samples.is_empty() || sample_rate == 0 {
        return Err(WorkerError::EmbeddingGeneration(
            "no audio samples to analyze".to_string(),
        ));
    }

    let mut analyzer = SpectralAnalyzer::new(sample_rate);
    let frame_size = analyzer.frame_size();
    let nyquist = sample_rate as f32 / 2.0;

    let mut centroid = Stat::default();
    let mut flatness = Stat::default();
    let mut rolloff = Stat::default();
    let mut zcr = Stat::default();
    let mut flux = Stat::default();
    let mut bands = [Stat::default(); NUM_BANDS];
    let mut prev: Option<Vec<f32>> = None;

    let mut start = 0;
    loop {
        let end = (start + frame_size).min(samples.len());
        let frame = &samples[start..end];
        let spectrum = analyzer.compute_spectrum(frame)?;

        centroid.push(analyzer.spectral_centroid(&spectrum) / nyquist);
        flatness.push(analyzer.spectral_flatness(&spectrum));
        rolloff.push(analyzer.spectral_rolloff(&spectrum, 0.85) / nyquist);
        zcr.push(zero_crossing_rate(frame));
        if let Some(prev) = &prev {
            flux.push(spectral_flux(prev, &spectrum));
        }
        for (stat, energy) in bands.iter_mut().zip(analyzer.log_band_energies(&spectrum)) {
            stat.push(energy);
        }
        prev = Some(spectrum);

        if end == samples.len() {
            break;
        }
        start += DEFAULT_HOP_SIZE;
    }

    let mut vector = Vec::with_capacity(EMBEDDING_DIMENSION);
    for stat in [centroid, flatness, rolloff, zcr] {
        vector.push(stat.mean);
        vector.push(stat.std());
    }
    // Flux scales with amplitude; compress it like the band energies
    vector.push(flux.mean.ln_1p());
    vector.push(flux.std().ln_1p());
    vector.extend(bands.iter().map(|b| b.mean));
    vector.extend(bands.iter().map(|b| b.std()));

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        vector.iter_mut().for_each(|v| *v /= norm);
    }
    Ok(vector)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    fn sine(freq: f32, sample_rate: u32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * PI * freq * i as f32 / sample_rate as f32).sin())
            .collect()
    }

    #[test]
    fn test_centroid_tracks_frequency() {
        let mut analyzer = SpectralAnalyzer::new(44100);
        let low = analyzer
            .compute_spectrum(&sine(440.0, 44100, DEFAULT_FRAME_SIZE))
            .unwrap();
        let high = analyzer
            .compute_spectrum(&sine(5000.0, 44100, DEFAULT_FRAME_SIZE))
            .unwrap();

        let low_c = analyzer.spectral_centroid(&low);
        let high_c = analyzer.spectral_centroid(&high);
        assert!((low_c - 440.0).abs() < 150.0, "centroid was {}", low_c);
        assert!(high_c > low_c);
    }

    #[test]
    fn test_compute_spectrum_rejects_oversized_frame() {
        let mut analyzer = SpectralAnalyzer::with_frame_size(8000, 256);
        assert!(analyzer.compute_spectrum(&vec![0.0; 512]).is_err());
        assert_eq!(analyzer.compute_spectrum(&[0.5; 100]).unwrap().len(), 129);
    }

    #[test]
    fn test_flatness_sine_below_noise() {
        let mut analyzer = SpectralAnalyzer::new(44100);
        let tone = analyzer
            .compute_spectrum(&sine(1000.0, 44100, DEFAULT_FRAME_SIZE))
            .unwrap();
        // Deterministic pseudo-noise
        let mut seed = 12345u32;
        let noise: Vec<f32> = (0..DEFAULT_FRAME_SIZE)
            .map(|_| {
                seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12345);
                (seed >> 16) as f32 / 32768.0 - 1.0
            })
            .collect();
        let noise = analyzer.compute_spectrum(&noise).unwrap();

        assert!(analyzer.spectral_flatness(&tone) < analyzer.spectral_flatness(&noise));
    }

    #[test]
    fn test_zero_crossing_rate() {
        assert_eq!(zero_crossing_rate(&[]), 0.0);
        assert_eq!(zero_crossing_rate(&[1.0, -1.0, 1.0, -1.0]), 1.0);
        assert_eq!(zero_crossing_rate(&[1.0, 1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_embedding_shape_and_norm() {
        let samples = sine(440.0, 22050, 22050);
        let vector = embed_samples(&samples, 22050).unwrap();

        assert_eq!(vector.len(), EMBEDDING_DIMENSION);
        assert!(vector.iter().all(|v| v.is_finite()));
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_embedding_of_short_clip() {
        let vector = embed_samples(&sine(440.0, 8000, 100), 8000).unwrap();
        assert_eq!(vector.len(), EMBEDDING_DIMENSION);
    }

    #[test]
    fn test_embedding_distinguishes_timbre() {
        let low = embed_samples(&sine(110.0, 22050, 22050), 22050).unwrap();
        let high = embed_samples(&sine(6000.0, 22050, 22050), 22050).unwrap();
        let cosine: f32 = low.iter().zip(high.iter()).map(|(a, b)| a * b).sum();
        assert!(cosine < 0.999);
    }

    #[test]
    fn test_embedding_rejects_empty_input() {
        assert!(matches!(
            embed_samples(&[], 44100),
            Err(WorkerError::EmbeddingGeneration(_))
        ));
    }
}
