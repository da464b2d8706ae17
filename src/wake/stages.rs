//! Wake pipeline stage contracts and the built-in feature extractor.
//!
//! The three stages mirror the usual wake-word model split: an acoustic
//! feature extractor, a shared speech embedding model, and one small
//! classifier per wake phrase. The embedding and classifier stages are
//! host-provided model wrappers; feature extraction has a built-in
//! DSP implementation below.

use crate::error::Result;
use async_trait::async_trait;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

/// One acoustic feature vector at a fixed hop.
pub type FeatureFrame = Vec<f32>;

/// One speech embedding over a window of feature frames.
pub type Embedding = Vec<f32>;

/// Acoustic feature extraction stage.
///
/// Implementations keep their own sample carry-over so arbitrary input
/// frame sizes still produce features at a fixed hop.
pub trait FeatureModel: Send {
    /// Feature vector length per frame.
    fn feature_dim(&self) -> usize;

    /// Extract zero or more feature frames from normalized samples in
    /// \[-1, 1\]. Called once per input frame.
    fn extract(&mut self, samples: &[f32]) -> Result<Vec<FeatureFrame>>;
}

/// Speech embedding stage.
pub trait EmbeddingModel: Send {
    /// Number of feature frames per embedding window.
    fn window(&self) -> usize;

    /// Embedding vector length.
    fn dim(&self) -> usize;

    /// Derive one embedding from exactly [`Self::window`] feature frames.
    fn embed(&mut self, frames: &[FeatureFrame]) -> Result<Embedding>;
}

/// Per-wake-phrase classifier stage.
pub trait WakeClassifier: Send {
    /// Model name reported in detections.
    fn name(&self) -> &str;

    /// Number of embeddings per classification window.
    fn window(&self) -> usize;

    /// Score above which this classifier counts as a detection.
    fn threshold(&self) -> f32;

    /// Score the most recent [`Self::window`] embeddings.
    fn score(&mut self, embeddings: &[Embedding]) -> Result<f32>;
}

/// The loaded stage set. Classifiers keep their registration order; the
/// first classifier above its threshold wins a detection.
pub struct WakeStages {
    /// Acoustic feature extractor.
    pub features: Box<dyn FeatureModel>,
    /// Shared embedding model.
    pub embedding: Box<dyn EmbeddingModel>,
    /// Wake phrase classifiers, in registration order.
    pub classifiers: Vec<Box<dyn WakeClassifier>>,
}

/// Loads all three stages. Loading is async (model files, downloads);
/// a missing feature or embedding stage must fail the load.
#[async_trait]
pub trait WakeModelLoader: Send + Sync {
    async fn load(&self) -> Result<WakeStages>;
}

// ── Built-in log-mel feature extractor ──────────────────────────────

/// FFT window size in samples (32ms at 16kHz).
const WINDOW_SIZE: usize = 512;
/// Hop size in samples (16ms at 16kHz).
const HOP_SIZE: usize = 256;
/// Number of mel filter banks.
const NUM_MEL_BINS: usize = 32;

/// Streaming log-mel filterbank features over rustfft.
///
/// Produces [`NUM_MEL_BINS`]-dim frames at a fixed [`HOP_SIZE`] hop,
/// carrying leftover samples across calls so input frame size does not
/// have to be a hop multiple.
pub struct MelFeatureModel {
    fft: Arc<dyn Fft<f32>>,
    filterbank: Vec<Vec<f32>>,
    hann: Vec<f32>,
    pending: Vec<f32>,
}

impl MelFeatureModel {
    pub fn new(sample_rate: u32) -> Self {
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(WINDOW_SIZE);
        let hann: Vec<f32> = (0..WINDOW_SIZE)
            .map(|n| {
                0.5 * (1.0
                    - (2.0 * std::f32::consts::PI * n as f32 / (WINDOW_SIZE - 1) as f32).cos())
            })
            .collect();
        Self {
            fft,
            filterbank: build_mel_filterbank(NUM_MEL_BINS, WINDOW_SIZE, sample_rate),
            hann,
            pending: Vec::with_capacity(WINDOW_SIZE * 2),
        }
    }

    fn frame_features(&self, window: &[f32]) -> FeatureFrame {
        let mut buf: Vec<Complex<f32>> = window
            .iter()
            .zip(self.hann.iter())
            .map(|(&s, &w)| Complex::new(s * w, 0.0))
            .collect();
        self.fft.process(&mut buf);

        let power_len = WINDOW_SIZE / 2 + 1;
        let power: Vec<f32> = buf[..power_len]
            .iter()
            .map(|c| (c.re * c.re + c.im * c.im) / WINDOW_SIZE as f32)
            .collect();

        self.filterbank
            .iter()
            .map(|filter| {
                let energy: f32 = filter.iter().zip(power.iter()).map(|(&f, &p)| f * p).sum();
                energy.max(1e-10).ln()
            })
            .collect()
    }
}

impl FeatureModel for MelFeatureModel {
    fn feature_dim(&self) -> usize {
        NUM_MEL_BINS
    }

    fn extract(&mut self, samples: &[f32]) -> Result<Vec<FeatureFrame>> {
        self.pending.extend_from_slice(samples);

        let mut frames = Vec::new();
        while self.pending.len() >= WINDOW_SIZE {
            frames.push(self.frame_features(&self.pending[..WINDOW_SIZE]));
            self.pending.drain(..HOP_SIZE);
        }
        Ok(frames)
    }
}

/// Build a mel-spaced triangular filterbank.
fn build_mel_filterbank(num_filters: usize, fft_size: usize, sample_rate: u32) -> Vec<Vec<f32>> {
    let power_len = fft_size / 2 + 1;
    let low_mel = hz_to_mel(0.0);
    let high_mel = hz_to_mel(sample_rate as f32 / 2.0);

    let num_points = num_filters + 2;
    let mel_points: Vec<f32> = (0..num_points)
        .map(|i| low_mel + (high_mel - low_mel) * i as f32 / (num_points - 1) as f32)
        .collect();
    let bin_points: Vec<usize> = mel_points
        .iter()
        .map(|&m| ((fft_size as f32 + 1.0) * mel_to_hz(m) / sample_rate as f32).floor() as usize)
        .collect();

    let mut filterbank = Vec::with_capacity(num_filters);
    for m in 0..num_filters {
        let mut filter = vec![0.0f32; power_len];
        let left = bin_points[m];
        let center = bin_points[m + 1];
        let right = bin_points[m + 2];

        if center > left {
            let denom = (center - left) as f32;
            for (i, val) in filter.iter_mut().enumerate().take(center).skip(left) {
                if i < power_len {
                    *val = (i - left) as f32 / denom;
                }
            }
        }
        if right > center {
            let denom = (right - center) as f32;
            for (i, val) in filter.iter_mut().enumerate().take(right + 1).skip(center) {
                if i < power_len {
                    *val = (right - i) as f32 / denom;
                }
            }
        }

        filterbank.push(filter);
    }

    filterbank
}

fn hz_to_mel(hz: f32) -> f32 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz(mel: f32) -> f32 {
    700.0 * (10.0_f32.powf(mel / 2595.0) - 1.0)
}
