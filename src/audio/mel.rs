//! Log-mel spectrogram extraction.
//!
//! Pipeline: first-order pre-emphasis, centered STFT (periodic Hann, reflect
//! padding), Slaney-style mel filterbank projection, dB conversion against a
//! configurable floor, and normalization into a fixed numeric range. The
//! model's audio timeline is derived from this spectrogram, so a non-finite
//! value anywhere invalidates the whole run.

use ndarray::Array2;
use rustfft::num_complex::Complex32;
use rustfft::FftPlanner;

use crate::config::{MelConfig, SAMPLE_RATE};
use crate::error::{LipSyncError, Result};

/// A mel spectrogram laid out `[mel_bins, time_frames]`.
#[derive(Debug, Clone)]
pub struct MelSpectrogram {
    data: Array2<f32>,
}

impl MelSpectrogram {
    pub fn data(&self) -> &Array2<f32> {
        &self.data
    }

    pub fn num_mels(&self) -> usize {
        self.data.nrows()
    }

    pub fn num_frames(&self) -> usize {
        self.data.ncols()
    }

    #[cfg(test)]
    pub(crate) fn from_array(data: Array2<f32>) -> Self {
        Self { data }
    }
}

/// Slaney mel scale, matching librosa's default (htk=False).
fn hz_to_mel(freq: f32) -> f32 {
    const MIN_LOG_HZ: f32 = 1000.0;
    const MIN_LOG_MEL: f32 = 15.0;
    let logstep = 6.4f32.ln() / 27.0;

    if freq < MIN_LOG_HZ {
        3.0 * freq / 200.0
    } else {
        MIN_LOG_MEL + (freq / MIN_LOG_HZ).ln() / logstep
    }
}

fn mel_to_hz(mel: f32) -> f32 {
    const MIN_LOG_HZ: f32 = 1000.0;
    const MIN_LOG_MEL: f32 = 15.0;
    let logstep = 6.4f32.ln() / 27.0;

    if mel < MIN_LOG_MEL {
        200.0 * mel / 3.0
    } else {
        MIN_LOG_HZ * (logstep * (mel - MIN_LOG_MEL)).exp()
    }
}

/// Triangular mel filterbank `[num_mels, n_fft/2 + 1]` with Slaney area
/// normalization.
fn build_mel_filters(config: &MelConfig) -> Array2<f32> {
    let n_freq = config.n_fft / 2 + 1;
    let num_mels = config.num_mels;

    let fft_freqs: Vec<f32> = (0..n_freq)
        .map(|k| k as f32 * SAMPLE_RATE as f32 / config.n_fft as f32)
        .collect();

    let mel_min = hz_to_mel(config.fmin);
    let mel_max = hz_to_mel(config.fmax);
    let band_edges: Vec<f32> = (0..num_mels + 2)
        .map(|i| mel_to_hz(mel_min + (mel_max - mel_min) * i as f32 / (num_mels + 1) as f32))
        .collect();

    let mut filters = Array2::<f32>::zeros((num_mels, n_freq));
    for m in 0..num_mels {
        let lower = band_edges[m];
        let center = band_edges[m + 1];
        let upper = band_edges[m + 2];
        let enorm = 2.0 / (upper - lower);

        for (k, &freq) in fft_freqs.iter().enumerate() {
            let down = (freq - lower) / (center - lower).max(1e-6);
            let up = (upper - freq) / (upper - center).max(1e-6);
            let weight = down.min(up).max(0.0);
            filters[[m, k]] = weight * enorm;
        }
    }
    filters
}

fn build_hann_window(size: usize) -> Vec<f32> {
    (0..size)
        .map(|i| {
            let angle = 2.0 * std::f32::consts::PI * i as f32 / size as f32;
            0.5 * (1.0 - angle.cos())
        })
        .collect()
}

/// y[n] = x[n] - k * x[n-1]
fn preemphasis(samples: &[f32], k: f32) -> Vec<f32> {
    let mut out = Vec::with_capacity(samples.len());
    let mut prev = 0.0f32;
    for &x in samples {
        out.push(x - k * prev);
        prev = x;
    }
    out
}

/// Reflect-pad `pad` samples on both sides (librosa-style centered STFT).
fn reflect_pad(samples: &[f32], pad: usize) -> Vec<f32> {
    let n = samples.len();
    let mut out = Vec::with_capacity(n + 2 * pad);
    for i in 0..pad {
        let src = (pad - i).min(n.saturating_sub(1));
        out.push(samples[src]);
    }
    out.extend_from_slice(samples);
    for i in 0..pad {
        let src = n.saturating_sub(2 + i).min(n.saturating_sub(1));
        out.push(samples[src]);
    }
    out
}

/// Mel spectrogram extractor with precomputed window, filterbank and FFT plan.
pub struct MelExtractor {
    config: MelConfig,
    window: Vec<f32>,
    mel_filters: Array2<f32>,
    fft: std::sync::Arc<dyn rustfft::Fft<f32>>,
}

impl MelExtractor {
    pub fn new(config: MelConfig) -> Result<Self> {
        config.validate()?;
        let window = build_hann_window(config.win_size);
        let mel_filters = build_mel_filters(&config);
        let fft = FftPlanner::new().plan_fft_forward(config.n_fft);
        Ok(Self {
            config,
            window,
            mel_filters,
            fft,
        })
    }

    /// Compute the normalized log-mel spectrogram of `samples`.
    ///
    /// Fails with [`LipSyncError::Data`] when any normalized value is
    /// non-finite, and, with clipping disabled, when the dB spectrogram falls
    /// outside the representable range.
    pub fn extract(&self, samples: &[f32]) -> Result<MelSpectrogram> {
        let cfg = &self.config;

        let emphasized = if cfg.preemphasize {
            preemphasis(samples, cfg.preemphasis)
        } else {
            samples.to_vec()
        };

        let pad = cfg.n_fft / 2;
        if emphasized.is_empty() {
            return Err(LipSyncError::Input("no audio samples".to_string()));
        }
        let padded = reflect_pad(&emphasized, pad);

        let num_frames = if padded.len() >= cfg.n_fft {
            1 + (padded.len() - cfg.n_fft) / cfg.hop_size
        } else {
            return Err(LipSyncError::Input(
                "audio shorter than one analysis window".to_string(),
            ));
        };

        let n_freq = cfg.n_fft / 2 + 1;
        let mut magnitudes = Array2::<f32>::zeros((n_freq, num_frames));
        let mut buffer = vec![Complex32::new(0.0, 0.0); cfg.n_fft];

        // Window offset centers a short window inside the FFT frame.
        let win_offset = (cfg.n_fft - cfg.win_size) / 2;

        for t in 0..num_frames {
            let start = t * cfg.hop_size;
            buffer.fill(Complex32::new(0.0, 0.0));
            for i in 0..cfg.win_size {
                buffer[win_offset + i] =
                    Complex32::new(padded[start + win_offset + i] * self.window[i], 0.0);
            }
            self.fft.process(&mut buffer);
            for k in 0..n_freq {
                magnitudes[[k, t]] = buffer[k].norm();
            }
        }

        // Mel projection, then dB conversion against the level floor.
        let mel_power = self.mel_filters.dot(&magnitudes);
        let min_level = cfg.min_level();
        let mut db = mel_power.mapv(|x| 20.0 * x.max(min_level).log10() - cfg.ref_level_db);

        if !cfg.signal_normalization {
            return finalize(db);
        }

        if !cfg.allow_clipping_in_normalization {
            let max = db.iter().cloned().fold(f32::MIN, f32::max);
            let min = db.iter().cloned().fold(f32::MAX, f32::min);
            if max > 0.0 || min < cfg.min_level_db {
                return Err(LipSyncError::Data(format!(
                    "spectrogram outside normalizable range: [{:.1}, {:.1}] dB",
                    min, max
                )));
            }
        }

        let max_abs = cfg.max_abs_value;
        let min_db = cfg.min_level_db;
        if cfg.symmetric_mels {
            db.mapv_inplace(|s| {
                ((2.0 * max_abs) * ((s - min_db) / -min_db) - max_abs).clamp(-max_abs, max_abs)
            });
        } else {
            db.mapv_inplace(|s| (max_abs * ((s - min_db) / -min_db)).clamp(0.0, max_abs));
        }

        finalize(db)
    }
}

fn finalize(data: Array2<f32>) -> Result<MelSpectrogram> {
    if data.iter().any(|v| !v.is_finite()) {
        return Err(LipSyncError::Data(
            "mel spectrogram contains non-finite values; the source audio is corrupt or incompatible"
                .to_string(),
        ));
    }
    Ok(MelSpectrogram { data })
}
