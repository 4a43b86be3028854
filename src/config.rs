//! Pipeline settings, mel parameters and configuration presets.
//!
//! Settings resolution follows a fixed precedence: an explicit per-call
//! override wins over a preset value, which wins over the built-in default.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{LipSyncError, Result};

/// Working sample rate of the whole pipeline in Hz.
pub const SAMPLE_RATE: u32 = 16_000;

/// Minimum number of decoded samples below which audio is treated as corrupt.
pub const MIN_AUDIO_SAMPLES: usize = 100;

/// Width of one spectrogram chunk in mel frames.
pub const MEL_STEP_SIZE: usize = 16;

/// Mel frames produced per second of audio (sample_rate / hop_size).
pub const MEL_FRAMES_PER_SECOND: f64 = 80.0;

/// Four-sided padding applied to detected face boxes, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pads {
    pub top: u32,
    pub bottom: u32,
    pub left: u32,
    pub right: u32,
}

impl Default for Pads {
    fn default() -> Self {
        Self {
            top: 0,
            bottom: 10,
            left: 0,
            right: 0,
        }
    }
}

/// A fixed region in source-frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

/// Resolved settings for one inference run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Frame rate used for static image input; video input reads its own.
    pub fps: f64,
    /// Padding applied to detected face boxes.
    pub pads: Pads,
    /// Initial face detection batch size (halved on resource exhaustion).
    pub face_det_batch_size: usize,
    /// Model batch size.
    pub model_batch_size: usize,
    /// Square crop resolution expected by the model.
    pub img_size: u32,
    /// Downscale factor applied to decoded video frames.
    pub resize_factor: u32,
    /// Rotate video frames 90 degrees clockwise.
    pub rotate: bool,
    /// Optional crop applied to every decoded video frame.
    pub crop: Option<Region>,
    /// Optional fixed face box that bypasses detection entirely.
    pub fixed_box: Option<Region>,
    /// Treat the input as a single static image even if it is a video.
    pub force_static: bool,
    /// Disable temporal smoothing of face boxes.
    pub nosmooth: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            fps: 25.0,
            pads: Pads::default(),
            face_det_batch_size: 16,
            model_batch_size: 128,
            img_size: 96,
            resize_factor: 1,
            rotate: false,
            crop: None,
            fixed_box: None,
            force_static: false,
            nosmooth: false,
        }
    }
}

/// Per-call overrides. `None` means "inherit from the preset or default".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsOverrides {
    pub fps: Option<f64>,
    pub pads: Option<Pads>,
    pub face_det_batch_size: Option<usize>,
    pub model_batch_size: Option<usize>,
    pub img_size: Option<u32>,
    pub resize_factor: Option<u32>,
    pub rotate: Option<bool>,
    pub crop: Option<Region>,
    pub fixed_box: Option<Region>,
    pub force_static: Option<bool>,
    pub nosmooth: Option<bool>,
}

impl Settings {
    /// Apply explicit overrides on top of these settings.
    pub fn with_overrides(mut self, ov: &SettingsOverrides) -> Self {
        if let Some(v) = ov.fps {
            self.fps = v;
        }
        if let Some(v) = ov.pads {
            self.pads = v;
        }
        if let Some(v) = ov.face_det_batch_size {
            self.face_det_batch_size = v;
        }
        if let Some(v) = ov.model_batch_size {
            self.model_batch_size = v;
        }
        if let Some(v) = ov.img_size {
            self.img_size = v;
        }
        if let Some(v) = ov.resize_factor {
            self.resize_factor = v;
        }
        if let Some(v) = ov.rotate {
            self.rotate = v;
        }
        if let Some(v) = ov.crop {
            self.crop = Some(v);
        }
        if let Some(v) = ov.fixed_box {
            self.fixed_box = Some(v);
        }
        if let Some(v) = ov.force_static {
            self.force_static = v;
        }
        if let Some(v) = ov.nosmooth {
            self.nosmooth = v;
        }
        self
    }
}

/// Mel spectrogram extraction parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MelConfig {
    pub n_fft: usize,
    pub hop_size: usize,
    pub win_size: usize,
    pub num_mels: usize,
    pub fmin: f32,
    pub fmax: f32,
    /// First-order pre-emphasis coefficient.
    pub preemphasis: f32,
    /// Whether pre-emphasis is applied at all.
    pub preemphasize: bool,
    /// Reference level subtracted after dB conversion.
    pub ref_level_db: f32,
    /// Amplitude floor in dB for the log conversion.
    pub min_level_db: f32,
    /// Normalization target half-range.
    pub max_abs_value: f32,
    /// Symmetric ([-max_abs, max_abs]) vs asymmetric ([0, max_abs]) output.
    pub symmetric_mels: bool,
    /// Clip out-of-range values instead of failing the run.
    pub allow_clipping_in_normalization: bool,
    pub signal_normalization: bool,
}

impl Default for MelConfig {
    fn default() -> Self {
        Self {
            n_fft: 800,
            hop_size: 200,
            win_size: 800,
            num_mels: 80,
            fmin: 55.0,
            fmax: 7600.0,
            preemphasis: 0.97,
            preemphasize: true,
            ref_level_db: 20.0,
            min_level_db: -100.0,
            max_abs_value: 4.0,
            symmetric_mels: true,
            allow_clipping_in_normalization: true,
            signal_normalization: true,
        }
    }
}

/// A named settings preset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preset {
    pub name: String,
    pub description: String,
    pub settings: Settings,
    /// Built-in presets cannot be deleted.
    #[serde(default)]
    pub custom: bool,
}

/// Built-in presets mirroring the shipped defaults.
pub fn builtin_presets() -> BTreeMap<String, Preset> {
    let mut presets = BTreeMap::new();
    presets.insert(
        "high_quality".to_string(),
        Preset {
            name: "High Quality".to_string(),
            description: "Best quality output with higher processing time".to_string(),
            settings: Settings {
                face_det_batch_size: 4,
                model_batch_size: 32,
                ..Settings::default()
            },
            custom: false,
        },
    );
    presets.insert(
        "fast_processing".to_string(),
        Preset {
            name: "Fast Processing".to_string(),
            description: "Faster processing with good quality".to_string(),
            settings: Settings {
                resize_factor: 2,
                face_det_batch_size: 8,
                model_batch_size: 64,
                ..Settings::default()
            },
            custom: false,
        },
    );
    presets.insert(
        "mobile_optimized".to_string(),
        Preset {
            name: "Mobile Optimized".to_string(),
            description: "Optimized for mobile devices and smaller files".to_string(),
            settings: Settings {
                fps: 24.0,
                resize_factor: 2,
                face_det_batch_size: 16,
                model_batch_size: 128,
                pads: Pads {
                    bottom: 15,
                    ..Pads::default()
                },
                ..Settings::default()
            },
            custom: false,
        },
    );
    presets.insert(
        "portrait_mode".to_string(),
        Preset {
            name: "Portrait Mode".to_string(),
            description: "Optimized for portrait/vertical videos".to_string(),
            settings: Settings {
                fps: 30.0,
                face_det_batch_size: 6,
                model_batch_size: 48,
                pads: Pads {
                    bottom: 20,
                    ..Pads::default()
                },
                ..Settings::default()
            },
            custom: false,
        },
    );
    presets.insert(
        "batch_processing".to_string(),
        Preset {
            name: "Batch Processing".to_string(),
            description: "Optimized for processing multiple files".to_string(),
            settings: Settings {
                resize_factor: 2,
                face_det_batch_size: 16,
                model_batch_size: 128,
                nosmooth: true,
                ..Settings::default()
            },
            custom: false,
        },
    );
    presets
}

/// JSON-backed preset storage.
pub struct PresetStore {
    path: PathBuf,
}

impl PresetStore {
    /// Open a preset store at `path`, seeding the built-in presets on first use.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
        };
        if !store.path.exists() {
            if let Some(parent) = store.path.parent() {
                fs::create_dir_all(parent)?;
            }
            store.save(&builtin_presets())?;
            info!("Seeded default presets at {}", store.path.display());
        }
        Ok(store)
    }

    pub fn load(&self) -> Result<BTreeMap<String, Preset>> {
        let data = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn save(&self, presets: &BTreeMap<String, Preset>) -> Result<()> {
        let data = serde_json::to_string_pretty(presets)?;
        fs::write(&self.path, data)?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<Preset>> {
        Ok(self.load()?.remove(id))
    }

    /// Create a custom preset and return its id.
    pub fn create(&self, name: &str, description: &str, settings: Settings) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let mut presets = self.load()?;
        presets.insert(
            id.clone(),
            Preset {
                name: name.to_string(),
                description: description.to_string(),
                settings,
                custom: true,
            },
        );
        self.save(&presets)?;
        info!("Created preset '{}' ({})", name, id);
        Ok(id)
    }

    pub fn update(&self, id: &str, settings: Settings) -> Result<bool> {
        let mut presets = self.load()?;
        let Some(preset) = presets.get_mut(id) else {
            return Ok(false);
        };
        preset.settings = settings;
        self.save(&presets)?;
        Ok(true)
    }

    /// Delete a custom preset. Built-in presets are refused.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let mut presets = self.load()?;
        match presets.get(id) {
            Some(p) if p.custom => {
                presets.remove(id);
                self.save(&presets)?;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Ok(false),
        }
    }
}

/// Resolve effective settings: override > preset > default.
pub fn resolve_settings(preset: Option<&Preset>, overrides: &SettingsOverrides) -> Settings {
    let base = preset
        .map(|p| p.settings.clone())
        .unwrap_or_default();
    base.with_overrides(overrides)
}

impl MelConfig {
    /// Amplitude floor corresponding to `min_level_db`.
    pub fn min_level(&self) -> f32 {
        (self.min_level_db / 20.0 * std::f32::consts::LN_10).exp()
    }

    pub fn validate(&self) -> Result<()> {
        if self.fmax > (SAMPLE_RATE as f32) / 2.0 {
            return Err(LipSyncError::Input(format!(
                "fmax {} exceeds Nyquist for {} Hz",
                self.fmax, SAMPLE_RATE
            )));
        }
        if self.win_size > self.n_fft {
            return Err(LipSyncError::Input(
                "window size larger than FFT size".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn override_precedence() {
        let presets = builtin_presets();
        let preset = presets.get("fast_processing").unwrap();
        let overrides = SettingsOverrides {
            fps: Some(30.0),
            ..SettingsOverrides::default()
        };

        let resolved = resolve_settings(Some(preset), &overrides);
        // Explicit value wins over the preset.
        assert_eq!(resolved.fps, 30.0);
        // Preset value wins over the default.
        assert_eq!(resolved.model_batch_size, 64);
        // Untouched fields fall through to the default.
        assert_eq!(resolved.img_size, 96);
    }

    #[test]
    fn preset_store_roundtrip() {
        let dir = tempdir().unwrap();
        let store = PresetStore::open(dir.path().join("presets.json")).unwrap();

        let presets = store.load().unwrap();
        assert!(presets.contains_key("high_quality"));

        let id = store
            .create("My preset", "test", Settings::default())
            .unwrap();
        assert!(store.get(&id).unwrap().is_some());

        // Custom presets are deletable, built-ins are not.
        assert!(store.delete(&id).unwrap());
        assert!(!store.delete("high_quality").unwrap());
        assert!(store.get("high_quality").unwrap().is_some());
    }

    #[test]
    fn mel_config_validation() {
        assert!(MelConfig::default().validate().is_ok());

        let bad = MelConfig {
            fmax: 9000.0,
            ..MelConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
