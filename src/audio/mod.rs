//! Audio decoding and resampling.
//!
//! Decodes an audio file into mono f32 PCM in [-1.0, 1.0] at the pipeline's
//! working sample rate. WAV goes through a specialized hound path; everything
//! else goes through symphonia. Multi-channel audio is downmixed to mono by
//! averaging.

pub mod mel;

use std::fs::File;
use std::io::Read;
use std::path::Path;

use hound::{SampleFormat, WavReader};
use log::{info, warn};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::CODEC_TYPE_NULL;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::probe::Hint;

use crate::config::{MIN_AUDIO_SAMPLES, SAMPLE_RATE};
use crate::error::{LipSyncError, Result};

/// Decoded mono waveform at a known sample rate.
#[derive(Debug, Clone)]
pub struct Waveform {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl Waveform {
    pub fn duration_seconds(&self) -> f32 {
        self.samples.len() as f32 / self.sample_rate as f32
    }
}

/// Decode `path` to mono f32 samples at `target_rate`.
///
/// Fails with [`LipSyncError::Input`] when fewer than [`MIN_AUDIO_SAMPLES`]
/// samples decode, which indicates an empty or corrupt source.
pub fn load_audio<P: AsRef<Path>>(path: P, target_rate: u32) -> Result<Waveform> {
    let path = path.as_ref();
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("")
        .to_lowercase();

    let (samples, sample_rate) = match extension.as_str() {
        "wav" => decode_wav_file(path)?,
        _ => decode_with_symphonia(path, &extension)?,
    };

    if samples.len() < MIN_AUDIO_SAMPLES {
        return Err(LipSyncError::Input(format!(
            "input audio too short: {} samples",
            samples.len()
        )));
    }

    info!(
        "Decoded {} samples at {} Hz from {}",
        samples.len(),
        sample_rate,
        path.display()
    );

    if sample_rate == target_rate {
        return Ok(Waveform {
            samples,
            sample_rate,
        });
    }

    let resampled = resample(&samples, sample_rate, target_rate)?;
    Ok(Waveform {
        samples: resampled,
        sample_rate: target_rate,
    })
}

/// Convenience wrapper using the pipeline's working rate.
pub fn load_audio_16k<P: AsRef<Path>>(path: P) -> Result<Waveform> {
    load_audio(path, SAMPLE_RATE)
}

fn decode_wav_file(path: &Path) -> Result<(Vec<f32>, u32)> {
    let mut reader = WavReader::open(path)
        .map_err(|e| LipSyncError::Input(format!("failed to open WAV file: {}", e)))?;
    let spec = reader.spec();

    let pcm: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Int, 16) => reader
            .samples::<i16>()
            .map(|s| s.map(|v| v as f32 / 32768.0))
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| LipSyncError::Input(format!("WAV decode error: {}", e)))?,
        (SampleFormat::Int, 24) => reader
            .samples::<i32>()
            .map(|s| s.map(|v| v as f32 / 8_388_608.0))
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| LipSyncError::Input(format!("WAV decode error: {}", e)))?,
        (SampleFormat::Int, 32) => reader
            .samples::<i32>()
            .map(|s| s.map(|v| v as f32 / 2_147_483_648.0))
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| LipSyncError::Input(format!("WAV decode error: {}", e)))?,
        (SampleFormat::Float, 32) => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| LipSyncError::Input(format!("WAV decode error: {}", e)))?,
        (format, bits) => {
            return Err(LipSyncError::Input(format!(
                "unsupported WAV format: {:?}, {} bits",
                format, bits
            )));
        }
    };

    Ok((downmix(pcm, spec.channels as usize), spec.sample_rate))
}

fn decode_with_symphonia(path: &Path, extension: &str) -> Result<(Vec<f32>, u32)> {
    let mut buffer = Vec::new();
    File::open(path)?.read_to_end(&mut buffer)?;

    let cursor = std::io::Cursor::new(buffer);
    let mss = MediaSourceStream::new(Box::new(cursor), Default::default());

    let mut hint = Hint::new();
    if !extension.is_empty() {
        hint.with_extension(extension);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &Default::default(), &Default::default())
        .map_err(|e| LipSyncError::Input(format!("failed to probe audio format: {}", e)))?;

    let mut format = probed.format;
    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| LipSyncError::Input("no audio track found".to_string()))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &Default::default())
        .map_err(|e| LipSyncError::Input(format!("failed to create decoder: {}", e)))?;

    let track_id = track.id;
    let sample_rate = track.codec_params.sample_rate.unwrap_or(44_100);
    let channels = track.codec_params.channels.unwrap_or_default().count();

    let mut pcm = Vec::new();
    while let Ok(packet) = format.next_packet() {
        if packet.track_id() != track_id {
            continue;
        }
        match decoder.decode(&packet) {
            Ok(decoded) => {
                let mut sample_buf =
                    SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec());
                sample_buf.copy_interleaved_ref(decoded);
                pcm.extend_from_slice(sample_buf.samples());
            }
            Err(e) => {
                warn!("Skipping undecodable packet: {}", e);
                continue;
            }
        }
    }

    Ok((downmix(pcm, channels.max(1)), sample_rate))
}

/// Average interleaved channels into mono.
fn downmix(pcm: Vec<f32>, channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return pcm;
    }
    pcm.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Resample mono samples from `src_rate` to `dst_rate` with a sinc resampler.
pub fn resample(input: &[f32], src_rate: u32, dst_rate: u32) -> Result<Vec<f32>> {
    if src_rate == dst_rate || input.is_empty() {
        return Ok(input.to_vec());
    }

    let ratio = dst_rate as f64 / src_rate as f64;
    let block_size = 1024;

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let mut resampler = SincFixedIn::<f32>::new(ratio, 1.0, params, block_size, 1)
        .map_err(|e| LipSyncError::Input(format!("failed to initialize resampler: {}", e)))?;

    let mut output = Vec::with_capacity((input.len() as f64 * ratio) as usize + block_size);

    let mut idx = 0;
    while idx < input.len() {
        let remaining = input.len() - idx;
        // The last block is zero-padded to keep the resampler's block size fixed.
        let chunk: Vec<f32> = if remaining < block_size {
            let mut padded = vec![0.0; block_size];
            padded[..remaining].copy_from_slice(&input[idx..]);
            padded
        } else {
            input[idx..idx + block_size].to_vec()
        };

        let frames = resampler
            .process(&[chunk], None)
            .map_err(|e| LipSyncError::Input(format!("resampling failed: {}", e)))?;
        output.extend_from_slice(&frames[0]);

        idx += block_size;
    }

    output.truncate((input.len() as f64 * ratio).round() as usize);
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::{WavSpec, WavWriter};
    use tempfile::tempdir;

    fn write_wav(path: &Path, samples: &[i16], sample_rate: u32) {
        let spec = WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(path, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn short_audio_is_rejected_at_the_boundary() {
        let dir = tempdir().unwrap();

        let short = dir.path().join("short.wav");
        write_wav(&short, &vec![0i16; 99], SAMPLE_RATE);
        match load_audio(&short, SAMPLE_RATE) {
            Err(LipSyncError::Input(msg)) => assert!(msg.contains("99")),
            other => panic!("expected Input error, got {:?}", other.map(|w| w.samples.len())),
        }

        let ok = dir.path().join("ok.wav");
        write_wav(&ok, &vec![0i16; 100], SAMPLE_RATE);
        let wave = load_audio(&ok, SAMPLE_RATE).unwrap();
        assert_eq!(wave.samples.len(), 100);
        assert_eq!(wave.sample_rate, SAMPLE_RATE);
    }

    #[test]
    fn stereo_wav_is_downmixed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stereo.wav");

        let spec = WavSpec {
            channels: 2,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(&path, spec).unwrap();
        for _ in 0..200 {
            writer.write_sample(16384i16).unwrap(); // left
            writer.write_sample(-16384i16).unwrap(); // right
        }
        writer.finalize().unwrap();

        let wave = load_audio(&path, SAMPLE_RATE).unwrap();
        assert_eq!(wave.samples.len(), 200);
        for &s in &wave.samples {
            assert!(s.abs() < 1e-4, "expected near-zero downmix, got {}", s);
        }
    }

    #[test]
    fn resample_changes_length_proportionally() {
        let input = vec![0.0f32; 48_000];
        let out = resample(&input, 48_000, 16_000).unwrap();
        let expected = 16_000;
        assert!(
            (out.len() as i64 - expected).abs() <= 32,
            "got {} samples, expected ~{}",
            out.len(),
            expected
        );
    }

    #[test]
    fn int16_samples_are_scaled_into_unit_range() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("loud.wav");
        write_wav(&path, &vec![i16::MAX; 150], SAMPLE_RATE);

        let wave = load_audio(&path, SAMPLE_RATE).unwrap();
        for &s in &wave.samples {
            assert!(s > 0.99 && s <= 1.0);
        }
    }
}
