//! Encode side of the pipeline: temp workspace management, audio extraction
//! to 16 kHz mono WAV, a raw rgb24 intermediate file, and the final mux.
//!
//! ffmpeg is invoked at most twice per run: once to extract audio from a
//! non-WAV input, once to mux the raw video with the audio track.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use image::RgbImage;
use log::{debug, info, warn};

use crate::config::SAMPLE_RATE;
use crate::error::{LipSyncError, Result};
use crate::infer::FrameWriter;

/// Filenames inside the temp directory.
const TEMP_AUDIO: &str = "temp_audio.wav";
const TEMP_RAW_VIDEO: &str = "result.rgb";

/// Owns the temp directory of a single pipeline run.
pub struct EncodePipeline {
    temp_dir: PathBuf,
}

impl EncodePipeline {
    pub fn new(temp_dir: &Path) -> Result<Self> {
        fs::create_dir_all(temp_dir)?;
        Ok(Self {
            temp_dir: temp_dir.to_path_buf(),
        })
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Remove every file and subdirectory left over from a previous run.
    pub fn clean_temp(&self) -> Result<()> {
        for entry in fs::read_dir(&self.temp_dir)? {
            let entry = entry?;
            let path = entry.path();
            let result = if entry.file_type()?.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            if let Err(e) = result {
                warn!("Could not remove {}: {}", path.display(), e);
            }
        }
        debug!("Cleaned temp directory {}", self.temp_dir.display());
        Ok(())
    }

    /// Make the audio input available as a 16 kHz mono PCM WAV in the temp
    /// directory. WAV inputs are copied as-is; everything else goes through
    /// ffmpeg.
    pub fn prepare_audio(&self, audio_path: &Path) -> Result<PathBuf> {
        let target = self.temp_dir.join(TEMP_AUDIO);
        let ext = audio_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        if ext == "wav" {
            fs::copy(audio_path, &target)?;
            return Ok(target);
        }

        info!("Extracting audio track from {}", audio_path.display());
        let output = Command::new("ffmpeg")
            .args(["-y", "-v", "error", "-i"])
            .arg(audio_path)
            .args([
                "-vn",
                "-acodec",
                "pcm_s16le",
                "-ar",
                &SAMPLE_RATE.to_string(),
                "-ac",
                "1",
            ])
            .arg(&target)
            .output()?;

        if !output.status.success() {
            return Err(LipSyncError::Transcode {
                stage: "audio extraction".to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(target)
    }

    /// Open the raw rgb24 intermediate writer for frames of `width`×`height`.
    pub fn open_frame_writer(&self, width: u32, height: u32) -> Result<RawVideoWriter> {
        RawVideoWriter::create(&self.raw_video_path(), width, height)
    }

    /// Location of the raw rgb24 intermediate inside the temp directory.
    pub fn raw_video_path(&self) -> PathBuf {
        self.temp_dir.join(TEMP_RAW_VIDEO)
    }

    /// Mux the raw intermediate with the prepared audio into `output`.
    pub fn mux(
        &self,
        raw: &RawVideoSpec,
        audio_wav: &Path,
        fps: f64,
        output: &Path,
    ) -> Result<()> {
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent)?;
        }

        info!(
            "Muxing {} frames at {:.2} fps into {}",
            raw.frames,
            fps,
            output.display()
        );
        let result = Command::new("ffmpeg")
            .args([
                "-y",
                "-v",
                "error",
                "-f",
                "rawvideo",
                "-pix_fmt",
                "rgb24",
                "-s",
                &format!("{}x{}", raw.width, raw.height),
                "-r",
                &format!("{:.4}", fps),
                "-i",
            ])
            .arg(&raw.path)
            .arg("-i")
            .arg(audio_wav)
            .args([
                "-c:v",
                "libx264",
                "-pix_fmt",
                "yuv420p",
                "-c:a",
                "aac",
                "-shortest",
            ])
            .arg(output)
            .output()?;

        if !result.status.success() {
            return Err(LipSyncError::Transcode {
                stage: "mux".to_string(),
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Dimensions and location of a finished raw intermediate.
#[derive(Debug, Clone)]
pub struct RawVideoSpec {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub frames: usize,
}

/// Appends rgb24 frames to a raw intermediate file.
pub struct RawVideoWriter {
    out: BufWriter<File>,
    path: PathBuf,
    width: u32,
    height: u32,
    frames: usize,
}

impl RawVideoWriter {
    pub fn create(path: &Path, width: u32, height: u32) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            out: BufWriter::new(file),
            path: path.to_path_buf(),
            width,
            height,
            frames: 0,
        })
    }

    /// Flush and return the spec needed by the mux step.
    pub fn finish(mut self) -> Result<RawVideoSpec> {
        self.out.flush()?;
        Ok(RawVideoSpec {
            path: self.path.clone(),
            width: self.width,
            height: self.height,
            frames: self.frames,
        })
    }
}

impl FrameWriter for RawVideoWriter {
    fn write(&mut self, frame: &RgbImage) -> Result<()> {
        if frame.dimensions() != (self.width, self.height) {
            return Err(LipSyncError::Runtime(format!(
                "frame size {}x{} does not match writer {}x{}",
                frame.width(),
                frame.height(),
                self.width,
                self.height
            )));
        }
        self.out.write_all(frame.as_raw())?;
        self.frames += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}
