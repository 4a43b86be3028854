//! Lip-sync pipeline: generates a talking-head video from a face input
//! (still image or video) and a speech audio track, driving an external
//! visual-speech model over mel-spectrogram windows.
//!
//! The heavy external pieces (face detector, model) sit behind traits so the
//! pipeline itself stays testable without them.

pub mod align;
pub mod audio;
pub mod batch;
pub mod config;
pub mod error;
pub mod face;
pub mod infer;
pub mod media;
pub mod scheduler;

use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::batch::BatchAssembler;
use crate::config::Settings;
use crate::error::{LipSyncError, Result};
use crate::face::{FaceDetector, FaceResult};
use crate::infer::{FrameWriter, InferenceOrchestrator, ModelProvider};
use crate::media::encode::EncodePipeline;
use crate::scheduler::{FilePair, JobId, PairRunner};

/// Diagnostic dump written when a frame yields no detectable face.
const FAULTY_FRAME: &str = "faulty_frame.png";

/// Directories the pipeline reads and writes.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub temp_dir: PathBuf,
    pub results_dir: PathBuf,
}

/// End-to-end pipeline over injected detector and model backends.
pub struct LipSync {
    workspace: Workspace,
    detector: Box<dyn FaceDetector + Send>,
    provider: Box<dyn ModelProvider + Send>,
}

impl LipSync {
    pub fn new(
        workspace: Workspace,
        detector: Box<dyn FaceDetector + Send>,
        provider: Box<dyn ModelProvider + Send>,
    ) -> Self {
        Self {
            workspace,
            detector,
            provider,
        }
    }

    /// Run the full pipeline for one face/audio pair and return the path of
    /// the produced video.
    pub fn process(
        &mut self,
        face_path: &Path,
        audio_path: &Path,
        checkpoint: &Path,
        output_filename: &str,
        settings: &Settings,
    ) -> Result<PathBuf> {
        info!(
            "Processing {} + {}",
            face_path.display(),
            audio_path.display()
        );
        let encode = EncodePipeline::new(&self.workspace.temp_dir)?;
        encode.clean_temp()?;

        // 1. Face input
        let (source, fps) = media::frames::load_face_source(face_path, settings)?;
        let static_input = source.is_static();

        // 2. Audio: extract, decode, mel
        let prepared_audio = encode.prepare_audio(audio_path)?;
        let waveform = audio::load_audio_16k(&prepared_audio)?;
        let extractor = audio::mel::MelExtractor::new(config::MelConfig::default())?;
        let mel = extractor.extract(&waveform.samples)?;
        info!(
            "Mel spectrogram: {} bins x {} frames for {:.2}s of audio",
            mel.num_mels(),
            mel.num_frames(),
            waveform.duration_seconds()
        );

        // 3. Timeline alignment
        let chunks = align::mel_chunks(&mel, fps)?;
        let frames = align::align_frames(source, chunks.len())?;

        // 4. Face localization
        let faces = self.localize(&frames, static_input, settings).map_err(|e| {
            self.persist_faulty_frame(&e);
            e
        })?;

        // 5. Batched inference into the raw intermediate
        let assembler = BatchAssembler::new(
            frames,
            chunks,
            faces,
            settings.img_size,
            settings.model_batch_size,
        );
        let mut orchestrator = InferenceOrchestrator::new(self.provider.as_ref(), checkpoint);

        let mut dims: Option<(u32, u32)> = None;
        let written = orchestrator.run(assembler, &mut |width, height| {
            dims = Some((width, height));
            let writer: Box<dyn FrameWriter> = Box::new(encode.open_frame_writer(width, height)?);
            Ok(writer)
        })?;
        let (width, height) = dims
            .ok_or_else(|| LipSyncError::Runtime("video writer could not be initialized".into()))?;
        let raw_spec = media::encode::RawVideoSpec {
            path: encode.raw_video_path(),
            width,
            height,
            frames: written,
        };

        // 6. Mux
        let output = self.workspace.results_dir.join(output_filename);
        encode.mux(&raw_spec, &prepared_audio, fps, &output)?;
        info!("Wrote {}", output.display());
        Ok(output)
    }

    fn localize(
        &mut self,
        frames: &[image::RgbImage],
        static_input: bool,
        settings: &Settings,
    ) -> Result<Vec<FaceResult>> {
        if let Some(region) = settings.fixed_box {
            return face::fixed_box_faces(frames, region);
        }
        let scope = if static_input { &frames[..1] } else { frames };
        face::locate_faces(
            self.detector.as_mut(),
            scope,
            settings.pads,
            settings.face_det_batch_size,
            !settings.nosmooth,
        )
    }

    fn persist_faulty_frame(&self, err: &LipSyncError) {
        if let LipSyncError::FaceNotFound { frame_index, frame } = err {
            let path = self.workspace.temp_dir.join(FAULTY_FRAME);
            match frame.save(&path) {
                Ok(()) => warn!(
                    "No face in frame {}, saved it to {}",
                    frame_index,
                    path.display()
                ),
                Err(e) => warn!("Could not save faulty frame: {}", e),
            }
        }
    }
}

impl PairRunner for LipSync {
    fn run_pair(
        &mut self,
        job_id: JobId,
        index: usize,
        pair: &FilePair,
        checkpoint: &Path,
        settings: &Settings,
    ) -> Result<PathBuf> {
        fs::create_dir_all(&self.workspace.results_dir)?;
        let name = scheduler::bulk_output_name(job_id, index);
        self.process(&pair.face_path, &pair.audio_path, checkpoint, &name, settings)
    }
}
