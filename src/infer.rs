//! Inference orchestration: drives the external model over batches and
//! reconstructs full-resolution frames from predicted crops.
//!
//! The model is loaded only once a first batch exists, so an empty batch
//! stream never incurs the load cost. It also never initializes the frame
//! writer, which is surfaced as a fatal runtime error.

use std::path::{Path, PathBuf};

use image::{imageops, imageops::FilterType, Rgb, RgbImage};
use log::info;
use ndarray::{Array3, Array4};

use crate::batch::ModelBatch;
use crate::error::{LipSyncError, Result};
use crate::face::FaceBox;

/// Loaded visual-speech model capability.
///
/// `predict` consumes one batch of (mel chunks, masked+unmasked crops) and
/// returns one predicted crop per element, pixel values in [0, 255].
pub trait LipSyncModel {
    fn predict(&mut self, mel: &Array4<f32>, faces: &Array4<f32>) -> Result<Vec<Array3<f32>>>;
}

/// Loads a [`LipSyncModel`] from a checkpoint reference.
///
/// A missing or incompatible checkpoint is a fatal load error.
pub trait ModelProvider {
    fn load(&self, checkpoint: &Path) -> Result<Box<dyn LipSyncModel>>;
}

/// Receives reconstructed frames in arrival order.
pub trait FrameWriter {
    fn write(&mut self, frame: &RgbImage) -> Result<()>;

    /// Called once after the last frame.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Convert a predicted `[h, w, 3]` crop in [0, 255] to an image.
fn crop_to_image(pred: &Array3<f32>) -> Result<RgbImage> {
    let shape = pred.shape();
    if shape.len() != 3 || shape[2] != 3 {
        return Err(LipSyncError::Model(format!(
            "unexpected prediction shape {:?}",
            shape
        )));
    }
    let (h, w) = (shape[0] as u32, shape[1] as u32);
    let mut img = RgbImage::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let px = Rgb([
                pred[[y as usize, x as usize, 0]].clamp(0.0, 255.0) as u8,
                pred[[y as usize, x as usize, 1]].clamp(0.0, 255.0) as u8,
                pred[[y as usize, x as usize, 2]].clamp(0.0, 255.0) as u8,
            ]);
            img.put_pixel(x, y, px);
        }
    }
    Ok(img)
}

/// Resize a predicted crop back to its source box and write it into the
/// frame, leaving every other pixel untouched.
fn paste_crop(frame: &mut RgbImage, crop: &RgbImage, coords: FaceBox) {
    let resized = imageops::resize(crop, coords.width(), coords.height(), FilterType::Triangle);
    for y in 0..coords.height() {
        for x in 0..coords.width() {
            frame.put_pixel(coords.x1 + x, coords.y1 + y, *resized.get_pixel(x, y));
        }
    }
}

/// Runs the model over a batch stream and emits reconstructed frames.
pub struct InferenceOrchestrator<'a> {
    provider: &'a dyn ModelProvider,
    checkpoint: PathBuf,
    model: Option<Box<dyn LipSyncModel>>,
}

impl<'a> InferenceOrchestrator<'a> {
    pub fn new(provider: &'a dyn ModelProvider, checkpoint: &Path) -> Self {
        Self {
            provider,
            checkpoint: checkpoint.to_path_buf(),
            model: None,
        }
    }

    /// Consume `batches`, writing reconstructed frames through the writer
    /// opened by `open_writer` (called once, with the output dimensions taken
    /// from the first frame). Returns the number of frames written.
    pub fn run<I>(
        &mut self,
        batches: I,
        open_writer: &mut dyn FnMut(u32, u32) -> Result<Box<dyn FrameWriter + 'a>>,
    ) -> Result<usize>
    where
        I: Iterator<Item = ModelBatch>,
    {
        let mut batches = batches.peekable();
        let Some(first) = batches.peek() else {
            return Err(LipSyncError::Runtime(
                "video writer could not be initialized".to_string(),
            ));
        };
        let first_frame = first
            .frames
            .first()
            .ok_or_else(|| LipSyncError::Runtime("empty batch in stream".to_string()))?;
        let (width, height) = first_frame.dimensions();

        let mut model = match self.model.take() {
            Some(model) => model,
            None => {
                info!("Loading model from {}", self.checkpoint.display());
                self.provider.load(&self.checkpoint)?
            }
        };
        let mut writer = open_writer(width, height)?;
        let mut written = 0usize;

        for batch in batches {
            let predictions = model.predict(&batch.mel, &batch.faces)?;
            if predictions.len() != batch.len() {
                return Err(LipSyncError::Model(format!(
                    "model returned {} crops for a batch of {}",
                    predictions.len(),
                    batch.len()
                )));
            }

            let ModelBatch {
                frames, coords, ..
            } = batch;
            for ((pred, mut frame), box_coords) in
                predictions.iter().zip(frames).zip(coords)
            {
                let crop = crop_to_image(pred)?;
                paste_crop(&mut frame, &crop, box_coords);
                writer.write(&frame)?;
                written += 1;
            }
        }

        writer.flush()?;
        self.model = Some(model);

        info!("Inference wrote {} frames", written);
        Ok(written)
    }
}
