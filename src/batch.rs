//! Assembly of aligned (frame, face, chunk) triples into model-ready batches.
//!
//! Crops are resized to the model's square resolution and accumulated until a
//! batch fills; the trailing partial batch is finalized the same way. The
//! model input channel-concatenates a masked copy of each crop (lower half
//! zeroed) with the unmasked crop, scaled to [0, 1].

use image::{imageops, imageops::FilterType, RgbImage};
use ndarray::{Array4, Axis};

use crate::align::SpectrogramChunk;
use crate::face::{FaceBox, FaceResult};

/// One fixed-size (or trailing partial) model batch.
#[derive(Debug)]
pub struct ModelBatch {
    /// `[n, img_size, img_size, 6]`: channels 0..3 the masked crop, 3..6 the
    /// unmasked crop, both scaled to [0, 1].
    pub faces: Array4<f32>,
    /// `[n, mel_bins, chunk_width, 1]`.
    pub mel: Array4<f32>,
    /// Original full frames, in order.
    pub frames: Vec<RgbImage>,
    /// Face coordinates per element, for reconstruction.
    pub coords: Vec<FaceBox>,
}

impl ModelBatch {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Lazy, finite producer of [`ModelBatch`]es over aligned inputs.
///
/// Not resumable mid-stream: after a failure downstream, rebuild the
/// assembler to start over.
pub struct BatchAssembler {
    frames: Vec<RgbImage>,
    chunks: Vec<SpectrogramChunk>,
    faces: Vec<FaceResult>,
    img_size: u32,
    batch_size: usize,
    pos: usize,
}

impl BatchAssembler {
    /// `faces` holds either one entry per frame, or a single entry that is
    /// shared by every frame (static image input).
    pub fn new(
        frames: Vec<RgbImage>,
        chunks: Vec<SpectrogramChunk>,
        faces: Vec<FaceResult>,
        img_size: u32,
        batch_size: usize,
    ) -> Self {
        debug_assert_eq!(frames.len(), chunks.len());
        debug_assert!(faces.len() == frames.len() || faces.len() == 1);
        Self {
            frames,
            chunks,
            faces,
            img_size,
            batch_size: batch_size.max(1),
            pos: 0,
        }
    }

    fn face_index(&self, i: usize) -> usize {
        if self.faces.len() == 1 {
            0
        } else {
            i
        }
    }

    fn finalize(&self, range: std::ops::Range<usize>) -> ModelBatch {
        let n = range.len();
        let size = self.img_size as usize;
        let half = size / 2;
        let mel_bins = self.chunks[range.start].data.nrows();
        let chunk_width = self.chunks[range.start].data.ncols();

        let mut faces = Array4::<f32>::zeros((n, size, size, 6));
        let mut mel = Array4::<f32>::zeros((n, mel_bins, chunk_width, 1));
        let mut frames = Vec::with_capacity(n);
        let mut coords = Vec::with_capacity(n);

        for (slot, i) in range.enumerate() {
            let face = &self.faces[self.face_index(i)];
            let resized = imageops::resize(
                &face.crop,
                self.img_size,
                self.img_size,
                FilterType::Triangle,
            );

            for y in 0..size {
                for x in 0..size {
                    let px = resized.get_pixel(x as u32, y as u32);
                    for c in 0..3 {
                        let v = px[c] as f32 / 255.0;
                        // Masked copy: lower half zeroed.
                        faces[[slot, y, x, c]] = if y < half { v } else { 0.0 };
                        faces[[slot, y, x, c + 3]] = v;
                    }
                }
            }

            mel.index_axis_mut(Axis(0), slot)
                .index_axis_mut(Axis(2), 0)
                .assign(&self.chunks[i].data);

            frames.push(self.frames[i].clone());
            coords.push(face.coords);
        }

        ModelBatch {
            faces,
            mel,
            frames,
            coords,
        }
    }
}

impl Iterator for BatchAssembler {
    type Item = ModelBatch;

    fn next(&mut self) -> Option<ModelBatch> {
        if self.pos >= self.frames.len() {
            return None;
        }
        let end = (self.pos + self.batch_size).min(self.frames.len());
        let batch = self.finalize(self.pos..end);
        self.pos = end;
        Some(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn chunk() -> SpectrogramChunk {
        SpectrogramChunk {
            data: Array2::zeros((80, 16)),
            start_col: 0,
        }
    }

    fn face_result(fill: u8) -> FaceResult {
        FaceResult {
            crop: RgbImage::from_pixel(32, 24, image::Rgb([fill, fill, fill])),
            coords: FaceBox {
                x1: 4,
                y1: 4,
                x2: 36,
                y2: 28,
            },
        }
    }

    fn assembler(n: usize, batch_size: usize) -> BatchAssembler {
        let frames: Vec<RgbImage> = (0..n)
            .map(|_| RgbImage::from_pixel(64, 64, image::Rgb([0, 0, 0])))
            .collect();
        let chunks = (0..n).map(|_| chunk()).collect();
        let faces = (0..n).map(|_| face_result(255)).collect();
        BatchAssembler::new(frames, chunks, faces, 96, batch_size)
    }

    #[test]
    fn partial_final_batch_is_kept() {
        let sizes: Vec<usize> = assembler(130, 64).map(|b| b.len()).collect();
        assert_eq!(sizes, vec![64, 64, 2]);
    }

    #[test]
    fn exact_multiple_produces_no_empty_batch() {
        let sizes: Vec<usize> = assembler(128, 64).map(|b| b.len()).collect();
        assert_eq!(sizes, vec![64, 64]);
    }

    #[test]
    fn mask_zeroes_the_lower_half_only() {
        let batch = assembler(1, 8).next().unwrap();
        assert_eq!(batch.faces.shape(), &[1, 96, 96, 6]);

        for y in 0..96 {
            for c in 0..3 {
                let masked = batch.faces[[0, y, 48, c]];
                let unmasked = batch.faces[[0, y, 48, c + 3]];
                assert!((unmasked - 1.0).abs() < 1e-6);
                if y < 48 {
                    assert!((masked - 1.0).abs() < 1e-6);
                } else {
                    assert_eq!(masked, 0.0);
                }
            }
        }
    }

    #[test]
    fn mel_gains_a_channel_dimension() {
        let batch = assembler(3, 8).next().unwrap();
        assert_eq!(batch.mel.shape(), &[3, 80, 16, 1]);
    }

    #[test]
    fn static_input_shares_the_single_face() {
        let frames: Vec<RgbImage> = (0..5)
            .map(|_| RgbImage::from_pixel(64, 64, image::Rgb([0, 0, 0])))
            .collect();
        let chunks = (0..5).map(|_| chunk()).collect();
        let assembler = BatchAssembler::new(frames, chunks, vec![face_result(9)], 96, 64);
        let batch = assembler.into_iter().next().unwrap();
        assert_eq!(batch.len(), 5);
        for coords in &batch.coords {
            assert_eq!(coords.x1, 4);
        }
    }
}
