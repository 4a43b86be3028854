//! Timeline alignment: spectrogram chunking and frame-count reconciliation.
//!
//! The audio timeline advances `80 / fps` mel columns per output video frame.
//! Chunking walks forward until the spectrogram is exhausted; the final chunk
//! is anchored to the spectrogram tail so trailing audio is never dropped.
//! The frame sequence is then resized to exactly match the chunk count.

use image::RgbImage;
use log::{debug, info};
use ndarray::Array2;

use crate::audio::mel::MelSpectrogram;
use crate::config::{MEL_FRAMES_PER_SECOND, MEL_STEP_SIZE};
use crate::error::{LipSyncError, Result};

/// A fixed-width slice of the mel spectrogram, `[mel_bins, MEL_STEP_SIZE]`.
#[derive(Debug, Clone)]
pub struct SpectrogramChunk {
    pub data: Array2<f32>,
    /// Column of the source spectrogram where this chunk starts.
    pub start_col: usize,
}

impl SpectrogramChunk {
    pub fn end_col(&self) -> usize {
        self.start_col + MEL_STEP_SIZE
    }
}

/// Source of face frames, decided once at run start.
#[derive(Debug, Clone)]
pub enum FrameSource {
    /// A single still image replicated for the duration of the audio.
    Static(RgbImage),
    /// Decoded video frames in presentation order.
    Video(Vec<RgbImage>),
}

impl FrameSource {
    pub fn is_static(&self) -> bool {
        matches!(self, FrameSource::Static(_))
    }
}

/// Slice the spectrogram into chunks at the frame-rate-derived stride.
///
/// The final chunk, when the stride would run past the end, is the last
/// `MEL_STEP_SIZE` columns instead of a short or zero-padded slice.
pub fn mel_chunks(mel: &MelSpectrogram, fps: f64) -> Result<Vec<SpectrogramChunk>> {
    if fps <= 0.0 {
        return Err(LipSyncError::Input(format!("invalid fps: {}", fps)));
    }
    let cols = mel.num_frames();
    if cols < MEL_STEP_SIZE {
        return Err(LipSyncError::Input(format!(
            "spectrogram too short for one chunk: {} columns, need {}",
            cols, MEL_STEP_SIZE
        )));
    }

    let stride = MEL_FRAMES_PER_SECOND / fps;
    let data = mel.data();
    let mut chunks = Vec::new();
    let mut i = 0usize;
    loop {
        let start = (i as f64 * stride) as usize;
        if start + MEL_STEP_SIZE > cols {
            let tail = cols - MEL_STEP_SIZE;
            chunks.push(SpectrogramChunk {
                data: data.slice(ndarray::s![.., tail..cols]).to_owned(),
                start_col: tail,
            });
            break;
        }
        chunks.push(SpectrogramChunk {
            data: data.slice(ndarray::s![.., start..start + MEL_STEP_SIZE]).to_owned(),
            start_col: start,
        });
        i += 1;
    }

    info!("Sliced {} mel chunks at stride {:.2}", chunks.len(), stride);
    Ok(chunks)
}

/// Resize the frame sequence to exactly `chunk_count` frames.
///
/// A static image is replicated; video is truncated, or cycled from the start
/// when it is shorter than the audio.
pub fn align_frames(source: FrameSource, chunk_count: usize) -> Result<Vec<RgbImage>> {
    debug_assert!(chunk_count >= 1);
    match source {
        FrameSource::Static(img) => Ok(vec![img; chunk_count]),
        FrameSource::Video(frames) => {
            if frames.is_empty() {
                return Err(LipSyncError::Input(
                    "no frames could be read from the input face file".to_string(),
                ));
            }
            if frames.len() >= chunk_count {
                debug!(
                    "Truncating {} video frames to {} chunks",
                    frames.len(),
                    chunk_count
                );
                Ok(frames.into_iter().take(chunk_count).collect())
            } else {
                debug!(
                    "Cycling {} video frames to cover {} chunks",
                    frames.len(),
                    chunk_count
                );
                let n = frames.len();
                Ok((0..chunk_count).map(|i| frames[i % n].clone()).collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::mel::MelSpectrogram;
    use ndarray::Array2;

    fn mel_with_cols(cols: usize) -> MelSpectrogram {
        // Column index encoded in every cell so slices are checkable.
        let data = Array2::from_shape_fn((80, cols), |(_, c)| c as f32);
        MelSpectrogram::from_array(data)
    }

    fn frame(v: u8) -> RgbImage {
        RgbImage::from_pixel(4, 4, image::Rgb([v, v, v]))
    }

    #[test]
    fn chunking_never_drops_trailing_audio() {
        let mel = mel_with_cols(100);
        let chunks = mel_chunks(&mel, 25.0).unwrap();

        // stride = 80/25 = 3.2; starts walk 0,3,6,... until 16 columns no longer fit.
        assert!(chunks.len() > 1);
        let last = chunks.last().unwrap();
        assert_eq!(last.end_col(), 100);
        assert_eq!(last.data[[0, MEL_STEP_SIZE - 1]], 99.0);

        for chunk in &chunks {
            assert_eq!(chunk.data.ncols(), MEL_STEP_SIZE);
            assert_eq!(chunk.data[[0, 0]], chunk.start_col as f32);
        }
    }

    #[test]
    fn walk_always_terminates_with_a_tail_chunk() {
        // A single-chunk-wide spectrogram: one full stride fits, then the
        // walk closes with the tail-anchored chunk covering the same columns.
        let mel = mel_with_cols(16);
        let chunks = mel_chunks(&mel, 25.0).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].start_col, 0);
        assert_eq!(chunks.last().unwrap().end_col(), 16);
    }

    #[test]
    fn too_narrow_spectrogram_is_an_input_error() {
        let mel = mel_with_cols(15);
        assert!(matches!(
            mel_chunks(&mel, 25.0),
            Err(LipSyncError::Input(_))
        ));
    }

    #[test]
    fn static_image_is_replicated_per_chunk() {
        let aligned = align_frames(FrameSource::Static(frame(7)), 12).unwrap();
        assert_eq!(aligned.len(), 12);
        for f in &aligned {
            assert_eq!(f.get_pixel(0, 0)[0], 7);
        }
    }

    #[test]
    fn long_video_is_truncated() {
        let frames: Vec<RgbImage> = (0..20).map(|i| frame(i as u8)).collect();
        let aligned = align_frames(FrameSource::Video(frames), 5).unwrap();
        assert_eq!(aligned.len(), 5);
        assert_eq!(aligned[4].get_pixel(0, 0)[0], 4);
    }

    #[test]
    fn short_video_cycles_from_the_start() {
        let frames: Vec<RgbImage> = (0..3).map(|i| frame(i as u8)).collect();
        let aligned = align_frames(FrameSource::Video(frames), 7).unwrap();
        assert_eq!(aligned.len(), 7);
        let values: Vec<u8> = aligned.iter().map(|f| f.get_pixel(0, 0)[0]).collect();
        assert_eq!(values, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn empty_video_is_an_input_error() {
        assert!(matches!(
            align_frames(FrameSource::Video(Vec::new()), 4),
            Err(LipSyncError::Input(_))
        ));
    }

    #[test]
    fn alignment_matches_chunk_count() {
        let mel = mel_with_cols(200);
        let chunks = mel_chunks(&mel, 25.0).unwrap();
        let frames: Vec<RgbImage> = (0..9999).map(|_| frame(0)).collect();
        let aligned = align_frames(FrameSource::Video(frames), chunks.len()).unwrap();
        assert_eq!(aligned.len(), chunks.len());
        assert!(!aligned.is_empty());
    }
}
