//! Per-frame face localization with batch-size backoff and temporal smoothing.
//!
//! The detector itself is an external capability behind [`FaceDetector`];
//! this module owns the recovery policy around it: batched detection with a
//! halving backoff on resource exhaustion (floor: batch size 1), four-sided
//! box padding clamped to frame bounds, and an optional trailing-window mean
//! over the box sequence to reduce jitter.

use image::{imageops, RgbImage};
use log::{info, warn};

use crate::config::{Pads, Region};
use crate::error::{LipSyncError, Result};

/// Raw detector output in source-frame coordinates, possibly out of bounds.
#[derive(Debug, Clone, Copy)]
pub struct RawBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

/// A padded, clamped face box in source-frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaceBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl FaceBox {
    pub fn width(&self) -> u32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> u32 {
        self.y2 - self.y1
    }

    fn is_degenerate(&self) -> bool {
        self.x2 <= self.x1 || self.y2 <= self.y1
    }
}

/// Errors surfaced by a face detection capability.
#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    /// The batch was too large for the detector's resources.
    #[error("detector resources exhausted: {0}")]
    ResourceExhausted(String),
    /// Any other detector failure.
    #[error("detection failed: {0}")]
    Failed(String),
}

/// External face detection capability.
///
/// Returns one nullable bounding box per input frame, in order. May fail with
/// [`DetectError::ResourceExhausted`] on oversized batches.
pub trait FaceDetector {
    fn detect(
        &mut self,
        frames: &[RgbImage],
    ) -> std::result::Result<Vec<Option<RawBox>>, DetectError>;
}

/// One cropped face region and its source-frame box.
#[derive(Debug, Clone)]
pub struct FaceResult {
    pub crop: RgbImage,
    pub coords: FaceBox,
}

/// Run detection over `frames` with a bounded halving backoff.
///
/// On resource exhaustion the batch size is halved and detection resumes from
/// the start of the failed batch, keeping results from earlier batches.
/// Exhaustion at batch size 1 is fatal: the frame is genuinely too large for
/// the detector.
fn detect_with_backoff(
    detector: &mut dyn FaceDetector,
    frames: &[RgbImage],
    start_batch_size: usize,
) -> Result<Vec<Option<RawBox>>> {
    let mut batch_size = start_batch_size.max(1);
    let mut predictions = Vec::with_capacity(frames.len());
    let mut pos = 0;

    while pos < frames.len() {
        let end = (pos + batch_size).min(frames.len());
        match detector.detect(&frames[pos..end]) {
            Ok(batch) => {
                predictions.extend(batch);
                pos = end;
            }
            Err(DetectError::ResourceExhausted(msg)) => {
                if batch_size == 1 {
                    return Err(LipSyncError::Resource(format!(
                        "frame too large for face detection: {}",
                        msg
                    )));
                }
                batch_size /= 2;
                warn!(
                    "Recovering from detector resource exhaustion; new batch size: {}",
                    batch_size
                );
            }
            Err(DetectError::Failed(msg)) => {
                return Err(LipSyncError::Model(format!("face detection failed: {}", msg)));
            }
        }
    }

    Ok(predictions)
}

/// Pad a raw detection and clamp it to the frame bounds.
fn pad_and_clamp(raw: RawBox, pads: Pads, width: u32, height: u32) -> FaceBox {
    let x1 = (raw.x1 - pads.left as i32).max(0) as u32;
    let y1 = (raw.y1 - pads.top as i32).max(0) as u32;
    let x2 = ((raw.x2 + pads.right as i32).max(0) as u32).min(width);
    let y2 = ((raw.y2 + pads.bottom as i32).max(0) as u32).min(height);
    FaceBox { x1, y1, x2, y2 }
}

/// Mean of each box with up to the next 4 boxes; the window shrinks at the
/// sequence tail. Reduces jitter, never eliminates it.
pub(crate) fn smooth_windows(boxes: &[[f32; 4]], window: usize) -> Vec<[f32; 4]> {
    let n = boxes.len();
    (0..n)
        .map(|i| {
            let end = (i + window).min(n);
            let len = (end - i) as f32;
            let mut acc = [0.0f32; 4];
            for b in &boxes[i..end] {
                for (a, v) in acc.iter_mut().zip(b) {
                    *a += v;
                }
            }
            acc.map(|v| v / len)
        })
        .collect()
}

const SMOOTH_WINDOW: usize = 5;

fn smooth_boxes(boxes: Vec<FaceBox>) -> Vec<FaceBox> {
    let raw: Vec<[f32; 4]> = boxes
        .iter()
        .map(|b| [b.x1 as f32, b.y1 as f32, b.x2 as f32, b.y2 as f32])
        .collect();
    smooth_windows(&raw, SMOOTH_WINDOW)
        .into_iter()
        .map(|b| FaceBox {
            x1: b[0].round() as u32,
            y1: b[1].round() as u32,
            x2: b[2].round() as u32,
            y2: b[3].round() as u32,
        })
        .collect()
}

fn crop_region(frame: &RgbImage, coords: FaceBox) -> RgbImage {
    imageops::crop_imm(frame, coords.x1, coords.y1, coords.width(), coords.height()).to_image()
}

/// Detect, pad, optionally smooth, and crop one face per frame.
///
/// A frame with no detection fails the run with [`LipSyncError::FaceNotFound`]
/// carrying the offending frame; callers should persist it for diagnostics
/// before propagating.
pub fn locate_faces(
    detector: &mut dyn FaceDetector,
    frames: &[RgbImage],
    pads: Pads,
    start_batch_size: usize,
    smooth: bool,
) -> Result<Vec<FaceResult>> {
    let predictions = detect_with_backoff(detector, frames, start_batch_size)?;

    let mut boxes = Vec::with_capacity(frames.len());
    for (index, (prediction, frame)) in predictions.iter().zip(frames).enumerate() {
        let Some(raw) = prediction else {
            return Err(LipSyncError::FaceNotFound {
                frame_index: index,
                frame: Box::new(frame.clone()),
            });
        };
        let coords = pad_and_clamp(*raw, pads, frame.width(), frame.height());
        if coords.is_degenerate() {
            return Err(LipSyncError::FaceNotFound {
                frame_index: index,
                frame: Box::new(frame.clone()),
            });
        }
        boxes.push(coords);
    }

    let boxes = if smooth { smooth_boxes(boxes) } else { boxes };

    info!("Located faces in {} frames", frames.len());
    Ok(boxes
        .into_iter()
        .zip(frames)
        .map(|(coords, frame)| FaceResult {
            crop: crop_region(frame, coords),
            coords,
        })
        .collect())
}

/// Apply a caller-supplied fixed box identically to every frame, bypassing
/// detection entirely.
pub fn fixed_box_faces(frames: &[RgbImage], region: Region) -> Result<Vec<FaceResult>> {
    info!("Using the specified bounding box instead of face detection");
    frames
        .iter()
        .map(|frame| {
            let coords = FaceBox {
                x1: region.x1.min(frame.width()),
                y1: region.y1.min(frame.height()),
                x2: region.x2.min(frame.width()),
                y2: region.y2.min(frame.height()),
            };
            if coords.is_degenerate() {
                return Err(LipSyncError::Input(format!(
                    "fixed box {:?} is empty within a {}x{} frame",
                    region,
                    frame.width(),
                    frame.height()
                )));
            }
            Ok(FaceResult {
                crop: crop_region(frame, coords),
                coords,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Detector that fails with resource exhaustion whenever the requested
    /// batch is larger than its capacity, recording every attempted size.
    struct FlakyDetector {
        capacity: usize,
        attempts: Vec<usize>,
    }

    impl FaceDetector for FlakyDetector {
        fn detect(
            &mut self,
            frames: &[RgbImage],
        ) -> std::result::Result<Vec<Option<RawBox>>, DetectError> {
            self.attempts.push(frames.len());
            if frames.len() > self.capacity {
                return Err(DetectError::ResourceExhausted("simulated".to_string()));
            }
            Ok(frames
                .iter()
                .map(|_| {
                    Some(RawBox {
                        x1: 10,
                        y1: 10,
                        x2: 40,
                        y2: 40,
                    })
                })
                .collect())
        }
    }

    fn frames(n: usize) -> Vec<RgbImage> {
        (0..n)
            .map(|_| RgbImage::from_pixel(64, 64, image::Rgb([128, 128, 128])))
            .collect()
    }

    #[test]
    fn backoff_halves_to_the_floor_and_gives_up() {
        let mut detector = FlakyDetector {
            capacity: 0, // nothing ever fits
            attempts: Vec::new(),
        };
        let err = detect_with_backoff(&mut detector, &frames(8), 8).unwrap_err();
        assert!(matches!(err, LipSyncError::Resource(_)));
        // 8 -> 4 -> 2 -> 1, then give up; never below 1.
        assert_eq!(detector.attempts, vec![8, 4, 2, 1]);
    }

    #[test]
    fn backoff_resumes_from_the_failed_batch() {
        let mut detector = FlakyDetector {
            capacity: 4,
            attempts: Vec::new(),
        };
        let predictions = detect_with_backoff(&mut detector, &frames(10), 8).unwrap();
        assert_eq!(predictions.len(), 10);
        // First batch of 8 fails, then 4+4+2 at the reduced size.
        assert_eq!(detector.attempts, vec![8, 4, 4, 2]);
    }

    #[test]
    fn missing_face_carries_the_offending_frame() {
        struct NoFace;
        impl FaceDetector for NoFace {
            fn detect(
                &mut self,
                frames: &[RgbImage],
            ) -> std::result::Result<Vec<Option<RawBox>>, DetectError> {
                let mut out: Vec<Option<RawBox>> = frames
                    .iter()
                    .map(|_| {
                        Some(RawBox {
                            x1: 0,
                            y1: 0,
                            x2: 8,
                            y2: 8,
                        })
                    })
                    .collect();
                if let Some(last) = out.last_mut() {
                    *last = None;
                }
                Ok(out)
            }
        }

        let mut detector = NoFace;
        let err =
            locate_faces(&mut detector, &frames(3), Pads::default(), 16, false).unwrap_err();
        match err {
            LipSyncError::FaceNotFound { frame_index, frame } => {
                assert_eq!(frame_index, 2);
                assert_eq!(frame.width(), 64);
            }
            other => panic!("expected FaceNotFound, got {:?}", other),
        }
    }

    #[test]
    fn padding_is_clamped_to_frame_bounds() {
        let pads = Pads {
            top: 20,
            bottom: 50,
            left: 20,
            right: 50,
        };
        let raw = RawBox {
            x1: 5,
            y1: 5,
            x2: 60,
            y2: 60,
        };
        let coords = pad_and_clamp(raw, pads, 64, 64);
        assert_eq!(coords, FaceBox { x1: 0, y1: 0, x2: 64, y2: 64 });
    }

    #[test]
    fn smoothing_shrinks_the_window_at_the_tail() {
        let boxes = vec![
            [0.0, 0.0, 10.0, 10.0],
            [10.0, 0.0, 20.0, 10.0],
            [20.0, 0.0, 30.0, 10.0],
        ];
        let smoothed = smooth_windows(&boxes, 5);
        // Last entry averages only itself.
        assert_eq!(smoothed[2], boxes[2]);
        // First entry averages all three.
        assert_eq!(smoothed[0][0], 10.0);
    }

    #[test]
    fn smoothing_is_not_idempotent_unless_constant() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..50 {
            let n = rng.gen_range(2..30);
            let boxes: Vec<[f32; 4]> = (0..n)
                .map(|_| {
                    let x1 = rng.gen_range(0.0..100.0);
                    let y1 = rng.gen_range(0.0..100.0);
                    [x1, y1, x1 + rng.gen_range(1.0..50.0), y1 + rng.gen_range(1.0..50.0)]
                })
                .collect();

            let once = smooth_windows(&boxes, 5);
            let twice = smooth_windows(&once, 5);

            let all_equal = boxes.windows(2).all(|w| w[0] == w[1]);
            if all_equal {
                assert_eq!(once, twice);
            } else {
                assert_ne!(once, twice, "re-smoothing should keep changing {:?}", boxes);
            }
        }

        // A constant sequence is a fixed point.
        let constant = vec![[5.0, 5.0, 15.0, 15.0]; 8];
        let once = smooth_windows(&constant, 5);
        assert_eq!(once, constant);
        assert_eq!(smooth_windows(&once, 5), once);
    }

    #[test]
    fn fixed_box_bypasses_detection() {
        let region = Region {
            x1: 8,
            y1: 8,
            x2: 24,
            y2: 32,
        };
        let results = fixed_box_faces(&frames(4), region).unwrap();
        assert_eq!(results.len(), 4);
        for r in &results {
            assert_eq!(r.coords, FaceBox { x1: 8, y1: 8, x2: 24, y2: 32 });
            assert_eq!(r.crop.dimensions(), (16, 24));
        }
    }
}
