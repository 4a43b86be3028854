//! Error types for the lip-sync library.

use image::RgbImage;
use thiserror::Error;

/// Errors produced by the lip-sync pipeline and scheduler.
///
/// Every variant is terminal for its scope: a pipeline error aborts the
/// current face/audio pair, and the bulk scheduler records it and moves on.
/// None of these conditions are transient, so nothing is retried.
#[derive(Debug, Error)]
pub enum LipSyncError {
    /// Bad or unusable input media (too-short audio, unreadable file, zero frames).
    #[error("invalid input: {0}")]
    Input(String),

    /// Corrupt audio features (non-finite values in the normalized spectrogram).
    #[error("corrupt audio features: {0}")]
    Data(String),

    /// No face found in a frame. Carries the offending frame so callers can
    /// persist it for diagnostics before propagating.
    #[error("no face detected in frame {frame_index}; ensure every frame contains a face or supply a fixed box")]
    FaceNotFound {
        frame_index: usize,
        frame: Box<RgbImage>,
    },

    /// The face detector cannot process even a single frame.
    #[error("face detector out of resources: {0}")]
    Resource(String),

    /// An external transcoder invocation exited non-zero.
    #[error("transcoder failed during {stage}: {stderr}")]
    Transcode { stage: String, stderr: String },

    /// Model loading or prediction failure.
    #[error("model error: {0}")]
    Model(String),

    /// Internal pipeline invariant violation.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for the lip-sync library.
pub type Result<T> = std::result::Result<T, LipSyncError>;
