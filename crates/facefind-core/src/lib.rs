//! facefind-core — Face detection, recognition and reference matching.
//!
//! Uses SCRFD for face detection and ArcFace for face embeddings, both
//! running via ONNX Runtime on the CPU. [`FaceEncoder`] turns raw image
//! bytes into a reference encoding and answers "same person?" for candidates.

pub mod alignment;
pub mod detector;
pub mod encoder;
pub mod recognizer;
pub mod types;

pub use detector::FaceDetector;
pub use encoder::{EncoderError, FaceEmbedder, FaceEncoder, OnnxEmbedder, ReferenceEncoding};
pub use recognizer::FaceRecognizer;
pub use types::{BoundingBox, Embedding};

use std::path::PathBuf;

/// File name of the SCRFD detection model inside the model directory.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
/// File name of the ArcFace recognition model inside the model directory.
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";

/// Default model directory: `$XDG_DATA_HOME/facefind/models`, falling back
/// to `~/.local/share/facefind/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facefind")
        .join("models")
}
