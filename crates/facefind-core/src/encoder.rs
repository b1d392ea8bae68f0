//! Reference face extraction and candidate matching.
//!
//! [`FaceEncoder`] is the only piece the download pipeline talks to: it turns
//! reference image bytes into a [`ReferenceEncoding`] and decides whether a
//! candidate image shows the same person. The face model sits behind the
//! [`FaceEmbedder`] trait so the decision logic does not depend on ONNX.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::Embedding;
use image::RgbImage;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("no face detected in reference image")]
    NoFaceDetected,
    #[error("image decode failed: {0}")]
    ImageDecode(#[from] image::ImageError),
    #[error("failed to read image {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Produces the embedding of the first face found in an image.
pub trait FaceEmbedder {
    /// `Ok(None)` when the image contains no face.
    fn embed_first_face(&mut self, image: &RgbImage) -> Result<Option<Embedding>, EncoderError>;
}

/// SCRFD detection followed by ArcFace recognition of the top face.
pub struct OnnxEmbedder {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxEmbedder {
    pub fn new(detector: FaceDetector, recognizer: FaceRecognizer) -> Self {
        Self { detector, recognizer }
    }

    /// Load both models. Fails fast if either file is missing.
    pub fn load(detector_path: &str, recognizer_path: &str) -> Result<Self, EncoderError> {
        let detector = FaceDetector::load(detector_path)?;
        let recognizer = FaceRecognizer::load(recognizer_path)?;
        Ok(Self::new(detector, recognizer))
    }
}

impl FaceEmbedder for OnnxEmbedder {
    fn embed_first_face(&mut self, image: &RgbImage) -> Result<Option<Embedding>, EncoderError> {
        let faces = self.detector.detect(image)?;
        let Some(face) = faces.first() else {
            return Ok(None);
        };
        if faces.len() > 1 {
            tracing::debug!(faces = faces.len(), confidence = face.confidence, "multiple faces, using first");
        }
        Ok(Some(self.recognizer.extract(image, face)?))
    }
}

/// The reference face every candidate is compared against.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceEncoding(Embedding);

impl ReferenceEncoding {
    pub fn new(embedding: Embedding) -> Self {
        Self(embedding)
    }

    pub fn embedding(&self) -> &Embedding {
        &self.0
    }
}

/// Face encoder with a fixed match threshold.
pub struct FaceEncoder<E> {
    embedder: E,
    threshold: f32,
}

impl<E: FaceEmbedder> FaceEncoder<E> {
    /// `threshold` is the maximum euclidean distance still counted as a match.
    pub fn new(embedder: E, threshold: f32) -> Self {
        Self { embedder, threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Encode the first face of the reference image.
    pub fn extract_reference(&mut self, image_bytes: &[u8]) -> Result<ReferenceEncoding, EncoderError> {
        let image = decode_rgb(image_bytes)?;
        let embedding = self
            .embedder
            .embed_first_face(&image)?
            .ok_or(EncoderError::NoFaceDetected)?;
        tracing::info!(dims = embedding.len(), "reference face encoded");
        Ok(ReferenceEncoding(embedding))
    }

    /// Read and encode a reference image from disk.
    ///
    /// An unreadable file is an `Io` error, never `NoFaceDetected`.
    pub fn extract_reference_file(&mut self, path: &Path) -> Result<ReferenceEncoding, EncoderError> {
        let bytes = std::fs::read(path).map_err(|source| EncoderError::Io {
            path: path.display().to_string(),
            source,
        })?;
        self.extract_reference(&bytes)
    }

    /// Whether the first face in `candidate_bytes` is within the threshold of
    /// `reference`. An image without faces is a non-match, not an error.
    pub fn matches(&mut self, reference: &ReferenceEncoding, candidate_bytes: &[u8]) -> Result<bool, EncoderError> {
        let image = decode_rgb(candidate_bytes)?;
        let Some(candidate) = self.embedder.embed_first_face(&image)? else {
            tracing::debug!("candidate has no face");
            return Ok(false);
        };

        let distance = reference.embedding().distance(&candidate);
        let matched = distance <= self.threshold;
        tracing::debug!(
            distance,
            similarity = reference.embedding().similarity(&candidate),
            threshold = self.threshold,
            matched,
            "candidate compared"
        );
        Ok(matched)
    }
}

fn decode_rgb(bytes: &[u8]) -> Result<RgbImage, EncoderError> {
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}
