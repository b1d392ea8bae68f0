use bytes::Bytes;
use facefind_core::{EncoderError, FaceEmbedder, FaceEncoder, ReferenceEncoding};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Encoder(#[from] EncoderError),
    #[error("face engine panicked: {0}")]
    Panicked(String),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from pipeline workers to the engine thread.
enum EngineRequest {
    ExtractReference {
        path: PathBuf,
        reply: oneshot::Sender<Result<ReferenceEncoding, EngineError>>,
    },
    Match {
        reference: Arc<ReferenceEncoding>,
        image: Bytes,
        reply: oneshot::Sender<Result<bool, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Read a reference image from disk and encode its first face.
    pub async fn extract_reference(&self, path: PathBuf) -> Result<ReferenceEncoding, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::ExtractReference { path, reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Compare the first face of a candidate image against the reference.
    pub async fn matches(&self, reference: Arc<ReferenceEncoding>, image: Bytes) -> Result<bool, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Match { reference, image, reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Inference sessions need exclusive access, so every request is served in
/// arrival order by this one thread while callers await the reply. A panic
/// while serving a request fails that request only. The thread exits once
/// every handle has been dropped.
pub fn spawn_engine<E>(mut encoder: FaceEncoder<E>) -> Result<EngineHandle, EngineError>
where
    E: FaceEmbedder + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(16);

    std::thread::Builder::new()
        .name("facefind-engine".into())
        .spawn(move || {
            tracing::info!(threshold = encoder.threshold(), "engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::ExtractReference { path, reply } => {
                        let result = guarded("extract_reference", || encoder.extract_reference_file(&path));
                        let _ = reply.send(result);
                    }
                    EngineRequest::Match { reference, image, reply } => {
                        let result = guarded("match", || encoder.matches(&reference, &image));
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

/// Run one request, turning a panic into an error reply.
fn guarded<T>(request: &'static str, f: impl FnOnce() -> Result<T, EncoderError>) -> Result<T, EngineError> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => Ok(result?),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(request, panic = %message, "engine request panicked");
            Err(EngineError::Panicked(message))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use facefind_core::Embedding;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use tempfile::NamedTempFile;

    /// Top-left pixel 0 = no face, otherwise the embedding is `[pixel / 100]`.
    pub(crate) struct PixelEmbedder;

    impl FaceEmbedder for PixelEmbedder {
        fn embed_first_face(&mut self, image: &RgbImage) -> Result<Option<Embedding>, EncoderError> {
            let pixel = image.get_pixel(0, 0)[0];
            Ok((pixel != 0).then(|| Embedding::new(vec![pixel as f32 / 100.0])))
        }
    }

    /// Like [`PixelEmbedder`], but panics on pixel value 1.
    struct PanickyEmbedder;

    impl FaceEmbedder for PanickyEmbedder {
        fn embed_first_face(&mut self, image: &RgbImage) -> Result<Option<Embedding>, EncoderError> {
            if image.get_pixel(0, 0)[0] == 1 {
                panic!("inference blew up");
            }
            PixelEmbedder.embed_first_face(image)
        }
    }

    pub(crate) fn png(pixel: u8) -> Vec<u8> {
        let image = RgbImage::from_pixel(4, 4, Rgb([pixel, pixel, pixel]));
        let mut out = Cursor::new(Vec::new());
        image.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    pub(crate) fn png_file(pixel: u8) -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), png(pixel)).unwrap();
        file
    }

    pub(crate) fn pixel_engine(threshold: f32) -> EngineHandle {
        spawn_engine(FaceEncoder::new(PixelEmbedder, threshold)).unwrap()
    }

    pub(crate) async fn reference(engine: &EngineHandle, pixel: u8) -> Arc<ReferenceEncoding> {
        let file = png_file(pixel);
        Arc::new(engine.extract_reference(file.path().to_path_buf()).await.unwrap())
    }

    #[tokio::test]
    async fn test_extract_reference_roundtrip() {
        let engine = pixel_engine(0.1);
        let reference = reference(&engine, 40).await;
        assert_eq!(reference.embedding().values, vec![0.4]);
    }

    #[tokio::test]
    async fn test_extract_reference_no_face() {
        let engine = pixel_engine(0.1);
        let file = png_file(0);
        let err = engine.extract_reference(file.path().to_path_buf()).await.unwrap_err();
        assert!(matches!(err, EngineError::Encoder(EncoderError::NoFaceDetected)));
    }

    #[tokio::test]
    async fn test_extract_reference_unreadable_file() {
        let engine = pixel_engine(0.1);
        let err = engine
            .extract_reference(PathBuf::from("/nonexistent/reference.jpg"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Encoder(EncoderError::Io { .. })));
    }

    #[tokio::test]
    async fn test_matches_from_many_callers() {
        let engine = pixel_engine(0.1);
        let reference = reference(&engine, 50).await;

        let mut tasks = tokio::task::JoinSet::new();
        for pixel in [0u8, 45, 52, 90] {
            let engine = engine.clone();
            let reference = Arc::clone(&reference);
            tasks.spawn(async move { (pixel, engine.matches(reference, Bytes::from(png(pixel))).await.unwrap()) });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            results.push(joined.unwrap());
        }
        results.sort();
        assert_eq!(results, vec![(0, false), (45, true), (52, true), (90, false)]);
    }

    #[tokio::test]
    async fn test_panicking_request_does_not_stop_engine() {
        let engine = spawn_engine(FaceEncoder::new(PanickyEmbedder, 0.1)).unwrap();
        let reference = reference(&engine, 50).await;

        let err = engine
            .matches(Arc::clone(&reference), Bytes::from(png(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Panicked(ref msg) if msg.contains("inference blew up")));

        // The engine keeps serving the requests queued after the panic.
        assert!(engine.matches(Arc::clone(&reference), Bytes::from(png(50))).await.unwrap());
        assert!(!engine.matches(reference, Bytes::from(png(90))).await.unwrap());
    }
}
