use crate::engine::{EngineError, EngineHandle};
use crate::fetcher::{destination_for, Fetcher};
use crate::pipeline::VerificationPipeline;
use crate::pool;
use crate::search::{CandidateDescriptor, SearchClient};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunError {
    #[error("reference image: {0}")]
    Reference(#[from] EngineError),
    #[error("face verification requested but no face engine is loaded")]
    NoEngine,
    #[error("failed to create output directory {path}: {source}")]
    OutputDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Top-level driver: search, verify and download in parallel.
pub struct Orchestrator {
    search: SearchClient,
    fetcher: Fetcher,
    pipeline: VerificationPipeline,
    engine: Option<EngineHandle>,
    output_dir: PathBuf,
    workers: usize,
    show_progress: bool,
}

impl Orchestrator {
    /// Build the orchestrator and create `output_dir` if it does not exist.
    pub fn new(
        search: SearchClient,
        fetcher: Fetcher,
        engine: Option<EngineHandle>,
        output_dir: impl Into<PathBuf>,
        workers: usize,
    ) -> Result<Self, RunError> {
        let output_dir = output_dir.into();
        std::fs::create_dir_all(&output_dir).map_err(|source| RunError::OutputDir {
            path: output_dir.display().to_string(),
            source,
        })?;

        Ok(Self {
            pipeline: VerificationPipeline::new(fetcher.clone(), engine.clone()),
            search,
            fetcher,
            engine,
            output_dir,
            workers: workers.max(1),
            show_progress: false,
        })
    }

    /// Draw a progress bar on stderr while candidates are processed.
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Find and download images of the reference face.
    ///
    /// Only reference-image problems abort the run; every per-candidate
    /// failure just drops that candidate. Paths come back in completion order.
    pub async fn run(&self, reference_path: &Path, verify_faces: bool) -> Result<Vec<PathBuf>, RunError> {
        tracing::info!(path = %reference_path.display(), verify_faces, "starting image search");

        let reference = if verify_faces {
            let engine = self.engine.as_ref().ok_or(RunError::NoEngine)?;
            Some(Arc::new(engine.extract_reference(reference_path.to_path_buf()).await?))
        } else {
            None
        };

        let candidates = self.search.search(reference_path).await;
        tracing::info!(count = candidates.len(), "found potential matches");

        let progress = self.progress_bar(candidates.len() as u64);
        let saved = pool::fan_out(
            candidates,
            self.workers,
            |candidate: CandidateDescriptor| {
                let pipeline = self.pipeline.clone();
                let fetcher = self.fetcher.clone();
                let reference = reference.clone();
                let destination = destination_for(&self.output_dir, candidate.index);
                async move {
                    let bytes = pipeline.evaluate(&candidate, reference.as_ref(), verify_faces).await?;
                    match fetcher.save(&bytes, &destination).await {
                        Ok(path) => Some(path),
                        Err(e) => {
                            tracing::warn!(index = candidate.index, error = %e, "error saving candidate");
                            None
                        }
                    }
                }
            },
            || progress.inc(1),
        )
        .await;
        progress.finish_and_clear();

        tracing::info!(count = saved.len(), dir = %self.output_dir.display(), "downloaded matching images");
        Ok(saved)
    }

    fn progress_bar(&self, len: u64) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(len).with_message("Downloading matches");
        if let Ok(style) = ProgressStyle::with_template("{msg}: {wide_bar} {pos}/{len} [{elapsed_precise}]") {
            bar.set_style(style);
        }
        bar
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{pixel_engine, png};
    use facefind_core::EncoderError;
    use std::time::Duration;

    struct Fixture {
        server: mockito::ServerGuard,
        dir: tempfile::TempDir,
        reference: tempfile::NamedTempFile,
    }

    impl Fixture {
        async fn new(reference_pixel: u8) -> Self {
            let server = mockito::Server::new_async().await;
            let dir = tempfile::tempdir().unwrap();
            let reference = tempfile::NamedTempFile::new().unwrap();
            std::fs::write(reference.path(), png(reference_pixel)).unwrap();
            Self { server, dir, reference }
        }

        fn out_dir(&self) -> PathBuf {
            self.dir.path().join("found_images")
        }

        async fn mock_search(&mut self, body: serde_json::Value) -> mockito::Mock {
            self.server
                .mock("POST", "/search")
                .with_header("content-type", "application/json")
                .with_body(body.to_string())
                .create_async()
                .await
        }

        fn orchestrator(&self, engine: Option<EngineHandle>) -> Orchestrator {
            let search = SearchClient::new(format!("{}/search", self.server.url()), "key", Duration::from_secs(5)).unwrap();
            let fetcher = Fetcher::new(Duration::from_millis(300)).unwrap();
            Orchestrator::new(search, fetcher, engine, self.out_dir(), 5).unwrap()
        }
    }

    fn visual_search(urls: &[String]) -> serde_json::Value {
        let values: Vec<_> = urls.iter().map(|u| serde_json::json!({ "contentUrl": u })).collect();
        serde_json::json!({ "tags": [{ "actions": [{ "actionType": "VisualSearch", "data": { "value": values } }] }] })
    }

    fn file_names(paths: &[PathBuf]) -> Vec<String> {
        let mut names: Vec<String> = paths
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_original_indices() {
        let mut fx = Fixture::new(50).await;
        let _a = fx.server.mock("GET", "/a.png").with_body(png(50)).create_async().await;
        let _c = fx.server.mock("GET", "/c.png").with_body(png(52)).create_async().await;

        // Never answers: the fetch times out.
        let stalled = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let urls = vec![
            format!("{}/a.png", fx.server.url()),
            format!("http://{}/b.png", stalled.local_addr().unwrap()),
            format!("{}/c.png", fx.server.url()),
        ];
        let _search = fx.mock_search(visual_search(&urls)).await;

        let saved = fx.orchestrator(Some(pixel_engine(0.1))).run(fx.reference.path(), true).await.unwrap();

        assert_eq!(file_names(&saved), vec!["found_image_0.jpg", "found_image_2.jpg"]);
        assert_eq!(std::fs::read(fx.out_dir().join("found_image_2.jpg")).unwrap(), png(52));
        assert!(!fx.out_dir().join("found_image_1.jpg").exists());
    }

    #[tokio::test]
    async fn test_non_matching_faces_are_not_downloaded() {
        let mut fx = Fixture::new(50).await;
        let _a = fx.server.mock("GET", "/a.png").with_body(png(90)).create_async().await;
        let _b = fx.server.mock("GET", "/b.png").with_body(png(0)).create_async().await;
        let _c = fx.server.mock("GET", "/c.png").with_body(png(48)).create_async().await;
        let urls: Vec<String> = ["a", "b", "c"].iter().map(|n| format!("{}/{n}.png", fx.server.url())).collect();
        let _search = fx.mock_search(visual_search(&urls)).await;

        let saved = fx.orchestrator(Some(pixel_engine(0.1))).run(fx.reference.path(), true).await.unwrap();
        assert_eq!(file_names(&saved), vec!["found_image_2.jpg"]);
    }

    #[tokio::test]
    async fn test_missing_tags_returns_empty() {
        let mut fx = Fixture::new(50).await;
        let _search = fx.mock_search(serde_json::json!({ "_type": "ImageKnowledge" })).await;

        let saved = fx.orchestrator(Some(pixel_engine(0.1))).run(fx.reference.path(), true).await.unwrap();
        assert!(saved.is_empty());
        assert!(fx.out_dir().is_dir());
    }

    #[tokio::test]
    async fn test_reference_without_face_aborts_before_search() {
        let mut fx = Fixture::new(0).await;
        let search = fx
            .server
            .mock("POST", "/search")
            .with_body(visual_search(&[]).to_string())
            .expect(0)
            .create_async()
            .await;

        let err = fx.orchestrator(Some(pixel_engine(0.1))).run(fx.reference.path(), true).await.unwrap_err();
        assert!(matches!(err, RunError::Reference(EngineError::Encoder(EncoderError::NoFaceDetected))));
        search.assert_async().await;
    }

    #[tokio::test]
    async fn test_without_verification_downloads_every_fetchable_candidate() {
        let mut fx = Fixture::new(0).await;
        let _a = fx.server.mock("GET", "/a.png").with_body(png(0)).create_async().await;
        let _b = fx.server.mock("GET", "/b.png").with_body("not even an image").create_async().await;
        let _c = fx.server.mock("GET", "/c.png").with_status(404).create_async().await;
        let urls: Vec<String> = ["a", "b", "c"].iter().map(|n| format!("{}/{n}.png", fx.server.url())).collect();
        let _search = fx.mock_search(visual_search(&urls)).await;

        let saved = fx.orchestrator(None).run(fx.reference.path(), false).await.unwrap();
        assert_eq!(file_names(&saved), vec!["found_image_0.jpg", "found_image_1.jpg"]);
    }

    #[tokio::test]
    async fn test_unreadable_reference_aborts_before_search() {
        let mut fx = Fixture::new(50).await;
        let search = fx
            .server
            .mock("POST", "/search")
            .with_body(visual_search(&[]).to_string())
            .expect(0)
            .create_async()
            .await;

        let missing = fx.dir.path().join("missing.jpg");
        let err = fx.orchestrator(Some(pixel_engine(0.1))).run(&missing, true).await.unwrap_err();
        assert!(matches!(err, RunError::Reference(EngineError::Encoder(EncoderError::Io { .. }))));
        search.assert_async().await;
    }

    #[tokio::test]
    async fn test_save_failure_drops_only_that_candidate() {
        let mut fx = Fixture::new(50).await;
        let _a = fx.server.mock("GET", "/a.png").with_body(png(50)).create_async().await;
        let _b = fx.server.mock("GET", "/b.png").with_body(png(51)).create_async().await;
        let _c = fx.server.mock("GET", "/c.png").with_body(png(49)).create_async().await;
        let urls: Vec<String> = ["a", "b", "c"].iter().map(|n| format!("{}/{n}.png", fx.server.url())).collect();
        let _search = fx.mock_search(visual_search(&urls)).await;

        let orchestrator = fx.orchestrator(Some(pixel_engine(0.1)));
        // A directory in the way makes writing candidate 1 fail.
        std::fs::create_dir(fx.out_dir().join("found_image_1.jpg")).unwrap();

        let saved = orchestrator.run(fx.reference.path(), true).await.unwrap();
        assert_eq!(file_names(&saved), vec!["found_image_0.jpg", "found_image_2.jpg"]);
        assert!(fx.out_dir().join("found_image_1.jpg").is_dir());
        assert_eq!(std::fs::read(fx.out_dir().join("found_image_2.jpg")).unwrap(), png(49));
    }

    #[tokio::test]
    async fn test_verification_without_engine_is_an_error() {
        let fx = Fixture::new(50).await;
        let err = fx.orchestrator(None).run(fx.reference.path(), true).await.unwrap_err();
        assert!(matches!(err, RunError::NoEngine));
    }

    #[test]
    fn test_output_dir_created_recursively() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let search = SearchClient::new("http://127.0.0.1:9/search", "key", Duration::from_secs(1)).unwrap();
        let fetcher = Fetcher::new(Duration::from_secs(1)).unwrap();
        let orchestrator = Orchestrator::new(search, fetcher, None, &nested, 0).unwrap();
        assert!(nested.is_dir());
        assert_eq!(orchestrator.workers, 1);
    }
}
