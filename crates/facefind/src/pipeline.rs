use crate::engine::EngineHandle;
use crate::fetcher::Fetcher;
use crate::search::CandidateDescriptor;
use bytes::Bytes;
use facefind_core::ReferenceEncoding;
use std::sync::Arc;

/// Decides, per candidate, whether it should be downloaded.
///
/// The candidate is fetched exactly once; accepted bytes are returned to the
/// caller for persistence.
#[derive(Clone)]
pub struct VerificationPipeline {
    fetcher: Fetcher,
    engine: Option<EngineHandle>,
}

impl VerificationPipeline {
    pub fn new(fetcher: Fetcher, engine: Option<EngineHandle>) -> Self {
        Self { fetcher, engine }
    }

    /// Returns the candidate's bytes when it is accepted.
    ///
    /// Without `verify_faces`, a reference, or an engine, every fetchable
    /// candidate is accepted. Fetch, decode and engine failures reject the
    /// candidate and are only logged.
    pub async fn evaluate(
        &self,
        candidate: &CandidateDescriptor,
        reference: Option<&Arc<ReferenceEncoding>>,
        verify_faces: bool,
    ) -> Option<Bytes> {
        let url = candidate.content_url.as_str();
        let bytes = match self.fetcher.fetch(url).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(index = candidate.index, url, error = %e, timeout = e.is_timeout(), "error fetching candidate");
                return None;
            }
        };

        let (Some(engine), Some(reference), true) = (self.engine.as_ref(), reference, verify_faces) else {
            return Some(bytes);
        };

        match engine.matches(Arc::clone(reference), bytes.clone()).await {
            Ok(true) => {
                tracing::info!(index = candidate.index, url, "face match");
                Some(bytes)
            }
            Ok(false) => {
                tracing::debug!(index = candidate.index, url, "no face match");
                None
            }
            Err(e) => {
                tracing::warn!(index = candidate.index, url, error = %e, "error verifying candidate");
                None
            }
        }
    }
}
