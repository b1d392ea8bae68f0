//! Visual search client.
//!
//! Uploads the reference image and flattens every `VisualSearch` action of
//! the response into one ordered candidate list. Failures never escape
//! [`SearchClient::search`]: they are logged and yield no candidates.

use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

const SUBSCRIPTION_KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";
const VISUAL_SEARCH_ACTION: &str = "VisualSearch";

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("failed to read reference image {path}: {source}")]
    ReadImage {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("search request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("search provider returned {status}: {body}")]
    Status { status: reqwest::StatusCode, body: String },
    #[error("malformed search response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// A candidate image returned by the search provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateDescriptor {
    /// Position in the flattened search results, before any filtering.
    pub index: usize,
    pub content_url: String,
    pub name: Option<String>,
    pub host_page_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VisualSearchResponse {
    #[serde(default)]
    tags: Option<Vec<Tag>>,
}

#[derive(Debug, Deserialize)]
struct Tag {
    #[serde(default)]
    actions: Option<Vec<Action>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Action {
    #[serde(default)]
    action_type: Option<String>,
    #[serde(default)]
    data: Option<ActionData>,
}

#[derive(Debug, Deserialize)]
struct ActionData {
    #[serde(default)]
    value: Option<Vec<ImageResult>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageResult {
    #[serde(default)]
    content_url: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    host_page_url: Option<String>,
}

impl VisualSearchResponse {
    /// Flatten visual-search results in response order.
    ///
    /// Every result consumes an index; results without a `contentUrl` are
    /// skipped afterwards so indices stay tied to the provider's ordering.
    fn into_candidates(self) -> Vec<CandidateDescriptor> {
        self.tags
            .unwrap_or_default()
            .into_iter()
            .flat_map(|tag| tag.actions.unwrap_or_default())
            .filter(|action| action.action_type.as_deref() == Some(VISUAL_SEARCH_ACTION))
            .filter_map(|action| action.data)
            .flat_map(|data| data.value.unwrap_or_default())
            .enumerate()
            .filter_map(|(index, item)| {
                Some(CandidateDescriptor {
                    index,
                    content_url: item.content_url.filter(|u| !u.is_empty())?,
                    name: item.name,
                    host_page_url: item.host_page_url,
                })
            })
            .collect()
    }
}

/// Client for the visual search provider.
#[derive(Clone)]
pub struct SearchClient {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl SearchClient {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Result<Self, SearchError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        })
    }

    /// Search for images similar to the reference image. Never fails; any
    /// error is logged and produces an empty list.
    pub async fn search(&self, reference_path: &Path) -> Vec<CandidateDescriptor> {
        match self.try_search(reference_path).await {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::error!(error = %e, path = %reference_path.display(), "visual search failed");
                Vec::new()
            }
        }
    }

    async fn try_search(&self, reference_path: &Path) -> Result<Vec<CandidateDescriptor>, SearchError> {
        let image = tokio::fs::read(reference_path)
            .await
            .map_err(|source| SearchError::ReadImage {
                path: reference_path.display().to_string(),
                source,
            })?;

        let form = Form::new().part(
            "image",
            Part::bytes(image)
                .file_name("image")
                .mime_str("application/octet-stream")?,
        );

        tracing::debug!(endpoint = %self.endpoint, "uploading reference image");
        let response = self
            .client
            .post(&self.endpoint)
            .header(SUBSCRIPTION_KEY_HEADER, &self.api_key)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SearchError::Status { status, body });
        }

        let body = response.bytes().await?;
        let parsed: VisualSearchResponse = serde_json::from_slice(&body)?;
        if parsed.tags.is_none() {
            tracing::warn!("search response has no tags");
        }
        Ok(parsed.into_candidates())
    }
}
