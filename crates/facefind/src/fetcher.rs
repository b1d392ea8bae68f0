use bytes::Bytes;
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned {status}")]
    Status { url: String, status: reqwest::StatusCode },
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Http { source, .. } if source.is_timeout())
    }
}

#[derive(Error, Debug)]
#[error("failed to write {path}: {source}")]
pub struct StorageError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// Deterministic file name for the candidate at `index`.
pub fn destination_for(output_dir: &Path, index: usize) -> PathBuf {
    output_dir.join(format!("found_image_{index}.jpg"))
}

/// Downloads candidate images and writes them to disk. No retries.
#[derive(Clone)]
pub struct Fetcher {
    client: Client,
}

impl Fetcher {
    /// Build a fetcher whose every request is bounded by `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    pub async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        let http = |source| FetchError::Http { url: url.to_string(), source };

        let response = self.client.get(url).send().await.map_err(http)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status { url: url.to_string(), status });
        }

        let body = response.bytes().await.map_err(http)?;
        tracing::trace!(url, bytes = body.len(), "fetched candidate");
        Ok(body)
    }

    /// Write `bytes` to `destination`, replacing any existing file.
    pub async fn save(&self, bytes: &[u8], destination: &Path) -> Result<PathBuf, StorageError> {
        tokio::fs::write(destination, bytes)
            .await
            .map_err(|source| StorageError { path: destination.to_path_buf(), source })?;
        Ok(destination.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetcher() -> Fetcher {
        Fetcher::new(Duration::from_millis(500)).unwrap()
    }

    #[test]
    fn test_destination_for() {
        assert_eq!(
            destination_for(Path::new("/out"), 7),
            PathBuf::from("/out/found_image_7.jpg")
        );
    }

    #[tokio::test]
    async fn test_fetch_ok_and_status_error() {
        let mut server = mockito::Server::new_async().await;
        let _ok = server.mock("GET", "/a.jpg").with_body("jpeg-bytes").create_async().await;
        let _missing = server.mock("GET", "/gone.jpg").with_status(404).create_async().await;

        let body = fetcher().fetch(&format!("{}/a.jpg", server.url())).await.unwrap();
        assert_eq!(&body[..], b"jpeg-bytes");

        let err = fetcher().fetch(&format!("{}/gone.jpg", server.url())).await.unwrap_err();
        assert!(matches!(err, FetchError::Status { status, .. } if status == reqwest::StatusCode::NOT_FOUND));
    }

    #[tokio::test]
    async fn test_fetch_times_out() {
        // Accepts connections via the backlog but never answers.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/slow.jpg", listener.local_addr().unwrap());

        let err = Fetcher::new(Duration::from_millis(200)).unwrap().fetch(&url).await.unwrap_err();
        assert!(err.is_timeout(), "{err}");
        drop(listener);
    }

    #[tokio::test]
    async fn test_save_overwrites_same_path() {
        let dir = tempfile::tempdir().unwrap();
        let dest = destination_for(dir.path(), 3);

        let first = fetcher().save(b"first", &dest).await.unwrap();
        let second = fetcher().save(b"second", &dest).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(std::fs::read(&dest).unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_save_into_missing_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("missing").join("found_image_0.jpg");
        let err = fetcher().save(b"x", &dest).await.unwrap_err();
        assert_eq!(err.path, dest);
    }
}
