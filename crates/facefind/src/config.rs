use std::path::PathBuf;
use thiserror::Error;

pub const DEFAULT_ENDPOINT: &str = "https://api.bing.microsoft.com/v7.0/images/visualsearch";
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.1;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("BING_SEARCH_API_KEY not found in environment variables")]
    MissingApiKey,
}

/// Run configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Visual search subscription key.
    pub api_key: String,
    /// Visual search endpoint URL.
    pub endpoint: String,
    /// Maximum embedding distance still counted as the same face.
    pub match_threshold: f32,
    /// Directory matched images are written to.
    pub output_dir: PathBuf,
    /// Number of candidates processed concurrently.
    pub max_workers: usize,
    /// Timeout in seconds for a single candidate download.
    pub fetch_timeout_secs: u64,
    /// Timeout in seconds for the visual search upload.
    pub search_timeout_secs: u64,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Log file path; `None` disables file logging.
    pub log_file: Option<PathBuf>,
    /// `.env` file merged into the environment, if any.
    pub dotenv_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from the process environment, after merging a
    /// `.env` file from the working directory if one exists.
    ///
    /// Logging is not up yet at this point, so the loaded file is recorded in
    /// `dotenv_path` for the caller to report.
    pub fn from_env() -> Result<Self, ConfigError> {
        let dotenv_path = dotenvy::dotenv().ok();
        Ok(Self::from_lookup(|key| std::env::var(key).ok())?.loaded_from(dotenv_path))
    }

    /// Record the `.env` file the environment was merged from.
    pub fn loaded_from(self, dotenv_path: Option<PathBuf>) -> Self {
        Self { dotenv_path, ..self }
    }

    /// Build a config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key = lookup("BING_SEARCH_API_KEY")
            .filter(|k| !k.trim().is_empty())
            .ok_or(ConfigError::MissingApiKey)?;

        let log_file = match lookup("FACEFIND_LOG_FILE") {
            Some(v) if v.is_empty() => None,
            Some(v) => Some(PathBuf::from(v)),
            None => Some(PathBuf::from("image_finder.log")),
        };

        Ok(Self {
            api_key,
            endpoint: lookup("BING_SEARCH_ENDPOINT").unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            match_threshold: lookup("FACE_MATCH_THRESHOLD")
                .and_then(|v| parse_threshold(&v).ok())
                .unwrap_or(DEFAULT_MATCH_THRESHOLD),
            output_dir: lookup("OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./found_images")),
            max_workers: parsed(&lookup, "FACEFIND_MAX_WORKERS", 5usize).max(1),
            fetch_timeout_secs: parsed(&lookup, "FACEFIND_FETCH_TIMEOUT_SECS", 10),
            search_timeout_secs: parsed(&lookup, "FACEFIND_SEARCH_TIMEOUT_SECS", 30),
            model_dir: lookup("FACEFIND_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(facefind_core::default_model_dir),
            log_file,
            dotenv_path: None,
        })
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join(facefind_core::DETECTOR_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn recognizer_model_path(&self) -> String {
        self.model_dir
            .join(facefind_core::RECOGNIZER_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }
}

/// Parse a match threshold: a finite, non-negative distance.
pub fn parse_threshold(value: &str) -> Result<f32, String> {
    let threshold: f32 = value.trim().parse().map_err(|e| format!("invalid threshold {value:?}: {e}"))?;
    if !threshold.is_finite() || threshold < 0.0 {
        return Err(format!("threshold must be a finite, non-negative distance, got {value:?}"));
    }
    Ok(threshold)
}

fn parsed<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
