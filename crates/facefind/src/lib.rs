//! facefind — find images of a face on the web.
//!
//! Uploads a reference photo to a visual search provider, fetches each
//! candidate once, keeps those whose first face is close enough to the
//! reference face, and writes them to `found_image_<index>.jpg`.

pub mod config;
pub mod engine;
pub mod fetcher;
pub mod logging;
pub mod orchestrator;
pub mod pipeline;
pub mod pool;
pub mod search;

pub use config::{Config, ConfigError};
pub use engine::{spawn_engine, EngineError, EngineHandle};
pub use fetcher::{FetchError, Fetcher, StorageError};
pub use orchestrator::{Orchestrator, RunError};
pub use pipeline::VerificationPipeline;
pub use search::{CandidateDescriptor, SearchClient, SearchError};
