use anyhow::{Context, Result};
use clap::Parser;
use facefind::config::parse_threshold;
use facefind::{logging, spawn_engine, Config, Fetcher, Orchestrator, SearchClient};
use facefind_core::{FaceEncoder, OnnxEmbedder};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "facefind", about = "Find images of a face across the web")]
struct Cli {
    /// Reference image containing the face to search for
    image: PathBuf,
    /// Download every candidate without comparing faces
    #[arg(long)]
    no_verify: bool,
    /// Directory for downloaded images (overrides OUTPUT_DIR)
    #[arg(short, long)]
    output_dir: Option<PathBuf>,
    /// Maximum face distance counted as a match (overrides FACE_MATCH_THRESHOLD)
    #[arg(short, long, value_parser = parse_threshold)]
    threshold: Option<f32>,
    /// Number of candidates processed in parallel
    #[arg(short, long)]
    workers: Option<usize>,
    /// Print saved paths as a JSON array
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::from_env()?;
    if let Some(dir) = cli.output_dir {
        config.output_dir = dir;
    }
    if let Some(threshold) = cli.threshold {
        config.match_threshold = threshold;
    }
    if let Some(workers) = cli.workers {
        config.max_workers = workers.max(1);
    }

    let log = logging::init(config.log_file.as_deref()).context("failed to initialize logging")?;
    if let Some(path) = &config.dotenv_path {
        tracing::debug!(path = %path.display(), "loaded .env");
    }

    let result = run(&cli.image, !cli.no_verify, !cli.json, &config).await;
    log.finish(&result);
    let saved = result?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&saved)?);
    } else {
        println!(
            "Found {} matching images. Check {} directory.",
            saved.len(),
            config.output_dir.display()
        );
    }

    Ok(())
}

async fn run(image: &std::path::Path, verify_faces: bool, progress: bool, config: &Config) -> Result<Vec<PathBuf>> {
    let engine = if verify_faces {
        let embedder = OnnxEmbedder::load(&config.detector_model_path(), &config.recognizer_model_path())
            .context("failed to load face models")?;
        Some(spawn_engine(FaceEncoder::new(embedder, config.match_threshold))?)
    } else {
        tracing::info!("face verification disabled; downloading every candidate");
        None
    };

    let search = SearchClient::new(
        config.endpoint.clone(),
        config.api_key.clone(),
        Duration::from_secs(config.search_timeout_secs),
    )?;
    let fetcher = Fetcher::new(Duration::from_secs(config.fetch_timeout_secs))?;

    let orchestrator = Orchestrator::new(search, fetcher, engine, config.output_dir.clone(), config.max_workers)?
        .with_progress(progress);

    Ok(orchestrator.run(image, verify_faces).await?)
}
