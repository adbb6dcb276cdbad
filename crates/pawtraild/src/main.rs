use anyhow::{Context, Result};
use pawtrail_core::detector::PetFaceDetector;
use pawtrail_core::embedder::ClipEmbedder;
use pawtrail_core::session::SessionConfig;
use pawtrail_core::{Config, Engine};
use pawtrail_store::SqliteStore;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Fallback passphrase for development setups without PAWTRAIL_STORE_KEY.
const DEV_STORE_KEY: &str = "pawtrail-dev-key";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("pawtraild starting");

    let config = Config::from_env();

    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating data directory {}", parent.display()))?;
    }

    let passphrase = match &config.store_key {
        Some(key) => key.clone(),
        None => {
            tracing::warn!(
                "PAWTRAIL_STORE_KEY not set; falling back to the development key — \
                 enrolled embeddings are not protected"
            );
            DEV_STORE_KEY.to_string()
        }
    };

    let store = SqliteStore::open(&config.db_path, &passphrase)
        .with_context(|| format!("opening identity store {}", config.db_path.display()))?;

    let detector = PetFaceDetector::load(&config.detector_model_path())
        .context("loading pet face detection model")?;
    let embedder =
        ClipEmbedder::load(&config.embedder_model_path()).context("loading embedding model")?;

    let engine = Arc::new(
        Engine::new(
            Arc::new(detector),
            Arc::new(embedder),
            config.quality,
            Arc::new(store),
            SessionConfig {
                min_frames: config.min_frames,
                max_frames: config.max_frames,
                ttl: config.session_ttl(),
            },
            config.top_k,
        )
        .context("building identification engine")?,
    );

    tracing::info!(
        identities = engine.corpus_size(),
        min_frames = config.min_frames,
        session_ttl_secs = config.session_ttl_secs,
        "pawtraild ready"
    );

    // The HTTP transport mounts on `engine`; the daemon itself only
    // owns process lifecycle.
    tokio::signal::ctrl_c().await?;
    tracing::info!("pawtraild shutting down");

    Ok(())
}
