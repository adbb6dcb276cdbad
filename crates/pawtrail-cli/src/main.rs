use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pawtrail_core::detector::PetFaceDetector;
use pawtrail_core::embedder::ClipEmbedder;
use pawtrail_core::session::SessionConfig;
use pawtrail_core::{Config, Engine, EngineError, IdentityStore};
use pawtrail_store::SqliteStore;
use std::path::PathBuf;
use std::sync::Arc;

/// Fallback passphrase for development setups without PAWTRAIL_STORE_KEY.
const DEV_STORE_KEY: &str = "pawtrail-dev-key";

#[derive(Parser)]
#[command(name = "pawtrail", about = "Pawtrail pet identification CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a pet from a sequence of captured frames
    Enroll {
        /// Display name of the pet (e.g., "Fluffy")
        #[arg(short, long)]
        name: String,
        /// External identifier (e.g., a microchip or registry number)
        #[arg(short, long)]
        id: String,
        /// Captured frame images, in capture order
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Identify the pet in an image
    Search {
        image: PathBuf,
    },
    /// List enrolled identities
    List,
    /// Remove an enrolled identity
    Remove {
        identity_key: String,
    },
    /// Show configuration and store status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Commands::Enroll { name, id, images } => enroll(&config, &name, &id, &images).await,
        Commands::Search { image } => search(&config, &image).await,
        Commands::List => list(&config),
        Commands::Remove { identity_key } => remove(&config, &identity_key),
        Commands::Status => status(&config),
    }
}

fn passphrase(config: &Config) -> String {
    config
        .store_key
        .clone()
        .unwrap_or_else(|| DEV_STORE_KEY.to_string())
}

fn open_store(config: &Config) -> Result<SqliteStore> {
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating data directory {}", parent.display()))?;
    }
    SqliteStore::open(&config.db_path, &passphrase(config))
        .with_context(|| format!("opening identity store {}", config.db_path.display()))
}

/// Build a full engine: store, detection model, embedding model.
fn build_engine(config: &Config) -> Result<Arc<Engine>> {
    let store = open_store(config)?;
    let detector = PetFaceDetector::load(&config.detector_model_path())
        .context("loading pet face detection model")?;
    let embedder =
        ClipEmbedder::load(&config.embedder_model_path()).context("loading embedding model")?;

    let engine = Engine::new(
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
    .context("building identification engine")?;

    Ok(Arc::new(engine))
}

async fn enroll(config: &Config, name: &str, id: &str, images: &[PathBuf]) -> Result<()> {
    let engine = build_engine(config)?;
    let started = engine.start_enrollment(id, name)?;
    println!(
        "Session started for {} (key: {}), {} accepted frames required",
        name, started.identity_key, started.frames_required
    );

    for (i, path) in images.iter().enumerate() {
        let bytes =
            std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let outcome = engine.submit_frame(&started.token, &bytes).await?;

        if outcome.accepted {
            println!(
                "frame {}: accepted ({}/{})",
                i + 1,
                outcome.frames_so_far,
                outcome.frames_required
            );
        } else {
            let reason = outcome
                .reason
                .map(|r| serde_json::to_string(&r).unwrap_or_else(|_| "unknown".into()))
                .unwrap_or_else(|| "unknown".into());
            println!("frame {}: rejected — {reason}", i + 1);
        }

        if outcome.completed {
            break;
        }
    }

    // Idempotent if the minimum was reached mid-loop; otherwise this
    // surfaces InsufficientFrames with the exact progress counts.
    let record = engine.complete_enrollment(&started.token).await?;
    println!(
        "Enrolled {} as {} (version {})",
        record.display_name, record.identity_key, record.version
    );
    Ok(())
}

async fn search(config: &Config, image: &PathBuf) -> Result<()> {
    let engine = build_engine(config)?;
    let bytes = std::fs::read(image).with_context(|| format!("reading {}", image.display()))?;

    let timeout = config.search_timeout();
    let timeout_secs = config.search_timeout_secs;
    let task = tokio::task::spawn_blocking(move || engine.search_by_image(&bytes));

    // An elapsed timeout discards the in-flight result.
    let response = match tokio::time::timeout(timeout, task).await {
        Ok(joined) => joined.context("search task panicked")??,
        Err(_) => return Err(EngineError::ProcessingTimeout(timeout_secs).into()),
    };

    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

fn list(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let records = store.load_all()?;
    if records.is_empty() {
        println!("No identities enrolled");
        return Ok(());
    }
    for record in records {
        println!(
            "{}  {}  v{}  {}",
            record.identity_key,
            record.display_name,
            record.version,
            record.created_at.to_rfc3339()
        );
    }
    Ok(())
}

fn remove(config: &Config, identity_key: &str) -> Result<()> {
    let store = open_store(config)?;
    if store.remove(identity_key)? {
        println!("Removed {identity_key}");
        Ok(())
    } else {
        bail!("no identity with key {identity_key}");
    }
}

fn status(config: &Config) -> Result<()> {
    println!("db path:        {}", config.db_path.display());
    println!("model dir:      {}", config.model_dir.display());
    println!(
        "detector model: {} ({})",
        config.detector_model_path(),
        presence(&config.detector_model_path())
    );
    println!(
        "embedder model: {} ({})",
        config.embedder_model_path(),
        presence(&config.embedder_model_path())
    );
    println!("min frames:     {}", config.min_frames);
    println!("session ttl:    {}s", config.session_ttl_secs);

    match open_store(config) {
        Ok(store) => println!("identities:     {}", store.load_all()?.len()),
        Err(e) => println!("identities:     unavailable ({e})"),
    }
    Ok(())
}

fn presence(path: &str) -> &'static str {
    if std::path::Path::new(path).exists() {
        "present"
    } else {
        "missing"
    }
}
