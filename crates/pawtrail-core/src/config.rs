use crate::quality::QualityConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Service configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Passphrase for at-rest embedding encryption.
    pub store_key: Option<String>,
    /// Minimum accepted frames before aggregation triggers.
    pub min_frames: usize,
    /// Hard cap on accepted frames per session.
    pub max_frames: usize,
    /// Enrollment session time-to-live in seconds.
    pub session_ttl_secs: u64,
    /// Number of ranked matches a search returns.
    pub top_k: usize,
    /// Timeout in seconds for a search operation.
    pub search_timeout_secs: u64,
    /// Acceptable quality ranges for enrollment frames.
    pub quality: QualityConfig,
}

impl Config {
    /// Load configuration from `PAWTRAIL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("PAWTRAIL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_data_dir().join("models"));

        let db_path = std::env::var("PAWTRAIL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_data_dir().join("identities.db"));

        let defaults = QualityConfig::default();

        Self {
            model_dir,
            db_path,
            store_key: std::env::var("PAWTRAIL_STORE_KEY").ok(),
            min_frames: env_usize("PAWTRAIL_MIN_FRAMES", 3),
            max_frames: env_usize("PAWTRAIL_MAX_FRAMES", 20),
            session_ttl_secs: env_u64("PAWTRAIL_SESSION_TTL_SECS", 600),
            top_k: env_usize("PAWTRAIL_TOP_K", 10),
            search_timeout_secs: env_u64("PAWTRAIL_SEARCH_TIMEOUT_SECS", 10),
            quality: QualityConfig {
                min_blur: env_f32("PAWTRAIL_MIN_BLUR", defaults.min_blur),
                brightness_min: env_f32("PAWTRAIL_BRIGHTNESS_MIN", defaults.brightness_min),
                brightness_max: env_f32("PAWTRAIL_BRIGHTNESS_MAX", defaults.brightness_max),
                min_contrast: env_f32("PAWTRAIL_MIN_CONTRAST", defaults.min_contrast),
            },
        }
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_secs(self.search_timeout_secs)
    }

    /// Path to the pet face detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join("petface_yolov8.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the embedding model.
    pub fn embedder_model_path(&self) -> String {
        self.model_dir
            .join("clip_vit_b32_visual.onnx")
            .to_string_lossy()
            .into_owned()
    }
}

/// Per-user data directory, `$XDG_DATA_HOME/pawtrail` or `~/.local/share/pawtrail`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("pawtrail")
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
