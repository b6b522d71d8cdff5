//! Service configuration
//!
//! Defaults are pinned here; a TOML file can override any field and
//! `TOOLSIGHT_*` environment variables override the file. Paths default to
//! the platform data directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ============================================================================
// RATE LIMITS
// ============================================================================

/// A token-bucket shape: burst capacity of `tokens`, one token refilled
/// every `seconds` seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Burst capacity
    pub tokens: u32,
    /// Seconds per refilled token
    pub seconds: f64,
}

impl RateLimit {
    /// Tokens refilled per second
    pub fn refill_per_second(&self) -> f64 {
        if self.seconds > 0.0 { 1.0 / self.seconds } else { f64::INFINITY }
    }
}

// ============================================================================
// TRAINING CONFIG
// ============================================================================

/// Fine-tuning knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingOptions {
    /// Minimum unconsumed examples for the automatic retrain hint
    pub auto_min_examples: usize,
    /// Minimum unconsumed examples for an operator-triggered run
    pub manual_min_examples: usize,
    /// Fine-tune epochs
    pub epochs: usize,
    /// Mini-batch size in pairs
    pub batch_size: usize,
    /// AdamW learning rate
    pub learning_rate: f64,
    /// AdamW weight decay
    pub weight_decay: f64,
    /// Keep this many most-recent model backups
    pub backup_retention: usize,
}

impl Default for TrainingOptions {
    fn default() -> Self {
        Self {
            auto_min_examples: 50,
            manual_min_examples: 10,
            epochs: 3,
            batch_size: 8,
            learning_rate: 1e-5,
            weight_decay: 0.01,
            backup_retention: 10,
        }
    }
}

// ============================================================================
// APP CONFIG
// ============================================================================

/// Complete service configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Root data directory; relative store paths resolve against it
    pub data_dir: PathBuf,
    /// Catalog database file
    pub catalog_db: PathBuf,
    /// Feedback database file
    pub feedback_db: PathBuf,
    /// Model registry root
    pub models_dir: PathBuf,

    /// Lowest similarity reported to the user
    pub similarity_threshold: f32,
    /// Secondary filter applied when a ladder rung fills the result set
    pub secondary_filter_threshold: f32,
    /// Max results per search
    pub top_n_results: usize,
    /// Embedding dimensionality
    pub embedding_dim: usize,
    /// Repeats in the stability check
    pub stability_passes: usize,

    /// Photo-search bucket
    pub photo_rate_limit: RateLimit,
    /// General per-user bucket
    pub general_rate_limit: RateLimit,

    /// Total wall-clock budget per search, seconds
    pub request_timeout_seconds: u64,
    /// Image fetch budget, seconds
    pub fetch_timeout_seconds: u64,
    /// Embedding budget, seconds
    pub embed_timeout_seconds: u64,
    /// Retrieval budget, seconds
    pub retrieve_timeout_seconds: u64,

    /// Embed worker count; `None` derives `min(cpus + 4, 32)`
    pub worker_count: Option<usize>,
    /// Hard ceiling on queued requests beyond the workers
    pub queue_ceiling: usize,
    /// Search session lifetime, minutes
    pub session_ttl_minutes: u64,

    /// Fine-tuning knobs
    pub training: TrainingOptions,
}

impl Default for AppConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            catalog_db: data_dir.join("catalog.db"),
            feedback_db: data_dir.join("feedback.db"),
            models_dir: data_dir.join("models"),
            data_dir,
            similarity_threshold: 0.2,
            secondary_filter_threshold: 0.2,
            top_n_results: 5,
            embedding_dim: crate::embedding::EMBEDDING_DIM,
            stability_passes: 3,
            photo_rate_limit: RateLimit {
                tokens: 3,
                seconds: 10.0,
            },
            general_rate_limit: RateLimit {
                tokens: 5,
                seconds: 1.0,
            },
            request_timeout_seconds: 30,
            fetch_timeout_seconds: 15,
            embed_timeout_seconds: 10,
            retrieve_timeout_seconds: 5,
            worker_count: None,
            queue_ceiling: 64,
            session_ttl_minutes: 30,
            training: TrainingOptions::default(),
        }
    }
}

impl AppConfig {
    /// Load a config file if given, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .map_err(|e| Error::Config(format!("{}: {e}", p.display())))?;
                toml::from_str(&raw).map_err(|e| Error::Config(format!("{}: {e}", p.display())))?
            }
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Environment overrides for deployment-sensitive fields
    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("TOOLSIGHT_DATA_DIR") {
            let dir = PathBuf::from(dir);
            self.catalog_db = dir.join("catalog.db");
            self.feedback_db = dir.join("feedback.db");
            self.models_dir = dir.join("models");
            self.data_dir = dir;
        }
        if let Ok(v) = std::env::var("TOOLSIGHT_SIMILARITY_THRESHOLD") {
            if let Ok(parsed) = v.parse() {
                self.similarity_threshold = parsed;
            }
        }
        if let Ok(v) = std::env::var("TOOLSIGHT_TOP_N") {
            if let Ok(parsed) = v.parse() {
                self.top_n_results = parsed;
            }
        }
        if let Ok(v) = std::env::var("TOOLSIGHT_WORKERS") {
            if let Ok(parsed) = v.parse() {
                self.worker_count = Some(parsed);
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(Error::Config(format!(
                "similarity_threshold out of range: {}",
                self.similarity_threshold
            )));
        }
        if self.embedding_dim == 0 {
            return Err(Error::Config("embedding_dim must be positive".into()));
        }
        if self.stability_passes == 0 {
            return Err(Error::Config("stability_passes must be at least 1".into()));
        }
        Ok(())
    }

    /// Effective embed worker count
    pub fn effective_workers(&self) -> usize {
        self.worker_count.unwrap_or_else(|| {
            let cpus = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4);
            (cpus + 4).min(32)
        })
    }

    /// Session TTL as a duration
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_minutes * 60)
    }
}

fn default_data_dir() -> PathBuf {
    if let Some(dirs) = directories::ProjectDirs::from("com", "toolsight", "toolsight") {
        return dirs.data_dir().to_path_buf();
    }
    PathBuf::from("./toolsight-data")
}

// ============================================================================
// TESTS
// ============================================================================
