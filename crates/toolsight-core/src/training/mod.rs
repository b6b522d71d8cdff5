//! Fine-tuning pipeline
//!
//! User verdicts become contrastive pairs; pairs fine-tune the CLIP encoder
//! end-to-end through a learned similarity head; the resulting weights go
//! through backup → register → promote → re-embed, in that order, so a
//! failure at any point leaves the previous model serving.

mod pairs;
mod trainer;

pub use pairs::{ContrastivePair, build_pairs, split_ordered};
pub use trainer::{ReembedMode, Trainer, TrainerDeps};

use serde::{Deserialize, Serialize};

// ============================================================================
// HYPERPARAMETERS
// ============================================================================

/// Knobs for one fine-tuning session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Self {
            epochs: 3,
            batch_size: 8,
            learning_rate: 1e-5,
            weight_decay: 0.01,
        }
    }
}

impl From<&crate::config::TrainingOptions> for Hyperparameters {
    fn from(options: &crate::config::TrainingOptions) -> Self {
        Self {
            epochs: options.epochs,
            batch_size: options.batch_size,
            learning_rate: options.learning_rate,
            weight_decay: options.weight_decay,
        }
    }
}

// ============================================================================
// OUTCOME
// ============================================================================

/// Result of a completed fine-tuning session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingOutcome {
    /// Version tag of the promoted artifact
    pub version: String,
    /// Feedback-store session row id
    pub session_id: i64,
    /// Examples consumed by the session
    pub examples_used: usize,
    /// Validation accuracy before the first epoch
    pub accuracy_before: Option<f64>,
    /// Validation accuracy after the last epoch
    pub accuracy_after: Option<f64>,
    /// Wall-clock training duration in seconds
    pub duration_seconds: i64,
    /// Catalog rows re-embedded under the new version
    pub reembedded: usize,
}
