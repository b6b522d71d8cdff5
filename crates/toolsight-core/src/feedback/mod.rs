//! Feedback & Training Data
//!
//! User verdicts on search results become labeled training examples; new-item
//! reports become annotations awaiting admin approval. Everything is
//! append-mostly SQLite with a single async writer task in front of it, plus
//! the aggregator that resolves raw transport signals against search
//! sessions.

mod aggregator;
mod store;
mod writer;

pub use aggregator::{CorrectTarget, FeedbackAggregator, Verdict};
pub use store::FeedbackStore;
pub use writer::{FeedbackWriter, WriterHandle};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// FEEDBACK KIND
// ============================================================================

/// What the user said about a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackKind {
    /// The result matched the photographed item
    Correct,
    /// The result did not match
    Incorrect,
    /// The photographed item is not in the catalog at all
    NewItem,
}

impl FeedbackKind {
    /// Stable string form used in storage
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackKind::Correct => "correct",
            FeedbackKind::Incorrect => "incorrect",
            FeedbackKind::NewItem => "new_item",
        }
    }

    /// Parse the stored string form
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "correct" => Some(FeedbackKind::Correct),
            "incorrect" => Some(FeedbackKind::Incorrect),
            "new_item" => Some(FeedbackKind::NewItem),
            _ => None,
        }
    }
}

impl std::fmt::Display for FeedbackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// TRAINING EXAMPLE
// ============================================================================

/// A stored labeled example
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingExample {
    pub id: i64,
    /// Opaque transport photo handle
    pub photo_fingerprint: String,
    pub user_id: i64,
    pub username: Option<String>,
    pub feedback_kind: FeedbackKind,
    /// Target catalog item; `None` only for `new_item`
    pub target_item_id: Option<String>,
    /// Engine-reported similarity at verdict time; `None` for orphans
    pub similarity_score: Option<f32>,
    pub user_comment: Option<String>,
    /// Local copy of the photo, when the transport saved one
    pub image_path: Option<String>,
    /// Example quality, 1-5
    pub quality_rating: u8,
    pub created_at: DateTime<Utc>,
    /// Training session that consumed this example
    pub consumed_by_session: Option<i64>,
}

/// Insert payload for a training example
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewExample {
    pub photo_fingerprint: String,
    pub user_id: i64,
    pub username: Option<String>,
    pub feedback_kind: Option<FeedbackKind>,
    pub target_item_id: Option<String>,
    pub similarity_score: Option<f32>,
    pub user_comment: Option<String>,
    pub image_path: Option<String>,
    pub quality_rating: Option<u8>,
}

/// Query filter for stored examples
#[derive(Debug, Clone, Default)]
pub struct ExampleFilter {
    /// Restrict to one feedback kind
    pub kind: Option<FeedbackKind>,
    /// Only examples no session has consumed
    pub unconsumed_only: bool,
    /// Cap the result count
    pub limit: Option<usize>,
}

// ============================================================================
// NEW PRODUCT ANNOTATION
// ============================================================================

/// A user-reported item missing from the catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewProductAnnotation {
    pub id: i64,
    pub photo_fingerprint: String,
    pub user_id: i64,
    pub username: Option<String>,
    pub product_name: String,
    pub product_category: Option<String>,
    pub product_description: Option<String>,
    pub image_path: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Approval promotes the annotation into training-eligible data
    pub admin_approved: bool,
    pub admin_id: Option<i64>,
    pub approval_date: Option<DateTime<Utc>>,
    /// Set once an admin inserts the item into the catalog
    pub added_to_catalog: bool,
}

/// Insert payload for an annotation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewAnnotation {
    pub photo_fingerprint: String,
    pub user_id: i64,
    pub username: Option<String>,
    pub product_name: String,
    pub product_category: Option<String>,
    pub product_description: Option<String>,
    pub image_path: Option<String>,
}

// ============================================================================
// TRAINING SESSIONS & BACKUPS
// ============================================================================

/// A completed (or aborted) fine-tuning session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSessionRecord {
    pub id: i64,
    pub model_version: String,
    pub examples_count: usize,
    pub positive_examples: usize,
    pub negative_examples: usize,
    pub accuracy_before: Option<f64>,
    pub accuracy_after: Option<f64>,
    pub duration_seconds: i64,
    /// Hyperparameters as recorded JSON
    pub hyperparameters: serde_json::Value,
    pub started_at: DateTime<Utc>,
    /// At most one session is active at any instant
    pub is_active: bool,
    pub notes: Option<String>,
}

/// Insert payload for a session row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSessionRecord {
    pub model_version: String,
    pub examples_count: usize,
    pub positive_examples: usize,
    pub negative_examples: usize,
    pub accuracy_before: Option<f64>,
    pub accuracy_after: Option<f64>,
    pub duration_seconds: i64,
    pub hyperparameters: serde_json::Value,
    pub is_active: bool,
    pub notes: Option<String>,
}

/// A recorded model backup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelBackupRecord {
    pub id: i64,
    /// Version tag of the backup artifact
    pub backup_version: String,
    /// Version the backup was taken from
    pub source_version: String,
    pub path: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Insert payload for a backup row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBackupRecord {
    pub backup_version: String,
    pub source_version: String,
    pub path: String,
    pub size_bytes: u64,
}

// ============================================================================
// STATS
// ============================================================================

/// Aggregated counters over the feedback log
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedbackStats {
    pub total_examples: usize,
    pub correct: usize,
    pub incorrect: usize,
    pub new_item: usize,
    pub unconsumed: usize,
    pub pending_annotations: usize,
    pub active_session_version: Option<String>,
}

// ============================================================================
// TESTS
// ============================================================================
