//! Retrieval Engine
//!
//! k-NN over catalog vectors with department scoping. Three strategies share
//! one scan primitive:
//!
//! - **Threshold escalation** walks a descending cutoff ladder until a rung
//!   yields enough candidates, then applies the user-facing floor.
//! - **Stability check** repeats the escalation and averages similarities to
//!   damp rank jitter near threshold boundaries.
//! - **Aggressive** skips thresholds entirely; diagnostic fallback only.

mod engine;

pub use engine::{RetrievalEngine, RetrievalOptions};

use serde::{Deserialize, Serialize};

use crate::catalog::Department;
use crate::embedding::Embedding;
use crate::error::Result;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Descending cutoff ladder tried in order
pub const THRESHOLD_LADDER: [f32; 7] = [0.50, 0.40, 0.30, 0.25, 0.20, 0.15, 0.10];

/// Last-resort retrieval floor when every rung comes up short
pub const THRESHOLD_FLOOR: f32 = 0.05;

// ============================================================================
// TYPES
// ============================================================================

/// How a search was executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMethod {
    /// Threshold-escalation search
    Thresholds,
    /// Escalation repeated with result averaging (default)
    #[default]
    Stability,
    /// Raw top-k with no cutoffs
    Aggressive,
}

impl std::fmt::Display for SearchMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SearchMethod::Thresholds => "thresholds",
            SearchMethod::Stability => "stability",
            SearchMethod::Aggressive => "aggressive",
        };
        write!(f, "{name}")
    }
}

/// One ranked result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub item_id: String,
    pub picture: String,
    pub url: String,
    pub product_name: String,
    pub department: Option<String>,
    /// Dot product against the query; cosine, both sides unit-norm
    pub similarity: f32,
    /// Fraction of stability passes the item appeared in (1.0 outside the
    /// stability method)
    pub stability: f32,
}

// ============================================================================
// SEARCHER TRAIT
// ============================================================================

/// The seam between the pipeline and a concrete retrieval implementation
///
/// Production uses [`RetrievalEngine`]; tests substitute canned responders.
pub trait Searcher: Send + Sync {
    /// Rank catalog items against a query vector
    fn search(
        &self,
        query: &Embedding,
        department: &Department,
        top_k: usize,
        method: SearchMethod,
    ) -> Result<Vec<SearchHit>>;
}

/// Post-retrieval score adjustment seam
///
/// Nothing in the core implements this; a deployment wanting brand or color
/// boosts plugs one in at pipeline construction.
pub trait Reranker: Send + Sync {
    /// Adjust similarities in place; implementations must preserve hit count
    fn rerank(&self, query: &Embedding, hits: &mut [SearchHit]);
}
