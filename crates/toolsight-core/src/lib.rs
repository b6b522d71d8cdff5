//! # Toolsight Core
//!
//! Visual product retrieval for a hardware/tools catalog. A client uploads a
//! photo, optionally scopes the search to a department, and gets back ranked
//! visually similar catalog items with calibrated similarity scores. User
//! verdicts on those results feed a contrastive fine-tuning loop that
//! periodically improves the embedding model.
//!
//! ## Subsystems
//!
//! - **Embedding**: CLIP ViT-B/32 through candle; deterministic
//!   preprocessing, averaged forward passes, atomic weight swaps.
//! - **Catalog**: SQLite row store of products and their vectors, the
//!   authoritative embedding source.
//! - **Retrieval**: threshold-ladder k-NN with a stability pass and
//!   department scoping.
//! - **Feedback**: durable log of labeled examples behind a single-writer
//!   task, plus the aggregator resolving verdicts against search sessions.
//! - **Training**: contrastive fine-tuning with backup/promote/re-embed
//!   lifecycle management.
//! - **Registry**: on-disk model artifacts with checksummed sidecars and an
//!   atomically swapped active pointer.
//! - **Pipeline**: bounded-concurrency request state machine with rate
//!   limiting, per-stage timeouts, and cooperative cancellation.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use toolsight_core::prelude::*;
//!
//! let config = AppConfig::load(None)?;
//! let catalog = Arc::new(CatalogStore::open(&config.catalog_db)?);
//! let engine = Arc::new(RetrievalEngine::new(catalog.clone(), Default::default()));
//! let encoder = Arc::new(ClipEmbedder::load(&Default::default())?);
//! let pipeline = SearchPipeline::new(
//!     EmbedderHandle::new(encoder),
//!     engine,
//!     Arc::new(SessionStore::default()),
//!     UserRateLimiter::new(config.general_rate_limit, config.photo_rate_limit),
//!     PipelineConfig::from_app(&config),
//! );
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULES
// ============================================================================

pub mod catalog;
pub mod config;
pub mod embedding;
pub mod error;
pub mod feedback;
pub mod pipeline;
pub mod registry;
pub mod retrieval;
pub mod session;
pub mod training;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

pub use catalog::{CatalogStore, Department, Product, ReembedReport};
pub use config::{AppConfig, RateLimit, TrainingOptions};
pub use embedding::{
    ClipEmbedder, ClipEmbedderConfig, EmbedderHandle, Embedding, ImageEncoder, ImageFetcher,
    ImageSource, EMBEDDING_DIM,
};
pub use error::{Error, Result};
pub use feedback::{
    CorrectTarget, ExampleFilter, FeedbackAggregator, FeedbackKind, FeedbackStats, FeedbackStore,
    FeedbackWriter, NewExample, TrainingExample, Verdict, WriterHandle,
};
pub use pipeline::{
    CancellationToken, PipelineConfig, SearchPipeline, SearchRequest, SearchResponse,
    UserRateLimiter,
};
pub use registry::{ArtifactOrigin, ModelArtifact, ModelRegistry};
pub use retrieval::{
    Reranker, RetrievalEngine, RetrievalOptions, SearchHit, SearchMethod, Searcher,
};
pub use session::{SearchSession, SessionStore, short_id};
pub use training::{Hyperparameters, ReembedMode, Trainer, TrainerDeps, TrainingOutcome};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default embedding backbone
pub const DEFAULT_MODEL: &str = embedding::MODEL_REPO;

// ============================================================================
// PRELUDE
// ============================================================================

/// Convenient imports for common usage
pub mod prelude {
    pub use crate::{
        AppConfig, CancellationToken, CatalogStore, ClipEmbedder, ClipEmbedderConfig, Department,
        EmbedderHandle, Embedding, Error, FeedbackAggregator, FeedbackStore, FeedbackWriter,
        ImageEncoder, ImageSource, ModelRegistry, PipelineConfig, Product, Result,
        RetrievalEngine, SearchHit, SearchMethod, SearchPipeline, SearchRequest, SearchResponse,
        SessionStore, Trainer, TrainerDeps, UserRateLimiter,
    };
}
