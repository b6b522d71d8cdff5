//! Request Pipeline
//!
//! Per-request state machine:
//!
//! ```text
//! Admitted → RateChecked → ImageFetched → Embedded → Retrieved → Rendered → Logged
//!            ↓ failure at any point → Errored(kind)
//! ```
//!
//! The encoder is the scarce resource: embedding calls are serialized through
//! a bounded worker pool, queueing beyond it is capped, and every stage runs
//! under its own budget inside a total wall-clock deadline. Cancellation is
//! checked at stage boundaries; spent work is discarded.

mod cancel;
mod rate_limit;

pub use cancel::CancellationToken;
pub use rate_limit::UserRateLimiter;

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lru::LruCache;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::catalog::Department;
use crate::config::AppConfig;
use crate::embedding::{EmbedderHandle, Embedding, ImageFetcher, ImageSource};
use crate::error::{Error, Result};
use crate::retrieval::{Reranker, SearchHit, SearchMethod, Searcher};
use crate::session::{SearchSession, SessionStore, short_id};

// ============================================================================
// REQUEST / RESPONSE
// ============================================================================

/// One incoming photo search
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub user_id: i64,
    /// Where the photo lives
    pub image: ImageSource,
    /// Opaque transport handle identifying the photo (drives the session id)
    pub photo_fingerprint: String,
    /// Department scope
    pub department: Department,
    /// Role comes from an external check; the pipeline only consumes it
    pub is_admin: bool,
    /// Retrieval strategy
    pub method: SearchMethod,
    /// Cooperative cancellation from the transport
    pub cancel: CancellationToken,
}

/// The answer handed back to the transport
#[derive(Debug, Clone)]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
    /// Session key for later feedback
    pub session_short_id: String,
}

// ============================================================================
// PIPELINE
// ============================================================================

/// Stage budgets and pool sizes
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub fetch_timeout: Duration,
    pub embed_timeout: Duration,
    pub retrieve_timeout: Duration,
    pub total_timeout: Duration,
    pub workers: usize,
    pub queue_ceiling: usize,
    pub top_k: usize,
}

impl PipelineConfig {
    /// Derive from the service config
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            fetch_timeout: Duration::from_secs(config.fetch_timeout_seconds),
            embed_timeout: Duration::from_secs(config.embed_timeout_seconds),
            retrieve_timeout: Duration::from_secs(config.retrieve_timeout_seconds),
            total_timeout: Duration::from_secs(config.request_timeout_seconds),
            workers: config.effective_workers(),
            queue_ceiling: config.queue_ceiling,
            top_k: config.top_n_results,
        }
    }
}

/// The concurrent search pipeline
pub struct SearchPipeline {
    encoder: EmbedderHandle,
    searcher: Arc<dyn Searcher>,
    reranker: Option<Arc<dyn Reranker>>,
    sessions: Arc<SessionStore>,
    limiter: UserRateLimiter,
    fetcher: ImageFetcher,
    /// Serializes encoder work across requests
    embed_slots: Arc<Semaphore>,
    /// Bounds admitted-but-waiting requests
    queue_slots: Arc<Semaphore>,
    /// Re-searches of the same photo (department switches, retries) skip the
    /// forward pass; keyed by fingerprint + encoder version
    query_cache: Mutex<LruCache<String, Embedding>>,
    config: PipelineConfig,
}

/// Query embeddings kept for repeat searches of the same photo
const QUERY_CACHE_SIZE: usize = 256;

impl SearchPipeline {
    /// Wire a pipeline from its collaborators
    pub fn new(
        encoder: EmbedderHandle,
        searcher: Arc<dyn Searcher>,
        sessions: Arc<SessionStore>,
        limiter: UserRateLimiter,
        config: PipelineConfig,
    ) -> Self {
        let fetcher = ImageFetcher::new(config.fetch_timeout);
        Self {
            encoder,
            searcher,
            reranker: None,
            sessions,
            limiter,
            fetcher,
            embed_slots: Arc::new(Semaphore::new(config.workers.max(1))),
            queue_slots: Arc::new(Semaphore::new(
                config.workers.max(1) + config.queue_ceiling,
            )),
            query_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(QUERY_CACHE_SIZE).expect("nonzero cache size"),
            )),
            config,
        }
    }

    /// Install a post-retrieval score adjuster
    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    /// Run one request through the full state machine
    pub async fn handle(&self, request: SearchRequest) -> Result<SearchResponse> {
        // Admission: rate check happens before any resource is consumed.
        self.limiter
            .admit_photo_search(request.user_id, request.is_admin)?;

        // Queue ceiling: beyond workers + backlog we shed load immediately.
        let _queue_permit = self
            .queue_slots
            .clone()
            .try_acquire_owned()
            .map_err(|_| Error::Overloaded)?;

        debug!(user_id = request.user_id, department = %request.department, "request admitted");

        let outcome = tokio::time::timeout(self.config.total_timeout, self.run(&request)).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                warn!(user_id = request.user_id, "request exceeded total budget");
                Err(Error::Timeout { stage: "total" })
            }
        }
    }

    async fn run(&self, request: &SearchRequest) -> Result<SearchResponse> {
        self.check_cancel(request)?;

        // Re-searches of the same photo under the same weights skip straight
        // to retrieval.
        let cache_key = format!("{}::{}", self.encoder.version(), request.photo_fingerprint);
        let cached = self
            .query_cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&cache_key)
            .cloned();

        let query = match cached {
            Some(query) => {
                debug!(user_id = request.user_id, "query embedding served from cache");
                query
            }
            None => {
                // ImageFetched
                let image = tokio::time::timeout(
                    self.config.fetch_timeout,
                    self.fetcher.load(&request.image),
                )
                .await
                .map_err(|_| Error::Timeout { stage: "fetch" })??;
                self.check_cancel(request)?;

                // Embedded: hold a worker slot only for the forward pass.
                let permit = self
                    .embed_slots
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::Internal("embed pool closed".into()))?;
                let encoder = self.encoder.current();
                let query = tokio::time::timeout(
                    self.config.embed_timeout,
                    tokio::task::spawn_blocking(move || {
                        let result = encoder.embed_image(&image);
                        drop(permit);
                        result
                    }),
                )
                .await
                .map_err(|_| Error::Timeout { stage: "embed" })?
                .map_err(|e| Error::Internal(format!("embed task: {e}")))??;

                self.query_cache
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .put(cache_key, query.clone());
                query
            }
        };
        self.check_cancel(request)?;

        // Retrieved
        let searcher = Arc::clone(&self.searcher);
        let department = request.department.clone();
        let method = request.method;
        let top_k = self.config.top_k;
        let query_for_search = query.clone();
        let mut hits = tokio::time::timeout(
            self.config.retrieve_timeout,
            tokio::task::spawn_blocking(move || {
                searcher.search(&query_for_search, &department, top_k, method)
            }),
        )
        .await
        .map_err(|_| Error::Timeout { stage: "retrieve" })?
        .map_err(|e| Error::Internal(format!("retrieve task: {e}")))??;
        self.check_cancel(request)?;

        // Rendered: optional score adjustment, then session registration.
        if let Some(reranker) = &self.reranker {
            reranker.rerank(&query, &mut hits);
            hits.sort_by(|a, b| {
                b.similarity
                    .partial_cmp(&a.similarity)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.item_id.cmp(&b.item_id))
            });
        }

        let session_short_id = short_id(&request.photo_fingerprint);
        self.sessions.insert(SearchSession {
            short_id: session_short_id.clone(),
            user_id: request.user_id,
            photo_fingerprint: request.photo_fingerprint.clone(),
            results: hits
                .iter()
                .map(|hit| (hit.item_id.clone(), hit.similarity))
                .collect(),
            search_method: request.method,
            department: request.department.clone(),
            created_at: chrono::Utc::now(),
        });

        // Logged
        info!(
            user_id = request.user_id,
            session = %session_short_id,
            results = hits.len(),
            method = %request.method,
            "search completed"
        );

        Ok(SearchResponse {
            results: hits,
            session_short_id,
        })
    }

    fn check_cancel(&self, request: &SearchRequest) -> Result<()> {
        if request.cancel.is_cancelled() {
            debug!(user_id = request.user_id, "request cancelled by transport");
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// The session store backing this pipeline
    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }
}

// ============================================================================
// TESTS
// ============================================================================
