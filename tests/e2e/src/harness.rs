//! Wired service fixture
//!
//! `TestService` assembles the same component graph production uses, with a
//! stub encoder standing in for CLIP.

use std::f32::consts::FRAC_PI_2;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use toolsight_core::{
    AppConfig, CatalogStore, EmbedderHandle, Embedding, FeedbackAggregator, FeedbackStore,
    FeedbackWriter, ImageEncoder, ModelRegistry, PipelineConfig, RetrievalEngine, SearchPipeline,
    SessionStore, UserRateLimiter,
};
use toolsight_core::RetrievalOptions;

use crate::fixtures::unit_at;

// ============================================================================
// STUB ENCODER
// ============================================================================

/// Encoder mapping a photo's first-pixel red channel onto the unit circle
pub struct RedChannelEncoder;

impl ImageEncoder for RedChannelEncoder {
    fn embed_image(
        &self,
        img: &image::DynamicImage,
    ) -> toolsight_core::embedding::Result<Embedding> {
        let rgb = img.to_rgb8();
        let red = rgb.get_pixel(0, 0).0[0] as f32;
        let angle = red / 255.0 * FRAC_PI_2;
        Ok(Embedding::new(unit_at(angle)))
    }

    fn embed_text(&self, text: &str) -> toolsight_core::embedding::Result<Embedding> {
        let angle = (text.len() % 16) as f32 * 0.1;
        Ok(Embedding::new(unit_at(angle)))
    }

    fn version(&self) -> &str {
        "stub-v1"
    }

    fn dimensions(&self) -> usize {
        crate::fixtures::TEST_DIM
    }
}

// ============================================================================
// SERVICE FIXTURE
// ============================================================================

/// A fully wired service over temporary storage
pub struct TestService {
    pub catalog: Arc<CatalogStore>,
    pub feedback: Arc<FeedbackStore>,
    pub registry: Arc<ModelRegistry>,
    pub sessions: Arc<SessionStore>,
    pub embedder: EmbedderHandle,
    pub writer: FeedbackWriter,
    pub pipeline: SearchPipeline,
    /// Kept last so stores close before the directory disappears
    pub dir: TempDir,
}

impl TestService {
    /// Assemble the component graph with default limits
    pub fn start() -> Self {
        Self::with_rate_limits(AppConfig::default())
    }

    /// Assemble with explicit config (rate limits, top_k, thresholds)
    pub fn with_rate_limits(config: AppConfig) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let catalog = Arc::new(CatalogStore::open(dir.path().join("catalog.db")).expect("catalog"));
        let feedback =
            Arc::new(FeedbackStore::open(dir.path().join("feedback.db")).expect("feedback"));
        let registry = Arc::new(ModelRegistry::open(dir.path().join("models")).expect("registry"));
        let sessions = Arc::new(SessionStore::new(Duration::from_secs(1800)));
        let embedder = EmbedderHandle::new(Arc::new(RedChannelEncoder));
        let writer = FeedbackWriter::spawn(Arc::clone(&feedback));

        let engine = Arc::new(RetrievalEngine::new(
            Arc::clone(&catalog),
            RetrievalOptions {
                user_floor: config.similarity_threshold,
                secondary_filter: config.secondary_filter_threshold,
                stability_passes: config.stability_passes,
            },
        ));
        let pipeline = SearchPipeline::new(
            embedder.clone(),
            engine,
            Arc::clone(&sessions),
            UserRateLimiter::new(config.general_rate_limit, config.photo_rate_limit),
            PipelineConfig::from_app(&config),
        );

        Self {
            dir,
            catalog,
            feedback,
            registry,
            sessions,
            embedder,
            writer,
            pipeline,
        }
    }

    /// Aggregator wired to this service's sessions and writer
    pub fn aggregator(&self) -> FeedbackAggregator {
        FeedbackAggregator::new(
            Arc::clone(&self.sessions),
            self.writer.handle(),
            Arc::clone(&self.feedback),
            50,
        )
    }

    /// Barrier: wait until every queued feedback write has been applied
    pub async fn drain_writes(&self) {
        self.writer
            .handle()
            .mark_consumed(vec![], 0)
            .await
            .expect("writer alive");
    }
}
