//! Fine-tuning sessions
//!
//! Lifecycle of a session, in order: snapshot the serving weights as a
//! backup, train, register the new artifact, write the session row, mark
//! examples consumed, re-embed the catalog with a fresh encoder instance,
//! promote, swap the live handle. Queries keep using the old encoder until
//! the catalog matches the new embedding space; a failure after the artifact
//! save leaves it on disk unpromoted and records a compensating session row.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Module, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use candle_transformers::models::clip::{ClipConfig, ClipModel};
use tracing::{error, info, warn};

use crate::catalog::CatalogStore;
use crate::embedding::{
    ClipEmbedder, ClipEmbedderConfig, EmbedderHandle, ImageFetcher, preprocess_image,
};
use crate::error::{Error, Result};
use crate::feedback::{
    ExampleFilter, FeedbackStore, NewBackupRecord, NewSessionRecord, TrainingExample, WriterHandle,
};
use crate::registry::{ArtifactOrigin, ModelArtifact, ModelRegistry};

use super::pairs::{ContrastivePair, build_pairs, split_ordered};
use super::{Hyperparameters, TrainingOutcome};

// ============================================================================
// DEPENDENCIES
// ============================================================================

/// Everything a trainer needs, injected at construction
pub struct TrainerDeps {
    pub feedback: Arc<FeedbackStore>,
    pub writer: WriterHandle,
    pub catalog: Arc<CatalogStore>,
    pub registry: Arc<ModelRegistry>,
    pub embedder: EmbedderHandle,
    pub fetcher: ImageFetcher,
    /// Weights file of the pretrained base; the snapshot source while no
    /// fine-tuned artifact has ever been promoted
    pub base_weights: PathBuf,
}

/// When the catalog is re-embedded relative to the training call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReembedMode {
    /// Re-embed inside `fine_tune` before the new model serves anything
    #[default]
    Blocking,
    /// Leave the artifact unactivated; an operator runs `activate` later,
    /// typically gated on the stale-vector counter
    Deferred,
}

// ============================================================================
// TRAINER
// ============================================================================

/// Runs fine-tuning sessions and manages the model backup lifecycle
pub struct Trainer {
    deps: TrainerDeps,
    reembed_mode: ReembedMode,
}

impl Trainer {
    /// Build a trainer over its dependencies
    pub fn new(deps: TrainerDeps, reembed_mode: ReembedMode) -> Self {
        Self { deps, reembed_mode }
    }

    // ========================================================================
    // FINE-TUNE
    // ========================================================================

    /// Run one fine-tuning session over the unconsumed feedback log
    pub async fn fine_tune(
        &self,
        min_examples: usize,
        hp: Hyperparameters,
    ) -> Result<TrainingOutcome> {
        let started = std::time::Instant::now();

        // Only examples whose local photo still exists can train.
        let all = self.deps.feedback.list_examples(&ExampleFilter {
            unconsumed_only: true,
            ..Default::default()
        })?;
        let usable: Vec<TrainingExample> = all
            .into_iter()
            .filter(|e| {
                e.image_path
                    .as_deref()
                    .map(|p| Path::new(p).is_file())
                    .unwrap_or(false)
            })
            .collect();
        if usable.len() < min_examples {
            return Err(Error::InsufficientData {
                available: usable.len(),
                needed: min_examples,
            });
        }

        let (train_examples, val_examples) = split_ordered(&usable);
        let train_pairs = build_pairs(&train_examples);
        let val_pairs = build_pairs(&val_examples);
        if train_pairs.is_empty() {
            return Err(Error::InsufficientData {
                available: 0,
                needed: 1,
            });
        }
        let positives = usable
            .iter()
            .filter(|e| e.feedback_kind == crate::feedback::FeedbackKind::Correct)
            .count();
        let negatives = usable
            .iter()
            .filter(|e| e.feedback_kind == crate::feedback::FeedbackKind::Incorrect)
            .count();

        info!(
            examples = usable.len(),
            train_pairs = train_pairs.len(),
            val_pairs = val_pairs.len(),
            "fine-tuning session starting"
        );

        // Snapshot the serving weights before anything can go wrong.
        let snapshot = self.snapshot_current().await?;

        let version = ModelRegistry::next_version("v");
        let scratch = std::env::temp_dir().join(format!("toolsight-train-{version}"));
        std::fs::create_dir_all(&scratch)?;
        let tuned_weights = scratch.join("model.safetensors");

        let session_weights = snapshot.source_weights.clone();
        let session_out = tuned_weights.clone();
        let session_hp = hp.clone();
        let session_train = train_pairs.clone();
        let session_val = val_pairs.clone();
        let trained = tokio::task::spawn_blocking(move || {
            run_session(
                &session_weights,
                &session_out,
                &session_train,
                &session_val,
                &session_hp,
            )
        })
        .await
        .map_err(|e| Error::Internal(format!("training task: {e}")))?;

        let metrics = match trained {
            Ok(metrics) => metrics,
            Err(e) => {
                // Training itself failed: the backup stays, the prior model
                // keeps serving, nothing to reconcile.
                let _ = std::fs::remove_dir_all(&scratch);
                return Err(e);
            }
        };

        let artifact = self
            .deps
            .registry
            .register(&tuned_weights, &version, ArtifactOrigin::FineTuned)?;
        let _ = std::fs::remove_dir_all(&scratch);

        // From here on the artifact exists; any failure is a partial
        // promotion that an operator has to reconcile.
        let outcome = self
            .finish_session(
                &artifact,
                &usable,
                positives,
                negatives,
                &metrics,
                &hp,
                started.elapsed().as_secs() as i64,
            )
            .await;

        match outcome {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                error!(version = %version, error = %e, "session failed after artifact save");
                let note = format!("artifact {version} saved but not promoted: {e}");
                let compensation = self
                    .deps
                    .writer
                    .session(NewSessionRecord {
                        model_version: version.clone(),
                        examples_count: usable.len(),
                        positive_examples: positives,
                        negative_examples: negatives,
                        accuracy_before: metrics.accuracy_before,
                        accuracy_after: metrics.accuracy_after,
                        duration_seconds: started.elapsed().as_secs() as i64,
                        hyperparameters: serde_json::to_value(&hp)?,
                        is_active: false,
                        notes: Some(note),
                    })
                    .await;
                if let Err(log_err) = compensation {
                    warn!(error = %log_err, "compensating session row could not be written");
                }
                Err(Error::PartialPromotion {
                    version,
                    reason: e.to_string(),
                })
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_session(
        &self,
        artifact: &ModelArtifact,
        examples: &[TrainingExample],
        positives: usize,
        negatives: usize,
        metrics: &SessionMetrics,
        hp: &Hyperparameters,
        duration_seconds: i64,
    ) -> Result<TrainingOutcome> {
        let session_id = self
            .deps
            .writer
            .session(NewSessionRecord {
                model_version: artifact.version.clone(),
                examples_count: examples.len(),
                positive_examples: positives,
                negative_examples: negatives,
                accuracy_before: metrics.accuracy_before,
                accuracy_after: metrics.accuracy_after,
                duration_seconds,
                hyperparameters: serde_json::to_value(hp)?,
                is_active: true,
                notes: None,
            })
            .await?;

        let ids: Vec<i64> = examples.iter().map(|e| e.id).collect();
        self.deps.writer.mark_consumed(ids, session_id).await?;

        let reembedded = match self.reembed_mode {
            ReembedMode::Blocking => self.activate(&artifact.version).await?,
            ReembedMode::Deferred => {
                info!(version = %artifact.version, "activation deferred to operator");
                0
            }
        };

        Ok(TrainingOutcome {
            version: artifact.version.clone(),
            session_id,
            examples_used: examples.len(),
            accuracy_before: metrics.accuracy_before,
            accuracy_after: metrics.accuracy_after,
            duration_seconds,
            reembedded,
        })
    }

    // ========================================================================
    // ACTIVATION
    // ========================================================================

    /// Re-embed the catalog under an artifact, then promote it and swap the
    /// live encoder handle
    ///
    /// The old encoder keeps serving queries until the catalog is fully in
    /// the new space, so query and catalog vectors never mix models.
    pub async fn activate(&self, version: &str) -> Result<usize> {
        let artifact = self.deps.registry.find(version)?;
        let config = ClipEmbedderConfig::for_artifact(&artifact.path, version);
        let encoder = tokio::task::spawn_blocking(move || ClipEmbedder::load(&config))
            .await
            .map_err(|e| Error::Internal(format!("encoder load task: {e}")))?
            .map_err(Error::from)?;
        let encoder: Arc<ClipEmbedder> = Arc::new(encoder);

        let report = self
            .deps
            .catalog
            .re_embed_all(encoder.as_ref(), &self.deps.fetcher)
            .await?;

        self.deps.registry.promote(version)?;
        self.deps.embedder.swap(encoder);
        info!(version, reembedded = report.updated, "model activated");
        Ok(report.updated)
    }

    // ========================================================================
    // BACKUPS
    // ========================================================================

    /// Registered backup artifacts, newest first
    pub fn list_backups(&self) -> Result<Vec<ModelArtifact>> {
        self.deps.registry.list(Some(ArtifactOrigin::Backup))
    }

    /// Manually snapshot the serving weights, returning the backup version
    pub async fn create_backup(&self) -> Result<String> {
        let snapshot = self.snapshot_current().await?;
        Ok(snapshot.backup_version)
    }

    /// Restore a backup: snapshot the current model first (restore is always
    /// reversible), swap to the restored weights, then re-embed
    pub async fn restore_backup(&self, version: &str) -> Result<usize> {
        let artifact = self.deps.registry.find(version)?;
        let snapshot = self.snapshot_current().await?;
        info!(
            restoring = version,
            snapshot = %snapshot.backup_version,
            "restoring model from backup"
        );

        let config = ClipEmbedderConfig::for_artifact(&artifact.path, version);
        let encoder = tokio::task::spawn_blocking(move || ClipEmbedder::load(&config))
            .await
            .map_err(|e| Error::Internal(format!("encoder load task: {e}")))?
            .map_err(Error::from)?;
        let encoder: Arc<ClipEmbedder> = Arc::new(encoder);

        self.deps.registry.promote(version)?;
        self.deps.embedder.swap(Arc::clone(&encoder) as Arc<dyn crate::embedding::ImageEncoder>);

        let report = self
            .deps
            .catalog
            .re_embed_all(encoder.as_ref(), &self.deps.fetcher)
            .await?;
        Ok(report.updated)
    }

    /// Keep the newest `keep` backups, dropping the rest
    pub async fn cleanup_backups(&self, keep: usize) -> Result<Vec<String>> {
        self.deps.registry.cleanup_backups(keep)
    }

    /// Snapshot the serving weights into the backup registry and log it
    async fn snapshot_current(&self) -> Result<Snapshot> {
        let source_version = self.deps.embedder.version();
        let source_weights = match self.deps.registry.active()? {
            Some(active) => active.path,
            None => self.deps.base_weights.clone(),
        };
        let backup_version = ModelRegistry::next_version("backup");
        let artifact =
            self.deps
                .registry
                .register(&source_weights, &backup_version, ArtifactOrigin::Backup)?;
        self.deps
            .writer
            .backup(NewBackupRecord {
                backup_version: backup_version.clone(),
                source_version,
                path: artifact.path.display().to_string(),
                size_bytes: artifact.size_bytes,
            })
            .await?;
        Ok(Snapshot {
            backup_version,
            source_weights,
        })
    }
}

struct Snapshot {
    backup_version: String,
    source_weights: PathBuf,
}

// ============================================================================
// TRAINING LOOP
// ============================================================================

#[derive(Debug, Clone)]
struct SessionMetrics {
    accuracy_before: Option<f64>,
    accuracy_after: Option<f64>,
}

/// The blocking candle training loop
///
/// The encoder is fine-tuned end-to-end; the similarity head is scaffolding
/// that only exists for the duration of the session, so the saved artifact
/// contains encoder weights alone.
fn run_session(
    weights: &Path,
    out_path: &Path,
    train: &[ContrastivePair],
    validation: &[ContrastivePair],
    hp: &Hyperparameters,
) -> Result<SessionMetrics> {
    let device = crate::embedding::default_device();
    let clip_config = ClipConfig::vit_base_patch32();

    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = ClipModel::new(vb, &clip_config)
        .map_err(|e| Error::Internal(format!("model build: {e}")))?;
    varmap
        .load(weights)
        .map_err(|e| Error::Internal(format!("weights load: {e}")))?;

    let head_map = VarMap::new();
    let head_vb = VarBuilder::from_varmap(&head_map, DType::F32, &device);
    let dim = clip_config.vision_config.projection_dim;
    let head = candle_nn::linear(dim * 2, 1, head_vb.pp("similarity_head"))
        .map_err(|e| Error::Internal(format!("head build: {e}")))?;

    let mut vars = varmap.all_vars();
    vars.extend(head_map.all_vars());
    let mut optimizer = AdamW::new(
        vars,
        ParamsAdamW {
            lr: hp.learning_rate,
            weight_decay: hp.weight_decay,
            ..Default::default()
        },
    )
    .map_err(|e| Error::Internal(format!("optimizer: {e}")))?;

    let batch_size = hp.batch_size.max(1);
    let accuracy_before = evaluate(&model, &head, validation, batch_size, &device)?;

    for epoch in 1..=hp.epochs {
        let mut epoch_loss = 0.0_f64;
        let mut batches = 0usize;
        for batch in train.chunks(batch_size) {
            let (left, right, labels) = batch_tensors(batch, &device)?;
            let logits = pair_logits(&model, &head, &left, &right)
                .map_err(|e| Error::Internal(format!("forward: {e}")))?;
            let loss = candle_nn::loss::binary_cross_entropy_with_logit(&logits, &labels)
                .map_err(|e| Error::Internal(format!("loss: {e}")))?;
            optimizer
                .backward_step(&loss)
                .map_err(|e| Error::Internal(format!("optimizer step: {e}")))?;
            epoch_loss += loss
                .to_vec0::<f32>()
                .map_err(|e| Error::Internal(format!("loss readback: {e}")))?
                as f64;
            batches += 1;
        }
        let val_accuracy = evaluate(&model, &head, validation, batch_size, &device)?;
        info!(
            epoch,
            epochs = hp.epochs,
            loss = epoch_loss / batches.max(1) as f64,
            accuracy = val_accuracy,
            "epoch finished"
        );
    }

    let accuracy_after = evaluate(&model, &head, validation, batch_size, &device)?;
    varmap
        .save(out_path)
        .map_err(|e| Error::Internal(format!("artifact save: {e}")))?;
    Ok(SessionMetrics {
        accuracy_before,
        accuracy_after,
    })
}

/// Load and preprocess a batch of pairs into stacked tensors
fn batch_tensors(
    pairs: &[ContrastivePair],
    device: &Device,
) -> Result<(Tensor, Tensor, Tensor)> {
    let mut lefts = Vec::with_capacity(pairs.len());
    let mut rights = Vec::with_capacity(pairs.len());
    let mut labels = Vec::with_capacity(pairs.len());
    for pair in pairs {
        lefts.push(load_pixels(&pair.first, device)?);
        rights.push(load_pixels(&pair.second, device)?);
        labels.push(pair.label);
    }
    let stack = |tensors: &[Tensor]| {
        Tensor::stack(tensors, 0).map_err(|e| Error::Internal(format!("batch stack: {e}")))
    };
    let labels = Tensor::from_vec(labels, (pairs.len(),), device)
        .map_err(|e| Error::Internal(format!("label tensor: {e}")))?;
    Ok((stack(&lefts)?, stack(&rights)?, labels))
}

fn load_pixels(path: &Path, device: &Device) -> Result<Tensor> {
    let img = image::open(path)
        .map_err(|e| Error::SourceUnreadable(format!("{}: {e}", path.display())))?;
    let prepared = preprocess_image(&img);
    crate::embedding::pixel_tensor(&prepared, device)
        .map_err(|e| Error::Internal(format!("pixel tensor: {e}")))
}

/// Similarity-head logits for a batch of embedded pairs
fn pair_logits(
    model: &ClipModel,
    head: &candle_nn::Linear,
    left: &Tensor,
    right: &Tensor,
) -> candle_core::Result<Tensor> {
    let a = normalize_rows(&model.get_image_features(left)?)?;
    let b = normalize_rows(&model.get_image_features(right)?)?;
    let prod = (&a * &b)?;
    let diff = (&a - &b)?.abs()?;
    let features = Tensor::cat(&[prod, diff], 1)?;
    head.forward(&features)?.squeeze(1)
}

fn normalize_rows(t: &Tensor) -> candle_core::Result<Tensor> {
    let norm = t.sqr()?.sum_keepdim(1)?.sqrt()?;
    t.broadcast_div(&norm)
}

/// Fraction of validation pairs classified correctly at the 0.5 cut
fn evaluate(
    model: &ClipModel,
    head: &candle_nn::Linear,
    pairs: &[ContrastivePair],
    batch_size: usize,
    device: &Device,
) -> Result<Option<f64>> {
    if pairs.is_empty() {
        return Ok(None);
    }
    let mut correct = 0usize;
    let mut total = 0usize;
    for batch in pairs.chunks(batch_size) {
        let (left, right, labels) = batch_tensors(batch, device)?;
        let logits = pair_logits(model, head, &left, &right)
            .map_err(|e| Error::Internal(format!("eval forward: {e}")))?;
        let probs = candle_nn::ops::sigmoid(&logits)
            .and_then(|t| t.to_vec1::<f32>())
            .map_err(|e| Error::Internal(format!("eval readback: {e}")))?;
        let truth = labels
            .to_vec1::<f32>()
            .map_err(|e| Error::Internal(format!("eval labels: {e}")))?;
        for (p, y) in probs.iter().zip(truth.iter()) {
            if (*p >= 0.5) == (*y >= 0.5) {
                correct += 1;
            }
            total += 1;
        }
    }
    Ok(Some(correct as f64 / total.max(1) as f64))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{Embedding, ImageEncoder};
    use crate::feedback::{FeedbackKind, FeedbackWriter, NewExample};

    struct StubEncoder;

    impl ImageEncoder for StubEncoder {
        fn embed_image(&self, _img: &image::DynamicImage) -> crate::embedding::Result<Embedding> {
            Ok(Embedding::new(vec![1.0, 0.0]))
        }
        fn embed_text(&self, _text: &str) -> crate::embedding::Result<Embedding> {
            Ok(Embedding::new(vec![0.0, 1.0]))
        }
        fn version(&self) -> &str {
            "stub-v1"
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        feedback: Arc<FeedbackStore>,
        writer: FeedbackWriter,
        trainer: Trainer,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let feedback = Arc::new(FeedbackStore::open(dir.path().join("feedback.db")).unwrap());
        let catalog = Arc::new(CatalogStore::open(dir.path().join("catalog.db")).unwrap());
        let registry = Arc::new(ModelRegistry::open(dir.path().join("models")).unwrap());
        let base_weights = dir.path().join("base.safetensors");
        std::fs::write(&base_weights, b"base weights").unwrap();
        let writer = FeedbackWriter::spawn(Arc::clone(&feedback));
        let trainer = Trainer::new(
            TrainerDeps {
                feedback: Arc::clone(&feedback),
                writer: writer.handle(),
                catalog,
                registry,
                embedder: EmbedderHandle::new(Arc::new(StubEncoder)),
                fetcher: ImageFetcher::default(),
                base_weights,
            },
            ReembedMode::Blocking,
        );
        Fixture {
            _dir: dir,
            feedback,
            writer,
            trainer,
        }
    }

    #[tokio::test]
    async fn test_insufficient_examples_rejected() {
        let fx = fixture();
        let err = fx
            .trainer
            .fine_tune(10, Hyperparameters::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientData {
                available: 0,
                needed: 10
            }
        ));
        fx.writer.shutdown();
    }

    #[tokio::test]
    async fn test_examples_without_readable_images_do_not_count() {
        let fx = fixture();
        for i in 0..15 {
            fx.feedback
                .add_example(&NewExample {
                    photo_fingerprint: format!("fp{i}"),
                    user_id: 1,
                    feedback_kind: Some(FeedbackKind::Correct),
                    target_item_id: Some("A".into()),
                    image_path: Some(format!("/nonexistent/{i}.jpg")),
                    ..Default::default()
                })
                .unwrap();
        }
        let err = fx
            .trainer
            .fine_tune(10, Hyperparameters::default())
            .await
            .unwrap_err();
        // 15 rows on disk, zero usable photos.
        assert!(matches!(err, Error::InsufficientData { available: 0, .. }));
        fx.writer.shutdown();
    }

    #[tokio::test]
    async fn test_snapshot_registers_backup_and_logs_it() {
        let fx = fixture();
        let backup_version = fx.trainer.create_backup().await.unwrap();
        assert!(backup_version.starts_with("backup_"));

        let backups = fx.trainer.list_backups().unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0].version, backup_version);

        let logged = fx.feedback.list_backups().unwrap();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].source_version, "stub-v1");
        fx.writer.shutdown();
    }

    #[tokio::test]
    async fn test_cleanup_backups_delegates_to_registry() {
        let fx = fixture();
        for _ in 0..3 {
            fx.trainer.create_backup().await.unwrap();
            // Version strings carry second precision; force distinct tags.
            tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        }
        let removed = fx.trainer.cleanup_backups(1).await.unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(fx.trainer.list_backups().unwrap().len(), 1);
        fx.writer.shutdown();
    }

    // Exercises the full candle loop; needs hub weights, run manually.
    #[tokio::test]
    #[ignore]
    async fn test_full_fine_tune_cycle() {
        let fx = fixture();
        let dir = tempfile::tempdir().unwrap();
        // Two tiny synthetic photos per class.
        for i in 0..12 {
            let path = dir.path().join(format!("{i}.png"));
            let img = image::RgbImage::from_pixel(64, 64, image::Rgb([(i * 20) as u8, 0, 0]));
            img.save(&path).unwrap();
            fx.feedback
                .add_example(&NewExample {
                    photo_fingerprint: format!("fp{i}"),
                    user_id: 1,
                    feedback_kind: Some(if i % 3 == 0 {
                        FeedbackKind::Incorrect
                    } else {
                        FeedbackKind::Correct
                    }),
                    target_item_id: Some("A".into()),
                    image_path: Some(path.display().to_string()),
                    ..Default::default()
                })
                .unwrap();
        }
        let outcome = fx
            .trainer
            .fine_tune(10, Hyperparameters {
                epochs: 1,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(outcome.version.starts_with("v_"));
        fx.writer.shutdown();
    }
}
