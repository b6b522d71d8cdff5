//! A verdict on a shown result becomes a stored training example

use toolsight_core::feedback::Verdict;
use toolsight_core::{
    CancellationToken, CorrectTarget, Department, ExampleFilter, FeedbackKind, ImageSource,
    SearchMethod, SearchRequest,
};
use toolsight_e2e_tests::{TestService, photo_with_red, seed_catalog};

async fn run_search(service: &TestService, fingerprint: &str) -> (String, Vec<(String, f32)>) {
    let path = photo_with_red(service.dir.path(), fingerprint, 0);
    let response = service
        .pipeline
        .handle(SearchRequest {
            user_id: 42,
            image: ImageSource::Path(path),
            photo_fingerprint: fingerprint.to_string(),
            department: Department::All,
            is_admin: true,
            method: SearchMethod::Stability,
            cancel: CancellationToken::new(),
        })
        .await
        .unwrap();
    let pairs = response
        .results
        .iter()
        .map(|hit| (hit.item_id.clone(), hit.similarity))
        .collect();
    (response.session_short_id, pairs)
}

fn verdict() -> Verdict<'static> {
    Verdict {
        user_id: 42,
        username: Some("master_ivan"),
        image_path: None,
    }
}

#[tokio::test]
async fn incorrect_verdict_round_trips_with_exact_fields() {
    let service = TestService::start();
    seed_catalog(&service.catalog, 40, 0.04);
    let aggregator = service.aggregator();

    let (short_id, results) = run_search(&service, "photo-rt").await;
    let (item_id, similarity) = results[2].clone();

    aggregator
        .mark_incorrect(&short_id, 2, &item_id, verdict())
        .unwrap();
    service.drain_writes().await;

    let examples = service
        .feedback
        .list_examples(&ExampleFilter {
            kind: Some(FeedbackKind::Incorrect),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(examples.len(), 1);
    let example = &examples[0];
    assert_eq!(example.target_item_id.as_deref(), Some(item_id.as_str()));
    assert_eq!(example.similarity_score, Some(similarity));
    assert_eq!(example.photo_fingerprint, "photo-rt");
    assert_eq!(example.user_id, 42);
    assert!(example.consumed_by_session.is_none());
}

#[tokio::test]
async fn correct_and_specify_flow() {
    let service = TestService::start();
    seed_catalog(&service.catalog, 40, 0.04);
    let aggregator = service.aggregator();

    let (short_id, results) = run_search(&service, "photo-cs").await;
    aggregator
        .mark_correct(&short_id, 0, &results[0].0, verdict())
        .unwrap();
    aggregator
        .specify_correct(
            &short_id,
            CorrectTarget::Item(results[1].0.clone()),
            verdict(),
        )
        .unwrap();
    service.drain_writes().await;

    let corrects = service
        .feedback
        .list_examples(&ExampleFilter {
            kind: Some(FeedbackKind::Correct),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(corrects.len(), 2);
}

#[tokio::test]
async fn verdict_after_session_eviction_is_orphaned_but_kept() {
    let service = TestService::start();
    seed_catalog(&service.catalog, 40, 0.04);
    let aggregator = service.aggregator();

    let (short_id, results) = run_search(&service, "photo-orphan").await;
    // The session evaporates (TTL in production, explicit here).
    service.sessions.remove(&short_id);

    aggregator
        .mark_incorrect(&short_id, 0, &results[0].0, verdict())
        .unwrap();
    service.drain_writes().await;

    let examples = service
        .feedback
        .list_examples(&ExampleFilter::default())
        .unwrap();
    assert_eq!(examples.len(), 1);
    // Orphans carry no engine score and a synthesized fingerprint.
    assert_eq!(examples[0].similarity_score, None);
    assert!(examples[0].photo_fingerprint.starts_with("orphan:"));
}

#[tokio::test]
async fn new_item_report_lands_in_both_tables() {
    let service = TestService::start();
    seed_catalog(&service.catalog, 40, 0.04);
    let aggregator = service.aggregator();

    let (short_id, _) = run_search(&service, "photo-new").await;
    aggregator
        .propose_new_item(
            &short_id,
            "Клеевой пистолет",
            Some("ИНСТРУМЕНТЫ"),
            Some("под стержни 11 мм"),
            verdict(),
        )
        .unwrap();
    service.drain_writes().await;

    assert_eq!(service.feedback.pending_annotations(10).unwrap().len(), 1);
    let stats = service.feedback.statistics().unwrap();
    assert_eq!(stats.new_item, 1);
}

#[tokio::test]
async fn retrain_hint_fires_on_balanced_backlog() {
    let service = TestService::start();
    seed_catalog(&service.catalog, 40, 0.04);
    let aggregator = service.aggregator();

    let (short_id, results) = run_search(&service, "photo-hint").await;
    for i in 0..30 {
        let kind_correct = i % 3 != 0;
        let (item, _) = &results[i % results.len()];
        if kind_correct {
            aggregator
                .mark_correct(&short_id, i % results.len(), item, verdict())
                .unwrap();
        } else {
            aggregator
                .mark_incorrect(&short_id, i % results.len(), item, verdict())
                .unwrap();
        }
    }
    service.drain_writes().await;

    let stats = aggregator.statistics().unwrap();
    assert_eq!(stats.unconsumed, 30);
    // Threshold is 50: balanced but not yet enough.
    assert!(!aggregator.should_retrain_hint(&stats));

    for _ in 0..25 {
        aggregator
            .mark_correct(&short_id, 0, &results[0].0, verdict())
            .unwrap();
    }
    service.drain_writes().await;
    let stats = aggregator.statistics().unwrap();
    assert!(aggregator.should_retrain_hint(&stats));
}
