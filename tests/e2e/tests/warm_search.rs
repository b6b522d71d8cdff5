//! Warm search over a fully embedded catalog

use toolsight_core::{
    CancellationToken, Department, ImageSource, SearchMethod, SearchRequest,
};
use toolsight_e2e_tests::{TestService, photo_with_red, seed_catalog};

fn request(service: &TestService, red: u8, department: Department) -> SearchRequest {
    let path = photo_with_red(service.dir.path(), &format!("query-{red}"), red);
    SearchRequest {
        user_id: 1,
        image: ImageSource::Path(path),
        photo_fingerprint: format!("photo-{red}"),
        department,
        is_admin: false,
        method: SearchMethod::Stability,
        cancel: CancellationToken::new(),
    }
}

#[tokio::test]
async fn warm_search_returns_ranked_results() {
    let service = TestService::start();
    // 120 items fanned over the circle; the first few hug angle 0.
    seed_catalog(&service.catalog, 120, 0.02);

    let response = service
        .pipeline
        .handle(request(&service, 0, Department::All))
        .await
        .unwrap();

    assert_eq!(response.results.len(), 5);
    // Similarities strictly decreasing (distinct angles, no ties).
    for pair in response.results.windows(2) {
        assert!(pair[0].similarity > pair[1].similarity);
    }
    // Everything shown clears the user floor.
    assert!(response.results.iter().all(|hit| hit.similarity >= 0.2));
    // Best match is the item at angle 0.
    assert_eq!(response.results[0].item_id, "00000");
    assert!(response.results[0].similarity > 0.999);
}

#[tokio::test]
async fn search_session_is_registered_for_feedback() {
    let service = TestService::start();
    seed_catalog(&service.catalog, 30, 0.05);

    let response = service
        .pipeline
        .handle(request(&service, 0, Department::All))
        .await
        .unwrap();

    let session = service
        .sessions
        .get(&response.session_short_id)
        .expect("session registered");
    assert_eq!(session.results.len(), response.results.len());
    assert_eq!(session.results[0].0, response.results[0].item_id);
    assert_eq!(session.user_id, 1);
}

#[tokio::test]
async fn empty_catalog_yields_empty_result_not_error() {
    let service = TestService::start();

    let response = service
        .pipeline
        .handle(request(&service, 0, Department::All))
        .await
        .unwrap();
    assert!(response.results.is_empty());
}

#[tokio::test]
async fn far_query_finds_nothing_above_floor() {
    let service = TestService::start();
    // Single item orthogonal to a red-255 query... and to red-0 as well.
    seed_catalog(&service.catalog, 1, 0.0);

    let response = service
        .pipeline
        .handle(request(&service, 255, Department::All))
        .await
        .unwrap();
    // cos(pi/2) against the item at angle 0 is ~0: below every rung and the
    // floor, so the result set is empty rather than noise.
    assert!(response.results.is_empty());
}

#[tokio::test]
async fn repeated_search_is_deterministic() {
    let service = TestService::start();
    seed_catalog(&service.catalog, 60, 0.03);

    let first = service
        .pipeline
        .handle(request(&service, 10, Department::All))
        .await
        .unwrap();
    let second = service
        .pipeline
        .handle(request(&service, 10, Department::All))
        .await
        .unwrap();

    let ids: Vec<_> = first.results.iter().map(|h| &h.item_id).collect();
    let ids2: Vec<_> = second.results.iter().map(|h| &h.item_id).collect();
    assert_eq!(ids, ids2);
    for (a, b) in first.results.iter().zip(second.results.iter()) {
        assert_eq!(a.similarity, b.similarity);
    }
}
