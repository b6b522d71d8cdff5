//! Department-scoped search agrees with the unscoped ordering

use toolsight_core::{
    CancellationToken, Department, ImageSource, SearchMethod, SearchRequest,
};
use toolsight_e2e_tests::{TestService, photo_with_red, seed_catalog};

fn request(service: &TestService, name: &str, department: Department) -> SearchRequest {
    let path = photo_with_red(service.dir.path(), name, 0);
    SearchRequest {
        user_id: 1,
        image: ImageSource::Path(path),
        photo_fingerprint: name.to_string(),
        department,
        is_admin: true,
        method: SearchMethod::Thresholds,
        cancel: CancellationToken::new(),
    }
}

#[tokio::test]
async fn scoped_search_only_returns_department_items() {
    let service = TestService::start();
    seed_catalog(&service.catalog, 90, 0.02);

    let response = service
        .pipeline
        .handle(request(
            &service,
            "scoped",
            Department::Named("КРЕПЕЖ".into()),
        ))
        .await
        .unwrap();

    assert!(!response.results.is_empty());
    assert!(
        response
            .results
            .iter()
            .all(|hit| hit.department.as_deref() == Some("КРЕПЕЖ"))
    );
}

#[tokio::test]
async fn scoped_ordering_matches_restricted_full_ordering() {
    let service = TestService::start();
    seed_catalog(&service.catalog, 90, 0.02);

    let full = service
        .pipeline
        .handle(request(&service, "full", Department::All))
        .await
        .unwrap();
    let scoped = service
        .pipeline
        .handle(request(
            &service,
            "restricted",
            Department::Named("ИНСТРУМЕНТЫ".into()),
        ))
        .await
        .unwrap();

    // The scoped list must equal the department's slice of the full ranking.
    // The full top-5 may not contain 5 items of one department, so compare
    // against the prefix both lists share.
    let full_in_dept: Vec<&str> = full
        .results
        .iter()
        .filter(|hit| hit.department.as_deref() == Some("ИНСТРУМЕНТЫ"))
        .map(|hit| hit.item_id.as_str())
        .collect();
    let scoped_ids: Vec<&str> = scoped
        .results
        .iter()
        .map(|hit| hit.item_id.as_str())
        .collect();
    assert!(!full_in_dept.is_empty());
    assert!(
        scoped_ids.starts_with(&full_in_dept),
        "scoped {scoped_ids:?} must begin with the full ranking's department slice {full_in_dept:?}"
    );
}

#[tokio::test]
async fn absent_department_is_empty_not_error() {
    let service = TestService::start();
    seed_catalog(&service.catalog, 30, 0.05);

    let response = service
        .pipeline
        .handle(request(
            &service,
            "ghost-dept",
            Department::Named("ЭЛЕКТРИКА".into()),
        ))
        .await
        .unwrap();
    assert!(response.results.is_empty());
}

#[tokio::test]
async fn all_sentinel_is_unfiltered() {
    let service = TestService::start();
    seed_catalog(&service.catalog, 30, 0.05);

    assert_eq!(Department::parse("ВСЕ"), Department::All);
    let response = service
        .pipeline
        .handle(request(&service, "sentinel", Department::parse("все")))
        .await
        .unwrap();
    assert_eq!(response.results.len(), 5);
}
