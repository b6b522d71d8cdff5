//! Admission control through the full pipeline

use toolsight_core::{
    AppConfig, CancellationToken, Department, Error, ImageSource, SearchMethod, SearchRequest,
};
use toolsight_e2e_tests::{TestService, photo_with_red, seed_catalog};

fn request(service: &TestService, user_id: i64, n: usize, admin: bool) -> SearchRequest {
    let path = photo_with_red(service.dir.path(), &format!("u{user_id}-{n}"), 0);
    SearchRequest {
        user_id,
        image: ImageSource::Path(path),
        photo_fingerprint: format!("photo-{user_id}-{n}"),
        department: Department::All,
        is_admin: admin,
        method: SearchMethod::Thresholds,
        cancel: CancellationToken::new(),
    }
}

#[tokio::test]
async fn burst_user_gets_three_searches_then_growing_retry_hints() {
    let service = TestService::start();
    seed_catalog(&service.catalog, 20, 0.05);

    // 10 rapid requests from one user: the photo bucket admits its burst
    // of 3, everything after is rejected with a usable retry hint.
    let mut ok = 0;
    let mut hints = Vec::new();
    for n in 0..10 {
        match service.pipeline.handle(request(&service, 7, n, false)).await {
            Ok(_) => ok += 1,
            Err(Error::RateLimited {
                retry_after_seconds,
            }) => hints.push(retry_after_seconds),
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(ok, 3);
    assert_eq!(hints.len(), 7);
    for pair in hints.windows(2) {
        assert!(pair[0] <= pair[1], "hints must grow: {hints:?}");
    }
    assert!(*hints.first().unwrap() >= 1);
}

#[tokio::test]
async fn rejected_requests_leave_no_session_behind() {
    let service = TestService::start();
    seed_catalog(&service.catalog, 20, 0.05);

    for n in 0..3 {
        service
            .pipeline
            .handle(request(&service, 7, n, false))
            .await
            .unwrap();
    }
    let sessions_before = service.sessions.len();
    let err = service
        .pipeline
        .handle(request(&service, 7, 99, false))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RateLimited { .. }));
    assert_eq!(service.sessions.len(), sessions_before);
}

#[tokio::test]
async fn admin_role_bypasses_photo_bucket() {
    let service = TestService::start();
    seed_catalog(&service.catalog, 20, 0.05);

    // 5 admin searches pass the photo cap of 3; the 6th hits the general
    // bucket, which admins still pay.
    for n in 0..5 {
        service
            .pipeline
            .handle(request(&service, 1, n, true))
            .await
            .unwrap();
    }
    let err = service
        .pipeline
        .handle(request(&service, 1, 6, true))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RateLimited { .. }));
}

#[tokio::test]
async fn users_do_not_share_buckets() {
    let service = TestService::start();
    seed_catalog(&service.catalog, 20, 0.05);

    for n in 0..3 {
        service
            .pipeline
            .handle(request(&service, 7, n, false))
            .await
            .unwrap();
    }
    assert!(
        service
            .pipeline
            .handle(request(&service, 7, 9, false))
            .await
            .is_err()
    );
    // A different user still has a full burst.
    service
        .pipeline
        .handle(request(&service, 8, 0, false))
        .await
        .unwrap();
}

#[tokio::test]
async fn queue_ceiling_sheds_load_with_overloaded() {
    let mut config = AppConfig::default();
    config.worker_count = Some(1);
    config.queue_ceiling = 1;
    // Generous rate limits so admission control is not the limiting factor.
    config.general_rate_limit = toolsight_core::RateLimit {
        tokens: 100,
        seconds: 1.0,
    };
    config.photo_rate_limit = toolsight_core::RateLimit {
        tokens: 100,
        seconds: 1.0,
    };
    let service = std::sync::Arc::new(TestService::with_rate_limits(config));
    seed_catalog(&service.catalog, 2_000, 0.0007);

    let mut handles = Vec::new();
    for n in 0..12 {
        let service = std::sync::Arc::clone(&service);
        let request = request(&service, n as i64 + 100, n, false);
        handles.push(tokio::spawn(async move {
            service.pipeline.handle(request).await
        }));
    }

    let mut shed = 0;
    let mut served = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => served += 1,
            Err(Error::Overloaded) => shed += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert!(served >= 1);
    assert!(shed + served == 12);
}
