//! Restore and backup lifecycle at the registry level

use toolsight_core::ArtifactOrigin;
use toolsight_e2e_tests::TestService;

fn write_weights(service: &TestService, name: &str, contents: &[u8]) -> std::path::PathBuf {
    let path = service.dir.path().join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

#[tokio::test]
async fn restore_points_active_back_and_snapshots_forward_state() {
    let service = TestService::start();
    let v0 = write_weights(&service, "v0.safetensors", b"original");
    let v2 = write_weights(&service, "v2.safetensors", b"newer");

    // History: v0 was archived as a backup, v2 is serving.
    service
        .registry
        .register(&v0, "v0", ArtifactOrigin::Backup)
        .unwrap();
    service
        .registry
        .register(&v2, "v2", ArtifactOrigin::FineTuned)
        .unwrap();
    service.registry.promote("v2").unwrap();
    assert_eq!(service.registry.active().unwrap().unwrap().version, "v2");

    // Restore flow: snapshot the current model first so the restore is
    // reversible, then swing the pointer back.
    let snapshot_version = "backup_of_v2";
    let active = service.registry.active().unwrap().unwrap();
    service
        .registry
        .register(&active.path, snapshot_version, ArtifactOrigin::Backup)
        .unwrap();
    service.registry.promote("v0").unwrap();

    assert_eq!(service.registry.active().unwrap().unwrap().version, "v0");
    let backups = service.registry.list(Some(ArtifactOrigin::Backup)).unwrap();
    assert!(backups.iter().any(|b| b.version == snapshot_version));
    // The snapshot preserves the superseded bytes.
    let snapshot = backups
        .iter()
        .find(|b| b.version == snapshot_version)
        .unwrap();
    assert_eq!(std::fs::read(&snapshot.path).unwrap(), b"newer");
}

#[tokio::test]
async fn backup_retention_never_deletes_active() {
    let service = TestService::start();
    for i in 0..6 {
        let weights = write_weights(&service, &format!("b{i}.safetensors"), b"w");
        service
            .registry
            .register(&weights, &format!("backup_{i}"), ArtifactOrigin::Backup)
            .unwrap();
    }
    service.registry.promote("backup_3").unwrap();

    let removed = service.registry.cleanup_backups(1).unwrap();
    // backup_3 survives regardless of retention depth.
    assert!(!removed.contains(&"backup_3".to_string()));
    assert!(service.registry.find("backup_3").is_ok());
}

#[tokio::test]
async fn checksums_detect_artifact_identity() {
    let service = TestService::start();
    let a = write_weights(&service, "a.safetensors", b"same bytes");
    let b = write_weights(&service, "b.safetensors", b"same bytes");
    let c = write_weights(&service, "c.safetensors", b"different");

    let art_a = service
        .registry
        .register(&a, "va", ArtifactOrigin::FineTuned)
        .unwrap();
    let art_b = service
        .registry
        .register(&b, "vb", ArtifactOrigin::FineTuned)
        .unwrap();
    let art_c = service
        .registry
        .register(&c, "vc", ArtifactOrigin::FineTuned)
        .unwrap();

    assert_eq!(art_a.sha256, art_b.sha256);
    assert_ne!(art_a.sha256, art_c.sha256);
}
