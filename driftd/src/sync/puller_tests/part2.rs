use super::*;

#[tokio::test]
async fn rename_is_detected_and_moves_bytes_locally() {
    let mut h = make_harness(|_| {}).await;
    let old_path = h.root().join("old.bin");
    std::fs::write(&old_path, b"movable content").unwrap();
    h.scan().await;

    let local = h.local_record("old.bin").await.unwrap();
    let delete_version = local.version.clone().updated(h.remote_short());
    let create_version = Vector::new().updated(h.remote_short());
    h.announce(vec![
        deletion_of(&local, delete_version),
        remote_file("new.bin", b"movable content", create_version),
    ])
    .await;

    let mut events = h.subscribe();
    let changed = h.pull().await;

    assert_eq!(changed, 2);
    assert!(!old_path.exists());
    assert_eq!(
        std::fs::read(h.root().join("new.bin")).unwrap(),
        b"movable content"
    );
    // Zero network requests: the rename satisfied both sides.
    assert!(h.source.requests().is_empty());

    let events = drain_events(&mut events);
    let mut finished = finished_items(&events);
    finished.sort();
    assert_eq!(
        finished,
        vec![
            ("new.bin".to_string(), "update".to_string(), false),
            ("old.bin".to_string(), "delete".to_string(), false),
        ]
    );

    let old_record = h.local_record("old.bin").await.unwrap();
    assert!(old_record.deleted);
    let new_record = h.local_record("new.bin").await.unwrap();
    assert!(!new_record.deleted);
    assert_eq!(new_record.size, 15);
}

#[tokio::test]
async fn deleted_files_are_removed() {
    let mut h = make_harness(|_| {}).await;
    let path = h.root().join("a.txt");
    std::fs::write(&path, b"bye").unwrap();
    h.scan().await;

    let local = h.local_record("a.txt").await.unwrap();
    h.announce(vec![deletion_of(
        &local,
        local.version.clone().updated(h.remote_short()),
    )])
    .await;

    assert_eq!(h.pull().await, 1);
    assert!(!path.exists());
    let record = h.local_record("a.txt").await.unwrap();
    assert!(record.deleted);
    // Converged.
    assert_eq!(h.pull().await, 0);
}

#[tokio::test]
async fn directory_deletions_run_leaves_first() {
    let mut h = make_harness(|_| {}).await;
    std::fs::create_dir_all(h.root().join("d1/d2")).unwrap();
    std::fs::write(h.root().join("d1/d2/f.txt"), b"x").unwrap();
    h.scan().await;

    let d1 = h.local_record("d1").await.unwrap();
    let d2 = h.local_record("d1/d2").await.unwrap();
    let f = h.local_record("d1/d2/f.txt").await.unwrap();
    h.announce(vec![
        deletion_of(&d1, d1.version.clone().updated(h.remote_short())),
        deletion_of(&d2, d2.version.clone().updated(h.remote_short())),
        deletion_of(&f, f.version.clone().updated(h.remote_short())),
    ])
    .await;

    assert_eq!(h.pull().await, 3);
    // Files first, then directories children-before-parents; a wrong
    // order would fail on the non-empty parent.
    assert!(h.shared.current_errors().is_empty());
    assert!(!h.root().join("d1").exists());
}

#[tokio::test]
async fn remote_delete_of_locally_edited_file_keeps_a_conflict_copy() {
    let mut h = make_harness(|_| {}).await;
    let path = h.root().join("c.txt");
    std::fs::write(&path, b"original").unwrap();
    h.scan().await;
    let original = h.local_record("c.txt").await.unwrap();

    // The remote deletes at the version it knew.
    let mut deletion = deletion_of(
        &original,
        original.version.clone().updated(h.remote_short()),
    );

    // Meanwhile we edit locally; the vectors are now concurrent.
    std::fs::write(&path, b"locally edited").unwrap();
    crate::sync::osutil::set_mtime(&path, 1_900_000_000).unwrap();
    h.scan().await;
    let edited = h.local_record("c.txt").await.unwrap();
    assert!(edited.version.concurrent(&deletion.version));

    // Make the deletion win the global election.
    deletion.modified = edited.modified + 100;
    h.announce(vec![deletion.clone()]).await;

    assert_eq!(h.pull().await, 1);
    assert!(!path.exists());

    let copies: Vec<_> = std::fs::read_dir(h.root())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with("c.sync-conflict-"))
        .collect();
    assert_eq!(copies.len(), 1);
    assert_eq!(
        std::fs::read(h.root().join(&copies[0])).unwrap(),
        b"locally edited"
    );

    // The merged version marks the conflict resolved on our side.
    let record = h.local_record("c.txt").await.unwrap();
    assert!(record.deleted);
    assert!(record.version.greater_equal(&deletion.version));
    assert!(record.version.greater_equal(&edited.version));
}

#[tokio::test]
async fn stray_temp_files_do_not_block_directory_deletion() {
    let mut h = make_harness(|_| {}).await;
    std::fs::create_dir(h.root().join("d")).unwrap();
    h.scan().await;

    // A stale temp appears after the scan.
    std::fs::write(h.root().join("d/.drift.f.txt.tmp"), b"partial").unwrap();

    let d = h.local_record("d").await.unwrap();
    h.announce(vec![deletion_of(
        &d,
        d.version.clone().updated(h.remote_short()),
    )])
    .await;

    assert_eq!(h.pull().await, 1);
    assert!(!h.root().join("d").exists());
    assert!(h.shared.current_errors().is_empty());
}

#[tokio::test]
async fn deleted_files_go_through_the_versioner_when_configured() {
    let mut h = make_harness(|_| {}).await;
    // Rebuild with a versioner rooted at the harness folder.
    let versioner: Arc<dyn Versioner> = Arc::new(crate::sync::versioner::SimpleVersioner::new(
        h.root().to_path_buf(),
        5,
    ));
    let (folder, _handle) = RwFolder::new(
        h.shared.cfg.clone(),
        Arc::clone(&h.shared.ctx),
        Some(versioner),
    );
    let RwFolder { shared, .. } = folder;
    h.shared = shared;

    let path = h.root().join("v.txt");
    std::fs::write(&path, b"precious").unwrap();
    h.scan().await;

    let local = h.local_record("v.txt").await.unwrap();
    h.announce(vec![deletion_of(
        &local,
        local.version.clone().updated(h.remote_short()),
    )])
    .await;

    assert_eq!(h.pull().await, 1);
    assert!(!path.exists());
    let versions_dir = h
        .root()
        .join(crate::sync::versioner::VERSIONS_DIR);
    let archived: Vec<_> = std::fs::read_dir(&versions_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(archived.len(), 1);
    assert!(archived[0].starts_with("v.txt~"));
}
