use super::*;

#[tokio::test]
async fn metadata_shortcut_changes_mode_without_transfer() {
    let mut h = make_harness(|_| {}).await;
    let path = h.root().join("a.txt");
    std::fs::write(&path, b"hello").unwrap();
    std::fs::set_permissions(&path, Permissions::from_mode(0o644)).unwrap();
    h.scan().await;

    let local = h.local_record("a.txt").await.unwrap();
    let mut announced = local.clone();
    announced.flags = 0o600;
    announced.version = local.version.clone().updated(h.remote_short());
    h.announce(vec![announced.clone()]).await;

    let mut events = h.subscribe();
    let changed = h.pull().await;

    assert_eq!(changed, 1);
    assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    assert_eq!(mode_of(&path), 0o600);
    // Nothing crossed the network.
    assert!(h.source.requests().is_empty());

    let events = drain_events(&mut events);
    assert_eq!(
        finished_items(&events),
        vec![("a.txt".to_string(), "metadata".to_string(), false)]
    );

    // The db record took the announced version merged with ours.
    let record = h.local_record("a.txt").await.unwrap();
    assert!(record.version.greater_equal(&announced.version));
    assert!(record.version.greater_equal(&local.version));

    // Converged: the next iteration sees nothing to do.
    assert_eq!(h.pull().await, 0);
}

#[tokio::test]
async fn directories_are_created_parents_first() {
    let mut h = make_harness(|_| {}).await;
    h.scan().await;

    let v = Vector::new().updated(h.remote_short());
    let content = b"inside the tree";
    h.announce(vec![
        remote_dir("parent", 0o755, v.clone()),
        remote_dir("parent/child", 0o755, v.clone()),
        remote_file("parent/child/f.txt", content, v.clone()),
    ])
    .await;
    h.source.serve("peer", "parent/child/f.txt", content);

    let changed = h.pull().await;
    assert_eq!(changed, 3);
    assert!(h.root().join("parent").is_dir());
    assert!(h.root().join("parent/child").is_dir());
    assert_eq!(
        std::fs::read(h.root().join("parent/child/f.txt")).unwrap(),
        content
    );
    assert!(h.shared.current_errors().is_empty());
}

#[tokio::test]
async fn existing_directory_gets_its_mode_adjusted() {
    let mut h = make_harness(|_| {}).await;
    let dir = h.root().join("d");
    std::fs::create_dir(&dir).unwrap();
    std::fs::set_permissions(&dir, Permissions::from_mode(0o755)).unwrap();
    h.scan().await;

    let local = h.local_record("d").await.unwrap();
    let mut announced = local.clone();
    announced.flags = 0o700;
    announced.version = local.version.clone().updated(h.remote_short());
    h.announce(vec![announced]).await;

    assert_eq!(h.pull().await, 1);
    assert_eq!(mode_of(&dir), 0o700);
    let record = h.local_record("d").await.unwrap();
    assert_eq!(record.mode(), 0o700);
}

#[tokio::test]
async fn file_in_the_way_of_a_directory_is_replaced() {
    let mut h = make_harness(|_| {}).await;
    std::fs::write(h.root().join("thing"), b"i was a file").unwrap();
    h.scan().await;

    let local = h.local_record("thing").await.unwrap();
    let announced = remote_dir(
        "thing",
        0o755,
        local.version.clone().updated(h.remote_short()),
    );
    h.announce(vec![announced]).await;

    assert_eq!(h.pull().await, 1);
    assert!(h.root().join("thing").is_dir());
    assert!(h.shared.current_errors().is_empty());
}

#[tokio::test]
async fn ignored_needed_files_are_skipped() {
    let mut h = make_harness(|cfg| {
        cfg.ignore_patterns = vec!["*.log".to_string()];
    })
    .await;
    h.scan().await;

    let v = Vector::new().updated(h.remote_short());
    h.announce(vec![remote_file("noise.log", b"zzz", v)]).await;

    assert_eq!(h.pull().await, 0);
    assert!(!h.root().join("noise.log").exists());
    assert!(h.source.requests().is_empty());
}
