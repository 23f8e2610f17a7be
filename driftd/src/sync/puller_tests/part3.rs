use super::*;

#[tokio::test]
async fn new_file_is_fetched_from_the_network() {
    let mut h = make_harness(|_| {}).await;
    h.scan().await;

    let content = b"network content";
    let v = Vector::new().updated(h.remote_short());
    h.announce(vec![remote_file("new.txt", content, v.clone())])
        .await;
    h.source.serve("peer", "new.txt", content);

    let mut events = h.subscribe();
    assert_eq!(h.pull().await, 1);

    let path = h.root().join("new.txt");
    assert_eq!(std::fs::read(&path).unwrap(), content.to_vec());
    assert_eq!(mode_of(&path), 0o644);
    // The temporary is gone after the atomic swap.
    assert!(!h.root().join(".drift.new.txt.tmp").exists());

    let events = drain_events(&mut events);
    assert_eq!(
        finished_items(&events),
        vec![("new.txt".to_string(), "update".to_string(), false)]
    );

    let record = h.local_record("new.txt").await.unwrap();
    assert_eq!(record.version, v);
    assert_eq!(h.pull().await, 0);
}

#[tokio::test]
async fn blocks_are_copied_from_local_files_when_possible() {
    let mut h = make_harness(|_| {}).await;
    let content = b"shared block content";
    std::fs::write(h.root().join("src.txt"), content).unwrap();
    h.scan().await;

    let v = Vector::new().updated(h.remote_short());
    h.announce(vec![remote_file("copy.txt", content, v)]).await;
    // Nothing registered with the fake source: a network attempt would
    // fail the file.

    assert_eq!(h.pull().await, 1);
    assert_eq!(
        std::fs::read(h.root().join("copy.txt")).unwrap(),
        content.to_vec()
    );
    assert!(h.source.requests().is_empty());
    assert!(h.shared.current_errors().is_empty());
}

#[tokio::test]
async fn stale_finder_entries_are_fixed_and_the_block_pulled() {
    let mut h = make_harness(|_| {}).await;
    let old_content = b"original bytes";
    let path = h.root().join("stale.txt");
    std::fs::write(&path, old_content).unwrap();
    h.scan().await;

    // The file changes on disk without a rescan; the finder entry now
    // lies about what is there. Same length, so the block read succeeds
    // and only verification trips.
    std::fs::write(&path, b"modified bytes").unwrap();

    let v = Vector::new().updated(h.remote_short());
    h.announce(vec![remote_file("tgt.txt", old_content, v)]).await;
    h.source.serve("peer", "tgt.txt", old_content);

    assert_eq!(h.pull().await, 1);
    assert_eq!(
        std::fs::read(h.root().join("tgt.txt")).unwrap(),
        old_content.to_vec()
    );
    // The copier fell through to the network.
    assert_eq!(h.source.requests().len(), 1);

    // And repaired the finder: the entry now carries the observed hash.
    let old_hash = blocks::hash_blocks(&old_content[..]).unwrap()[0].hash.clone();
    let new_hash = blocks::hash_blocks(&b"modified bytes"[..]).unwrap()[0]
        .hash
        .clone();
    let store = &h.shared.ctx.store;
    assert!(
        store
            .finder_candidates(&[FOLDER.to_string()], &old_hash)
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(
        store
            .finder_candidates(&[FOLDER.to_string()], &new_hash)
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn all_zero_blocks_are_skipped_when_sparse_is_allowed() {
    let mut h = make_harness(|_| {}).await;
    h.scan().await;

    let mut content = Vec::new();
    content.extend(std::iter::repeat_n(0xaau8, BLOCK_SIZE));
    content.extend(std::iter::repeat_n(0u8, BLOCK_SIZE));
    content.extend(b"tail!");

    let v = Vector::new().updated(h.remote_short());
    h.announce(vec![remote_file("sparse.bin", &content, v)]).await;
    h.source.serve("peer", "sparse.bin", &content);

    assert_eq!(h.pull().await, 1);
    assert_eq!(
        std::fs::read(h.root().join("sparse.bin")).unwrap(),
        content
    );

    // The zero block at offset BLOCK_SIZE was never requested; the hole
    // reads back as zeroes.
    let offsets: Vec<u64> = h.source.requests().iter().map(|r| r.2).collect();
    assert_eq!(offsets.len(), 2);
    assert!(!offsets.contains(&(BLOCK_SIZE as u64)));
    assert!(h.shared.current_errors().is_empty());
}

#[tokio::test]
async fn zero_blocks_are_fetched_when_sparse_is_disabled() {
    let mut h = make_harness(|cfg| {
        cfg.disable_sparse_files = true;
    })
    .await;
    h.scan().await;

    let mut content = Vec::new();
    content.extend(std::iter::repeat_n(0u8, BLOCK_SIZE));
    content.extend(b"tail!");

    let v = Vector::new().updated(h.remote_short());
    h.announce(vec![remote_file("dense.bin", &content, v)]).await;
    h.source.serve("peer", "dense.bin", &content);

    assert_eq!(h.pull().await, 1);
    assert_eq!(h.source.requests().len(), 2);
}

#[tokio::test]
async fn exhausting_all_peers_fails_the_file() {
    let mut h = make_harness(|_| {}).await;
    h.scan().await;

    let v = Vector::new().updated(h.remote_short());
    h.announce(vec![remote_file("unlucky.txt", b"never arrives", v)])
        .await;
    h.source.fail_device("peer");

    let mut events = h.subscribe();
    let changed = h.pull().await;

    assert_eq!(changed, 1);
    assert!(!h.root().join("unlucky.txt").exists());

    let errors = h.shared.current_errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].path, "unlucky.txt");
    assert!(errors[0].error.starts_with("pull:"));

    let events = drain_events(&mut events);
    assert_eq!(
        finished_items(&events),
        vec![("unlucky.txt".to_string(), "update".to_string(), true)]
    );
}

#[tokio::test]
async fn concurrent_edit_lands_as_conflict_copy_with_merged_version() {
    let mut h = make_harness(|cfg| {
        cfg.max_conflicts = 1;
    })
    .await;
    let path = h.root().join("c.txt");
    std::fs::write(&path, b"ours").unwrap();
    h.scan().await;
    let local = h.local_record("c.txt").await.unwrap();

    // An older conflict copy that the cap of one should push out.
    let stale_copy = h.root().join("c.sync-conflict-20000101-000000.txt");
    std::fs::write(&stale_copy, b"ancient").unwrap();

    // A concurrent remote edit that wins the global election.
    let mut theirs = remote_file(
        "c.txt",
        b"theirs, longer",
        Vector::new().updated(h.remote_short()).updated(h.remote_short()),
    );
    theirs.modified = local.modified + 100;
    assert!(theirs.version.concurrent(&local.version));
    h.announce(vec![theirs.clone()]).await;
    h.source.serve("peer", "c.txt", b"theirs, longer");

    assert_eq!(h.pull().await, 1);
    assert_eq!(std::fs::read(&path).unwrap(), b"theirs, longer");

    let copies: Vec<_> = std::fs::read_dir(h.root())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with("c.sync-conflict-"))
        .collect();
    assert_eq!(copies.len(), 1, "old conflict copies pruned to the cap");
    assert_eq!(
        std::fs::read(h.root().join(&copies[0])).unwrap(),
        b"ours"
    );
    assert!(!stale_copy.exists());

    // The stored version merges both sides.
    let record = h.local_record("c.txt").await.unwrap();
    assert!(record.version.greater_equal(&theirs.version));
    assert!(record.version.greater_equal(&local.version));
}

#[tokio::test]
async fn stale_on_disk_file_triggers_a_rescan_instead_of_a_pull() {
    let mut h = make_harness(|_| {}).await;
    let path = h.root().join("m.dat");
    std::fs::write(&path, b"indexed state").unwrap();
    h.scan().await;
    let local = h.local_record("m.dat").await.unwrap();

    // The file is touched behind the scanner's back.
    crate::sync::osutil::set_mtime(&path, local.modified + 50).unwrap();

    let mut announced = local.clone();
    announced.version = local.version.clone().updated(h.remote_short());
    announced.blocks = blocks::hash_blocks(&b"remote edit.."[..]).unwrap();
    announced.size = 13;
    h.announce(vec![announced]).await;
    h.source.serve("peer", "m.dat", b"remote edit..");

    let changed = h.pull().await;
    assert_eq!(changed, 1);

    // The guard fired: no temp was opened, no bytes moved, the file was
    // queued for a background rescan and stays needed.
    assert!(!h.root().join(".drift.m.dat.tmp").exists());
    assert!(h.source.requests().is_empty());
    assert_eq!(std::fs::read(&path).unwrap(), b"indexed state");

    let req = h.scan_rx.try_recv().ok().expect("a rescan was scheduled");
    assert_eq!(req.subdirs, vec!["m.dat".to_string()]);
    assert!(req.reply.is_none());

    assert_eq!(
        h.shared
            .ctx
            .store
            .need(FOLDER, h.local())
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn temp_file_blocks_are_reused_across_iterations() {
    let mut h = make_harness(|_| {}).await;
    h.scan().await;

    let mut content = Vec::new();
    content.extend(std::iter::repeat_n(0x11u8, BLOCK_SIZE));
    content.extend(std::iter::repeat_n(0x22u8, BLOCK_SIZE));

    // A previous attempt left a temp holding the first block.
    std::fs::write(
        h.root().join(".drift.big.bin.tmp"),
        &content[..BLOCK_SIZE],
    )
    .unwrap();

    let v = Vector::new().updated(h.remote_short());
    h.announce(vec![remote_file("big.bin", &content, v)]).await;
    h.source.serve("peer", "big.bin", &content);

    assert_eq!(h.pull().await, 1);
    assert_eq!(
        std::fs::read(h.root().join("big.bin")).unwrap(),
        content
    );
    // Only the second block crossed the network.
    let offsets: Vec<u64> = h.source.requests().iter().map(|r| r.2).collect();
    assert_eq!(offsets, vec![BLOCK_SIZE as u64]);
}

#[tokio::test]
async fn db_updater_flushes_on_close_and_nudges_for_files() {
    let mut h = make_harness(|_| {}).await;
    let (db_tx, db_rx) = mpsc::channel::<DbUpdateJob>(1);
    let shared = Arc::clone(&h.shared);
    let task = tokio::spawn(async move { shared.db_updater_routine(db_rx).await });

    let v = Vector::new().updated(h.remote_short());
    db_tx
        .send(DbUpdateJob {
            file: remote_dir("d", 0o755, v.clone()),
            kind: DbUpdateKind::HandleDir,
        })
        .await
        .unwrap();
    db_tx
        .send(DbUpdateJob {
            file: remote_file("f.txt", b"x", v.clone()),
            kind: DbUpdateKind::HandleFile,
        })
        .await
        .unwrap();
    drop(db_tx);
    task.await.unwrap();

    // Both records landed with fresh local versions.
    let d = h.local_record("d").await.unwrap();
    let f = h.local_record("f.txt").await.unwrap();
    assert!(d.local_version > 0);
    assert!(f.local_version > d.local_version);

    // Only the non-directory update nudges the received-file hook.
    let (folder, file) = h.received_rx.try_recv().unwrap();
    assert_eq!(folder, FOLDER);
    assert_eq!(file.name, "f.txt");
    assert!(h.received_rx.try_recv().is_err());
}

#[tokio::test]
async fn db_updater_flushes_by_age_while_the_channel_stays_open() {
    let mut h = make_harness(|_| {}).await;
    let (db_tx, db_rx) = mpsc::channel::<DbUpdateJob>(1);
    let shared = Arc::clone(&h.shared);
    let task = tokio::spawn(async move { shared.db_updater_routine(db_rx).await });

    let v = Vector::new().updated(h.remote_short());
    db_tx
        .send(DbUpdateJob {
            file: remote_file("slow.txt", b"x", v),
            kind: DbUpdateKind::HandleFile,
        })
        .await
        .unwrap();

    // Paused time fast-forwards through the 2 s batch age.
    tokio::time::sleep(MAX_DB_BATCH_AGE + Duration::from_millis(100)).await;

    let record = h.local_record("slow.txt").await.unwrap();
    assert!(record.local_version > 0);

    drop(db_tx);
    task.await.unwrap();
}
