use super::*;
use drift_core::hash_blocks;

async fn store() -> IndexStore {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let store = IndexStore::from_pool(pool);
    store.init().await.unwrap();
    store
}

fn device(id: &str) -> DeviceId {
    DeviceId::new(id)
}

fn file(name: &str, content: &[u8], version: Vector) -> FileInfo {
    let blocks = hash_blocks(content).unwrap();
    FileInfo {
        name: name.into(),
        kind: FileKind::File,
        flags: 0o644,
        modified: 1_000,
        size: content.len() as u64,
        deleted: false,
        invalid: false,
        version,
        local_version: 0,
        blocks,
    }
}

fn deleted(name: &str, version: Vector) -> FileInfo {
    FileInfo {
        name: name.into(),
        kind: FileKind::File,
        flags: 0,
        modified: 1_000,
        size: 0,
        deleted: true,
        invalid: false,
        version,
        local_version: 0,
        blocks: Vec::new(),
    }
}

fn v(counters: &[(u64, u64)]) -> Vector {
    let mut out = Vector::new();
    for &(id, n) in counters {
        for _ in 0..n {
            out.update(drift_core::ShortId(id));
        }
    }
    out
}

#[tokio::test]
async fn update_locals_assigns_increasing_local_versions() {
    let store = store().await;
    let local = device("local");
    store
        .update_locals("f", &local, &[file("a", b"1", v(&[(1, 1)]))])
        .await
        .unwrap();
    store
        .update_locals("f", &local, &[file("b", b"2", v(&[(1, 1)]))])
        .await
        .unwrap();

    let a = store
        .current_folder_file("f", &local, "a")
        .await
        .unwrap()
        .unwrap();
    let b = store
        .current_folder_file("f", &local, "b")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(a.local_version, 1);
    assert_eq!(b.local_version, 2);
}

#[tokio::test]
async fn global_is_the_highest_version() {
    let store = store().await;
    store
        .update_locals("f", &device("local"), &[file("a", b"old", v(&[(1, 1)]))])
        .await
        .unwrap();
    store
        .update_remotes("f", &device("peer"), &[file("a", b"new", v(&[(1, 1), (2, 1)]))])
        .await
        .unwrap();

    let global = store.current_global_file("f", "a").await.unwrap().unwrap();
    assert_eq!(global.version, v(&[(1, 1), (2, 1)]));
}

#[tokio::test]
async fn global_ignores_invalid_records() {
    let store = store().await;
    let mut newer = file("a", b"new", v(&[(2, 5)]));
    newer.invalid = true;
    store
        .update_remotes("f", &device("peer"), &[newer])
        .await
        .unwrap();
    store
        .update_locals("f", &device("local"), &[file("a", b"old", v(&[(1, 1)]))])
        .await
        .unwrap();

    let global = store.current_global_file("f", "a").await.unwrap().unwrap();
    assert_eq!(global.version, v(&[(1, 1)]));
}

#[tokio::test]
async fn concurrent_versions_resolve_by_modified_then_device() {
    let store = store().await;
    let mut older = file("a", b"older", v(&[(1, 1)]));
    older.modified = 100;
    let mut newer = file("a", b"newer", v(&[(2, 1)]));
    newer.modified = 200;
    store
        .update_remotes("f", &device("zed"), &[older])
        .await
        .unwrap();
    store
        .update_remotes("f", &device("amy"), &[newer.clone()])
        .await
        .unwrap();

    let global = store.current_global_file("f", "a").await.unwrap().unwrap();
    assert_eq!(global.version, newer.version);
}

#[tokio::test]
async fn need_lists_lexicographically_and_skips_in_sync_files() {
    let store = store().await;
    let local = device("local");
    let peer = device("peer");

    store
        .update_locals("f", &local, &[file("b", b"same", v(&[(1, 1)]))])
        .await
        .unwrap();
    store
        .update_remotes(
            "f",
            &peer,
            &[
                file("b", b"same", v(&[(1, 1)])),
                file("c", b"x", v(&[(2, 1)])),
                file("a", b"y", v(&[(2, 1)])),
            ],
        )
        .await
        .unwrap();

    let needed = store.need("f", &local).await.unwrap();
    let names: Vec<_> = needed.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["a", "c"]);
}

#[tokio::test]
async fn need_skips_deletions_of_unknown_files() {
    let store = store().await;
    store
        .update_remotes("f", &device("peer"), &[deleted("ghost", v(&[(2, 1)]))])
        .await
        .unwrap();
    assert!(store.need("f", &device("local")).await.unwrap().is_empty());
}

#[tokio::test]
async fn need_includes_deletions_of_known_files() {
    let store = store().await;
    let local = device("local");
    store
        .update_locals("f", &local, &[file("a", b"x", v(&[(1, 1)]))])
        .await
        .unwrap();
    store
        .update_remotes("f", &device("peer"), &[deleted("a", v(&[(1, 1), (2, 1)]))])
        .await
        .unwrap();

    let needed = store.need("f", &local).await.unwrap();
    assert_eq!(needed.len(), 1);
    assert!(needed[0].deleted);
}

#[tokio::test]
async fn with_need_stops_early() {
    let store = store().await;
    store
        .update_remotes(
            "f",
            &device("peer"),
            &[file("a", b"1", v(&[(2, 1)])), file("b", b"2", v(&[(2, 1)]))],
        )
        .await
        .unwrap();

    let mut seen = Vec::new();
    store
        .with_need("f", &device("local"), |file| {
            seen.push(file.name.clone());
            false
        })
        .await
        .unwrap();
    assert_eq!(seen, vec!["a"]);
}

#[tokio::test]
async fn remote_local_version_tracks_peers_only() {
    let store = store().await;
    let local = device("local");
    assert_eq!(store.remote_local_version("f", &local).await.unwrap(), 0);

    store
        .update_locals("f", &local, &[file("a", b"1", v(&[(1, 1)]))])
        .await
        .unwrap();
    assert_eq!(store.remote_local_version("f", &local).await.unwrap(), 0);

    let mut remote = file("b", b"2", v(&[(2, 1)]));
    remote.local_version = 42;
    store
        .update_remotes("f", &device("peer"), &[remote])
        .await
        .unwrap();
    assert_eq!(store.remote_local_version("f", &local).await.unwrap(), 42);
}

#[tokio::test]
async fn availability_requires_exact_version() {
    let store = store().await;
    let local = device("local");
    let wanted = file("a", b"content", v(&[(2, 2)]));
    let block = wanted.blocks[0].clone();

    store
        .update_remotes("f", &device("at-version"), &[wanted.clone()])
        .await
        .unwrap();
    store
        .update_remotes("f", &device("behind"), &[file("a", b"content", v(&[(2, 1)]))])
        .await
        .unwrap();
    let mut gone = deleted("a", v(&[(2, 2)]));
    gone.deleted = true;
    store
        .update_remotes("f", &device("deleter"), &[gone])
        .await
        .unwrap();

    let avail = store
        .availability("f", "a", &wanted.version, &block, &local)
        .await
        .unwrap();
    assert_eq!(avail.len(), 1);
    assert_eq!(avail[0].device, device("at-version"));
    assert!(!avail[0].from_temporary);
}

#[tokio::test]
async fn availability_includes_temp_sources() {
    let store = store().await;
    let local = device("local");
    let wanted = file("a", b"content", v(&[(2, 2)]));
    let block = wanted.blocks[0].clone();

    store.set_temp_availability("f", &device("partial"), "a", vec![0]);
    let avail = store
        .availability("f", "a", &wanted.version, &block, &local)
        .await
        .unwrap();
    assert_eq!(avail.len(), 1);
    assert!(avail[0].from_temporary);

    // Clearing removes the candidate.
    store.set_temp_availability("f", &device("partial"), "a", Vec::new());
    let avail = store
        .availability("f", "a", &wanted.version, &block, &local)
        .await
        .unwrap();
    assert!(avail.is_empty());
}

#[tokio::test]
async fn finder_locates_and_fixes_blocks() {
    let store = store().await;
    let local = device("local");
    let record = file("a", b"block content", v(&[(1, 1)]));
    let hash = record.blocks[0].hash.clone();
    store
        .update_locals("f", &local, &[record])
        .await
        .unwrap();

    let hits = store
        .finder_candidates(&["f".to_string()], &hash)
        .await
        .unwrap();
    assert_eq!(
        hits,
        vec![BlockLocation {
            folder: "f".into(),
            name: "a".into(),
            index: 0
        }]
    );

    // Other folders see nothing.
    assert!(
        store
            .finder_candidates(&["g".to_string()], &hash)
            .await
            .unwrap()
            .is_empty()
    );

    let observed = vec![9u8; 32];
    store
        .finder_fix("f", "a", 0, &hash, &observed)
        .await
        .unwrap();
    assert!(
        store
            .finder_candidates(&["f".to_string()], &hash)
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(
        store
            .finder_candidates(&["f".to_string()], &observed)
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn deleting_a_file_clears_its_finder_entries() {
    let store = store().await;
    let local = device("local");
    let record = file("a", b"block content", v(&[(1, 1)]));
    let hash = record.blocks[0].hash.clone();
    store.update_locals("f", &local, &[record]).await.unwrap();
    store
        .update_locals("f", &local, &[deleted("a", v(&[(1, 2)]))])
        .await
        .unwrap();
    assert!(
        store
            .finder_candidates(&["f".to_string()], &hash)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn virtual_mtime_overrides_matching_observations() {
    let store = store().await;
    store.update_mtime("f", "a", 100, 200).await.unwrap();

    assert_eq!(store.mtime_for("f", "a", 100).await.unwrap(), 200);
    // The file changed on disk since; the override no longer applies.
    assert_eq!(store.mtime_for("f", "a", 150).await.unwrap(), 150);
    assert_eq!(store.mtime_for("f", "other", 100).await.unwrap(), 100);

    let map = store.virtual_mtimes("f").await.unwrap();
    assert_eq!(map.get("a"), Some(&(100, 200)));
}

#[tokio::test]
async fn with_need_sees_a_snapshot() {
    let store = store().await;
    store
        .update_remotes("f", &device("peer"), &[file("a", b"1", v(&[(2, 1)]))])
        .await
        .unwrap();

    // The need list is materialized at call time; updates made while the
    // visitor runs are invisible to it.
    let needed = store.need("f", &device("local")).await.unwrap();
    store
        .update_remotes("f", &device("peer"), &[file("b", b"2", v(&[(2, 1)]))])
        .await
        .unwrap();
    assert_eq!(needed.len(), 1);
}
