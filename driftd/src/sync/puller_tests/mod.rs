use super::*;

use std::collections::HashSet;

use drift_core::{DeviceId, FileKind, Vector};
use sqlx::SqlitePool;
use tokio::sync::broadcast;

use crate::sync::activity::DeviceActivity;
use crate::sync::context::SyncContext;
use crate::sync::events::{Event, EventBus};
use crate::sync::folder::scan_folder_subdirs;
use crate::sync::index::IndexStore;
use crate::sync::transfer::{BlockSource, RequestError};

#[path = "part1.rs"]
mod part1;
#[path = "part2.rs"]
mod part2;
#[path = "part3.rs"]
mod part3;

const FOLDER: &str = "default";

/// Programmable in-memory peer: serves registered file contents by
/// slicing at the requested offset, records every request, and can be
/// told to fail wholesale per device.
#[derive(Default)]
struct FakeBlockSource {
    contents: Mutex<HashMap<(String, String), Vec<u8>>>,
    failing: Mutex<HashSet<String>>,
    log: Mutex<Vec<(String, String, u64)>>,
}

impl FakeBlockSource {
    fn serve(&self, device: &str, name: &str, content: &[u8]) {
        self.contents
            .lock()
            .unwrap()
            .insert((device.to_string(), name.to_string()), content.to_vec());
    }

    fn fail_device(&self, device: &str) {
        self.failing.lock().unwrap().insert(device.to_string());
    }

    fn requests(&self) -> Vec<(String, String, u64)> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl BlockSource for FakeBlockSource {
    async fn request(
        &self,
        device: &DeviceId,
        _folder: &str,
        name: &str,
        offset: u64,
        size: u32,
        _hash: &[u8],
        _from_temporary: bool,
    ) -> Result<Vec<u8>, RequestError> {
        self.log.lock().unwrap().push((
            device.as_str().to_string(),
            name.to_string(),
            offset,
        ));
        if self.failing.lock().unwrap().contains(device.as_str()) {
            return Err(RequestError::UnknownDevice(device.clone()));
        }
        let contents = self.contents.lock().unwrap();
        let content = contents
            .get(&(device.as_str().to_string(), name.to_string()))
            .ok_or_else(|| RequestError::UnknownDevice(device.clone()))?;
        let start = offset as usize;
        let end = start + size as usize;
        if end > content.len() {
            return Err(RequestError::ShortResponse {
                expected: size,
                actual: content.len().saturating_sub(start),
            });
        }
        Ok(content[start..end].to_vec())
    }
}

struct Harness {
    // Keeps the folder root alive for the duration of the test.
    dir: tempfile::TempDir,
    shared: Arc<RwShared>,
    scan_rx: mpsc::Receiver<ScanRequest>,
    source: Arc<FakeBlockSource>,
    remote: DeviceId,
    received_rx: mpsc::UnboundedReceiver<(String, FileInfo)>,
    next_remote_seq: i64,
}

impl Harness {
    fn root(&self) -> &std::path::Path {
        self.dir.path()
    }

    fn local(&self) -> &DeviceId {
        &self.shared.ctx.device_id
    }

    fn remote_short(&self) -> drift_core::ShortId {
        self.remote.short_id()
    }

    fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.shared.ctx.bus.subscribe()
    }

    async fn scan(&self) {
        scan_folder_subdirs(
            &self.shared.ctx,
            &self.shared.cfg,
            &self.shared.matcher,
            Vec::new(),
        )
        .await
        .unwrap();
    }

    async fn local_record(&self, name: &str) -> Option<FileInfo> {
        self.shared
            .ctx
            .store
            .current_folder_file(FOLDER, self.local(), name)
            .await
            .unwrap()
    }

    /// Install remote index records with fresh watermark values.
    async fn announce(&mut self, mut files: Vec<FileInfo>) {
        for file in &mut files {
            self.next_remote_seq += 1;
            file.local_version = self.next_remote_seq;
        }
        self.shared
            .ctx
            .store
            .update_remotes(FOLDER, &self.remote.clone(), &files)
            .await
            .unwrap();
    }

    async fn pull(&self) -> usize {
        Arc::clone(&self.shared).puller_iteration().await
    }
}

async fn make_harness(tweak: impl FnOnce(&mut FolderConfig)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let store = IndexStore::from_pool(pool);
    store.init().await.unwrap();

    let source = Arc::new(FakeBlockSource::default());
    let (received_tx, received_rx) = mpsc::unbounded_channel();
    let mut roots = HashMap::new();
    roots.insert(FOLDER.to_string(), dir.path().to_path_buf());

    let ctx = Arc::new(SyncContext {
        device_id: DeviceId::new("local"),
        store,
        bus: Arc::new(EventBus::new()),
        activity: DeviceActivity::new(),
        source: Arc::clone(&source) as Arc<dyn BlockSource>,
        progress: None,
        folder_roots: std::sync::RwLock::new(roots),
        received_tx,
    });

    let mut cfg = FolderConfig {
        id: FOLDER.to_string(),
        path: dir.path().to_path_buf(),
        ..FolderConfig::default()
    };
    tweak(&mut cfg);

    let (folder, _handle) = RwFolder::new(cfg, Arc::clone(&ctx), None);
    let RwFolder {
        shared, scan_rx, ..
    } = folder;

    Harness {
        dir,
        shared,
        scan_rx,
        source,
        remote: DeviceId::new("peer"),
        received_rx,
        next_remote_seq: 0,
    }
}

/// A remote announcement for a regular file with the given content.
fn remote_file(name: &str, content: &[u8], version: Vector) -> FileInfo {
    FileInfo {
        name: name.into(),
        kind: FileKind::File,
        flags: 0o644,
        modified: 1_600_000_000,
        size: content.len() as u64,
        deleted: false,
        invalid: false,
        version,
        local_version: 0,
        blocks: blocks::hash_blocks(content).unwrap(),
    }
}

fn remote_dir(name: &str, mode: u32, version: Vector) -> FileInfo {
    FileInfo {
        name: name.into(),
        kind: FileKind::Directory,
        flags: mode,
        modified: 1_600_000_000,
        size: 0,
        deleted: false,
        invalid: false,
        version,
        local_version: 0,
        blocks: Vec::new(),
    }
}

fn deletion_of(record: &FileInfo, version: Vector) -> FileInfo {
    FileInfo {
        name: record.name.clone(),
        kind: record.kind,
        flags: record.flags,
        modified: record.modified,
        size: 0,
        deleted: true,
        invalid: false,
        version,
        local_version: 0,
        blocks: Vec::new(),
    }
}

fn drain_events(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

/// (item, action, had_error) for every ItemFinished event.
fn finished_items(events: &[Event]) -> Vec<(String, String, bool)> {
    events
        .iter()
        .filter(|e| e.event_type == EventType::ItemFinished)
        .map(|e| {
            (
                e.data["item"].as_str().unwrap_or_default().to_string(),
                e.data["action"].as_str().unwrap_or_default().to_string(),
                !e.data["error"].is_null(),
            )
        })
        .collect()
}

fn mode_of(path: &std::path::Path) -> u32 {
    std::fs::metadata(path).unwrap().permissions().mode() & 0o7777
}
