use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use drift_core::{DeviceId, FileInfo};
use tokio::sync::mpsc;

use super::activity::DeviceActivity;
use super::events::EventBus;
use super::index::IndexStore;
use super::progress::ProgressSink;
use super::transfer::BlockSource;

/// Dependencies shared by every folder service. Built once at the
/// composition root and injected at folder construction; nothing in here
/// owns a folder back, so there is no reference cycle.
pub struct SyncContext {
    pub device_id: DeviceId,
    pub store: IndexStore,
    pub bus: Arc<EventBus>,
    pub activity: DeviceActivity,
    pub source: Arc<dyn BlockSource>,
    pub progress: Option<Arc<dyn ProgressSink>>,
    /// Folder id → root path, for cross-folder block reuse.
    pub folder_roots: RwLock<HashMap<String, PathBuf>>,
    /// Non-invalid, non-directory records that just landed locally; the
    /// daemon uses this to nudge peers.
    pub received_tx: mpsc::UnboundedSender<(String, FileInfo)>,
}

impl SyncContext {
    /// Snapshot of the folder table: the id list and the id → root map.
    pub fn folder_snapshot(&self) -> (Vec<String>, HashMap<String, PathBuf>) {
        let roots = self
            .folder_roots
            .read()
            .expect("folder roots lock poisoned")
            .clone();
        let mut ids: Vec<String> = roots.keys().cloned().collect();
        ids.sort();
        (ids, roots)
    }

    pub fn register_folder(&self, id: &str, root: PathBuf) {
        self.folder_roots
            .write()
            .expect("folder roots lock poisoned")
            .insert(id.to_string(), root);
    }
}
