use std::collections::HashMap;
use std::fs::{File, Permissions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, FileExt, PermissionsExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use drift_core::{
    BLOCK_SIZE, BlockInfo, FileInfo, VerifyError, block_diff, blocks, blocks_equal, verify_buffer,
};
use rand::seq::SliceRandom;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::config::{FolderConfig, PullOrder};
use super::conflict::{in_conflict, move_for_conflict};
use super::context::SyncContext;
use super::events::{EventType, error_payload};
use super::folder::{
    FolderHandle, FolderState, SCAN_QUEUE_DEPTH, ScanRequest, StateTracker, check_folder_health,
    next_scan, scan_folder_subdirs,
};
use super::ignore::IgnoreMatcher;
use super::index::IndexError;
use super::osutil;
use super::paths::{PathError, is_temporary, real_path_for, temp_path_for};
use super::puller_state::SharedPullerState;
use super::queue::JobQueue;
use super::versioner::Versioner;

/// Iterations with outstanding changes before the puller pauses and
/// publishes its per-file errors.
const MAX_PULL_ATTEMPTS: usize = 10;

/// setuid, setgid and sticky are preserved on directories we adjust.
const RETAIN_BITS: u32 = 0o7000;

const NO_DEVICE_ERROR: &str =
    "peers who had this file went away, or the file has changed while syncing; will retry later";

const MAX_DB_BATCH_SIZE: usize = 1000;
const MAX_DB_BATCH_AGE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum PullError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("index error: {0}")]
    Index(#[from] IndexError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DbUpdateKind {
    HandleDir,
    DeleteDir,
    HandleFile,
    DeleteFile,
    ShortcutFile,
}

pub(crate) struct DbUpdateJob {
    file: FileInfo,
    kind: DbUpdateKind,
}

/// A file with blocks to copy, entering the pipeline at the copier stage.
pub(crate) struct CopyBlocksState {
    state: Arc<SharedPullerState>,
    blocks: Vec<BlockInfo>,
}

/// One block that must be fetched from the network.
pub(crate) struct PullBlockState {
    state: Arc<SharedPullerState>,
    block: BlockInfo,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FileError {
    pub path: String,
    pub error: String,
}

/// Everything the pipeline workers share for one read-write folder.
pub(crate) struct RwShared {
    cfg: FolderConfig,
    ctx: Arc<SyncContext>,
    matcher: Arc<IgnoreMatcher>,
    versioner: Option<Arc<dyn Versioner>>,
    queue: Arc<JobQueue>,
    /// First error per path for the current iteration.
    errors: Mutex<HashMap<String, String>>,
    /// Back into our own scan queue, for the staleness guard.
    scan_tx: mpsc::Sender<ScanRequest>,
    stop: CancellationToken,
}

/// Read-write folder service: scans on a timer, pulls the folder toward
/// the global state whenever remote indexes advance.
pub struct RwFolder {
    shared: Arc<RwShared>,
    tracker: StateTracker,
    scan_rx: mpsc::Receiver<ScanRequest>,
    delay_rx: mpsc::Receiver<Duration>,
    remote_rx: mpsc::Receiver<()>,
}

impl RwFolder {
    pub fn new(
        cfg: FolderConfig,
        ctx: Arc<SyncContext>,
        versioner: Option<Arc<dyn Versioner>>,
    ) -> (Self, FolderHandle) {
        let (scan_tx, scan_rx) = mpsc::channel(SCAN_QUEUE_DEPTH);
        let (delay_tx, delay_rx) = mpsc::channel(SCAN_QUEUE_DEPTH);
        // 1-buffered so a notification queues while we are mid-pull, but
        // no more than one; further notifications coalesce.
        let (remote_tx, remote_rx) = mpsc::channel(1);
        let stop = CancellationToken::new();
        let queue = Arc::new(JobQueue::new());
        let matcher = Arc::new(IgnoreMatcher::new(&cfg.ignore_patterns));
        let tracker = StateTracker::new(&cfg.id, Arc::clone(&ctx.bus));

        let handle = FolderHandle::new(
            &cfg.id,
            scan_tx.clone(),
            delay_tx,
            remote_tx,
            stop.clone(),
            Arc::clone(&queue),
        );
        let shared = Arc::new(RwShared {
            cfg,
            ctx,
            matcher,
            versioner,
            queue,
            errors: Mutex::new(HashMap::new()),
            scan_tx,
            stop,
        });
        (
            Self {
                shared,
                tracker,
                scan_rx,
                delay_rx,
                remote_rx,
            },
            handle,
        )
    }

    pub async fn serve(mut self) {
        let shared = Arc::clone(&self.shared);
        let folder = shared.cfg.id.clone();
        tracing::debug!(%folder, "rw folder starting");

        let mut prev_ver: i64 = 0;
        let mut prev_ignore_hash = String::new();
        // We don't start pulling until a scan has completed.
        let mut initial_scan_completed = false;

        let scan_timer = tokio::time::sleep(Duration::from_millis(1));
        tokio::pin!(scan_timer);
        let pull_timer = tokio::time::sleep(Duration::from_secs(1));
        tokio::pin!(pull_timer);

        loop {
            tokio::select! {
                _ = shared.stop.cancelled() => break,

                Some(()) = self.remote_rx.recv() => {
                    prev_ver = 0;
                    pull_timer.as_mut().reset(Instant::now());
                    tracing::debug!(%folder, "remote index updated, rescheduling pull");
                }

                _ = &mut pull_timer => {
                    if !initial_scan_completed {
                        tracing::debug!(%folder, "skip pull (initial scan pending)");
                        pull_timer.as_mut().reset(Instant::now() + shared.cfg.sleep());
                        continue;
                    }

                    if shared.matcher.hash() != prev_ignore_hash {
                        // Ignore patterns changed; files we used to skip
                        // may be needed now.
                        tracing::debug!(%folder, "ignore patterns changed, resetting prev version");
                        prev_ver = 0;
                        prev_ignore_hash = shared.matcher.hash().to_string();
                    }

                    let mut cur_ver = match shared
                        .ctx
                        .store
                        .remote_local_version(&folder, &shared.ctx.device_id)
                        .await
                    {
                        Ok(v) => v,
                        Err(err) => {
                            tracing::warn!(%folder, "remote version lookup failed: {err}");
                            pull_timer.as_mut().reset(Instant::now() + shared.cfg.sleep());
                            continue;
                        }
                    };
                    if cur_ver == prev_ver {
                        tracing::debug!(%folder, cur_ver, "skip pull (no remote change)");
                        pull_timer.as_mut().reset(Instant::now() + shared.cfg.sleep());
                        continue;
                    }
                    if let Err(err) = check_folder_health(&shared.cfg) {
                        tracing::info!(%folder, "skipping pull due to folder error: {err}");
                        pull_timer.as_mut().reset(Instant::now() + shared.cfg.sleep());
                        continue;
                    }

                    tracing::debug!(%folder, prev_ver, cur_ver, "pulling");
                    self.tracker.set_state(FolderState::Syncing);
                    shared.clear_errors();
                    let mut tries = 0usize;
                    loop {
                        tries += 1;
                        let changed = Arc::clone(&shared).puller_iteration().await;
                        tracing::debug!(%folder, changed, "iteration done");

                        if changed == 0 {
                            // In sync. A device may have disconnected mid
                            // iteration taking its records with it, so the
                            // ticker can have moved backwards; don't let
                            // prev_ver get ahead of it.
                            if let Ok(lv) = shared
                                .ctx
                                .store
                                .remote_local_version(&folder, &shared.ctx.device_id)
                                .await
                                && lv < cur_ver
                            {
                                cur_ver = lv;
                            }
                            prev_ver = cur_ver;
                            pull_timer.as_mut().reset(Instant::now() + shared.cfg.sleep());
                            break;
                        }

                        if tries > MAX_PULL_ATTEMPTS {
                            // Not making progress, probably write errors.
                            // Publish what we know and back off.
                            tracing::warn!(
                                %folder,
                                "folder isn't making progress, pausing puller for {:?}",
                                shared.cfg.pause()
                            );
                            let errors = shared.current_errors();
                            if !errors.is_empty() {
                                shared.ctx.bus.log(
                                    EventType::FolderErrors,
                                    json!({"folder": folder, "errors": errors}),
                                );
                            }
                            pull_timer.as_mut().reset(Instant::now() + shared.cfg.pause());
                            break;
                        }
                    }
                    self.tracker.set_state(FolderState::Idle);
                }

                _ = &mut scan_timer => {
                    if self.scan_once(Vec::new()).await.is_ok() && !initial_scan_completed {
                        tracing::info!(%folder, "completed initial scan (rw)");
                        initial_scan_completed = true;
                    }
                    scan_timer.as_mut().reset(next_scan(shared.cfg.rescan_interval_s));
                }

                Some(req) = self.scan_rx.recv() => {
                    let result = self.scan_once(req.subdirs).await;
                    if let Some(reply) = req.reply {
                        let _ = reply.send(result.map(|_| ()));
                    }
                }

                Some(next) = self.delay_rx.recv() => {
                    scan_timer.as_mut().reset(Instant::now() + next);
                }
            }
        }

        self.tracker.set_state(FolderState::Idle);
        tracing::debug!(%folder, "rw folder exiting");
    }

    async fn scan_once(
        &self,
        subdirs: Vec<String>,
    ) -> Result<usize, super::scanner::ScanError> {
        let shared = &self.shared;
        self.tracker.set_state(FolderState::Scanning);
        match scan_folder_subdirs(&shared.ctx, &shared.cfg, &shared.matcher, subdirs).await {
            Ok(count) => {
                self.tracker.set_state(FolderState::Idle);
                Ok(count)
            }
            Err(err) => {
                tracing::warn!(folder = %shared.cfg.id, "scan failed: {err}");
                self.tracker.set_error(&err.to_string());
                Err(err)
            }
        }
    }
}

impl RwShared {
    /// Whether to skip permission handling for this file: configured for
    /// the folder, or flagged on the record itself.
    fn ignore_permissions(&self, file: &FileInfo) -> bool {
        self.cfg.ignore_perms || file.has_no_permissions()
    }

    /// Record a per-file error. The first report per path wins; it is
    /// usually closest to the root cause.
    fn new_error(&self, path: &str, message: &str) {
        let mut errors = self.errors.lock().expect("error ledger mutex poisoned");
        errors
            .entry(path.to_string())
            .or_insert_with(|| message.to_string());
    }

    fn clear_errors(&self) {
        self.errors
            .lock()
            .expect("error ledger mutex poisoned")
            .clear();
    }

    pub(crate) fn current_errors(&self) -> Vec<FileError> {
        let errors = self.errors.lock().expect("error ledger mutex poisoned");
        let mut out: Vec<FileError> = errors
            .iter()
            .map(|(path, error)| FileError {
                path: path.clone(),
                error: error.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.path.cmp(&b.path));
        out
    }

    fn item_started(&self, item: &str, item_type: &str, action: &str) {
        self.ctx.bus.log(
            EventType::ItemStarted,
            json!({
                "folder": self.cfg.id,
                "item": item,
                "type": item_type,
                "action": action,
            }),
        );
    }

    fn item_finished(&self, item: &str, item_type: &str, action: &str, err: Option<&str>) {
        self.ctx.bus.log(
            EventType::ItemFinished,
            json!({
                "folder": self.cfg.id,
                "item": item,
                "type": item_type,
                "action": action,
                "error": error_payload(err),
            }),
        );
    }

    fn request_rescan(&self, name: &str) {
        // Repeated requests for the same name are fine; rescanning an
        // unchanged file is cheap.
        let _ = self.scan_tx.try_send(ScanRequest {
            subdirs: vec![name.to_string()],
            reply: None,
        });
    }
}

async fn recv_shared<T>(rx: &AsyncMutex<mpsc::Receiver<T>>) -> Option<T> {
    rx.lock().await.recv().await
}

fn mtime_secs(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

include!("puller_impl_iteration.rs");
include!("puller_impl_ops.rs");

#[cfg(test)]
#[path = "puller_tests/mod.rs"]
mod tests;
