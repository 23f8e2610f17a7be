use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::config::FolderConfig;
use super::context::SyncContext;
use super::events::{EventBus, EventType};
use super::ignore::IgnoreMatcher;
use super::osutil;
use super::queue::JobQueue;
use super::scanner::{self, ScanError};

pub const SCAN_QUEUE_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FolderState {
    Idle,
    Scanning,
    Syncing,
    Error,
}

impl FolderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FolderState::Idle => "idle",
            FolderState::Scanning => "scanning",
            FolderState::Syncing => "syncing",
            FolderState::Error => "error",
        }
    }
}

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("folder path is missing: {0}")]
    Missing(PathBuf),
    #[error("folder path is not a directory: {0}")]
    NotADirectory(PathBuf),
    #[error("insufficient free space: {free:.2}% < {min:.2}%")]
    OutOfSpace { free: f64, min: f64 },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Tracks one folder's state and publishes transitions on the events bus.
pub struct StateTracker {
    folder_id: String,
    bus: Arc<EventBus>,
    state: Mutex<(FolderState, Option<String>)>,
}

impl StateTracker {
    pub fn new(folder_id: &str, bus: Arc<EventBus>) -> Self {
        Self {
            folder_id: folder_id.to_string(),
            bus,
            state: Mutex::new((FolderState::Idle, None)),
        }
    }

    pub fn state(&self) -> FolderState {
        self.state.lock().expect("state mutex poisoned").0
    }

    pub fn set_state(&self, to: FolderState) {
        let mut state = self.state.lock().expect("state mutex poisoned");
        if state.0 == to {
            return;
        }
        let from = state.0;
        *state = (to, None);
        self.bus.log(
            EventType::StateChanged,
            json!({
                "folder": self.folder_id,
                "from": from.as_str(),
                "to": to.as_str(),
            }),
        );
    }

    /// Error state is sticky until the next successful transition.
    pub fn set_error(&self, message: &str) {
        let mut state = self.state.lock().expect("state mutex poisoned");
        let from = state.0;
        *state = (FolderState::Error, Some(message.to_string()));
        self.bus.log(
            EventType::StateChanged,
            json!({
                "folder": self.folder_id,
                "from": from.as_str(),
                "to": FolderState::Error.as_str(),
                "error": message,
            }),
        );
    }
}

/// A scan order delivered to the folder service. Explicit requests carry
/// a reply channel; background rescans do not.
pub struct ScanRequest {
    pub subdirs: Vec<String>,
    pub reply: Option<oneshot::Sender<Result<(), ScanError>>>,
}

/// Control surface for a running folder service. All variants expose the
/// same operations; a read-only folder just has nothing queued.
#[derive(Clone)]
pub struct FolderHandle {
    folder_id: String,
    scan_tx: mpsc::Sender<ScanRequest>,
    delay_tx: mpsc::Sender<Duration>,
    remote_tx: mpsc::Sender<()>,
    stop: CancellationToken,
    queue: Arc<JobQueue>,
}

impl FolderHandle {
    pub(crate) fn new(
        folder_id: &str,
        scan_tx: mpsc::Sender<ScanRequest>,
        delay_tx: mpsc::Sender<Duration>,
        remote_tx: mpsc::Sender<()>,
        stop: CancellationToken,
        queue: Arc<JobQueue>,
    ) -> Self {
        Self {
            folder_id: folder_id.to_string(),
            scan_tx,
            delay_tx,
            remote_tx,
            stop,
            queue,
        }
    }

    pub fn id(&self) -> &str {
        &self.folder_id
    }

    /// Scan the given subpaths (everything when empty) and wait for the
    /// result.
    pub async fn scan(&self, subdirs: Vec<String>) -> Result<(), ScanError> {
        let (tx, rx) = oneshot::channel();
        self.scan_tx
            .send(ScanRequest {
                subdirs,
                reply: Some(tx),
            })
            .await
            .map_err(|_| ScanError::Stopped)?;
        rx.await.map_err(|_| ScanError::Stopped)?
    }

    /// Fire-and-forget scan used by the watcher and the staleness guard.
    /// Dropped when the queue is full; the scanner dedupes cheaply anyway.
    pub fn scan_background(&self, subdirs: Vec<String>) {
        let _ = self.scan_tx.try_send(ScanRequest {
            subdirs,
            reply: None,
        });
    }

    /// Defer the next periodic scan without cancelling it.
    pub fn delay_scan(&self, next: Duration) {
        let _ = self.delay_tx.try_send(next);
    }

    /// A remote index update arrived; re-evaluate needs soon. The slot is
    /// 1-buffered so notifications coalesce while a pull is running.
    pub fn index_updated(&self) {
        let _ = self.remote_tx.try_send(());
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn bring_to_front(&self, name: &str) {
        self.queue.bring_to_front(name);
    }

    /// (in progress, queued) names.
    pub fn jobs(&self) -> (Vec<String>, Vec<String>) {
        self.queue.jobs()
    }
}

/// Pre-flight check run before scans and pulls.
pub fn check_folder_health(cfg: &FolderConfig) -> Result<(), HealthError> {
    let meta = match std::fs::metadata(&cfg.path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(HealthError::Missing(cfg.path.clone()));
        }
        Err(err) => return Err(err.into()),
    };
    if !meta.is_dir() {
        return Err(HealthError::NotADirectory(cfg.path.clone()));
    }
    if cfg.check_free_space() {
        let free = osutil::disk_free_percentage(&cfg.path)?;
        if free < cfg.min_disk_free_pct {
            return Err(HealthError::OutOfSpace {
                free,
                min: cfg.min_disk_free_pct,
            });
        }
    }
    Ok(())
}

/// One scan pass: health check, walk on the blocking pool, index update.
/// Returns the number of changed records.
pub(crate) async fn scan_folder_subdirs(
    ctx: &Arc<SyncContext>,
    cfg: &FolderConfig,
    matcher: &Arc<IgnoreMatcher>,
    subdirs: Vec<String>,
) -> Result<usize, ScanError> {
    check_folder_health(cfg).map_err(|err| ScanError::Unhealthy(err.to_string()))?;

    let current = ctx.store.local_files(&cfg.id, &ctx.device_id).await?;
    let mtimes = ctx.store.virtual_mtimes(&cfg.id).await?;

    let root = cfg.path.clone();
    let matcher = Arc::clone(matcher);
    let short_id = ctx.device_id.short_id();
    let ignore_perms = cfg.ignore_perms;
    let updates = tokio::task::spawn_blocking(move || {
        scanner::scan_folder(
            &root,
            &subdirs,
            &current,
            &mtimes,
            &matcher,
            short_id,
            ignore_perms,
        )
    })
    .await
    .map_err(|err| ScanError::Io(io::Error::other(err)))??;

    let count = updates.len();
    if count > 0 {
        ctx.store
            .update_locals(&cfg.id, &ctx.device_id, &updates)
            .await?;
    }
    ctx.bus.log(
        EventType::LocalIndexUpdated,
        json!({"folder": cfg.id, "items": count}),
    );
    Ok(count)
}

/// Scan-only folder service: publishes the local tree and never pulls.
pub struct RoFolder {
    cfg: FolderConfig,
    ctx: Arc<SyncContext>,
    matcher: Arc<IgnoreMatcher>,
    tracker: StateTracker,
    scan_rx: mpsc::Receiver<ScanRequest>,
    delay_rx: mpsc::Receiver<Duration>,
    stop: CancellationToken,
}

impl RoFolder {
    pub fn new(cfg: FolderConfig, ctx: Arc<SyncContext>) -> (Self, FolderHandle) {
        let (scan_tx, scan_rx) = mpsc::channel(SCAN_QUEUE_DEPTH);
        let (delay_tx, delay_rx) = mpsc::channel(SCAN_QUEUE_DEPTH);
        // Read-only folders never pull; the nudge slot exists for handle
        // parity and is simply drained nowhere.
        let (remote_tx, _remote_rx) = mpsc::channel(1);
        let stop = CancellationToken::new();
        let matcher = Arc::new(IgnoreMatcher::new(&cfg.ignore_patterns));
        let tracker = StateTracker::new(&cfg.id, Arc::clone(&ctx.bus));
        let handle = FolderHandle::new(
            &cfg.id,
            scan_tx,
            delay_tx,
            remote_tx,
            stop.clone(),
            Arc::new(JobQueue::new()),
        );
        (
            Self {
                cfg,
                ctx,
                matcher,
                tracker,
                scan_rx,
                delay_rx,
                stop,
            },
            handle,
        )
    }

    pub async fn serve(mut self) {
        tracing::debug!(folder = %self.cfg.id, "ro folder starting");
        let mut initial_scan_completed = false;

        let scan_timer = tokio::time::sleep(Duration::from_millis(1));
        tokio::pin!(scan_timer);

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,

                _ = &mut scan_timer => {
                    if self.scan_once(Vec::new()).await.is_ok() && !initial_scan_completed {
                        tracing::info!(folder = %self.cfg.id, "completed initial scan (ro)");
                        initial_scan_completed = true;
                    }
                    scan_timer.as_mut().reset(next_scan(self.cfg.rescan_interval_s));
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
        tracing::debug!(folder = %self.cfg.id, "ro folder exiting");
    }

    async fn scan_once(&self, subdirs: Vec<String>) -> Result<usize, ScanError> {
        self.tracker.set_state(FolderState::Scanning);
        match scan_folder_subdirs(&self.ctx, &self.cfg, &self.matcher, subdirs).await {
            Ok(count) => {
                self.tracker.set_state(FolderState::Idle);
                Ok(count)
            }
            Err(err) => {
                tracing::warn!(folder = %self.cfg.id, "scan failed: {err}");
                self.tracker.set_error(&err.to_string());
                Err(err)
            }
        }
    }
}

/// The next periodic scan deadline; interval 0 disables the timer and
/// leaves only external triggers.
pub(crate) fn next_scan(interval_s: u32) -> Instant {
    if interval_s == 0 {
        Instant::now() + Duration::from_secs(86_400 * 365 * 30)
    } else {
        Instant::now() + Duration::from_secs(u64::from(interval_s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::activity::DeviceActivity;
    use crate::sync::index::IndexStore;
    use crate::sync::transfer::{BlockSource, RequestError};
    use drift_core::DeviceId;
    use sqlx::SqlitePool;

    struct NoSource;

    #[async_trait::async_trait]
    impl BlockSource for NoSource {
        async fn request(
            &self,
            _device: &DeviceId,
            _folder: &str,
            _name: &str,
            _offset: u64,
            _size: u32,
            _hash: &[u8],
            _from_temporary: bool,
        ) -> Result<Vec<u8>, RequestError> {
            Err(RequestError::ConcurrencyClosed)
        }
    }

    async fn context() -> Arc<SyncContext> {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = IndexStore::from_pool(pool);
        store.init().await.unwrap();
        let (received_tx, _received_rx) = mpsc::unbounded_channel();
        // The receiver is dropped; sends are best-effort in tests.
        Arc::new(SyncContext {
            device_id: DeviceId::new("local"),
            store,
            bus: Arc::new(EventBus::new()),
            activity: DeviceActivity::new(),
            source: Arc::new(NoSource),
            progress: None,
            folder_roots: std::sync::RwLock::new(std::collections::HashMap::new()),
            received_tx,
        })
    }

    #[test]
    fn health_check_flags_missing_and_non_directories() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = FolderConfig {
            id: "f".into(),
            path: dir.path().join("missing"),
            ..FolderConfig::default()
        };
        assert!(matches!(
            check_folder_health(&cfg),
            Err(HealthError::Missing(_))
        ));

        let file = dir.path().join("file");
        std::fs::write(&file, b"x").unwrap();
        cfg.path = file;
        assert!(matches!(
            check_folder_health(&cfg),
            Err(HealthError::NotADirectory(_))
        ));

        cfg.path = dir.path().to_path_buf();
        assert!(check_folder_health(&cfg).is_ok());
    }

    #[test]
    fn health_check_enforces_free_space() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = FolderConfig {
            id: "f".into(),
            path: dir.path().to_path_buf(),
            // No filesystem is more than 100% free.
            min_disk_free_pct: 101.0,
            ..FolderConfig::default()
        };
        assert!(matches!(
            check_folder_health(&cfg),
            Err(HealthError::OutOfSpace { .. })
        ));
    }

    #[tokio::test]
    async fn state_tracker_publishes_transitions() {
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe();
        let tracker = StateTracker::new("f", Arc::clone(&bus));

        tracker.set_state(FolderState::Scanning);
        // Same-state transitions are not published.
        tracker.set_state(FolderState::Scanning);
        tracker.set_error("boom");

        let first = rx.recv().await.unwrap();
        assert_eq!(first.data["from"], "idle");
        assert_eq!(first.data["to"], "scanning");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.data["to"], "error");
        assert_eq!(second.data["error"], "boom");
        assert_eq!(tracker.state(), FolderState::Error);
    }

    #[tokio::test]
    async fn ro_folder_scans_and_replies() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();

        let ctx = context().await;
        let cfg = FolderConfig {
            id: "ro".into(),
            path: dir.path().to_path_buf(),
            // Periodic timer off; we drive scans explicitly.
            rescan_interval_s: 0,
            ..FolderConfig::default()
        };
        let (folder, handle) = RoFolder::new(cfg, Arc::clone(&ctx));
        let task = tokio::spawn(folder.serve());

        handle.scan(Vec::new()).await.unwrap();
        let record = ctx
            .store
            .current_folder_file("ro", &ctx.device_id, "a.txt")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.size, 5);

        handle.stop();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn ro_folder_reports_unhealthy_scans() {
        let ctx = context().await;
        let cfg = FolderConfig {
            id: "ro".into(),
            path: PathBuf::from("/nonexistent/drift-test"),
            rescan_interval_s: 0,
            ..FolderConfig::default()
        };
        let (folder, handle) = RoFolder::new(cfg, Arc::clone(&ctx));
        let task = tokio::spawn(folder.serve());

        let err = handle.scan(Vec::new()).await.unwrap_err();
        assert!(matches!(err, ScanError::Unhealthy(_)));

        handle.stop();
        task.await.unwrap();
    }
}
