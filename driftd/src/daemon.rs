use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use drift_core::DeviceId;
use serde::Deserialize;
use tokio::sync::mpsc;
use url::Url;

use crate::sync::activity::DeviceActivity;
use crate::sync::config::{FolderConfig, VersioningConfig};
use crate::sync::context::SyncContext;
use crate::sync::events::EventBus;
use crate::sync::folder::{FolderHandle, RoFolder};
use crate::sync::index::IndexStore;
use crate::sync::progress::InFlightTracker;
use crate::sync::puller::RwFolder;
use crate::sync::transfer::{HttpBlockSource, TransferConfig};
use crate::sync::versioner::{SimpleVersioner, Versioner};
use crate::sync::watcher::start_watcher;

const DEFAULT_REQUEST_CONCURRENCY: usize = 32;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub home: PathBuf,
    pub db_path: PathBuf,
    pub config_path: PathBuf,
    pub device_id: DeviceId,
    pub request_concurrency: usize,
    pub enable_watcher: bool,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = match std::env::var("DRIFT_HOME") {
            Ok(value) => PathBuf::from(value),
            Err(_) => {
                let mut path = dirs::data_dir().context("data directory is unavailable")?;
                path.push("drift");
                path
            }
        };
        let db_path = std::env::var("DRIFT_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join("index.db"));
        let config_path = std::env::var("DRIFT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join("config.json"));
        let device_id = DeviceId::new(
            std::env::var("DRIFT_DEVICE_ID").unwrap_or_else(|_| "drift-local".to_string()),
        );
        let request_concurrency = read_usize_env(
            "DRIFT_REQUEST_CONCURRENCY",
            DEFAULT_REQUEST_CONCURRENCY,
        );
        let enable_watcher = read_bool_env("DRIFT_ENABLE_WATCHER", true);

        Ok(Self {
            home,
            db_path,
            config_path,
            device_id,
            request_concurrency,
            enable_watcher,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerConfig {
    pub device: String,
    pub address: String,
}

/// The folder and peer tables, read from the JSON config file.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterConfig {
    pub folders: Vec<FolderConfig>,
    pub peers: Vec<PeerConfig>,
}

impl ClusterConfig {
    pub fn load(path: &PathBuf) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let cluster: ClusterConfig = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;
        Ok(cluster)
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    cluster: ClusterConfig,
    ctx: Arc<SyncContext>,
    received_rx: mpsc::UnboundedReceiver<(String, drift_core::FileInfo)>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.home)
            .await
            .with_context(|| format!("failed to create home at {}", config.home.display()))?;

        let cluster = ClusterConfig::load(&config.config_path)?;

        if let Some(parent) = config.db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let db_url = format!("sqlite://{}?mode=rwc", config.db_path.display());
        let store = IndexStore::new(&db_url)
            .await
            .context("failed to initialize index store")?;

        let source = HttpBlockSource::with_config(TransferConfig {
            request_concurrency: config.request_concurrency,
        });
        for peer in &cluster.peers {
            let address = Url::parse(&peer.address)
                .with_context(|| format!("invalid peer address for {}", peer.device))?;
            source.add_peer(DeviceId::new(peer.device.clone()), address);
        }

        let (received_tx, received_rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(SyncContext {
            device_id: config.device_id.clone(),
            store,
            bus: Arc::new(EventBus::new()),
            activity: DeviceActivity::new(),
            source: Arc::new(source),
            progress: Some(Arc::new(InFlightTracker::new())),
            folder_roots: std::sync::RwLock::new(HashMap::new()),
            received_tx,
        });
        for folder in &cluster.folders {
            ctx.register_folder(&folder.id, folder.path.clone());
        }

        Ok(Self {
            config,
            cluster,
            ctx,
            received_rx,
        })
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        tracing::info!(
            device = %self.config.device_id,
            folders = self.cluster.folders.len(),
            peers = self.cluster.peers.len(),
            "driftd started"
        );

        let mut handles: Vec<FolderHandle> = Vec::new();
        let mut tasks = Vec::new();
        // Kept alive for the lifetime of the daemon; dropping a watcher
        // silently stops its notifications.
        let mut watchers = Vec::new();

        for cfg in self.cluster.folders.clone() {
            tokio::fs::create_dir_all(&cfg.path).await.with_context(|| {
                format!("failed to create folder root at {}", cfg.path.display())
            })?;

            let handle = if cfg.read_only() {
                let (folder, handle) = RoFolder::new(cfg.clone(), Arc::clone(&self.ctx));
                tasks.push(tokio::spawn(folder.serve()));
                handle
            } else {
                let versioner = versioner_for(&cfg);
                let (folder, handle) =
                    RwFolder::new(cfg.clone(), Arc::clone(&self.ctx), versioner);
                tasks.push(tokio::spawn(folder.serve()));
                handle
            };

            if self.config.enable_watcher {
                match start_watcher(&cfg.path, handle.clone()) {
                    Ok((watcher, task)) => {
                        watchers.push(watcher);
                        tasks.push(task);
                    }
                    Err(err) => {
                        tracing::warn!(folder = %cfg.id, "failed to start watcher: {err}");
                    }
                }
            }
            handles.push(handle);
        }

        loop {
            tokio::select! {
                received = self.received_rx.recv() => {
                    if let Some((folder, file)) = received {
                        // A synced file landed; peers watching us will
                        // want to know about the index change.
                        tracing::debug!(%folder, item = %file.name, "received file");
                        self.ctx.bus.log(
                            crate::sync::events::EventType::RemoteIndexUpdated,
                            serde_json::json!({"folder": folder, "item": file.name}),
                        );
                    }
                }
                result = tokio::signal::ctrl_c() => {
                    result.context("failed to listen for shutdown signal")?;
                    tracing::info!("shutting down");
                    break;
                }
            }
        }

        for handle in &handles {
            handle.stop();
        }
        drop(watchers);
        for task in tasks {
            let _ = task.await;
        }
        Ok(())
    }

    pub fn context(&self) -> &Arc<SyncContext> {
        &self.ctx
    }
}

fn versioner_for(cfg: &FolderConfig) -> Option<Arc<dyn Versioner>> {
    cfg.versioning
        .as_ref()
        .map(|VersioningConfig { keep }| {
            Arc::new(SimpleVersioner::new(cfg.path.clone(), *keep)) as Arc<dyn Versioner>
        })
}

fn read_usize_env(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

fn read_bool_env(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(value.as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}
