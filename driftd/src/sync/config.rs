use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_COPIERS: usize = 1;
pub const DEFAULT_PULLERS: usize = 16;
pub const DEFAULT_PULLER_SLEEP_S: u64 = 10;
pub const DEFAULT_PULLER_PAUSE_S: u64 = 60;
pub const DEFAULT_RESCAN_INTERVAL_S: u32 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PullOrder {
    #[default]
    Random,
    Alphabetic,
    SmallestFirst,
    LargestFirst,
    OldestFirst,
    NewestFirst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FolderType {
    #[default]
    ReadWrite,
    ReadOnly,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersioningConfig {
    /// Newest copies kept per file.
    pub keep: usize,
}

/// Per-folder configuration as it appears in the cluster config file.
/// Zero values fall back to defaults through the accessors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FolderConfig {
    pub id: String,
    pub path: PathBuf,
    pub folder_type: FolderType,
    /// Seconds between periodic scans; 0 disables the timer and leaves
    /// only external triggers.
    pub rescan_interval_s: u32,
    pub puller_sleep_s: u64,
    pub puller_pause_s: u64,
    pub copiers: usize,
    pub pullers: usize,
    pub order: PullOrder,
    /// Conflict copies kept per file: negative keeps all, zero discards
    /// the losing side, positive caps the count.
    pub max_conflicts: i32,
    pub ignore_perms: bool,
    pub disable_sparse_files: bool,
    /// 0 disables the free-space check.
    pub min_disk_free_pct: f64,
    pub ignore_patterns: Vec<String>,
    pub versioning: Option<VersioningConfig>,
}

impl Default for FolderConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            path: PathBuf::new(),
            folder_type: FolderType::ReadWrite,
            rescan_interval_s: DEFAULT_RESCAN_INTERVAL_S,
            puller_sleep_s: 0,
            puller_pause_s: 0,
            copiers: 0,
            pullers: 0,
            order: PullOrder::Random,
            max_conflicts: -1,
            ignore_perms: false,
            disable_sparse_files: false,
            min_disk_free_pct: 0.0,
            ignore_patterns: Vec::new(),
            versioning: None,
        }
    }
}

impl FolderConfig {
    pub fn copiers(&self) -> usize {
        if self.copiers == 0 {
            DEFAULT_COPIERS
        } else {
            self.copiers
        }
    }

    pub fn pullers(&self) -> usize {
        if self.pullers == 0 {
            DEFAULT_PULLERS
        } else {
            self.pullers
        }
    }

    pub fn sleep(&self) -> Duration {
        if self.puller_sleep_s == 0 {
            Duration::from_secs(DEFAULT_PULLER_SLEEP_S)
        } else {
            Duration::from_secs(self.puller_sleep_s)
        }
    }

    pub fn pause(&self) -> Duration {
        if self.puller_pause_s == 0 {
            Duration::from_secs(DEFAULT_PULLER_PAUSE_S)
        } else {
            Duration::from_secs(self.puller_pause_s)
        }
    }

    pub fn allow_sparse(&self) -> bool {
        !self.disable_sparse_files
    }

    pub fn check_free_space(&self) -> bool {
        self.min_disk_free_pct != 0.0
    }

    pub fn read_only(&self) -> bool {
        self.folder_type == FolderType::ReadOnly
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_values_fall_back_to_defaults() {
        let cfg = FolderConfig::default();
        assert_eq!(cfg.copiers(), DEFAULT_COPIERS);
        assert_eq!(cfg.pullers(), DEFAULT_PULLERS);
        assert_eq!(cfg.sleep(), Duration::from_secs(DEFAULT_PULLER_SLEEP_S));
        assert_eq!(cfg.pause(), Duration::from_secs(DEFAULT_PULLER_PAUSE_S));
        assert!(cfg.allow_sparse());
        assert!(!cfg.check_free_space());
    }

    #[test]
    fn deserializes_with_partial_fields() {
        let cfg: FolderConfig = serde_json::from_str(
            r#"{"id": "docs", "path": "/tmp/docs", "order": "smallestFirst", "maxConflicts": 3}"#,
        )
        .unwrap();
        assert_eq!(cfg.id, "docs");
        assert_eq!(cfg.order, PullOrder::SmallestFirst);
        assert_eq!(cfg.max_conflicts, 3);
        assert_eq!(cfg.folder_type, FolderType::ReadWrite);
        assert_eq!(cfg.rescan_interval_s, DEFAULT_RESCAN_INTERVAL_S);
    }

    #[test]
    fn explicit_values_win() {
        let cfg = FolderConfig {
            copiers: 2,
            pullers: 4,
            puller_sleep_s: 1,
            puller_pause_s: 2,
            ..FolderConfig::default()
        };
        assert_eq!(cfg.copiers(), 2);
        assert_eq!(cfg.pullers(), 4);
        assert_eq!(cfg.sleep(), Duration::from_secs(1));
        assert_eq!(cfg.pause(), Duration::from_secs(2));
    }
}
