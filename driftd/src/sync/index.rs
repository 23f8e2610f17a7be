use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use drift_core::{BLOCK_SIZE, BlockInfo, DeviceId, FileInfo, FileKind, Vector, VectorOrdering};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Row, SqlitePool, migrate::Migrator};
use thiserror::Error;

use super::activity::Availability;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored record is malformed: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Kind(#[from] drift_core::fileinfo::InvalidKind),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
}

/// Where a block with a known hash lives on local disk, as recorded by
/// the finder index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockLocation {
    pub folder: String,
    pub name: String,
    pub index: u32,
}

/// The per-folder index database: one `FileInfo` row per
/// (folder, device, name), the local block finder, per-device sequence
/// counters and the virtual-mtime side table. Shared by all folders;
/// every call is folder-scoped.
pub struct IndexStore {
    pool: SqlitePool,
    /// (folder, name) → device → block indices announced from the peer's
    /// in-progress temp file. In memory only; it is advisory and rebuilt
    /// from peer progress messages after a restart.
    temp_available: Mutex<HashMap<(String, String), HashMap<DeviceId, HashSet<u32>>>>,
}

include!("index_store_impl.rs");

/// The unique global record for a name: maximum by version across all
/// non-invalid records. Concurrent versions are resolved by newest
/// modification time, then by ascending device id, which every device
/// computes identically.
fn global_of(records: &[(DeviceId, FileInfo)]) -> Option<FileInfo> {
    let mut best: Option<&(DeviceId, FileInfo)> = None;
    for record in records {
        if record.1.invalid {
            continue;
        }
        match best {
            None => best = Some(record),
            Some(current) => {
                if record_wins(record, current) {
                    best = Some(record);
                }
            }
        }
    }
    best.map(|(_, file)| file.clone())
}

fn record_wins(a: &(DeviceId, FileInfo), b: &(DeviceId, FileInfo)) -> bool {
    match a.1.version.compare(&b.1.version) {
        VectorOrdering::Greater => true,
        VectorOrdering::Lesser => false,
        VectorOrdering::Equal => a.0 < b.0,
        VectorOrdering::Concurrent => {
            if a.1.modified != b.1.modified {
                a.1.modified > b.1.modified
            } else {
                a.0 < b.0
            }
        }
    }
}

fn block_index(block: &BlockInfo) -> u32 {
    (block.offset / BLOCK_SIZE as u64) as u32
}

fn default_db_path() -> Result<PathBuf, IndexError> {
    let mut path = dirs::data_dir().ok_or(IndexError::MissingDataDir)?;
    path.push("drift");
    path.push("index.db");
    Ok(path)
}

#[cfg(test)]
#[path = "index_tests.rs"]
mod tests;
