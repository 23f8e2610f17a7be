use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::blocks;
use crate::vector::Vector;

/// Permission bits carried in [`FileInfo::flags`]: the classic low nine
/// plus setuid/setgid/sticky.
pub const PERM_MASK: u32 = 0o7777;

/// The record carries no meaningful permission bits; apply defaults and
/// skip chmod on the receiving side.
pub const FLAG_NO_PERMS: u32 = 1 << 31;

#[derive(Debug, Error)]
#[error("invalid file kind: {0}")]
pub struct InvalidKind(String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Directory,
    Symlink,
}

impl FileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::File => "file",
            FileKind::Directory => "dir",
            FileKind::Symlink => "symlink",
        }
    }

    pub fn parse(value: &str) -> Result<Self, InvalidKind> {
        match value {
            "file" => Ok(FileKind::File),
            "dir" => Ok(FileKind::Directory),
            "symlink" => Ok(FileKind::Symlink),
            other => Err(InvalidKind(other.to_string())),
        }
    }
}

/// One fixed-size chunk of file content, identified by its SHA-256.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub offset: u64,
    pub size: u32,
    pub hash: Vec<u8>,
}

impl BlockInfo {
    /// True iff the block is all zeroes, i.e. its hash is the hash of
    /// `size` zero bytes.
    pub fn is_empty(&self) -> bool {
        self.hash == blocks::zero_hash(self.size)
    }
}

/// The metadata record for one path in one folder at one device. This is
/// the unit exchanged in index messages and persisted in the index store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Folder-relative path, forward-slash separated.
    pub name: String,
    pub kind: FileKind,
    /// Permission bits plus [`FLAG_NO_PERMS`].
    pub flags: u32,
    /// Seconds since the epoch.
    pub modified: i64,
    pub size: u64,
    pub deleted: bool,
    /// Known but unusable (ignored, unavailable).
    pub invalid: bool,
    pub version: Vector,
    /// Per-device insertion sequence, assigned by the index store.
    pub local_version: i64,
    pub blocks: Vec<BlockInfo>,
}

impl FileInfo {
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid
    }

    pub fn is_directory(&self) -> bool {
        self.kind == FileKind::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == FileKind::Symlink
    }

    pub fn has_no_permissions(&self) -> bool {
        self.flags & FLAG_NO_PERMS != 0
    }

    pub fn mode(&self) -> u32 {
        self.flags & PERM_MASK
    }

    /// Total content size as described by the block list.
    pub fn block_size_total(&self) -> u64 {
        self.blocks.iter().map(|b| u64::from(b.size)).sum()
    }
}
