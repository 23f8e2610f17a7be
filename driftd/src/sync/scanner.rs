use std::collections::{HashMap, HashSet};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::UNIX_EPOCH;

use drift_core::{
    FLAG_NO_PERMS, FileInfo, FileKind, PERM_MASK, ShortId, Vector, blocks, blocks_equal,
};
use thiserror::Error;

use super::ignore::IgnoreMatcher;
use super::index::IndexError;
use super::paths::{PathError, is_temporary, real_path_for};
use super::versioner::VERSIONS_DIR;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("index error: {0}")]
    Index(#[from] IndexError),
    #[error("folder is unhealthy: {0}")]
    Unhealthy(String),
    #[error("folder has stopped")]
    Stopped,
}

/// Walks the local tree (or the given subpaths) and produces the index
/// updates it implies: new records for created or changed entries,
/// deletion records for vanished ones. Directory records come before
/// their children. Unchanged entries produce nothing.
pub fn scan_folder(
    root: &Path,
    subdirs: &[String],
    current: &[FileInfo],
    mtimes: &HashMap<String, (i64, i64)>,
    matcher: &IgnoreMatcher,
    short_id: ShortId,
    ignore_perms: bool,
) -> Result<Vec<FileInfo>, ScanError> {
    let mut scan = Scan {
        root,
        current: current.iter().map(|f| (f.name.as_str(), f)).collect(),
        mtimes,
        matcher,
        short_id,
        ignore_perms,
        seen: HashSet::new(),
        out: Vec::new(),
    };

    if subdirs.is_empty() {
        scan.walk_dir(root, "")?;
    } else {
        for sub in subdirs {
            let rel = sub.trim_end_matches('/');
            if rel.is_empty() {
                scan.walk_dir(root, "")?;
                continue;
            }
            let abs = real_path_for(root, rel)?;
            match std::fs::symlink_metadata(&abs) {
                Ok(meta) => scan.visit(rel, &abs, &meta)?,
                // Vanished; the deletion sweep below picks it up.
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
    }

    scan.sweep_deletions(subdirs);
    Ok(scan.out)
}

struct Scan<'a> {
    root: &'a Path,
    current: HashMap<&'a str, &'a FileInfo>,
    mtimes: &'a HashMap<String, (i64, i64)>,
    matcher: &'a IgnoreMatcher,
    short_id: ShortId,
    ignore_perms: bool,
    seen: HashSet<String>,
    out: Vec<FileInfo>,
}

impl Scan<'_> {
    fn walk_dir(&mut self, abs: &Path, prefix: &str) -> Result<(), ScanError> {
        let mut entries: Vec<(String, std::path::PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(abs)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            entries.push((name, entry.path()));
        }
        entries.sort();

        for (name, path) in entries {
            if is_temporary(&name) {
                continue;
            }
            if prefix.is_empty() && name == VERSIONS_DIR {
                continue;
            }
            let rel = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}/{name}")
            };
            if self.matcher.match_name(&rel).is_ignored() {
                continue;
            }
            let meta = match std::fs::symlink_metadata(&path) {
                Ok(meta) => meta,
                // Raced with a concurrent delete; skip and let the next
                // scan sort it out.
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            self.visit(&rel, &path, &meta)?;
        }
        Ok(())
    }

    fn visit(&mut self, rel: &str, abs: &Path, meta: &std::fs::Metadata) -> Result<(), ScanError> {
        if meta.file_type().is_symlink() {
            self.visit_symlink(rel, abs, meta)
        } else if meta.is_dir() {
            self.visit_dir(rel, meta)?;
            self.walk_dir(abs, rel)
        } else {
            self.visit_file(rel, abs, meta)
        }
    }

    fn visit_dir(&mut self, rel: &str, meta: &std::fs::Metadata) -> Result<(), ScanError> {
        self.seen.insert(rel.to_string());
        let mode = meta.permissions().mode() & PERM_MASK;
        let cur = self.current.get(rel).copied();

        if let Some(cur) = cur
            && cur.kind == FileKind::Directory
            && !cur.deleted
            && self.perms_unchanged(cur, mode)
        {
            return Ok(());
        }

        self.out.push(FileInfo {
            name: rel.to_string(),
            kind: FileKind::Directory,
            flags: self.flags_for(mode),
            modified: mtime_secs(meta),
            size: 0,
            deleted: false,
            invalid: false,
            version: self.next_version(cur),
            local_version: 0,
            blocks: Vec::new(),
        });
        Ok(())
    }

    fn visit_file(&mut self, rel: &str, abs: &Path, meta: &std::fs::Metadata) -> Result<(), ScanError> {
        self.seen.insert(rel.to_string());
        let mode = meta.permissions().mode() & PERM_MASK;
        let observed = mtime_secs(meta);
        let modified = match self.mtimes.get(rel) {
            Some(&(recorded, intended)) if recorded == observed => intended,
            _ => observed,
        };
        let cur = self.current.get(rel).copied();

        if let Some(cur) = cur
            && cur.kind == FileKind::File
            && !cur.deleted
            && cur.modified == modified
            && cur.size == meta.len()
            && self.perms_unchanged(cur, mode)
        {
            return Ok(());
        }

        let blocks = blocks::hash_file(abs)?;
        self.out.push(FileInfo {
            name: rel.to_string(),
            kind: FileKind::File,
            flags: self.flags_for(mode),
            modified,
            size: meta.len(),
            deleted: false,
            invalid: false,
            version: self.next_version(cur),
            local_version: 0,
            blocks,
        });
        Ok(())
    }

    fn visit_symlink(
        &mut self,
        rel: &str,
        abs: &Path,
        meta: &std::fs::Metadata,
    ) -> Result<(), ScanError> {
        self.seen.insert(rel.to_string());
        let target = std::fs::read_link(abs)?;
        let content = target.to_string_lossy().into_owned();
        let link_blocks = blocks::hash_bytes(content.as_bytes());
        let cur = self.current.get(rel).copied();

        if let Some(cur) = cur
            && cur.kind == FileKind::Symlink
            && !cur.deleted
            && blocks_equal(&cur.blocks, &link_blocks)
        {
            return Ok(());
        }

        self.out.push(FileInfo {
            name: rel.to_string(),
            kind: FileKind::Symlink,
            flags: FLAG_NO_PERMS,
            modified: mtime_secs(meta),
            size: content.len() as u64,
            deleted: false,
            invalid: false,
            version: self.next_version(cur),
            local_version: 0,
            blocks: link_blocks,
        });
        Ok(())
    }

    fn sweep_deletions(&mut self, subdirs: &[String]) {
        let mut gone: Vec<&FileInfo> = Vec::new();
        for (&name, &cur) in &self.current {
            if cur.deleted || cur.invalid {
                continue;
            }
            if !in_scope(subdirs, name) || self.seen.contains(name) {
                continue;
            }
            if self.matcher.match_name(name).is_ignored() {
                continue;
            }
            gone.push(cur);
        }
        gone.sort_by(|a, b| a.name.cmp(&b.name));

        for cur in gone {
            self.out.push(FileInfo {
                name: cur.name.clone(),
                kind: cur.kind,
                flags: cur.flags,
                modified: cur.modified,
                size: 0,
                deleted: true,
                invalid: false,
                version: cur.version.clone().updated(self.short_id),
                local_version: 0,
                blocks: Vec::new(),
            });
        }
    }

    fn perms_unchanged(&self, cur: &FileInfo, mode: u32) -> bool {
        self.ignore_perms || cur.has_no_permissions() || cur.mode() == mode
    }

    fn flags_for(&self, mode: u32) -> u32 {
        if self.ignore_perms {
            0o777 | FLAG_NO_PERMS
        } else {
            mode
        }
    }

    fn next_version(&self, cur: Option<&FileInfo>) -> Vector {
        cur.map(|c| c.version.clone())
            .unwrap_or_default()
            .updated(self.short_id)
    }
}

fn in_scope(subdirs: &[String], name: &str) -> bool {
    if subdirs.is_empty() {
        return true;
    }
    subdirs.iter().any(|sub| {
        let sub = sub.trim_end_matches('/');
        name == sub || name.starts_with(&format!("{sub}/"))
    })
}

fn mtime_secs(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use drift_core::DeviceId;

    fn short() -> ShortId {
        DeviceId::new("scanner-test").short_id()
    }

    fn empty_matcher() -> IgnoreMatcher {
        IgnoreMatcher::new(&[])
    }

    fn scan(root: &Path, current: &[FileInfo]) -> Vec<FileInfo> {
        scan_folder(
            root,
            &[],
            current,
            &HashMap::new(),
            &empty_matcher(),
            short(),
            false,
        )
        .unwrap()
    }

    #[test]
    fn emits_directories_before_their_children() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("docs/sub")).unwrap();
        std::fs::write(dir.path().join("docs/sub/a.txt"), b"hello").unwrap();

        let out = scan(dir.path(), &[]);
        let names: Vec<_> = out.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["docs", "docs/sub", "docs/sub/a.txt"]);
        assert_eq!(out[0].kind, FileKind::Directory);
        assert_eq!(out[2].kind, FileKind::File);
        assert_eq!(out[2].size, 5);
        assert_eq!(out[2].blocks.len(), 1);
        assert_eq!(out[2].version.counter(short()), 1);
    }

    #[test]
    fn rescan_of_unchanged_tree_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();

        let first = scan(dir.path(), &[]);
        assert_eq!(first.len(), 1);
        let second = scan(dir.path(), &first);
        assert!(second.is_empty());
    }

    #[test]
    fn changed_content_bumps_the_version() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"one").unwrap();
        let first = scan(dir.path(), &[]);

        std::fs::write(&file, b"two longer content").unwrap();
        // Force a visible mtime difference regardless of clock granularity.
        crate::sync::osutil::set_mtime(&file, 2_000_000_000).unwrap();

        let second = scan(dir.path(), &first);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].version.counter(short()), 2);
        assert_eq!(second[0].size, 18);
    }

    #[test]
    fn vanished_entries_become_deletions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"x").unwrap();
        let first = scan(dir.path(), &[]);

        std::fs::remove_file(dir.path().join("a.txt")).unwrap();
        let second = scan(dir.path(), &first);
        assert_eq!(second.len(), 1);
        assert!(second[0].deleted);
        assert!(second[0].blocks.is_empty());
        assert_eq!(second[0].version.counter(short()), 2);
    }

    #[test]
    fn subpath_scan_only_touches_its_scope() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("keep")).unwrap();
        std::fs::write(dir.path().join("keep/a.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("other.txt"), b"y").unwrap();
        let first = scan(dir.path(), &[]);

        std::fs::remove_file(dir.path().join("keep/a.txt")).unwrap();
        std::fs::remove_file(dir.path().join("other.txt")).unwrap();

        let out = scan_folder(
            dir.path(),
            &["keep".to_string()],
            &first,
            &HashMap::new(),
            &empty_matcher(),
            short(),
            false,
        )
        .unwrap();
        let names: Vec<_> = out.iter().map(|f| f.name.as_str()).collect();
        // other.txt is out of scope and keeps its record.
        assert_eq!(names, vec!["keep/a.txt"]);
        assert!(out[0].deleted);
    }

    #[test]
    fn ignored_and_temporary_names_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.log"), b"x").unwrap();
        std::fs::write(dir.path().join(".drift.a.txt.tmp"), b"x").unwrap();
        std::fs::write(dir.path().join("real.txt"), b"x").unwrap();

        let matcher = IgnoreMatcher::new(&["*.log".to_string()]);
        let out = scan_folder(
            dir.path(),
            &[],
            &[],
            &HashMap::new(),
            &matcher,
            short(),
            false,
        )
        .unwrap();
        let names: Vec<_> = out.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["real.txt"]);
    }

    #[test]
    fn symlinks_carry_their_target_as_content() {
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink("target.txt", dir.path().join("link")).unwrap();

        let out = scan(dir.path(), &[]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, FileKind::Symlink);
        assert_eq!(out[0].size, "target.txt".len() as u64);
        assert_eq!(out[0].blocks, blocks::hash_bytes(b"target.txt"));

        // Unchanged on rescan.
        assert!(scan(dir.path(), &out).is_empty());
    }

    #[test]
    fn virtual_mtime_override_suppresses_false_changes() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"hello").unwrap();
        crate::sync::osutil::set_mtime(&file, 1_500_000_000).unwrap();

        let first = scan(dir.path(), &[]);
        assert_eq!(first[0].modified, 1_500_000_000);

        // The index says the intended mtime is 1_600_000_000 although the
        // filesystem shows 1_500_000_000.
        let mut record = first[0].clone();
        record.modified = 1_600_000_000;
        let mut mtimes = HashMap::new();
        mtimes.insert("a.txt".to_string(), (1_500_000_000, 1_600_000_000));

        let out = scan_folder(
            dir.path(),
            &[],
            &[record],
            &mtimes,
            &empty_matcher(),
            short(),
            false,
        )
        .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn mode_changes_are_detected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"hello").unwrap();
        let first = scan(dir.path(), &[]);

        std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o600)).unwrap();
        let second = scan(dir.path(), &first);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].mode(), 0o600);
    }
}
