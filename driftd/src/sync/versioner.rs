use std::io;
use std::path::{Path, PathBuf};

use time::OffsetDateTime;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;

pub const VERSIONS_DIR: &str = ".drift-versions";

const STAMP_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year][month][day]-[hour][minute][second]");

/// Moves replaced or deleted files into a versioned store instead of
/// discarding them. Archiving a path that no longer exists is not an
/// error.
pub trait Versioner: Send + Sync {
    fn archive(&self, path: &Path) -> io::Result<()>;
}

/// Keeps the newest `keep` copies of each file under
/// `<root>/.drift-versions/`, mirroring the folder layout, with a
/// timestamp suffix per copy.
pub struct SimpleVersioner {
    root: PathBuf,
    keep: usize,
}

impl SimpleVersioner {
    pub fn new(root: PathBuf, keep: usize) -> Self {
        Self {
            root,
            keep: keep.max(1),
        }
    }
}

impl Versioner for SimpleVersioner {
    fn archive(&self, path: &Path) -> io::Result<()> {
        if !path.exists() {
            return Ok(());
        }
        let rel = path
            .strip_prefix(&self.root)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path outside folder root"))?;

        let dest_dir = match rel.parent() {
            Some(parent) if parent != Path::new("") => {
                self.root.join(VERSIONS_DIR).join(parent)
            }
            _ => self.root.join(VERSIONS_DIR),
        };
        std::fs::create_dir_all(&dest_dir)?;

        let file_name = rel
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
        let stamp = OffsetDateTime::now_utc()
            .format(&STAMP_FORMAT)
            .map_err(io::Error::other)?;
        std::fs::rename(path, dest_dir.join(format!("{file_name}~{stamp}")))?;

        self.prune(&dest_dir, &file_name)
    }
}

impl SimpleVersioner {
    fn prune(&self, dest_dir: &Path, file_name: &str) -> io::Result<()> {
        let prefix = format!("{file_name}~");
        let mut versions: Vec<PathBuf> = Vec::new();
        for entry in std::fs::read_dir(dest_dir)? {
            let entry = entry?;
            if entry
                .file_name()
                .to_string_lossy()
                .starts_with(&prefix)
            {
                versions.push(entry.path());
            }
        }
        versions.sort();
        versions.reverse();
        for extra in versions.iter().skip(self.keep) {
            if let Err(err) = std::fs::remove_file(extra) {
                tracing::debug!(path = %extra.display(), "pruning old version: {err}");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archives_into_mirrored_tree() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("docs/a.txt");
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(&file, b"content").unwrap();

        let versioner = SimpleVersioner::new(dir.path().to_path_buf(), 5);
        versioner.archive(&file).unwrap();

        assert!(!file.exists());
        let versions_dir = dir.path().join(VERSIONS_DIR).join("docs");
        let entries: Vec<_> = std::fs::read_dir(&versions_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].starts_with("a.txt~"));
    }

    #[test]
    fn missing_source_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let versioner = SimpleVersioner::new(dir.path().to_path_buf(), 5);
        versioner.archive(&dir.path().join("gone.txt")).unwrap();
    }

    #[test]
    fn prunes_beyond_keep() {
        let dir = tempfile::tempdir().unwrap();
        let versioner = SimpleVersioner::new(dir.path().to_path_buf(), 1);
        let versions_dir = dir.path().join(VERSIONS_DIR);
        std::fs::create_dir_all(&versions_dir).unwrap();
        std::fs::write(versions_dir.join("a.txt~20000101-000000"), b"old").unwrap();
        std::fs::write(versions_dir.join("b.txt~20000101-000000"), b"other").unwrap();

        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"new").unwrap();
        versioner.archive(&file).unwrap();

        assert!(!versions_dir.join("a.txt~20000101-000000").exists());
        // Other files' versions are untouched.
        assert!(versions_dir.join("b.txt~20000101-000000").exists());
        let kept: Vec<_> = std::fs::read_dir(&versions_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with("a.txt~"))
            .collect();
        assert_eq!(kept.len(), 1);
    }
}
