use std::io;
use std::path::{Path, PathBuf};

use drift_core::{ShortId, Vector};
use time::OffsetDateTime;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;

use super::osutil::remove_file_if_exists;

const CONFLICT_MARKER: &str = ".sync-conflict-";
const STAMP_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year][month][day]-[hour][minute][second]");

/// A replacement conflicts with the current file if the vectors are
/// concurrent, or if the replacement carries a higher counter for our own
/// id than we believe we published. Only we can increment our counter, so
/// the latter means our index was corrupted or lost; treating it as a
/// conflict avoids silent data loss.
pub fn in_conflict(current: &Vector, replacement: &Vector, self_id: ShortId) -> bool {
    if current.concurrent(replacement) {
        return true;
    }
    replacement.counter(self_id) > current.counter(self_id)
}

/// `<stem>.sync-conflict-YYYYMMDD-HHMMSS<ext>` for a bare file name.
fn conflict_file_name(file_name: &str, when: OffsetDateTime) -> io::Result<String> {
    let stamp = when.format(&STAMP_FORMAT).map_err(io::Error::other)?;
    match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => {
            Ok(format!("{stem}{CONFLICT_MARKER}{stamp}.{ext}"))
        }
        _ => Ok(format!("{file_name}{CONFLICT_MARKER}{stamp}")),
    }
}

fn is_conflict_copy_of(candidate: &str, stem: &str, ext: &str) -> bool {
    let Some(rest) = candidate.strip_prefix(stem) else {
        return false;
    };
    let Some(rest) = rest.strip_prefix(CONFLICT_MARKER) else {
        return false;
    };
    let Some(stamp) = rest.strip_suffix(ext) else {
        return false;
    };
    stamp.len() == 15
        && stamp.as_bytes()[8] == b'-'
        && stamp
            .chars()
            .enumerate()
            .all(|(i, c)| i == 8 || c.is_ascii_digit())
}

/// Move an existing file aside as a conflict copy instead of overwriting
/// it. `max_conflicts` < 0 keeps every copy, 0 discards the file, > 0
/// prunes the oldest copies beyond the cap. A missing source means the
/// conflict already resolved itself and is not an error.
pub fn move_for_conflict(path: &Path, max_conflicts: i32) -> io::Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    if file_name.contains(CONFLICT_MARKER) {
        // Conflicts on conflict copies are not preserved again.
        return remove_file_if_exists(path);
    }
    if max_conflicts == 0 {
        return remove_file_if_exists(path);
    }

    let new_name = conflict_file_name(&file_name, OffsetDateTime::now_utc())?;
    let new_path = path.with_file_name(&new_name);
    match std::fs::rename(path, &new_path) {
        Ok(()) => {}
        // Already moved away, or the conflict was remote-edit vs local
        // delete. Either way the slot is free.
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    }

    if max_conflicts > 0 {
        prune_conflicts(path, &file_name, max_conflicts as usize)?;
    }
    Ok(())
}

fn prune_conflicts(path: &Path, file_name: &str, keep: usize) -> io::Result<()> {
    let (stem, ext) = match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), format!(".{ext}")),
        _ => (file_name.to_string(), String::new()),
    };
    let parent = path.parent().unwrap_or(Path::new("."));

    let mut copies: Vec<PathBuf> = Vec::new();
    for entry in std::fs::read_dir(parent)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_conflict_copy_of(&name, &stem, &ext) {
            copies.push(entry.path());
        }
    }

    // Newest first; the timestamp sorts lexicographically.
    copies.sort();
    copies.reverse();
    for extra in copies.iter().skip(keep) {
        if let Err(err) = remove_file_if_exists(extra) {
            tracing::debug!(path = %extra.display(), "removing extra conflict copy: {err}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn v(counters: &[(u64, u64)]) -> Vector {
        let mut out = Vector::new();
        for &(id, n) in counters {
            for _ in 0..n {
                out.update(ShortId(id));
            }
        }
        out
    }

    #[test]
    fn concurrent_vectors_conflict() {
        assert!(in_conflict(&v(&[(1, 2)]), &v(&[(2, 2)]), ShortId(1)));
    }

    #[test]
    fn dominating_replacement_does_not_conflict() {
        assert!(!in_conflict(&v(&[(1, 1)]), &v(&[(1, 1), (2, 1)]), ShortId(1)));
    }

    #[test]
    fn higher_own_counter_in_replacement_conflicts() {
        // The replacement claims we published version 3, but we only know
        // of 1. Index corruption; flagged as conflict.
        assert!(in_conflict(&v(&[(1, 1)]), &v(&[(1, 3)]), ShortId(1)));
    }

    #[test]
    fn names_keep_the_extension() {
        let when = datetime!(2016-04-01 10:20:30 UTC);
        assert_eq!(
            conflict_file_name("a.txt", when).unwrap(),
            "a.sync-conflict-20160401-102030.txt"
        );
        assert_eq!(
            conflict_file_name("Makefile", when).unwrap(),
            "Makefile.sync-conflict-20160401-102030"
        );
        assert_eq!(
            conflict_file_name(".hidden", when).unwrap(),
            ".hidden.sync-conflict-20160401-102030"
        );
    }

    #[test]
    fn moves_file_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"old").unwrap();
        move_for_conflict(&path, -1).unwrap();
        assert!(!path.exists());
        let copies: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(copies.len(), 1);
        assert!(copies[0].starts_with("a.sync-conflict-"));
        assert!(copies[0].ends_with(".txt"));
    }

    #[test]
    fn zero_max_conflicts_discards() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"old").unwrap();
        move_for_conflict(&path, 0).unwrap();
        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn conflict_copies_are_not_conflicted_again() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.sync-conflict-20160401-102030.txt");
        std::fs::write(&path, b"old").unwrap();
        move_for_conflict(&path, -1).unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn missing_source_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        move_for_conflict(&dir.path().join("gone.txt"), -1).unwrap();
    }

    #[test]
    fn prunes_oldest_copies_beyond_cap() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("a.sync-conflict-20100101-000000.txt");
        let older = dir.path().join("a.sync-conflict-20000101-000000.txt");
        std::fs::write(&old, b"x").unwrap();
        std::fs::write(&older, b"x").unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"current").unwrap();

        move_for_conflict(&path, 1).unwrap();

        assert!(!old.exists());
        assert!(!older.exists());
        // Only the copy just created survives.
        let copies: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(copies.len(), 1);
    }

    #[test]
    fn unrelated_files_are_not_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let other = dir.path().join("ab.sync-conflict-20100101-000000.txt");
        std::fs::write(&other, b"x").unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"current").unwrap();

        move_for_conflict(&path, 1).unwrap();
        assert!(other.exists());
    }
}
