use std::path::{Component, Path, PathBuf};

use thiserror::Error;

const TEMP_PREFIX: &str = ".drift.";
const TEMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Error)]
pub enum PathError {
    #[error("name is empty")]
    Empty,
    #[error("name contains unsupported component")]
    UnsupportedComponent,
}

/// Map a folder-relative name ("docs/a.txt", forward slashes) to a path
/// under the folder root. Rejects anything that would escape the root.
pub fn real_path_for(root: &Path, name: &str) -> Result<PathBuf, PathError> {
    if name.is_empty() {
        return Err(PathError::Empty);
    }

    let mut out = root.to_path_buf();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => continue,
            Component::RootDir | Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent);
            }
        }
    }
    Ok(out)
}

/// The deterministic in-progress name for a target: a dotted prefix and a
/// `.tmp` suffix on the final path segment, beside the target.
pub fn temp_name(name: &str) -> String {
    match name.rsplit_once('/') {
        Some((dir, base)) => format!("{dir}/{TEMP_PREFIX}{base}{TEMP_SUFFIX}"),
        None => format!("{TEMP_PREFIX}{name}{TEMP_SUFFIX}"),
    }
}

pub fn temp_path_for(root: &Path, name: &str) -> Result<PathBuf, PathError> {
    real_path_for(root, &temp_name(name))
}

/// Whether a bare file name (no directories) is one of our temp files.
pub fn is_temporary(file_name: &str) -> bool {
    file_name.starts_with(TEMP_PREFIX) && file_name.ends_with(TEMP_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_name_under_root() {
        let mapped = real_path_for(Path::new("/folder"), "docs/a.txt").unwrap();
        assert_eq!(mapped, PathBuf::from("/folder/docs/a.txt"));
    }

    #[test]
    fn rejects_escaping_names() {
        assert!(matches!(
            real_path_for(Path::new("/folder"), "../secret"),
            Err(PathError::UnsupportedComponent)
        ));
        assert!(matches!(
            real_path_for(Path::new("/folder"), "/etc/passwd"),
            Err(PathError::UnsupportedComponent)
        ));
        assert!(matches!(
            real_path_for(Path::new("/folder"), ""),
            Err(PathError::Empty)
        ));
    }

    #[test]
    fn temp_name_sits_beside_target() {
        assert_eq!(temp_name("a.txt"), ".drift.a.txt.tmp");
        assert_eq!(temp_name("docs/a.txt"), "docs/.drift.a.txt.tmp");
    }

    #[test]
    fn recognizes_temporaries() {
        assert!(is_temporary(".drift.a.txt.tmp"));
        assert!(!is_temporary("a.txt"));
        assert!(!is_temporary(".drift.a.txt"));
    }
}
