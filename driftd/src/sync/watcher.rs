use std::path::Path;
use std::time::Duration;

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use super::folder::FolderHandle;
use super::paths::is_temporary;

/// How long to keep collecting notifications before nudging the folder.
/// Editors fire bursts of events; one scan per burst is enough.
const SETTLE: Duration = Duration::from_millis(500);

/// Watch a folder root and feed debounced subpath scan requests into the
/// folder service. Returns the watcher, which must be kept alive, and the
/// forwarding task.
pub fn start_watcher(
    root: &Path,
    handle: FolderHandle,
) -> notify::Result<(RecommendedWatcher, tokio::task::JoinHandle<()>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let root = root.to_path_buf();
    let watch_root = root.clone();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res {
            for name in changed_names(&watch_root, &event) {
                let _ = tx.send(name);
            }
        }
    })?;
    watcher.watch(&root, RecursiveMode::Recursive)?;

    let task = tokio::spawn(forward_events(rx, handle));
    Ok((watcher, task))
}

async fn forward_events(mut rx: mpsc::UnboundedReceiver<String>, handle: FolderHandle) {
    while let Some(first) = rx.recv().await {
        let mut subdirs = vec![first];
        // Drain the burst until it settles.
        loop {
            match tokio::time::timeout(SETTLE, rx.recv()).await {
                Ok(Some(name)) => {
                    if !subdirs.contains(&name) {
                        subdirs.push(name);
                    }
                }
                Ok(None) => {
                    handle.scan_background(subdirs);
                    return;
                }
                Err(_) => break,
            }
        }
        tracing::debug!(folder = handle.id(), changed = subdirs.len(), "watcher scan");
        handle.scan_background(subdirs);
    }
}

/// Map a native notification to folder-relative names, skipping our own
/// temp files and anything outside the root.
fn changed_names(root: &Path, event: &Event) -> Vec<String> {
    event
        .paths
        .iter()
        .filter_map(|path| relative_name(root, path))
        .collect()
}

fn relative_name(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    if rel.as_os_str().is_empty() {
        return None;
    }
    if let Some(file_name) = path.file_name()
        && is_temporary(&file_name.to_string_lossy())
    {
        return None;
    }
    Some(
        rel.components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::EventKind;
    use std::path::PathBuf;

    fn event(kind: EventKind, paths: Vec<PathBuf>) -> Event {
        Event {
            kind,
            paths,
            attrs: Default::default(),
        }
    }

    #[test]
    fn maps_paths_to_relative_names() {
        let root = Path::new("/folder");
        let ev = event(
            EventKind::Modify(notify::event::ModifyKind::Data(
                notify::event::DataChange::Any,
            )),
            vec![PathBuf::from("/folder/docs/a.txt")],
        );
        assert_eq!(changed_names(root, &ev), vec!["docs/a.txt"]);
    }

    #[test]
    fn skips_temp_files_and_foreign_paths() {
        let root = Path::new("/folder");
        let ev = event(
            EventKind::Create(notify::event::CreateKind::File),
            vec![
                PathBuf::from("/folder/.drift.a.txt.tmp"),
                PathBuf::from("/elsewhere/b.txt"),
                PathBuf::from("/folder/ok.txt"),
            ],
        );
        assert_eq!(changed_names(root, &ev), vec!["ok.txt"]);
    }

    #[test]
    fn root_itself_is_skipped() {
        let root = Path::new("/folder");
        let ev = event(
            EventKind::Modify(notify::event::ModifyKind::Any),
            vec![PathBuf::from("/folder")],
        );
        assert!(changed_names(root, &ev).is_empty());
    }
}
