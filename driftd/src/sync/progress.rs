use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use super::puller_state::SharedPullerState;

/// Optional sink for UI progress. Registered when a file enters the
/// pipeline, deregistered when its state is finally closed.
pub trait ProgressSink: Send + Sync {
    fn register(&self, state: &Arc<SharedPullerState>);
    fn deregister(&self, state: &Arc<SharedPullerState>);
}

/// Tracks which (folder, name) pairs are currently in flight.
#[derive(Debug, Default)]
pub struct InFlightTracker {
    entries: Mutex<HashSet<(String, String)>>,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_flight(&self) -> Vec<(String, String)> {
        let mut out: Vec<_> = self
            .entries
            .lock()
            .expect("progress mutex poisoned")
            .iter()
            .cloned()
            .collect();
        out.sort();
        out
    }
}

impl ProgressSink for InFlightTracker {
    fn register(&self, state: &Arc<SharedPullerState>) {
        self.entries
            .lock()
            .expect("progress mutex poisoned")
            .insert((state.folder.clone(), state.file.name.clone()));
    }

    fn deregister(&self, state: &Arc<SharedPullerState>) {
        self.entries
            .lock()
            .expect("progress mutex poisoned")
            .remove(&(state.folder.clone(), state.file.name.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drift_core::{FileInfo, FileKind, Vector};

    fn state(name: &str) -> Arc<SharedPullerState> {
        Arc::new(SharedPullerState::new(
            FileInfo {
                name: name.into(),
                kind: FileKind::File,
                flags: 0,
                modified: 0,
                size: 0,
                deleted: false,
                invalid: false,
                version: Vector::new(),
                local_version: 0,
                blocks: Vec::new(),
            },
            "default".into(),
            std::path::PathBuf::new(),
            std::path::PathBuf::new(),
            0,
            0,
            Vec::new(),
            Vector::new(),
            false,
            false,
        ))
    }

    #[test]
    fn register_and_deregister() {
        let tracker = InFlightTracker::new();
        let a = state("a");
        let b = state("b");
        tracker.register(&a);
        tracker.register(&b);
        assert_eq!(tracker.in_flight().len(), 2);
        tracker.deregister(&a);
        assert_eq!(
            tracker.in_flight(),
            vec![("default".to_string(), "b".to_string())]
        );
    }
}
