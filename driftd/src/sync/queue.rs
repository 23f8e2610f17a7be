use std::sync::Mutex;

use rand::seq::SliceRandom;

#[derive(Debug, Clone)]
struct Job {
    name: String,
    size: u64,
    modified: i64,
}

#[derive(Debug, Default)]
struct Inner {
    progress: Vec<String>,
    queued: Vec<Job>,
}

/// Ordered set of files waiting to be pulled. `pop` and `done` are
/// decoupled so progress reporting can tell in-flight from not-started.
/// Reordering is applied once, after enumeration and before draining.
#[derive(Debug, Default)]
pub struct JobQueue {
    inner: Mutex<Inner>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, name: &str, size: u64, modified: i64) {
        let mut inner = self.inner.lock().expect("queue mutex poisoned");
        inner.queued.push(Job {
            name: name.to_string(),
            size,
            modified,
        });
    }

    /// Take the next name and mark it in progress.
    pub fn pop(&self) -> Option<String> {
        let mut inner = self.inner.lock().expect("queue mutex poisoned");
        if inner.queued.is_empty() {
            return None;
        }
        let job = inner.queued.remove(0);
        inner.progress.push(job.name.clone());
        Some(job.name)
    }

    pub fn bring_to_front(&self, name: &str) {
        let mut inner = self.inner.lock().expect("queue mutex poisoned");
        if let Some(pos) = inner.queued.iter().position(|j| j.name == name) {
            let job = inner.queued.remove(pos);
            inner.queued.insert(0, job);
        }
    }

    pub fn done(&self, name: &str) {
        let mut inner = self.inner.lock().expect("queue mutex poisoned");
        if let Some(pos) = inner.progress.iter().position(|n| n == name) {
            inner.progress.remove(pos);
        }
    }

    /// Snapshot of (in progress, queued) names.
    pub fn jobs(&self) -> (Vec<String>, Vec<String>) {
        let inner = self.inner.lock().expect("queue mutex poisoned");
        (
            inner.progress.clone(),
            inner.queued.iter().map(|j| j.name.clone()).collect(),
        )
    }

    pub fn len_queued(&self) -> usize {
        self.inner.lock().expect("queue mutex poisoned").queued.len()
    }

    pub fn shuffle(&self) {
        let mut inner = self.inner.lock().expect("queue mutex poisoned");
        inner.queued.shuffle(&mut rand::thread_rng());
    }

    pub fn sort_alphabetic(&self) {
        let mut inner = self.inner.lock().expect("queue mutex poisoned");
        inner.queued.sort_by(|a, b| a.name.cmp(&b.name));
    }

    pub fn sort_smallest_first(&self) {
        let mut inner = self.inner.lock().expect("queue mutex poisoned");
        inner.queued.sort_by_key(|j| j.size);
    }

    pub fn sort_largest_first(&self) {
        let mut inner = self.inner.lock().expect("queue mutex poisoned");
        inner.queued.sort_by_key(|j| std::cmp::Reverse(j.size));
    }

    pub fn sort_oldest_first(&self) {
        let mut inner = self.inner.lock().expect("queue mutex poisoned");
        inner.queued.sort_by_key(|j| j.modified);
    }

    pub fn sort_newest_first(&self) {
        let mut inner = self.inner.lock().expect("queue mutex poisoned");
        inner.queued.sort_by_key(|j| std::cmp::Reverse(j.modified));
    }
}
