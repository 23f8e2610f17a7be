use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use drift_core::{BLOCK_SIZE, BlockInfo, FileInfo, Vector};

/// Bookkeeping shared between the copier, network puller and finisher for
/// one in-flight file. The temp file descriptor is opened lazily on first
/// need; copier and puller write disjoint offsets through it; the
/// finisher closes it exactly once.
pub struct SharedPullerState {
    pub file: FileInfo,
    pub folder: String,
    pub temp_name: PathBuf,
    pub real_name: PathBuf,
    /// The local record's version before this pull, for conflict
    /// detection at finish time.
    pub version: Vector,
    pub ignore_perms: bool,
    pub sparse: bool,
    inner: Mutex<Inner>,
}

struct Inner {
    fd: Option<Arc<File>>,
    err: Option<String>,
    copy_needed: usize,
    pull_needed: usize,
    copy_total: usize,
    reused: usize,
    copied_from_origin: usize,
    pulled: usize,
    available: Vec<u32>,
    closed: bool,
}

#[allow(clippy::too_many_arguments)]
impl SharedPullerState {
    pub fn new(
        file: FileInfo,
        folder: String,
        temp_name: PathBuf,
        real_name: PathBuf,
        blocks_needed: usize,
        reused: usize,
        available: Vec<u32>,
        version: Vector,
        ignore_perms: bool,
        sparse: bool,
    ) -> Self {
        Self {
            file,
            folder,
            temp_name,
            real_name,
            version,
            ignore_perms,
            sparse,
            inner: Mutex::new(Inner {
                fd: None,
                err: None,
                copy_needed: blocks_needed,
                pull_needed: 0,
                copy_total: blocks_needed,
                reused,
                copied_from_origin: 0,
                pulled: 0,
                available,
                closed: false,
            }),
        }
    }

    /// The temp file descriptor, opened on first call. When no blocks are
    /// being reused the file must not already exist; a stale temp was
    /// either probed into the reuse set or removed before we got here.
    pub fn temp_file(&self) -> io::Result<Arc<File>> {
        let mut inner = self.inner.lock().expect("puller state mutex poisoned");
        if let Some(fd) = &inner.fd {
            return Ok(Arc::clone(fd));
        }

        let mut options = OpenOptions::new();
        options.write(true).mode(0o644);
        if inner.reused == 0 {
            options.create_new(true);
        }
        match options.open(&self.temp_name) {
            Ok(fd) => {
                let fd = Arc::new(fd);
                inner.fd = Some(Arc::clone(&fd));
                Ok(fd)
            }
            Err(err) => {
                if inner.err.is_none() {
                    inner.err = Some(format!("temp file: {err}"));
                }
                Err(err)
            }
        }
    }

    /// Record a failure. The first error per file wins; it is usually
    /// closest to the root cause.
    pub fn fail(&self, context: &str, err: impl std::fmt::Display) {
        let mut inner = self.inner.lock().expect("puller state mutex poisoned");
        if inner.err.is_none() {
            inner.err = Some(format!("{context}: {err}"));
        }
    }

    pub fn failed(&self) -> Option<String> {
        self.inner
            .lock()
            .expect("puller state mutex poisoned")
            .err
            .clone()
    }

    pub fn copied_from_origin(&self) {
        let mut inner = self.inner.lock().expect("puller state mutex poisoned");
        inner.copied_from_origin += 1;
    }

    pub fn copy_done(&self, block: &BlockInfo) {
        let mut inner = self.inner.lock().expect("puller state mutex poisoned");
        inner.copy_needed -= 1;
        inner.available.push((block.offset / BLOCK_SIZE as u64) as u32);
    }

    pub fn pull_started(&self) {
        let mut inner = self.inner.lock().expect("puller state mutex poisoned");
        inner.copy_needed -= 1;
        inner.pull_needed += 1;
    }

    pub fn pull_done(&self, block: &BlockInfo) {
        let mut inner = self.inner.lock().expect("puller state mutex poisoned");
        inner.pull_needed -= 1;
        inner.pulled += 1;
        inner.available.push((block.offset / BLOCK_SIZE as u64) as u32);
    }

    /// Close out the state once every block is accounted for, or as soon
    /// as the file has failed. Returns `closed = true` exactly once.
    pub fn final_close(&self) -> (bool, Option<String>) {
        let mut inner = self.inner.lock().expect("puller state mutex poisoned");
        if inner.closed {
            return (false, None);
        }
        if inner.err.is_none() && (inner.copy_needed > 0 || inner.pull_needed > 0) {
            return (false, None);
        }
        inner.closed = true;
        // The file handle closes when the last clone drops; ours goes now.
        inner.fd = None;
        (true, inner.err.clone())
    }

    /// Block indices present in the temp file, reused ones included.
    pub fn available(&self) -> Vec<u32> {
        self.inner
            .lock()
            .expect("puller state mutex poisoned")
            .available
            .clone()
    }

    pub fn counts(&self) -> PullerCounts {
        let inner = self.inner.lock().expect("puller state mutex poisoned");
        PullerCounts {
            copy_total: inner.copy_total,
            copy_needed: inner.copy_needed,
            reused: inner.reused,
            copied_from_origin: inner.copied_from_origin,
            pulled: inner.pulled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullerCounts {
    pub copy_total: usize,
    pub copy_needed: usize,
    pub reused: usize,
    pub copied_from_origin: usize,
    pub pulled: usize,
}
