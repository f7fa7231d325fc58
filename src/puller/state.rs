/*!
 * SharedPullerState (spec §3, §4.4): the mutable per-file state threaded
 * through the copier, puller, and finisher stages for one in-flight file.
 *
 * Counters and the first-error slot are guarded by a single short-held
 * mutex (spec §9 design note); the temp file descriptor is created by
 * whichever stage calls `temp_file()` first (a one-shot initializer) and
 * handed out as a `dup`'d handle so concurrent non-overlapping `write_at`
 * calls need no further synchronization.
 */

use crate::error::{Result, SyncError};
use crate::model::FileRecord;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

struct Inner {
    temp_fd: Option<File>,
    copy_total: u64,
    copy_needed: u64,
    pull_total: u64,
    pull_needed: u64,
    reused: u64,
    copied_from_origin: u64,
    err: Option<Arc<SyncError>>,
    closed: bool,
}

pub struct SharedPullerState {
    pub file: FileRecord,
    pub folder: String,
    pub temp_name: PathBuf,
    pub real_name: PathBuf,
    inner: Mutex<Inner>,
}

impl SharedPullerState {
    pub fn new(
        file: FileRecord,
        folder: impl Into<String>,
        temp_name: PathBuf,
        real_name: PathBuf,
        copy_total: u64,
        reused: u64,
    ) -> Self {
        Self {
            file,
            folder: folder.into(),
            temp_name,
            real_name,
            inner: Mutex::new(Inner {
                temp_fd: None,
                copy_total,
                copy_needed: copy_total,
                pull_total: 0,
                pull_needed: 0,
                reused,
                copied_from_origin: 0,
                err: None,
                closed: false,
            }),
        }
    }

    /// Idempotent, concurrency-safe temp file access. The first caller
    /// creates the file (exclusively, unless blocks are being reused from
    /// an existing temp file); later callers get a `dup`'d handle to the
    /// same underlying file.
    pub fn temp_file(&self) -> Result<File> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = &inner.temp_fd {
            return existing.try_clone().map_err(|e| SyncError::io("temp file dup", e));
        }
        if let Some(err) = &inner.err {
            return Err(SyncError::Other(format!("temp file create failed: {err}")));
        }
        let reused = inner.reused;
        let mut opts = OpenOptions::new();
        opts.write(true);
        if reused == 0 {
            opts.create_new(true);
        } else {
            opts.create(true).truncate(false);
        }
        #[cfg(unix)]
        opts.mode(0o644);

        match opts.open(&self.temp_name) {
            Ok(f) => {
                let handle = f.try_clone().map_err(|e| SyncError::io("temp file dup", e))?;
                inner.temp_fd = Some(f);
                Ok(handle)
            }
            Err(e) => {
                let err = Arc::new(SyncError::io("dst write", e));
                inner.err.get_or_insert_with(|| err.clone());
                Err(SyncError::Other(format!("temp file create failed: {err}")))
            }
        }
    }

    pub fn copied_from_origin(&self) {
        self.inner.lock().unwrap().copied_from_origin += 1;
    }

    pub fn copy_done(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.copy_needed = inner.copy_needed.saturating_sub(1);
    }

    /// A block missed in the copier and is being forwarded to the puller:
    /// it leaves the copy count and becomes a pull count.
    pub fn pull_started(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.copy_needed = inner.copy_needed.saturating_sub(1);
        inner.pull_total += 1;
        inner.pull_needed += 1;
    }

    pub fn pull_done(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.pull_needed = inner.pull_needed.saturating_sub(1);
    }

    /// Sticky, first-writer-wins failure (spec §4.4, §7).
    pub fn fail(&self, op: &'static str, source: std::io::Error) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .err
            .get_or_insert_with(|| Arc::new(SyncError::io(op, source)));
    }

    pub fn fail_with(&self, err: SyncError) {
        let mut inner = self.inner.lock().unwrap();
        inner.err.get_or_insert_with(|| Arc::new(err));
    }

    pub fn error(&self) -> Option<Arc<SyncError>> {
        self.inner.lock().unwrap().err.clone()
    }

    pub fn has_error(&self) -> bool {
        self.inner.lock().unwrap().err.is_some()
    }

    /// Counters snapshot, mainly for tests and logging.
    pub fn counters(&self) -> Counters {
        let inner = self.inner.lock().unwrap();
        Counters {
            copy_total: inner.copy_total,
            copy_needed: inner.copy_needed,
            pull_total: inner.pull_total,
            pull_needed: inner.pull_needed,
            reused: inner.reused,
            copied_from_origin: inner.copied_from_origin,
        }
    }

    /// Returns `(true, err)` exactly once — when every outstanding stage has
    /// released this file (`copy_needed == 0 && pull_needed == 0`) or a
    /// terminal error has been recorded — flushing and closing the temp
    /// file on that first transition. Subsequent calls return `(false,
    /// None)`.
    pub fn final_close(&self) -> (bool, Option<Arc<SyncError>>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return (false, None);
        }
        let done = inner.copy_needed == 0 && inner.pull_needed == 0;
        if !done && inner.err.is_none() {
            return (false, None);
        }
        inner.closed = true;
        if let Some(fd) = inner.temp_fd.take() {
            use std::io::Write;
            let mut fd = fd;
            let _ = fd.flush();
            drop(fd);
        }
        (true, inner.err.clone())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub copy_total: u64,
    pub copy_needed: u64,
    pub pull_total: u64,
    pub pull_needed: u64,
    pub reused: u64,
    pub copied_from_origin: u64,
}
