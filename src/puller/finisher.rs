/*!
 * Finisher stage (C7, spec §4.7): when a file's state reports all blocks
 * accounted for, commit it — permissions, mtime, version-archive old
 * content, atomic rename, symlink handling.
 */

use std::fs;
use std::path::Path;
use std::sync::Arc;

use crossbeam_channel::Receiver;
use filetime::FileTime;

use crate::error::{Result, SyncError};
use crate::fs_util::in_writable_dir;
use crate::index::{Index, Versioner};
use crate::model::FileRecord;
use crate::progress::ProgressPublisher;
use crate::puller::state::SharedPullerState;

pub struct FinisherContext {
    pub index: Arc<dyn Index>,
    pub versioner: Arc<dyn Versioner>,
    pub ignore_perms: bool,
    pub lenient_mtimes: bool,
    pub progress: ProgressPublisher,
}

/// Runs until `finisher_rx` is closed and drained; one finisher worker per
/// iteration (spec §4.8 step 1).
pub fn run_finisher(finisher_rx: Receiver<Arc<SharedPullerState>>, ctx: &FinisherContext) {
    for state in finisher_rx.iter() {
        finish_one(state, ctx);
    }
}

fn finish_one(state: Arc<SharedPullerState>, ctx: &FinisherContext) {
    let (closed, err) = state.final_close();
    if !closed {
        // Another stage still holds outstanding work for this file.
        return;
    }

    let commit_err = if err.is_none() {
        match perform_finish(&state, ctx) {
            Ok(()) => None,
            Err(e) => Some(e),
        }
    } else {
        None
    };

    let reported = err.as_deref().map(|e| e.to_string()).or_else(|| commit_err.as_ref().map(|e| e.to_string()));
    if let Some(msg) = &reported {
        tracing::warn!(folder = %state.folder, file = %state.file.name, error = %msg, "file not committed");
    } else {
        tracing::debug!(folder = %state.folder, file = %state.file.name, "file committed");
    }

    ctx.index.received_file(&state.folder, &state.file.name);
    ctx.progress.item_finished(&state.folder, &state.file.name, reported);
}

/// Commits one fully-assembled temp file to its final name (spec §4.7).
fn perform_finish(state: &SharedPullerState, ctx: &FinisherContext) -> Result<()> {
    let file = &state.file;

    if !ctx.ignore_perms {
        fs::set_permissions(&state.temp_name, perm_from_mode(file.flags.mode()))
            .map_err(|e| SyncError::io("chmod temp", e))?;
    }

    let mtime = FileTime::from_unix_time(file.modified, 0);
    if let Err(e) = filetime::set_file_times(&state.temp_name, mtime, mtime) {
        if ctx.lenient_mtimes {
            tracing::warn!(file = %file.name, error = %e, "lenient mtimes: preserving mtime failed, continuing");
        } else {
            return Err(SyncError::io("chtimes", e));
        }
    }

    ctx.versioner.archive(&state.real_name)?;

    if let Ok(meta) = fs::symlink_metadata(&state.real_name) {
        if meta.is_dir() || meta.file_type().is_symlink() {
            in_writable_dir(&state.real_name, |p| {
                let result = if meta.is_dir() { fs::remove_dir_all(p) } else { fs::remove_file(p) };
                result.map_err(|e| SyncError::io("remove existing", e))
            })?;
        }
    }

    in_writable_dir(&state.real_name, |p| {
        fs::rename(&state.temp_name, p).map_err(|e| SyncError::io("rename", e))
    })?;

    if file.is_symlink() {
        let target = fs::read_to_string(&state.real_name).map_err(|e| SyncError::io("read symlink body", e))?;
        fs::remove_file(&state.real_name).map_err(|e| SyncError::io("remove symlink body", e))?;
        #[cfg(unix)]
        std::os::unix::fs::symlink(&target, &state.real_name)
            .map_err(|e| SyncError::io("create symlink", e))?;
    }

    ctx.index.update_local(&state.folder, file.clone());
    Ok(())
}

#[cfg(unix)]
fn perm_from_mode(mode: u32) -> std::fs::Permissions {
    use std::os::unix::fs::PermissionsExt;
    std::fs::Permissions::from_mode(mode)
}

/// `handleDir` (spec §4.7): invoked synchronously by the iteration driver
/// for needed directory entries.
pub fn handle_dir(index: &dyn Index, folder: &str, file: &FileRecord, root: &Path, ignore_perms: bool) -> Result<()> {
    let path = root.join(&file.name);
    let mode = if ignore_perms { 0o755 } else { file.flags.mode() };

    match fs::symlink_metadata(&path) {
        Ok(meta) if meta.is_dir() => {
            if !ignore_perms {
                fs::set_permissions(&path, perm_from_mode(mode)).map_err(|e| SyncError::io("chmod dir", e))?;
            }
        }
        Ok(_) => {
            fs::remove_file(&path).or_else(|_| fs::remove_dir_all(&path)).map_err(|e| SyncError::io("remove non-dir", e))?;
            fs::create_dir(&path).map_err(|e| SyncError::io("mkdir", e))?;
            if !ignore_perms {
                fs::set_permissions(&path, perm_from_mode(mode)).map_err(|e| SyncError::io("chmod dir", e))?;
            }
        }
        Err(_) => {
            fs::create_dir(&path).map_err(|e| SyncError::io("mkdir", e))?;
            if !ignore_perms {
                fs::set_permissions(&path, perm_from_mode(mode)).map_err(|e| SyncError::io("chmod dir", e))?;
            }
        }
    }

    index.update_local(folder, file.clone());
    Ok(())
}

/// `deleteDir` (spec §4.7): remove leftover temp files first, then the
/// directory itself. `ENOENT` is success.
pub fn delete_dir(root: &Path, name: &str) -> Result<()> {
    let path = root.join(name);
    if let Ok(entries) = fs::read_dir(&path) {
        for entry in entries.flatten() {
            if crate::fs_util::is_temporary(&entry.file_name().to_string_lossy()) {
                let _ = fs::remove_file(entry.path());
            }
        }
    }
    match fs::remove_dir(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SyncError::io("rmdir", e)),
    }
}

/// `deleteFile` (spec §4.7): archive through the versioner if configured,
/// else remove. `ENOENT` is success.
pub fn delete_file(versioner: &dyn Versioner, root: &Path, name: &str) -> Result<()> {
    let path = root.join(name);
    if versioner.is_configured() {
        return versioner.archive(&path);
    }
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SyncError::io("remove", e)),
    }
}

/// `renameFile` (spec §4.7): copy+archive through the versioner if
/// configured, else a direct rename; then shortcut the target's metadata
/// and call `updateLocal` for the (already-deleted) source record.
pub fn rename_file(
    index: &dyn Index,
    versioner: &dyn Versioner,
    folder: &str,
    root: &Path,
    source: &FileRecord,
    target: &FileRecord,
    ignore_perms: bool,
    lenient_mtimes: bool,
) -> Result<()> {
    let source_path = root.join(&source.name);
    let target_path = root.join(&target.name);

    if versioner.is_configured() {
        fs::copy(&source_path, &target_path).map_err(|e| SyncError::io("rename copy", e))?;
        versioner.archive(&source_path)?;
    } else {
        let _ = fs::rename(&source_path, &target_path);
    }

    shortcut_file(index, folder, target, root, ignore_perms, lenient_mtimes)?;
    index.update_local(folder, source.clone());
    Ok(())
}

/// `shortcutFile` (spec §4.7): metadata-only fast path when content is
/// already correct.
pub fn shortcut_file(
    index: &dyn Index,
    folder: &str,
    file: &FileRecord,
    root: &Path,
    ignore_perms: bool,
    lenient_mtimes: bool,
) -> Result<()> {
    let path = root.join(&file.name);

    if !ignore_perms {
        fs::set_permissions(&path, perm_from_mode(file.flags.mode())).map_err(|e| SyncError::io("chmod", e))?;
    }

    let mtime = FileTime::from_unix_time(file.modified, 0);
    if let Err(e) = filetime::set_file_times(&path, mtime, mtime) {
        if lenient_mtimes {
            tracing::warn!(file = %file.name, error = %e, "lenient mtimes: shortcut mtime failed, continuing");
        } else {
            return Err(SyncError::io("chtimes", e));
        }
    }

    index.update_local(folder, file.clone());
    Ok(())
}

/// `shortcutSymlink` (spec §4.7): adjusts the symlink type flags only.
pub fn shortcut_symlink(index: &dyn Index, folder: &str, file: &FileRecord) -> Result<()> {
    index.update_local(folder, file.clone());
    Ok(())
}
