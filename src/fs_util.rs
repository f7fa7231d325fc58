/*!
 * Small filesystem helpers shared by the finisher and iteration driver:
 * temp-name policy (spec §6 "Temp-name policy") and the `in_writable_dir`
 * wrapper (spec §6, §4.7 step 4).
 */

use crate::error::{Result, SyncError};
use std::fs;
use std::path::{Path, PathBuf};

const TEMP_PREFIX: &str = ".foldersync.";

/// Temp files share their target's parent directory and carry a marker
/// prefix recognized by [`is_temporary`].
pub fn temp_name(real_name: &Path) -> PathBuf {
    let parent = real_name.parent().filter(|p| !p.as_os_str().is_empty());
    let file_name = real_name
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_file_name = format!("{TEMP_PREFIX}{file_name}.tmp");
    match parent {
        Some(p) => p.join(temp_file_name),
        None => PathBuf::from(temp_file_name),
    }
}

/// Recognizes names produced by [`temp_name`], for opportunistic cleanup in
/// `delete_dir`.
pub fn is_temporary(name: &str) -> bool {
    Path::new(name)
        .file_name()
        .map(|f| f.to_string_lossy().starts_with(TEMP_PREFIX))
        .unwrap_or(false)
}

/// Temporarily grants write permission on `path`'s parent directory, runs
/// `op`, and restores the parent's original mode on every exit path.
#[cfg(unix)]
pub fn in_writable_dir<T>(path: &Path, op: impl FnOnce(&Path) -> Result<T>) -> Result<T> {
    use std::os::unix::fs::PermissionsExt;

    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let original = fs::metadata(parent)
        .map_err(|e| SyncError::io("stat parent", e))?
        .permissions();
    let already_writable = original.mode() & 0o200 != 0;

    if !already_writable {
        let mut perm = original.clone();
        perm.set_mode(original.mode() | 0o200);
        fs::set_permissions(parent, perm).map_err(|e| SyncError::io("chmod parent", e))?;
    }

    let result = op(path);

    if !already_writable {
        let _ = fs::set_permissions(parent, original);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn temp_name_shares_parent_and_carries_marker() {
        let target = Path::new("/data/folder/sub/file.txt");
        let tmp = temp_name(target);
        assert_eq!(tmp.parent(), Some(Path::new("/data/folder/sub")));
        assert!(is_temporary(tmp.file_name().unwrap().to_str().unwrap()));
    }

    #[test]
    fn non_temporary_name_is_recognized_as_such() {
        assert!(!is_temporary("file.txt"));
    }

    #[test]
    fn in_writable_dir_restores_readonly_parent() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();
        let target = sub.join("file.txt");

        let mut perm = fs::metadata(&sub).unwrap().permissions();
        perm.set_mode(0o555);
        fs::set_permissions(&sub, perm).unwrap();

        in_writable_dir(&target, |p| {
            fs::write(p, b"hi").map_err(|e| SyncError::io("write", e))
        })
        .unwrap();

        let restored = fs::metadata(&sub).unwrap().permissions();
        assert_eq!(restored.mode() & 0o777, 0o555);

        // Clean up so tempdir can be removed.
        let mut perm = fs::metadata(&sub).unwrap().permissions();
        perm.set_mode(0o755);
        fs::set_permissions(&sub, perm).unwrap();
    }
}
