/*!
 * Trait boundaries toward the external collaborators named in spec §1 and
 * §6: the index/database, the block finder it hosts, the network layer,
 * and the versioner. None of these are implemented for real here — a
 * deployment wires in a database-backed index, a wire-protocol network
 * client, and an on-disk versioner. [`crate::testutil`] carries simple
 * in-memory doubles used by this crate's own tests.
 */

use crate::activity::DeviceId;
use crate::error::Result;
use crate::model::FileRecord;
use std::path::Path;

/// Observable folder state (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FolderState {
    #[default]
    Idle,
    Scanning,
    Syncing,
}

/// The index/database (spec §1, §6): everything the core needs to know
/// about the cluster-wide view of a folder, and the write-back points the
/// core calls once it has made local progress.
pub trait Index: Send + Sync {
    /// Iterate the local device's "need" set in lexicographic order
    /// (parents before children), calling `visit` for each entry until it
    /// returns `false`.
    fn with_need(&self, local_device: DeviceId, visit: &mut dyn FnMut(&FileRecord) -> bool);

    fn current_folder_file(&self, folder: &str, name: &str) -> Option<FileRecord>;

    fn current_global_file(&self, folder: &str, name: &str) -> Option<FileRecord>;

    /// Devices known to hold a current copy of `name`.
    fn availability(&self, folder: &str, name: &str) -> Vec<DeviceId>;

    fn update_local(&self, folder: &str, file: FileRecord);

    fn received_file(&self, folder: &str, name: &str);

    fn set_state(&self, folder: &str, state: FolderState);

    fn invalidate_folder(&self, folder: &str, reason: &str);

    fn scan_folder(&self, folder: &str) -> Result<()>;

    /// Monotonic version counter for the folder as last observed from the
    /// remote cluster view. May be observed to decrease mid-iteration if the
    /// device that contributed the high-water mark disappears (spec §9 Q3);
    /// callers must tolerate that defensively.
    fn remote_local_version(&self, folder: &str) -> i64;
}

/// Maps a block's content hash to local files that already contain it
/// (spec §1, §4.5, Glossary).
pub trait Finder: Send + Sync {
    /// Calls `visit(folder, file, block_index)` for each known location of
    /// `hash`, stopping as soon as `visit` returns `true`.
    fn iterate(&self, hash: &[u8; 32], visit: &mut dyn FnMut(&str, &str, usize) -> bool);

    /// Reconciles a stale finder entry after a verification mismatch.
    fn fix(&self, folder: &str, file: &str, index: usize, expected: &[u8; 32], observed: &[u8; 32]);
}

/// The network layer (spec §1, §6): fetch a block's bytes from a specific
/// device.
pub trait Network: Send + Sync {
    fn request_global(
        &self,
        device: DeviceId,
        folder: &str,
        name: &str,
        offset: u64,
        size: u32,
        hash: &[u8; 32],
    ) -> Result<Vec<u8>>;
}

/// Pluggable archival policy invoked before a file is overwritten or deleted
/// (Glossary: Versioner).
pub trait Versioner: Send + Sync {
    fn archive(&self, real_name: &Path) -> Result<()>;

    /// Whether a real versioner is configured. `renameFile` (spec §4.7)
    /// branches on this: a configured versioner copies then archives the
    /// source, otherwise the source is renamed directly.
    fn is_configured(&self) -> bool {
        true
    }
}

/// No-op versioner: the default when no versioner is configured.
pub struct NoVersioner;

impl Versioner for NoVersioner {
    fn archive(&self, _real_name: &Path) -> Result<()> {
        Ok(())
    }

    fn is_configured(&self) -> bool {
        false
    }
}
