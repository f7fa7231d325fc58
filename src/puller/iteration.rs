/*!
 * Iteration driver (C8, spec §4.8): drives one puller iteration over the
 * "need" set — classifies each entry, dispatches to the pipeline, joins the
 * workers, then applies deletions in dependency order.
 */

use std::collections::HashMap;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::bounded;

use crate::activity::{DeviceActivity, DeviceId};
use crate::config::FolderConfig;
use crate::fs_util::temp_name;
use crate::index::{Finder, Index, Network, Versioner};
use crate::model::{blocks_equal, BlockInfo, FileRecord};
use crate::progress::ProgressPublisher;
use crate::queue::JobQueue;

use super::copier::{run_copier, CopierContext, CopyJob};
use super::finisher::{
    delete_dir, delete_file, handle_dir, rename_file, run_finisher, shortcut_file,
    shortcut_symlink, FinisherContext,
};
use super::pull_stage::{run_puller, PullerContext};
use super::state::SharedPullerState;

/// Everything the iteration driver needs beyond `FolderConfig`: the
/// collaborators named in spec §1 and the folder-id → root-path map the
/// copier needs to resolve cross-folder finder candidates (spec §4.5 step
/// 3).
pub struct IterationContext {
    pub index: Arc<dyn Index>,
    pub finder: Arc<dyn Finder>,
    pub network: Arc<dyn Network>,
    pub versioner: Arc<dyn Versioner>,
    pub activity: Arc<DeviceActivity>,
    pub progress: ProgressPublisher,
    pub local_device: DeviceId,
    pub folder_roots: HashMap<String, PathBuf>,
}

/// Runs one complete iteration and returns the number of visited (non-
/// ignored) entries (spec §4.8 step 7).
pub fn run_iteration(cfg: &FolderConfig, ctx: &IterationContext) -> u64 {
    let copiers = cfg.tunables.copiers.max(1);
    let pullers = cfg.tunables.pullers.max(1);

    let (copy_tx, copy_rx) = bounded::<CopyJob>(copiers);
    let (pull_tx, pull_rx) = bounded(pullers);
    let (finisher_tx, finisher_rx) = bounded(copiers + pullers + 1);

    let copier_ctx = Arc::new(CopierContext {
        finder: ctx.finder.clone(),
        folder_roots: ctx.folder_roots.clone(),
        block_size: cfg.tunables.block_size,
        pull_tx,
        finisher_tx: finisher_tx.clone(),
    });
    let mut copier_handles = Vec::with_capacity(copiers);
    for _ in 0..copiers {
        let rx = copy_rx.clone();
        let worker_ctx = Arc::clone(&copier_ctx);
        copier_handles.push(thread::spawn(move || run_copier(rx, worker_ctx)));
    }
    drop(copy_rx);
    drop(copier_ctx);

    let puller_ctx = Arc::new(PullerContext {
        index: ctx.index.clone(),
        network: ctx.network.clone(),
        activity: ctx.activity.clone(),
        finisher_tx,
    });
    let mut puller_handles = Vec::with_capacity(pullers);
    for _ in 0..pullers {
        let rx = pull_rx.clone();
        let worker_ctx = Arc::clone(&puller_ctx);
        puller_handles.push(thread::spawn(move || run_puller(rx, worker_ctx)));
    }
    drop(pull_rx);
    drop(puller_ctx);

    let finisher_ctx = FinisherContext {
        index: ctx.index.clone(),
        versioner: ctx.versioner.clone(),
        ignore_perms: cfg.tunables.ignore_perms,
        lenient_mtimes: cfg.tunables.lenient_mtimes,
        progress: ctx.progress.clone(),
    };
    let finisher_handle = thread::spawn(move || run_finisher(finisher_rx, &finisher_ctx));

    let mut queue = JobQueue::new();
    let mut dir_deletions: Vec<FileRecord> = Vec::new();
    let mut file_deletions: HashMap<String, FileRecord> = HashMap::new();
    let mut buckets: HashMap<[u8; 32], Vec<FileRecord>> = HashMap::new();
    let mut changed = 0u64;

    let root = cfg.root.clone();
    let folder_id = cfg.folder_id.clone();
    let ignore_perms = cfg.tunables.ignore_perms;

    ctx.index.with_need(ctx.local_device, &mut |entry| {
        changed += 1;

        if entry.is_deleted() && entry.is_directory() {
            dir_deletions.push(entry.clone());
        } else if entry.is_deleted() {
            file_deletions.insert(entry.name.clone(), entry.clone());
            if let Some(current) = ctx.index.current_folder_file(&folder_id, &entry.name) {
                if !current.is_deleted() {
                    if let Some(hash) = current.first_block_hash() {
                        buckets.entry(hash).or_default().push(current);
                    }
                }
            }
        } else if entry.is_directory() && !entry.is_symlink() {
            if let Err(e) = handle_dir(ctx.index.as_ref(), &folder_id, entry, &root, ignore_perms) {
                tracing::warn!(folder = %folder_id, dir = %entry.name, error = %e, "handle_dir failed");
            }
            ctx.progress.item_started(&folder_id, &entry.name);
        } else {
            ctx.progress.item_started(&folder_id, &entry.name);
            queue.push(entry.name.clone());
        }

        true
    });

    while let Some(name) = queue.pop() {
        let file = match ctx.index.current_global_file(&folder_id, &name) {
            Some(f) => f,
            None => {
                queue.done(&name);
                continue;
            }
        };

        let renamed = try_rename_shortcut(&file, &mut buckets, &mut file_deletions, ctx, &folder_id, &root, ignore_perms, cfg.tunables.lenient_mtimes);

        if !renamed {
            handle_file(&file, &folder_id, &root, ctx, cfg.tunables.block_size, ignore_perms, cfg.tunables.lenient_mtimes, &copy_tx);
        }

        queue.done(&name);
    }

    drop(copy_tx);
    for h in copier_handles {
        let _ = h.join();
    }
    for h in puller_handles {
        let _ = h.join();
    }
    let _ = finisher_handle.join();

    for (_, file) in file_deletions {
        if let Err(e) = delete_file(ctx.versioner.as_ref(), &root, &file.name) {
            tracing::warn!(folder = %folder_id, file = %file.name, error = %e, "delete_file failed");
        }
    }

    dir_deletions.sort_by(|a, b| b.name.cmp(&a.name));
    for dir in dir_deletions {
        if let Err(e) = delete_dir(&root, &dir.name) {
            tracing::warn!(folder = %folder_id, dir = %dir.name, error = %e, "delete_dir failed");
        }
    }

    changed
}

#[allow(clippy::too_many_arguments)]
fn try_rename_shortcut(
    file: &FileRecord,
    buckets: &mut HashMap<[u8; 32], Vec<FileRecord>>,
    file_deletions: &mut HashMap<String, FileRecord>,
    ctx: &IterationContext,
    folder_id: &str,
    root: &Path,
    ignore_perms: bool,
    lenient_mtimes: bool,
) -> bool {
    if file.is_symlink() || file.is_deleted() {
        return false;
    }
    let hash = match file.first_block_hash() {
        Some(h) => h,
        None => return false,
    };
    let bucket = match buckets.get_mut(&hash) {
        Some(b) => b,
        None => return false,
    };
    let pos = match bucket.iter().position(|c| blocks_equal(&c.blocks, &file.blocks)) {
        Some(p) => p,
        None => return false,
    };

    let candidate = bucket.remove(pos);
    let candidate_name = candidate.name.clone();
    // The bucket holds the pre-deletion content snapshot (needed to match
    // blocks); the deletion marker itself, if still pending, is what
    // `renameFile` should hand to `updateLocal` as the source record.
    let source = file_deletions.remove(&candidate_name).unwrap_or(candidate);

    if let Err(e) = rename_file(
        ctx.index.as_ref(),
        ctx.versioner.as_ref(),
        folder_id,
        root,
        &source,
        file,
        ignore_perms,
        lenient_mtimes,
    ) {
        tracing::warn!(folder = %folder_id, from = %candidate_name, to = %file.name, error = %e, "rename_file failed");
    }
    true
}

#[allow(clippy::too_many_arguments)]
fn handle_file(
    file: &FileRecord,
    folder_id: &str,
    root: &Path,
    ctx: &IterationContext,
    block_size: u32,
    ignore_perms: bool,
    lenient_mtimes: bool,
    copy_tx: &crossbeam_channel::Sender<CopyJob>,
) {
    let real_name = root.join(&file.name);

    if let Some(current) = ctx.index.current_folder_file(folder_id, &file.name) {
        if !current.is_deleted() && blocks_equal(&current.blocks, &file.blocks) {
            let result = if file.is_symlink() {
                shortcut_symlink(ctx.index.as_ref(), folder_id, file)
            } else {
                shortcut_file(ctx.index.as_ref(), folder_id, file, root, ignore_perms, lenient_mtimes)
            };
            if let Err(e) = result {
                tracing::warn!(folder = %folder_id, file = %file.name, error = %e, "shortcut failed");
            }
            return;
        }
    }

    let temp_path = temp_name(&real_name);
    let (remaining, reused) = reuse_from_temp(&temp_path, &file.blocks, block_size);

    if reused == 0 && temp_path.exists() {
        let _ = std::fs::remove_file(&temp_path);
    }

    let state = Arc::new(SharedPullerState::new(
        file.clone(),
        folder_id.to_string(),
        temp_path,
        real_name,
        remaining.len() as u64,
        reused as u64,
    ));
    let _ = copy_tx.send(CopyJob { state, blocks: remaining });
}

/// Diffs a possibly-existing temp file against the target block list: any
/// target block whose bytes are already present at the right offset in the
/// temp file is "reused" and dropped from the remaining set (spec §4.8
/// `handleFile`).
fn reuse_from_temp(temp_path: &Path, target_blocks: &[BlockInfo], _block_size: u32) -> (Vec<BlockInfo>, usize) {
    let existing = File::open(temp_path).ok();
    let mut remaining = Vec::with_capacity(target_blocks.len());
    let mut reused = 0usize;

    for block in target_blocks {
        let matches = existing
            .as_ref()
            .map(|f| {
                let mut buf = vec![0u8; block.size as usize];
                f.read_exact_at(&mut buf, block.offset).is_ok()
                    && *blake3::hash(&buf).as_bytes() == block.hash
            })
            .unwrap_or(false);

        if matches {
            reused += 1;
        } else {
            remaining.push(block.clone());
        }
    }

    (remaining, reused)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Tunables;
    use crate::model::{Flags, Version};
    use crate::testutil::{MockFinder, MockIndex, MockNetwork};
    use tempfile::tempdir;

    fn file_record(name: &str, modified: i64, blocks: Vec<BlockInfo>) -> FileRecord {
        FileRecord {
            name: name.into(),
            flags: Flags::new(0o644),
            modified,
            version: Version::default(),
            blocks,
        }
    }

    fn block(offset: u64, data: &[u8]) -> BlockInfo {
        BlockInfo {
            offset,
            size: data.len() as u32,
            hash: *blake3::hash(data).as_bytes(),
        }
    }

    fn base_ctx(index: Arc<MockIndex>, finder: Arc<MockFinder>, network: Arc<MockNetwork>, root: &Path) -> IterationContext {
        let mut folder_roots = HashMap::new();
        folder_roots.insert("f".to_string(), root.to_path_buf());
        IterationContext {
            index,
            finder,
            network,
            versioner: Arc::new(crate::index::NoVersioner),
            activity: Arc::new(DeviceActivity::new()),
            progress: ProgressPublisher::noop(),
            local_device: 1,
            folder_roots,
        }
    }

    #[test]
    fn copy_only_file_is_assembled_from_local_sibling() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("sibling"), b"hello").unwrap();

        let blk = block(0, b"hello");
        let target = file_record("target", 1_700_000_000, vec![blk]);

        let index = Arc::new(MockIndex::new());
        index.push_need("f", target.clone());
        index.set_global("f", target.clone());

        let finder = Arc::new(MockFinder::new());
        finder.add_candidate(blk.hash, "f", "sibling", 0);

        let network = Arc::new(MockNetwork::new());
        let ctx = base_ctx(index.clone(), finder, network, dir.path());

        let cfg = FolderConfig::new("f", dir.path())
            .with_tunables(Tunables::default().with_copiers(1).with_pullers(1));

        let changed = run_iteration(&cfg, &ctx);

        assert_eq!(changed, 1);
        assert_eq!(std::fs::read(dir.path().join("target")).unwrap(), b"hello");
        assert!(index.received().contains(&("f".to_string(), "target".to_string())));
    }

    #[test]
    fn pull_only_file_is_fetched_from_remote_device() {
        let dir = tempdir().unwrap();
        let blk = block(0, b"world");
        let target = file_record("target", 1_700_000_000, vec![blk]);

        let index = Arc::new(MockIndex::new());
        index.push_need("f", target.clone());
        index.set_global("f", target.clone());
        index.set_availability("f", "target", vec![7]);

        let finder = Arc::new(MockFinder::new());
        let network = Arc::new(MockNetwork::new());
        network.set_block(7, "f", "target", 0, b"world".to_vec());

        let ctx = base_ctx(index.clone(), finder, network, dir.path());
        let cfg = FolderConfig::new("f", dir.path())
            .with_tunables(Tunables::default().with_copiers(1).with_pullers(1));

        let changed = run_iteration(&cfg, &ctx);

        assert_eq!(changed, 1);
        assert_eq!(std::fs::read(dir.path().join("target")).unwrap(), b"world");
    }

    #[test]
    fn rename_shortcut_avoids_block_fetch() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("old.bin"), b"same-bytes").unwrap();

        let blk = block(0, b"same-bytes");
        let old = file_record("old.bin", 1_700_000_000, vec![blk.clone()]).flags_deleted();
        let new = file_record("new.bin", 1_700_000_000, vec![blk]);

        let index = Arc::new(MockIndex::new());
        index.push_need("f", old.clone());
        index.push_need("f", new.clone());
        index.set_local("f", file_record("old.bin", 1_700_000_000, vec![block(0, b"same-bytes")]));
        index.set_global("f", new.clone());

        let finder = Arc::new(MockFinder::new());
        let network = Arc::new(MockNetwork::new());

        let ctx = base_ctx(index.clone(), finder, network, dir.path());
        let cfg = FolderConfig::new("f", dir.path())
            .with_tunables(Tunables::default().with_copiers(1).with_pullers(1));

        run_iteration(&cfg, &ctx);

        assert!(dir.path().join("new.bin").exists());
        assert!(!dir.path().join("old.bin").exists());
    }

    #[test]
    fn partial_reuse_combines_temp_bytes_with_a_fetched_block() {
        let dir = tempdir().unwrap();

        let blk0 = block(0, b"AAAA");
        let blk1 = block(4, b"BBBB");
        let target = file_record("target", 1_700_000_000, vec![blk0.clone(), blk1.clone()]);

        // A stale temp file already carries the right bytes for block 0 but
        // the wrong bytes for block 1 — it should be kept, not discarded.
        let temp_path = temp_name(&dir.path().join("target"));
        std::fs::write(&temp_path, b"AAAAXXXX").unwrap();

        std::fs::write(dir.path().join("sibling"), b"BBBB").unwrap();

        let index = Arc::new(MockIndex::new());
        index.push_need("f", target.clone());
        index.set_global("f", target.clone());

        let finder = Arc::new(MockFinder::new());
        finder.add_candidate(blk1.hash, "f", "sibling", 0);

        let network = Arc::new(MockNetwork::new());
        let ctx = base_ctx(index.clone(), finder, network, dir.path());

        let cfg = FolderConfig::new("f", dir.path())
            .with_tunables(Tunables::default().with_copiers(1).with_pullers(1).with_block_size(4));

        run_iteration(&cfg, &ctx);

        assert_eq!(std::fs::read(dir.path().join("target")).unwrap(), b"AAAABBBB");
    }

    #[test]
    fn symlink_is_fetched_and_recreated_from_its_target_bytes() {
        let dir = tempdir().unwrap();

        let blk = block(0, b"dest.txt");
        let mut link = file_record("link", 1_700_000_000, vec![blk]);
        link.flags = link.flags.with_symlink(true);

        let index = Arc::new(MockIndex::new());
        index.push_need("f", link.clone());
        index.set_global("f", link.clone());
        index.set_availability("f", "link", vec![9]);

        let finder = Arc::new(MockFinder::new());
        let network = Arc::new(MockNetwork::new());
        network.set_block(9, "f", "link", 0, b"dest.txt".to_vec());

        let ctx = base_ctx(index.clone(), finder, network, dir.path());
        let cfg = FolderConfig::new("f", dir.path())
            .with_tunables(Tunables::default().with_copiers(1).with_pullers(1));

        run_iteration(&cfg, &ctx);

        let link_path = dir.path().join("link");
        let meta = std::fs::symlink_metadata(&link_path).unwrap();
        assert!(meta.file_type().is_symlink());
        assert_eq!(std::fs::read_link(&link_path).unwrap(), Path::new("dest.txt"));
    }

    trait DeletedMarker {
        fn flags_deleted(self) -> FileRecord;
    }

    impl DeletedMarker for FileRecord {
        fn flags_deleted(mut self) -> FileRecord {
            self.flags = self.flags.with_deleted(true);
            self
        }
    }
}
