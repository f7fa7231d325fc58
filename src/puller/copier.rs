/*!
 * Copier stage (C5, spec §4.5): for each block of a needed file, try to
 * satisfy it from a local replica via the finder; forward misses to the
 * puller stage.
 */

use std::collections::HashMap;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};

use crate::error::SyncError;
use crate::index::Finder;
use crate::model::BlockInfo;
use crate::puller::state::SharedPullerState;

/// A copier's unit of work: the blocks of one file still needing content,
/// paired with the state those blocks belong to.
pub struct CopyJob {
    pub state: Arc<SharedPullerState>,
    pub blocks: Vec<BlockInfo>,
}

/// A single missed block, forwarded to the puller stage.
pub struct PullJob {
    pub state: Arc<SharedPullerState>,
    pub block: BlockInfo,
}

/// Bound on open source-file descriptors held by one copier worker (spec
/// §4.5 step 2, §5 "Resource bounds"). LFU eviction: when the cache grows
/// past `HIGH_WATER`, the least-frequently-used entries are closed down to
/// `LOW_WATER`.
const HIGH_WATER: usize = 50;
const LOW_WATER: usize = 20;

struct FdCache {
    entries: HashMap<PathBuf, (File, u64)>,
}

impl FdCache {
    fn new() -> Self {
        Self { entries: HashMap::new() }
    }

    fn get_or_open(&mut self, path: &Path) -> std::io::Result<&File> {
        if self.entries.contains_key(path) {
            let entry = self.entries.get_mut(path).unwrap();
            entry.1 += 1;
        } else {
            let file = File::open(path)?;
            self.entries.insert(path.to_path_buf(), (file, 1));
            if self.entries.len() > HIGH_WATER {
                // Never evict the entry we're about to hand back.
                self.evict_to(LOW_WATER, path);
            }
        }
        Ok(&self.entries.get(path).unwrap().0)
    }

    fn evict_to(&mut self, target: usize, keep: &Path) {
        if self.entries.len() <= target {
            return;
        }
        let mut by_use: Vec<(PathBuf, u64)> = self
            .entries
            .iter()
            .filter(|(p, _)| p.as_path() != keep)
            .map(|(p, (_, n))| (p.clone(), *n))
            .collect();
        by_use.sort_by_key(|(_, n)| *n);
        for (path, _) in by_use.into_iter().take(self.entries.len() - target) {
            self.entries.remove(&path);
        }
    }

    fn close_all(&mut self) {
        self.entries.clear();
    }
}

/// Shared, read-only context threaded through every copier worker.
pub struct CopierContext {
    pub finder: Arc<dyn Finder>,
    pub folder_roots: HashMap<String, PathBuf>,
    pub block_size: u32,
    pub pull_tx: Sender<PullJob>,
    pub finisher_tx: Sender<Arc<SharedPullerState>>,
}

/// Runs until `copy_rx` is closed and drained; intended to be spawned once
/// per configured copier worker.
pub fn run_copier(copy_rx: Receiver<CopyJob>, ctx: Arc<CopierContext>) {
    for job in copy_rx.iter() {
        copy_one_file(job, &ctx);
    }
}

fn copy_one_file(job: CopyJob, ctx: &CopierContext) {
    let CopyJob { state, blocks } = job;

    if state.temp_file().is_err() {
        let _ = ctx.finisher_tx.send(state);
        return;
    }

    let mut fds = FdCache::new();

    for block in blocks {
        if state.has_error() {
            break;
        }

        let mut satisfied = false;

        ctx.finder.iterate(&block.hash, &mut |folder, file, index| {
            let root = match ctx.folder_roots.get(folder) {
                Some(r) => r,
                None => return false,
            };
            let source_path = root.join(file);
            let offset = ctx.block_size as u64 * index as u64;

            let mut buf = vec![0u8; block.size as usize];
            let read = match fds.get_or_open(&source_path).and_then(|f| f.read_exact_at(&mut buf, offset).map(|_| ())) {
                Ok(()) => true,
                Err(_) => false,
            };
            if !read {
                return false;
            }

            let observed = *blake3::hash(&buf).as_bytes();
            if observed != block.hash {
                ctx.finder.fix(folder, file, index, &block.hash, &observed);
                return false;
            }

            match state.temp_file().and_then(|f| {
                f.write_all_at(&buf, block.offset)
                    .map_err(|e| SyncError::io("dst write", e))
            }) {
                Ok(()) => {
                    if source_path == state.real_name {
                        state.copied_from_origin();
                    }
                    satisfied = true;
                    true
                }
                Err(e) => {
                    state.fail_with(e);
                    true
                }
            }
        });

        if state.has_error() {
            break;
        }

        if satisfied {
            state.copy_done();
        } else {
            state.pull_started();
            let _ = ctx.pull_tx.send(PullJob { state: state.clone(), block });
        }
    }

    fds.close_all();
    let _ = ctx.finisher_tx.send(state);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Flags, FileRecord, Version};
    use crate::testutil::MockFinder;
    use crossbeam_channel::unbounded;
    use tempfile::tempdir;

    fn block(offset: u64, size: u32, data: &[u8]) -> BlockInfo {
        BlockInfo {
            offset,
            size,
            hash: *blake3::hash(data).as_bytes(),
        }
    }

    fn dummy_state(dir: &Path, name: &str, copy_total: u64) -> Arc<SharedPullerState> {
        let file = FileRecord {
            name: name.into(),
            flags: Flags::new(0o644),
            modified: 0,
            version: Version::default(),
            blocks: vec![],
        };
        Arc::new(SharedPullerState::new(
            file,
            "f",
            dir.join(format!("{name}.tmp")),
            dir.join(name),
            copy_total,
            0,
        ))
    }

    #[test]
    fn verified_block_is_copied_and_marked_done() {
        let dir = tempdir().unwrap();
        let source_path = dir.path().join("sibling");
        std::fs::write(&source_path, b"hello world").unwrap();

        let finder = Arc::new(MockFinder::new());
        let blk = block(0, 5, b"hello");
        finder.add_candidate(blk.hash, "f", "sibling", 0);

        let mut roots = HashMap::new();
        roots.insert("f".to_string(), dir.path().to_path_buf());

        let (pull_tx, pull_rx) = unbounded();
        let (finisher_tx, finisher_rx) = unbounded();
        let ctx = Arc::new(CopierContext {
            finder,
            folder_roots: roots,
            block_size: 5,
            pull_tx,
            finisher_tx,
        });

        let state = dummy_state(dir.path(), "target", 1);
        copy_one_file(CopyJob { state: state.clone(), blocks: vec![blk] }, &ctx);

        assert_eq!(state.counters().copy_needed, 0);
        assert!(pull_rx.try_recv().is_err());
        assert!(finisher_rx.try_recv().is_ok());
    }

    #[test]
    fn missing_candidate_forwards_to_puller() {
        let dir = tempdir().unwrap();
        let finder = Arc::new(MockFinder::new());
        let blk = block(0, 5, b"hello");
        // No candidates registered.

        let (pull_tx, pull_rx) = unbounded();
        let (finisher_tx, _finisher_rx) = unbounded();
        let ctx = Arc::new(CopierContext {
            finder,
            folder_roots: HashMap::new(),
            block_size: 5,
            pull_tx,
            finisher_tx,
        });

        let state = dummy_state(dir.path(), "target", 1);
        copy_one_file(CopyJob { state: state.clone(), blocks: vec![blk] }, &ctx);

        assert_eq!(state.counters().pull_needed, 1);
        assert!(pull_rx.try_recv().is_ok());
    }

    #[test]
    fn mismatched_candidate_calls_fix_and_forwards_to_puller() {
        let dir = tempdir().unwrap();
        let source_path = dir.path().join("sibling");
        std::fs::write(&source_path, b"XXXXX").unwrap();

        let finder = Arc::new(MockFinder::new());
        let blk = block(0, 5, b"hello");
        finder.add_candidate(blk.hash, "f", "sibling", 0);

        let mut roots = HashMap::new();
        roots.insert("f".to_string(), dir.path().to_path_buf());

        let (pull_tx, _pull_rx) = unbounded();
        let (finisher_tx, _finisher_rx) = unbounded();
        let ctx = Arc::new(CopierContext {
            finder: finder.clone(),
            folder_roots: roots,
            block_size: 5,
            pull_tx,
            finisher_tx,
        });

        let state = dummy_state(dir.path(), "target", 1);
        copy_one_file(CopyJob { state: state.clone(), blocks: vec![blk] }, &ctx);

        assert_eq!(finder.fixes().len(), 1);
        assert_eq!(state.counters().pull_needed, 1);
    }
}
