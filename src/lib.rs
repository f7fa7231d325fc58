/*!
 * foldersync-core: block-level folder synchronization engine.
 *
 * This crate owns the cluster-local side of syncing a folder once an index
 * (database) has already decided what the local device needs: the iteration
 * driver (spec §4.8) walks that need set through a three-stage pipeline —
 * copier (local reuse), puller (remote fetch), finisher (commit) — and a
 * per-folder serve loop (spec §4.9) schedules iterations and rescans.
 *
 * What this crate does NOT do: scanning the local filesystem into a
 * `FileRecord`, maintaining the cluster-wide index/database, or speaking any
 * wire protocol. Those are the [`index::Index`], [`index::Network`], and
 * [`index::Versioner`] trait boundaries a deployment wires in.
 */

pub mod activity;
pub mod config;
pub mod error;
pub mod fs_util;
pub mod index;
pub mod logging;
pub mod model;
pub mod progress;
pub mod puller;
pub mod queue;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use error::{Result, SyncError, SyncErrorCode};
pub use index::{Finder, FolderState, Index, Network, NoVersioner, Versioner};
pub use model::{BlockInfo, FileRecord, Flags, Version};
pub use puller::iteration::{run_iteration, IterationContext};
pub use puller::serve::run_serve_loop;
