/*!
 * Puller stage (C6, spec §4.6): fetch missed blocks from remote devices,
 * verify, write into the temp file.
 */

use std::os::unix::fs::FileExt;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};

use crate::activity::{DeviceActivity, NO_DEVICE};
use crate::error::SyncError;
use crate::index::{Index, Network};
use crate::puller::copier::PullJob;
use crate::puller::state::SharedPullerState;

pub struct PullerContext {
    pub index: Arc<dyn Index>,
    pub network: Arc<dyn Network>,
    pub activity: Arc<DeviceActivity>,
    pub finisher_tx: Sender<Arc<SharedPullerState>>,
}

/// Runs until `pull_rx` is closed and drained; intended to be spawned once
/// per configured puller worker.
pub fn run_puller(pull_rx: Receiver<PullJob>, ctx: Arc<PullerContext>) {
    for job in pull_rx.iter() {
        pull_one_block(job, &ctx);
    }
}

fn pull_one_block(job: PullJob, ctx: &PullerContext) {
    let PullJob { state, block } = job;

    // The copier always forwards this file's state to the finisher at the
    // end of its own loop; a puller never forwards it there itself for a
    // skipped block (spec §4.6 step 1).
    if state.has_error() {
        return;
    }

    if state.temp_file().is_err() {
        return;
    }

    let mut candidates = ctx.index.availability(&state.folder, &state.file.name);
    let mut last_error: Option<SyncError> = None;

    loop {
        let selected = ctx.activity.least_busy(&candidates);
        if selected == NO_DEVICE {
            state.fail_with(last_error.unwrap_or(SyncError::NoDevice));
            break;
        }
        candidates.retain(|d| *d != selected);

        ctx.activity.using(selected);
        let result = ctx.network.request_global(
            selected,
            &state.folder,
            &state.file.name,
            block.offset,
            block.size,
            &block.hash,
        );
        ctx.activity.done(selected);

        let bytes = match result {
            Ok(bytes) => bytes,
            Err(e) => {
                last_error = Some(e);
                continue;
            }
        };

        let observed = *blake3::hash(&bytes).as_bytes();
        if observed != block.hash {
            last_error = Some(SyncError::ChecksumMismatch {
                expected: hex_digest(&block.hash),
                actual: hex_digest(&observed),
            });
            continue;
        }

        match state
            .temp_file()
            .and_then(|f| f.write_all_at(&bytes, block.offset).map_err(|e| SyncError::io("save", e)))
        {
            Ok(()) => state.pull_done(),
            Err(e) => state.fail_with(e),
        }
        break;
    }

    let _ = ctx.finisher_tx.send(state);
}

fn hex_digest(hash: &[u8; 32]) -> String {
    hash.iter().map(|b| format!("{b:02x}")).collect()
}
