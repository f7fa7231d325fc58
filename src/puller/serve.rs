/*!
 * Folder serve loop (C9, spec §4.9): a timer-driven state machine that
 * interleaves scans and puller iterations for one folder, with stall
 * backoff and jittered rescans.
 */

use std::time::Duration;

use crossbeam_channel::{after, select, Receiver};
use rand::Rng;

use crate::config::{FolderConfig, CHECK_PULL_INTV, NEXT_PULL_INTV, PAUSE_INTV};
use crate::error::Result;
use crate::index::FolderState;

use super::iteration::{run_iteration, IterationContext};

/// A scan interval this large is effectively "never": used when
/// `Tunables::scan_intv` is zero (periodic rescans disabled).
const NO_RESCAN: Duration = Duration::from_secs(315_360_000);

/// Near-zero initial delay so the first scan runs essentially immediately.
const INITIAL_SCAN_DELAY: Duration = Duration::from_millis(1);

/// Runs the serve loop for one folder until `stop` closes or a scan fails
/// (which invalidates the folder and exits).
pub fn run_serve_loop(cfg: &FolderConfig, ctx: &IterationContext, stop: &Receiver<()>) {
    let folder = cfg.folder_id.as_str();

    let mut pull_intv = CHECK_PULL_INTV;
    let mut scan_intv = INITIAL_SCAN_DELAY;
    let mut prev_ver: i64 = 0;
    let mut initial_scan_completed = false;

    loop {
        let pull_timer = after(pull_intv);
        let scan_timer = after(scan_intv);

        select! {
            recv(stop) -> _ => {
                set_state(ctx, folder, FolderState::Idle);
                return;
            }
            recv(pull_timer) -> _ => {
                pull_intv = on_pull_tick(cfg, ctx, &mut prev_ver, initial_scan_completed);
            }
            recv(scan_timer) -> _ => {
                match on_scan_tick(cfg, ctx) {
                    Ok(next) => {
                        scan_intv = next;
                        if !initial_scan_completed {
                            initial_scan_completed = true;
                            tracing::debug!(folder = %folder, "initial scan completed");
                        }
                    }
                    Err(e) => {
                        ctx.index.invalidate_folder(folder, &e.to_string());
                        tracing::warn!(folder = %folder, error = %e, "scan failed, folder invalidated");
                        return;
                    }
                }
            }
        }
    }
}

fn set_state(ctx: &IterationContext, folder: &str, state: FolderState) {
    ctx.index.set_state(folder, state);
    ctx.progress.state_changed(folder, state);
}

fn on_pull_tick(
    cfg: &FolderConfig,
    ctx: &IterationContext,
    prev_ver: &mut i64,
    initial_scan_completed: bool,
) -> Duration {
    let folder = cfg.folder_id.as_str();

    if !initial_scan_completed {
        return NEXT_PULL_INTV;
    }

    let cur_ver = ctx.index.remote_local_version(folder);
    if cur_ver == *prev_ver {
        return CHECK_PULL_INTV;
    }

    set_state(ctx, folder, FolderState::Syncing);

    let mut settled = false;
    for attempt in 1..=11u32 {
        let changed = run_iteration(cfg, ctx);
        if changed == 0 {
            let reread = ctx.index.remote_local_version(folder);
            *prev_ver = if reread < cur_ver { reread } else { cur_ver };
            settled = true;
            break;
        }
        if attempt == 11 {
            tracing::warn!(folder = %folder, "puller iteration did not settle after 11 attempts");
        }
    }

    set_state(ctx, folder, FolderState::Idle);

    if settled {
        NEXT_PULL_INTV
    } else {
        PAUSE_INTV
    }
}

fn on_scan_tick(cfg: &FolderConfig, ctx: &IterationContext) -> Result<Duration> {
    let folder = cfg.folder_id.as_str();

    set_state(ctx, folder, FolderState::Scanning);
    let result = ctx.index.scan_folder(folder);
    set_state(ctx, folder, FolderState::Idle);
    result?;

    if cfg.tunables.scan_intv.is_zero() {
        return Ok(NO_RESCAN);
    }
    Ok(jittered_interval(cfg.tunables.scan_intv))
}

fn jittered_interval(base: Duration) -> Duration {
    let factor: f64 = rand::thread_rng().gen_range(0.75..=1.25);
    Duration::from_secs_f64(base.as_secs_f64() * factor)
}
