/*!
 * The puller subsystem (spec §4.4–§4.9): per-file shared state, the three
 * pipeline stages, the iteration driver, and the per-folder serve loop.
 */

pub mod copier;
pub mod finisher;
pub mod iteration;
pub mod pull_stage;
pub mod serve;
pub mod state;
