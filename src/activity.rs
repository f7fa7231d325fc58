/*!
 * DeviceActivity: process-wide count of in-flight requests per source
 * device, used to pick the least-busy candidate (spec §3.4, §4.3).
 *
 * The teacher keeps a single global mutable registry for request counting;
 * here it is a context-passed service object instead (spec §9 design note:
 * "replace process-wide mutable state with a context-passed service object
 * so the core is testable in isolation").
 */

use std::collections::HashMap;
use std::sync::Mutex;

pub type DeviceId = u64;

/// The zero device id is the sentinel returned by `least_busy` when given no
/// candidates.
pub const NO_DEVICE: DeviceId = 0;

#[derive(Debug, Default)]
pub struct DeviceActivity {
    counts: Mutex<HashMap<DeviceId, u64>>,
}

impl DeviceActivity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments the in-flight count for `device`.
    pub fn using(&self, device: DeviceId) {
        let mut counts = self.counts.lock().unwrap();
        *counts.entry(device).or_insert(0) += 1;
    }

    /// Decrements the in-flight count for `device`.
    pub fn done(&self, device: DeviceId) {
        let mut counts = self.counts.lock().unwrap();
        if let Some(c) = counts.get_mut(&device) {
            *c = c.saturating_sub(1);
        }
    }

    /// Returns the candidate with the smallest in-flight count; ties broken
    /// arbitrarily (first seen). Returns [`NO_DEVICE`] if `candidates` is
    /// empty.
    pub fn least_busy(&self, candidates: &[DeviceId]) -> DeviceId {
        if candidates.is_empty() {
            return NO_DEVICE;
        }
        let counts = self.counts.lock().unwrap();
        *candidates
            .iter()
            .min_by_key(|d| counts.get(d).copied().unwrap_or(0))
            .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_candidates_returns_zero_device() {
        let activity = DeviceActivity::new();
        assert_eq!(activity.least_busy(&[]), NO_DEVICE);
    }

    #[test]
    fn least_busy_prefers_idle_device() {
        let activity = DeviceActivity::new();
        activity.using(1);
        activity.using(1);
        // With device 1 busy twice and 2, 3 idle, the answer must be 2 or 3.
        let chosen = activity.least_busy(&[1, 2, 3]);
        assert!(chosen == 2 || chosen == 3);
    }

    #[test]
    fn using_and_done_are_linearizable_per_device() {
        let activity = DeviceActivity::new();
        activity.using(5);
        activity.using(5);
        activity.done(5);
        // One request still in flight for device 5, so a competing idle
        // device must win.
        assert_eq!(activity.least_busy(&[5, 6]), 6);
    }

    #[test]
    fn three_candidates_two_in_flight_on_one_device() {
        let activity = DeviceActivity::new();
        activity.using(10);
        activity.using(10);
        let chosen = activity.least_busy(&[10, 20, 30]);
        assert!(chosen == 20 || chosen == 30);
    }
}
