/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Runtime counters, maintained when `record_runtime_stat` is set.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use detturn_model::RunStats;

/// Live counters.  Cheap enough to bump unconditionally on hot paths, but
/// gated by configuration at the call sites to match the printed summary.
#[derive(Debug, Default)]
pub(crate) struct RuntimeStats {
    det_sync_ops: AtomicU64,
    nondet_sync_ops: AtomicU64,
    inter_proc_ops: AtomicU64,
    lineup_successes: AtomicU64,
    lineup_timeouts: AtomicU64,
    non_det_regions: AtomicU64,
    wallclock_fallbacks: AtomicU64,
}

impl RuntimeStats {
    pub fn add_det_sync(&self) {
        self.det_sync_ops.fetch_add(1, Ordering::Relaxed);
    }
    pub fn add_nondet_sync(&self) {
        self.nondet_sync_ops.fetch_add(1, Ordering::Relaxed);
    }
    pub fn add_inter_proc(&self) {
        self.inter_proc_ops.fetch_add(1, Ordering::Relaxed);
    }
    pub fn add_lineup_success(&self) {
        self.lineup_successes.fetch_add(1, Ordering::Relaxed);
    }
    pub fn add_lineup_timeout(&self) {
        self.lineup_timeouts.fetch_add(1, Ordering::Relaxed);
    }
    pub fn add_non_det_region(&self) {
        self.non_det_regions.fetch_add(1, Ordering::Relaxed);
    }
    pub fn add_wallclock_fallback(&self) {
        self.wallclock_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// A consistent-enough copy for printing and for tests.
    pub fn snapshot(&self) -> RunStats {
        RunStats {
            det_sync_ops: self.det_sync_ops.load(Ordering::Relaxed),
            nondet_sync_ops: self.nondet_sync_ops.load(Ordering::Relaxed),
            inter_proc_ops: self.inter_proc_ops.load(Ordering::Relaxed),
            lineup_successes: self.lineup_successes.load(Ordering::Relaxed),
            lineup_timeouts: self.lineup_timeouts.load(Ordering::Relaxed),
            non_det_regions: self.non_det_regions.load(Ordering::Relaxed),
            wallclock_fallbacks: self.wallclock_fallbacks.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_bumps() {
        let s = RuntimeStats::default();
        s.add_det_sync();
        s.add_det_sync();
        s.add_lineup_timeout();
        let snap = s.snapshot();
        assert_eq!(snap.det_sync_ops, 2);
        assert_eq!(snap.lineup_timeouts, 1);
        assert_eq!(snap.non_det_regions, 0);
    }
}
