/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! A snapshot of the runtime's counters, printed on close when
//! `record_runtime_stat` is set.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Counters accumulated over one run.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    /// Wrapped sync operations executed under the turn protocol.
    pub det_sync_ops: u64,
    /// Wrapped sync operations that passed through inside non-det regions.
    pub nondet_sync_ops: u64,
    /// Operations routed through the external block/wakeup protocol.
    pub inter_proc_ops: u64,
    /// Lineups that filled before their timeout.
    pub lineup_successes: u64,
    /// Lineups released by their turn-count timeout.
    pub lineup_timeouts: u64,
    /// Non-det regions entered.
    pub non_det_regions: u64,
    /// Absolute-time conversions that fell back to the wall clock because no
    /// base time was set.  Any nonzero value means the run was not
    /// deterministic.
    pub wallclock_fallbacks: u64,
}

impl fmt::Display for RunStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "deterministic sync ops:   {}", self.det_sync_ops)?;
        writeln!(f, "non-det sync ops:         {}", self.nondet_sync_ops)?;
        writeln!(f, "inter-process ops:        {}", self.inter_proc_ops)?;
        writeln!(f, "lineup successes:         {}", self.lineup_successes)?;
        writeln!(f, "lineup timeouts:          {}", self.lineup_timeouts)?;
        writeln!(f, "non-det regions:          {}", self.non_det_regions)?;
        write!(f, "wall-clock fallbacks:     {}", self.wallclock_fallbacks)
    }
}
