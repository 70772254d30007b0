/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Lineups: soft barriers with a turn-count timeout.
//!
//! A lineup is a named rendezvous of up to `count` threads.  Arrivers wait
//! until the lineup fills or until the timeout elapses, whichever is first,
//! then all proceed; the reference count then drains back through `end`
//! before a new cycle can begin.  This is the one primitive that is
//! explicitly non-blocking-on-full: it exists to coax aligned scheduling
//! out of selected call sites, not to enforce anything.
//!
//! Lineups are identified by an application-chosen opaque id.  The wait
//! channel is the address of the boxed slot, which is stable for the
//! slot's lifetime.

use std::collections::HashMap;
use std::sync::Mutex;

use detturn_model::Ins;
use detturn_model::SyncOp;

use crate::scheduler::Channel;
use crate::Runtime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineupPhase {
    Arriving,
    Leaving,
}

/// One lineup's state.  Boxed in the table so its address can serve as the
/// wait channel.
#[derive(Debug)]
pub(crate) struct LineupSlot {
    count: u32,
    nactive: u32,
    timeout_turns: u64,
    phase: LineupPhase,
}

impl LineupSlot {
    fn chan(&self) -> Channel {
        self as *const LineupSlot as Channel
    }
}

/// The table type held by the runtime.
pub(crate) type LineupTable = Mutex<HashMap<u64, Box<LineupSlot>>>;

impl Runtime {
    /// Register a lineup.  Reusing a live id or a zero count is a
    /// programmer error that would compromise determinism, and aborts.
    pub fn lineup_init(&self, ins: Ins, id: u64, count: u32, timeout_turns: u64) {
        assert!(count > 0, "lineup {} initialized with count 0", id);
        if self.passthrough() {
            return;
        }
        if self.in_nondet() {
            self.note_nondet_obj(id as Channel);
            return;
        }
        let ctx = self.sched_start();
        {
            let mut tab = self.lineups.lock().expect("lineup table poisoned");
            if tab.contains_key(&id) {
                panic!("lineup {} already initialized", id);
            }
            tab.insert(
                id,
                Box::new(LineupSlot {
                    count,
                    nactive: 0,
                    timeout_turns,
                    phase: LineupPhase::Arriving,
                }),
            );
        }
        self.sched_end(
            &ctx,
            ins,
            SyncOp::LineupInit,
            false,
            &[id, count as u64, timeout_turns],
        );
    }

    /// Remove a lineup.
    pub fn lineup_destroy(&self, ins: Ins, id: u64) {
        if self.passthrough() {
            return;
        }
        if self.in_nondet() {
            self.note_nondet_obj(id as Channel);
            return;
        }
        let ctx = self.sched_start();
        {
            let mut tab = self.lineups.lock().expect("lineup table poisoned");
            tab.remove(&id)
                .unwrap_or_else(|| panic!("lineup {} is not initialized", id));
        }
        self.sched_end(&ctx, ins, SyncOp::LineupDestroy, false, &[id]);
    }

    /// Arrive at the lineup; proceeds when it fills or when the timeout
    /// elapses.
    pub fn lineup_start(&self, ins: Ins, id: u64) {
        if self.passthrough() {
            return;
        }
        if self.in_nondet() {
            self.note_nondet_obj(id as Channel);
            return;
        }
        let ctx = self.sched_start();

        let mut tab = self.lineups.lock().expect("lineup table poisoned");
        let slot = tab
            .get_mut(&id)
            .unwrap_or_else(|| panic!("lineup {} is not initialized", id));
        slot.nactive += 1;
        let chan = slot.chan();

        if slot.phase == LineupPhase::Arriving {
            if slot.nactive == slot.count {
                // Full: do not reset nactive, the barrier is reference
                // counted and drains through lineup_end.
                slot.phase = LineupPhase::Leaving;
                drop(tab);
                self.stats.add_lineup_success();
                self.sched.signal(&ctx.desc, chan, true);
            } else {
                let deadline = self
                    .sched
                    .turn_count()
                    .deadline_after(slot.timeout_turns);
                drop(tab);
                let _ = self.sched.wait(&ctx.desc, Some(chan), deadline);
                // Re-check: the first waiter whose deadline fires flips the
                // phase and releases everyone else.
                let mut tab = self.lineups.lock().expect("lineup table poisoned");
                let slot = tab
                    .get_mut(&id)
                    .unwrap_or_else(|| panic!("lineup {} is not initialized", id));
                if slot.nactive < slot.count && slot.phase == LineupPhase::Arriving {
                    slot.phase = LineupPhase::Leaving;
                    drop(tab);
                    self.stats.add_lineup_timeout();
                    self.sched.signal(&ctx.desc, chan, true);
                }
            }
        } else {
            drop(tab);
        }

        self.sched_end(&ctx, ins, SyncOp::LineupStart, false, &[id]);
    }

    /// Leave the lineup; the last leaver re-arms it for the next cycle.
    pub fn lineup_end(&self, ins: Ins, id: u64) {
        if self.passthrough() {
            return;
        }
        if self.in_nondet() {
            self.note_nondet_obj(id as Channel);
            return;
        }
        let ctx = self.sched_start();
        {
            let mut tab = self.lineups.lock().expect("lineup table poisoned");
            let slot = tab
                .get_mut(&id)
                .unwrap_or_else(|| panic!("lineup {} is not initialized", id));
            assert!(slot.nactive > 0, "lineup {} end without matching start", id);
            slot.nactive -= 1;
            if slot.nactive == 0 && slot.phase == LineupPhase::Leaving {
                slot.phase = LineupPhase::Arriving;
            }
        }
        self.sched_end(&ctx, ins, SyncOp::LineupEnd, false, &[id]);
    }
}
