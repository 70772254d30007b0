/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Non-deterministic regions: scoped opt-outs from the turn protocol.
//!
//! A thread entering a region first waits on a global sentinel channel; the
//! scheduler releases sentinel waiters only once no other application
//! thread is runnable, which maximizes the concurrency available to the
//! regions.  The thread then detaches (`block`) and runs natively until
//! `non_det_end` re-attaches it (`wakeup`).
//!
//! The contract is that a sync object must not be used both inside and
//! outside non-det regions.  Objects touched inside a region are remembered
//! and a deterministic wrapper touching one later warns.

use std::collections::HashSet;
use std::sync::Mutex;

use detturn_model::SyncOp;
use detturn_model::Turn;
use detturn_model::INVALID_INS;

use crate::scheduler::Channel;
use crate::scheduler::NONDET_SENTINEL;
use crate::thread_state;
use crate::Runtime;

/// The set of channels touched inside non-det regions.
pub(crate) type NonDetVars = Mutex<HashSet<Channel>>;

impl Runtime {
    /// Enter a non-det region.  Blocks until every other application thread
    /// is off the run queue, then detaches the caller from deterministic
    /// scheduling.
    pub fn non_det_start(&self) {
        if self.passthrough() || !self.config().enforce_non_det_annotations {
            return;
        }
        let ctx = self.sched_start();
        self.stats.add_non_det_region();

        // Parked like a lineup with an unlimited timeout; the scheduler
        // promotes sentinel waiters once the run queue drains.
        let _ = self.sched.wait(&ctx.desc, Some(NONDET_SENTINEL), Turn::MAX);

        self.sched_end(&ctx, INVALID_INS, SyncOp::NonDetStart, false, &[]);

        self.sched.block(&ctx.desc);
        assert!(!ctx.in_non_det.get());
        ctx.in_non_det.set(true);
    }

    /// Leave a non-det region and rejoin the run queue.  The thread is
    /// runnable again before its next deterministic wrapper completes.
    pub fn non_det_end(&self) {
        if self.passthrough() || !self.config().enforce_non_det_annotations {
            return;
        }
        let ctx = thread_state::current();
        assert!(ctx.in_non_det.get(), "non_det_end outside a non-det region");
        ctx.in_non_det.set(false);
        // Rejoin without taking a turn: the next deterministic wrapper on
        // this thread serializes normally from the queue tail.
        self.sched.wakeup(&ctx.desc);
    }

    /// Is the calling thread inside a non-det region (with the annotations
    /// honored)?
    pub(crate) fn in_nondet(&self) -> bool {
        self.config().enforce_non_det_annotations
            && thread_state::try_current().map_or(false, |c| c.in_non_det.get())
    }

    /// Remember a sync object touched inside a non-det region.
    pub(crate) fn note_nondet_obj(&self, chan: Channel) {
        self.stats.add_nondet_sync();
        self.nondet_vars
            .lock()
            .expect("nondet var set poisoned")
            .insert(chan);
    }

    /// Warn when a deterministic wrapper touches an object that was used in
    /// a non-det region; the user contract is to never mix the two.
    pub(crate) fn warn_if_contaminated(&self, chan: Channel) {
        if !self.config().enforce_non_det_annotations {
            return;
        }
        let contaminated = self
            .nondet_vars
            .lock()
            .expect("nondet var set poisoned")
            .contains(&chan);
        if contaminated {
            tracing::warn!(
                "sync object {:#x} was accessed in a non-det region and is now used deterministically",
                chan
            );
        }
    }
}
