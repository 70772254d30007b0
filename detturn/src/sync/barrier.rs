/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Barrier wrappers.
//!
//! The runtime tracks arrival counts itself so the last arriver can detect
//! that it is last and broadcast to the others; nobody ever blocks inside a
//! native barrier on the deterministic path.  The releasing thread cycles
//! the turn (put then get) after broadcasting so that the release and the
//! released threads get distinct turn numbers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::Barrier as NativeBarrier;
use std::sync::Mutex;

use detturn_model::Ins;
use detturn_model::SyncOp;
use detturn_model::Turn;
use nix::errno::Errno;

use crate::scheduler::Channel;
use crate::Runtime;

/// Per-barrier bookkeeping, keyed by channel in the runtime's table.
/// Inserted on init, mutated only while holding the turn, removed on
/// destroy.
#[derive(Debug)]
pub(crate) struct BarrierState {
    pub count: u32,
    pub narrived: u32,
}

/// The table type held by the runtime.
pub(crate) type BarrierTable = Mutex<HashMap<Channel, BarrierState>>;

struct BarrierMarker {
    native: NativeBarrier,
}

/// A deterministic barrier handle.  Clones refer to the same barrier.
#[derive(Clone)]
pub struct DetBarrier {
    state: Arc<BarrierMarker>,
}

impl fmt::Debug for DetBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetBarrier")
            .field("chan", &format_args!("{:#x}", self.chan()))
            .finish()
    }
}

impl DetBarrier {
    /// The wait channel: the address of the shared state.
    pub fn chan(&self) -> Channel {
        Arc::as_ptr(&self.state) as Channel
    }
}

impl Runtime {
    /// Create a barrier for `count` arrivers.  A count of zero is invalid.
    pub fn barrier_init(&self, ins: Ins, count: u32) -> Result<DetBarrier, Errno> {
        if count == 0 {
            return Err(Errno::EINVAL);
        }
        let b = DetBarrier {
            state: Arc::new(BarrierMarker {
                native: NativeBarrier::new(count as usize),
            }),
        };
        if self.passthrough() {
            return Ok(b);
        }
        if self.in_nondet() {
            self.note_nondet_obj(b.chan());
            return Ok(b);
        }
        let ctx = self.sched_start();
        {
            let mut tab = self.barriers.lock().expect("barrier table poisoned");
            let old = tab.insert(b.chan(), BarrierState { count, narrived: 0 });
            assert!(old.is_none(), "barrier already initialized");
        }
        self.sched_end(
            &ctx,
            ins,
            SyncOp::BarrierInit,
            false,
            &[b.chan() as u64, count as u64],
        );
        Ok(b)
    }

    /// Arrive at the barrier.  Exactly one arriver of each cycle (the last)
    /// gets `true`, the analog of `PTHREAD_BARRIER_SERIAL_THREAD`.
    pub fn barrier_wait(&self, ins: Ins, b: &DetBarrier) -> Result<bool, Errno> {
        if self.passthrough() {
            return Ok(b.state.native.wait().is_leader());
        }
        if self.in_nondet() {
            self.note_nondet_obj(b.chan());
            return Ok(b.state.native.wait().is_leader());
        }
        let ctx = self.sched_start();
        self.warn_if_contaminated(b.chan());
        self.sched_end_fh(&ctx, ins, SyncOp::BarrierWait, &[b.chan() as u64]);

        let last_arriver = {
            let mut tab = self.barriers.lock().expect("barrier table poisoned");
            let st = tab
                .get_mut(&b.chan())
                .expect("barrier is not initialized");
            st.narrived += 1;
            assert!(st.narrived <= st.count, "barrier overflow");
            if st.narrived == st.count {
                st.narrived = 0; // the barrier may be reused
                true
            } else {
                false
            }
        };

        let serial = if last_arriver {
            self.sched.signal(&ctx.desc, b.chan(), true);
            // Distinct turn numbers for the releaser and the released.
            self.sched.put_turn(&ctx.desc, false);
            self.sched.get_turn(&ctx.desc);
            true
        } else {
            let _ = self.sched.wait(&ctx.desc, Some(b.chan()), Turn::MAX);
            false
        };
        if self.config().log_sync {
            ctx.sched_time.set(ctx.update_time());
        }

        self.sched_end(&ctx, ins, SyncOp::BarrierWait, false, &[b.chan() as u64]);
        Ok(serial)
    }

    /// Destroy the barrier.  `EBUSY` while any cycle is incomplete.
    pub fn barrier_destroy(&self, ins: Ins, b: DetBarrier) -> Result<(), Errno> {
        if self.passthrough() {
            return Ok(());
        }
        if self.in_nondet() {
            self.note_nondet_obj(b.chan());
            return Ok(());
        }
        let ctx = self.sched_start();
        let res = {
            let mut tab = self.barriers.lock().expect("barrier table poisoned");
            let st = tab.get(&b.chan()).expect("barrier is not initialized");
            if st.narrived != 0 || self.sched.has_waiters_on(b.chan()) {
                Err(Errno::EBUSY)
            } else {
                tab.remove(&b.chan());
                Ok(())
            }
        };
        let code = res.err().map(|e| e as u64).unwrap_or(0);
        self.sched_end(
            &ctx,
            ins,
            SyncOp::BarrierDestroy,
            false,
            &[b.chan() as u64, code],
        );
        res
    }
}
