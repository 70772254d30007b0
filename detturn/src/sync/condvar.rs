/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Condition variable wrappers.
//!
//! Condvars are *not* implemented on top of a native condvar: a native
//! wait/signal pair lets the native runtime choose which waiter wakes, and
//! determinism requires that choice to be ours.  All waiting happens on the
//! scheduler's wait queue; the object below only supplies a stable channel
//! address, plus a real sleep mechanism for non-det passthrough.
//!
//! A wait logs two halves.  The first half orders the mutex release (the
//! mutex is handed off with a deterministic `signal` while still under the
//! turn); the second half orders the re-acquisition, for which the woken
//! thread competes through the ordinary lock helper.  Events on other
//! threads fall between the two halves, which is what lets an offline tool
//! reconstruct the effective ordering.

use std::fmt;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::time::SystemTime;

use detturn_model::Ins;
use detturn_model::SyncOp;
use detturn_model::Turn;
use nix::errno::Errno;

use crate::scheduler::Channel;
use crate::scheduler::WaitResult;
use crate::sync::mutex::DetMutex;
use crate::Runtime;

pub(crate) struct CondvarState {
    // Generation counter for non-det passthrough sleeps only.
    gen: Mutex<u64>,
    cv: Condvar,
}

impl fmt::Debug for CondvarState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CondvarState").finish()
    }
}

impl CondvarState {
    fn new() -> Self {
        CondvarState {
            gen: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    fn native_wait(&self, mu: &DetMutex) {
        let guard = self.gen.lock().expect("condvar lock poisoned");
        let seen = *guard;
        // Release the user mutex only after taking the condvar lock, or a
        // racing notify could be missed.
        mu.state().unlock();
        let _guard = self
            .cv
            .wait_while(guard, |g| *g == seen)
            .expect("condvar lock poisoned");
        drop(_guard);
        mu.state().lock_native();
    }

    fn native_wait_until(&self, mu: &DetMutex, abstime: SystemTime) -> bool {
        let rel = abstime
            .duration_since(SystemTime::now())
            .unwrap_or(std::time::Duration::ZERO);
        let guard = self.gen.lock().expect("condvar lock poisoned");
        let seen = *guard;
        mu.state().unlock();
        let (guard, res) = self
            .cv
            .wait_timeout_while(guard, rel, |g| *g == seen)
            .expect("condvar lock poisoned");
        drop(guard);
        mu.state().lock_native();
        !res.timed_out()
    }

    fn native_notify(&self, all: bool) {
        let mut guard = self.gen.lock().expect("condvar lock poisoned");
        *guard += 1;
        drop(guard);
        if all {
            self.cv.notify_all();
        } else {
            // The native runtime picks a waiter; acceptable only inside
            // non-det regions.
            self.cv.notify_one();
        }
    }
}

/// A deterministic condition variable handle.  Clones refer to the same
/// condvar.  Unlike the lock types there is no init wrapper: creating one is
/// not a synchronization event.
#[derive(Clone)]
pub struct DetCondvar {
    state: Arc<CondvarState>,
}

impl fmt::Debug for DetCondvar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetCondvar")
            .field("chan", &format_args!("{:#x}", self.chan()))
            .finish()
    }
}

impl Default for DetCondvar {
    fn default() -> Self {
        Self::new()
    }
}

impl DetCondvar {
    /// A fresh condition variable.
    pub fn new() -> Self {
        DetCondvar {
            state: Arc::new(CondvarState::new()),
        }
    }

    /// The wait channel: the address of the shared state.
    pub fn chan(&self) -> Channel {
        Arc::as_ptr(&self.state) as Channel
    }
}

impl Runtime {
    /// Wait on `cv`, releasing `mu`; returns holding `mu` again.
    pub fn cond_wait(&self, ins: Ins, cv: &DetCondvar, mu: &DetMutex) -> Result<(), Errno> {
        if self.passthrough() {
            cv.state.native_wait(mu);
            return Ok(());
        }
        if self.in_nondet() {
            self.note_nondet_obj(cv.chan());
            self.note_nondet_obj(mu.chan());
            cv.state.native_wait(mu);
            return Ok(());
        }
        let ctx = self.sched_start();
        self.warn_if_contaminated(cv.chan());
        self.warn_if_contaminated(mu.chan());

        mu.state().unlock();
        self.sched.signal(&ctx.desc, mu.chan(), false);
        self.sched_end_fh(&ctx, ins, SyncOp::CondWait, &[cv.chan() as u64, mu.chan() as u64]);

        let _ = self.sched.wait(&ctx.desc, Some(cv.chan()), Turn::MAX);
        if self.config().log_sync {
            ctx.sched_time.set(ctx.update_time());
        }
        self.lock_indefinitely(&ctx, mu);

        self.sched_end(
            &ctx,
            ins,
            SyncOp::CondWait,
            false,
            &[cv.chan() as u64, mu.chan() as u64],
        );
        Ok(())
    }

    /// Wait with an absolute deadline.  On timeout, `ETIMEDOUT` is returned
    /// but the mutex is re-acquired first, as the native surface promises.
    pub fn cond_timedwait(
        &self,
        ins: Ins,
        cv: &DetCondvar,
        mu: &DetMutex,
        abstime: SystemTime,
    ) -> Result<(), Errno> {
        if self.passthrough() || self.in_nondet() {
            if self.in_nondet() {
                self.note_nondet_obj(cv.chan());
                self.note_nondet_obj(mu.chan());
            }
            return if cv.state.native_wait_until(mu, abstime) {
                Ok(())
            } else {
                Err(Errno::ETIMEDOUT)
            };
        }
        let ctx = self.sched_start();
        self.warn_if_contaminated(cv.chan());
        self.warn_if_contaminated(mu.chan());

        mu.state().unlock();
        self.sched.signal(&ctx.desc, mu.chan(), false);
        self.sched_end_fh(
            &ctx,
            ins,
            SyncOp::CondTimedwait,
            &[cv.chan() as u64, mu.chan() as u64],
        );

        let deadline = self.abs_deadline(&ctx, abstime);
        let res = self.sched.wait(&ctx.desc, Some(cv.chan()), deadline);
        if self.config().log_sync {
            ctx.sched_time.set(ctx.update_time());
        }
        self.lock_indefinitely(&ctx, mu);

        let timedout = res == WaitResult::TimedOut;
        let code = if timedout { Errno::ETIMEDOUT as u64 } else { 0 };
        self.sched_end(
            &ctx,
            ins,
            SyncOp::CondTimedwait,
            timedout,
            &[cv.chan() as u64, mu.chan() as u64, code],
        );
        if timedout {
            Err(Errno::ETIMEDOUT)
        } else {
            Ok(())
        }
    }

    /// Wake the oldest waiter on `cv`, if any.
    pub fn cond_signal(&self, ins: Ins, cv: &DetCondvar) {
        if self.passthrough() {
            cv.state.native_notify(false);
            return;
        }
        if self.in_nondet() {
            self.note_nondet_obj(cv.chan());
            cv.state.native_notify(false);
            return;
        }
        let ctx = self.sched_start();
        self.warn_if_contaminated(cv.chan());
        self.sched.signal(&ctx.desc, cv.chan(), false);
        self.sched_end(&ctx, ins, SyncOp::CondSignal, false, &[cv.chan() as u64]);
    }

    /// Wake every waiter on `cv`, in their arrival order.
    pub fn cond_broadcast(&self, ins: Ins, cv: &DetCondvar) {
        if self.passthrough() {
            cv.state.native_notify(true);
            return;
        }
        if self.in_nondet() {
            self.note_nondet_obj(cv.chan());
            cv.state.native_notify(true);
            return;
        }
        let ctx = self.sched_start();
        self.warn_if_contaminated(cv.chan());
        self.sched.signal(&ctx.desc, cv.chan(), true);
        self.sched_end(&ctx, ins, SyncOp::CondBroadcast, false, &[cv.chan() as u64]);
    }
}
