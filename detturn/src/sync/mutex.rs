/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Mutex wrappers.
//!
//! Lock is a loop of native trylock and scheduler wait, so the head of the
//! run queue never blocks inside the native primitive.  Unlock signals the
//! wait channel *before* releasing the turn: two independent unlocks must
//! not be able to swap their wake effects, and issuing the signal while
//! still holding the turn fixes the wake order to the unlock's turn order.

use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;

use detturn_model::Ins;
use detturn_model::SyncOp;
use detturn_model::Turn;
use nix::errno::Errno;
use parking_lot::lock_api::RawMutex as RawMutexApi;
use parking_lot::lock_api::RawMutexTimed;
use parking_lot::RawMutex;

use crate::clock;
use crate::scheduler::Channel;
use crate::scheduler::WaitResult;
use crate::thread_state::ThreadCtx;
use crate::Runtime;

pub(crate) struct MutexState {
    raw: RawMutex,
    held: AtomicBool,
}

impl fmt::Debug for MutexState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutexState")
            .field("held", &self.held.load(Ordering::Relaxed))
            .finish()
    }
}

impl MutexState {
    fn new() -> Self {
        MutexState {
            raw: RawMutex::INIT,
            held: AtomicBool::new(false),
        }
    }

    pub(crate) fn try_lock(&self) -> bool {
        if self.raw.try_lock() {
            self.held.store(true, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    pub(crate) fn lock_native(&self) {
        self.raw.lock();
        self.held.store(true, Ordering::Relaxed);
    }

    fn try_lock_native_for(&self, dur: Duration) -> bool {
        if self.raw.try_lock_for(dur) {
            self.held.store(true, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    pub(crate) fn unlock(&self) {
        if !self.held.swap(false, Ordering::Relaxed) {
            panic!("unlock of a mutex that is not held");
        }
        unsafe { self.raw.unlock() };
    }
}

/// A deterministic mutex handle.  Clones refer to the same mutex.
#[derive(Clone)]
pub struct DetMutex {
    state: Arc<MutexState>,
}

impl fmt::Debug for DetMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetMutex")
            .field("chan", &format_args!("{:#x}", self.chan()))
            .finish()
    }
}

impl DetMutex {
    pub(crate) fn state(&self) -> &MutexState {
        &self.state
    }

    /// The wait channel: the address of the shared state.
    pub fn chan(&self) -> Channel {
        Arc::as_ptr(&self.state) as Channel
    }
}

impl Runtime {
    /// Create a mutex.
    pub fn mutex_init(&self, ins: Ins) -> DetMutex {
        let m = DetMutex {
            state: Arc::new(MutexState::new()),
        };
        if self.passthrough() {
            return m;
        }
        if self.in_nondet() {
            self.note_nondet_obj(m.chan());
            return m;
        }
        let ctx = self.sched_start();
        self.sched_end(&ctx, ins, SyncOp::MutexInit, false, &[m.chan() as u64]);
        m
    }

    /// Destroy a mutex.  Purely a log point; the storage is dropped with the
    /// last handle.
    pub fn mutex_destroy(&self, ins: Ins, m: DetMutex) {
        if self.passthrough() {
            return;
        }
        if self.in_nondet() {
            self.note_nondet_obj(m.chan());
            return;
        }
        let ctx = self.sched_start();
        self.sched_end(&ctx, ins, SyncOp::MutexDestroy, false, &[m.chan() as u64]);
    }

    /// Acquire, waiting deterministically if the mutex is busy.
    pub fn mutex_lock(&self, ins: Ins, m: &DetMutex) -> Result<(), Errno> {
        if self.passthrough() {
            m.state.lock_native();
            return Ok(());
        }
        if self.in_nondet() {
            self.note_nondet_obj(m.chan());
            m.state.lock_native();
            return Ok(());
        }
        let ctx = self.sched_start();
        self.warn_if_contaminated(m.chan());
        self.lock_indefinitely(&ctx, m);
        self.sched_end(&ctx, ins, SyncOp::MutexLock, false, &[m.chan() as u64]);
        Ok(())
    }

    /// One native trylock under the turn; never waits.  This preserves
    /// trylock semantics while still serializing the outcome.
    pub fn mutex_trylock(&self, ins: Ins, m: &DetMutex) -> Result<(), Errno> {
        if self.passthrough() {
            return if m.state.try_lock() { Ok(()) } else { Err(Errno::EBUSY) };
        }
        if self.in_nondet() {
            self.note_nondet_obj(m.chan());
            return if m.state.try_lock() { Ok(()) } else { Err(Errno::EBUSY) };
        }
        let ctx = self.sched_start();
        self.warn_if_contaminated(m.chan());
        let res = if m.state.try_lock() {
            Ok(())
        } else {
            Err(Errno::EBUSY)
        };
        let code = res.err().map(|e| e as u64).unwrap_or(0);
        self.sched_end(
            &ctx,
            ins,
            SyncOp::MutexTrylock,
            false,
            &[m.chan() as u64, code],
        );
        res
    }

    /// Acquire with an absolute wall-clock deadline, converted to a logical
    /// one against the caller's base time.
    pub fn mutex_timedlock(
        &self,
        ins: Ins,
        m: &DetMutex,
        abstime: SystemTime,
    ) -> Result<(), Errno> {
        if self.passthrough() || self.in_nondet() {
            if self.in_nondet() {
                self.note_nondet_obj(m.chan());
            }
            let rel = abstime
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO);
            return if m.state.try_lock_native_for(rel) {
                Ok(())
            } else {
                Err(Errno::ETIMEDOUT)
            };
        }
        let ctx = self.sched_start();
        self.warn_if_contaminated(m.chan());
        let deadline = self.abs_deadline(&ctx, abstime);
        let res = self.mutex_lock_helper(&ctx, m, deadline);
        let code = res.err().map(|e| e as u64).unwrap_or(0);
        self.sched_end(
            &ctx,
            ins,
            SyncOp::MutexTimedlock,
            res.is_err(),
            &[m.chan() as u64, code],
        );
        res
    }

    /// Release and wake the oldest waiter, still under the turn.
    pub fn mutex_unlock(&self, ins: Ins, m: &DetMutex) -> Result<(), Errno> {
        if self.passthrough() {
            m.state.unlock();
            return Ok(());
        }
        if self.in_nondet() {
            self.note_nondet_obj(m.chan());
            m.state.unlock();
            return Ok(());
        }
        let ctx = self.sched_start();
        self.warn_if_contaminated(m.chan());
        m.state.unlock();
        self.sched.signal(&ctx.desc, m.chan(), false);
        self.sched_end(&ctx, ins, SyncOp::MutexUnlock, false, &[m.chan() as u64]);
        Ok(())
    }

    /// The trylock/wait loop shared by lock, timedlock, and condvar
    /// re-acquisition.  Returns `ETIMEDOUT` when the deadline fires first.
    pub(crate) fn mutex_lock_helper(
        &self,
        ctx: &ThreadCtx,
        m: &DetMutex,
        deadline: Turn,
    ) -> Result<(), Errno> {
        loop {
            if m.state.try_lock() {
                return Ok(());
            }
            if self.sched.wait(&ctx.desc, Some(m.chan()), deadline) == WaitResult::TimedOut {
                return Err(Errno::ETIMEDOUT);
            }
        }
    }

    /// Acquire with no deadline.  A timeout here can only come from the
    /// scheduler's deadlock escape, meaning no runnable thread can ever
    /// release the mutex; that is fatal rather than an errno.
    pub(crate) fn lock_indefinitely(&self, ctx: &ThreadCtx, m: &DetMutex) {
        if self.mutex_lock_helper(ctx, m, Turn::MAX).is_err() {
            panic!(
                "deadlock: no runnable thread can release mutex {:#x}",
                m.chan()
            );
        }
    }

    /// A logical deadline for `abstime`, counting the wall-clock fallback
    /// when no base time is set.
    pub(crate) fn abs_deadline(&self, ctx: &ThreadCtx, abstime: SystemTime) -> Turn {
        let (rel, fellback) = clock::abs_to_rel(ctx.base_time.get(), abstime);
        if fellback {
            self.stats.add_wallclock_fallback();
        }
        let turns = clock::rel_to_turns(self.config(), self.registry.nthread(), rel);
        self.sched.turn_count().deadline_after(turns)
    }
}
