/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Reader-writer lock wrappers.
//!
//! Same skeleton as the mutex.  Writer and reader acquisition share one
//! wait channel (the state address), so an unlock's single `signal` wakes
//! whichever waiter is oldest, reader or writer.

use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use detturn_model::Ins;
use detturn_model::SyncOp;
use detturn_model::Turn;
use nix::errno::Errno;
use parking_lot::lock_api::RawRwLock as RawRwLockApi;
use parking_lot::RawRwLock;

use crate::scheduler::Channel;
use crate::scheduler::WaitResult;
use crate::thread_state::ThreadCtx;
use crate::Runtime;

pub(crate) struct RwLockState {
    raw: RawRwLock,
    writer_held: AtomicBool,
    readers: AtomicUsize,
}

impl fmt::Debug for RwLockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwLockState")
            .field("writer_held", &self.writer_held.load(Ordering::Relaxed))
            .field("readers", &self.readers.load(Ordering::Relaxed))
            .finish()
    }
}

impl RwLockState {
    fn new() -> Self {
        RwLockState {
            raw: RawRwLock::INIT,
            writer_held: AtomicBool::new(false),
            readers: AtomicUsize::new(0),
        }
    }

    fn try_read(&self) -> bool {
        if self.raw.try_lock_shared() {
            self.readers.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    fn try_write(&self) -> bool {
        if self.raw.try_lock_exclusive() {
            self.writer_held.store(true, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    fn read_native(&self) {
        self.raw.lock_shared();
        self.readers.fetch_add(1, Ordering::Relaxed);
    }

    fn write_native(&self) {
        self.raw.lock_exclusive();
        self.writer_held.store(true, Ordering::Relaxed);
    }

    // One unified unlock, as in the pthread surface: release whichever mode
    // this thread's process currently holds.
    fn unlock(&self) {
        if self.writer_held.swap(false, Ordering::Relaxed) {
            unsafe { self.raw.unlock_exclusive() };
            return;
        }
        let prev = self.readers.fetch_sub(1, Ordering::Relaxed);
        if prev == 0 {
            panic!("unlock of an rwlock that is not held");
        }
        unsafe { self.raw.unlock_shared() };
    }
}

/// A deterministic reader-writer lock handle.  Clones refer to the same
/// lock.
#[derive(Clone)]
pub struct DetRwLock {
    state: Arc<RwLockState>,
}

impl fmt::Debug for DetRwLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetRwLock")
            .field("chan", &format_args!("{:#x}", self.chan()))
            .finish()
    }
}

impl DetRwLock {
    /// The wait channel: the address of the shared state.
    pub fn chan(&self) -> Channel {
        Arc::as_ptr(&self.state) as Channel
    }
}

impl Runtime {
    /// Create a reader-writer lock.
    pub fn rwlock_init(&self, ins: Ins) -> DetRwLock {
        let rw = DetRwLock {
            state: Arc::new(RwLockState::new()),
        };
        if self.passthrough() {
            return rw;
        }
        if self.in_nondet() {
            self.note_nondet_obj(rw.chan());
            return rw;
        }
        let ctx = self.sched_start();
        self.sched_end(&ctx, ins, SyncOp::RwlockInit, false, &[rw.chan() as u64]);
        rw
    }

    /// Destroy a reader-writer lock.
    pub fn rwlock_destroy(&self, ins: Ins, rw: DetRwLock) {
        if self.passthrough() {
            return;
        }
        if self.in_nondet() {
            self.note_nondet_obj(rw.chan());
            return;
        }
        let ctx = self.sched_start();
        self.sched_end(&ctx, ins, SyncOp::RwlockDestroy, false, &[rw.chan() as u64]);
    }

    /// Acquire in shared mode.
    pub fn rwlock_rdlock(&self, ins: Ins, rw: &DetRwLock) -> Result<(), Errno> {
        if self.passthrough() {
            rw.state.read_native();
            return Ok(());
        }
        if self.in_nondet() {
            self.note_nondet_obj(rw.chan());
            rw.state.read_native();
            return Ok(());
        }
        let ctx = self.sched_start();
        self.warn_if_contaminated(rw.chan());
        self.rw_acquire_helper(&ctx, rw, false)?;
        self.sched_end(&ctx, ins, SyncOp::RwlockRdlock, false, &[rw.chan() as u64]);
        Ok(())
    }

    /// Acquire in exclusive mode.
    pub fn rwlock_wrlock(&self, ins: Ins, rw: &DetRwLock) -> Result<(), Errno> {
        if self.passthrough() {
            rw.state.write_native();
            return Ok(());
        }
        if self.in_nondet() {
            self.note_nondet_obj(rw.chan());
            rw.state.write_native();
            return Ok(());
        }
        let ctx = self.sched_start();
        self.warn_if_contaminated(rw.chan());
        self.rw_acquire_helper(&ctx, rw, true)?;
        self.sched_end(&ctx, ins, SyncOp::RwlockWrlock, false, &[rw.chan() as u64]);
        Ok(())
    }

    /// One shared trylock under the turn.
    pub fn rwlock_tryrdlock(&self, ins: Ins, rw: &DetRwLock) -> Result<(), Errno> {
        if self.passthrough() {
            return if rw.state.try_read() { Ok(()) } else { Err(Errno::EBUSY) };
        }
        if self.in_nondet() {
            self.note_nondet_obj(rw.chan());
            return if rw.state.try_read() { Ok(()) } else { Err(Errno::EBUSY) };
        }
        let ctx = self.sched_start();
        self.warn_if_contaminated(rw.chan());
        let res = if rw.state.try_read() {
            Ok(())
        } else {
            Err(Errno::EBUSY)
        };
        let code = res.err().map(|e| e as u64).unwrap_or(0);
        self.sched_end(
            &ctx,
            ins,
            SyncOp::RwlockTryRdlock,
            false,
            &[rw.chan() as u64, code],
        );
        res
    }

    /// One exclusive trylock under the turn.
    pub fn rwlock_trywrlock(&self, ins: Ins, rw: &DetRwLock) -> Result<(), Errno> {
        if self.passthrough() {
            return if rw.state.try_write() { Ok(()) } else { Err(Errno::EBUSY) };
        }
        if self.in_nondet() {
            self.note_nondet_obj(rw.chan());
            return if rw.state.try_write() { Ok(()) } else { Err(Errno::EBUSY) };
        }
        let ctx = self.sched_start();
        self.warn_if_contaminated(rw.chan());
        let res = if rw.state.try_write() {
            Ok(())
        } else {
            Err(Errno::EBUSY)
        };
        let code = res.err().map(|e| e as u64).unwrap_or(0);
        self.sched_end(
            &ctx,
            ins,
            SyncOp::RwlockTryWrlock,
            false,
            &[rw.chan() as u64, code],
        );
        res
    }

    /// Release whichever mode is held and wake the oldest waiter.
    pub fn rwlock_unlock(&self, ins: Ins, rw: &DetRwLock) -> Result<(), Errno> {
        if self.passthrough() {
            rw.state.unlock();
            return Ok(());
        }
        if self.in_nondet() {
            self.note_nondet_obj(rw.chan());
            rw.state.unlock();
            return Ok(());
        }
        let ctx = self.sched_start();
        self.warn_if_contaminated(rw.chan());
        rw.state.unlock();
        self.sched.signal(&ctx.desc, rw.chan(), false);
        self.sched_end(&ctx, ins, SyncOp::RwlockUnlock, false, &[rw.chan() as u64]);
        Ok(())
    }

    fn rw_acquire_helper(
        &self,
        ctx: &ThreadCtx,
        rw: &DetRwLock,
        exclusive: bool,
    ) -> Result<(), Errno> {
        loop {
            let acquired = if exclusive {
                rw.state.try_write()
            } else {
                rw.state.try_read()
            };
            if acquired {
                return Ok(());
            }
            if self.sched.wait(&ctx.desc, Some(rw.chan()), Turn::MAX) == WaitResult::TimedOut {
                // Only the deadlock escape produces a timeout on an
                // indefinite wait.
                panic!(
                    "deadlock: no runnable thread can release rwlock {:#x}",
                    rw.chan()
                );
            }
        }
    }
}
