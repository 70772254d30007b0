/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Counting semaphore wrappers.
//!
//! Wait is a loop of native trywait and scheduler wait, mirroring the mutex
//! skeleton.  Note the native surface reports an unavailable semaphore as
//! `EAGAIN`, not `EBUSY`.

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
use crate::Runtime;

pub(crate) struct SemState {
    count: Mutex<u64>,
    cv: Condvar,
}

impl fmt::Debug for SemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SemState")
            .field("count", &*self.count.lock().expect("sem lock poisoned"))
            .finish()
    }
}

impl SemState {
    fn new(value: u32) -> Self {
        SemState {
            count: Mutex::new(value as u64),
            cv: Condvar::new(),
        }
    }

    fn try_wait(&self) -> bool {
        let mut c = self.count.lock().expect("sem lock poisoned");
        if *c > 0 {
            *c -= 1;
            true
        } else {
            false
        }
    }

    fn wait_native(&self) {
        let guard = self.count.lock().expect("sem lock poisoned");
        let mut guard = self
            .cv
            .wait_while(guard, |c| *c == 0)
            .expect("sem lock poisoned");
        *guard -= 1;
    }

    fn wait_native_until(&self, abstime: SystemTime) -> bool {
        let rel = abstime
            .duration_since(SystemTime::now())
            .unwrap_or(std::time::Duration::ZERO);
        let guard = self.count.lock().expect("sem lock poisoned");
        let (mut guard, res) = self
            .cv
            .wait_timeout_while(guard, rel, |c| *c == 0)
            .expect("sem lock poisoned");
        if res.timed_out() && *guard == 0 {
            return false;
        }
        *guard -= 1;
        true
    }

    fn post(&self) {
        let mut c = self.count.lock().expect("sem lock poisoned");
        *c += 1;
        self.cv.notify_one();
    }
}

/// A deterministic counting semaphore handle.  Clones refer to the same
/// semaphore.
#[derive(Clone)]
pub struct DetSemaphore {
    state: Arc<SemState>,
}

impl fmt::Debug for DetSemaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetSemaphore")
            .field("chan", &format_args!("{:#x}", self.chan()))
            .finish()
    }
}

impl DetSemaphore {
    /// The wait channel: the address of the shared state.
    pub fn chan(&self) -> Channel {
        Arc::as_ptr(&self.state) as Channel
    }
}

impl Runtime {
    /// Create a semaphore with an initial value.
    pub fn sem_init(&self, ins: Ins, value: u32) -> DetSemaphore {
        let s = DetSemaphore {
            state: Arc::new(SemState::new(value)),
        };
        if self.passthrough() {
            return s;
        }
        if self.in_nondet() {
            self.note_nondet_obj(s.chan());
            return s;
        }
        let ctx = self.sched_start();
        self.sched_end(
            &ctx,
            ins,
            SyncOp::SemInit,
            false,
            &[s.chan() as u64, value as u64],
        );
        s
    }

    /// Decrement, waiting deterministically while the count is zero.
    pub fn sem_wait(&self, ins: Ins, s: &DetSemaphore) -> Result<(), Errno> {
        if self.passthrough() {
            s.state.wait_native();
            return Ok(());
        }
        if self.in_nondet() {
            self.note_nondet_obj(s.chan());
            s.state.wait_native();
            return Ok(());
        }
        let ctx = self.sched_start();
        self.warn_if_contaminated(s.chan());
        while !s.state.try_wait() {
            let _ = self.sched.wait(&ctx.desc, Some(s.chan()), Turn::MAX);
        }
        self.sched_end(&ctx, ins, SyncOp::SemWait, false, &[s.chan() as u64]);
        Ok(())
    }

    /// One native trywait under the turn; `EAGAIN` if unavailable.
    pub fn sem_trywait(&self, ins: Ins, s: &DetSemaphore) -> Result<(), Errno> {
        if self.passthrough() {
            return if s.state.try_wait() { Ok(()) } else { Err(Errno::EAGAIN) };
        }
        if self.in_nondet() {
            self.note_nondet_obj(s.chan());
            return if s.state.try_wait() { Ok(()) } else { Err(Errno::EAGAIN) };
        }
        let ctx = self.sched_start();
        self.warn_if_contaminated(s.chan());
        let res = if s.state.try_wait() {
            Ok(())
        } else {
            Err(Errno::EAGAIN)
        };
        let code = res.err().map(|e| e as u64).unwrap_or(0);
        self.sched_end(
            &ctx,
            ins,
            SyncOp::SemTryWait,
            false,
            &[s.chan() as u64, code],
        );
        res
    }

    /// Decrement with an absolute deadline.
    pub fn sem_timedwait(
        &self,
        ins: Ins,
        s: &DetSemaphore,
        abstime: SystemTime,
    ) -> Result<(), Errno> {
        if self.passthrough() || self.in_nondet() {
            if self.in_nondet() {
                self.note_nondet_obj(s.chan());
            }
            return if s.state.wait_native_until(abstime) {
                Ok(())
            } else {
                Err(Errno::ETIMEDOUT)
            };
        }
        let ctx = self.sched_start();
        self.warn_if_contaminated(s.chan());
        let deadline = self.abs_deadline(&ctx, abstime);
        let mut res = Ok(());
        while !s.state.try_wait() {
            if self.sched.wait(&ctx.desc, Some(s.chan()), deadline) == WaitResult::TimedOut {
                res = Err(Errno::ETIMEDOUT);
                break;
            }
        }
        let code = res.err().map(|e| e as u64).unwrap_or(0);
        self.sched_end(
            &ctx,
            ins,
            SyncOp::SemTimedWait,
            res.is_err(),
            &[s.chan() as u64, code],
        );
        res
    }

    /// Increment and wake the oldest waiter, still under the turn.
    pub fn sem_post(&self, ins: Ins, s: &DetSemaphore) -> Result<(), Errno> {
        if self.passthrough() {
            s.state.post();
            return Ok(());
        }
        if self.in_nondet() {
            self.note_nondet_obj(s.chan());
            s.state.post();
            return Ok(());
        }
        let ctx = self.sched_start();
        self.warn_if_contaminated(s.chan());
        s.state.post();
        self.sched.signal(&ctx.desc, s.chan(), false);
        self.sched_end(&ctx, ins, SyncOp::SemPost, false, &[s.chan() as u64]);
        Ok(())
    }
}
