/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Thread lifecycle wrappers: spawn, join, yield, and fork.
//!
//! Spawn solves three ordering problems at once.  The child's logical id
//! must be assigned by the *parent* while it holds the turn, or two
//! concurrent spawns could have their children pick ids in either order.
//! The child must not take a turn before its id is published, so it starts
//! parked on a "begin" semaphore.  And two spawns must not cross-wire their
//! begin posts, so the parent waits on a second "begin done" semaphore
//! until its own child has read its id.

use std::panic;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;
use std::sync::Arc;
use std::thread;

use detturn_model::tid::INVALID_TID;
use detturn_model::DetTid;
use detturn_model::Ins;
use detturn_model::SyncOp;
use detturn_model::Turn;
use detturn_model::INVALID_INS;
use nix::unistd;
use nix::unistd::ForkResult;

use crate::logger::ThreadLogger;
use crate::registry::exit_chan;
use crate::thread_state;
use crate::thread_state::ThreadCtx;
use crate::Runtime;

/// Join handle for a thread created through [`Runtime::spawn`].
#[derive(Debug)]
pub struct DetThread {
    tid: DetTid,
    native: thread::JoinHandle<()>,
}

impl DetThread {
    /// The child's logical id.
    pub fn tid(&self) -> DetTid {
        self.tid
    }
}

impl Runtime {
    /// Spawn a managed thread running `f`.
    pub fn spawn<F>(self: &Arc<Self>, ins: Ins, f: F) -> DetThread
    where
        F: FnOnce() + Send + 'static,
    {
        if self.passthrough() {
            let native = thread::Builder::new()
                .spawn(f)
                .expect("thread creation failed");
            return DetThread {
                tid: INVALID_TID,
                native,
            };
        }
        assert!(
            !self.in_nondet(),
            "spawn inside a non-det region is not supported"
        );

        let ctx = self.sched_start();

        // Create the native thread first; it parks on the begin semaphore
        // until the id hand-off below is complete.
        let rt = Arc::clone(self);
        let native = thread::Builder::new()
            .spawn(move || {
                rt.registry.begin_sem.wait();
                let tid = rt.registry.take_handoff();
                let desc = rt.registry.get(tid);
                let child_ctx = ThreadCtx::new(desc);
                if rt.config().log_sync {
                    match ThreadLogger::open(&rt.config().output_dir, tid) {
                        Ok(l) => *child_ctx.logger.borrow_mut() = Some(l),
                        Err(e) => tracing::warn!("thread {} could not open its log: {}", tid, e),
                    }
                }
                thread_state::install(Rc::clone(&child_ctx));
                rt.registry.begin_done_sem.post();

                rt.thread_begin(&child_ctx);
                let result = panic::catch_unwind(AssertUnwindSafe(f));
                rt.thread_end(INVALID_INS);
                if let Err(payload) = result {
                    panic::resume_unwind(payload);
                }
            })
            .expect("thread creation failed");

        let desc = self.registry.register();
        let tid = desc.tid;
        self.sched.enqueue_child(tid);
        self.registry.set_handoff(tid);
        self.sched_end(
            &ctx,
            ins,
            SyncOp::ThreadCreate,
            false,
            &[tid.as_raw() as u64],
        );

        self.registry.begin_sem.post();
        self.registry.begin_done_sem.wait();

        DetThread { tid, native }
    }

    /// The child's first turn, logging its begin event.
    fn thread_begin(&self, ctx: &ThreadCtx) {
        if self.config().log_sync {
            ctx.app_time.set(ctx.update_time());
        }
        self.sched.get_turn(&ctx.desc);
        if self.config().log_sync {
            ctx.sched_time.set(ctx.update_time());
        }
        self.sched_end(ctx, INVALID_INS, SyncOp::ThreadBegin, false, &[]);
    }

    /// The final turn of a thread: log, retire into the zombie set, flush.
    pub(crate) fn thread_end(&self, ins: Ins) {
        let ctx = thread_state::current();
        if self.config().log_sync {
            ctx.app_time.set(ctx.update_time());
        }
        self.sched.get_turn(&ctx.desc);
        if self.config().log_sync {
            ctx.sched_time.set(ctx.update_time());
        }
        let turn = self.sched.inc_turn(&ctx.desc);
        if self.config().log_sync {
            ctx.syscall_time.set(ctx.update_time());
            self.log_event(&ctx, ins, SyncOp::ThreadEnd, turn, true, false, &[]);
        }
        self.sched.put_turn(&ctx.desc, true);

        if let Some(l) = ctx.logger.borrow_mut().as_mut() {
            if let Err(e) = l.flush() {
                tracing::warn!("log flush failed at thread end: {}", e);
            }
        }
        thread_state::uninstall();
    }

    /// Join a managed thread, reaping its descriptor.  Panics from the
    /// child are propagated in the returned result, as with native join.
    pub fn join(&self, ins: Ins, th: DetThread) -> thread::Result<()> {
        if self.passthrough() {
            return th.native.join();
        }
        let ctx = self.sched_start();
        let desc = self.registry.get(th.tid);
        let chan = exit_chan(&desc);
        while !self.sched.is_zombie(th.tid) {
            let _ = self.sched.wait(&ctx.desc, Some(chan), Turn::MAX);
        }
        // The child has retired from the queue; the native join can only
        // wait for its last few instructions of unwinding.
        let res = th.native.join();
        self.sched.remove_zombie(th.tid);
        drop(desc);
        self.registry.reap(th.tid);
        self.sched_end(
            &ctx,
            ins,
            SyncOp::ThreadJoin,
            false,
            &[th.tid.as_raw() as u64],
        );
        res
    }

    /// Yield: a single turn with no other effect.
    pub fn sched_yield(&self, ins: Ins) {
        if self.passthrough() || self.in_nondet() {
            thread::yield_now();
            return;
        }
        let ctx = self.sched_start();
        thread::yield_now();
        self.sched_end(&ctx, ins, SyncOp::SchedYield, false, &[]);
    }

    /// Fork the process while holding the turn.
    ///
    /// The parent flushes its log first so the child cannot rewrite
    /// buffered parent records.  The child re-opens its log under the new
    /// pid, resets the registry and scheduler to "sole thread, holds the
    /// turn", re-arms the spawn semaphores, and relaunches the idle thread
    /// if one is configured.
    ///
    /// # Safety
    ///
    /// Forking a multithreaded process leaves the child with only this
    /// thread; the caller must ensure the child does not depend on state
    /// owned by other threads mid-operation, per the usual `fork` rules.
    pub unsafe fn fork(self: &Arc<Self>, ins: Ins) -> nix::Result<ForkResult> {
        if self.passthrough() {
            return unistd::fork();
        }
        let ctx = thread_state::current();
        if let Some(l) = ctx.logger.borrow_mut().as_mut() {
            let _ = l.flush();
        }

        let ctx = self.sched_start();
        let ret = unistd::fork();
        match &ret {
            Ok(ForkResult::Child) => {
                if self.config().log_sync {
                    // New pid, new log file.
                    *ctx.logger.borrow_mut() =
                        ThreadLogger::open(&self.config().output_dir, ctx.tid()).ok();
                }
                self.registry.reset_for_child(&ctx.desc);
                self.sched.reset_for_child(&ctx.desc);
                self.reset_shutdown();
                *self.idle.lock().expect("idle handle poisoned") = None;
            }
            Ok(ForkResult::Parent { .. }) => {}
            Err(_) => {}
        }
        let code = match &ret {
            Ok(ForkResult::Child) => 0,
            Ok(ForkResult::Parent { child }) => child.as_raw() as u64,
            Err(e) => *e as u64,
        };
        self.sched_end(&ctx, ins, SyncOp::Fork, false, &[code]);

        if matches!(ret, Ok(ForkResult::Child)) && self.config().launch_idle_thread {
            if let Err(e) = crate::idle::launch(self) {
                tracing::warn!("child could not relaunch the idle thread: {}", e);
            }
        }
        ret
    }
}
