/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Per-thread state, reached through a thread-local.
//!
//! Wrappers execute on the application's own threads, so everything a
//! wrapper needs per call (the descriptor, the timing triple, the base time
//! for absolute timeouts, the non-det flag, the log handle) lives here
//! rather than being threaded through every signature.

use std::cell::Cell;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use std::time::SystemTime;

use detturn_model::DetTid;

use crate::logger::ThreadLogger;
use crate::registry::Descriptor;

/// The state of one managed thread.
pub(crate) struct ThreadCtx {
    /// This thread's registry descriptor.
    pub desc: Arc<Descriptor>,

    /// Inside a non-det region right now?
    pub in_non_det: Cell<bool>,

    /// Base time for absolute-to-relative timeout conversion, set by
    /// `set_base_time`.
    pub base_time: Cell<Option<SystemTime>>,

    /// The per-thread event log, open while `log_sync` is on.
    pub logger: RefCell<Option<ThreadLogger>>,

    // The timing triple: durations accumulated since the last transition,
    // recorded into log entries.
    pub app_time: Cell<Duration>,
    pub sched_time: Cell<Duration>,
    pub syscall_time: Cell<Duration>,
    last_stamp: Cell<Instant>,
}

impl ThreadCtx {
    pub fn new(desc: Arc<Descriptor>) -> Rc<Self> {
        Rc::new(ThreadCtx {
            desc,
            in_non_det: Cell::new(false),
            base_time: Cell::new(None),
            logger: RefCell::new(None),
            app_time: Cell::new(Duration::ZERO),
            sched_time: Cell::new(Duration::ZERO),
            syscall_time: Cell::new(Duration::ZERO),
            last_stamp: Cell::new(Instant::now()),
        })
    }

    pub fn tid(&self) -> DetTid {
        self.desc.tid
    }

    /// Time elapsed since the previous call on this thread.
    pub fn update_time(&self) -> Duration {
        let now = Instant::now();
        let elapsed = now - self.last_stamp.get();
        self.last_stamp.set(now);
        elapsed
    }

    /// The timing triple as nanosecond counts for a log record.
    pub fn timing_ns(&self) -> (u64, u64, u64) {
        (
            self.app_time.get().as_nanos() as u64,
            self.syscall_time.get().as_nanos() as u64,
            self.sched_time.get().as_nanos() as u64,
        )
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<ThreadCtx>>> = RefCell::new(None);
}

/// Attach a context to the calling thread.
pub(crate) fn install(ctx: Rc<ThreadCtx>) {
    CURRENT.with(|c| {
        *c.borrow_mut() = Some(ctx);
    });
}

/// Detach and return the calling thread's context (at thread end).
pub(crate) fn uninstall() -> Option<Rc<ThreadCtx>> {
    CURRENT.with(|c| c.borrow_mut().take())
}

/// The calling thread's context.  Calling a wrapper from a thread the
/// runtime does not manage is a programmer error.
pub(crate) fn current() -> Rc<ThreadCtx> {
    try_current().expect(
        "this thread is not managed by the runtime; wrappers may only be called \
         from the initial thread or from threads created through spawn",
    )
}

/// The calling thread's context, if it has one.
pub(crate) fn try_current() -> Option<Rc<ThreadCtx>> {
    CURRENT.with(|c| c.borrow().clone())
}
