/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! detturn is a record-mode deterministic multithreading runtime.
//!
//! It serializes a process's synchronization and blocking-I/O operations
//! onto a single logical timeline of "turns", so that a given program input
//! always produces the same interleaving of synchronization events.  The
//! host program's calls are expected to reach the wrappers here through
//! some instrumentation mechanism (a shim library, source rewriting, or
//! explicit use of the [`Runtime`] API); the runtime itself rides on the
//! OS's native threads and only orders their *visible* synchronization.
//!
//! A process creates one [`Runtime`] on its initial thread, spawns threads
//! through it, and routes every wrapped operation through its methods:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use detturn::Config;
//! use detturn::Runtime;
//!
//! let rt = Runtime::new(Config::default()).unwrap();
//! let m = rt.mutex_init(1);
//! let (rt2, m2) = (Arc::clone(&rt), m.clone());
//! let t = rt.spawn(2, move || {
//!     rt2.mutex_lock(3, &m2).unwrap();
//!     rt2.mutex_unlock(4, &m2).unwrap();
//! });
//! rt.mutex_lock(5, &m).unwrap();
//! rt.mutex_unlock(6, &m).unwrap();
//! rt.join(7, t).unwrap();
//! rt.prog_end();
//! ```

#![deny(clippy::all)]
#![deny(missing_docs)]

mod annotations;
mod clock;
pub mod detlog;
mod idle;
pub mod io;
pub mod logger;
mod nondet;
pub mod registry;
pub mod scheduler;
mod stat;
pub mod sync;
pub mod thread;
mod thread_state;
pub mod waitcell;

use std::collections::HashMap;
use std::collections::HashSet;
use std::io as stdio;
use std::rc::Rc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

pub use detturn_model::Config;
pub use detturn_model::DetTid;
pub use detturn_model::Ins;
pub use detturn_model::RunStats;
pub use detturn_model::SyncOp;
pub use detturn_model::Turn;
pub use detturn_model::INVALID_INS;
use lazy_static::lazy_static;
pub use scheduler::Channel;
pub use scheduler::WaitResult;
pub use sync::DetBarrier;
pub use sync::DetCondvar;
pub use sync::DetMutex;
pub use sync::DetRwLock;
pub use sync::DetSemaphore;
pub use thread::DetThread;

use crate::logger::ThreadLogger;
use crate::registry::Registry;
use crate::scheduler::Scheduler;
use crate::stat::RuntimeStats;
use crate::thread_state::ThreadCtx;

/// The runtime instance: configuration, thread registry, turn scheduler,
/// and the tables shared by the wrappers.  One per process (the forked
/// child resets and reuses the same instance).
pub struct Runtime {
    cfg: Config,
    pub(crate) registry: Arc<Registry>,
    pub(crate) sched: Scheduler,
    pub(crate) stats: RuntimeStats,
    pub(crate) barriers: sync::barrier::BarrierTable,
    pub(crate) lineups: sync::lineup::LineupTable,
    pub(crate) nondet_vars: nondet::NonDetVars,
    pub(crate) idle: Mutex<Option<std::thread::JoinHandle<()>>>,
    shutdown: AtomicBool,
}

impl Runtime {
    /// Create a runtime on the calling thread, which becomes logical thread
    /// 0 and the initial sole member of the run queue.  Starts the idle
    /// thread when configured.
    pub fn new(cfg: Config) -> stdio::Result<Arc<Runtime>> {
        cfg.warn_unusual();
        if cfg.log_sync {
            logger::prog_begin(&cfg.output_dir)?;
        }
        let registry = Arc::new(Registry::new());
        let sched = Scheduler::new(Arc::clone(&registry));
        let rt = Arc::new(Runtime {
            cfg,
            registry,
            sched,
            stats: RuntimeStats::default(),
            barriers: Mutex::new(HashMap::new()),
            lineups: Mutex::new(HashMap::new()),
            nondet_vars: Mutex::new(HashSet::new()),
            idle: Mutex::new(None),
            shutdown: AtomicBool::new(false),
        });

        let main_desc = rt.registry.register();
        rt.sched.enqueue_first(&main_desc);
        let ctx = ThreadCtx::new(main_desc);
        if rt.cfg.log_sync {
            *ctx.logger.borrow_mut() = Some(ThreadLogger::open(&rt.cfg.output_dir, ctx.tid())?);
        }
        thread_state::install(ctx);

        if rt.cfg.dmt {
            let ctx = rt.sched_start();
            rt.sched_end(&ctx, INVALID_INS, SyncOp::ThreadBegin, false, &[]);
            if rt.cfg.launch_idle_thread {
                idle::launch(&rt)?;
            }
        }
        Ok(rt)
    }

    /// Close the runtime from the initial thread: print counters, retire
    /// the calling thread, stop and join the idle thread, flush logs.
    /// Every spawned thread must have been joined first.
    pub fn prog_end(&self) {
        if self.passthrough() {
            if self.cfg.record_runtime_stat {
                tracing::info!("runtime stats:\n{}", self.stats.snapshot());
            }
            return;
        }

        // The idle thread needs turns to observe the stop flag.
        self.shutdown.store(true, Ordering::SeqCst);
        self.sched.unpark_idle();

        if self.cfg.record_runtime_stat {
            // Printed under the turn, a fixed point on the timeline.
            let ctx = self.sched_start();
            tracing::info!("runtime stats:\n{}", self.stats.snapshot());
            let _ = self.sched.inc_turn(&ctx.desc);
            self.sched.put_turn(&ctx.desc, false);
        }

        self.thread_end(INVALID_INS);

        // The idle thread may have re-parked between the flag store and our
        // retirement; it cannot park again now that no application thread
        // is runnable, so one more unpark is sufficient.
        self.sched.unpark_idle();

        let jh = self.idle.lock().expect("idle handle poisoned").take();
        if let Some(jh) = jh {
            let _ = jh.join();
        }
    }

    /// The runtime's configuration.
    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// The current value of the global turn counter.
    pub fn turn_count(&self) -> Turn {
        self.sched.turn_count()
    }

    /// A copy of the runtime counters.
    pub fn stats_snapshot(&self) -> RunStats {
        self.stats.snapshot()
    }

    pub(crate) fn passthrough(&self) -> bool {
        !self.cfg.dmt
    }

    pub(crate) fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub(crate) fn reset_shutdown(&self) {
        self.shutdown.store(false, Ordering::SeqCst);
    }

    /// The common wrapper prologue: stamp application time, take the turn,
    /// stamp scheduling time.
    pub(crate) fn sched_start(&self) -> Rc<ThreadCtx> {
        let ctx = thread_state::current();
        debug_assert!(
            !(self.cfg.enforce_non_det_annotations && ctx.in_non_det.get()),
            "deterministic wrapper entered from inside a non-det region"
        );
        if self.cfg.log_sync {
            ctx.app_time.set(ctx.update_time());
        }
        self.sched.get_turn(&ctx.desc);
        if self.cfg.log_sync {
            ctx.sched_time.set(ctx.update_time());
        }
        self.stats.add_det_sync();
        ctx
    }

    /// The common wrapper epilogue: bump the counter, log, release the
    /// turn.
    pub(crate) fn sched_end(
        &self,
        ctx: &ThreadCtx,
        ins: Ins,
        op: SyncOp,
        timedout: bool,
        args: &[u64],
    ) {
        let turn = self.sched.inc_turn(&ctx.desc);
        if self.cfg.log_sync {
            ctx.syscall_time.set(ctx.update_time());
            self.log_event(ctx, ins, op, turn, true, timedout, args);
        }
        self.sched.put_turn(&ctx.desc, false);
    }

    /// First-half epilogue for two-half operations: bump and log but keep
    /// the turn, since the protocol continues.
    pub(crate) fn sched_end_fh(&self, ctx: &ThreadCtx, ins: Ins, op: SyncOp, args: &[u64]) {
        let turn = self.sched.inc_turn(&ctx.desc);
        if self.cfg.log_sync {
            ctx.syscall_time.set(ctx.update_time());
            self.log_event(ctx, ins, op, turn, false, false, args);
        }
    }

    /// Append one record to the calling thread's log, if logging is on.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn log_event(
        &self,
        ctx: &ThreadCtx,
        ins: Ins,
        op: SyncOp,
        turn: Turn,
        second_half: bool,
        timedout: bool,
        args: &[u64],
    ) {
        if let Some(l) = ctx.logger.borrow_mut().as_mut() {
            if let Err(e) = l.append(ins, op, turn, second_half, timedout, args, ctx.timing_ns()) {
                tracing::warn!("event log append failed: {}", e);
            }
        }
    }
}

lazy_static! {
    static ref INSTALLED: Mutex<Option<Arc<Runtime>>> = Mutex::new(None);
}

/// Install a runtime as the process-wide instance reachable through
/// [`current`], for callers that cannot thread a handle through.
pub fn install(rt: &Arc<Runtime>) {
    *INSTALLED.lock().expect("install lock poisoned") = Some(Arc::clone(rt));
}

/// The process-wide runtime installed by [`install`].
pub fn current() -> Arc<Runtime> {
    INSTALLED
        .lock()
        .expect("install lock poisoned")
        .clone()
        .expect("no runtime installed; call detturn::install first")
}
