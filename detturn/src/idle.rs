/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The idle thread: drives logical time forward when no application thread
//! can.
//!
//! While application threads are runnable the idle thread parks out of the
//! run queue so it costs nothing.  The scheduler unparks it whenever the
//! queue would otherwise go empty with work still pending (sleepers with
//! deadlines, or threads off in external blocking calls); it then cycles
//! the turn, one counter increment per cycle, until an application thread
//! is runnable again.  Those increments are what make `wait(None, dl)`
//! deadlines eventually fire.

use std::io;
use std::rc::Rc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use detturn_model::SyncOp;
use detturn_model::INVALID_INS;

use crate::logger::ThreadLogger;
use crate::registry::Descriptor;
use crate::thread_state;
use crate::thread_state::ThreadCtx;
use crate::Runtime;

// Pacing for the alone-in-the-queue cycle.  Purely a CPU courtesy: the
// sequence of logical events does not depend on it.
const IDLE_CYCLE_PAUSE: Duration = Duration::from_micros(50);

/// Register and start the idle thread.  Called at runtime creation (and
/// again in a forked child) while the caller effectively holds the turn.
pub(crate) fn launch(rt: &Arc<Runtime>) -> io::Result<()> {
    let desc = rt.registry.register();
    rt.sched.enqueue_child(desc.tid);
    rt.sched.set_idle(desc.tid);
    let rt2 = Arc::clone(rt);
    let jh = thread::Builder::new()
        .name("detturn-idle".to_string())
        .spawn(move || idle_loop(rt2, desc))?;
    *rt.idle.lock().expect("idle handle poisoned") = Some(jh);
    Ok(())
}

fn idle_loop(rt: Arc<Runtime>, desc: Arc<Descriptor>) {
    let ctx = ThreadCtx::new(Arc::clone(&desc));
    if rt.config().log_sync {
        match ThreadLogger::open(&rt.config().output_dir, desc.tid) {
            Ok(l) => *ctx.logger.borrow_mut() = Some(l),
            Err(e) => tracing::warn!("idle thread could not open its log: {}", e),
        }
    }
    thread_state::install(Rc::clone(&ctx));

    rt.sched.get_turn(&desc);
    let turn = rt.sched.inc_turn(&desc);
    rt.log_event(&ctx, INVALID_INS, SyncOp::ThreadBegin, turn, true, false, &[]);

    loop {
        if rt.shutting_down() {
            let turn = rt.sched.inc_turn(&desc);
            rt.log_event(&ctx, INVALID_INS, SyncOp::ThreadEnd, turn, true, false, &[]);
            rt.sched.put_turn(&desc, true);
            break;
        }

        let turn = rt.sched.inc_turn(&desc);
        rt.log_event(&ctx, INVALID_INS, SyncOp::Idle, turn, true, false, &[]);

        if rt.sched.has_runnable_app() {
            // Real work exists; get out of the way until the scheduler
            // needs us again.  Returns holding the turn.
            rt.sched.idle_park(&desc);
        } else {
            rt.sched.put_turn(&desc, false);
            thread::sleep(IDLE_CYCLE_PAUSE);
            rt.sched.get_turn(&desc);
        }
    }

    if let Some(l) = ctx.logger.borrow_mut().as_mut() {
        if let Err(e) = l.flush() {
            tracing::warn!("idle thread log flush failed: {}", e);
        }
    }
    thread_state::uninstall();
}
