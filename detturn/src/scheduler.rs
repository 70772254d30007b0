/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Deterministic round-robin turn scheduling.
//!
//! All live threads are serialized onto a single logical timeline by a turn
//! token passed hand-to-hand: the token is simply being head of the run
//! queue, and a thread's per-descriptor wake slot is posted exactly when it
//! becomes head.  Every wrapper brackets its critical region with
//! [`Scheduler::get_turn`] and [`Scheduler::put_turn`]; threads that must
//! sleep on a user sync object move to the wait queue with [`Scheduler::wait`]
//! and are brought back by [`Scheduler::signal`], by deadline expiry, or by
//! the deadlock escape.  Threads entering externally blocking syscalls leave
//! the queue entirely with [`Scheduler::block`] and rejoin with
//! [`Scheduler::wakeup`].
//!
//! Every decision here (rotation order, wake order, expiry order) is a pure
//! function of the queue contents and the turn counter, which is what makes
//! the interleaving reproducible across runs.

pub mod runqueue;
pub mod wait_queue;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use detturn_model::DetTid;
use detturn_model::Turn;
use runqueue::RunQueue;
use wait_queue::WaitQueue;

use crate::detlog_debug;
use crate::registry::exit_chan;
use crate::registry::Descriptor;
use crate::registry::Registry;

/// An opaque key partitioning the wait queue: the address of a user-level
/// sync object's shared state.
pub type Channel = usize;

/// The channel that `non_det_start` parks on.  Real channels are addresses
/// of live allocations, so this value cannot collide with one.
pub const NONDET_SENTINEL: Channel = 1;

/// How a `wait` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// A `signal` on the channel woke this thread.
    Signaled,
    /// The deadline passed (or the deadlock escape fired) before any signal.
    TimedOut,
}

#[derive(Debug, Default)]
struct SchedState {
    /// Monotonically counts upward; incremented only by the turn holder.
    turn: Turn,

    /// Threads eligible to take a turn; the head owns the turn token.
    run_queue: RunQueue,

    /// Threads parked on user sync objects, with deadlines.
    wait_queue: WaitQueue,

    /// Threads that returned from their thread function but have not yet
    /// been joined.
    zombies: BTreeSet<DetTid>,

    /// Threads currently inside externally blocking syscalls (or detached in
    /// non-det regions).  Outside the serialization by design.
    external: BTreeSet<DetTid>,

    /// The thread whose wake slot was last posted.  Tracking this is what
    /// keeps the post-per-head-arrival discipline exact.
    current_head: Option<DetTid>,

    /// The idle thread's id, once launched.
    idle_tid: Option<DetTid>,

    /// True while the idle thread is parked out of the run queue because
    /// application threads are runnable.
    idle_parked: bool,
}

impl SchedState {
    fn has_runnable_app(&self) -> bool {
        self.run_queue.tids().any(|t| Some(*t) != self.idle_tid)
    }
}

/// The deterministic scheduler.  One per [`crate::Runtime`].
#[derive(Debug)]
pub struct Scheduler {
    registry: Arc<Registry>,
    state: Mutex<SchedState>,
}

impl fmt::Display for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.lock().expect("scheduler lock poisoned");
        writeln!(f, "turn {}:", st.turn)?;
        writeln!(f, "{}", st.run_queue)?;
        writeln!(f, "waiting: {}", st.wait_queue.len())?;
        writeln!(f, "zombies: {:?}", st.zombies)?;
        write!(f, "external: {:?}", st.external)
    }
}

impl Scheduler {
    /// A scheduler with empty queues over the given registry.
    pub fn new(registry: Arc<Registry>) -> Self {
        Scheduler {
            registry,
            state: Mutex::new(SchedState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SchedState> {
        self.state.lock().expect("scheduler lock poisoned")
    }

    /// Seed the queue with the initial thread and hand it the turn token.
    pub fn enqueue_first(&self, desc: &Arc<Descriptor>) {
        let mut st = self.lock();
        assert!(st.run_queue.is_empty(), "enqueue_first on a live scheduler");
        st.run_queue.push_back(desc.tid);
        st.current_head = Some(desc.tid);
        desc.slot.post();
    }

    /// Place a freshly spawned thread at the tail of the run queue.  Called
    /// by the spawning thread while it holds the turn.
    pub fn enqueue_child(&self, tid: DetTid) {
        let mut st = self.lock();
        debug_assert!(st.current_head.is_some());
        st.run_queue.push_back(tid);
    }

    /// Record which thread is the idle thread.
    pub fn set_idle(&self, tid: DetTid) {
        let mut st = self.lock();
        st.idle_tid = Some(tid);
    }

    /// Block until this thread is head of the run queue.  Returns holding
    /// the turn token.
    pub fn get_turn(&self, desc: &Arc<Descriptor>) {
        desc.slot.wait();
        debug_assert_eq!(self.lock().run_queue.head(), Some(desc.tid));
    }

    /// Increment and read the global turn counter.  Caller must hold the
    /// turn.
    pub fn inc_turn(&self, desc: &Arc<Descriptor>) -> Turn {
        let mut st = self.lock();
        debug_assert_eq!(st.current_head, Some(desc.tid));
        st.turn = st.turn + 1;
        st.turn
    }

    /// Read the turn counter without advancing it.
    pub fn turn_count(&self) -> Turn {
        self.lock().turn
    }

    /// Release the turn: rotate self to the tail (or retire into the zombie
    /// set when the thread function has returned), then wake the new head.
    pub fn put_turn(&self, desc: &Arc<Descriptor>, end_of_thread: bool) {
        let mut st = self.lock();
        debug_assert_eq!(st.current_head, Some(desc.tid));
        st.run_queue.pop_head();
        st.current_head = None;
        if end_of_thread {
            st.zombies.insert(desc.tid);
            // Joiners park on the exit channel; wake them all so each can
            // re-check the zombie flag under its own turn.
            let chan = exit_chan(desc);
            let joiners = st.wait_queue.drain_on(chan);
            for w in joiners {
                self.registry.get(w).timedout.store(false, Ordering::SeqCst);
                st.run_queue.push_back(w);
            }
        } else {
            st.run_queue.push_back(desc.tid);
        }
        self.advance_locked(&mut st);
    }

    /// Atomically move self from the run queue to the wait queue on `chan`
    /// (`None` = a pure sleep on the turn counter), release the turn, and
    /// block.  Returns having re-acquired the turn.
    pub fn wait(
        &self,
        desc: &Arc<Descriptor>,
        chan: Option<Channel>,
        deadline: Turn,
    ) -> WaitResult {
        {
            let mut st = self.lock();
            debug_assert_eq!(st.current_head, Some(desc.tid));
            st.run_queue.pop_head();
            st.current_head = None;
            st.wait_queue.insert(desc.tid, chan, deadline);
            self.advance_locked(&mut st);
        }
        desc.slot.wait();
        if desc.take_timedout() {
            WaitResult::TimedOut
        } else {
            WaitResult::Signaled
        }
    }

    /// While holding the turn, move the first waiter (or all waiters) on
    /// `chan` to the tail of the run queue.  No effect if none.
    pub fn signal(&self, desc: &Arc<Descriptor>, chan: Channel, all: bool) {
        let mut st = self.lock();
        debug_assert_eq!(st.current_head, Some(desc.tid));
        if all {
            let woken = st.wait_queue.drain_on(chan);
            for w in woken {
                self.registry.get(w).timedout.store(false, Ordering::SeqCst);
                st.run_queue.push_back(w);
            }
        } else if let Some(w) = st.wait_queue.pop_first_on(chan) {
            self.registry.get(w).timedout.store(false, Ordering::SeqCst);
            st.run_queue.push_back(w);
        }
        // The caller keeps the turn; the head is unchanged.
    }

    /// Leave the run queue without joining the wait queue, ahead of an
    /// externally blocking syscall.  If self held the turn, it is released.
    pub fn block(&self, desc: &Arc<Descriptor>) {
        let mut st = self.lock();
        let was_head = st.current_head == Some(desc.tid);
        let removed = st.run_queue.remove_tid(desc.tid);
        assert!(removed, "block() by tid {} which is not runnable", desc.tid);
        st.external.insert(desc.tid);
        if was_head {
            st.current_head = None;
            self.advance_locked(&mut st);
        }
    }

    /// Rejoin the tail of the run queue after an externally blocking syscall
    /// returned.  Does not grant the turn; the caller proceeds to
    /// `get_turn` to serialize its completion.
    pub fn wakeup(&self, desc: &Arc<Descriptor>) {
        let mut st = self.lock();
        let was_external = st.external.remove(&desc.tid);
        assert!(was_external, "wakeup() by tid {} which is not external", desc.tid);
        st.run_queue.push_back(desc.tid);
        if st.current_head.is_none() {
            self.advance_locked(&mut st);
        }
    }

    /// Park the idle thread while application threads are runnable.  Called
    /// by the idle thread holding the turn; returns once the scheduler has
    /// unparked it, holding the turn again.
    pub fn idle_park(&self, desc: &Arc<Descriptor>) {
        {
            let mut st = self.lock();
            debug_assert_eq!(st.current_head, Some(desc.tid));
            debug_assert_eq!(st.idle_tid, Some(desc.tid));
            st.run_queue.pop_head();
            st.current_head = None;
            st.idle_parked = true;
            self.advance_locked(&mut st);
        }
        desc.slot.wait();
    }

    /// Force the idle thread back into the run queue (used at shutdown so it
    /// can observe the stop flag).
    pub fn unpark_idle(&self) {
        let mut st = self.lock();
        if st.idle_parked {
            let idle = st.idle_tid.expect("idle_parked without idle_tid");
            st.idle_parked = false;
            st.run_queue.push_back(idle);
            if st.current_head.is_none() {
                self.advance_locked(&mut st);
            }
        }
    }

    /// Does the run queue hold any thread other than the idle thread?
    pub fn has_runnable_app(&self) -> bool {
        self.lock().has_runnable_app()
    }

    /// Has `tid` finished its thread function without being joined yet?
    pub fn is_zombie(&self, tid: DetTid) -> bool {
        self.lock().zombies.contains(&tid)
    }

    /// Forget a joined zombie.
    pub fn remove_zombie(&self, tid: DetTid) {
        let mut st = self.lock();
        let removed = st.zombies.remove(&tid);
        assert!(removed, "joined tid {} was not a zombie", tid);
    }

    /// Are any threads parked on `chan`?
    pub fn has_waiters_on(&self, chan: Channel) -> bool {
        self.lock().wait_queue.has_waiters_on(chan)
    }

    /// Reset to "sole thread, holds the turn" in a forked child.  The
    /// calling thread is mid-wrapper and keeps the token it already holds.
    pub fn reset_for_child(&self, desc: &Arc<Descriptor>) {
        let mut st = self.lock();
        st.run_queue.clear();
        st.wait_queue.clear();
        st.zombies.clear();
        st.external.clear();
        st.idle_tid = None;
        st.idle_parked = false;
        st.run_queue.push_back(desc.tid);
        st.current_head = Some(desc.tid);
    }

    /// The head-change step: promote expired waiters, let sentinel waiters
    /// through once nothing else is runnable, escape deadlocks, and post the
    /// new head's wake slot.
    fn advance_locked(&self, st: &mut SchedState) {
        // Expired waiters return in (deadline, tid) order.
        while let Some((dl, tid)) = st.wait_queue.pop_expired(st.turn) {
            detlog_debug!("turn {}: waiter {} expired (deadline {})", st.turn, tid, dl);
            self.registry.get(tid).timedout.store(true, Ordering::SeqCst);
            st.run_queue.push_back(tid);
        }

        // A non-det start proceeds only once no application thread is
        // runnable; releasing one at a time keeps the hand-off ordered.
        if !st.has_runnable_app() {
            if let Some(tid) = st.wait_queue.pop_first_on(NONDET_SENTINEL) {
                detlog_debug!("turn {}: releasing {} into a non-det region", st.turn, tid);
                self.registry.get(tid).timedout.store(false, Ordering::SeqCst);
                st.run_queue.push_back(tid);
            }
        }

        if st.run_queue.is_empty() {
            // The idle thread only helps when advancing logical time can
            // resolve something: a waiter whose deadline will fire, or an
            // external blocker that will come back on its own.  Waiters
            // that are all indefinite with nothing external pending are a
            // genuine deadlock, and parked-or-not, the idle thread must not
            // mask the escape below by spinning turns forever.
            let time_can_resolve =
                st.wait_queue.has_finite_deadline() || !st.external.is_empty();
            if st.idle_parked && time_can_resolve {
                let idle = st.idle_tid.expect("idle_parked without idle_tid");
                st.idle_parked = false;
                st.run_queue.push_back(idle);
            } else if !st.wait_queue.is_empty() && st.external.is_empty() {
                // Deadlock escape: nothing can run and nothing external can
                // come back, so the earliest waiter is promoted with a
                // timeout result.  While external blockers exist their
                // wakeup will repopulate the queue instead.
                let (dl, tid) = st.wait_queue.pop_earliest().expect("non-empty wait queue");
                crate::detlog!(
                    "turn {}: deadlock escape, promoting waiter {} (deadline {})",
                    st.turn,
                    tid,
                    dl
                );
                self.registry.get(tid).timedout.store(true, Ordering::SeqCst);
                st.run_queue.push_back(tid);
            }
        }

        let new_head = st.run_queue.head();
        if new_head != st.current_head {
            st.current_head = new_head;
            if let Some(h) = new_head {
                self.registry.get(h).slot.post();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn fresh() -> (Arc<Registry>, Scheduler, Arc<Descriptor>) {
        let reg = Arc::new(Registry::new());
        let sched = Scheduler::new(Arc::clone(&reg));
        let main = reg.register();
        sched.enqueue_first(&main);
        (reg, sched, main)
    }

    #[test]
    fn sole_thread_cycles_turns() {
        let (_reg, sched, main) = fresh();
        for i in 1..=5u64 {
            sched.get_turn(&main);
            assert_eq!(sched.inc_turn(&main), Turn::from_u64(i));
            sched.put_turn(&main, false);
        }
        assert_eq!(sched.turn_count(), Turn::from_u64(5));
    }

    #[test]
    fn sole_waiter_hits_the_deadlock_escape() {
        let (_reg, sched, main) = fresh();
        sched.get_turn(&main);
        let dl = sched.turn_count().deadline_after(1000);
        // No one can ever signal, so the escape promotes us immediately.
        let res = sched.wait(&main, Some(0xbeef_usize), dl);
        assert_eq!(res, WaitResult::TimedOut);
    }

    #[test]
    fn escape_fires_for_indefinite_waiters_despite_parked_idle() {
        let (reg, sched, main) = fresh();
        let sched = Arc::new(sched);

        // A real idle thread that takes one turn and parks, as the idle
        // loop does while application threads are runnable.
        let idle = reg.register();
        sched.enqueue_child(idle.tid);
        sched.set_idle(idle.tid);
        let schedc = Arc::clone(&sched);
        let idle_thread = thread::spawn(move || {
            schedc.get_turn(&idle);
            schedc.idle_park(&idle);
        });

        sched.get_turn(&main);
        sched.put_turn(&main, false);
        // The idle thread has parked by the time we are head again.
        sched.get_turn(&main);
        // An indefinite wait with no one left to signal must hit the
        // escape, not hand the queue to the idle thread forever.
        let res = sched.wait(&main, Some(0xdead_usize), Turn::MAX);
        assert_eq!(res, WaitResult::TimedOut);
        // The idle thread stays parked; it is deliberately leaked.
        drop(idle_thread);
    }

    #[test]
    fn signal_wakes_in_fifo_order() {
        let (reg, sched, main) = fresh();
        let sched = Arc::new(sched);
        let chan: Channel = 0xfeed;

        let mut joins = Vec::new();
        let mut tids = Vec::new();
        for _ in 0..2 {
            let child = reg.register();
            sched.enqueue_child(child.tid);
            tids.push(child.tid);
            let schedc = Arc::clone(&sched);
            joins.push(thread::spawn(move || {
                schedc.get_turn(&child);
                let res = schedc.wait(&child, Some(chan), Turn::MAX);
                assert_eq!(res, WaitResult::Signaled);
                schedc.put_turn(&child, true);
            }));
        }

        // Give both children their turn so they park on the channel.
        sched.get_turn(&main);
        sched.put_turn(&main, false);
        sched.get_turn(&main);
        sched.put_turn(&main, false);
        // Both are parked now (we got the turn back twice); wake them all.
        sched.get_turn(&main);
        sched.signal(&main, chan, true);
        sched.put_turn(&main, false);
        for j in joins {
            j.join().expect("child panicked");
        }
        sched.get_turn(&main);
        assert!(sched.is_zombie(tids[0]));
        assert!(sched.is_zombie(tids[1]));
    }
}
