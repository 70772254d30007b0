/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Thread registry: assigns and retires dense logical thread ids and owns
//! the per-thread descriptors.
//!
//! Queues in the scheduler reference threads by id only; the descriptor
//! storage here is the single owner.  A descriptor is created by the
//! *spawning* thread while it holds the turn (so id assignment is totally
//! ordered), published before the child is released to run, and destroyed
//! only after a successful join.
//!
//! The spawn hand-off itself uses two semaphores.  One "begin" semaphore is
//! insufficient: two concurrent spawns could pair posts and waits across the
//! wrong children.  The "begin done" semaphore forces the parent to
//! synchronize with its own child before the next spawn can proceed.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use detturn_model::tid::INVALID_TID;
use detturn_model::DetTid;

use crate::scheduler::Channel;
use crate::waitcell::Semaphore;
use crate::waitcell::WaitSlot;

/// Per-thread scheduling state.  Written by the owning thread and by the
/// scheduler during queue moves; those moves happen under the scheduler's
/// lock.
#[derive(Debug)]
pub struct Descriptor {
    /// The dense logical id.
    pub tid: DetTid,

    /// The wake primitive: posted exactly when this thread becomes head of
    /// the run queue.
    pub slot: WaitSlot,

    /// Set by the scheduler when this thread is promoted out of the wait
    /// queue by a deadline rather than a signal.  Consumed (cleared) by the
    /// thread when its `wait` returns.
    pub timedout: AtomicBool,
}

impl Descriptor {
    fn new(tid: DetTid) -> Arc<Self> {
        Arc::new(Descriptor {
            tid,
            slot: WaitSlot::new(),
            timedout: AtomicBool::new(false),
        })
    }

    /// Take and clear the timed-out mark.
    pub fn take_timedout(&self) -> bool {
        self.timedout.swap(false, Ordering::SeqCst)
    }
}

/// The channel a thread's joiners wait on: the address of its descriptor,
/// which is stable for the descriptor's lifetime and cannot collide with any
/// user sync object.
pub fn exit_chan(desc: &Arc<Descriptor>) -> Channel {
    Arc::as_ptr(desc) as Channel
}

#[derive(Debug, Default)]
struct Inner {
    next_tid: DetTid,
    table: HashMap<DetTid, Arc<Descriptor>>,
}

/// Owner of all thread descriptors, plus the spawn hand-off machinery.
#[derive(Debug)]
pub struct Registry {
    inner: Mutex<Inner>,

    /// Posted by the parent after it has released the turn; the child parks
    /// here until its id is published.
    pub begin_sem: Semaphore,

    /// Posted by the child once it has read its id; the parent parks here so
    /// a second spawn cannot race on `begin_sem`.
    pub begin_done_sem: Semaphore,

    /// The id in flight between a parent and its child.  Only ever written
    /// while the parent holds the turn, and consumed by exactly one child
    /// because `begin_done_sem` serializes spawns.
    handoff: Mutex<DetTid>,
}

impl Registry {
    /// An empty registry; ids start at 0.
    pub fn new() -> Self {
        Registry {
            inner: Mutex::new(Inner::default()),
            begin_sem: Semaphore::new(),
            begin_done_sem: Semaphore::new(),
            handoff: Mutex::new(INVALID_TID),
        }
    }

    /// Assign the next dense id and create its descriptor.  Must be called
    /// by a thread holding the turn (or during single-threaded startup).
    pub fn register(&self) -> Arc<Descriptor> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let tid = inner.next_tid;
        inner.next_tid = tid.next();
        let desc = Descriptor::new(tid);
        let old = inner.table.insert(tid, Arc::clone(&desc));
        assert!(old.is_none(), "duplicate registration of tid {}", tid);
        desc
    }

    /// Look up a live descriptor.  Unknown ids are a runtime bug.
    pub fn get(&self, tid: DetTid) -> Arc<Descriptor> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        Arc::clone(
            inner
                .table
                .get(&tid)
                .unwrap_or_else(|| panic!("no descriptor registered for tid {}", tid)),
        )
    }

    /// Destroy a descriptor after a successful join.
    pub fn reap(&self, tid: DetTid) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        inner
            .table
            .remove(&tid)
            .unwrap_or_else(|| panic!("reap of unregistered tid {}", tid));
    }

    /// Number of live threads (zombies included until they are joined).
    pub fn nthread(&self) -> usize {
        self.inner.lock().expect("registry lock poisoned").table.len()
    }

    /// Publish a child's id for the hand-off.
    pub fn set_handoff(&self, tid: DetTid) {
        let mut h = self.handoff.lock().expect("handoff lock poisoned");
        assert_eq!(
            *h, INVALID_TID,
            "spawn hand-off overlap: tid {} still in flight",
            *h
        );
        *h = tid;
    }

    /// Consume the published id in the child.
    pub fn take_handoff(&self) -> DetTid {
        let mut h = self.handoff.lock().expect("handoff lock poisoned");
        let tid = *h;
        assert_ne!(tid, INVALID_TID, "spawn hand-off empty");
        *h = INVALID_TID;
        tid
    }

    /// After fork, the child keeps only its own descriptor and must not see
    /// hand-offs or semaphore posts that paired with the parent's threads.
    pub fn reset_for_child(&self, keep: &Arc<Descriptor>) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        inner.table.retain(|tid, _| *tid == keep.tid);
        drop(inner);
        self.begin_sem.reset();
        self.begin_done_sem.reset();
        let mut h = self.handoff.lock().expect("handoff lock poisoned");
        *h = INVALID_TID;
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use detturn_model::tid::MAIN_TID;

    use super::*;

    #[test]
    fn dense_ids_in_registration_order() {
        let reg = Registry::new();
        let a = reg.register();
        let b = reg.register();
        let c = reg.register();
        assert_eq!(a.tid, MAIN_TID);
        assert_eq!(b.tid, DetTid::from_raw(1));
        assert_eq!(c.tid, DetTid::from_raw(2));
        assert_eq!(reg.nthread(), 3);
    }

    #[test]
    fn reap_frees_the_slot() {
        let reg = Registry::new();
        let a = reg.register();
        let _b = reg.register();
        reg.reap(a.tid);
        assert_eq!(reg.nthread(), 1);
    }

    #[test]
    #[should_panic]
    fn get_unknown_tid_is_fatal() {
        let reg = Registry::new();
        let _ = reg.get(DetTid::from_raw(9));
    }

    #[test]
    fn handoff_roundtrip() {
        let reg = Registry::new();
        let a = reg.register();
        reg.set_handoff(a.tid);
        assert_eq!(reg.take_handoff(), a.tid);
    }

    #[test]
    fn exit_channels_are_distinct() {
        let reg = Registry::new();
        let a = reg.register();
        let b = reg.register();
        assert_ne!(exit_chan(&a), exit_chan(&b));
    }
}
