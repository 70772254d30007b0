/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The queue of threads eligible to take the next turn.
//!
//! Order is strictly FIFO: a thread is assigned a monotonically increasing
//! insertion order when it is pushed, and the numerically smallest order is
//! the head, which owns the turn token.  We use a "flattened" `BTreeMap`
//! keyed by insertion order rather than a `VecDeque` so that removing an
//! arbitrary thread (a thread leaving for an external blocking call can be
//! anywhere in the queue) never shifts the orders of the others.

use std::collections::BTreeMap;
use std::fmt;

use detturn_model::DetTid;

/// The insertion order of threads in the queue.  Lowest runs first.
type QueueOrder = u64;

/// A strictly FIFO run queue referencing threads by id.
#[derive(Debug, Clone, Default)]
pub struct RunQueue {
    queue: BTreeMap<QueueOrder, DetTid>,

    // A global counter across the queue's lifetime: every insertion gets a
    // fresh key, so re-pushing a rotated thread always lands at the back.
    last_order: QueueOrder,
}

/// A multi-line print of the runqueue.
impl fmt::Display for RunQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Run queue, size={}, last_order={}:",
            self.queue.len(),
            self.last_order,
        )?;
        for x in self.queue.iter() {
            writeln!(f, "    {:?}", x)?;
        }
        Ok(())
    }
}

impl RunQueue {
    /// Create a new, empty RunQueue.
    pub fn new() -> Self {
        Default::default()
    }

    fn push_safety_check(&self, tid: DetTid) {
        if cfg!(debug_assertions) {
            // Expensive.
            for qtid in self.queue.values() {
                if *qtid == tid {
                    panic!(
                        "Invariant violation! Tried to add {} to runqueue, but it's already present:\n {}",
                        tid, self
                    );
                }
            }
        }
    }

    /// Push a thread to the back of the queue.
    pub fn push_back(&mut self, tid: DetTid) {
        self.push_safety_check(tid);
        self.last_order += 1;
        let old = self.queue.insert(self.last_order, tid);
        assert!(old.is_none()); // last_order is monotonic
    }

    /// The thread currently owning the turn token, if any.
    pub fn head(&self) -> Option<DetTid> {
        self.queue.iter().next().map(|(_k, v)| *v)
    }

    /// Remove and return the head.
    pub fn pop_head(&mut self) -> Option<DetTid> {
        let key = *self.queue.keys().next()?;
        self.queue.remove(&key)
    }

    /// Rotate the head to the back of the queue.
    pub fn rotate(&mut self) {
        if let Some(tid) = self.pop_head() {
            self.push_back(tid);
        }
    }

    /// Remove `tid` from the queue, returning true if removal occurred.
    pub fn remove_tid(&mut self, tid: DetTid) -> bool {
        // O(N), but queues are short and removal is rare (external blocking).
        let mut kept_all = true;
        self.queue.retain(|_k, v| {
            let ret = *v != tid;
            kept_all = kept_all && ret;
            ret
        });
        !kept_all
    }

    /// Is `tid` queued?
    pub fn contains_tid(&self, tid: DetTid) -> bool {
        self.queue.values().any(|t| *t == tid)
    }

    /// Number of queued threads.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Is the queue empty?
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// The queued ids in FIFO order.
    pub fn tids(&self) -> impl Iterator<Item = &DetTid> {
        self.queue.values()
    }

    /// Drop every entry.  Only used when a forked child resets its scheduler.
    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(n: i32) -> DetTid {
        DetTid::from_raw(n)
    }

    #[test]
    fn fifo_order() {
        let mut q = RunQueue::new();
        q.push_back(t(0));
        q.push_back(t(1));
        q.push_back(t(2));
        assert_eq!(q.head(), Some(t(0)));
        assert_eq!(q.pop_head(), Some(t(0)));
        assert_eq!(q.pop_head(), Some(t(1)));
        assert_eq!(q.pop_head(), Some(t(2)));
        assert_eq!(q.pop_head(), None);
    }

    #[test]
    fn rotation_moves_head_to_back() {
        let mut q = RunQueue::new();
        q.push_back(t(0));
        q.push_back(t(1));
        q.rotate();
        assert_eq!(q.head(), Some(t(1)));
        q.rotate();
        assert_eq!(q.head(), Some(t(0)));
    }

    #[test]
    fn remove_from_middle_preserves_order() {
        let mut q = RunQueue::new();
        q.push_back(t(0));
        q.push_back(t(1));
        q.push_back(t(2));
        assert!(q.remove_tid(t(1)));
        assert!(!q.remove_tid(t(1)));
        let order: Vec<_> = q.tids().copied().collect();
        assert_eq!(order, vec![t(0), t(2)]);
    }

    #[test]
    #[should_panic]
    #[cfg(debug_assertions)]
    fn double_push_is_fatal() {
        let mut q = RunQueue::new();
        q.push_back(t(0));
        q.push_back(t(0));
    }
}
