/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The set of threads parked on user-level sync objects, each with an
//! optional deadline in turns.
//!
//! Two orders matter and must both be deterministic:
//!
//! 1. Per channel, waiters are kept in arrival order; `signal` wakes the
//!    oldest, and `signal(all)` wakes them all in arrival order.
//! 2. Globally, waiters are indexed by `(deadline, tid)`, so that expiry
//!    promotions happen in ascending deadline order with ties broken by
//!    ascending logical id.  Indefinite waits carry `Turn::MAX` and sort
//!    last, which also makes the deadlock path's "smallest deadline" pick
//!    well defined when every wait is indefinite.
//!
//! A thread waits on at most one channel at a time; inserting a thread that
//! is already parked is an invariant violation and panics.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::VecDeque;

use detturn_model::DetTid;
use detturn_model::Turn;

use crate::scheduler::Channel;

/// The wait queue: a multiset of parked threads keyed by channel.
#[derive(Debug, Clone, Default)]
pub struct WaitQueue {
    // Arrival order per channel.  Pure sleepers (no channel) appear only in
    // the deadline index.
    channels: HashMap<Channel, VecDeque<DetTid>>,

    // All parked threads, keyed for deterministic expiry.
    by_deadline: BTreeMap<(Turn, DetTid), Option<Channel>>,

    // Reverse lookup, also guarding the one-wait-per-thread invariant.
    entries: HashMap<DetTid, (Turn, Option<Channel>)>,
}

impl WaitQueue {
    /// An empty wait queue.
    pub fn new() -> Self {
        Default::default()
    }

    /// Park `tid` on `chan` (or on nothing: a pure sleep) until `deadline`.
    pub fn insert(&mut self, tid: DetTid, chan: Option<Channel>, deadline: Turn) {
        if self.entries.insert(tid, (deadline, chan)).is_some() {
            panic!("WaitQueue::insert: tid {} is already parked", tid);
        }
        let old = self.by_deadline.insert((deadline, tid), chan);
        assert!(old.is_none()); // (deadline, tid) is unique given entries
        if let Some(c) = chan {
            self.channels.entry(c).or_default().push_back(tid);
        }
    }

    fn unindex(&mut self, tid: DetTid) -> (Turn, Option<Channel>) {
        let (deadline, chan) = self
            .entries
            .remove(&tid)
            .unwrap_or_else(|| panic!("WaitQueue: tid {} is not parked", tid));
        let removed = self.by_deadline.remove(&(deadline, tid));
        assert!(removed.is_some());
        (deadline, chan)
    }

    fn remove_from_channel(&mut self, chan: Channel, tid: DetTid) {
        let deque = self
            .channels
            .get_mut(&chan)
            .expect("WaitQueue: channel missing for parked tid");
        let pos = deque
            .iter()
            .position(|t| *t == tid)
            .expect("WaitQueue: tid missing from its channel");
        deque.remove(pos);
        if deque.is_empty() {
            self.channels.remove(&chan);
        }
    }

    /// Remove and return the oldest waiter on `chan`, if any.
    pub fn pop_first_on(&mut self, chan: Channel) -> Option<DetTid> {
        let tid = {
            let deque = self.channels.get_mut(&chan)?;
            let tid = deque.pop_front().expect("channel deques are never empty");
            if deque.is_empty() {
                self.channels.remove(&chan);
            }
            tid
        };
        let _ = self.unindex(tid);
        Some(tid)
    }

    /// Remove and return every waiter on `chan`, in arrival order.
    pub fn drain_on(&mut self, chan: Channel) -> Vec<DetTid> {
        let tids: Vec<DetTid> = match self.channels.remove(&chan) {
            None => return Vec::new(),
            Some(deque) => deque.into(),
        };
        for tid in &tids {
            let _ = self.unindex(*tid);
        }
        tids
    }

    /// Remove and return the next expired waiter: smallest `(deadline, tid)`
    /// with `deadline <= now`.
    pub fn pop_expired(&mut self, now: Turn) -> Option<(Turn, DetTid)> {
        let (deadline, tid) = *self.by_deadline.keys().next()?;
        if deadline > now {
            return None;
        }
        if let (_, Some(chan)) = self.unindex(tid) {
            self.remove_from_channel(chan, tid);
        }
        Some((deadline, tid))
    }

    /// Remove and return the waiter with the smallest `(deadline, tid)`,
    /// regardless of the current turn.  This is the deadlock escape: when
    /// nothing can run, the earliest waiter is promoted with a timeout
    /// result even before its deadline.
    pub fn pop_earliest(&mut self) -> Option<(Turn, DetTid)> {
        let (deadline, tid) = *self.by_deadline.keys().next()?;
        if let (_, Some(chan)) = self.unindex(tid) {
            self.remove_from_channel(chan, tid);
        }
        Some((deadline, tid))
    }

    /// Are any threads parked on `chan`?
    pub fn has_waiters_on(&self, chan: Channel) -> bool {
        self.channels.contains_key(&chan)
    }

    /// Is any parked thread holding a finite deadline?  Indefinite waits
    /// sort last in the deadline index, so checking the first key suffices.
    pub fn has_finite_deadline(&self) -> bool {
        self.by_deadline
            .keys()
            .next()
            .map_or(false, |(dl, _)| !dl.is_indefinite())
    }

    /// Is `tid` parked?
    pub fn contains(&self, tid: DetTid) -> bool {
        self.entries.contains_key(&tid)
    }

    /// Number of parked threads.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Are no threads parked at all?
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry.  Only used when a forked child resets its scheduler.
    pub fn clear(&mut self) {
        self.channels.clear();
        self.by_deadline.clear();
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(n: i32) -> DetTid {
        DetTid::from_raw(n)
    }

    const CHAN_A: Channel = 0x1000;
    const CHAN_B: Channel = 0x2000;

    #[test]
    fn signal_order_is_arrival_order() {
        let mut wq = WaitQueue::new();
        wq.insert(t(2), Some(CHAN_A), Turn::MAX);
        wq.insert(t(0), Some(CHAN_A), Turn::MAX);
        wq.insert(t(1), Some(CHAN_B), Turn::MAX);
        assert_eq!(wq.pop_first_on(CHAN_A), Some(t(2)));
        assert_eq!(wq.pop_first_on(CHAN_A), Some(t(0)));
        assert_eq!(wq.pop_first_on(CHAN_A), None);
        assert_eq!(wq.drain_on(CHAN_B), vec![t(1)]);
        assert!(wq.is_empty());
    }

    #[test]
    fn broadcast_drains_in_arrival_order() {
        let mut wq = WaitQueue::new();
        wq.insert(t(3), Some(CHAN_A), Turn::from_u64(50));
        wq.insert(t(1), Some(CHAN_A), Turn::from_u64(10));
        wq.insert(t(2), Some(CHAN_A), Turn::MAX);
        assert_eq!(wq.drain_on(CHAN_A), vec![t(3), t(1), t(2)]);
        assert!(wq.is_empty());
    }

    #[test]
    fn expiry_is_by_deadline_then_tid() {
        let mut wq = WaitQueue::new();
        wq.insert(t(5), Some(CHAN_A), Turn::from_u64(20));
        wq.insert(t(4), Some(CHAN_B), Turn::from_u64(10));
        wq.insert(t(1), None, Turn::from_u64(10));
        wq.insert(t(9), Some(CHAN_A), Turn::MAX);

        assert_eq!(wq.pop_expired(Turn::from_u64(9)), None);
        assert_eq!(
            wq.pop_expired(Turn::from_u64(20)),
            Some((Turn::from_u64(10), t(1)))
        );
        assert_eq!(
            wq.pop_expired(Turn::from_u64(20)),
            Some((Turn::from_u64(10), t(4)))
        );
        assert_eq!(
            wq.pop_expired(Turn::from_u64(20)),
            Some((Turn::from_u64(20), t(5)))
        );
        assert_eq!(wq.pop_expired(Turn::from_u64(1000)), None);
        assert!(wq.has_waiters_on(CHAN_A));
    }

    #[test]
    fn finite_deadlines_are_visible() {
        let mut wq = WaitQueue::new();
        assert!(!wq.has_finite_deadline());
        wq.insert(t(1), Some(CHAN_A), Turn::MAX);
        assert!(!wq.has_finite_deadline());
        wq.insert(t(2), Some(CHAN_B), Turn::from_u64(30));
        assert!(wq.has_finite_deadline());
        assert_eq!(
            wq.pop_expired(Turn::from_u64(30)),
            Some((Turn::from_u64(30), t(2)))
        );
        assert!(!wq.has_finite_deadline());
    }

    #[test]
    fn earliest_pop_breaks_ties_by_tid() {
        let mut wq = WaitQueue::new();
        wq.insert(t(7), Some(CHAN_A), Turn::MAX);
        wq.insert(t(3), Some(CHAN_B), Turn::MAX);
        assert_eq!(wq.pop_earliest(), Some((Turn::MAX, t(3))));
        assert_eq!(wq.pop_earliest(), Some((Turn::MAX, t(7))));
        assert_eq!(wq.pop_earliest(), None);
    }

    #[test]
    #[should_panic]
    fn double_park_is_fatal() {
        let mut wq = WaitQueue::new();
        wq.insert(t(1), Some(CHAN_A), Turn::MAX);
        wq.insert(t(1), Some(CHAN_B), Turn::MAX);
    }
}
