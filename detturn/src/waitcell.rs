/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The blocking cells the scheduler sleeps threads on.
//!
//! `WaitSlot` is the per-thread wake primitive: a binary permit.  The
//! scheduler posts a thread's slot exactly when that thread becomes head of
//! the run queue, and the thread consumes the permit to take its turn.  The
//! binary discipline means a double post is always a scheduler bug, and the
//! slot panics rather than absorbing it.
//!
//! `Semaphore` is a plain counting semaphore, used in pairs for the spawn
//! hand-off protocol.

use std::sync::Condvar;
use std::sync::Mutex;

/// A binary permit with blocking consume.
#[derive(Debug, Default)]
pub struct WaitSlot {
    posted: Mutex<bool>,
    cv: Condvar,
}

impl WaitSlot {
    /// A fresh slot with no permit.
    pub fn new() -> Self {
        Default::default()
    }

    /// Post the permit, waking the consumer if it is blocked.
    ///
    /// Panics if a permit is already pending: each post must be matched by a
    /// consume before the next post.
    pub fn post(&self) {
        let mut posted = self.posted.lock().expect("WaitSlot lock poisoned");
        if *posted {
            panic!("WaitSlot double post: a permit is already pending");
        }
        *posted = true;
        self.cv.notify_one();
    }

    /// Block until a permit is available, then consume it.
    pub fn wait(&self) {
        let mut posted = self.posted.lock().expect("WaitSlot lock poisoned");
        while !*posted {
            posted = self.cv.wait(posted).expect("WaitSlot lock poisoned");
        }
        *posted = false;
    }
}

/// A counting semaphore.
#[derive(Debug, Default)]
pub struct Semaphore {
    count: Mutex<u32>,
    cv: Condvar,
}

impl Semaphore {
    /// A semaphore with an initial count of zero.
    pub fn new() -> Self {
        Default::default()
    }

    /// Increment the count, waking one waiter.
    pub fn post(&self) {
        let mut count = self.count.lock().expect("Semaphore lock poisoned");
        *count += 1;
        self.cv.notify_one();
    }

    /// Block until the count is positive, then decrement it.
    pub fn wait(&self) {
        let mut count = self.count.lock().expect("Semaphore lock poisoned");
        while *count == 0 {
            count = self.cv.wait(count).expect("Semaphore lock poisoned");
        }
        *count -= 1;
    }

    /// Drop any accumulated permits.  Used by the fork path, where the child
    /// must not observe posts that paired with the parent's threads.
    pub fn reset(&self) {
        let mut count = self.count.lock().expect("Semaphore lock poisoned");
        *count = 0;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn slot_post_then_wait() {
        let s = WaitSlot::new();
        s.post();
        s.wait();
        // Permit consumed; a new post is legal again.
        s.post();
        s.wait();
    }

    #[test]
    #[should_panic]
    fn slot_double_post() {
        let s = WaitSlot::new();
        s.post();
        s.post();
    }

    #[test]
    fn slot_cross_thread() {
        let s = Arc::new(WaitSlot::new());
        let s2 = Arc::clone(&s);
        let jh = thread::spawn(move || {
            s2.wait();
        });
        s.post();
        jh.join().expect("join failed");
    }

    #[test]
    fn semaphore_counts() {
        let s = Arc::new(Semaphore::new());
        s.post();
        s.post();
        s.wait();
        s.wait();

        let s2 = Arc::clone(&s);
        let jh = thread::spawn(move || {
            s2.wait();
            s2.post();
        });
        s.post();
        jh.join().expect("join failed");
        s.wait();
    }
}
