/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Deterministic synchronization primitives.
//!
//! Every wrapper follows the same skeleton: pass through to the native layer
//! inside non-det regions, otherwise take the turn, run the per-primitive
//! protocol against the scheduler's wait queue, bump the turn counter, log,
//! and release the turn.  The native layer under each object exists for two
//! reasons: try-operations are answered by it directly, and non-det regions
//! use it for real blocking.  All deterministic *waiting* happens on the
//! scheduler's wait queue, never inside a native primitive; the wait channel
//! for an object is the address of its shared state.

pub mod barrier;
pub mod condvar;
pub mod lineup;
pub mod mutex;
pub mod rwlock;
pub mod semaphore;

pub use barrier::DetBarrier;
pub use condvar::DetCondvar;
pub use mutex::DetMutex;
pub use rwlock::DetRwLock;
pub use semaphore::DetSemaphore;
