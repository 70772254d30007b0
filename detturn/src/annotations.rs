/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Annotations callable from application code.
//!
//! The non-det region and lineup entry points live with their machinery in
//! [`crate::nondet`] and [`crate::sync::lineup`]; here are the remaining
//! two: the timed-wait base time, and symbolic markers.

use std::time::SystemTime;

use detturn_model::Ins;
use detturn_model::SyncOp;

use crate::thread_state;
use crate::Runtime;

impl Runtime {
    /// Record the calling thread's base time.  Timed waits convert their
    /// absolute deadlines by differencing against this value, which is what
    /// keeps the resulting turn counts deterministic across runs.
    ///
    /// No turn is taken: the base time is thread-local and its value has no
    /// cross-thread effect.
    pub fn set_base_time(&self, t: SystemTime) {
        let ctx = thread_state::current();
        ctx.base_time.set(Some(t));
    }

    /// Mark an application value symbolically in the log.
    pub fn symbolic(&self, ins: Ins, addr: usize, len: usize, name: &str) {
        if self.passthrough() || self.in_nondet() {
            return;
        }
        tracing::debug!("symbolic marker {:?} at {:#x}", name, addr);
        let ctx = self.sched_start();
        self.sched_end(
            &ctx,
            ins,
            SyncOp::Symbolic,
            false,
            &[addr as u64, len as u64],
        );
    }
}
