/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Operation codes for the event log.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// The operation recorded by one log entry.
///
/// Operations that park the calling thread mid-protocol (condvar waits,
/// barrier waits) log two half-records; `logs_two_halves` identifies them so
/// offline tooling can pair the halves back up.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SyncOp {
    ThreadBegin,
    ThreadEnd,
    ThreadCreate,
    ThreadJoin,

    MutexInit,
    MutexDestroy,
    MutexLock,
    MutexTrylock,
    MutexTimedlock,
    MutexUnlock,

    RwlockInit,
    RwlockDestroy,
    RwlockRdlock,
    RwlockWrlock,
    RwlockTryRdlock,
    RwlockTryWrlock,
    RwlockUnlock,

    CondWait,
    CondTimedwait,
    CondSignal,
    CondBroadcast,

    BarrierInit,
    BarrierWait,
    BarrierDestroy,

    SemInit,
    SemWait,
    SemTryWait,
    SemTimedWait,
    SemPost,

    LineupInit,
    LineupStart,
    LineupEnd,
    LineupDestroy,

    NonDetStart,
    NonDetEnd,
    Symbolic,

    SchedYield,
    Sleep,
    Idle,
    Fork,

    Accept,
    Accept4,
    Connect,
    Send,
    Sendto,
    Recv,
    Recvfrom,
    Read,
    Write,
    Pread,
    Pwrite,
    Select,
    Poll,
    EpollWait,
    Waitpid,
    Close,
    LookupHost,
}

impl SyncOp {
    /// Does this operation produce a first-half and a second-half record?
    pub fn logs_two_halves(&self) -> bool {
        matches!(
            self,
            SyncOp::CondWait | SyncOp::CondTimedwait | SyncOp::BarrierWait
        )
    }
}

impl fmt::Display for SyncOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_half_ops() {
        assert!(SyncOp::CondWait.logs_two_halves());
        assert!(SyncOp::BarrierWait.logs_two_halves());
        assert!(!SyncOp::MutexLock.logs_two_halves());
        assert!(!SyncOp::Accept.logs_two_halves());
    }
}
