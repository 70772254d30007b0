/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Deterministic logical thread ids.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

// Deterministic logical thread ids:
//--------------------------------------------------------------------------------

/// A dense logical thread id assigned by the runtime's registry.
///
/// The initial thread is always id 0, and ids count upward from there in
/// spawn order (which is itself deterministic because ids are assigned while
/// the spawning thread holds the turn).
#[derive(
    PartialEq, // Silly protection from rustfmt disagreements.
    Debug,
    Eq,
    Clone,
    Copy,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Default,
)]
pub struct DetTid(i32);

/// The reserved id meaning "no thread".
pub const INVALID_TID: DetTid = DetTid(-1);

/// The id of the initial (main) thread.
pub const MAIN_TID: DetTid = DetTid(0);

impl fmt::Display for DetTid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl DetTid {
    /// Create a DetTid from a raw integer.
    pub const fn from_raw(tid: i32) -> DetTid {
        DetTid(tid)
    }

    /// Convert to a raw integer.
    pub fn as_raw(&self) -> i32 {
        self.0
    }

    /// The next id in the dense sequence.  Exhausting 31 bits of thread ids
    /// is a programmer error that would compromise determinism.
    pub fn next(&self) -> DetTid {
        let n = self
            .0
            .checked_add(1)
            .expect("logical thread id space exhausted");
        DetTid(n)
    }
}

impl FromStr for DetTid {
    type Err = <i32 as FromStr>::Err;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_raw(s.parse::<i32>()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dense_sequence() {
        assert_eq!(MAIN_TID.next(), DetTid::from_raw(1));
        assert_eq!(DetTid::from_raw(41).next(), DetTid::from_raw(42));
    }

    #[test]
    fn parse_roundtrip() {
        let t: DetTid = "7".parse().unwrap();
        assert_eq!(t, DetTid::from_raw(7));
        assert_eq!(format!("{}", t), "7");
    }
}
