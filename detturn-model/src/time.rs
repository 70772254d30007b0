/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Logical turn counters used to order events deterministically.

use std::fmt;
use std::ops::Add;
use std::ops::Sub;

use serde::Deserialize;
use serde::Serialize;

// Time conversion constants from https://doc.rust-lang.org/stable/src/core/time.rs.html#26-30
/// Nanoseconds per second.
pub const NANOS_PER_SEC: u64 = 1_000_000_000;
/// Nanoseconds per millisecond.
pub const NANOS_PER_MILLI: u64 = 1_000_000;
/// Nanoseconds per microsecond.
pub const NANOS_PER_MICRO: u64 = 1_000;

/// The largest number of turns a relative physical timeout may convert to.
pub const MAX_REL_TURNS: u64 = 1_000_000;

// Logical time:
//--------------------------------------------------------------------------------

/// A point on the single logical timeline: the value of the global turn
/// counter.  Advancing it by one corresponds to completing one serialized
/// event.
///
/// `Turn::MAX` is reserved to mean an indefinite deadline (a wait that can
/// only be ended by a signal).
#[derive(
    Default,
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    Ord,
    PartialOrd,
    Eq,
    PartialEq,
    Hash
)]
pub struct Turn(u64);

impl Turn {
    /// Turn zero, before any serialized event has completed.
    pub const ZERO: Turn = Turn(0);
    /// The indefinite deadline.
    pub const MAX: Turn = Turn(u64::MAX);

    /// Create from a raw counter value.
    pub const fn from_u64(n: u64) -> Self {
        Turn(n)
    }

    /// The raw counter value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Is this the reserved indefinite deadline?
    pub fn is_indefinite(&self) -> bool {
        *self == Turn::MAX
    }

    /// A deadline some number of turns in the future.  Saturates at the
    /// indefinite deadline rather than wrapping; the counter is 64 bits wide
    /// precisely so it never wraps during a run.
    pub fn deadline_after(&self, turns: u64) -> Turn {
        Turn(self.0.saturating_add(turns))
    }
}

impl fmt::Display for Turn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_indefinite() {
            return write!(f, "indefinite");
        }
        // Group digits for readability, as large turn counts are common:
        let chars = format!("{}", self.0);
        let mut remain = chars.len();
        let mut first_char = true;
        for ch in chars.chars() {
            if !first_char && remain % 3 == 0 {
                write!(f, "_")?;
            }
            first_char = false;
            remain -= 1;
            write!(f, "{}", ch)?;
        }
        Ok(())
    }
}

impl Add<u64> for Turn {
    type Output = Self;
    fn add(self, rhs: u64) -> Self {
        Turn(self.0 + rhs)
    }
}

impl Sub for Turn {
    type Output = u64;
    fn sub(self, rhs: Self) -> u64 {
        self.0 - rhs.0
    }
}

#[test]
fn print_turns() {
    assert_eq!(format!("{}", Turn::from_u64(7)), "7");
    assert_eq!(format!("{}", Turn::from_u64(1_234_567)), "1_234_567");
    assert_eq!(format!("{}", Turn::MAX), "indefinite");
}

#[test]
fn deadlines_saturate() {
    assert_eq!(Turn::from_u64(5).deadline_after(10), Turn::from_u64(15));
    assert_eq!(Turn::MAX.deadline_after(1), Turn::MAX);
    assert!(Turn::from_u64(u64::MAX - 1).deadline_after(5).is_indefinite());
}
