/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Conversions between physical time and logical turns.
//!
//! Timed waits in the wrapped program are expressed in wall-clock units, but
//! a deterministic run can only honor deadlines measured in turns.  The
//! mapping needs a calibration constant (`nanosec_per_turn`) and someone to
//! actually advance the counter while everyone sleeps (the idle thread);
//! converting without either is non-deterministic, so those are hard errors.

use std::time::Duration;
use std::time::SystemTime;

use detturn_model::time::MAX_REL_TURNS;
use detturn_model::Config;

/// Convert a relative physical duration into a number of turns.
///
/// The result is capped at [`MAX_REL_TURNS`] and floored at `5*nthread + 1`:
/// a thread asking for a tiny timeout must still see every other thread get
/// a few turns before it expires, or it could starve them.
pub(crate) fn rel_to_turns(cfg: &Config, nthread: usize, dur: Duration) -> u64 {
    if !cfg.launch_idle_thread {
        panic!(
            "converting a physical time to logical turns without the idle thread; \
             nothing would advance the clock. Set launch_idle_thread and rerun."
        );
    }
    let nanos_per_turn = cfg.nanosec_per_turn.unwrap_or_else(|| {
        panic!(
            "physical timeout used without a nanosec_per_turn calibration; \
             the conversion would be non-deterministic"
        )
    });

    let ns = u64::try_from(dur.as_nanos()).unwrap_or(u64::MAX);
    let turns = (ns / nanos_per_turn).min(MAX_REL_TURNS);
    turns.max(5 * nthread as u64 + 1)
}

/// Convert an absolute wall-clock deadline to a relative duration by
/// differencing against the caller's base time.
///
/// Returns the duration and whether the wall-clock fallback was taken: with
/// no base time set the current clock is the only reference available, and
/// the run is no longer deterministic.
pub(crate) fn abs_to_rel(base: Option<SystemTime>, abstime: SystemTime) -> (Duration, bool) {
    match base {
        Some(b) => (abstime.duration_since(b).unwrap_or(Duration::ZERO), false),
        None => {
            tracing::warn!(
                "absolute timeout used without set_base_time; falling back to the wall \
                 clock, this run is not deterministic"
            );
            (
                abstime
                    .duration_since(SystemTime::now())
                    .unwrap_or(Duration::ZERO),
                true,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(nspt: Option<u64>, idle: bool) -> Config {
        Config {
            nanosec_per_turn: nspt,
            launch_idle_thread: idle,
            ..Default::default()
        }
    }

    #[test]
    fn millis_scale_by_calibration() {
        let c = cfg(Some(1000), true);
        assert_eq!(rel_to_turns(&c, 2, Duration::from_millis(2)), 2000);
    }

    #[test]
    fn tiny_timeouts_get_the_starvation_floor() {
        let c = cfg(Some(1000), true);
        assert_eq!(rel_to_turns(&c, 2, Duration::from_nanos(1)), 11);
        assert_eq!(rel_to_turns(&c, 10, Duration::from_nanos(1)), 51);
    }

    #[test]
    fn huge_timeouts_are_capped() {
        let c = cfg(Some(1), true);
        assert_eq!(
            rel_to_turns(&c, 2, Duration::from_secs(3600)),
            MAX_REL_TURNS
        );
    }

    #[test]
    #[should_panic]
    fn missing_calibration_is_fatal() {
        let c = cfg(None, true);
        let _ = rel_to_turns(&c, 2, Duration::from_millis(1));
    }

    #[test]
    #[should_panic]
    fn missing_idle_thread_is_fatal() {
        let c = cfg(Some(1000), false);
        let _ = rel_to_turns(&c, 2, Duration::from_millis(1));
    }

    #[test]
    fn base_time_differencing() {
        let base = SystemTime::UNIX_EPOCH;
        let abstime = base + Duration::from_millis(5);
        let (rel, fellback) = abs_to_rel(Some(base), abstime);
        assert_eq!(rel, Duration::from_millis(5));
        assert!(!fellback);
    }

    #[test]
    fn past_deadlines_clamp_to_zero() {
        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(10);
        let abstime = SystemTime::UNIX_EPOCH;
        let (rel, fellback) = abs_to_rel(Some(base), abstime);
        assert_eq!(rel, Duration::ZERO);
        assert!(!fellback);
    }

    #[test]
    fn no_base_time_falls_back() {
        let (_rel, fellback) = abs_to_rel(None, SystemTime::now());
        assert!(fellback);
    }
}
