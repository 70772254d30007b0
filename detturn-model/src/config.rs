/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Runtime configuration.

use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;
use serde::Serialize;

/// Configuration options for the deterministic runtime.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Parser)]
pub struct Config {
    /// Disable deterministic scheduling entirely.  With scheduling off every
    /// wrapper passes straight through to the native primitive.
    #[clap(long = "no-dmt", parse(from_flag = std::ops::Not::not))]
    pub dmt: bool,

    /// Append each serialized operation to the per-thread event log.
    #[clap(long)]
    pub log_sync: bool,

    /// Start the idle thread at runtime creation.  Required for converting
    /// physical timeouts into logical ones: without it nothing advances the
    /// turn counter while all application threads sleep.
    #[clap(long)]
    pub launch_idle_thread: bool,

    /// Calibration constant for the physical-to-logical time conversion:
    /// how many nanoseconds one turn is worth.
    #[clap(long, value_name = "uint64")]
    pub nanosec_per_turn: Option<u64>,

    /// Disable the regular-file bypass, serializing read/write/close on
    /// regular files as well.  Regular files exhibit no inter-process
    /// non-determinism worth serializing, so the bypass defaults to on.
    #[clap(long = "no-ignore-rw-regular-file", parse(from_flag = std::ops::Not::not))]
    pub ignore_rw_regular_file: bool,

    /// Perform the native sleep after a sleep wrapper's logical delay.
    #[clap(long)]
    pub exec_sleep: bool,

    /// Honor non-det region markers.  Without this, wrappers treat every
    /// call as deterministic and the markers are inert.
    #[clap(long)]
    pub enforce_non_det_annotations: bool,

    /// Maintain runtime counters (sync-op counts, lineup outcomes, non-det
    /// events) and print them on close.
    #[clap(long)]
    pub record_runtime_stat: bool,

    /// Directory receiving one log file per thread.
    #[clap(long, value_name = "path", default_value = "detturn-logs")]
    pub output_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            dmt: true,
            log_sync: false,
            launch_idle_thread: false,
            nanosec_per_turn: None,
            ignore_rw_regular_file: true,
            exec_sleep: false,
            enforce_non_det_annotations: false,
            record_runtime_stat: false,
            output_dir: PathBuf::from("detturn-logs"),
        }
    }
}

impl Config {
    /// Warn about settings that silently weaken the runtime's guarantees.
    pub fn warn_unusual(&self) {
        if !self.dmt {
            tracing::warn!(
                "deterministic scheduling is off; wrappers will pass through to native primitives"
            );
        }
        if !self.ignore_rw_regular_file {
            tracing::warn!(
                "regular-file bypass is off; regular file I/O will be serialized as well"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_empty_command_line() {
        let parsed = Config::parse_from(["detturn"]);
        assert_eq!(parsed, Config::default());
    }

    #[test]
    fn negated_flags() {
        let parsed = Config::parse_from(["detturn", "--no-dmt", "--no-ignore-rw-regular-file"]);
        assert!(!parsed.dmt);
        assert!(!parsed.ignore_rw_regular_file);
    }

    #[test]
    fn calibration_flag() {
        let parsed = Config::parse_from(["detturn", "--nanosec-per-turn", "1000"]);
        assert_eq!(parsed.nanosec_per_turn, Some(1000));
    }
}
