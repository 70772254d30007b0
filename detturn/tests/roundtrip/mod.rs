/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Determinism of the recorded timeline: two runs of the same program must
//! produce identical `(turn, tid, op)` sequences.  Object addresses and
//! timings differ across runs and are excluded by construction.

use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use detturn::Config;
use detturn::Runtime;
use detturn::SyncOp;

/// Merge every per-thread log under `dir` into one global sequence ordered
/// by turn number.
fn merged_timeline(dir: &Path) -> Vec<(u64, i32, SyncOp, bool)> {
    let mut all = Vec::new();
    for entry in std::fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        // Files are named tid-<pid>-<logical_id>.log
        let tid: i32 = name
            .strip_prefix("tid-")
            .and_then(|s| s.strip_suffix(".log"))
            .and_then(|s| s.rsplit('-').next())
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| panic!("unexpected log file name {}", name));
        for ev in detturn::logger::read_log(&path).unwrap() {
            all.push((ev.turn, tid, ev.op, ev.second_half));
        }
    }
    all.sort();
    all
}

fn run_program(dir: &Path) {
    let cfg = Config {
        log_sync: true,
        output_dir: dir.to_path_buf(),
        ..Config::default()
    };
    let rt = Runtime::new(cfg).unwrap();
    let m = rt.mutex_init(1);
    let cv = detturn::DetCondvar::new();
    let b = rt.barrier_init(2, 3).unwrap();
    let ready: Arc<StdMutex<bool>> = Arc::new(StdMutex::new(false));

    let mut joins = Vec::new();
    for id in 0..2 {
        let rt2 = Arc::clone(&rt);
        let (m2, cv2, b2, ready2) = (m.clone(), cv.clone(), b.clone(), Arc::clone(&ready));
        joins.push(rt.spawn(10 + id, move || {
            rt2.mutex_lock(20, &m2).unwrap();
            if id == 0 {
                *ready2.lock().unwrap() = true;
                rt2.cond_signal(21, &cv2);
            } else {
                while !*ready2.lock().unwrap() {
                    rt2.cond_wait(22, &cv2, &m2).unwrap();
                }
            }
            rt2.mutex_unlock(23, &m2).unwrap();
            let _ = rt2.barrier_wait(24, &b2);
        }));
    }
    let _ = rt.barrier_wait(25, &b).unwrap();
    for j in joins {
        rt.join(26, j).unwrap();
    }
    rt.prog_end();
}

#[test]
fn identical_runs_produce_identical_timelines() {
    let dir1 = tempfile::tempdir().unwrap();
    let dir2 = tempfile::tempdir().unwrap();
    run_program(dir1.path());
    run_program(dir2.path());

    let t1 = merged_timeline(dir1.path());
    let t2 = merged_timeline(dir2.path());
    assert!(!t1.is_empty());
    assert_eq!(t1, t2);
}

/// Turn numbers are strictly monotonic across the union of all threads'
/// logs: every record gets its own turn.
#[test]
fn turns_are_globally_unique() {
    let dir = tempfile::tempdir().unwrap();
    run_program(dir.path());
    let timeline = merged_timeline(dir.path());
    for pair in timeline.windows(2) {
        assert!(
            pair[0].0 < pair[1].0,
            "turn {} appears more than once",
            pair[0].0
        );
    }
}
