/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! End-to-end scenarios exercising the turn protocol across primitives.

use std::collections::VecDeque;
use std::net::TcpListener;
use std::net::TcpStream;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use std::time::SystemTime;

use detturn::Config;
use detturn::Runtime;
use detturn::SyncOp;
use nix::errno::Errno;

fn det_config() -> Config {
    Config::default()
}

fn timed_config() -> Config {
    Config {
        launch_idle_thread: true,
        nanosec_per_turn: Some(1000),
        ..Config::default()
    }
}

/// Two racers lock the same mutex and append their id; spawn order wins,
/// regardless of how the OS schedules the two threads.
#[test]
fn two_mutex_racers_order_by_spawn() {
    for _ in 0..20 {
        let rt = Runtime::new(det_config()).unwrap();
        let m = rt.mutex_init(1);
        let buf: Arc<StdMutex<Vec<i32>>> = Arc::new(StdMutex::new(Vec::new()));

        let mut joins = Vec::new();
        for id in 1..=2 {
            let (rt2, m2, buf2) = (Arc::clone(&rt), m.clone(), Arc::clone(&buf));
            joins.push(rt.spawn(10 + id as u32, move || {
                rt2.mutex_lock(20, &m2).unwrap();
                buf2.lock().unwrap().push(id);
                rt2.mutex_unlock(21, &m2).unwrap();
            }));
        }
        for j in joins {
            rt.join(30, j).unwrap();
        }
        rt.prog_end();
        assert_eq!(*buf.lock().unwrap(), vec![1, 2]);
    }
}

/// Producer/consumer over a condvar: pop order equals push order for 100
/// items, with the consumer waking deterministically after each signal.
#[test]
fn producer_consumer_condvar() {
    const ITEMS: u32 = 100;
    let rt = Runtime::new(det_config()).unwrap();
    let m = rt.mutex_init(1);
    let cv = detturn::DetCondvar::new();
    let q: Arc<StdMutex<VecDeque<u32>>> = Arc::new(StdMutex::new(VecDeque::new()));

    let (rt2, m2, cv2, q2) = (Arc::clone(&rt), m.clone(), cv.clone(), Arc::clone(&q));
    let producer = rt.spawn(2, move || {
        for i in 0..ITEMS {
            rt2.mutex_lock(3, &m2).unwrap();
            q2.lock().unwrap().push_back(i);
            rt2.cond_signal(4, &cv2);
            rt2.mutex_unlock(5, &m2).unwrap();
        }
    });

    let (rt3, m3, cv3, q3) = (Arc::clone(&rt), m.clone(), cv.clone(), Arc::clone(&q));
    let popped: Arc<StdMutex<Vec<u32>>> = Arc::new(StdMutex::new(Vec::new()));
    let popped2 = Arc::clone(&popped);
    let consumer = rt.spawn(6, move || {
        for _ in 0..ITEMS {
            rt3.mutex_lock(7, &m3).unwrap();
            loop {
                let item = q3.lock().unwrap().pop_front();
                match item {
                    Some(x) => {
                        popped2.lock().unwrap().push(x);
                        break;
                    }
                    None => rt3.cond_wait(8, &cv3, &m3).unwrap(),
                }
            }
            rt3.mutex_unlock(9, &m3).unwrap();
        }
    });

    rt.join(10, producer).unwrap();
    rt.join(11, consumer).unwrap();
    rt.prog_end();

    let got = popped.lock().unwrap().clone();
    let want: Vec<u32> = (0..ITEMS).collect();
    assert_eq!(got, want);
}

/// Four threads enter a barrier; exactly one observes the serial return.
/// The same barrier is reused for a second round.
#[test]
fn barrier_of_four_one_serial_per_round() {
    let rt = Runtime::new(det_config()).unwrap();
    let b = rt.barrier_init(1, 4).unwrap();
    let serials = Arc::new([AtomicUsize::new(0), AtomicUsize::new(0)]);

    let mut joins = Vec::new();
    for _ in 0..4 {
        let (rt2, b2, serials2) = (Arc::clone(&rt), b.clone(), Arc::clone(&serials));
        joins.push(rt.spawn(2, move || {
            for round in 0..2 {
                if rt2.barrier_wait(3, &b2).unwrap() {
                    serials2[round].fetch_add(1, Ordering::SeqCst);
                }
            }
        }));
    }
    for j in joins {
        rt.join(4, j).unwrap();
    }
    rt.barrier_destroy(5, b).unwrap();
    rt.prog_end();

    assert_eq!(serials[0].load(Ordering::SeqCst), 1);
    assert_eq!(serials[1].load(Ordering::SeqCst), 1);
}

/// A timed wait on an empty semaphore expires after the converted number of
/// logical turns, driven by the idle thread, and surfaces ETIMEDOUT.
#[test]
fn timed_semaphore_expires_in_logical_time() {
    let rt = Runtime::new(timed_config()).unwrap();
    let now = SystemTime::now();
    rt.set_base_time(now);
    let s = rt.sem_init(1, 0);

    let before = rt.turn_count();
    // 2ms at 1000ns per turn is 2000 turns, above the 5*nthread+1 floor.
    let res = rt.sem_timedwait(2, &s, now + Duration::from_millis(2));
    let after = rt.turn_count();
    rt.prog_end();

    assert_eq!(res, Err(Errno::ETIMEDOUT));
    let waited = after - before;
    assert!(waited >= 2000, "only {} turns elapsed", waited);
    assert!(waited <= 2010, "{} turns elapsed", waited);
}

/// One thread parks in accept (leaving the deterministic queue) while
/// another performs 1000 serialized increments; the logs show the 1000
/// ordered lock events and exactly one accept completion.
#[test]
fn blocking_accept_does_not_stall_compute() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = Config {
        log_sync: true,
        output_dir: dir.path().to_path_buf(),
        ..Config::default()
    };
    let rt = Runtime::new(cfg).unwrap();
    let m = rt.mutex_init(1);
    let counter = Arc::new(AtomicUsize::new(0));

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let rt2 = Arc::clone(&rt);
    let acceptor = rt.spawn(2, move || {
        let fd = rt2.accept(3, listener.as_raw_fd()).unwrap();
        let _ = nix::unistd::close(fd);
        drop(listener);
    });
    let acceptor_tid = acceptor.tid();

    let (rt3, m2, counter2) = (Arc::clone(&rt), m.clone(), Arc::clone(&counter));
    let worker = rt.spawn(4, move || {
        for _ in 0..1000 {
            rt3.mutex_lock(5, &m2).unwrap();
            counter2.fetch_add(1, Ordering::SeqCst);
            rt3.mutex_unlock(6, &m2).unwrap();
        }
    });
    let worker_tid = worker.tid();

    // The backlog holds the connection until the acceptor gets to it.
    let conn = TcpStream::connect(addr).unwrap();

    rt.join(7, worker).unwrap();
    rt.join(8, acceptor).unwrap();
    drop(conn);
    rt.prog_end();

    assert_eq!(counter.load(Ordering::SeqCst), 1000);

    let worker_log =
        detturn::logger::read_log(&detturn::logger::log_file_path(dir.path(), worker_tid))
            .unwrap();
    let locks = worker_log
        .iter()
        .filter(|e| e.op == SyncOp::MutexLock)
        .count();
    assert_eq!(locks, 1000);

    let acceptor_log =
        detturn::logger::read_log(&detturn::logger::log_file_path(dir.path(), acceptor_tid))
            .unwrap();
    let accepts = acceptor_log
        .iter()
        .filter(|e| e.op == SyncOp::Accept)
        .count();
    assert_eq!(accepts, 1);
}

/// Two of three lineup members arrive; the timeout releases them, and the
/// cycle drains back to the arriving phase so the lineup remains usable.
#[test]
fn lineup_timeout_releases_partial_rendezvous() {
    let rt = Runtime::new(Config {
        launch_idle_thread: true,
        ..Config::default()
    })
    .unwrap();
    rt.lineup_init(1, 42, 3, 100);

    let mut joins = Vec::new();
    for _ in 0..2 {
        let rt2 = Arc::clone(&rt);
        joins.push(rt.spawn(2, move || {
            rt2.lineup_start(3, 42);
            rt2.lineup_end(4, 42);
        }));
    }
    for j in joins {
        rt.join(5, j).unwrap();
    }

    let stats = rt.stats_snapshot();
    assert_eq!(stats.lineup_timeouts, 1);
    assert_eq!(stats.lineup_successes, 0);

    // Re-armed: a full rendezvous now succeeds without any timeout.
    rt.lineup_destroy(6, 42);
    rt.lineup_init(7, 43, 2, 100);
    let mut joins = Vec::new();
    for _ in 0..2 {
        let rt2 = Arc::clone(&rt);
        joins.push(rt.spawn(8, move || {
            rt2.lineup_start(9, 43);
            rt2.lineup_end(10, 43);
        }));
    }
    for j in joins {
        rt.join(11, j).unwrap();
    }
    rt.prog_end();

    let stats = rt.stats_snapshot();
    assert_eq!(stats.lineup_successes, 1);
    assert_eq!(stats.lineup_timeouts, 1);
}

/// A sleep is a deadline in turns, not wall time: the idle thread drives
/// the counter past it.
#[test]
fn sleep_advances_logical_time() {
    let rt = Runtime::new(timed_config()).unwrap();
    let before = rt.turn_count();
    rt.sleep(1, Duration::from_millis(1));
    let after = rt.turn_count();
    rt.prog_end();
    assert!(after - before >= 1000, "only {} turns", after - before);
}

/// A thread inside a non-det region runs detached and rejoins cleanly.
#[test]
fn non_det_region_detaches_and_rejoins() {
    let rt = Runtime::new(Config {
        enforce_non_det_annotations: true,
        ..Config::default()
    })
    .unwrap();
    let m = rt.mutex_init(1);
    let hits = Arc::new(AtomicUsize::new(0));

    let (rt2, m2, hits2) = (Arc::clone(&rt), m.clone(), Arc::clone(&hits));
    let t = rt.spawn(2, move || {
        rt2.non_det_start();
        // Native-path synchronization while detached.
        rt2.mutex_lock(3, &m2).unwrap();
        hits2.fetch_add(1, Ordering::SeqCst);
        rt2.mutex_unlock(4, &m2).unwrap();
        rt2.non_det_end();
        // Back under deterministic scheduling.
        rt2.mutex_lock(5, &m2).unwrap();
        hits2.fetch_add(1, Ordering::SeqCst);
        rt2.mutex_unlock(6, &m2).unwrap();
    });
    rt.join(7, t).unwrap();
    rt.prog_end();

    assert_eq!(hits.load(Ordering::SeqCst), 2);
    let stats = rt.stats_snapshot();
    assert_eq!(stats.non_det_regions, 1);
    assert!(stats.nondet_sync_ops >= 2);
}
