/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Boundary cases for the turn protocol.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use detturn::Config;
use detturn::DetTid;
use detturn::Runtime;
use nix::errno::Errno;

/// A single-threaded program sees the trivial turn sequence: one increment
/// per wrapped operation.
#[test]
fn single_thread_trivial_turn_sequence() {
    let rt = Runtime::new(Config::default()).unwrap();
    let mut last = rt.turn_count();
    for _ in 0..5 {
        rt.sched_yield(1);
        let now = rt.turn_count();
        assert_eq!(now - last, 1);
        last = now;
    }
    rt.prog_end();
}

/// Mass spawn: ids are dense in spawn order and FIFO joins all succeed.
#[test]
fn thousand_spawns_join_fifo() {
    const N: i32 = 1000;
    let rt = Runtime::new(Config::default()).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));

    let mut joins = Vec::new();
    for _ in 0..N {
        let counter2 = Arc::clone(&counter);
        joins.push(rt.spawn(1, move || {
            counter2.fetch_add(1, Ordering::SeqCst);
        }));
    }
    for (i, th) in joins.into_iter().enumerate() {
        assert_eq!(th.tid(), DetTid::from_raw(i as i32 + 1));
        rt.join(2, th).unwrap();
    }
    rt.prog_end();
    assert_eq!(counter.load(Ordering::SeqCst), N as usize);
}

/// A recursive lock attempt is not supported; the native behavior (busy)
/// surfaces through trylock.
#[test]
fn recursive_trylock_reports_busy() {
    let rt = Runtime::new(Config::default()).unwrap();
    let m = rt.mutex_init(1);
    rt.mutex_lock(2, &m).unwrap();
    assert_eq!(rt.mutex_trylock(3, &m), Err(Errno::EBUSY));
    rt.mutex_unlock(4, &m).unwrap();
    rt.prog_end();
}

/// With a count of one, every barrier wait is immediately serial.
#[test]
fn barrier_of_one_is_always_serial() {
    let rt = Runtime::new(Config::default()).unwrap();
    let b = rt.barrier_init(1, 1).unwrap();
    for _ in 0..3 {
        assert!(rt.barrier_wait(2, &b).unwrap());
    }
    rt.barrier_destroy(3, b).unwrap();
    rt.prog_end();
}

/// A zero-count barrier is rejected at init.
#[test]
fn barrier_of_zero_is_invalid() {
    let rt = Runtime::new(Config::default()).unwrap();
    assert_eq!(rt.barrier_init(1, 0).err(), Some(Errno::EINVAL));
    rt.prog_end();
}

/// A zero-count lineup is rejected at init.
#[test]
#[should_panic]
fn lineup_of_zero_is_rejected() {
    let rt = Runtime::new(Config::default()).unwrap();
    rt.lineup_init(1, 7, 0, 100);
}

/// Reusing a live lineup id is fatal misuse.
#[test]
#[should_panic]
fn lineup_id_reuse_is_rejected() {
    let rt = Runtime::new(Config::default()).unwrap();
    rt.lineup_init(1, 7, 2, 100);
    rt.lineup_init(2, 7, 2, 100);
}

/// A circular wait among application threads is a genuine deadlock.  With
/// every waiter indefinite and nothing external pending, the scheduler's
/// escape must fire even though the idle thread is parked, and the promoted
/// lock attempt aborts loudly instead of the process hanging while the idle
/// thread spins turns forever.
#[test]
#[should_panic(expected = "deadlock: no runnable thread can release mutex")]
fn ab_ba_deadlock_aborts_instead_of_hanging() {
    let rt = Runtime::new(Config {
        launch_idle_thread: true,
        ..Config::default()
    })
    .unwrap();
    let m1 = rt.mutex_init(1);
    let m2 = rt.mutex_init(2);
    let s = rt.sem_init(3, 0);

    rt.mutex_lock(4, &m1).unwrap();

    let (rt2, m1b, m2b, s2) = (Arc::clone(&rt), m1.clone(), m2.clone(), s.clone());
    let _b = rt.spawn(5, move || {
        rt2.mutex_lock(6, &m2b).unwrap();
        rt2.sem_post(7, &s2).unwrap();
        // Held by the initial thread; this wait can never be signaled.
        rt2.mutex_lock(8, &m1b).unwrap();
    });

    // Once the semaphore is posted both hold orders are fixed: we hold m1
    // and want m2, the child holds m2 and wants m1.
    rt.sem_wait(9, &s).unwrap();
    rt.mutex_lock(10, &m2).unwrap();
}

/// Destroying a barrier mid-cycle reports EBUSY and keeps the barrier.
#[test]
fn barrier_destroy_while_busy() {
    let rt = Runtime::new(Config {
        launch_idle_thread: true,
        nanosec_per_turn: Some(1000),
        ..Config::default()
    })
    .unwrap();
    let b = rt.barrier_init(1, 2).unwrap();

    let (rt2, b2) = (Arc::clone(&rt), b.clone());
    let t = rt.spawn(2, move || {
        let _ = rt2.barrier_wait(3, &b2);
    });

    // Long enough in logical time for the child to arrive and park.
    rt.sleep(4, std::time::Duration::from_millis(1));
    assert_eq!(rt.barrier_destroy(5, b.clone()), Err(Errno::EBUSY));

    // Completing the cycle releases the arriver, after which destroy works.
    let serial = rt.barrier_wait(6, &b).unwrap();
    assert!(serial);
    rt.join(7, t).unwrap();
    rt.barrier_destroy(8, b).unwrap();
    rt.prog_end();
}
