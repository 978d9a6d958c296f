// This test uses getrusage, so can only be run on Unix.
extern crate admission_meter;
extern crate libc;

use admission_meter::store::Fate;
use admission_meter::{CounterStore, LockFreeQueue};
use std::sync::Arc;
use std::thread;

fn resident_memsize() -> i64 {
    let mut out: libc::rusage = unsafe { std::mem::zeroed() };
    assert!(unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut out) } == 0);
    out.ru_maxrss
}

const LEAK_TOLERANCE: i64 = 1024 * 1024 * 10;

fn check_for_leaks(n_iter: usize, usage_before: i64) {
    let usage_after = resident_memsize();
    assert!(
        usage_after <= usage_before + LEAK_TOLERANCE,
        "Plausible memory leak!\nAfter {} iterations, usage before: {}, usage after: {}",
        n_iter,
        usage_before,
        usage_after
    );
}

#[test]
fn memleak_queue() {
    const N_ITER: usize = 500_000;
    let queue = LockFreeQueue::new();
    let usage_before = resident_memsize();

    for i in 0..N_ITER {
        queue.push(format!("10.0.{}.{}", i % 256, i % 7));
        drop(queue.pop());
    }
    check_for_leaks(N_ITER, usage_before);
}

#[test]
fn memleak_queue_threaded() {
    const N_ITER: usize = 5_000;
    let queue = Arc::new(LockFreeQueue::new());
    let usage_before = resident_memsize();

    for i in 0..N_ITER {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            queue.push(vec![i; 16]);
            drop(queue.pop());
        })
        .join()
        .unwrap();
    }
    check_for_leaks(N_ITER, usage_before);
}

#[test]
fn memleak_counter_churn() {
    const N_ITER: usize = 500_000;
    let store = CounterStore::new();
    let usage_before = resident_memsize();

    for i in 0..N_ITER {
        let key = format!("k{}", i);
        store.update(&key, |state| (state.increment(), Fate::Keep));
        store.update(&key, |state| (state.decrement(), Fate::Remove));
        if i % 10_000 == 0 {
            store.garbage_collect();
        }
    }
    assert!(store.is_empty());
    check_for_leaks(N_ITER, usage_before);
}
