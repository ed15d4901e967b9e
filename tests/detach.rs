//! Detaching, and detached threads reaping themselves.

mod utils;

use spindle::{DetachState, Error, ThreadConfig};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::mpsc::channel;
use utils::Fixture;

#[test]
fn detach_before_exit() {
    let f = Fixture::new();
    let pages = f.memory.live_pages();
    let (release, wait) = channel::<()>();

    let thread = f
        .runtime
        .create(
            &ThreadConfig::new(),
            move |_| {
                wait.recv().unwrap();
                0
            },
            0,
        )
        .unwrap();

    f.runtime.detach(thread).unwrap();
    assert!(!f.runtime.is_joinable(thread));
    assert_eq!(f.runtime.join(thread), Err(Error::InvalidArgument));
    assert_eq!(f.runtime.detach(thread), Err(Error::InvalidArgument));

    release.send(()).unwrap();
    f.runtime.quiesce();

    // It reaped itself.
    assert_eq!(f.runtime.join(thread), Err(Error::HandleNotFound));
    assert_eq!(f.runtime.detach(thread), Err(Error::HandleNotFound));
    assert_eq!(f.runtime.count(), 1);
    assert_eq!(f.memory.live_pages(), pages);
    assert_eq!(f.memory.double_frees(), 0);
}

#[test]
fn detach_after_exit_reaps() {
    let f = Fixture::new();
    let pages = f.memory.live_pages();

    let thread = f.runtime.create(&ThreadConfig::new(), |_| 3, 0).unwrap();
    f.runtime.quiesce();
    assert_eq!(f.runtime.count(), 2);

    f.runtime.detach(thread).unwrap();
    assert_eq!(f.runtime.count(), 1);
    assert_eq!(f.runtime.join(thread), Err(Error::HandleNotFound));
    assert_eq!(f.memory.live_pages(), pages);
    assert_eq!(f.memory.double_frees(), 0);
}

#[test]
fn created_detached() {
    let f = Fixture::new();
    let pages = f.memory.live_pages();
    let (release, wait) = channel::<()>();

    let config = ThreadConfig::new().detach_state(DetachState::Detached);
    let thread = f
        .runtime
        .create(
            &config,
            move |_| {
                wait.recv().unwrap();
                0
            },
            0,
        )
        .unwrap();
    assert!(!f.runtime.is_joinable(thread));
    assert_eq!(f.runtime.join(thread), Err(Error::InvalidArgument));

    release.send(()).unwrap();
    f.runtime.quiesce();
    assert_eq!(f.runtime.count(), 1);
    assert_eq!(f.memory.live_pages(), pages);
}

#[test]
fn detach_wakes_a_blocked_joiner() {
    let f = Fixture::new();
    let (release, wait) = channel::<()>();

    let thread = f
        .runtime
        .create(
            &ThreadConfig::new(),
            move |_| {
                wait.recv().unwrap();
                0
            },
            0,
        )
        .unwrap();

    let runtime = f.runtime.clone();
    let joiner = std::thread::spawn(move || runtime.join(thread));

    // Give the joiner time to block. If it hasn't yet, its join is refused
    // up front instead, with the same error.
    std::thread::sleep(std::time::Duration::from_millis(20));
    f.runtime.detach(thread).unwrap();
    assert_eq!(joiner.join().unwrap(), Err(Error::InvalidArgument));

    release.send(()).unwrap();
    f.runtime.quiesce();
    assert_eq!(f.runtime.count(), 1);
    assert_eq!(f.memory.double_frees(), 0);
}

#[test]
fn join_and_detach_race() {
    let f = Fixture::new();
    let pages = f.memory.live_pages();

    for i in 0..100 {
        let thread = f.runtime.create(&ThreadConfig::new(), move |_| i, 0).unwrap();

        let runtime = f.runtime.clone();
        let detacher = std::thread::spawn(move || runtime.detach(thread));
        let joined = f.runtime.join(thread);
        let detached = detacher.join().unwrap();

        match (joined, detached) {
            // The join won, so the detach found the thread gone or reaped.
            (Ok(value), Err(e)) => {
                assert_eq!(value, i);
                assert!(
                    matches!(e, Error::InvalidArgument | Error::HandleNotFound),
                    "{e:?}"
                );
            }
            (Err(Error::InvalidArgument | Error::HandleNotFound), Ok(())) => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    f.runtime.quiesce();
    assert_eq!(f.runtime.count(), 1);
    assert_eq!(f.memory.live_pages(), pages);
    assert_eq!(f.memory.double_frees(), 0);
}

#[test]
fn many_detached_threads() {
    let f = Fixture::new();
    let count = f.runtime.count();
    let pages = f.memory.live_pages();

    let config = ThreadConfig::new().detached();
    for i in 0..1000 {
        f.runtime
            .create(&config, move |_| std::hint::black_box(i), 0)
            .unwrap();
    }

    f.runtime.quiesce();
    assert_eq!(f.runtime.count(), count);
    assert_eq!(f.runtime.live(), 1);
    assert_eq!(f.memory.live_pages(), pages);
    assert_eq!(f.memory.double_frees(), 0);
    assert_eq!(f.kernel.terminates(), 1000);
}

#[test]
fn detached_threads_exit_while_being_looked_up() {
    let f = Fixture::new();
    let pages = f.memory.live_pages();

    // Pin whatever is on the registry, over and over, while detached
    // threads reap themselves out from under the lookups.
    let stop = Arc::new(AtomicBool::new(false));
    let looker = {
        let runtime = f.runtime.clone();
        let stop = stop.clone();
        std::thread::spawn(move || {
            while !stop.load(Relaxed) {
                for thread in runtime.threads() {
                    let _ = runtime.os_id(thread);
                    let _ = runtime.stack(thread);
                }
            }
        })
    };

    let config = ThreadConfig::new().detached();
    for _ in 0..500 {
        f.runtime.create(&config, |_| 0, 0).unwrap();
    }
    f.runtime.quiesce();
    stop.store(true, Relaxed);
    looker.join().unwrap();

    assert_eq!(f.runtime.live(), 1);
    assert_eq!(f.runtime.count(), 1);
    assert_eq!(f.memory.live_pages(), pages);
    assert_eq!(f.memory.double_frees(), 0);
}
