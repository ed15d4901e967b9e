//! Joining, including joins racing with exit and with each other.

mod utils;

use spindle::{Error, ThreadConfig};
use std::sync::mpsc::channel;
use std::sync::{Arc, Barrier};
use utils::Fixture;

#[test]
fn join_many_in_any_order() {
    let f = Fixture::new();
    let pages = f.memory.live_pages();

    let threads: Vec<_> = (0..16)
        .map(|i| {
            f.runtime
                .create(&ThreadConfig::new(), move |arg| arg * 100 + i, i)
                .unwrap()
        })
        .collect();

    // Join in reverse order; some will have exited already and some won't.
    let mut values: Vec<_> = threads
        .iter()
        .rev()
        .map(|&thread| f.runtime.join(thread).unwrap())
        .collect();
    values.sort_unstable();
    similar_asserts::assert_eq!(values, (0..16).map(|i| i * 101).collect::<Vec<_>>());

    // Each value is delivered once.
    for &thread in &threads {
        assert_eq!(f.runtime.join(thread), Err(Error::HandleNotFound));
    }

    f.runtime.quiesce();
    assert_eq!(f.memory.live_pages(), pages);
    assert_eq!(f.memory.double_frees(), 0);
}

#[test]
fn join_after_exit_does_not_block() {
    let f = Fixture::new();
    let pages = f.memory.live_pages();

    let thread = f.runtime.create(&ThreadConfig::new(), |_| 17, 0).unwrap();

    // Wait until the thread is gone and its stack is released. The record
    // stays for us to reap.
    f.runtime.quiesce();
    assert!(f.runtime.is_joinable(thread));
    assert_eq!(f.runtime.live(), 1);
    assert_eq!(f.runtime.count(), 2);
    assert_eq!(
        f.memory.live_pages(),
        pages + 1,
        "only the control block remains"
    );

    assert_eq!(f.runtime.join(thread), Ok(17));
    assert_eq!(f.runtime.count(), 1);
    assert_eq!(f.memory.live_pages(), pages);
    assert_eq!(f.memory.double_frees(), 0);
}

#[test]
fn join_before_exit_blocks() {
    let f = Fixture::new();
    let pages = f.memory.live_pages();
    let (release, wait) = channel::<usize>();

    let thread = f
        .runtime
        .create(&ThreadConfig::new(), move |_| wait.recv().unwrap(), 0)
        .unwrap();

    let runtime = f.runtime.clone();
    let joiner = std::thread::spawn(move || runtime.join(thread));

    // Give the joiner a chance to block on the exit gate.
    std::thread::sleep(std::time::Duration::from_millis(20));
    release.send(99).unwrap();

    assert_eq!(joiner.join().unwrap(), Ok(99));
    f.runtime.quiesce();
    assert_eq!(f.memory.live_pages(), pages);
    assert_eq!(f.memory.double_frees(), 0);
}

#[test]
fn joiner_and_exit_race() {
    // Start the joiner and the exit at the same moment, many times, so that
    // both sides of the ownership race get exercised.
    let f = Fixture::new();
    let pages = f.memory.live_pages();

    for i in 0..200 {
        let barrier = Arc::new(Barrier::new(2));
        let thread_barrier = barrier.clone();
        let thread = f
            .runtime
            .create(
                &ThreadConfig::new(),
                move |arg| {
                    thread_barrier.wait();
                    arg
                },
                i,
            )
            .unwrap();

        barrier.wait();
        assert_eq!(f.runtime.join(thread), Ok(i));
    }

    f.runtime.quiesce();
    assert_eq!(f.memory.live_pages(), pages);
    assert_eq!(f.memory.double_frees(), 0);
}

#[test]
fn concurrent_joins_deliver_once() {
    let f = Fixture::new();

    for round in 0..20 {
        let (release, wait) = channel::<()>();
        let thread = f
            .runtime
            .create(
                &ThreadConfig::new(),
                move |arg| {
                    wait.recv().unwrap();
                    arg
                },
                round,
            )
            .unwrap();

        let joiners: Vec<_> = (0..2)
            .map(|_| {
                let runtime = f.runtime.clone();
                std::thread::spawn(move || runtime.join(thread))
            })
            .collect();

        release.send(()).unwrap();
        let results: Vec<_> = joiners.into_iter().map(|j| j.join().unwrap()).collect();

        let ok: Vec<_> = results.iter().filter_map(|r| r.ok()).collect();
        assert_eq!(ok, vec![round], "{results:?}");
        for result in &results {
            if let Err(e) = result {
                assert!(
                    matches!(e, Error::InvalidArgument | Error::HandleNotFound),
                    "{e:?}"
                );
            }
        }
    }

    f.runtime.quiesce();
    assert_eq!(f.memory.double_frees(), 0);
}

#[test]
fn join_self_would_deadlock() {
    let f = Fixture::new();

    // On the main thread.
    let main = f.runtime.current().unwrap();
    assert_eq!(f.runtime.join(main), Err(Error::WouldDeadlock));

    // On a created thread.
    let runtime = f.runtime.clone();
    let thread = f
        .runtime
        .create(
            &ThreadConfig::new(),
            move |_| {
                let me = runtime.current().unwrap();
                usize::from(runtime.join(me) == Err(Error::WouldDeadlock))
            },
            0,
        )
        .unwrap();
    assert_eq!(f.runtime.join(thread), Ok(1));
}

#[test]
fn join_custom_stack_waits_for_teardown() {
    use spindle::memory::{MmapMemory, VirtualMemory};

    let f = Fixture::new();
    let pages = f.memory.live_pages();
    let size = 64 * f.runtime.page_size();
    let stack = MmapMemory.reserve(size).unwrap();
    unsafe { MmapMemory.commit(stack).unwrap() };

    let config = unsafe { ThreadConfig::new().stack(stack.base(), size) };
    let thread = f
        .runtime
        .create(
            &config,
            |_| {
                let local = 0_u8;
                std::hint::black_box(&local) as *const u8 as usize
            },
            0,
        )
        .unwrap();

    let info = f.runtime.stack(thread).unwrap();
    assert!(info.custom);
    assert_eq!(info.guard_size, 0);
    assert_eq!(info.bottom, stack.addr());
    assert_eq!(info.size(), size);

    let local = f.runtime.join(thread).unwrap();
    assert!(stack.contains(local), "{local:#x} not in {stack:?}");

    // The kernel is done with the stack once `join` returns.
    assert_eq!(f.memory.live_pages(), pages);
    unsafe { MmapMemory.release(stack).unwrap() };
}
