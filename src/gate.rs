//! Wait/wake primitives: the exit gate a joiner sleeps on, and the teardown
//! signal posted once a thread's stack is no longer in use.

use crate::error::fatal;
use core::cell::UnsafeCell;
use core::ptr::NonNull;
use core::sync::atomic::AtomicU32;
use core::sync::atomic::Ordering::{Acquire, Release};
use parking_lot::{Condvar, Mutex, RwLock};
use rustix::io;
use rustix::thread::futex;
use std::sync::Arc;

/// What a blocked joiner learns when it is woken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// The thread exited with this value.
    Exited(usize),
    /// The thread was detached while the joiner was waiting.
    Detached,
}

// Values for `JoinContext::gate`.
const PENDING: u32 = 0;
const DECIDED: u32 = 1;
const RELEASED: u32 = 2;

/// A joiner's side of the exit gate.
///
/// This lives on the joiner's stack, and the thread record only holds a
/// pointer to it while the joiner is registered. Keeping the word here
/// rather than in the record means that a joiner never sleeps on memory that
/// the exiting thread might free.
pub(crate) struct JoinContext {
    gate: AtomicU32,
    outcome: UnsafeCell<Option<Outcome>>,
}

impl JoinContext {
    #[inline]
    pub(crate) const fn new() -> Self {
        Self {
            gate: AtomicU32::new(PENDING),
            outcome: UnsafeCell::new(None),
        }
    }

    /// Hand `outcome` to the joiner waiting on `ctx` and wake it.
    ///
    /// # Safety
    ///
    /// `ctx` must have been registered by a joiner that is blocked in
    /// [`wait`](Self::wait), and it must be delivered to at most once.
    pub(crate) unsafe fn deliver(ctx: NonNull<Self>, outcome: Outcome) {
        let ctx = unsafe { ctx.as_ref() };

        // SAFETY: The joiner doesn't read `outcome` until it sees `DECIDED`.
        unsafe { *ctx.outcome.get() = Some(outcome) };
        ctx.gate.store(DECIDED, Release);
        wake(&ctx.gate);

        // After this store the joiner may return and pop `ctx` off its
        // stack, so this is our last access.
        ctx.gate.store(RELEASED, Release);
    }

    /// Block until an outcome has been delivered.
    pub(crate) fn wait(&self) -> Outcome {
        loop {
            match self.gate.load(Acquire) {
                PENDING => match futex::wait(&self.gate, futex::Flags::PRIVATE, PENDING, None) {
                    Ok(()) | Err(io::Errno::INTR) | Err(io::Errno::AGAIN) => continue,
                    Err(e) => fatal("futex wait on the exit gate failed", Some(e)),
                },
                // The waker is between its wake and its final store.
                DECIDED => core::hint::spin_loop(),
                _ => break,
            }
        }

        // SAFETY: `RELEASED` means the waker is done with us, and the store
        // of the outcome happened before it.
        match unsafe { *self.outcome.get() } {
            Some(outcome) => outcome,
            None => fatal("exit gate opened without an outcome", None),
        }
    }
}

/// Wake the waiter on `word`, if any. Having no waiter is not an error.
fn wake(word: &AtomicU32) {
    loop {
        match futex::wake(word, futex::Flags::PRIVATE, 1) {
            Ok(_) => break,
            Err(io::Errno::INTR) => continue,
            Err(e) => fatal("futex wake on the exit gate failed", Some(e)),
        }
    }
}

/// A count of threads whose teardown signal hasn't been posted yet.
#[derive(Default)]
pub(crate) struct Outstanding {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Outstanding {
    pub(crate) fn add(&self) {
        *self.count.lock() += 1;
    }

    pub(crate) fn done(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    /// Forget the threads of the parent, in the child after a `fork`. Only
    /// `kept` teardowns, those of threads that still exist, remain owed.
    ///
    /// # Safety
    ///
    /// Must only be called in the child after a `fork`, before any other
    /// thread has been started.
    pub(crate) unsafe fn reset_after_fork(&self, kept: usize) {
        let mut count = unsafe { unlock_after_fork(&self.count) };
        *count = kept;
    }

    pub(crate) fn wait_idle(&self) {
        let mut count = self.count.lock();
        while *count != 0 {
            self.idle.wait(&mut count);
        }
    }
}

/// Posted by the kernel boundary once a thread has left its stack and the
/// memory handed over in [`Exit`](crate::kernel::Exit) has been released.
///
/// A joiner of a thread running on a caller-provided stack waits for this
/// before returning, so that the caller can free the stack.
pub struct Teardown {
    posted: Mutex<bool>,
    cond: Condvar,
    outstanding: Option<Arc<Outstanding>>,
}

impl Teardown {
    pub(crate) fn new(outstanding: Option<Arc<Outstanding>>) -> Self {
        Self {
            posted: Mutex::new(false),
            cond: Condvar::new(),
            outstanding,
        }
    }

    /// Signal that the thread is completely gone.
    pub fn post(&self) {
        let mut posted = self.posted.lock();
        if *posted {
            return;
        }
        *posted = true;
        self.cond.notify_all();
        drop(posted);

        if let Some(outstanding) = &self.outstanding {
            outstanding.done();
        }
    }

    /// Test whether [`post`](Self::post) has been called.
    pub fn is_posted(&self) -> bool {
        *self.posted.lock()
    }

    pub(crate) fn wait(&self) {
        let mut posted = self.posted.lock();
        while !*posted {
            self.cond.wait(&mut posted);
        }
    }
}

impl core::fmt::Debug for Teardown {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Teardown")
            .field("posted", &self.is_posted())
            .finish()
    }
}

/// Release `lock` in the child after a `fork` if a thread that doesn't exist
/// in the child held it, and then lock it.
///
/// The data behind the lock may have been left half-updated by that thread;
/// the caller is expected to overwrite it.
///
/// # Safety
///
/// Must only be called in the child after a `fork`, while the calling
/// thread is the only thread.
pub(crate) unsafe fn unlock_after_fork<T>(lock: &Mutex<T>) -> parking_lot::MutexGuard<'_, T> {
    if lock.is_locked() {
        // SAFETY: The owner doesn't exist, and we're the only thread.
        unsafe { lock.force_unlock() };
    }
    lock.lock()
}

/// Like [`unlock_after_fork`], for a reader-writer lock, which may have had
/// any number of readers or one writer.
///
/// # Safety
///
/// As for [`unlock_after_fork`].
pub(crate) unsafe fn unlock_rwlock_after_fork<T>(lock: &RwLock<T>) {
    if lock.is_locked_exclusive() {
        // SAFETY: The writer doesn't exist, and we're the only thread.
        unsafe { lock.force_unlock_write() };
    }
    while lock.is_locked() {
        // SAFETY: As above, for each reader.
        unsafe { lock.force_unlock_read() };
    }
}
