//! Thread handles, creation, exit, join, and detach.

mod create;
mod exit;
mod join;

use crate::record::{ThreadId, ThreadRecord};
use core::cell::Cell;
use core::fmt;
use core::ptr::NonNull;
use std::sync::Arc;

/// An opaque handle to a thread.
///
/// A `Thread` doesn't keep its thread alive, and doesn't detach or join on
/// drop. Every operation that takes one first checks that it still refers
/// to a live record, so a stale handle is reported as
/// [`Error::HandleNotFound`](crate::Error::HandleNotFound) rather than
/// touching freed memory.
#[derive(Copy, Clone)]
pub struct Thread {
    record: NonNull<ThreadRecord>,
    id: ThreadId,
}

// SAFETY: A `Thread` is only dereferenced after validating it against the
// registry, or by the thread it describes.
unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl Thread {
    #[inline]
    pub(crate) fn new(record: NonNull<ThreadRecord>, id: ThreadId) -> Self {
        Self { record, id }
    }

    /// Return the process-unique identifier of this thread.
    #[inline]
    pub fn id(self) -> ThreadId {
        self.id
    }

    /// Return the address of the thread's control block.
    #[inline]
    pub fn to_raw(self) -> *mut core::ffi::c_void {
        self.record.as_ptr().cast()
    }

    /// # Safety
    ///
    /// The record must not have been freed, and the returned reference must
    /// not outlive it.
    #[inline]
    pub(crate) unsafe fn record<'a>(self) -> &'a ThreadRecord {
        unsafe { self.record.as_ref() }
    }

    #[inline]
    pub(crate) fn record_ptr(self) -> NonNull<ThreadRecord> {
        self.record
    }
}

impl PartialEq for Thread {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.record == other.record
    }
}

impl Eq for Thread {}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Thread[{}]", self.id)
    }
}

/// The memory a thread runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackInfo {
    /// The lowest address of the stack, just above the guard.
    pub bottom: usize,
    /// One past the highest address of the stack. The control block starts
    /// here, unless the stack was provided by the caller.
    pub top: usize,
    /// The size of the inaccessible region below `bottom`. Zero for a
    /// caller-provided stack.
    pub guard_size: usize,
    /// The lowest address of the allocation backing the thread.
    pub allocation_base: usize,
    /// Whether the stack was provided by the caller.
    pub custom: bool,
}

impl StackInfo {
    /// The size of the stack in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.top - self.bottom
    }
}

/// A point in a thread's lifecycle, reported to an installed [`Hook`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The thread's record has been registered, and the kernel is about to
    /// be asked to start it.
    Create,
    /// The thread is running, and is about to call its entry function.
    Start,
    /// The thread has finished running its exit functions.
    Terminate,
    /// The thread's record has been freed. The handle no longer resolves.
    Destroy,
}

/// A function called at each [`Event`] in every thread's lifecycle.
pub type Hook = Arc<dyn Fn(Event, Thread) + Send + Sync>;

/// The value a thread's entry function returns, and `join` produces.
pub type ExitValue = usize;

thread_local! {
    // The runtime id and handle of the current thread, for threads created
    // by a runtime. Adopted main threads are recognized by their kernel
    // handle instead.
    static CURRENT: Cell<Option<(u64, Thread)>> = const { Cell::new(None) };
}

pub(crate) fn current_in(runtime: u64) -> Option<Thread> {
    match CURRENT.get() {
        Some((id, thread)) if id == runtime => Some(thread),
        _ => None,
    }
}

pub(crate) fn set_current(current: Option<(u64, Thread)>) {
    CURRENT.set(current);
}

/// The panic payload `exit` unwinds with, caught at the bottom of the
/// thread's stack.
pub(crate) struct ExitRequest(pub(crate) ExitValue);

/// Yield the current thread, encouraging other threads to run.
#[inline]
pub fn yield_current() {
    rustix::thread::sched_yield()
}
