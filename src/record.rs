//! The per-thread control block.

use crate::config::StartDescriptor;
use crate::gate::{JoinContext, Teardown, unlock_after_fork};
use crate::kernel::KernelHandle;
use crate::memory::Region;
use core::cell::UnsafeCell;
use core::fmt;
use core::num::NonZeroU64;
use core::ptr::NonNull;
use core::sync::atomic::Ordering::{Acquire, Relaxed, Release, SeqCst};
use core::sync::atomic::{AtomicI32, AtomicU8, AtomicU64, AtomicUsize};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::Arc;

/// A process-unique thread identifier.
///
/// Identifiers are assigned from a monotonically increasing counter when a
/// thread is created, before it starts running, and are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(NonZeroU64);

impl ThreadId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        match NonZeroU64::new(NEXT.fetch_add(1, Relaxed)) {
            Some(id) => Self(id),
            None => crate::error::fatal("thread ids exhausted", None),
        }
    }

    /// Return the numeric value of this identifier.
    #[inline]
    pub fn as_u64(self) -> NonZeroU64 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// The exit gate, as seen from the thread record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExitGate {
    /// The thread hasn't exited.
    Running,
    /// The thread has exited and its exit value awaits a joiner.
    Exited,
    /// The exit value has been consumed or discarded. Nothing may start a
    /// join or a detach on the record anymore.
    Reaped,
}

/// The fields guarded by the record lock.
pub(crate) struct JoinState {
    pub(crate) joinable: bool,
    pub(crate) gate: ExitGate,
    pub(crate) exit_value: usize,
    /// A joiner blocked on the exit gate.
    pub(crate) joiner: Option<NonNull<JoinContext>>,
    /// What is still to be released by whoever reaps the record.
    pub(crate) free: Option<Region>,
}

// Values for `ThreadRecord::race`.
const UNCLAIMED: u8 = 0;
const CLAIMED: u8 = 1;

/// Functions registered with `at_exit`.
pub(crate) type Dtors = SmallVec<[Box<dyn FnOnce()>; 4]>;

/// Data associated with a thread. It lives in the control block at the top
/// of the thread's allocation.
pub(crate) struct ThreadRecord {
    pub(crate) id: ThreadId,
    kernel_handle: AtomicUsize,
    os_tid: AtomicI32,
    pub(crate) stack_bottom: usize,
    pub(crate) stack_top: usize,
    pub(crate) guard_size: usize,
    /// The whole OS allocation. For a thread on a caller-provided stack,
    /// this is only the control block.
    pub(crate) allocation: Region,
    pub(crate) custom_stack: bool,
    pub(crate) is_main: bool,
    pub(crate) start: StartDescriptor,

    pub(crate) state: Mutex<JoinState>,
    race: AtomicU8,
    pins: AtomicUsize,
    pub(crate) teardown: Arc<Teardown>,

    // Support a few dtors before using dynamic allocation.
    dtors: UnsafeCell<Dtors>,
    /// The value passed to `exit`, once the thread has asked to exit.
    exit_requested: UnsafeCell<Option<usize>>,
}

// SAFETY: `dtors` and `exit_requested` are only accessed by the thread the
// record describes, and `JoinState::joiner` is only dereferenced under the
// ownership rules of `JoinContext`.
unsafe impl Send for ThreadRecord {}
unsafe impl Sync for ThreadRecord {}

/// Where a record's memory lives, as computed by the stack allocator.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Placement {
    pub(crate) allocation: Region,
    pub(crate) stack_bottom: usize,
    pub(crate) stack_top: usize,
    pub(crate) guard_size: usize,
    pub(crate) custom_stack: bool,
}

impl ThreadRecord {
    pub(crate) fn new(
        id: ThreadId,
        placement: &Placement,
        joinable: bool,
        start: StartDescriptor,
        is_main: bool,
        teardown: Arc<Teardown>,
    ) -> Self {
        Self {
            id,
            kernel_handle: AtomicUsize::new(0),
            os_tid: AtomicI32::new(0),
            stack_bottom: placement.stack_bottom,
            stack_top: placement.stack_top,
            guard_size: placement.guard_size,
            allocation: placement.allocation,
            custom_stack: placement.custom_stack,
            is_main,
            start,
            state: Mutex::new(JoinState {
                joinable,
                gate: ExitGate::Running,
                exit_value: 0,
                joiner: None,
                free: Some(placement.allocation),
            }),
            race: AtomicU8::new(UNCLAIMED),
            pins: AtomicUsize::new(0),
            teardown,
            dtors: UnsafeCell::new(SmallVec::new_const()),
            exit_requested: UnsafeCell::new(None),
        }
    }

    /// The kernel handle, or `None` if neither the creator nor the thread
    /// itself has published it yet.
    #[inline]
    pub(crate) fn kernel_handle(&self) -> Option<KernelHandle> {
        match self.kernel_handle.load(Acquire) {
            0 => None,
            raw => Some(KernelHandle::from_raw(raw)),
        }
    }

    #[inline]
    pub(crate) fn publish_kernel_handle(&self, handle: KernelHandle) {
        self.kernel_handle.store(handle.as_raw(), Release);
    }

    #[inline]
    pub(crate) fn os_tid(&self) -> Option<rustix::thread::Pid> {
        rustix::thread::Pid::from_raw(self.os_tid.load(Acquire))
    }

    #[inline]
    pub(crate) fn publish_os_tid(&self, tid: rustix::thread::Pid) {
        self.os_tid.store(tid.as_raw_nonzero().get(), Release);
    }

    /// Split the allocation into the part the thread runs on and the
    /// control block part.
    ///
    /// The first part is `None` for a thread on a caller-provided stack or
    /// the adopted main thread, where the allocation is only the control
    /// block.
    pub(crate) fn split(&self) -> (Option<Region>, Option<Region>) {
        let control = self as *const Self as usize;
        self.allocation.split_at(control - self.allocation.addr())
    }

    /// Take part in the ownership race between an exiting thread and its
    /// joiner. Each side calls this exactly once.
    ///
    /// Returns `true` if the caller arrived last and therefore owns the
    /// cleanup. The side that arrived first must not touch the record after
    /// this returns.
    #[inline]
    pub(crate) fn resolve_race(&self) -> bool {
        self.race
            .compare_exchange(UNCLAIMED, CLAIMED, SeqCst, SeqCst)
            .is_err()
    }

    #[inline]
    pub(crate) fn pin(&self) {
        self.pins.fetch_add(1, Acquire);
    }

    #[inline]
    pub(crate) fn unpin(&self) {
        self.pins.fetch_sub(1, Release);
    }

    /// Wait until nothing that looked the record up in the registry is
    /// still using it. The record must already be off the registry.
    ///
    /// Pins are held for the length of a lookup, or by a joiner that has
    /// already been woken, and never across a kernel call, so this only
    /// spins briefly.
    pub(crate) fn wait_unpinned(&self) {
        while self.pins.load(Acquire) != 0 {
            rustix::thread::sched_yield();
        }
    }

    /// Register a function to run when the thread exits.
    ///
    /// # Safety
    ///
    /// Must be called on the thread the record describes.
    #[inline]
    pub(crate) unsafe fn push_dtor(&self, func: Box<dyn FnOnce()>) {
        unsafe { (*self.dtors.get()).push(func) }
    }

    /// Remove the most recently registered exit function.
    ///
    /// # Safety
    ///
    /// Must be called on the thread the record describes, and the returned
    /// function must be called without a borrow of the list outstanding.
    #[inline]
    pub(crate) unsafe fn pop_dtor(&self) -> Option<Box<dyn FnOnce()>> {
        unsafe { (*self.dtors.get()).pop() }
    }

    /// Reset the record of the thread that called `fork`, in the child. The
    /// other threads that were using it in the parent don't exist there.
    ///
    /// # Safety
    ///
    /// Must only be called in the child after a `fork`, while the calling
    /// thread is the only thread.
    pub(crate) unsafe fn reset_after_fork(&self) {
        let mut state = unsafe { unlock_after_fork(&self.state) };
        state.joiner = None;
        drop(state);
        self.pins.store(0, Release);
    }

    /// Record that the thread asked to exit with `value`. The first request
    /// wins.
    ///
    /// # Safety
    ///
    /// Must be called on the thread the record describes.
    #[inline]
    pub(crate) unsafe fn request_exit(&self, value: usize) {
        let requested = unsafe { &mut *self.exit_requested.get() };
        requested.get_or_insert(value);
    }

    /// The value the thread asked to exit with, if it called `exit`.
    ///
    /// # Safety
    ///
    /// Must be called on the thread the record describes.
    #[inline]
    pub(crate) unsafe fn exit_requested(&self) -> Option<usize> {
        unsafe { *self.exit_requested.get() }
    }
}
