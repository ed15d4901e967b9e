//! The boundary between the thread lifecycle and whatever actually runs
//! threads.

mod pthread;

pub use pthread::PthreadKernel;

use crate::config::StartDescriptor;
use crate::gate::Teardown;
use crate::memory::Region;
use core::fmt;
use core::ptr::NonNull;
use rustix::io;
use std::sync::Arc;

/// An opaque handle naming a kernel-level thread.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelHandle(usize);

impl KernelHandle {
    /// Convert to `Self` from a raw value. Zero is reserved to mean "not
    /// known yet" and must not be used.
    #[inline]
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// Convert to a raw value from a `Self`.
    #[inline]
    pub const fn as_raw(self) -> usize {
        self.0
    }
}

impl fmt::Debug for KernelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KernelHandle({:#x})", self.0)
    }
}

/// The function a new thread runs.
pub type Body = Box<dyn FnOnce() + Send + 'static>;

/// Everything the kernel needs to start a thread.
pub struct Launch {
    /// The memory the thread runs on, between the guard and the control
    /// block, or the caller-provided stack.
    pub stack: Region,
    /// The thread's control block.
    pub control_block: NonNull<u8>,
    /// How to start the thread, passed through uninterpreted.
    pub start: StartDescriptor,
    /// What to run. When it returns, the thread has already called
    /// [`Kernel::terminate_thread`], and the kernel should end the thread.
    pub body: Body,
}

// SAFETY: `control_block` is only a description of where the record lives.
unsafe impl Send for Launch {}

impl fmt::Debug for Launch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Launch")
            .field("stack", &self.stack)
            .field("control_block", &self.control_block)
            .field("start", &self.start)
            .finish_non_exhaustive()
    }
}

/// A thread's final request to the kernel.
#[derive(Debug)]
pub struct Exit {
    /// Memory to release once the thread is no longer running on it.
    pub release: Option<Region>,
    /// The exiting thread.
    pub handle: KernelHandle,
    /// Posted after `release` has been released and the thread is gone.
    pub teardown: Arc<Teardown>,
}

/// Starts and ends kernel-level threads.
///
/// The production implementation is [`PthreadKernel`].
pub trait Kernel: Send + Sync {
    /// Start a thread running `launch.body` on `launch.stack`.
    ///
    /// This is called at most once per thread, and never retried. On
    /// failure, `launch.body` must be dropped without being run.
    fn create_thread(&self, launch: Launch) -> io::Result<KernelHandle>;

    /// Called exactly once by every exiting thread, as the last thing it
    /// does before its body returns.
    ///
    /// The implementation must release `exit.release` only after the thread
    /// has stopped running on it, and then post `exit.teardown`.
    fn terminate_thread(&self, exit: Exit);

    /// Return the handle of the calling thread.
    fn current_handle(&self) -> KernelHandle;

    /// End the process with `status`. Called when the last live thread
    /// exits.
    fn exit_process(&self, status: i32);

    /// Re-establish any helper state in the child process after a `fork`.
    ///
    /// # Safety
    ///
    /// Must only be called in the child after a `fork`, while the calling
    /// thread is the only thread.
    unsafe fn after_fork_child(&self) {}
}
