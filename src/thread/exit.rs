//! Thread termination.
//!
//! An exiting thread decides, under its record lock, which of three cases
//! it is in:
//!
//!  - A joiner is blocked on the exit gate. The exit value goes straight to
//!    the joiner, the record comes off the registry, and the joiner and the
//!    exiting thread race to decide which of them frees the record.
//!  - The thread is joinable but nobody is waiting. The record stays on the
//!    registry for a future `join` or `detach` to reap.
//!  - The thread is detached. It reaps itself.
//!
//! In every case the part of the allocation the thread is running on is
//! handed to the kernel, which releases it once the thread is off it.

use super::{Event, ExitRequest, ExitValue, Thread, set_current};
use crate::error::fatal;
use crate::gate::{JoinContext, Outcome};
use crate::kernel::Exit;
use crate::memory::Region;
use crate::record::{ExitGate, ThreadRecord};
use crate::runtime::Runtime;
use core::ptr::NonNull;

enum Disposition {
    Race(NonNull<JoinContext>),
    KeepRecord,
    Detached,
}

impl Runtime {
    /// Exit the calling thread with `value` as its exit value.
    ///
    /// On a thread created by this runtime, this unwinds the thread's stack,
    /// running destructors, up to its entry function, and the thread exits
    /// as if the entry function had returned `value`. If the entry function
    /// catches the unwinding, the thread still exits with `value` once the
    /// entry function returns.
    ///
    /// On the adopted main thread, this runs the exit protocol and then
    /// parks the thread forever; the process keeps running until the last
    /// live thread exits.
    pub fn exit(&self, value: ExitValue) -> ! {
        let Some(thread) = self.current() else {
            fatal("exit called on a thread the runtime doesn't manage", None)
        };

        // SAFETY: `thread` is the calling thread.
        if unsafe { thread.record().is_main } {
            self.terminate(thread, value);
            loop {
                std::thread::park();
            }
        }

        // Remember the value, in case something between here and the entry
        // function catches the unwind.
        // SAFETY: `thread` is the calling thread.
        unsafe { thread.record().request_exit(value) };
        std::panic::resume_unwind(Box::new(ExitRequest(value)))
    }

    /// Run the exit protocol for the calling thread. When this returns, the
    /// thread must not touch its record or anything derived from it.
    pub(crate) fn terminate(&self, thread: Thread, value: ExitValue) {
        // SAFETY: We're on the thread the record describes.
        let record = unsafe { thread.record() };

        #[cfg(feature = "log")]
        log::trace!(
            target: "spindle::thread",
            "Thread[{}] returned {:#x}",
            thread.id(),
            value
        );

        // Call functions registered with `at_exit`.
        call_dtors(thread, record);
        self.fire(Event::Terminate, thread);
        if record.is_main {
            *self.main.lock() = None;
        }

        // Read out everything we need from the record before we give up
        // the right to touch it.
        let teardown = record.teardown.clone();
        let handle = record.kernel_handle();
        let is_main = record.is_main;
        let allocation = record.allocation;
        let (running_on, control) = record.split();

        let mut state = record.state.lock();
        state.exit_value = value;
        state.gate = ExitGate::Exited;
        let last = self.registry.thread_exited();
        let disposition = if let Some(joiner) = state.joiner.take() {
            state.gate = ExitGate::Reaped;
            state.free = control;
            self.registry.remove(thread);
            Disposition::Race(joiner)
        } else if state.joinable {
            state.free = control;
            Disposition::KeepRecord
        } else {
            state.gate = ExitGate::Reaped;
            state.free = None;
            self.registry.remove(thread);
            Disposition::Detached
        };
        drop(state);

        set_current(None);

        // The process ends when its last live thread does.
        if last {
            self.kernel.exit_process(0);
        }

        let release = match disposition {
            Disposition::Race(joiner) => {
                #[cfg(feature = "log")]
                log::trace!(
                    target: "spindle::thread",
                    "Thread[{}] exiting with a joiner present",
                    thread.id()
                );

                // SAFETY: The joiner registered `joiner` under the record
                // lock and is blocked until we deliver.
                unsafe { JoinContext::deliver(joiner, Outcome::Exited(value)) };

                if record.resolve_race() {
                    // The joiner got there first, so we free the record.
                    // SAFETY: The record is off the registry, and the joiner
                    // has committed to not touching it.
                    unsafe { self.destroy_record(thread) };
                    Some(allocation)
                } else {
                    // The joiner frees the record.
                    running_on
                }
            }
            Disposition::KeepRecord => {
                #[cfg(feature = "log")]
                log::trace!(
                    target: "spindle::thread",
                    "Thread[{}] exiting as joinable",
                    thread.id()
                );

                // The record now belongs to whoever joins or detaches it.
                running_on
            }
            Disposition::Detached => {
                #[cfg(feature = "log")]
                log::trace!(
                    target: "spindle::thread",
                    "Thread[{}] exiting as detached",
                    thread.id()
                );

                // SAFETY: The record is off the registry, and no one else
                // can reap a detached thread.
                unsafe { self.destroy_record(thread) };
                Some(allocation)
            }
        };

        if is_main {
            // The main thread isn't running on anything we allocated, so we
            // can release its memory right away.
            if let Some(region) = release {
                // SAFETY: Nothing refers to the region anymore.
                unsafe { self.allocator.release(region) };
            }
            teardown.post();
            return;
        }

        let handle = match handle {
            Some(handle) => handle,
            None => self.kernel.current_handle(),
        };
        self.kernel.terminate_thread(Exit {
            release,
            handle,
            teardown,
        });
    }

    /// Wait for pins to drain, then run the record's destructor. Its memory
    /// is released separately.
    ///
    /// # Safety
    ///
    /// The record must be off the registry, and the caller must own its
    /// cleanup.
    pub(crate) unsafe fn destroy_record(&self, thread: Thread) {
        unsafe {
            thread.record().wait_unpinned();

            #[cfg(feature = "log")]
            log::trace!(
                target: "spindle::thread",
                "Thread[{}] memory being freed",
                thread.id()
            );

            self.allocator.destroy(thread.record_ptr());
        }
        self.fire(Event::Destroy, thread);
    }

    /// Free a record that exited and has been taken off the registry by a
    /// joiner or detacher, along with what remains of its allocation.
    ///
    /// # Safety
    ///
    /// The caller must own the cleanup, and must not hold a pin on the
    /// record.
    pub(crate) unsafe fn reap(&self, thread: Thread, free: Option<Region>) {
        unsafe {
            self.destroy_record(thread);
            if let Some(region) = free {
                self.allocator.release(region);
            }
        }
    }
}

/// Call the functions registered with `at_exit`, most recent first.
/// Functions may register further functions, which also run.
fn call_dtors(thread: Thread, record: &ThreadRecord) {
    // SAFETY: We're on the thread the record describes.
    while let Some(func) = unsafe { record.pop_dtor() } {
        #[cfg(feature = "log")]
        log::trace!(
            target: "spindle::thread",
            "Thread[{}] calling `at_exit`-registered function",
            thread.id()
        );
        #[cfg(not(feature = "log"))]
        let _ = thread;

        func();
    }
}
