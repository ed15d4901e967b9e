#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod config;
mod error;
mod gate;
pub mod kernel;
mod log;
pub mod memory;
mod record;
mod registry;
mod runtime;
pub mod stack;
mod thread;

pub use config::{
    DetachState, MAX_IMPORTANCE, QosClass, SchedHint, SchedPolicy, StartDescriptor, StartFlags,
    ThreadConfig, default_guard_size, default_stack_size, min_stack_size,
};
pub use error::{Error, Result};
pub use gate::Teardown;
pub use record::ThreadId;
pub use runtime::{Runtime, global, init, reinit_after_fork};
pub use thread::{Event, ExitValue, Hook, StackInfo, Thread, yield_current};

use kernel::KernelHandle;

/// Create a thread on the process-wide runtime which calls `entry(arg)`.
///
/// See [`Runtime::create`].
pub fn create<F>(config: &ThreadConfig, entry: F, arg: usize) -> Result<Thread>
where
    F: FnOnce(usize) -> ExitValue + Send + 'static,
{
    global().create(config, entry, arg)
}

/// Wait for `thread` to exit and return its exit value.
///
/// See [`Runtime::join`].
pub fn join(thread: Thread) -> Result<ExitValue> {
    global().join(thread)
}

/// Mark `thread` as detached.
///
/// See [`Runtime::detach`].
pub fn detach(thread: Thread) -> Result<()> {
    global().detach(thread)
}

/// Exit the calling thread with `value` as its exit value.
///
/// See [`Runtime::exit`].
pub fn exit(value: ExitValue) -> ! {
    global().exit(value)
}

/// Return the handle of the calling thread, if the process-wide runtime
/// manages it.
pub fn current() -> Option<Thread> {
    global().current()
}

/// Test whether `thread` can currently be joined or detached.
pub fn is_joinable(thread: Thread) -> bool {
    global().is_joinable(thread)
}

/// Return the OS thread id of `thread`.
///
/// See [`Runtime::os_id`].
pub fn os_id(thread: Thread) -> Option<rustix::thread::Pid> {
    global().os_id(thread)
}

/// Describe the stack of `thread`.
pub fn stack(thread: Thread) -> Result<StackInfo> {
    global().stack(thread)
}

/// Find the thread with the given kernel handle. This is O(n) in the number
/// of threads.
pub fn find_by_kernel_handle(handle: KernelHandle) -> Option<Thread> {
    global().find_by_kernel_handle(handle)
}

/// A snapshot of every thread that can still be joined or inspected.
pub fn threads() -> Vec<Thread> {
    global().threads()
}

/// Test whether any thread has been created.
pub fn is_threaded() -> bool {
    global().is_threaded()
}

/// Install a lifecycle hook on the process-wide runtime, returning the
/// previous one.
pub fn install_hook(hook: Option<Hook>) -> Option<Hook> {
    global().install_hook(hook)
}

/// Register a function to call when the current thread exits.
pub fn at_exit(func: Box<dyn FnOnce()>) -> Result<()> {
    global().at_exit(func)
}
