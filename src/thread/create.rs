//! Thread creation.

use super::{Event, ExitRequest, ExitValue, Thread, set_current};
use crate::config::ThreadConfig;
use crate::error::{Error, Result, fatal};
use crate::gate::Teardown;
use crate::kernel::Launch;
use crate::memory::Region;
use crate::record::{ThreadId, ThreadRecord};
use crate::runtime::Runtime;
use core::ptr::NonNull;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

impl Runtime {
    /// Create a thread which calls `entry(arg)`.
    ///
    /// The value `entry` returns becomes the thread's exit value. The thread
    /// is registered before it starts running, so the returned handle can
    /// be joined, detached, or inspected right away.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] if `config` is malformed, in which case
    /// nothing was allocated. [`Error::ResourceExhausted`] if the memory
    /// for the thread couldn't be allocated or the kernel refused to start
    /// it; everything is rolled back first.
    pub fn create<F>(self: &Arc<Self>, config: &ThreadConfig, entry: F, arg: usize) -> Result<Thread>
    where
        F: FnOnce(usize) -> ExitValue + Send + 'static,
    {
        let config = config.validate(self.page_size())?;

        let id = ThreadId::next();
        self.outstanding.add();
        let teardown = Arc::new(Teardown::new(Some(Arc::clone(&self.outstanding))));
        let record = match self.allocator.allocate(&config, |placement| {
            ThreadRecord::new(
                id,
                placement,
                config.joinable,
                config.start,
                false,
                teardown,
            )
        }) {
            Ok(record) => record,
            Err(e) => {
                self.outstanding.done();
                return Err(Error::ResourceExhausted(e));
            }
        };
        let thread = Thread::new(record, id);

        // SAFETY: We just placed the record, and the thread isn't running.
        let (stack, allocation) = unsafe {
            let record = thread.record();
            let stack = Region::new(
                NonNull::new_unchecked(record.stack_bottom as *mut u8),
                record.stack_top - record.stack_bottom,
            );
            (stack, record.allocation)
        };

        // Register the thread before it can run, so that it's visible to
        // `join` and introspection as soon as we return, and to itself.
        self.registry.insert(thread);
        self.mark_threaded();
        self.fire(Event::Create, thread);

        let runtime = Arc::clone(self);
        let launch = Launch {
            stack,
            control_block: record.cast(),
            start: config.start,
            body: Box::new(move || runtime.run(thread, entry, arg)),
        };

        match self.kernel.create_thread(launch) {
            Ok(handle) => {
                // The thread publishes this itself too. A detached thread
                // may already have exited and freed its record, in which
                // case the lookup fails and there's nothing to update.
                if let Ok(pin) = self.registry.pin(thread) {
                    pin.record().publish_kernel_handle(handle);
                }

                #[cfg(feature = "log")]
                log::trace!(
                    target: "spindle::thread",
                    "Thread[{}] created with stack {:?}{}",
                    id,
                    stack,
                    if config.joinable { "" } else { ", detached" }
                );

                Ok(thread)
            }
            Err(e) => {
                #[cfg(feature = "log")]
                log::trace!(
                    target: "spindle::thread",
                    "Thread[{}] failed to start: {:?}",
                    id,
                    e
                );

                self.registry.rollback(thread);
                // SAFETY: The kernel didn't start the thread, and it was
                // never visible outside this function except to the hook
                // and to lookups, which we wait out.
                unsafe {
                    thread.record().wait_unpinned();
                    self.allocator.destroy(record);
                    self.fire(Event::Destroy, thread);
                    self.allocator.release(allocation);
                }
                self.outstanding.done();
                Err(Error::ResourceExhausted(e))
            }
        }
    }

    /// The body of every created thread.
    fn run<F>(&self, thread: Thread, entry: F, arg: usize)
    where
        F: FnOnce(usize) -> ExitValue,
    {
        // SAFETY: We're on the thread the record describes, which keeps the
        // record alive until `terminate`.
        let record = unsafe { thread.record() };
        record.publish_kernel_handle(self.kernel.current_handle());
        record.publish_os_tid(rustix::thread::gettid());
        set_current(Some((self.id, thread)));

        #[cfg(feature = "log")]
        log::trace!(target: "spindle::thread", "Thread[{}] launched", thread.id());

        self.fire(Event::Start, thread);

        // Call the user's function. `exit` unwinds back to here.
        let value = match catch_unwind(AssertUnwindSafe(|| entry(arg))) {
            Ok(value) => value,
            Err(payload) => match payload.downcast::<ExitRequest>() {
                Ok(request) => request.0,
                Err(_) => fatal("a thread's entry function panicked", None),
            },
        };
        // If the entry function caught the unwinding from `exit`, the thread
        // still exits with the value it asked for.
        // SAFETY: We're on the thread the record describes.
        let value = unsafe { record.exit_requested() }.unwrap_or(value);

        self.terminate(thread, value);
    }
}
