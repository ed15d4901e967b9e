//! The runtime ties the stack allocator, the registry, and the kernel
//! together.

use crate::config::{DetachState, StartDescriptor, StartFlags};
use crate::error::{Error, Result, fatal};
use crate::gate::{Outstanding, Teardown, unlock_after_fork, unlock_rwlock_after_fork};
use crate::kernel::{Kernel, KernelHandle, PthreadKernel};
use crate::memory::{MmapMemory, VirtualMemory};
use crate::record::{ExitGate, ThreadRecord};
use crate::registry::Registry;
use crate::stack::StackAllocator;
use crate::thread::{Event, Hook, StackInfo, Thread};
use core::sync::atomic::AtomicBool;
use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering::{Relaxed, SeqCst};
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, OnceLock};

/// Manages the lifecycle of every thread it creates.
///
/// Most programs use the process-wide runtime through the free functions in
/// the crate root. Constructing a `Runtime` directly allows substituting the
/// [`VirtualMemory`] and [`Kernel`] implementations.
pub struct Runtime {
    pub(crate) id: u64,
    pub(crate) allocator: StackAllocator,
    pub(crate) registry: Registry,
    pub(crate) kernel: Arc<dyn Kernel>,
    pub(crate) outstanding: Arc<Outstanding>,
    pub(crate) main: Mutex<Option<(Thread, KernelHandle)>>,
    threaded: AtomicBool,
    hook: RwLock<Option<Hook>>,
}

impl Runtime {
    /// Create a runtime, adopting the calling thread as its main thread.
    ///
    /// The main thread counts as live, so the process keeps running until
    /// it and every thread created by the runtime have exited.
    pub fn new(memory: Arc<dyn VirtualMemory>, kernel: Arc<dyn Kernel>) -> Result<Self> {
        let runtime = Self::without_main_thread(memory, kernel);

        let handle = runtime.kernel.current_handle();
        let teardown = Arc::new(Teardown::new(None));
        let id = crate::record::ThreadId::next();
        let record = runtime.allocator.allocate_adopted(|placement| {
            ThreadRecord::new(
                id,
                placement,
                true,
                StartDescriptor::empty(),
                true,
                teardown,
            )
        })?;
        let main = Thread::new(record, id);

        // SAFETY: We just placed the record.
        unsafe {
            main.record().publish_kernel_handle(handle);
            main.record().publish_os_tid(rustix::thread::gettid());
        }
        runtime.registry.insert(main);
        *runtime.main.lock() = Some((main, handle));

        #[cfg(feature = "log")]
        log::trace!(
            target: "spindle::thread",
            "Main Thread[{}] initialized",
            main.id()
        );

        Ok(runtime)
    }

    /// Create a runtime without adopting the calling thread.
    ///
    /// No thread is live until one is created, and the process exits as
    /// soon as the created threads have all exited.
    pub fn without_main_thread(memory: Arc<dyn VirtualMemory>, kernel: Arc<dyn Kernel>) -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);

        Self {
            id: NEXT.fetch_add(1, Relaxed),
            allocator: StackAllocator::new(memory),
            registry: Registry::new(),
            kernel,
            outstanding: Arc::new(Outstanding::default()),
            main: Mutex::new(None),
            threaded: AtomicBool::new(false),
            hook: RwLock::new(None),
        }
    }

    /// Return the page size of the runtime's memory.
    #[inline]
    pub fn page_size(&self) -> usize {
        self.allocator.page_size()
    }

    /// Return the handle of the calling thread, or `None` if the calling
    /// thread isn't managed by this runtime.
    pub fn current(&self) -> Option<Thread> {
        if let Some(thread) = crate::thread::current_in(self.id) {
            return Some(thread);
        }
        let main = *self.main.lock();
        match main {
            Some((thread, handle)) if handle == self.kernel.current_handle() => Some(thread),
            _ => None,
        }
    }

    /// Test whether `thread` can currently be joined or detached.
    pub fn is_joinable(&self, thread: Thread) -> bool {
        match self.registry.pin(thread) {
            Ok(pin) => {
                let state = pin.record().state.lock();
                state.joinable && state.gate != ExitGate::Reaped
            }
            Err(_) => false,
        }
    }

    /// Return the OS thread id of `thread`, or `None` if the handle no
    /// longer resolves or the thread hasn't started running.
    pub fn os_id(&self, thread: Thread) -> Option<rustix::thread::Pid> {
        self.registry.pin(thread).ok()?.record().os_tid()
    }

    /// Describe the stack of `thread`.
    pub fn stack(&self, thread: Thread) -> Result<StackInfo> {
        let pin = self.registry.pin(thread)?;
        let record = pin.record();
        Ok(StackInfo {
            bottom: record.stack_bottom,
            top: record.stack_top,
            guard_size: record.guard_size,
            allocation_base: record.allocation.addr(),
            custom: record.custom_stack,
        })
    }

    /// Return whether `thread` was created detached or joinable, judging by
    /// its start descriptor.
    pub fn initial_detach_state(&self, thread: Thread) -> Result<DetachState> {
        let pin = self.registry.pin(thread)?;
        let flags = pin.record().start.flags();
        Ok(if flags.contains(StartFlags::DETACHED) {
            DetachState::Detached
        } else {
            DetachState::Joinable
        })
    }

    /// Find the thread with the given kernel handle.
    ///
    /// This is O(n) in the number of threads.
    pub fn find_by_kernel_handle(&self, handle: KernelHandle) -> Option<Thread> {
        self.registry.find_by_kernel_handle(handle)
    }

    /// A snapshot of every thread that can still be joined or inspected, in
    /// creation order.
    pub fn threads(&self) -> Vec<Thread> {
        self.registry.threads()
    }

    /// The number of threads that can still be joined or inspected.
    pub fn count(&self) -> usize {
        self.registry.count()
    }

    /// The number of threads that haven't exited.
    pub fn live(&self) -> usize {
        self.registry.live()
    }

    /// Test whether this runtime has ever created a thread.
    pub fn is_threaded(&self) -> bool {
        self.threaded.load(SeqCst)
    }

    pub(crate) fn mark_threaded(&self) {
        self.threaded.store(true, SeqCst);
    }

    /// Install a function to be called at each point in a thread's
    /// lifecycle, returning the previously installed one.
    ///
    /// By the time the hook sees [`Event::Destroy`], the thread's handle no
    /// longer resolves.
    pub fn install_hook(&self, hook: Option<Hook>) -> Option<Hook> {
        core::mem::replace(&mut *self.hook.write(), hook)
    }

    pub(crate) fn fire(&self, event: Event, thread: Thread) {
        let hook = self.hook.read().clone();
        if let Some(hook) = hook {
            hook(event, thread);
        }
    }

    /// Register a function to call when the current thread exits.
    ///
    /// Functions run in reverse order of registration, before the thread's
    /// joiner is woken.
    pub fn at_exit(&self, func: Box<dyn FnOnce()>) -> Result<()> {
        let thread = self.current().ok_or(Error::HandleNotFound)?;

        // SAFETY: `thread` is the calling thread, so its record is alive and
        // the dtor list is ours.
        unsafe { thread.record().push_dtor(func) };
        Ok(())
    }

    /// Block until every thread this runtime created has finished exiting
    /// and the kernel has released its stack.
    pub fn quiesce(&self) {
        self.outstanding.wait_idle();
    }

    /// Reset the runtime in the child process after a `fork`.
    ///
    /// Every record except the calling thread's is discarded, and the
    /// calling thread becomes the only live thread. Locks that threads of
    /// the parent held at the time of the `fork` are reset rather than
    /// waited for.
    ///
    /// # Safety
    ///
    /// Must only be called in the child after a `fork`, before any other
    /// thread has been started there.
    pub unsafe fn reinit_after_fork(&self) {
        // SAFETY: The caller promises we're the only thread.
        let mut main = unsafe { unlock_after_fork(&self.main) };
        unsafe { unlock_rwlock_after_fork(&self.hook) };

        let handle = self.kernel.current_handle();
        let current = match crate::thread::current_in(self.id) {
            Some(thread) => Some(thread),
            None => match *main {
                // The child's thread has the handle of the thread that forked.
                Some((thread, main_handle)) if main_handle == handle => Some(thread),
                _ => None,
            },
        };

        let mut kept = 0;
        if let Some(thread) = current {
            // SAFETY: The calling thread's record is alive.
            unsafe {
                let record = thread.record();
                record.reset_after_fork();
                record.publish_kernel_handle(handle);
                record.publish_os_tid(rustix::thread::gettid());
                if !record.is_main {
                    // Its teardown is still to come, in the child.
                    kept = 1;
                }
            }
        }
        // If another thread forked, the main thread doesn't exist here.
        *main = match *main {
            Some((thread, _)) if Some(thread) == current => Some((thread, handle)),
            _ => None,
        };
        drop(main);

        unsafe {
            self.registry.reinit_after_fork(current);
            self.outstanding.reset_after_fork(kept);
            self.kernel.after_fork_child();
        }

        #[cfg(feature = "log")]
        log::trace!(
            target: "spindle::thread",
            "Reinitialized after fork, keeping {:?}",
            current
        );
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        // Nothing created by this runtime is still running, since every
        // thread holds a reference to it until it has handed its memory to
        // the kernel. What's left on the list is the main thread and
        // threads that exited without being joined.
        for thread in self.registry.threads() {
            // SAFETY: Records on the list are valid, and no one else can
            // reach them anymore.
            unsafe {
                let record = thread.record();
                let free = {
                    let mut state = record.state.lock();
                    match state.gate {
                        // The main thread, which isn't on our memory.
                        ExitGate::Running => Some(record.allocation),
                        _ => state.free.take(),
                    }
                };
                self.allocator.destroy(thread.record_ptr());
                if let Some(free) = free {
                    self.allocator.release(free);
                }
            }
        }
    }
}

static RUNTIME: OnceLock<Arc<Runtime>> = OnceLock::new();

/// Initialize the process-wide runtime, adopting the calling thread as the
/// main thread. Calling this more than once has no effect.
pub fn init() -> Result<()> {
    crate::log::init();

    if RUNTIME.get().is_some() {
        return Ok(());
    }
    let memory: Arc<dyn VirtualMemory> = Arc::new(MmapMemory);
    let kernel = Arc::new(PthreadKernel::new(Arc::clone(&memory))?);
    let runtime = Runtime::new(memory, kernel)?;
    // If we lost a race with another `init`, ours is dropped here.
    let _ = RUNTIME.set(Arc::new(runtime));
    Ok(())
}

/// Return the process-wide runtime, initializing it if needed.
pub fn global() -> &'static Arc<Runtime> {
    loop {
        if let Some(runtime) = RUNTIME.get() {
            return runtime;
        }
        if let Err(e) = init() {
            fatal("failed to initialize the runtime", Some(e.errno()));
        }
    }
}

/// Reset the process-wide runtime in the child process after a `fork`.
///
/// # Safety
///
/// Must only be called in the child after a `fork`, before any other thread
/// has been started there.
pub unsafe fn reinit_after_fork() {
    if let Some(runtime) = RUNTIME.get() {
        // SAFETY: Forwarded from our caller.
        unsafe { runtime.reinit_after_fork() };
    }
}
