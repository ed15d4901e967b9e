//! A [`Kernel`] backed by the host libc's pthreads.

use super::{Body, Exit, Kernel, KernelHandle, Launch};
use crate::error::fatal;
use crate::gate::{Teardown, unlock_after_fork};
use crate::memory::{Region, VirtualMemory};
use core::ffi::c_void;
use core::mem::zeroed;
use core::ptr::null_mut;
use parking_lot::Mutex;
use rustix::io;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, channel};

/// Starts threads with `pthread_create` on the stacks we allocate.
///
/// A host thread is still running on its stack when its body returns, so
/// memory handed over in [`Exit`] is released by a reaper thread after it
/// has `pthread_join`ed the host thread.
pub struct PthreadKernel {
    memory: Arc<dyn VirtualMemory>,
    reaper: Mutex<Sender<Reap>>,
}

struct Reap {
    thread: libc::pthread_t,
    release: Option<Region>,
    teardown: Arc<Teardown>,
}

// SAFETY: `pthread_t` is an integer on the platforms we support.
unsafe impl Send for Reap {}

impl PthreadKernel {
    /// Create a kernel that releases thread memory through `memory`.
    pub fn new(memory: Arc<dyn VirtualMemory>) -> io::Result<Self> {
        let reaper = spawn_reaper(Arc::clone(&memory))?;
        Ok(Self {
            memory,
            reaper: Mutex::new(reaper),
        })
    }
}

fn spawn_reaper(memory: Arc<dyn VirtualMemory>) -> io::Result<Sender<Reap>> {
    let (sender, receiver) = channel();
    std::thread::Builder::new()
        .name("spindle-reaper".to_owned())
        .spawn(move || reap(&*memory, receiver))
        .map_err(|e| io::Errno::from_io_error(&e).unwrap_or(io::Errno::AGAIN))?;
    Ok(sender)
}

fn reap(memory: &dyn VirtualMemory, receiver: Receiver<Reap>) {
    for Reap {
        thread,
        release,
        teardown,
    } in receiver
    {
        // SAFETY: Every host thread we create is joinable, and is joined
        // exactly once, here.
        match unsafe { libc::pthread_join(thread, null_mut()) } {
            0 => (),
            err => fatal(
                "pthread_join of an exited thread failed",
                Some(io::Errno::from_raw_os_error(err)),
            ),
        }

        if let Some(region) = release {
            #[cfg(feature = "log")]
            log::trace!(target: "spindle::stack", "releasing {:?}", region);

            // SAFETY: The thread is gone, so nothing is using its stack.
            if let Err(e) = unsafe { memory.release(region) } {
                fatal("failed to release thread memory", Some(e));
            }
        }

        teardown.post();
    }
}

impl Kernel for PthreadKernel {
    fn create_thread(&self, launch: Launch) -> io::Result<KernelHandle> {
        extern "C" fn start(arg: *mut c_void) -> *mut c_void {
            // SAFETY: `arg` is the box leaked by `create_thread`.
            let body = unsafe { Box::from_raw(arg.cast::<Body>()) };
            body();
            null_mut()
        }

        let Launch { stack, body, .. } = launch;

        unsafe {
            let mut attr: libc::pthread_attr_t = zeroed();
            match libc::pthread_attr_init(&mut attr) {
                0 => (),
                err => return Err(io::Errno::from_raw_os_error(err)),
            }
            match libc::pthread_attr_setstack(
                &mut attr,
                stack.base().as_ptr().cast::<c_void>(),
                stack.size(),
            ) {
                0 => (),
                err => {
                    libc::pthread_attr_destroy(&mut attr);
                    return Err(io::Errno::from_raw_os_error(err));
                }
            }

            // Pack up the body. A `Box<dyn FnOnce()>` is a fat pointer, so
            // box it again to get something that fits in a `*mut c_void`.
            let arg = Box::into_raw(Box::new(body));

            // Call libc to create the thread.
            let mut new_thread: libc::pthread_t = zeroed();
            let result = libc::pthread_create(&mut new_thread, &attr, start, arg.cast());
            libc::pthread_attr_destroy(&mut attr);
            match result {
                0 => Ok(KernelHandle::from_raw(new_thread as usize)),
                err => {
                    drop(Box::from_raw(arg));
                    Err(io::Errno::from_raw_os_error(err))
                }
            }
        }
    }

    fn terminate_thread(&self, exit: Exit) {
        let Exit {
            release,
            handle,
            teardown,
        } = exit;
        let reap = Reap {
            thread: handle.as_raw() as libc::pthread_t,
            release,
            teardown,
        };
        if self.reaper.lock().send(reap).is_err() {
            fatal("the reaper thread is gone", None);
        }
    }

    #[inline]
    fn current_handle(&self) -> KernelHandle {
        // SAFETY: `pthread_self` is always safe to call.
        KernelHandle::from_raw(unsafe { libc::pthread_self() } as usize)
    }

    fn exit_process(&self, status: i32) {
        #[cfg(feature = "log")]
        log::trace!(
            target: "spindle::thread",
            "Last thread exited; exiting the process with status {}",
            status
        );

        std::process::exit(status)
    }

    unsafe fn after_fork_child(&self) {
        // The reaper thread doesn't exist in the child. Anything queued for
        // it belonged to the parent's threads.
        match spawn_reaper(Arc::clone(&self.memory)) {
            Ok(reaper) => {
                // SAFETY: Forwarded from our caller.
                let mut sender = unsafe { unlock_after_fork(&self.reaper) };
                // The old channel may have been mid-operation in a thread
                // that's gone, so don't touch it again.
                core::mem::forget(core::mem::replace(&mut *sender, reaper));
            }
            Err(e) => fatal("failed to restart the reaper thread", Some(e)),
        }
    }
}
