//! Joining and detaching.

use super::{ExitValue, Thread};
use crate::error::{Error, Result};
use crate::gate::{JoinContext, Outcome};
use crate::record::ExitGate;
use crate::runtime::Runtime;
use core::ptr::NonNull;

impl Runtime {
    /// Wait for `thread` to exit and return its exit value.
    ///
    /// # Errors
    ///
    /// [`Error::HandleNotFound`] if `thread` no longer resolves, for example
    /// because it has already been joined. [`Error::WouldDeadlock`] if
    /// `thread` is the calling thread. [`Error::InvalidArgument`] if
    /// `thread` is detached, is detached while we wait, or already has a
    /// joiner.
    pub fn join(&self, thread: Thread) -> Result<ExitValue> {
        if self.current() == Some(thread) {
            return Err(Error::WouldDeadlock);
        }

        let pin = self.registry.pin(thread)?;
        let record = pin.record();

        #[cfg(feature = "log")]
        log::trace!(
            target: "spindle::thread",
            "Thread[{}] is being joined by {:?}",
            thread.id(),
            self.current()
        );

        let custom_stack = record.custom_stack;
        let teardown = record.teardown.clone();
        let ctx = JoinContext::new();

        let mut state = record.state.lock();
        if !state.joinable || state.joiner.is_some() {
            return Err(Error::InvalidArgument);
        }
        let gate = state.gate;
        let value = match gate {
            ExitGate::Reaped => return Err(Error::InvalidArgument),
            ExitGate::Exited => {
                // It's already exited and waiting for us. Take the value and
                // reap it ourselves.
                state.gate = ExitGate::Reaped;
                let value = state.exit_value;
                let free = state.free.take();
                self.registry.remove(thread);
                drop(state);
                drop(pin);

                // SAFETY: We took the record off the registry, so we own its
                // cleanup, and we dropped our pin.
                unsafe { self.reap(thread, free) };
                value
            }
            ExitGate::Running => {
                state.joiner = Some(NonNull::from(&ctx));
                drop(state);

                match ctx.wait() {
                    Outcome::Detached => {
                        // Whoever detached it handles the rest. Our pin kept
                        // the record alive until here.
                        return Err(Error::InvalidArgument);
                    }
                    Outcome::Exited(value) => {
                        drop(pin);
                        if record_race(thread) {
                            // The exiting thread got there first and has
                            // left the record to us.
                            // SAFETY: The record is off the registry, and
                            // the exiting thread is done with it.
                            unsafe {
                                let free = thread.record().state.lock().free.take();
                                self.reap(thread, free);
                            }
                        }
                        value
                    }
                }
            }
        };

        // The caller may want to free a stack it provided as soon as we
        // return, so wait until the kernel is done with it.
        if custom_stack {
            teardown.wait();
        }

        #[cfg(feature = "log")]
        log::trace!(
            target: "spindle::thread",
            "Thread[{}] joined with {:#x}",
            thread.id(),
            value
        );

        Ok(value)
    }

    /// Mark `thread` as detached, so that it frees its own resources when it
    /// exits. If it has already exited, free them now.
    ///
    /// A joiner already waiting on `thread` is woken, and its join fails
    /// with [`Error::InvalidArgument`].
    ///
    /// # Errors
    ///
    /// [`Error::HandleNotFound`] if `thread` no longer resolves.
    /// [`Error::InvalidArgument`] if it is already detached or is being
    /// reaped.
    pub fn detach(&self, thread: Thread) -> Result<()> {
        let pin = self.registry.pin(thread)?;
        let record = pin.record();

        let mut state = record.state.lock();
        if !state.joinable || state.gate == ExitGate::Reaped {
            return Err(Error::InvalidArgument);
        }
        state.joinable = false;

        #[cfg(feature = "log")]
        log::trace!(
            target: "spindle::thread",
            "Thread[{}] marked as detached by {:?}",
            thread.id(),
            self.current()
        );

        let gate = state.gate;
        match gate {
            ExitGate::Exited => {
                state.gate = ExitGate::Reaped;
                let free = state.free.take();
                self.registry.remove(thread);
                drop(state);
                drop(pin);

                // SAFETY: We took the record off the registry, so we own its
                // cleanup, and we dropped our pin.
                unsafe { self.reap(thread, free) };
            }
            _ => {
                let joiner = state.joiner.take();
                drop(state);
                if let Some(joiner) = joiner {
                    // SAFETY: The joiner registered `joiner` under the
                    // record lock and is blocked until we deliver.
                    unsafe { JoinContext::deliver(joiner, Outcome::Detached) };
                }
            }
        }

        Ok(())
    }
}

/// The joiner's side of the ownership race. Returns `true` if the joiner
/// owns the cleanup.
#[inline]
fn record_race(thread: Thread) -> bool {
    // SAFETY: Neither side frees the record until both have taken part in
    // the race.
    unsafe { thread.record().resolve_race() }
}
