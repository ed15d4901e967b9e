//! The list of live thread records.

use crate::error::{Error, Result};
use crate::gate::unlock_after_fork;
use crate::kernel::KernelHandle;
use crate::record::{ThreadId, ThreadRecord};
use crate::thread::Thread;
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Every thread record that can still be found by a join or by
/// introspection, in creation order, plus a count of threads that haven't
/// exited.
///
/// All operations take the registry lock for their duration, and never
/// acquire another lock while holding it.
pub(crate) struct Registry {
    inner: Mutex<Inner>,
}

struct Inner {
    // Thread ids are assigned in creation order, so this iterates in
    // insertion order.
    threads: BTreeMap<ThreadId, Thread>,
    live: usize,
}

impl Registry {
    pub(crate) const fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                threads: BTreeMap::new(),
                live: 0,
            }),
        }
    }

    /// Add a newly created thread, counting it as live.
    pub(crate) fn insert(&self, thread: Thread) {
        let mut inner = self.inner.lock();
        let previous = inner.threads.insert(thread.id(), thread);
        debug_assert!(previous.is_none(), "thread {} inserted twice", thread.id());
        inner.live += 1;
    }

    /// Remove `thread` from the list. Returns `false` if it wasn't there.
    pub(crate) fn remove(&self, thread: Thread) -> bool {
        self.inner.lock().threads.remove(&thread.id()).is_some()
    }

    /// Undo an [`insert`](Self::insert) for a thread the kernel failed to
    /// start.
    pub(crate) fn rollback(&self, thread: Thread) {
        let mut inner = self.inner.lock();
        inner.threads.remove(&thread.id());
        inner.live = inner.live.saturating_sub(1);
    }

    /// Count a thread as exited. Returns `true` if it was the last live
    /// thread.
    pub(crate) fn thread_exited(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.live = inner.live.saturating_sub(1);
        inner.live == 0
    }

    /// Find the thread with the given kernel handle.
    ///
    /// This walks the whole list, so it's O(n) in the number of threads. It
    /// exists for diagnostics, not for hot paths.
    pub(crate) fn find_by_kernel_handle(&self, handle: KernelHandle) -> Option<Thread> {
        let inner = self.inner.lock();
        inner.threads.values().copied().find(|thread| {
            // SAFETY: Records on the list are valid.
            unsafe { thread.record().kernel_handle() == Some(handle) }
        })
    }

    /// The number of records on the list.
    pub(crate) fn count(&self) -> usize {
        self.inner.lock().threads.len()
    }

    /// The number of threads that haven't exited.
    pub(crate) fn live(&self) -> usize {
        self.inner.lock().live
    }

    /// A snapshot of the list, in creation order.
    pub(crate) fn threads(&self) -> Vec<Thread> {
        self.inner.lock().threads.values().copied().collect()
    }

    /// Look up `thread` and pin its record so that it stays valid until the
    /// returned guard is dropped.
    pub(crate) fn pin(&self, thread: Thread) -> Result<Pinned> {
        let inner = self.inner.lock();
        match inner.threads.get(&thread.id()) {
            Some(found) if *found == thread => {
                // SAFETY: Records on the list are valid, and whoever takes
                // it off the list waits for pins to drain before freeing it.
                unsafe { thread.record().pin() };
                Ok(Pinned { thread })
            }
            _ => Err(Error::HandleNotFound),
        }
    }

    /// Discard every record except `keep`, in the child after a `fork`.
    ///
    /// The discarded threads don't exist in the child. Their memory is
    /// leaked, since their stacks were never handed to the child's kernel
    /// boundary. The registry lock may have been held by one of them, so it
    /// is reset rather than waited for, and the list is rebuilt from
    /// scratch.
    ///
    /// # Safety
    ///
    /// Must only be called in the child after a `fork`, while the calling
    /// thread is the only thread.
    pub(crate) unsafe fn reinit_after_fork(&self, keep: Option<Thread>) {
        let mut inner = unsafe { unlock_after_fork(&self.inner) };
        let mut threads = BTreeMap::new();
        if let Some(keep) = keep {
            threads.insert(keep.id(), keep);
        }
        let stale = core::mem::replace(
            &mut *inner,
            Inner {
                threads,
                live: usize::from(keep.is_some()),
            },
        );
        // It may be mid-update.
        core::mem::forget(stale);
    }
}

/// A registry lookup that keeps its record alive.
#[must_use]
pub(crate) struct Pinned {
    thread: Thread,
}

impl Pinned {
    #[inline]
    pub(crate) fn thread(&self) -> Thread {
        self.thread
    }

    #[inline]
    pub(crate) fn record(&self) -> &ThreadRecord {
        // SAFETY: The pin keeps the record alive.
        unsafe { self.thread.record() }
    }
}

impl Drop for Pinned {
    #[inline]
    fn drop(&mut self) {
        // SAFETY: The record is alive until the last pin is gone.
        unsafe { self.thread.record().unpin() }
    }
}
