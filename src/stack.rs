//! Thread stack allocation.
//!
//! A thread created without a caller-provided stack gets one contiguous
//! region of virtual memory, laid out like this:
//!
//! ```text
//!   base                                                    base + total
//!   | guard (no access) | stack (grows down) | control block |
//!                       ^ stack_bottom       ^ stack_top
//! ```
//!
//! Everything is a multiple of the page size. A thread on a caller-provided
//! stack only gets a control block region, and has no guard.

use crate::config::Validated;
use crate::error::fatal;
use crate::memory::{Region, VirtualMemory, round_up};
use crate::record::{Placement, ThreadRecord};
use core::mem::size_of;
use core::ptr::{NonNull, drop_in_place};
use rustix::io;
use std::sync::Arc;

/// Offsets within a thread's allocation, computed from the requested sizes
/// and the page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    /// The size of the inaccessible region at the bottom.
    pub guard_size: usize,
    /// The size of the stack, between the guard and the control block.
    pub stack_size: usize,
    /// The size of the control block region.
    pub control_size: usize,
    /// The size of the whole allocation.
    pub total: usize,
}

impl Layout {
    /// Compute the layout for a stack of `stack_size` bytes with a guard of
    /// `guard_size` bytes below it.
    ///
    /// Returns `None` if the sizes overflow.
    pub fn compute(stack_size: usize, guard_size: usize, page_size: usize) -> Option<Self> {
        let guard_size = round_up(guard_size, page_size)?;
        let stack_size = round_up(stack_size, page_size)?;
        let control_size = Self::control_size(page_size)?;
        let total = guard_size
            .checked_add(stack_size)?
            .checked_add(control_size)?;
        Some(Self {
            guard_size,
            stack_size,
            control_size,
            total,
        })
    }

    /// Compute the layout for a thread on a caller-provided stack, which
    /// only needs a control block.
    pub fn control_only(page_size: usize) -> Option<Self> {
        let control_size = Self::control_size(page_size)?;
        Some(Self {
            guard_size: 0,
            stack_size: 0,
            control_size,
            total: control_size,
        })
    }

    fn control_size(page_size: usize) -> Option<usize> {
        round_up(size_of::<ThreadRecord>(), page_size)
    }

    /// The offset of the lowest stack byte.
    #[inline]
    pub fn stack_bottom(&self) -> usize {
        self.guard_size
    }

    /// The offset one past the highest stack byte.
    #[inline]
    pub fn stack_top(&self) -> usize {
        self.guard_size + self.stack_size
    }

    /// The offset of the control block.
    #[inline]
    pub fn control_offset(&self) -> usize {
        self.total - self.control_size
    }
}

/// Allocates and releases the memory backing thread records.
pub(crate) struct StackAllocator {
    memory: Arc<dyn VirtualMemory>,
}

impl StackAllocator {
    pub(crate) fn new(memory: Arc<dyn VirtualMemory>) -> Self {
        Self { memory }
    }

    #[inline]
    pub(crate) fn page_size(&self) -> usize {
        self.memory.page_size()
    }

    /// Allocate memory for a thread described by `config` and place the
    /// record built by `init` in its control block.
    pub(crate) fn allocate(
        &self,
        config: &Validated,
        init: impl FnOnce(&Placement) -> ThreadRecord,
    ) -> io::Result<NonNull<ThreadRecord>> {
        let page_size = self.page_size();

        match config.custom_stack {
            Some(bottom) => {
                let layout = Layout::control_only(page_size).ok_or(io::Errno::NOMEM)?;
                let bottom = bottom.as_ptr() as usize;
                self.place(layout, init, |allocation| Placement {
                    allocation,
                    stack_bottom: bottom,
                    stack_top: bottom + config.stack_size,
                    guard_size: 0,
                    custom_stack: true,
                })
            }
            None => {
                let layout = Layout::compute(config.stack_size, config.guard_size, page_size)
                    .ok_or(io::Errno::NOMEM)?;
                self.place(layout, init, |allocation| Placement {
                    allocation,
                    stack_bottom: allocation.addr() + layout.stack_bottom(),
                    stack_top: allocation.addr() + layout.stack_top(),
                    guard_size: layout.guard_size,
                    custom_stack: false,
                })
            }
        }
    }

    /// Allocate a control block for a thread that is already running on a
    /// stack we don't manage, such as the main thread.
    pub(crate) fn allocate_adopted(
        &self,
        init: impl FnOnce(&Placement) -> ThreadRecord,
    ) -> io::Result<NonNull<ThreadRecord>> {
        let layout = Layout::control_only(self.page_size()).ok_or(io::Errno::NOMEM)?;
        self.place(layout, init, |allocation| Placement {
            allocation,
            stack_bottom: 0,
            stack_top: 0,
            guard_size: 0,
            custom_stack: false,
        })
    }

    fn place(
        &self,
        layout: Layout,
        init: impl FnOnce(&Placement) -> ThreadRecord,
        placement: impl FnOnce(Region) -> Placement,
    ) -> io::Result<NonNull<ThreadRecord>> {
        let allocation = self.memory.reserve(layout.total)?;

        // Everything above the guard becomes readable and writable. The
        // lowest `guard_size` bytes stay inaccessible.
        let (_guard, accessible) = allocation.split_at(layout.guard_size);
        if let Some(accessible) = accessible {
            // SAFETY: `accessible` is within `allocation`, which we just
            // reserved.
            if let Err(e) = unsafe { self.memory.commit(accessible) } {
                unsafe { self.release(allocation) };
                return Err(e);
            }
        }

        let placement = placement(allocation);
        let record = init(&placement);

        // SAFETY: The control block is within the allocation, page-aligned,
        // and committed, so it is suitably aligned and writable for a
        // `ThreadRecord`.
        unsafe {
            let ptr = allocation
                .base()
                .as_ptr()
                .add(layout.control_offset())
                .cast::<ThreadRecord>();
            ptr.write(record);
            Ok(NonNull::new_unchecked(ptr))
        }
    }

    /// Run the destructor of the record in place. Its memory is released
    /// separately.
    ///
    /// # Safety
    ///
    /// `record` must have been placed by this allocator, and nothing may
    /// access it afterward.
    pub(crate) unsafe fn destroy(&self, record: NonNull<ThreadRecord>) {
        unsafe { drop_in_place(record.as_ptr()) }
    }

    /// Release `region`, which is all or part of an allocation made by this
    /// allocator.
    ///
    /// # Safety
    ///
    /// Nothing may access `region` afterward.
    pub(crate) unsafe fn release(&self, region: Region) {
        #[cfg(feature = "log")]
        log::trace!(target: "spindle::stack", "releasing {:?}", region);

        if let Err(e) = unsafe { self.memory.release(region) } {
            fatal("failed to release thread memory", Some(e));
        }
    }
}
