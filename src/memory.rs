//! Virtual memory regions backing thread stacks and control blocks.

use core::ffi::c_void;
use core::fmt;
use core::ptr::{null_mut, NonNull};
use rustix::io;
use rustix::mm::{mmap_anonymous, mprotect, munmap, MapFlags, MprotectFlags, ProtFlags};

/// A contiguous range of virtual memory obtained from a [`VirtualMemory`].
///
/// Everything about a thread's memory layout is described by one `Region`
/// plus offsets computed from it; see [`Layout`](crate::stack::Layout).
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Region {
    base: NonNull<u8>,
    size: usize,
}

// SAFETY: A `Region` is a description of an address range; it does not
// grant access to the memory by itself.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Describe the `size` bytes starting at `base`.
    #[inline]
    pub const fn new(base: NonNull<u8>, size: usize) -> Self {
        Self { base, size }
    }

    /// The lowest address in the region.
    #[inline]
    pub const fn base(self) -> NonNull<u8> {
        self.base
    }

    /// The address of the region's lowest byte, as an integer.
    #[inline]
    pub fn addr(self) -> usize {
        self.base.as_ptr() as usize
    }

    /// The number of bytes in the region.
    #[inline]
    pub const fn size(self) -> usize {
        self.size
    }

    /// One past the highest address in the region, as an integer.
    #[inline]
    pub fn end(self) -> usize {
        self.addr() + self.size
    }

    /// Test whether `addr` lies within the region.
    #[inline]
    pub fn contains(self, addr: usize) -> bool {
        addr >= self.addr() && addr < self.end()
    }

    /// Split the region at `offset` bytes from its base.
    ///
    /// Either half is `None` when it would be empty.
    pub fn split_at(self, offset: usize) -> (Option<Region>, Option<Region>) {
        debug_assert!(offset <= self.size);
        let low = (offset != 0).then(|| Region::new(self.base, offset));
        let high = (offset != self.size).then(|| {
            // SAFETY: `offset` is within the region, so the result is within
            // the same allocation and non-null.
            let base = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) };
            Region::new(base, self.size - offset)
        });
        (low, high)
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}..{:#x}", self.addr(), self.end())
    }
}

/// The virtual memory operations the stack allocator needs.
///
/// The production implementation is [`MmapMemory`]. Tests substitute an
/// implementation that tracks every page to detect leaks and double frees.
pub trait VirtualMemory: Send + Sync {
    /// The granularity of every mapping, in bytes.
    fn page_size(&self) -> usize;

    /// Reserve `size` bytes of inaccessible, private, anonymous memory.
    /// `size` is a multiple of [`page_size`](Self::page_size).
    fn reserve(&self, size: usize) -> io::Result<Region>;

    /// Make `region`, which lies within a reserved region, readable and
    /// writable.
    ///
    /// # Safety
    ///
    /// `region` must lie within memory returned by [`reserve`](Self::reserve)
    /// that has not been released.
    unsafe fn commit(&self, region: Region) -> io::Result<()>;

    /// Release `region`, which may be any page-aligned part of memory
    /// returned by [`reserve`](Self::reserve).
    ///
    /// # Safety
    ///
    /// Nothing may access `region` after this call, including the kernel on
    /// behalf of a thread still running on it.
    unsafe fn release(&self, region: Region) -> io::Result<()>;
}

/// [`VirtualMemory`] implemented with `mmap`, `mprotect`, and `munmap`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MmapMemory;

impl VirtualMemory for MmapMemory {
    #[inline]
    fn page_size(&self) -> usize {
        rustix::param::page_size()
    }

    fn reserve(&self, size: usize) -> io::Result<Region> {
        // Allocate address space for the thread, including guard pages. It
        // starts out inaccessible; `commit` opens up everything above the
        // guard.
        let map = unsafe {
            mmap_anonymous(
                null_mut(),
                size,
                ProtFlags::empty(),
                MapFlags::PRIVATE | MapFlags::STACK,
            )?
        };
        match NonNull::new(map.cast::<u8>()) {
            Some(base) => Ok(Region::new(base, size)),
            None => Err(io::Errno::NOMEM),
        }
    }

    unsafe fn commit(&self, region: Region) -> io::Result<()> {
        unsafe {
            mprotect(
                region.base().as_ptr().cast::<c_void>(),
                region.size(),
                MprotectFlags::READ | MprotectFlags::WRITE,
            )
        }
    }

    unsafe fn release(&self, region: Region) -> io::Result<()> {
        unsafe { munmap(region.base().as_ptr().cast::<c_void>(), region.size()) }
    }
}

/// Round `addr` up to a multiple of `boundary`, which must be a power of
/// two. Returns `None` on overflow.
#[inline]
pub const fn round_up(addr: usize, boundary: usize) -> Option<usize> {
    match addr.checked_add(boundary - 1) {
        Some(sum) => Some(sum & boundary.wrapping_neg()),
        None => None,
    }
}
