//! Thread creation parameters.

use crate::error::{Error, Result};
use crate::memory::round_up;
use core::ptr::NonNull;

/// The stack size used when a [`ThreadConfig`] doesn't request one.
pub const DEFAULT_STACK_SIZE: usize = 512 * 1024;

/// Return the default stack size for new threads.
#[inline]
#[must_use]
pub fn default_stack_size() -> usize {
    DEFAULT_STACK_SIZE
}

/// Return the default guard size for new threads.
#[inline]
#[must_use]
pub fn default_guard_size() -> usize {
    rustix::param::page_size()
}

/// Return the smallest stack size a thread may be created with.
#[inline]
#[must_use]
pub fn min_stack_size() -> usize {
    libc::PTHREAD_STACK_MIN
}

/// Whether a new thread's exit value awaits a [`join`], or its resources are
/// reclaimed automatically when it exits.
///
/// [`join`]: crate::Runtime::join
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetachState {
    /// The thread must be joined or detached later.
    #[default]
    Joinable,
    /// The thread reclaims its own resources when it exits.
    Detached,
}

/// A scheduling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SchedPolicy {
    /// The default time-sharing policy.
    Other = 1,
    /// First-in first-out.
    Fifo = 2,
    /// Round-robin.
    RoundRobin = 3,
}

/// A quality-of-service class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QosClass {
    /// Work the user is directly waiting on.
    UserInteractive = 0x21,
    /// Work the user has started and is waiting on.
    UserInitiated = 0x19,
    /// No explicit class.
    Default = 0x15,
    /// Long-running work the user is aware of.
    Utility = 0x11,
    /// Work the user isn't aware of.
    Background = 0x09,
}

/// Scheduling information passed through to the kernel boundary.
///
/// This crate never interprets it; it is only encoded into the
/// [`StartDescriptor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedHint {
    /// Inherit the creating thread's scheduling.
    #[default]
    Inherit,
    /// An explicit policy and priority.
    Policy {
        /// The policy.
        policy: SchedPolicy,
        /// The priority within the policy, at most [`MAX_IMPORTANCE`].
        priority: u8,
    },
    /// A quality-of-service class.
    Qos(QosClass),
}

/// The largest priority that fits in a [`StartDescriptor`].
pub const MAX_IMPORTANCE: u8 = 0x3f;

bitflags::bitflags! {
    /// The kind bits of a [`StartDescriptor`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StartFlags: u32 {
        /// The thread has a caller-provided stack.
        const CUSTOM_STACK = 0x0100_0000;
        /// The descriptor carries a policy and priority.
        const SET_SCHED = 0x0200_0000;
        /// The descriptor carries a quality-of-service class.
        const QOS_CLASS = 0x0400_0000;
        /// The thread starts out detached.
        const DETACHED = 0x0800_0000;
    }
}

const POLICY_SHIFT: u32 = 16;
const POLICY_MASK: u32 = 0xf;
const IMPORTANCE_MASK: u32 = 0xffff;

/// An opaque, bit-packed description of how to start a thread, handed to
/// the kernel boundary as is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartDescriptor(u32);

impl StartDescriptor {
    /// A descriptor with no flags set.
    #[inline]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// The kind bits.
    #[inline]
    pub fn flags(self) -> StartFlags {
        StartFlags::from_bits_truncate(self.0)
    }

    /// The raw encoded value.
    #[inline]
    pub fn bits(self) -> u32 {
        self.0
    }

    fn encode(config: &ThreadConfig) -> Self {
        let mut bits = 0;
        if config.stack_addr.is_some() {
            bits |= StartFlags::CUSTOM_STACK.bits();
        }
        if config.detach_state == DetachState::Detached {
            bits |= StartFlags::DETACHED.bits();
        }
        match config.sched {
            SchedHint::Inherit => {}
            SchedHint::Policy { policy, priority } => {
                bits |= StartFlags::SET_SCHED.bits();
                bits |= (policy as u32 & POLICY_MASK) << POLICY_SHIFT;
                bits |= u32::from(priority) & IMPORTANCE_MASK;
            }
            SchedHint::Qos(class) => {
                bits |= StartFlags::QOS_CLASS.bits();
                bits |= class as u32 & IMPORTANCE_MASK;
            }
        }
        Self(bits)
    }
}

/// Parameters for creating a thread.
///
/// The setters store values as given; everything is validated when the
/// configuration is used to create a thread.
#[derive(Debug, Clone, Default)]
pub struct ThreadConfig {
    pub(crate) stack_size: usize,
    pub(crate) guard_size: Option<usize>,
    pub(crate) stack_addr: Option<NonNull<u8>>,
    pub(crate) detach_state: DetachState,
    pub(crate) sched: SchedHint,
}

// SAFETY: The custom stack address is only a description; the caller of
// `stack` promised the memory is usable by the new thread.
unsafe impl Send for ThreadConfig {}
unsafe impl Sync for ThreadConfig {}

impl ThreadConfig {
    /// A configuration with the default stack, default guard, joinable, and
    /// inherited scheduling.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stack of `size` bytes. Zero selects the default size.
    #[inline]
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    /// Request a guard region of `size` bytes below the stack.
    #[inline]
    pub fn guard_size(mut self, size: usize) -> Self {
        self.guard_size = Some(size);
        self
    }

    /// Run the thread on the caller-provided stack of `size` bytes whose
    /// lowest address is `bottom`. No guard region is created.
    ///
    /// # Safety
    ///
    /// The memory must stay valid and unused by anything else until the
    /// thread has been joined, or, for a detached thread, until it has
    /// finished exiting.
    #[inline]
    pub unsafe fn stack(mut self, bottom: NonNull<u8>, size: usize) -> Self {
        self.stack_addr = Some(bottom);
        self.stack_size = size;
        self
    }

    /// Create the thread detached or joinable.
    #[inline]
    pub fn detach_state(mut self, state: DetachState) -> Self {
        self.detach_state = state;
        self
    }

    /// Shorthand for `detach_state(DetachState::Detached)`.
    #[inline]
    pub fn detached(self) -> Self {
        self.detach_state(DetachState::Detached)
    }

    /// Set the scheduling hint passed through to the kernel.
    #[inline]
    pub fn sched(mut self, hint: SchedHint) -> Self {
        self.sched = hint;
        self
    }

    /// Check the configuration against `page_size` and resolve the defaults.
    pub(crate) fn validate(&self, page_size: usize) -> Result<Validated> {
        let stack_size = if self.stack_size == 0 {
            DEFAULT_STACK_SIZE
        } else {
            self.stack_size
        };
        if stack_size < min_stack_size() || stack_size % page_size != 0 {
            return Err(Error::InvalidArgument);
        }

        if let SchedHint::Policy { priority, .. } = self.sched {
            if priority > MAX_IMPORTANCE {
                return Err(Error::InvalidArgument);
            }
        }

        let start = StartDescriptor::encode(self);
        let joinable = self.detach_state == DetachState::Joinable;

        if let Some(bottom) = self.stack_addr {
            // A custom stack has no guard, and its size has to be known so
            // that we can find the top.
            if self.stack_size == 0 || bottom.as_ptr() as usize % page_size != 0 {
                return Err(Error::InvalidArgument);
            }
            if (bottom.as_ptr() as usize).checked_add(stack_size).is_none() {
                return Err(Error::InvalidArgument);
            }
            return Ok(Validated {
                stack_size,
                guard_size: 0,
                custom_stack: Some(bottom),
                joinable,
                start,
            });
        }

        let guard_size = self.guard_size.unwrap_or_else(default_guard_size);
        if guard_size == 0 || guard_size % page_size != 0 {
            return Err(Error::InvalidArgument);
        }
        if stack_size
            .checked_add(guard_size)
            .and_then(|total| round_up(total, page_size))
            .is_none()
        {
            return Err(Error::InvalidArgument);
        }

        Ok(Validated {
            stack_size,
            guard_size,
            custom_stack: None,
            joinable,
            start,
        })
    }
}

/// A [`ThreadConfig`] that passed validation, with defaults filled in.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Validated {
    pub(crate) stack_size: usize,
    pub(crate) guard_size: usize,
    pub(crate) custom_stack: Option<NonNull<u8>>,
    pub(crate) joinable: bool,
    pub(crate) start: StartDescriptor,
}
