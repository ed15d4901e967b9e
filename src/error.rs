//! Errors reported by thread lifecycle operations.

use rustix::io;

/// The error type for [`create`], [`join`], [`detach`], and the other
/// lifecycle operations.
///
/// Failures which indicate that the crate's own bookkeeping no longer
/// matches what the kernel reports are not represented here. Those are
/// unrecoverable: they are logged and the process aborts.
///
/// [`create`]: crate::Runtime::create
/// [`join`]: crate::Runtime::join
/// [`detach`]: crate::Runtime::detach
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A malformed configuration, or an operation on a thread that is not
    /// joinable, already detached, or already being joined.
    #[error("invalid argument")]
    InvalidArgument,

    /// The stack allocation or the kernel thread could not be created. This
    /// is never retried internally.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(io::Errno),

    /// The handle no longer refers to a thread record, for example because
    /// the thread has already been reaped.
    #[error("no such thread")]
    HandleNotFound,

    /// A thread attempted to join itself.
    #[error("joining the calling thread would deadlock")]
    WouldDeadlock,
}

impl Error {
    /// Return the POSIX error number corresponding to this error, as
    /// returned by `pthread_create`, `pthread_join`, and `pthread_detach`.
    pub fn errno(self) -> io::Errno {
        match self {
            Self::InvalidArgument => io::Errno::INVAL,
            Self::ResourceExhausted(_) => io::Errno::AGAIN,
            Self::HandleNotFound => io::Errno::SRCH,
            Self::WouldDeadlock => io::Errno::DEADLK,
        }
    }
}

impl From<io::Errno> for Error {
    #[inline]
    fn from(errno: io::Errno) -> Self {
        Self::ResourceExhausted(errno)
    }
}

/// A specialized `Result` type for thread lifecycle operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Report a fatal invariant violation and abort the process.
///
/// This is used when the kernel or the memory subsystem reports a state
/// that is inconsistent with the registry, for example when releasing a
/// stack mapping fails. Continuing would risk corrupting the registry.
#[cold]
pub(crate) fn fatal(what: &str, errno: Option<io::Errno>) -> ! {
    #[cfg(feature = "log")]
    log::error!(
        target: "spindle::thread",
        "fatal invariant violation: {} ({:?})",
        what,
        errno
    );
    #[cfg(not(feature = "log"))]
    let _ = (what, errno);

    std::process::abort()
}
