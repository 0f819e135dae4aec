//! Kernel error model.
//!
//! One flat set of error kinds shared by every subsystem. Functions fail
//! with a [`KernelError`] carried in an ordinary `Result`; the syscall
//! layer converts the kind into a negated POSIX errno on the way out to
//! user space (see [`KernelError::errno`]).

use core::fmt;

/// Errors raised by the kernel core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Out of physical frames, virtual range, or cache objects.
    Nomem,
    /// Malformed argument: bad alignment, zero size, foreign pointer.
    Inval,
    /// Resource is already claimed (double init, occupied mapping slot).
    Busy,
    /// No such device.
    Nodev,
    /// Operation exists but this object does not support it.
    NotSupported,
    /// Operation is not implemented yet.
    NotImplemented,
    /// Caller lacks the privilege for the operation.
    Perm,
    /// Access outside the caller's rights (bad fault, protection error).
    Access,
    /// File descriptor is not open.
    BadFd,
    /// Operation would block and the caller asked not to.
    WouldBlock,
    /// Path resolves to a directory where a file was required.
    IsDirectory,
    /// Path component is not a directory.
    NotDirectory,
    /// Target already exists.
    Exist,
    /// No such entry.
    Noent,
    /// Path component exceeds the name limit.
    NameTooLong,
    /// Write attempted on a read-only filesystem.
    ReadOnlyFs,
    /// Seek on a non-seekable file.
    SeekPipe,
    /// Device or transport level I/O failure.
    Io,
}

/// Result type alias for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

impl KernelError {
    /// POSIX errno value for this kind. Syscalls return the negation.
    pub const fn errno(self) -> i32 {
        match self {
            Self::Nomem => 12,          // ENOMEM
            Self::Inval => 22,          // EINVAL
            Self::Busy => 16,           // EBUSY
            Self::Nodev => 19,          // ENODEV
            Self::NotSupported => 95,   // EOPNOTSUPP
            Self::NotImplemented => 38, // ENOSYS
            Self::Perm => 1,            // EPERM
            Self::Access => 13,         // EACCES
            Self::BadFd => 9,           // EBADF
            Self::WouldBlock => 11,     // EAGAIN
            Self::IsDirectory => 21,    // EISDIR
            Self::NotDirectory => 20,   // ENOTDIR
            Self::Exist => 17,          // EEXIST
            Self::Noent => 2,           // ENOENT
            Self::NameTooLong => 36,    // ENAMETOOLONG
            Self::ReadOnlyFs => 30,     // EROFS
            Self::SeekPipe => 29,       // ESPIPE
            Self::Io => 5,              // EIO
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::Nomem => "out of memory",
            Self::Inval => "invalid argument",
            Self::Busy => "resource busy",
            Self::Nodev => "no such device",
            Self::NotSupported => "operation not supported",
            Self::NotImplemented => "not implemented",
            Self::Perm => "operation not permitted",
            Self::Access => "access denied",
            Self::BadFd => "bad file descriptor",
            Self::WouldBlock => "operation would block",
            Self::IsDirectory => "is a directory",
            Self::NotDirectory => "not a directory",
            Self::Exist => "already exists",
            Self::Noent => "no such entry",
            Self::NameTooLong => "name too long",
            Self::ReadOnlyFs => "read-only filesystem",
            Self::SeekPipe => "illegal seek",
            Self::Io => "I/O error",
        };
        f.write_str(msg)
    }
}
