//! Errno convention for the transport.
//!
//! Replies carry the negation of the standard small-integer error code on the
//! wire; everything above the codec works with the positive form held in
//! [`Errno`]. Zero is not an error and is unrepresentable here.

use std::fmt;
use std::io;
use std::num::NonZeroI32;

/// A positive errno value.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(pub NonZeroI32);

macro_rules! errno_consts {
    ($($(#[$doc:meta])* $name:ident),* $(,)?) => {
        impl Errno {
            $(
                $(#[$doc])*
                pub const $name: Errno = Errno::from_const(libc::$name);
            )*
        }

        fn errno_name(code: i32) -> Option<&'static str> {
            $(
                if code == libc::$name {
                    return Some(stringify!($name));
                }
            )*
            None
        }
    };
}

errno_consts! {
    /// Operation not permitted
    EPERM,
    /// No such file or directory
    ENOENT,
    /// Interrupted system call
    EINTR,
    /// Input/output error
    EIO,
    /// Bad file descriptor
    EBADF,
    /// Resource temporarily unavailable
    EAGAIN,
    /// Cannot allocate memory
    ENOMEM,
    /// Permission denied
    EACCES,
    /// Device or resource busy
    EBUSY,
    /// File exists
    EEXIST,
    /// Invalid cross-device link
    EXDEV,
    /// No such device
    ENODEV,
    /// Not a directory
    ENOTDIR,
    /// Is a directory
    EISDIR,
    /// Invalid argument
    EINVAL,
    /// File too large
    EFBIG,
    /// No space left on device
    ENOSPC,
    /// Read-only file system
    EROFS,
    /// Broken pipe
    EPIPE,
    /// Numerical result out of range
    ERANGE,
    /// File name too long
    ENAMETOOLONG,
    /// Function not implemented
    ENOSYS,
    /// Directory not empty
    ENOTEMPTY,
    /// No data available (missing extended attribute)
    ENODATA,
    /// Protocol not supported
    EPROTONOSUPPORT,
    /// Operation not supported
    ENOTSUP,
    /// Transport endpoint is not connected
    ENOTCONN,
    /// Connection timed out
    ETIMEDOUT,
    /// No such device or address
    ENXIO,
    /// Resource deadlock avoided
    EDEADLK,
}

impl Errno {
    const fn from_const(code: i32) -> Errno {
        match NonZeroI32::new(code) {
            Some(code) => Errno(code),
            None => panic!("errno constants are nonzero"),
        }
    }

    /// Builds an errno from a positive raw code; nonpositive input (which a
    /// correct caller never produces) degrades to EIO.
    pub fn from_i32(code: i32) -> Errno {
        match NonZeroI32::new(code.max(0)) {
            Some(code) => Errno(code),
            None => Errno::EIO,
        }
    }

    /// Normalizes a reply-header error field. The wire carries zero for
    /// success and `-errno` for failure; positive values are a protocol
    /// violation and come back as `Err`.
    pub(crate) fn from_wire(raw: i32) -> Result<Option<Errno>, ()> {
        match raw {
            0 => Ok(None),
            e if e < 0 => Ok(Some(Errno::from_i32(-e))),
            _ => Err(()),
        }
    }

    /// The positive error code.
    pub fn code(self) -> i32 {
        self.0.get()
    }

    /// The negated form written into reply headers.
    pub(crate) fn to_wire(self) -> i32 {
        -self.0.get()
    }
}

impl fmt::Debug for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match errno_name(self.code()) {
            Some(name) => f.write_str(name),
            None => write!(f, "Errno({})", self.code()),
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl std::error::Error for Errno {}

impl From<Errno> for io::Error {
    fn from(errno: Errno) -> io::Error {
        io::Error::from_raw_os_error(errno.code())
    }
}

impl From<io::Error> for Errno {
    fn from(err: io::Error) -> Errno {
        match err.raw_os_error() {
            Some(code) if code > 0 => Errno::from_i32(code),
            _ => Errno::EIO,
        }
    }
}
