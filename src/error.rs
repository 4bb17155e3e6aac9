//! Error types and the errno catalog.
//!
//! The FUSE interface can only communicate POSIX errno numbers to filesystem
//! clients; any richer error a server produces is reduced to a single
//! negative errno in the response header. [`Errno`] is that number, and
//! conversions into it decide which number a given error becomes.

use std::fmt;
use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::request::RequestError;

/// Errors surfaced by connection operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Transport failure while talking to the kernel device.
    #[error("fuse device error: {0}")]
    Io(#[from] io::Error),

    /// The kernel sent a message that does not decode against its declared
    /// length and structure. The connection itself is still healthy and
    /// reading may continue.
    #[error(transparent)]
    Malformed(#[from] RequestError),

    /// The mount did not complete. Reported through [`Connection::ready`]
    /// once the mount finisher has run.
    ///
    /// [`Connection::ready`]: crate::Connection::ready
    #[error("mount failed: {0}")]
    Mount(Arc<io::Error>),
}

/// A POSIX error number carried in a response.
///
/// Servers may answer any request with an errno; values from the catalog
/// below cover the common cases and arbitrary numbers can be constructed
/// directly. On the wire the number is always negated; OSXFUSE kernel-panics
/// on positive error values, so encoding guarantees the sign.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Errno(pub i32);

impl Errno {
    /// The call is not supported.
    pub const ENOSYS: Errno = Errno(libc::ENOSYS);
    /// Used by servers to answer violations of the FUSE protocol.
    pub const ESTALE: Errno = Errno(libc::ESTALE);
    pub const ENOENT: Errno = Errno(libc::ENOENT);
    pub const EIO: Errno = Errno(libc::EIO);
    pub const EPERM: Errno = Errno(libc::EPERM);
    /// The request was aborted after an interrupt request named it.
    pub const EINTR: Errno = Errno(libc::EINTR);
    pub const ERANGE: Errno = Errno(libc::ERANGE);
    pub const ENOTSUP: Errno = Errno(libc::ENOTSUP);
    pub const EEXIST: Errno = Errno(libc::EEXIST);

    /// The errno used when an error does not carry an explicit number.
    pub const DEFAULT: Errno = Errno::EIO;

    /// Short non-numeric identifier, if this is a catalog value.
    pub fn name(self) -> Option<&'static str> {
        match self {
            Errno::ENOSYS => Some("ENOSYS"),
            Errno::ESTALE => Some("ESTALE"),
            Errno::ENOENT => Some("ENOENT"),
            Errno::EIO => Some("EIO"),
            Errno::EPERM => Some("EPERM"),
            Errno::EINTR => Some("EINTR"),
            Errno::ERANGE => Some("ERANGE"),
            Errno::ENOTSUP => Some("ENOTSUP"),
            Errno::EEXIST => Some("EEXIST"),
            _ => None,
        }
    }

    /// The value placed in the response header: never positive.
    pub(crate) fn wire_value(self) -> i32 {
        if self.0 > 0 {
            -self.0
        } else {
            -Errno::DEFAULT.0
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "errno {}", self.0),
        }
    }
}

impl From<i32> for Errno {
    fn from(n: i32) -> Self {
        Errno(n)
    }
}

impl From<io::Error> for Errno {
    fn from(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(n) => Errno(n),
            None => Errno::DEFAULT,
        }
    }
}

impl From<&Error> for Errno {
    fn from(err: &Error) -> Self {
        match err {
            Error::Io(err) => err.raw_os_error().map(Errno).unwrap_or(Errno::DEFAULT),
            _ => Errno::DEFAULT,
        }
    }
}
