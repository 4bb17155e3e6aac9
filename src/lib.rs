//! Userspace implementation of the FUSE kernel protocol.
//!
//! FUSE lets a process implement a filesystem by exchanging messages with
//! the kernel over a character device. This crate speaks that wire protocol
//! directly, with no FUSE C library in the data path: it reads opcode-tagged
//! binary requests off the device, decodes them into a closed set of typed
//! [`Request`] values, and encodes typed responses back into the fixed
//! little-endian frames the kernel expects. Works on Linux, OS X (with
//! OSXFUSE) and FreeBSD.
//!
//! The intended consumer is a filesystem server layer: [`mount`] a
//! directory, then loop on [`Connection::read_request`] and answer each
//! request through its typed respond method or with
//! [`Request::respond_error`]. Node and handle bookkeeping, permission
//! checks and caching policy all belong to that layer, not to this crate.
//!
//! ```no_run
//! use fusewire::{mount, Errno, InitResponse, MountOption, Request, MAX_WRITE};
//!
//! fn main() -> Result<(), fusewire::Error> {
//!     let conn = mount("/mnt/example", &[MountOption::FsName("examplefs".into())])?;
//!     while let Some(request) = conn.read_request()? {
//!         match request {
//!             Request::Init(init) => {
//!                 let resp = InitResponse {
//!                     max_readahead: init.max_readahead,
//!                     flags: 0,
//!                     max_write: MAX_WRITE,
//!                 };
//!                 init.respond(&conn, &resp);
//!             }
//!             // Neither forget nor interrupt takes a reply.
//!             Request::Forget(_) | Request::Interrupt(_) => {}
//!             other => other.respond_error(&conn, Errno::ENOSYS),
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Concurrency
//!
//! A [`Connection`] is meant to be shared: one thread reads requests while
//! arbitrarily many threads answer requests produced earlier. Responses for
//! distinct requests may reach the kernel in any order; correlation happens
//! through the unique request id, which every reply echoes. Each response
//! write is atomic with respect to the others, and reading never blocks the
//! responders.
//!
//! # Errors
//!
//! The protocol can only communicate POSIX errno numbers to filesystem
//! clients; richer error messages are not visible to them. Answering with
//! [`Request::respond_error`] accepts anything convertible to [`Errno`] and
//! falls back to `EIO` for errors that carry no number of their own.
//!
//! # Interrupts
//!
//! Operations may take arbitrarily long. When the kernel loses interest in a
//! pending request it sends [`InterruptRequest`] naming its id; the server
//! should abort the work and answer the named request with `EINTR`. This
//! crate propagates the interrupt and does not track pending requests
//! itself.
//!
//! # Authentication
//!
//! Every request carries the uid, gid and pid of the process that caused it
//! in its [`Header`], which is all a server needs for permission checking.
//! The kernel normally stops other users from even reaching the filesystem
//! (see [`MountOption::AllowOther`] and [`MountOption::AllowRoot`]) but does
//! not enforce file modes unless [`MountOption::DefaultPermissions`] is set.

mod argument;
mod attr;
mod connection;
mod dirent;
mod error;
mod kernel;
mod mount;
mod reply;
mod request;
#[cfg(feature = "libfuse")]
mod sys;

pub use attr::{Attr, FileType, Mode};
pub use connection::{Connection, DebugEvent, DebugSink, MAX_WRITE};
pub use dirent::{append_dirent, Dirent, DirentType};
pub use error::{Errno, Error};
pub use kernel::consts;
pub use mount::MountOption;
#[cfg(feature = "libfuse")]
pub use mount::{mount, unmount};
pub use reply::{
    AttrResponse, CreateResponse, EntryResponse, GetxattrResponse, InitResponse,
    ListxattrResponse, OpenResponse, StatfsResponse, WriteResponse,
};
pub use request::{
    AccessRequest, CreateRequest, DestroyRequest, FlushRequest, ForgetRequest, FsyncRequest,
    GetattrRequest, GetxattrRequest, HandleId, Header, InitRequest, InterruptRequest,
    LinkRequest, ListxattrRequest, LookupRequest, MkdirRequest, MknodRequest, NodeId,
    OpenRequest, ReadRequest, ReadlinkRequest, ReleaseRequest, RemoveRequest,
    RemovexattrRequest, RenameRequest, Request, RequestError, RequestId, SetattrRequest,
    SetattrValid, SetxattrRequest, StatfsRequest, SymlinkRequest, WriteRequest,
};
