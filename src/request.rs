//! Request decoding.
//!
//! A request represents one filesystem operation the kernel driver wants us
//! to perform. Every message begins with a fixed header; the rest of the
//! payload depends on the opcode. The decoder validates each message against
//! its declared length and structure and produces one [`Request`] value whose
//! fields own their data, so the read buffer can be reused immediately.

use std::ffi::OsString;
use std::fmt;
use std::os::unix::ffi::OsStringExt;
use std::path::PathBuf;
use std::time::SystemTime;

use thiserror::Error;

use crate::argument::ArgumentReader;
use crate::attr::{time_from_parts, Mode};
use crate::kernel::{self, consts, Opcode};

/// Identifies an active request. Responses echo it so the kernel can
/// correlate them; replies to distinct requests may arrive in any order.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct RequestId(pub u64);

/// A number identifying a directory or file. It must be unique among ids
/// returned in entry responses that have not yet been forgotten.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NodeId(pub u64);

impl NodeId {
    /// The root directory of the filesystem.
    pub const ROOT: NodeId = NodeId(kernel::FUSE_ROOT_ID);
}

/// A number identifying an open directory or file. It only needs to be
/// unique while the directory or file is open.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct HandleId(pub u64);

/// The basic information sent in every request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Header {
    /// Total message length, including this header.
    pub len: u32,
    /// Raw opcode of the request.
    pub opcode: u32,
    /// Unique id for the request.
    pub id: RequestId,
    /// File or directory the request is about.
    pub node: NodeId,
    /// User id of the process making the request.
    pub uid: u32,
    /// Group id of the process making the request.
    pub gid: u32,
    /// Process id of the process making the request.
    pub pid: u32,
}

impl Header {
    /// Decodes the leading header of a message. The caller guarantees at
    /// least [`kernel::IN_HEADER_SIZE`] bytes.
    fn decode(buf: &[u8]) -> Header {
        let mut args = ArgumentReader::new(buf);
        Header {
            len: args.fetch_u32().unwrap(),
            opcode: args.fetch_u32().unwrap(),
            id: RequestId(args.fetch_u64().unwrap()),
            node: NodeId(args.fetch_u64().unwrap()),
            uid: args.fetch_u32().unwrap(),
            gid: args.fetch_u32().unwrap(),
            pid: args.fetch_u32().unwrap(),
        }
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ID={:#x} Node={:#x} Uid={} Gid={} Pid={}",
            self.id.0, self.node.0, self.uid, self.gid, self.pid
        )
    }
}

/// Errors produced while decoding a message.
///
/// None of these poison the connection; the kernel device stays healthy and
/// the next read may succeed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum RequestError {
    /// Fewer bytes than an input header were read.
    #[error("message too short")]
    TooShort,
    /// The header length disagrees with the number of bytes read.
    #[error("bad header length")]
    BadLength,
    /// The payload did not match the structure its opcode requires.
    #[error("malformed message")]
    Malformed,
}

/// Which fields of a setattr request carry meaning.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SetattrValid(pub u32);

impl SetattrValid {
    pub fn mode(self) -> bool {
        self.0 & consts::FATTR_MODE != 0
    }
    pub fn uid(self) -> bool {
        self.0 & consts::FATTR_UID != 0
    }
    pub fn gid(self) -> bool {
        self.0 & consts::FATTR_GID != 0
    }
    pub fn size(self) -> bool {
        self.0 & consts::FATTR_SIZE != 0
    }
    pub fn atime(self) -> bool {
        self.0 & consts::FATTR_ATIME != 0
    }
    pub fn atime_now(self) -> bool {
        self.0 & consts::FATTR_ATIME_NOW != 0
    }
    pub fn mtime(self) -> bool {
        self.0 & consts::FATTR_MTIME != 0
    }
    pub fn mtime_now(self) -> bool {
        self.0 & consts::FATTR_MTIME_NOW != 0
    }
    pub fn handle(self) -> bool {
        self.0 & consts::FATTR_FH != 0
    }
    pub fn lock_owner(self) -> bool {
        self.0 & consts::FATTR_LOCKOWNER != 0
    }
    #[cfg(target_os = "macos")]
    pub fn crtime(self) -> bool {
        self.0 & consts::FATTR_CRTIME != 0
    }
    #[cfg(target_os = "macos")]
    pub fn chgtime(self) -> bool {
        self.0 & consts::FATTR_CHGTIME != 0
    }
    #[cfg(target_os = "macos")]
    pub fn bkuptime(self) -> bool {
        self.0 & consts::FATTR_BKUPTIME != 0
    }
    #[cfg(target_os = "macos")]
    pub fn flags(self) -> bool {
        self.0 & consts::FATTR_FLAGS != 0
    }
}

/// The first request sent on a FUSE filesystem.
#[derive(Clone, Debug, PartialEq)]
pub struct InitRequest {
    pub header: Header,
    pub major: u32,
    pub minor: u32,
    /// Maximum readahead in bytes that the kernel plans to use.
    pub max_readahead: u32,
    pub flags: u32,
}

/// Sent by the kernel when unmounting the filesystem. No more requests will
/// be received after this one, but it should still be responded to.
#[derive(Clone, Debug, PartialEq)]
pub struct DestroyRequest {
    pub header: Header,
}

/// Requests information about the mounted filesystem.
#[derive(Clone, Debug, PartialEq)]
pub struct StatfsRequest {
    pub header: Header,
}

/// Asks to look up the given name in the directory named by `header.node`.
#[derive(Clone, Debug, PartialEq)]
pub struct LookupRequest {
    pub header: Header,
    pub name: OsString,
}

/// Sent by the kernel when forgetting about `header.node` as returned by
/// `nlookup` entry responses.
#[derive(Clone, Debug, PartialEq)]
pub struct ForgetRequest {
    pub header: Header,
    /// The decrement for the node's lookup reference counter.
    pub nlookup: u64,
}

/// Asks for the metadata of `header.node`.
#[derive(Clone, Debug, PartialEq)]
pub struct GetattrRequest {
    pub header: Header,
}

/// Asks to change one or more attributes of a file, as indicated by `valid`.
#[derive(Clone, Debug, PartialEq)]
pub struct SetattrRequest {
    pub header: Header,
    pub valid: SetattrValid,
    pub handle: HandleId,
    pub size: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub mode: Mode,
    pub uid: u32,
    pub gid: u32,
    #[cfg(target_os = "macos")]
    pub bkuptime: SystemTime,
    #[cfg(target_os = "macos")]
    pub chgtime: SystemTime,
    #[cfg(target_os = "macos")]
    pub crtime: SystemTime,
    /// chflags(2) flags.
    #[cfg(target_os = "macos")]
    pub flags: u32,
}

/// Asks to read the target of a symbolic link.
#[derive(Clone, Debug, PartialEq)]
pub struct ReadlinkRequest {
    pub header: Header,
}

/// Asks to create a symlink making `new_name` point to `target`.
#[derive(Clone, Debug, PartialEq)]
pub struct SymlinkRequest {
    pub header: Header,
    pub new_name: OsString,
    pub target: PathBuf,
}

/// Asks to create a hard link to `old_node` under `new_name`.
#[derive(Clone, Debug, PartialEq)]
pub struct LinkRequest {
    pub header: Header,
    pub old_node: NodeId,
    pub new_name: OsString,
}

/// Asks to create a file node: a regular file, device, fifo or socket.
#[derive(Clone, Debug, PartialEq)]
pub struct MknodRequest {
    pub header: Header,
    pub name: OsString,
    pub mode: Mode,
    pub rdev: u32,
}

/// Asks to create (but not open) a directory.
#[derive(Clone, Debug, PartialEq)]
pub struct MkdirRequest {
    pub header: Header,
    pub name: OsString,
    pub mode: Mode,
}

/// Asks to remove a file (`dir == false`) or directory (`dir == true`) from
/// the directory `header.node`.
#[derive(Clone, Debug, PartialEq)]
pub struct RemoveRequest {
    pub header: Header,
    pub name: OsString,
    /// True if this is rmdir rather than unlink.
    pub dir: bool,
}

/// Asks to rename `old_name` in `header.node` to `new_name` in `new_dir`.
#[derive(Clone, Debug, PartialEq)]
pub struct RenameRequest {
    pub header: Header,
    pub new_dir: NodeId,
    pub old_name: OsString,
    pub new_name: OsString,
}

/// Asks to open a file (`dir == false`) or directory (`dir == true`).
#[derive(Clone, Debug, PartialEq)]
pub struct OpenRequest {
    pub header: Header,
    /// True if this is opendir rather than open.
    pub dir: bool,
    /// Flags as passed to open(2).
    pub flags: u32,
}

/// Asks to create and open a file (not a directory).
#[derive(Clone, Debug, PartialEq)]
pub struct CreateRequest {
    pub header: Header,
    pub name: OsString,
    pub flags: u32,
    pub mode: Mode,
}

/// Asks to read from an open file or directory.
#[derive(Clone, Debug, PartialEq)]
pub struct ReadRequest {
    pub header: Header,
    /// True if this is readdir rather than read.
    pub dir: bool,
    pub handle: HandleId,
    pub offset: i64,
    pub size: u32,
}

/// Asks to write to an open file.
#[derive(Clone, Debug, PartialEq)]
pub struct WriteRequest {
    pub header: Header,
    pub handle: HandleId,
    pub offset: i64,
    pub data: Vec<u8>,
    pub flags: u32,
}

/// Asks to release (close) an open handle.
#[derive(Clone, Debug, PartialEq)]
pub struct ReleaseRequest {
    pub header: Header,
    /// True if this is releasedir rather than release.
    pub dir: bool,
    pub handle: HandleId,
    /// Flags from the matching open request.
    pub flags: u32,
    pub release_flags: u32,
    pub lock_owner: u32,
}

/// Asks for the state of an open file to be flushed, as when a descriptor is
/// closed. A single open handle may receive multiple flush requests.
#[derive(Clone, Debug, PartialEq)]
pub struct FlushRequest {
    pub header: Header,
    pub handle: HandleId,
    pub flags: u32,
    pub lock_owner: u64,
}

/// Asks to flush buffered data of an open file or directory to storage.
#[derive(Clone, Debug, PartialEq)]
pub struct FsyncRequest {
    pub header: Header,
    /// True if this is fsyncdir rather than fsync.
    pub dir: bool,
    pub handle: HandleId,
    /// Bit 0 requests syncing only the data, not the metadata.
    pub flags: u32,
}

/// Asks to set an extended attribute of `header.node`.
#[derive(Clone, Debug, PartialEq)]
pub struct SetxattrRequest {
    pub header: Header,
    /// Creation/replacement constraints (`XATTR_CREATE`, `XATTR_REPLACE`).
    pub flags: u32,
    /// Offset within the attribute. Only meaningful on OS X for the
    /// resource fork attribute.
    pub position: u32,
    pub name: OsString,
    pub value: Vec<u8>,
}

/// Asks for an extended attribute of `header.node`.
#[derive(Clone, Debug, PartialEq)]
pub struct GetxattrRequest {
    pub header: Header,
    /// Maximum size to return; zero means the caller asks for the size.
    pub size: u32,
    pub name: OsString,
    /// Offset within the attribute. Only meaningful on OS X.
    pub position: u32,
}

/// Asks to list the extended attribute names of `header.node`.
#[derive(Clone, Debug, PartialEq)]
pub struct ListxattrRequest {
    pub header: Header,
    /// Maximum size to return; zero means the caller asks for the size.
    pub size: u32,
    /// Offset within the list. Only meaningful on OS X.
    pub position: u32,
}

/// Asks to remove an extended attribute of `header.node`.
#[derive(Clone, Debug, PartialEq)]
pub struct RemovexattrRequest {
    pub header: Header,
    pub name: OsString,
}

/// Asks whether `header.node` may be accessed for the purpose given by
/// `mask`.
#[derive(Clone, Debug, PartialEq)]
pub struct AccessRequest {
    pub header: Header,
    pub mask: u32,
}

/// Asks to interrupt another pending request. The response to that request
/// should carry an EINTR error status.
#[derive(Clone, Debug, PartialEq)]
pub struct InterruptRequest {
    pub header: Header,
    /// Id of the request to interrupt.
    pub interrupted: RequestId,
}

/// A single request received from the kernel.
///
/// A request of unrecognized kind decodes as [`Request::Unknown`]; servers
/// are expected to answer those with ENOSYS.
#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    Init(InitRequest),
    Destroy(DestroyRequest),
    Statfs(StatfsRequest),
    Lookup(LookupRequest),
    Forget(ForgetRequest),
    Getattr(GetattrRequest),
    Setattr(SetattrRequest),
    Readlink(ReadlinkRequest),
    Symlink(SymlinkRequest),
    Link(LinkRequest),
    Mknod(MknodRequest),
    Mkdir(MkdirRequest),
    Remove(RemoveRequest),
    Rename(RenameRequest),
    Open(OpenRequest),
    Create(CreateRequest),
    Read(ReadRequest),
    Write(WriteRequest),
    Release(ReleaseRequest),
    Flush(FlushRequest),
    Fsync(FsyncRequest),
    Setxattr(SetxattrRequest),
    Getxattr(GetxattrRequest),
    Listxattr(ListxattrRequest),
    Removexattr(RemovexattrRequest),
    Access(AccessRequest),
    Interrupt(InterruptRequest),
    /// An opcode outside the supported set.
    Unknown(Header),
}

/// A whole payload holding one name: every byte up to a mandatory trailing
/// NUL, which is stripped.
fn trailing_name(payload: &[u8]) -> Result<OsString, RequestError> {
    match payload.split_last() {
        Some((&0, name)) => Ok(OsString::from_vec(name.to_vec())),
        _ => Err(RequestError::Malformed),
    }
}

/// Two names packed back to back, each NUL-terminated.
fn name_pair(payload: &[u8]) -> Result<(OsString, OsString), RequestError> {
    if payload.last() != Some(&0) {
        return Err(RequestError::Malformed);
    }
    let split = payload
        .iter()
        .position(|&b| b == 0)
        .ok_or(RequestError::Malformed)?;
    let second = payload
        .get(split + 1..payload.len() - 1)
        .ok_or(RequestError::Malformed)?;
    Ok((
        OsString::from_vec(payload[..split].to_vec()),
        OsString::from_vec(second.to_vec()),
    ))
}

impl Request {
    /// Decodes one message as read from the kernel device.
    ///
    /// Do not trust the kernel to hand us well-formed data: the length in the
    /// header must agree with the number of bytes read (after compensating
    /// for two known kernel quirks), names must carry their terminators and
    /// data blobs must cover their advertised sizes.
    ///
    /// # Panics
    ///
    /// Panics on GETLK, SETLK, SETLKW, BMAP, SETVOLNAME, GETXTIMES and
    /// EXCHANGE. File locking and the OS X volume operations are not
    /// implemented; receiving one means the mount advertised capabilities it
    /// does not have.
    pub fn parse(buf: &[u8]) -> Result<Request, RequestError> {
        let n = buf.len();
        if n < kernel::IN_HEADER_SIZE {
            return Err(RequestError::TooShort);
        }
        let mut header = Header::decode(buf);

        // FreeBSD FUSE sends a short length in the header for INIT even
        // though the actual read length is correct.
        if header.opcode == Opcode::Init as u32
            && n == kernel::IN_HEADER_SIZE + kernel::INIT_IN_SIZE
            && (header.len as usize) < n
        {
            header.len = n as u32;
        }

        // OSXFUSE sometimes sends the wrong length in a WRITE message.
        if header.opcode == Opcode::Write as u32
            && (header.len as usize) < n
            && header.len as usize >= kernel::WRITE_IN_SIZE
        {
            header.len = n as u32;
        }

        if header.len as usize != n {
            return Err(RequestError::BadLength);
        }

        let payload = &buf[kernel::IN_HEADER_SIZE..];
        let opcode = match Opcode::from_u32(header.opcode) {
            Some(opcode) => opcode,
            // Assume higher-level code will send a "no idea what you mean"
            // error.
            None => return Ok(Request::Unknown(header)),
        };
        let mut args = ArgumentReader::new(payload);

        let request = match opcode {
            Opcode::Init => {
                if payload.len() < kernel::INIT_IN_SIZE {
                    return Err(RequestError::Malformed);
                }
                Request::Init(InitRequest {
                    header,
                    major: args.fetch_u32().unwrap(),
                    minor: args.fetch_u32().unwrap(),
                    max_readahead: args.fetch_u32().unwrap(),
                    flags: args.fetch_u32().unwrap(),
                })
            }

            Opcode::Destroy => Request::Destroy(DestroyRequest { header }),

            Opcode::Statfs => Request::Statfs(StatfsRequest { header }),

            Opcode::Lookup => Request::Lookup(LookupRequest {
                header,
                name: trailing_name(payload)?,
            }),

            Opcode::Forget => {
                if payload.len() < kernel::FORGET_IN_SIZE {
                    return Err(RequestError::Malformed);
                }
                Request::Forget(ForgetRequest {
                    header,
                    nlookup: args.fetch_u64().unwrap(),
                })
            }

            Opcode::Getattr => Request::Getattr(GetattrRequest { header }),

            Opcode::Setattr => parse_setattr(header, payload)?,

            Opcode::Readlink => {
                if !payload.is_empty() {
                    return Err(RequestError::Malformed);
                }
                Request::Readlink(ReadlinkRequest { header })
            }

            Opcode::Symlink => {
                // payload is "newname\0target\0"
                let (new_name, target) = name_pair(payload)?;
                Request::Symlink(SymlinkRequest {
                    header,
                    new_name,
                    target: PathBuf::from(target),
                })
            }

            Opcode::Link => {
                if payload.len() < kernel::LINK_IN_SIZE {
                    return Err(RequestError::Malformed);
                }
                let old_node = NodeId(args.fetch_u64().unwrap());
                let new_name = trailing_name(args.fetch_all())?;
                if new_name.is_empty() {
                    return Err(RequestError::Malformed);
                }
                Request::Link(LinkRequest { header, old_node, new_name })
            }

            Opcode::Mknod => {
                if payload.len() < kernel::MKNOD_IN_SIZE {
                    return Err(RequestError::Malformed);
                }
                let mode = args.fetch_u32().unwrap();
                let rdev = args.fetch_u32().unwrap();
                let name = trailing_name(args.fetch_all())?;
                if name.is_empty() {
                    return Err(RequestError::Malformed);
                }
                Request::Mknod(MknodRequest {
                    header,
                    name,
                    mode: Mode::from_unix(mode),
                    rdev,
                })
            }

            Opcode::Mkdir => {
                if payload.len() < kernel::MKDIR_IN_SIZE {
                    return Err(RequestError::Malformed);
                }
                let mode = args.fetch_u32().unwrap();
                let _padding = args.fetch_u32().unwrap();
                let name = args.fetch_cstr().ok_or(RequestError::Malformed)?;
                // Observed on Linux: mkdir modes arrive with a zeroed type
                // nibble, which the mode mapping would take for a device.
                // Force the type to directory.
                let mode = (mode & !(libc::S_IFMT as u32)) | libc::S_IFDIR as u32;
                Request::Mkdir(MkdirRequest {
                    header,
                    name: OsString::from_vec(name.to_vec()),
                    mode: Mode::from_unix(mode),
                })
            }

            Opcode::Unlink | Opcode::Rmdir => Request::Remove(RemoveRequest {
                header,
                name: trailing_name(payload)?,
                dir: opcode == Opcode::Rmdir,
            }),

            Opcode::Rename => {
                if payload.len() < kernel::RENAME_IN_SIZE {
                    return Err(RequestError::Malformed);
                }
                let new_dir = NodeId(args.fetch_u64().unwrap());
                // the rest is "old\0new\0"
                let (old_name, new_name) = name_pair(args.fetch_all())?;
                Request::Rename(RenameRequest { header, new_dir, old_name, new_name })
            }

            Opcode::Open | Opcode::Opendir => {
                if payload.len() < kernel::OPEN_IN_SIZE {
                    return Err(RequestError::Malformed);
                }
                Request::Open(OpenRequest {
                    header,
                    dir: opcode == Opcode::Opendir,
                    flags: args.fetch_u32().unwrap(),
                })
            }

            Opcode::Create => {
                if payload.len() < kernel::CREATE_IN_SIZE {
                    return Err(RequestError::Malformed);
                }
                let flags = args.fetch_u32().unwrap();
                let mode = args.fetch_u32().unwrap();
                let name = args.fetch_cstr().ok_or(RequestError::Malformed)?;
                Request::Create(CreateRequest {
                    header,
                    name: OsString::from_vec(name.to_vec()),
                    flags,
                    mode: Mode::from_unix(mode),
                })
            }

            Opcode::Read | Opcode::Readdir => {
                if payload.len() < kernel::READ_IN_SIZE {
                    return Err(RequestError::Malformed);
                }
                Request::Read(ReadRequest {
                    header,
                    dir: opcode == Opcode::Readdir,
                    handle: HandleId(args.fetch_u64().unwrap()),
                    offset: args.fetch_u64().unwrap() as i64,
                    size: args.fetch_u32().unwrap(),
                })
            }

            Opcode::Write => {
                if payload.len() < kernel::WRITE_IN_SIZE {
                    return Err(RequestError::Malformed);
                }
                let handle = HandleId(args.fetch_u64().unwrap());
                let offset = args.fetch_u64().unwrap() as i64;
                let size = args.fetch_u32().unwrap();
                let flags = args.fetch_u32().unwrap();
                let data = args.fetch_all();
                if data.len() < size as usize {
                    return Err(RequestError::Malformed);
                }
                Request::Write(WriteRequest {
                    header,
                    handle,
                    offset,
                    data: data[..size as usize].to_vec(),
                    flags,
                })
            }

            Opcode::Release | Opcode::Releasedir => {
                if payload.len() < kernel::RELEASE_IN_SIZE {
                    return Err(RequestError::Malformed);
                }
                Request::Release(ReleaseRequest {
                    header,
                    dir: opcode == Opcode::Releasedir,
                    handle: HandleId(args.fetch_u64().unwrap()),
                    flags: args.fetch_u32().unwrap(),
                    release_flags: args.fetch_u32().unwrap(),
                    lock_owner: args.fetch_u32().unwrap(),
                })
            }

            Opcode::Flush => {
                if payload.len() < kernel::FLUSH_IN_SIZE {
                    return Err(RequestError::Malformed);
                }
                let handle = HandleId(args.fetch_u64().unwrap());
                let flags = args.fetch_u32().unwrap();
                let _padding = args.fetch_u32().unwrap();
                let lock_owner = args.fetch_u64().unwrap();
                Request::Flush(FlushRequest { header, handle, flags, lock_owner })
            }

            Opcode::Fsync | Opcode::Fsyncdir => {
                if payload.len() < kernel::FSYNC_IN_SIZE {
                    return Err(RequestError::Malformed);
                }
                Request::Fsync(FsyncRequest {
                    header,
                    dir: opcode == Opcode::Fsyncdir,
                    handle: HandleId(args.fetch_u64().unwrap()),
                    flags: args.fetch_u32().unwrap(),
                })
            }

            Opcode::Setxattr => {
                if payload.len() < kernel::SETXATTR_IN_SIZE {
                    return Err(RequestError::Malformed);
                }
                let size = args.fetch_u32().unwrap();
                let flags = args.fetch_u32().unwrap();
                let position = fetch_xattr_position(&mut args);
                let name = args.fetch_cstr().ok_or(RequestError::Malformed)?.to_vec();
                let value = args.fetch_all();
                if value.len() < size as usize {
                    return Err(RequestError::Malformed);
                }
                Request::Setxattr(SetxattrRequest {
                    header,
                    flags,
                    position,
                    name: OsString::from_vec(name),
                    value: value[..size as usize].to_vec(),
                })
            }

            Opcode::Getxattr => {
                if payload.len() < kernel::GETXATTR_IN_SIZE {
                    return Err(RequestError::Malformed);
                }
                let size = args.fetch_u32().unwrap();
                let _padding = args.fetch_u32().unwrap();
                let position = fetch_xattr_position(&mut args);
                let name = args.fetch_cstr().ok_or(RequestError::Malformed)?;
                Request::Getxattr(GetxattrRequest {
                    header,
                    size,
                    name: OsString::from_vec(name.to_vec()),
                    position,
                })
            }

            Opcode::Listxattr => {
                if payload.len() < kernel::GETXATTR_IN_SIZE {
                    return Err(RequestError::Malformed);
                }
                let size = args.fetch_u32().unwrap();
                let _padding = args.fetch_u32().unwrap();
                let position = fetch_xattr_position(&mut args);
                Request::Listxattr(ListxattrRequest { header, size, position })
            }

            Opcode::Removexattr => Request::Removexattr(RemovexattrRequest {
                header,
                name: trailing_name(payload)?,
            }),

            Opcode::Access => {
                if payload.len() < kernel::ACCESS_IN_SIZE {
                    return Err(RequestError::Malformed);
                }
                Request::Access(AccessRequest {
                    header,
                    mask: args.fetch_u32().unwrap(),
                })
            }

            Opcode::Interrupt => {
                if payload.len() < kernel::INTERRUPT_IN_SIZE {
                    return Err(RequestError::Malformed);
                }
                Request::Interrupt(InterruptRequest {
                    header,
                    interrupted: RequestId(args.fetch_u64().unwrap()),
                })
            }

            Opcode::Getlk
            | Opcode::Setlk
            | Opcode::Setlkw
            | Opcode::Bmap
            | Opcode::Setvolname
            | Opcode::Getxtimes
            | Opcode::Exchange => panic!("unsupported opcode {:?}", opcode),
        };
        Ok(request)
    }

    /// The header common to every request kind.
    pub fn header(&self) -> &Header {
        match self {
            Request::Init(r) => &r.header,
            Request::Destroy(r) => &r.header,
            Request::Statfs(r) => &r.header,
            Request::Lookup(r) => &r.header,
            Request::Forget(r) => &r.header,
            Request::Getattr(r) => &r.header,
            Request::Setattr(r) => &r.header,
            Request::Readlink(r) => &r.header,
            Request::Symlink(r) => &r.header,
            Request::Link(r) => &r.header,
            Request::Mknod(r) => &r.header,
            Request::Mkdir(r) => &r.header,
            Request::Remove(r) => &r.header,
            Request::Rename(r) => &r.header,
            Request::Open(r) => &r.header,
            Request::Create(r) => &r.header,
            Request::Read(r) => &r.header,
            Request::Write(r) => &r.header,
            Request::Release(r) => &r.header,
            Request::Flush(r) => &r.header,
            Request::Fsync(r) => &r.header,
            Request::Setxattr(r) => &r.header,
            Request::Getxattr(r) => &r.header,
            Request::Listxattr(r) => &r.header,
            Request::Removexattr(r) => &r.header,
            Request::Access(r) => &r.header,
            Request::Interrupt(r) => &r.header,
            Request::Unknown(h) => h,
        }
    }
}

fn parse_setattr(header: Header, payload: &[u8]) -> Result<Request, RequestError> {
    if payload.len() < kernel::SETATTR_IN_SIZE {
        return Err(RequestError::Malformed);
    }
    let mut args = ArgumentReader::new(payload);
    let valid = SetattrValid(args.fetch_u32().unwrap());
    let _padding = args.fetch_u32().unwrap();
    let handle = HandleId(args.fetch_u64().unwrap());
    let size = args.fetch_u64().unwrap();
    let _lock_owner = args.fetch_u64().unwrap();
    let atime = args.fetch_u64().unwrap();
    let mtime = args.fetch_u64().unwrap();
    let _ctime = args.fetch_u64().unwrap();
    let atime_nsec = args.fetch_u32().unwrap();
    let mtime_nsec = args.fetch_u32().unwrap();
    let _ctime_nsec = args.fetch_u32().unwrap();
    let mode = args.fetch_u32().unwrap();
    let _unused = args.fetch_u32().unwrap();
    let uid = args.fetch_u32().unwrap();
    let gid = args.fetch_u32().unwrap();
    let _unused = args.fetch_u32().unwrap();
    #[cfg(target_os = "macos")]
    let (bkuptime, chgtime, crtime, flags) = {
        let bkuptime = args.fetch_u64().unwrap();
        let chgtime = args.fetch_u64().unwrap();
        let crtime = args.fetch_u64().unwrap();
        let bkuptime_nsec = args.fetch_u32().unwrap();
        let chgtime_nsec = args.fetch_u32().unwrap();
        let crtime_nsec = args.fetch_u32().unwrap();
        let flags = args.fetch_u32().unwrap();
        (
            time_from_parts(bkuptime, bkuptime_nsec),
            time_from_parts(chgtime, chgtime_nsec),
            time_from_parts(crtime, crtime_nsec),
            flags,
        )
    };
    Ok(Request::Setattr(SetattrRequest {
        header,
        valid,
        handle,
        size,
        atime: time_from_parts(atime, atime_nsec),
        mtime: time_from_parts(mtime, mtime_nsec),
        mode: Mode::from_unix(mode),
        uid,
        gid,
        #[cfg(target_os = "macos")]
        bkuptime,
        #[cfg(target_os = "macos")]
        chgtime,
        #[cfg(target_os = "macos")]
        crtime,
        #[cfg(target_os = "macos")]
        flags,
    }))
}

#[cfg(target_os = "macos")]
fn fetch_xattr_position(args: &mut ArgumentReader<'_>) -> u32 {
    let position = args.fetch_u32().unwrap_or(0);
    let _padding = args.fetch_u32();
    position
}

#[cfg(not(target_os = "macos"))]
fn fetch_xattr_position(_args: &mut ArgumentReader<'_>) -> u32 {
    0
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Init(r) => write!(
                f,
                "Init [{}] {}.{} ra={} fl={:#x}",
                r.header, r.major, r.minor, r.max_readahead, r.flags
            ),
            Request::Destroy(r) => write!(f, "Destroy [{}]", r.header),
            Request::Statfs(r) => write!(f, "Statfs [{}]", r.header),
            Request::Lookup(r) => write!(f, "Lookup [{}] {:?}", r.header, r.name),
            Request::Forget(r) => write!(f, "Forget [{}] {}", r.header, r.nlookup),
            Request::Getattr(r) => write!(f, "Getattr [{}]", r.header),
            Request::Setattr(r) => write!(f, "Setattr [{}] valid={:#x}", r.header, r.valid.0),
            Request::Readlink(r) => write!(f, "Readlink [{}]", r.header),
            Request::Symlink(r) => write!(
                f,
                "Symlink [{}] from {:?} to target {:?}",
                r.header, r.new_name, r.target
            ),
            Request::Link(r) => write!(
                f,
                "Link [{}] node {} to {:?}",
                r.header, r.old_node.0, r.new_name
            ),
            Request::Mknod(r) => write!(
                f,
                "Mknod [{}] {:?} mode={:?} rdev={}",
                r.header, r.name, r.mode, r.rdev
            ),
            Request::Mkdir(r) => write!(f, "Mkdir [{}] {:?} mode={:?}", r.header, r.name, r.mode),
            Request::Remove(r) => write!(f, "Remove [{}] {:?} dir={}", r.header, r.name, r.dir),
            Request::Rename(r) => write!(
                f,
                "Rename [{}] from {:?} to dirnode {} {:?}",
                r.header, r.old_name, r.new_dir.0, r.new_name
            ),
            Request::Open(r) => write!(
                f,
                "Open [{}] dir={} fl={:#x}",
                r.header, r.dir, r.flags
            ),
            Request::Create(r) => write!(
                f,
                "Create [{}] {:?} fl={:#x} mode={:?}",
                r.header, r.name, r.flags, r.mode
            ),
            Request::Read(r) => write!(
                f,
                "Read [{}] {:#x} {} @{:#x} dir={}",
                r.header, r.handle.0, r.size, r.offset, r.dir
            ),
            Request::Write(r) => write!(
                f,
                "Write [{}] {:#x} {} @{} fl={:#x}",
                r.header,
                r.handle.0,
                r.data.len(),
                r.offset,
                r.flags
            ),
            Request::Release(r) => write!(
                f,
                "Release [{}] {:#x} fl={:#x} rfl={:#x} owner={:#x} dir={}",
                r.header, r.handle.0, r.flags, r.release_flags, r.lock_owner, r.dir
            ),
            Request::Flush(r) => write!(
                f,
                "Flush [{}] {:#x} fl={:#x} lk={:#x}",
                r.header, r.handle.0, r.flags, r.lock_owner
            ),
            Request::Fsync(r) => write!(
                f,
                "Fsync [{}] {:#x} fl={:#x} dir={}",
                r.header, r.handle.0, r.flags, r.dir
            ),
            Request::Setxattr(r) => write!(
                f,
                "Setxattr [{}] {:?} {} bytes fl={:#x} @{:#x}",
                r.header,
                r.name,
                r.value.len(),
                r.flags,
                r.position
            ),
            Request::Getxattr(r) => write!(
                f,
                "Getxattr [{}] {:?} {} @{}",
                r.header, r.name, r.size, r.position
            ),
            Request::Listxattr(r) => write!(
                f,
                "Listxattr [{}] {} @{}",
                r.header, r.size, r.position
            ),
            Request::Removexattr(r) => write!(f, "Removexattr [{}] {:?}", r.header, r.name),
            Request::Access(r) => write!(f, "Access [{}] mask={:#x}", r.header, r.mask),
            Request::Interrupt(r) => write!(f, "Interrupt [{}] ID {:#x}", r.header, r.interrupted.0),
            Request::Unknown(h) => write!(f, "Unknown opcode {} [{}]", h.opcode, h),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::FileType;

    /// Builds a complete message with a correct header length.
    fn frame(opcode: u32, id: u64, node: u64, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(kernel::IN_HEADER_SIZE + payload.len());
        buf.extend_from_slice(&((kernel::IN_HEADER_SIZE + payload.len()) as u32).to_le_bytes());
        buf.extend_from_slice(&opcode.to_le_bytes());
        buf.extend_from_slice(&id.to_le_bytes());
        buf.extend_from_slice(&node.to_le_bytes());
        buf.extend_from_slice(&500u32.to_le_bytes()); // uid
        buf.extend_from_slice(&100u32.to_le_bytes()); // gid
        buf.extend_from_slice(&42u32.to_le_bytes()); // pid
        buf.extend_from_slice(&0u32.to_le_bytes()); // padding
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn header_round_trip() {
        let buf = frame(26, 0x0123456789abcdef, 0xfedcba9876543210, &[]);
        let header = Header::decode(&buf);
        assert_eq!(header.len, 40);
        assert_eq!(header.opcode, 26);
        assert_eq!(header.id, RequestId(0x0123456789abcdef));
        assert_eq!(header.node, NodeId(0xfedcba9876543210));
        assert_eq!(header.uid, 500);
        assert_eq!(header.gid, 100);
        assert_eq!(header.pid, 42);
    }

    #[test]
    fn init_handshake() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&7u32.to_le_bytes());
        payload.extend_from_slice(&8u32.to_le_bytes());
        payload.extend_from_slice(&131072u32.to_le_bytes());
        payload.extend_from_slice(&0u32.to_le_bytes());
        let buf = frame(26, 1, 0, &payload);
        assert_eq!(buf.len(), 56);
        match Request::parse(&buf).unwrap() {
            Request::Init(r) => {
                assert_eq!(r.major, 7);
                assert_eq!(r.minor, 8);
                assert_eq!(r.max_readahead, 131072);
                assert_eq!(r.flags, 0);
                assert_eq!(r.header.id, RequestId(1));
            }
            other => panic!("wrong request: {}", other),
        }
    }

    #[test]
    fn freebsd_init_length_quirk() {
        let mut buf = frame(26, 1, 0, &[0u8; 16]);
        // FreeBSD under-reports the total length for INIT
        buf[0..4].copy_from_slice(&40u32.to_le_bytes());
        assert!(matches!(Request::parse(&buf).unwrap(), Request::Init(_)));
    }

    #[test]
    fn osxfuse_write_length_quirk() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&3u64.to_le_bytes()); // fh
        payload.extend_from_slice(&0u64.to_le_bytes()); // offset
        payload.extend_from_slice(&5u32.to_le_bytes()); // size
        payload.extend_from_slice(&0u32.to_le_bytes()); // write flags
        payload.extend_from_slice(b"hello");
        let mut buf = frame(16, 9, 2, &payload);
        let real_len = buf.len() as u32;
        buf[0..4].copy_from_slice(&(real_len - 3).to_le_bytes());
        match Request::parse(&buf).unwrap() {
            Request::Write(r) => {
                assert_eq!(r.handle, HandleId(3));
                assert_eq!(r.data, b"hello");
            }
            other => panic!("wrong request: {}", other),
        }
    }

    #[test]
    fn write_parses_fields_and_bounds_data() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&7u64.to_le_bytes());
        payload.extend_from_slice(&4096u64.to_le_bytes());
        payload.extend_from_slice(&4u32.to_le_bytes());
        payload.extend_from_slice(&1u32.to_le_bytes());
        payload.extend_from_slice(b"datax"); // one extra byte beyond size
        let buf = frame(16, 11, 2, &payload);
        match Request::parse(&buf).unwrap() {
            Request::Write(r) => {
                assert_eq!(r.handle, HandleId(7));
                assert_eq!(r.offset, 4096);
                assert_eq!(r.flags, 1);
                assert_eq!(r.data, b"data");
            }
            other => panic!("wrong request: {}", other),
        }
    }

    #[test]
    fn write_data_shorter_than_advertised() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&7u64.to_le_bytes());
        payload.extend_from_slice(&0u64.to_le_bytes());
        payload.extend_from_slice(&10u32.to_le_bytes()); // claims 10 bytes
        payload.extend_from_slice(&0u32.to_le_bytes());
        payload.extend_from_slice(b"four");
        let buf = frame(16, 11, 2, &payload);
        assert_eq!(Request::parse(&buf), Err(RequestError::Malformed));
    }

    #[test]
    fn lookup_name() {
        let buf = frame(1, 2, 1, b"missing\0");
        match Request::parse(&buf).unwrap() {
            Request::Lookup(r) => assert_eq!(r.name, "missing"),
            other => panic!("wrong request: {}", other),
        }
    }

    #[test]
    fn lookup_requires_nul() {
        let buf = frame(1, 2, 1, b"missing");
        assert_eq!(Request::parse(&buf), Err(RequestError::Malformed));
        let buf = frame(1, 2, 1, b"");
        assert_eq!(Request::parse(&buf), Err(RequestError::Malformed));
    }

    #[test]
    fn symlink_splits_names() {
        let buf = frame(6, 3, 1, b"link\0/tmp/target\0");
        match Request::parse(&buf).unwrap() {
            Request::Symlink(r) => {
                assert_eq!(r.new_name, "link");
                assert_eq!(r.target, PathBuf::from("/tmp/target"));
            }
            other => panic!("wrong request: {}", other),
        }
    }

    #[test]
    fn symlink_missing_target() {
        let buf = frame(6, 3, 1, b"link\0");
        assert_eq!(Request::parse(&buf), Err(RequestError::Malformed));
    }

    #[test]
    fn rename_splits_names() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&7u64.to_le_bytes());
        payload.extend_from_slice(b"from\0to\0");
        let buf = frame(12, 4, 1, &payload);
        match Request::parse(&buf).unwrap() {
            Request::Rename(r) => {
                assert_eq!(r.new_dir, NodeId(7));
                assert_eq!(r.old_name, "from");
                assert_eq!(r.new_name, "to");
            }
            other => panic!("wrong request: {}", other),
        }
    }

    #[test]
    fn mkdir_forces_directory_type() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&0o755u32.to_le_bytes()); // zeroed type nibble
        payload.extend_from_slice(&0u32.to_le_bytes());
        payload.extend_from_slice(b"subdir\0");
        let buf = frame(9, 5, 1, &payload);
        match Request::parse(&buf).unwrap() {
            Request::Mkdir(r) => {
                assert_eq!(r.name, "subdir");
                assert_eq!(r.mode.file_type, FileType::Directory);
                assert_eq!(r.mode.perm, 0o755);
            }
            other => panic!("wrong request: {}", other),
        }
    }

    #[test]
    fn remove_distinguishes_rmdir() {
        let unlink = frame(10, 6, 1, b"f\0");
        let rmdir = frame(11, 7, 1, b"d\0");
        match Request::parse(&unlink).unwrap() {
            Request::Remove(r) => assert!(!r.dir),
            other => panic!("wrong request: {}", other),
        }
        match Request::parse(&rmdir).unwrap() {
            Request::Remove(r) => assert!(r.dir),
            other => panic!("wrong request: {}", other),
        }
    }

    #[test]
    fn open_and_opendir_share_layout() {
        let payload = [0u8; 8];
        match Request::parse(&frame(14, 8, 2, &payload)).unwrap() {
            Request::Open(r) => assert!(!r.dir),
            other => panic!("wrong request: {}", other),
        }
        match Request::parse(&frame(27, 9, 2, &payload)).unwrap() {
            Request::Open(r) => assert!(r.dir),
            other => panic!("wrong request: {}", other),
        }
    }

    #[test]
    fn release_reads_low_lock_owner_bits() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&5u64.to_le_bytes()); // fh
        payload.extend_from_slice(&0u32.to_le_bytes()); // flags
        payload.extend_from_slice(&consts::FUSE_RELEASE_FLUSH.to_le_bytes());
        payload.extend_from_slice(&0xdead_beef_0000_0001u64.to_le_bytes());
        let buf = frame(18, 10, 2, &payload);
        match Request::parse(&buf).unwrap() {
            Request::Release(r) => {
                assert_eq!(r.handle, HandleId(5));
                assert_eq!(r.release_flags, consts::FUSE_RELEASE_FLUSH);
                assert_eq!(r.lock_owner, 1);
            }
            other => panic!("wrong request: {}", other),
        }
    }

    #[test]
    fn setattr_decodes_times_and_mask() {
        let mut payload = vec![0u8; kernel::SETATTR_IN_SIZE];
        let valid = consts::FATTR_SIZE | consts::FATTR_ATIME;
        payload[0..4].copy_from_slice(&valid.to_le_bytes());
        payload[16..24].copy_from_slice(&8192u64.to_le_bytes()); // size
        payload[32..40].copy_from_slice(&1_000_000u64.to_le_bytes()); // atime sec
        payload[56..60].copy_from_slice(&500_000_000u32.to_le_bytes()); // atime nsec
        let buf = frame(4, 12, 2, &payload);
        match Request::parse(&buf).unwrap() {
            Request::Setattr(r) => {
                assert!(r.valid.size());
                assert!(r.valid.atime());
                assert!(!r.valid.mode());
                assert_eq!(r.size, 8192);
                assert_eq!(crate::attr::time_parts(r.atime), (1_000_000, 500_000_000));
            }
            other => panic!("wrong request: {}", other),
        }
    }

    #[test]
    fn setxattr_bounds_value_by_advertised_size() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&3u32.to_le_bytes()); // size
        payload.extend_from_slice(&0u32.to_le_bytes()); // flags
        #[cfg(target_os = "macos")]
        payload.extend_from_slice(&[0u8; 8]);
        payload.extend_from_slice(b"user.key\0valX");
        let buf = frame(21, 13, 2, &payload);
        match Request::parse(&buf).unwrap() {
            Request::Setxattr(r) => {
                assert_eq!(r.name, "user.key");
                assert_eq!(r.value, b"val");
            }
            other => panic!("wrong request: {}", other),
        }
    }

    #[test]
    fn getxattr_probe() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&0u32.to_le_bytes()); // size: asking for length
        payload.extend_from_slice(&0u32.to_le_bytes());
        #[cfg(target_os = "macos")]
        payload.extend_from_slice(&[0u8; 8]);
        payload.extend_from_slice(b"user.key\0");
        let buf = frame(22, 14, 2, &payload);
        match Request::parse(&buf).unwrap() {
            Request::Getxattr(r) => {
                assert_eq!(r.size, 0);
                assert_eq!(r.name, "user.key");
            }
            other => panic!("wrong request: {}", other),
        }
    }

    #[test]
    fn interrupt_names_pending_request() {
        let buf = frame(36, 50, 0, &42u64.to_le_bytes());
        match Request::parse(&buf).unwrap() {
            Request::Interrupt(r) => assert_eq!(r.interrupted, RequestId(42)),
            other => panic!("wrong request: {}", other),
        }
    }

    #[test]
    fn forget_carries_lookup_count() {
        let buf = frame(2, 15, 3, &9u64.to_le_bytes());
        match Request::parse(&buf).unwrap() {
            Request::Forget(r) => assert_eq!(r.nlookup, 9),
            other => panic!("wrong request: {}", other),
        }
    }

    #[test]
    fn readlink_rejects_payload() {
        assert!(matches!(
            Request::parse(&frame(5, 16, 3, &[])).unwrap(),
            Request::Readlink(_)
        ));
        assert_eq!(Request::parse(&frame(5, 16, 3, b"x")), Err(RequestError::Malformed));
    }

    #[test]
    fn unknown_opcode_yields_bare_header() {
        let buf = frame(4096, 17, 0, &[1, 2, 3]);
        match Request::parse(&buf).unwrap() {
            Request::Unknown(h) => {
                assert_eq!(h.opcode, 4096);
                assert_eq!(h.id, RequestId(17));
            }
            other => panic!("wrong request: {}", other),
        }
    }

    #[test]
    fn message_too_short() {
        assert_eq!(Request::parse(&[0u8; 39]), Err(RequestError::TooShort));
    }

    #[test]
    fn header_length_mismatch() {
        let mut buf = frame(3, 18, 2, &[]);
        buf[0..4].copy_from_slice(&99u32.to_le_bytes());
        assert_eq!(Request::parse(&buf), Err(RequestError::BadLength));
    }

    #[test]
    fn truncated_fixed_prefix() {
        // read request payload is 24 bytes, send 8
        let buf = frame(15, 19, 2, &[0u8; 8]);
        assert_eq!(Request::parse(&buf), Err(RequestError::Malformed));
    }

    #[test]
    #[should_panic(expected = "unsupported opcode")]
    fn getlk_is_fatal() {
        let _ = Request::parse(&frame(31, 20, 2, &[0u8; 48]));
    }
}
