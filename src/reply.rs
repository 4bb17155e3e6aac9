//! Reply encoding.
//!
//! Every response begins with a 16-byte header `{len, error, unique}` where
//! `unique` echoes the id of the request being answered and `error` is zero
//! on success or a negated errno. The payload that follows is a fixed-layout
//! struct per operation, emitted field by field in little-endian order. The
//! final length is patched in by the connection just before the frame is
//! written, so a frame under construction carries a zero length.
//!
//! Respond methods live on the request types and take the connection
//! explicitly; a request value does not keep a reference back to the
//! connection that produced it.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::time::Duration;

use crate::attr::{duration_parts, Attr};
use crate::connection::{Connection, MAX_WRITE};
use crate::error::Errno;
use crate::kernel;
use crate::request::{
    AccessRequest, CreateRequest, DestroyRequest, FlushRequest, FsyncRequest, GetattrRequest,
    GetxattrRequest, Header, HandleId, InitRequest, LinkRequest, ListxattrRequest, LookupRequest,
    MkdirRequest, MknodRequest, NodeId, OpenRequest, ReadRequest, ReadlinkRequest,
    ReleaseRequest, RemoveRequest, RemovexattrRequest, RenameRequest, Request, RequestId,
    SetattrRequest, SetxattrRequest, StatfsRequest, SymlinkRequest, WriteRequest,
};

/// A response frame under construction: the out header followed by payload
/// fields. The `len` field stays zero until the connection writes the frame.
pub(crate) struct ReplyFrame {
    buf: Vec<u8>,
}

impl ReplyFrame {
    /// Starts a success frame answering the given request id.
    pub fn new(id: RequestId) -> ReplyFrame {
        let mut buf = Vec::with_capacity(kernel::OUT_HEADER_SIZE + kernel::ENTRY_OUT_SIZE);
        buf.extend_from_slice(&0u32.to_le_bytes()); // len, patched on write
        buf.extend_from_slice(&0i32.to_le_bytes()); // error
        buf.extend_from_slice(&id.0.to_le_bytes()); // unique
        ReplyFrame { buf }
    }

    /// Starts an error frame. The errno is negated on the wire; positive
    /// error values make OSXFUSE kernel-panic, so the sign is enforced here.
    pub fn new_error(id: RequestId, errno: Errno) -> ReplyFrame {
        let mut frame = ReplyFrame::new(id);
        frame.buf[4..8].copy_from_slice(&errno.wire_value().to_le_bytes());
        frame
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_attr(&mut self, attr: &Attr) {
        attr.encode(&mut self.buf);
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

/// Sends a bare success header, the whole reply for many operations.
fn respond_empty(conn: &Connection, id: RequestId) {
    conn.respond(ReplyFrame::new(id).into_vec());
}

impl Header {
    /// Responds to the request with the given error.
    ///
    /// The errno is taken from the error value if it carries one (an
    /// [`Errno`], an errno-bearing `io::Error`); anything else becomes EIO.
    pub fn respond_error(&self, conn: &Connection, err: impl Into<Errno>) {
        conn.respond(ReplyFrame::new_error(self.id, err.into()).into_vec());
    }
}

impl Request {
    /// Responds to any request kind with the given error.
    pub fn respond_error(&self, conn: &Connection, err: impl Into<Errno>) {
        self.header().respond_error(conn, err);
    }
}

/// Reply to an init request.
#[derive(Clone, Debug, PartialEq)]
pub struct InitResponse {
    /// Maximum readahead in bytes the kernel may use. Ignored by the kernel
    /// if greater than the value it offered.
    pub max_readahead: u32,
    pub flags: u32,
    /// Maximum size of a single write operation. Clamped to [`MAX_WRITE`]
    /// on the way out; advertising more would produce writes the read
    /// buffer cannot hold.
    pub max_write: u32,
}

impl InitRequest {
    pub fn respond(&self, conn: &Connection, resp: &InitResponse) {
        let mut frame = ReplyFrame::new(self.header.id);
        frame.put_u32(kernel::FUSE_KERNEL_VERSION);
        frame.put_u32(kernel::FUSE_KERNEL_MINOR_VERSION);
        frame.put_u32(resp.max_readahead);
        frame.put_u32(resp.flags);
        frame.put_u32(0); // unused
        frame.put_u32(resp.max_write.min(MAX_WRITE));
        conn.respond(frame.into_vec());
    }
}

/// Reply carrying a found (or negative) directory entry, used by lookup,
/// symlink, link, mknod and mkdir.
#[derive(Clone, Debug, PartialEq)]
pub struct EntryResponse {
    /// Node id of the entry. Zero signals a negative lookup whose absence
    /// the kernel may cache for `entry_valid`.
    pub node: NodeId,
    /// Generation number of the node id. If the server reuses a node id
    /// after forgetting it, the generation must differ.
    pub generation: u64,
    /// How long the kernel may cache the existence of this entry.
    pub entry_valid: Duration,
    /// How long the kernel may cache the attributes.
    pub attr_valid: Duration,
    pub attr: Attr,
}

fn put_entry(frame: &mut ReplyFrame, resp: &EntryResponse) {
    let (entry_sec, entry_nsec) = duration_parts(resp.entry_valid);
    let (attr_sec, attr_nsec) = duration_parts(resp.attr_valid);
    frame.put_u64(resp.node.0);
    frame.put_u64(resp.generation);
    frame.put_u64(entry_sec);
    frame.put_u64(attr_sec);
    frame.put_u32(entry_nsec);
    frame.put_u32(attr_nsec);
    frame.put_attr(&resp.attr);
}

fn respond_entry(conn: &Connection, id: RequestId, resp: &EntryResponse) {
    let mut frame = ReplyFrame::new(id);
    put_entry(&mut frame, resp);
    conn.respond(frame.into_vec());
}

impl LookupRequest {
    pub fn respond(&self, conn: &Connection, resp: &EntryResponse) {
        respond_entry(conn, self.header.id, resp);
    }
}

impl SymlinkRequest {
    pub fn respond(&self, conn: &Connection, resp: &EntryResponse) {
        respond_entry(conn, self.header.id, resp);
    }
}

impl LinkRequest {
    pub fn respond(&self, conn: &Connection, resp: &EntryResponse) {
        respond_entry(conn, self.header.id, resp);
    }
}

impl MknodRequest {
    pub fn respond(&self, conn: &Connection, resp: &EntryResponse) {
        respond_entry(conn, self.header.id, resp);
    }
}

impl MkdirRequest {
    pub fn respond(&self, conn: &Connection, resp: &EntryResponse) {
        respond_entry(conn, self.header.id, resp);
    }
}

/// Reply carrying attributes and their cache validity, used by getattr and
/// setattr.
#[derive(Clone, Debug, PartialEq)]
pub struct AttrResponse {
    /// How long the kernel may cache the attributes.
    pub attr_valid: Duration,
    pub attr: Attr,
}

fn respond_attr(conn: &Connection, id: RequestId, resp: &AttrResponse) {
    let (sec, nsec) = duration_parts(resp.attr_valid);
    let mut frame = ReplyFrame::new(id);
    frame.put_u64(sec);
    frame.put_u32(nsec);
    frame.put_u32(0); // dummy
    frame.put_attr(&resp.attr);
    conn.respond(frame.into_vec());
}

impl GetattrRequest {
    pub fn respond(&self, conn: &Connection, resp: &AttrResponse) {
        respond_attr(conn, self.header.id, resp);
    }
}

impl SetattrRequest {
    /// Responds with the attributes after the change.
    pub fn respond(&self, conn: &Connection, resp: &AttrResponse) {
        respond_attr(conn, self.header.id, resp);
    }
}

/// Reply to an open or opendir request.
#[derive(Clone, Debug, PartialEq)]
pub struct OpenResponse {
    pub handle: HandleId,
    /// `FOPEN_*` flags.
    pub flags: u32,
}

impl OpenRequest {
    pub fn respond(&self, conn: &Connection, resp: &OpenResponse) {
        let mut frame = ReplyFrame::new(self.header.id);
        frame.put_u64(resp.handle.0);
        frame.put_u32(resp.flags);
        frame.put_u32(0); // padding
        conn.respond(frame.into_vec());
    }
}

/// Reply to a create request: the new entry concatenated with the open
/// result.
#[derive(Clone, Debug, PartialEq)]
pub struct CreateResponse {
    pub entry: EntryResponse,
    pub handle: HandleId,
    /// `FOPEN_*` flags.
    pub flags: u32,
}

impl CreateRequest {
    pub fn respond(&self, conn: &Connection, resp: &CreateResponse) {
        let mut frame = ReplyFrame::new(self.header.id);
        put_entry(&mut frame, &resp.entry);
        frame.put_u64(resp.handle.0);
        frame.put_u32(resp.flags);
        frame.put_u32(0); // padding
        conn.respond(frame.into_vec());
    }
}

impl ReadRequest {
    /// Responds with the bytes read. The payload is borrowed only for the
    /// duration of this call and written vectored, without copying into the
    /// frame.
    pub fn respond(&self, conn: &Connection, data: &[u8]) {
        conn.respond_safe(ReplyFrame::new(self.header.id).into_vec(), data);
    }
}

impl ReadlinkRequest {
    /// Responds with the target of the link.
    pub fn respond(&self, conn: &Connection, target: &OsStr) {
        conn.respond_safe(ReplyFrame::new(self.header.id).into_vec(), target.as_bytes());
    }
}

/// Reply to a write request.
#[derive(Clone, Debug, PartialEq)]
pub struct WriteResponse {
    /// Number of bytes accepted.
    pub size: u32,
}

impl WriteRequest {
    pub fn respond(&self, conn: &Connection, resp: &WriteResponse) {
        let mut frame = ReplyFrame::new(self.header.id);
        frame.put_u32(resp.size);
        frame.put_u32(0); // padding
        conn.respond(frame.into_vec());
    }
}

/// Reply to a statfs request.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StatfsResponse {
    /// Total data blocks in the filesystem.
    pub blocks: u64,
    /// Free blocks.
    pub bfree: u64,
    /// Free blocks available to unprivileged users.
    pub bavail: u64,
    /// Total inodes.
    pub files: u64,
    /// Free inodes.
    pub ffree: u64,
    /// Block size.
    pub bsize: u32,
    /// Maximum length of a file name.
    pub namelen: u32,
    /// Fragment size, the smallest addressable unit in the filesystem.
    pub frsize: u32,
}

impl StatfsRequest {
    pub fn respond(&self, conn: &Connection, resp: &StatfsResponse) {
        let mut frame = ReplyFrame::new(self.header.id);
        frame.put_u64(resp.blocks);
        frame.put_u64(resp.bfree);
        frame.put_u64(resp.bavail);
        frame.put_u64(resp.files);
        frame.put_u64(resp.ffree);
        frame.put_u32(resp.bsize);
        frame.put_u32(resp.namelen);
        frame.put_u32(resp.frsize);
        frame.put_u32(0); // padding
        for _ in 0..6 {
            frame.put_u32(0); // spare
        }
        conn.respond(frame.into_vec());
    }
}

/// Reply to a getxattr request.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GetxattrResponse {
    pub value: Vec<u8>,
}

impl GetxattrRequest {
    pub fn respond(&self, conn: &Connection, resp: &GetxattrResponse) {
        if self.size == 0 {
            // The caller asked how much space the value needs.
            let mut frame = ReplyFrame::new(self.header.id);
            frame.put_u32(resp.value.len() as u32);
            frame.put_u32(0); // padding
            conn.respond(frame.into_vec());
        } else {
            conn.respond_data(ReplyFrame::new(self.header.id).into_vec(), &resp.value);
        }
    }
}

/// Reply to a listxattr request: attribute names separated by NUL bytes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ListxattrResponse {
    pub value: Vec<u8>,
}

impl ListxattrResponse {
    /// Adds an attribute name to the list.
    pub fn append(&mut self, name: &OsStr) {
        self.value.extend_from_slice(name.as_bytes());
        self.value.push(0);
    }
}

impl ListxattrRequest {
    pub fn respond(&self, conn: &Connection, resp: &ListxattrResponse) {
        if self.size == 0 {
            let mut frame = ReplyFrame::new(self.header.id);
            frame.put_u32(resp.value.len() as u32);
            frame.put_u32(0); // padding
            conn.respond(frame.into_vec());
        } else {
            conn.respond_data(ReplyFrame::new(self.header.id).into_vec(), &resp.value);
        }
    }
}

impl SetxattrRequest {
    /// Responds that the attribute was set.
    pub fn respond(&self, conn: &Connection) {
        respond_empty(conn, self.header.id);
    }
}

impl RemovexattrRequest {
    /// Responds that the attribute was removed.
    pub fn respond(&self, conn: &Connection) {
        respond_empty(conn, self.header.id);
    }
}

impl RemoveRequest {
    /// Responds that the file or directory was removed.
    pub fn respond(&self, conn: &Connection) {
        respond_empty(conn, self.header.id);
    }
}

impl RenameRequest {
    pub fn respond(&self, conn: &Connection) {
        respond_empty(conn, self.header.id);
    }
}

impl ReleaseRequest {
    /// Responds that the handle has been released.
    pub fn respond(&self, conn: &Connection) {
        respond_empty(conn, self.header.id);
    }
}

impl FlushRequest {
    pub fn respond(&self, conn: &Connection) {
        respond_empty(conn, self.header.id);
    }
}

impl FsyncRequest {
    pub fn respond(&self, conn: &Connection) {
        respond_empty(conn, self.header.id);
    }
}

impl AccessRequest {
    /// Responds that access is allowed. To deny access, use
    /// [`Header::respond_error`] with EACCES or EPERM.
    pub fn respond(&self, conn: &Connection) {
        respond_empty(conn, self.header.id);
    }
}

impl DestroyRequest {
    pub fn respond(&self, conn: &Connection) {
        respond_empty(conn, self.header.id);
    }
}

// Forget and Interrupt have no respond methods: the kernel expects no reply
// to either.

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::{FileType, Mode};
    use crate::connection::tests::test_pair;
    use crate::kernel::{ATTR_SIZE, OUT_HEADER_SIZE};
    use crate::request::Request;
    use std::io::Read;
    use std::time::UNIX_EPOCH;

    fn read_reply(kernel_end: &mut std::os::unix::net::UnixStream) -> Vec<u8> {
        let mut buf = vec![0u8; 1 << 17];
        let n = kernel_end.read(&mut buf).unwrap();
        buf.truncate(n);
        buf
    }

    fn out_header(reply: &[u8]) -> (u32, i32, u64) {
        (
            u32::from_le_bytes(reply[0..4].try_into().unwrap()),
            i32::from_le_bytes(reply[4..8].try_into().unwrap()),
            u64::from_le_bytes(reply[8..16].try_into().unwrap()),
        )
    }

    fn sample_attr() -> Attr {
        Attr {
            inode: 2,
            size: 11,
            blocks: 1,
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
            crtime: UNIX_EPOCH,
            mode: Mode::new(FileType::RegularFile, 0o644),
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
            flags: 0,
        }
    }

    #[test]
    fn error_reply_is_negative_and_echoes_unique() {
        let (conn, mut kernel_end) = test_pair();
        let header = Header {
            len: 40,
            opcode: 1,
            id: RequestId(0xdeadbeef),
            node: NodeId(1),
            uid: 0,
            gid: 0,
            pid: 0,
        };
        header.respond_error(&conn, Errno::ENOENT);
        let reply = read_reply(&mut kernel_end);
        assert_eq!(reply.len(), 16);
        assert_eq!(out_header(&reply), (16, -libc::ENOENT, 0xdeadbeef));
    }

    #[test]
    fn init_reply_clamps_max_write() {
        let (conn, mut kernel_end) = test_pair();
        let req = InitRequest {
            header: Header {
                len: 56,
                opcode: 26,
                id: RequestId(1),
                node: NodeId(0),
                uid: 0,
                gid: 0,
                pid: 0,
            },
            major: 7,
            minor: 8,
            max_readahead: 131072,
            flags: 0,
        };
        req.respond(&conn, &InitResponse { max_readahead: 131072, flags: 0, max_write: 1 << 24 });
        let reply = read_reply(&mut kernel_end);
        assert_eq!(out_header(&reply), (40, 0, 1));
        let max_write = u32::from_le_bytes(reply[36..40].try_into().unwrap());
        assert_eq!(max_write, MAX_WRITE);
        assert_eq!(u32::from_le_bytes(reply[16..20].try_into().unwrap()), 7); // major
        assert_eq!(u32::from_le_bytes(reply[20..24].try_into().unwrap()), 8); // minor
    }

    #[test]
    fn entry_reply_layout() {
        let (conn, mut kernel_end) = test_pair();
        let buf = {
            let mut payload = b"hello\0".to_vec();
            let mut frame = Vec::new();
            frame.extend_from_slice(&((40 + payload.len()) as u32).to_le_bytes());
            frame.extend_from_slice(&1u32.to_le_bytes()); // lookup
            frame.extend_from_slice(&3u64.to_le_bytes());
            frame.extend_from_slice(&1u64.to_le_bytes());
            frame.extend_from_slice(&[0u8; 16]);
            frame.append(&mut payload);
            frame
        };
        let req = match Request::parse(&buf).unwrap() {
            Request::Lookup(req) => req,
            other => panic!("wrong request: {}", other),
        };
        req.respond(&conn, &EntryResponse {
            node: NodeId(5),
            generation: 1,
            entry_valid: Duration::new(1, 500),
            attr_valid: Duration::new(2, 700),
            attr: sample_attr(),
        });
        let reply = read_reply(&mut kernel_end);
        assert_eq!(reply.len(), OUT_HEADER_SIZE + 40 + ATTR_SIZE);
        assert_eq!(out_header(&reply), (reply.len() as u32, 0, 3));
        assert_eq!(u64::from_le_bytes(reply[16..24].try_into().unwrap()), 5); // nodeid
        assert_eq!(u64::from_le_bytes(reply[32..40].try_into().unwrap()), 1); // entry_valid sec
        assert_eq!(u32::from_le_bytes(reply[48..52].try_into().unwrap()), 500); // entry_valid nsec
        assert_eq!(u32::from_le_bytes(reply[52..56].try_into().unwrap()), 700); // attr_valid nsec
    }

    #[test]
    fn negative_lookup_is_representable() {
        let (conn, mut kernel_end) = test_pair();
        let req = LookupRequest {
            header: Header {
                len: 48,
                opcode: 1,
                id: RequestId(9),
                node: NodeId(1),
                uid: 0,
                gid: 0,
                pid: 0,
            },
            name: "missing".into(),
        };
        req.respond(&conn, &EntryResponse {
            node: NodeId(0),
            generation: 0,
            entry_valid: Duration::from_secs(1),
            attr_valid: Duration::ZERO,
            attr: sample_attr(),
        });
        let reply = read_reply(&mut kernel_end);
        assert_eq!(u64::from_le_bytes(reply[16..24].try_into().unwrap()), 0);
    }

    #[test]
    fn read_reply_is_vectored_with_payload() {
        let (conn, mut kernel_end) = test_pair();
        let req = ReadRequest {
            header: Header {
                len: 64,
                opcode: 15,
                id: RequestId(21),
                node: NodeId(2),
                uid: 0,
                gid: 0,
                pid: 0,
            },
            dir: false,
            handle: HandleId(1),
            offset: 0,
            size: 5,
        };
        req.respond(&conn, b"hello");
        let reply = read_reply(&mut kernel_end);
        assert_eq!(out_header(&reply), (21, 0, 21));
        assert_eq!(&reply[16..], b"hello");
    }

    #[test]
    fn getxattr_size_probe() {
        let (conn, mut kernel_end) = test_pair();
        let mut req = GetxattrRequest {
            header: Header {
                len: 57,
                opcode: 22,
                id: RequestId(30),
                node: NodeId(2),
                uid: 0,
                gid: 0,
                pid: 0,
            },
            size: 0,
            name: "user.key".into(),
            position: 0,
        };
        req.respond(&conn, &GetxattrResponse { value: b"some value".to_vec() });
        let reply = read_reply(&mut kernel_end);
        assert_eq!(out_header(&reply), (24, 0, 30));
        assert_eq!(u32::from_le_bytes(reply[16..20].try_into().unwrap()), 10);

        // With a size, the raw bytes go out instead.
        req.size = 64;
        req.respond(&conn, &GetxattrResponse { value: b"some value".to_vec() });
        let reply = read_reply(&mut kernel_end);
        assert_eq!(out_header(&reply), (26, 0, 30));
        assert_eq!(&reply[16..], b"some value");
    }

    #[test]
    fn listxattr_appends_nul_separated_names() {
        let mut resp = ListxattrResponse::default();
        resp.append(OsStr::new("user.a"));
        resp.append(OsStr::new("user.b"));
        assert_eq!(resp.value, b"user.a\0user.b\0");
    }

    #[test]
    fn statfs_reply_layout() {
        let (conn, mut kernel_end) = test_pair();
        let req = StatfsRequest {
            header: Header {
                len: 40,
                opcode: 17,
                id: RequestId(31),
                node: NodeId(1),
                uid: 0,
                gid: 0,
                pid: 0,
            },
        };
        req.respond(&conn, &StatfsResponse {
            blocks: 100,
            bfree: 50,
            bavail: 40,
            files: 10,
            ffree: 5,
            bsize: 4096,
            namelen: 255,
            frsize: 4096,
        });
        let reply = read_reply(&mut kernel_end);
        assert_eq!(reply.len(), OUT_HEADER_SIZE + kernel::STATFS_OUT_SIZE);
        assert_eq!(u64::from_le_bytes(reply[16..24].try_into().unwrap()), 100);
        assert_eq!(u32::from_le_bytes(reply[56..60].try_into().unwrap()), 4096); // bsize
        assert_eq!(u32::from_le_bytes(reply[60..64].try_into().unwrap()), 255); // namelen
    }

    #[test]
    fn empty_reply_for_access() {
        let (conn, mut kernel_end) = test_pair();
        let req = AccessRequest {
            header: Header {
                len: 48,
                opcode: 34,
                id: RequestId(33),
                node: NodeId(2),
                uid: 0,
                gid: 0,
                pid: 0,
            },
            mask: 4,
        };
        req.respond(&conn);
        let reply = read_reply(&mut kernel_end);
        assert_eq!(out_header(&reply), (16, 0, 33));
    }
}
