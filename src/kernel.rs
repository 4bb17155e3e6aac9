//! FUSE kernel wire interface.
//!
//! Numeric descriptors of the protocol spoken over the FUSE device: opcodes,
//! frame sizes and flag bits. Since the kernel driver may be installed
//! independently, the interface is versioned and capabilities are exchanged
//! while serving the initial `INIT` request.
//!
//! All frames are packed and little-endian on every supported platform
//! (Linux, OS X with OSXFUSE, FreeBSD). Nothing in this crate reinterprets
//! struct memory as bytes; encoding and decoding go through explicit
//! little-endian field access, so the constants here describe sizes rather
//! than `#[repr(C)]` layouts.

// The descriptor set is kept complete even where the encoders derive a
// frame's size from its fields.
#![allow(dead_code)]

/// Major version of the protocol these layouts correspond to.
pub const FUSE_KERNEL_VERSION: u32 = 7;

/// Minor version of the protocol these layouts correspond to.
pub const FUSE_KERNEL_MINOR_VERSION: u32 = 8;

/// Node id of the root directory.
pub const FUSE_ROOT_ID: u64 = 1;

/// Size of the header that begins every request.
pub const IN_HEADER_SIZE: usize = 40;

/// Size of the header that begins every response.
pub const OUT_HEADER_SIZE: usize = 16;

/// Size of the fixed-layout attribute block inside attr and entry responses.
#[cfg(not(target_os = "macos"))]
pub const ATTR_SIZE: usize = 80;
#[cfg(target_os = "macos")]
pub const ATTR_SIZE: usize = 96; // crtime and chflags

// Request payload sizes (fixed prefix before any name or data).
pub const INIT_IN_SIZE: usize = 16;
pub const FORGET_IN_SIZE: usize = 8;
#[cfg(not(target_os = "macos"))]
pub const SETATTR_IN_SIZE: usize = 88;
#[cfg(target_os = "macos")]
pub const SETATTR_IN_SIZE: usize = 128; // bkuptime, chgtime, crtime, chflags
pub const LINK_IN_SIZE: usize = 8;
pub const MKNOD_IN_SIZE: usize = 8;
pub const MKDIR_IN_SIZE: usize = 8;
pub const RENAME_IN_SIZE: usize = 8;
pub const OPEN_IN_SIZE: usize = 8;
pub const READ_IN_SIZE: usize = 24;
pub const WRITE_IN_SIZE: usize = 24;
pub const RELEASE_IN_SIZE: usize = 24;
pub const FSYNC_IN_SIZE: usize = 16;
pub const FLUSH_IN_SIZE: usize = 24;
#[cfg(not(target_os = "macos"))]
pub const SETXATTR_IN_SIZE: usize = 8;
#[cfg(target_os = "macos")]
pub const SETXATTR_IN_SIZE: usize = 16; // position within the resource fork
#[cfg(not(target_os = "macos"))]
pub const GETXATTR_IN_SIZE: usize = 8;
#[cfg(target_os = "macos")]
pub const GETXATTR_IN_SIZE: usize = 16;
pub const ACCESS_IN_SIZE: usize = 8;
pub const CREATE_IN_SIZE: usize = 8;
pub const INTERRUPT_IN_SIZE: usize = 8;

// Response payload sizes (not counting the out header).
pub const INIT_OUT_SIZE: usize = 24;
pub const ENTRY_OUT_SIZE: usize = 40 + ATTR_SIZE;
pub const ATTR_OUT_SIZE: usize = 16 + ATTR_SIZE;
pub const OPEN_OUT_SIZE: usize = 16;
pub const WRITE_OUT_SIZE: usize = 8;
pub const STATFS_OUT_SIZE: usize = 80;
pub const GETXATTR_OUT_SIZE: usize = 8;

/// Size of the fixed part of a directory entry; the name follows, padded so
/// the whole entry is a multiple of 8 bytes long.
pub const DIRENT_SIZE: usize = 24;

/// Request kinds the kernel may send.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opcode {
    Lookup = 1,
    Forget = 2, // no reply
    Getattr = 3,
    Setattr = 4,
    Readlink = 5,
    Symlink = 6,
    Mknod = 8,
    Mkdir = 9,
    Unlink = 10,
    Rmdir = 11,
    Rename = 12,
    Link = 13,
    Open = 14,
    Read = 15,
    Write = 16,
    Statfs = 17,
    Release = 18,
    Fsync = 20,
    Setxattr = 21,
    Getxattr = 22,
    Listxattr = 23,
    Removexattr = 24,
    Flush = 25,
    Init = 26,
    Opendir = 27,
    Readdir = 28,
    Releasedir = 29,
    Fsyncdir = 30,
    Getlk = 31,
    Setlk = 32,
    Setlkw = 33,
    Access = 34,
    Create = 35,
    Interrupt = 36, // no reply
    Bmap = 37,
    Destroy = 38,
    // OS X only
    Setvolname = 61,
    Getxtimes = 62,
    Exchange = 63,
}

impl Opcode {
    pub fn from_u32(n: u32) -> Option<Self> {
        match n {
            1 => Some(Opcode::Lookup),
            2 => Some(Opcode::Forget),
            3 => Some(Opcode::Getattr),
            4 => Some(Opcode::Setattr),
            5 => Some(Opcode::Readlink),
            6 => Some(Opcode::Symlink),
            8 => Some(Opcode::Mknod),
            9 => Some(Opcode::Mkdir),
            10 => Some(Opcode::Unlink),
            11 => Some(Opcode::Rmdir),
            12 => Some(Opcode::Rename),
            13 => Some(Opcode::Link),
            14 => Some(Opcode::Open),
            15 => Some(Opcode::Read),
            16 => Some(Opcode::Write),
            17 => Some(Opcode::Statfs),
            18 => Some(Opcode::Release),
            20 => Some(Opcode::Fsync),
            21 => Some(Opcode::Setxattr),
            22 => Some(Opcode::Getxattr),
            23 => Some(Opcode::Listxattr),
            24 => Some(Opcode::Removexattr),
            25 => Some(Opcode::Flush),
            26 => Some(Opcode::Init),
            27 => Some(Opcode::Opendir),
            28 => Some(Opcode::Readdir),
            29 => Some(Opcode::Releasedir),
            30 => Some(Opcode::Fsyncdir),
            31 => Some(Opcode::Getlk),
            32 => Some(Opcode::Setlk),
            33 => Some(Opcode::Setlkw),
            34 => Some(Opcode::Access),
            35 => Some(Opcode::Create),
            36 => Some(Opcode::Interrupt),
            37 => Some(Opcode::Bmap),
            38 => Some(Opcode::Destroy),
            61 => Some(Opcode::Setvolname),
            62 => Some(Opcode::Getxtimes),
            63 => Some(Opcode::Exchange),
            _ => None,
        }
    }
}

pub mod consts {
    // Bitmasks for the setattr valid field
    pub const FATTR_MODE: u32 = 1 << 0;
    pub const FATTR_UID: u32 = 1 << 1;
    pub const FATTR_GID: u32 = 1 << 2;
    pub const FATTR_SIZE: u32 = 1 << 3;
    pub const FATTR_ATIME: u32 = 1 << 4;
    pub const FATTR_MTIME: u32 = 1 << 5;
    pub const FATTR_FH: u32 = 1 << 6;
    pub const FATTR_ATIME_NOW: u32 = 1 << 7;
    pub const FATTR_MTIME_NOW: u32 = 1 << 8;
    pub const FATTR_LOCKOWNER: u32 = 1 << 9;
    #[cfg(target_os = "macos")]
    pub const FATTR_CRTIME: u32 = 1 << 28;
    #[cfg(target_os = "macos")]
    pub const FATTR_CHGTIME: u32 = 1 << 29;
    #[cfg(target_os = "macos")]
    pub const FATTR_BKUPTIME: u32 = 1 << 30;
    #[cfg(target_os = "macos")]
    pub const FATTR_FLAGS: u32 = 1 << 31;

    // Flags returned in an open response
    pub const FOPEN_DIRECT_IO: u32 = 1 << 0; // bypass page cache for this open file
    pub const FOPEN_KEEP_CACHE: u32 = 1 << 1; // don't invalidate the data cache on open
    #[cfg(target_os = "macos")]
    pub const FOPEN_PURGE_ATTR: u32 = 1 << 30;
    #[cfg(target_os = "macos")]
    pub const FOPEN_PURGE_UBC: u32 = 1 << 31;

    // Init request/reply flags
    pub const FUSE_ASYNC_READ: u32 = 1 << 0; // asynchronous read requests
    pub const FUSE_POSIX_LOCKS: u32 = 1 << 1; // remote locking for POSIX file locks
    pub const FUSE_ATOMIC_O_TRUNC: u32 = 1 << 3; // handles the O_TRUNC open flag
    pub const FUSE_BIG_WRITES: u32 = 1 << 5; // write size larger than 4kB
    pub const FUSE_DONT_MASK: u32 = 1 << 6; // don't apply umask to modes on create
    #[cfg(target_os = "macos")]
    pub const FUSE_CASE_INSENSITIVE: u32 = 1 << 29;
    #[cfg(target_os = "macos")]
    pub const FUSE_VOL_RENAME: u32 = 1 << 30;
    #[cfg(target_os = "macos")]
    pub const FUSE_XTIMES: u32 = 1 << 31;

    // Release flags
    pub const FUSE_RELEASE_FLUSH: u32 = 1 << 0;

    // Fsync flags
    pub const FUSE_FSYNC_FDATASYNC: u32 = 1 << 0; // sync data only, not metadata
}
