//! File attributes and mode mapping.
//!
//! The kernel speaks Unix `S_IF*` mode words; the library side uses an
//! OS-independent representation so servers never touch raw mode bits. The
//! mapping is bidirectional: inbound modes are split into type, permission
//! and setuid/setgid flags, and outbound modes are rebuilt with exactly one
//! type bit set.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use libc::{S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT, S_IFREG, S_IFSOCK, S_ISGID,
           S_ISUID};

/// File type.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FileType {
    /// Named pipe (`S_IFIFO`).
    NamedPipe,
    /// Character device (`S_IFCHR`).
    CharDevice,
    /// Directory (`S_IFDIR`).
    Directory,
    /// Block device (`S_IFBLK`).
    BlockDevice,
    /// Regular file (`S_IFREG`).
    RegularFile,
    /// Symbolic link (`S_IFLNK`).
    Symlink,
    /// Unix domain socket (`S_IFSOCK`).
    Socket,
}

/// OS-independent file mode: type, permission bits and the set-id flags.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Mode {
    /// Type of the file.
    pub file_type: FileType,
    /// Permission bits (the low 9 bits of the Unix mode).
    pub perm: u16,
    /// Set-user-id bit.
    pub setuid: bool,
    /// Set-group-id bit.
    pub setgid: bool,
}

impl Mode {
    /// A mode with the given type and permissions and no set-id bits.
    pub fn new(file_type: FileType, perm: u16) -> Mode {
        Mode { file_type, perm, setuid: false, setgid: false }
    }

    /// Splits a Unix mode word as sent by the kernel.
    ///
    /// A mode whose `S_IFMT` nibble matches none of the known types is
    /// treated as a device; the kernel should not send such modes, but we do
    /// not trust it to hand us well-formed data.
    pub fn from_unix(mode: u32) -> Mode {
        let file_type = match mode & S_IFMT as u32 {
            t if t == S_IFREG as u32 => FileType::RegularFile,
            t if t == S_IFDIR as u32 => FileType::Directory,
            t if t == S_IFCHR as u32 => FileType::CharDevice,
            t if t == S_IFBLK as u32 => FileType::BlockDevice,
            t if t == S_IFIFO as u32 => FileType::NamedPipe,
            t if t == S_IFLNK as u32 => FileType::Symlink,
            t if t == S_IFSOCK as u32 => FileType::Socket,
            _ => FileType::BlockDevice,
        };
        Mode {
            file_type,
            perm: (mode & 0o777) as u16,
            setuid: mode & S_ISUID as u32 != 0,
            setgid: mode & S_ISGID as u32 != 0,
        }
    }

    /// Rebuilds the Unix mode word for transmission to the kernel.
    pub fn to_unix(self) -> u32 {
        let type_bits = match self.file_type {
            FileType::RegularFile => S_IFREG,
            FileType::Directory => S_IFDIR,
            FileType::CharDevice => S_IFCHR,
            FileType::BlockDevice => S_IFBLK,
            FileType::NamedPipe => S_IFIFO,
            FileType::Symlink => S_IFLNK,
            FileType::Socket => S_IFSOCK,
        };
        let mut mode = type_bits as u32 | (self.perm & 0o777) as u32;
        if self.setuid {
            mode |= S_ISUID as u32;
        }
        if self.setgid {
            mode |= S_ISGID as u32;
        }
        mode
    }
}

/// Metadata for a single file or directory.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Attr {
    /// Inode number.
    pub inode: u64,
    /// Size in bytes.
    pub size: u64,
    /// Size in blocks.
    pub blocks: u64,
    /// Time of last access.
    pub atime: SystemTime,
    /// Time of last modification.
    pub mtime: SystemTime,
    /// Time of last inode change.
    pub ctime: SystemTime,
    /// Time of creation. Only transmitted on OS X.
    pub crtime: SystemTime,
    /// File mode.
    pub mode: Mode,
    /// Number of hard links.
    pub nlink: u32,
    /// Owner uid.
    pub uid: u32,
    /// Group gid.
    pub gid: u32,
    /// Device numbers.
    pub rdev: u32,
    /// chflags(2) flags. Only transmitted on OS X.
    pub flags: u32,
}

impl Attr {
    /// Appends the wire form of the attribute block to a reply body.
    pub(crate) fn encode(&self, buf: &mut Vec<u8>) {
        let (atime, atime_nsec) = time_parts(self.atime);
        let (mtime, mtime_nsec) = time_parts(self.mtime);
        let (ctime, ctime_nsec) = time_parts(self.ctime);
        buf.extend_from_slice(&self.inode.to_le_bytes());
        buf.extend_from_slice(&self.size.to_le_bytes());
        buf.extend_from_slice(&self.blocks.to_le_bytes());
        buf.extend_from_slice(&atime.to_le_bytes());
        buf.extend_from_slice(&mtime.to_le_bytes());
        buf.extend_from_slice(&ctime.to_le_bytes());
        #[cfg(target_os = "macos")]
        {
            let (crtime, crtime_nsec) = time_parts(self.crtime);
            buf.extend_from_slice(&crtime.to_le_bytes());
            buf.extend_from_slice(&atime_nsec.to_le_bytes());
            buf.extend_from_slice(&mtime_nsec.to_le_bytes());
            buf.extend_from_slice(&ctime_nsec.to_le_bytes());
            buf.extend_from_slice(&crtime_nsec.to_le_bytes());
        }
        #[cfg(not(target_os = "macos"))]
        {
            buf.extend_from_slice(&atime_nsec.to_le_bytes());
            buf.extend_from_slice(&mtime_nsec.to_le_bytes());
            buf.extend_from_slice(&ctime_nsec.to_le_bytes());
        }
        buf.extend_from_slice(&self.mode.to_unix().to_le_bytes());
        buf.extend_from_slice(&self.nlink.to_le_bytes());
        buf.extend_from_slice(&self.uid.to_le_bytes());
        buf.extend_from_slice(&self.gid.to_le_bytes());
        buf.extend_from_slice(&self.rdev.to_le_bytes());
        #[cfg(target_os = "macos")]
        buf.extend_from_slice(&self.flags.to_le_bytes());
    }
}

/// Splits a timestamp into the `(seconds, nanoseconds)` pair the wire wants.
/// Timestamps before the epoch are clamped to it.
pub(crate) fn time_parts(t: SystemTime) -> (u64, u32) {
    let d = t.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
    (d.as_secs(), d.subsec_nanos())
}

/// Splits a cache-validity duration the same way.
pub(crate) fn duration_parts(d: Duration) -> (u64, u32) {
    (d.as_secs(), d.subsec_nanos())
}

/// Rebuilds a timestamp from the wire pair.
pub(crate) fn time_from_parts(secs: u64, nanos: u32) -> SystemTime {
    UNIX_EPOCH + Duration::new(secs, nanos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::ATTR_SIZE;

    const ALL_TYPES: [FileType; 7] = [
        FileType::NamedPipe,
        FileType::CharDevice,
        FileType::Directory,
        FileType::BlockDevice,
        FileType::RegularFile,
        FileType::Symlink,
        FileType::Socket,
    ];

    #[test]
    fn mode_round_trip() {
        for &file_type in &ALL_TYPES {
            for perm in 0o000..=0o777 {
                for &(setuid, setgid) in &[(false, false), (true, false), (false, true), (true, true)] {
                    let mode = Mode { file_type, perm, setuid, setgid };
                    assert_eq!(Mode::from_unix(mode.to_unix()), mode);
                }
            }
        }
    }

    #[test]
    fn exactly_one_type_bit() {
        let type_masks: [u32; 7] = [
            S_IFIFO as u32,
            S_IFCHR as u32,
            S_IFDIR as u32,
            S_IFBLK as u32,
            S_IFREG as u32,
            S_IFLNK as u32,
            S_IFSOCK as u32,
        ];
        for &file_type in &ALL_TYPES {
            let unix = Mode::new(file_type, 0o644).to_unix();
            let matches = type_masks.iter().filter(|&&m| unix & S_IFMT as u32 == m).count();
            assert_eq!(matches, 1, "{:?} encoded as {:#o}", file_type, unix);
        }
    }

    #[test]
    fn unknown_type_defaults_to_device() {
        let mode = Mode::from_unix(0o777);
        assert_eq!(mode.file_type, FileType::BlockDevice);
        assert_eq!(mode.perm, 0o777);
    }

    #[test]
    fn time_conversion_uses_nanoseconds() {
        let t = time_from_parts(1_234_567, 987_654_321);
        assert_eq!(time_parts(t), (1_234_567, 987_654_321));
        let before_epoch = UNIX_EPOCH - Duration::from_secs(1);
        assert_eq!(time_parts(before_epoch), (0, 0));
    }

    #[test]
    fn encoded_attr_has_wire_size() {
        let attr = Attr {
            inode: 2,
            size: 4096,
            blocks: 8,
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
            crtime: UNIX_EPOCH,
            mode: Mode::new(FileType::Directory, 0o755),
            nlink: 2,
            uid: 0,
            gid: 0,
            rdev: 0,
            flags: 0,
        };
        let mut buf = Vec::new();
        attr.encode(&mut buf);
        assert_eq!(buf.len(), ATTR_SIZE);
    }
}
