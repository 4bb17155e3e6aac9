//! Directory entry encoding for readdir replies.
//!
//! The kernel expects a readdir payload to be a sequence of fixed-header
//! entries, each padded so the next one starts on an 8-byte boundary. The
//! buffer is owned by the server; [`append_dirent`] only ever appends.

use std::ffi::OsString;
use std::os::unix::ffi::OsStrExt;

use crate::kernel::DIRENT_SIZE;

/// Type tag of a directory entry, in the kernel's `S_IF* >> 12` encoding.
///
/// `Unknown` is a valid value: the kernel will issue a getattr when it needs
/// the real type. Providing a type can speed up directory listings.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum DirentType {
    Unknown = 0,
    NamedPipe = 0o010_000 >> 12,
    CharDevice = 0o020_000 >> 12,
    Directory = 0o040_000 >> 12,
    BlockDevice = 0o060_000 >> 12,
    RegularFile = 0o100_000 >> 12,
    Symlink = 0o120_000 >> 12,
    Socket = 0o140_000 >> 12,
}

impl From<crate::FileType> for DirentType {
    fn from(t: crate::FileType) -> Self {
        use crate::FileType;
        match t {
            FileType::NamedPipe => DirentType::NamedPipe,
            FileType::CharDevice => DirentType::CharDevice,
            FileType::Directory => DirentType::Directory,
            FileType::BlockDevice => DirentType::BlockDevice,
            FileType::RegularFile => DirentType::RegularFile,
            FileType::Symlink => DirentType::Symlink,
            FileType::Socket => DirentType::Socket,
        }
    }
}

/// A single directory entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Dirent {
    /// Inode this entry names.
    pub inode: u64,
    /// Type of the entry.
    pub typ: DirentType,
    /// Name of the entry.
    pub name: OsString,
}

/// Appends the encoded form of a directory entry to `data`.
///
/// The entry's `off` field holds the byte offset of the *next* entry within
/// the buffer, which the kernel echoes back as the offset of a subsequent
/// readdir request.
pub fn append_dirent(data: &mut Vec<u8>, dirent: &Dirent) {
    let name = dirent.name.as_os_str().as_bytes();
    let padded_name_len = (name.len() + 7) & !7;
    let next_off = (data.len() + DIRENT_SIZE + padded_name_len) as u64;
    data.extend_from_slice(&dirent.inode.to_le_bytes());
    data.extend_from_slice(&next_off.to_le_bytes());
    data.extend_from_slice(&(name.len() as u32).to_le_bytes());
    data.extend_from_slice(&(dirent.typ as u32).to_le_bytes());
    data.extend_from_slice(name);
    data.resize(data.len() + padded_name_len - name.len(), 0);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(data: &[u8]) -> Vec<(u64, u64, u32, Vec<u8>)> {
        let mut entries = Vec::new();
        let mut pos = 0;
        while pos < data.len() {
            let ino = u64::from_le_bytes(data[pos..pos + 8].try_into().unwrap());
            let off = u64::from_le_bytes(data[pos + 8..pos + 16].try_into().unwrap());
            let namelen = u32::from_le_bytes(data[pos + 16..pos + 20].try_into().unwrap()) as usize;
            let typ = u32::from_le_bytes(data[pos + 20..pos + 24].try_into().unwrap());
            let name = data[pos + 24..pos + 24 + namelen].to_vec();
            entries.push((ino, off, typ, name));
            pos += DIRENT_SIZE + ((namelen + 7) & !7);
        }
        entries
    }

    #[test]
    fn two_entries() {
        let mut buf = Vec::new();
        append_dirent(&mut buf, &Dirent { inode: 2, typ: DirentType::Directory, name: "a".into() });
        append_dirent(&mut buf, &Dirent { inode: 3, typ: DirentType::RegularFile, name: "bb".into() });
        assert_eq!(buf.len(), 64);
        let entries = parse(&buf);
        assert_eq!(entries[0], (2, 32, 4, b"a".to_vec()));
        assert_eq!(entries[1], (3, 64, 8, b"bb".to_vec()));
    }

    #[test]
    fn round_trip_sequence() {
        let names: [&str; 5] = ["x", "name.rs", "12345678", "a-rather-longer-entry-name", ".."];
        let mut buf = Vec::new();
        let mut offsets = Vec::new();
        for (i, name) in names.iter().enumerate() {
            offsets.push(buf.len());
            append_dirent(&mut buf, &Dirent {
                inode: i as u64 + 1,
                typ: DirentType::RegularFile,
                name: (*name).into(),
            });
        }
        // Every entry starts on an 8-byte boundary
        for off in &offsets {
            assert_eq!(off % 8, 0);
        }
        let entries = parse(&buf);
        assert_eq!(entries.len(), names.len());
        for (i, (ino, off, typ, name)) in entries.iter().enumerate() {
            assert_eq!(*ino, i as u64 + 1);
            assert_eq!(*typ, DirentType::RegularFile as u32);
            assert_eq!(name, names[i].as_bytes());
            // off points at the start of the next entry
            let next = offsets.get(i + 1).copied().unwrap_or(buf.len());
            assert_eq!(*off, next as u64);
        }
    }

    #[test]
    fn unknown_type_serializes_as_zero() {
        let mut buf = Vec::new();
        append_dirent(&mut buf, &Dirent { inode: 9, typ: DirentType::Unknown, name: "e".into() });
        assert_eq!(u32::from_le_bytes(buf[20..24].try_into().unwrap()), 0);
    }

    #[test]
    fn eight_byte_name_gets_no_padding() {
        let mut buf = Vec::new();
        append_dirent(&mut buf, &Dirent { inode: 1, typ: DirentType::Directory, name: "exactly8".into() });
        assert_eq!(buf.len(), DIRENT_SIZE + 8);
    }
}
