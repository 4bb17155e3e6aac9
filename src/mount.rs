//! Mounting and mount options.
//!
//! Mount options are applied in order to a configuration and may fail
//! independently, before anything touches the kernel. The platform mount
//! helper (libfuse's compat entry points, the OSXFUSE kext, FreeBSD's
//! mount_fusefs) then delivers the device descriptor the [`Connection`] is
//! built around. Option keys this module does not validate are still passed
//! through; the helper rejects ones it does not know, failing the mount.

use std::collections::BTreeMap;
use std::io;

#[cfg(feature = "libfuse")]
use std::ffi::CString;
#[cfg(feature = "libfuse")]
use std::os::fd::{FromRawFd, OwnedFd};
#[cfg(feature = "libfuse")]
use std::os::unix::ffi::OsStrExt;
#[cfg(feature = "libfuse")]
use std::path::Path;
#[cfg(feature = "libfuse")]
use std::sync::mpsc;

#[cfg(feature = "libfuse")]
use log::info;

#[cfg(feature = "libfuse")]
use crate::connection::Connection;
#[cfg(feature = "libfuse")]
use crate::error::Error;
#[cfg(feature = "libfuse")]
use crate::sys;

/// A configuration option for a mount.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MountOption {
    /// Mount the filesystem read-only.
    ReadOnly,
    /// Allow other users to access the filesystem.
    AllowOther,
    /// Allow root to access the filesystem. Conflicts with `AllowOther`.
    AllowRoot,
    /// Have the kernel enforce access control based on the file modes the
    /// filesystem reports.
    DefaultPermissions,
    /// Name of the filesystem as shown in the mount table.
    FsName(String),
    /// Subtype of the filesystem type (shown as `fuse.<subtype>`).
    Subtype(String),
    /// Volume name shown in the Finder. Only supported on OS X.
    VolumeName(String),
    /// Any other `key=value` option, passed through to the mount helper.
    Opt(String, String),
    /// Any other flag option, passed through to the mount helper.
    Flag(String),
}

fn invalid(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, message)
}

/// Option values cannot be escaped in the `-o` string, so separators are
/// rejected outright.
fn check_token(kind: &str, token: &str, allow_eq: bool) -> io::Result<()> {
    if token.contains(',') || token.contains('\0') || (!allow_eq && token.contains('=')) {
        return Err(invalid(format!("invalid character in mount {}: {:?}", kind, token)));
    }
    Ok(())
}

/// Accumulated mount configuration.
#[derive(Debug, Default)]
pub(crate) struct MountConfig {
    options: BTreeMap<String, Option<String>>,
}

impl MountConfig {
    pub(crate) fn apply(&mut self, option: &MountOption) -> io::Result<()> {
        match option {
            MountOption::ReadOnly => self.flag("ro"),
            MountOption::AllowOther => {
                if self.options.contains_key("allow_root") {
                    return Err(invalid(
                        "cannot set both allow_other and allow_root".to_string(),
                    ));
                }
                self.flag("allow_other")
            }
            MountOption::AllowRoot => {
                if self.options.contains_key("allow_other") {
                    return Err(invalid(
                        "cannot set both allow_other and allow_root".to_string(),
                    ));
                }
                self.flag("allow_root")
            }
            MountOption::DefaultPermissions => self.flag("default_permissions"),
            MountOption::FsName(name) => self.opt("fsname", name)?,
            MountOption::Subtype(subtype) => self.opt("subtype", subtype)?,
            #[cfg(target_os = "macos")]
            MountOption::VolumeName(name) => self.opt("volname", name)?,
            #[cfg(not(target_os = "macos"))]
            MountOption::VolumeName(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "volume names are only supported on OS X",
                ));
            }
            MountOption::Opt(key, value) => {
                check_token("option", key, false)?;
                self.opt(key, value)?;
            }
            MountOption::Flag(key) => {
                check_token("option", key, false)?;
                self.flag(key);
            }
        }
        Ok(())
    }

    fn flag(&mut self, key: &str) {
        self.options.insert(key.to_string(), None);
    }

    fn opt(&mut self, key: &str, value: &str) -> io::Result<()> {
        check_token("value", value, true)?;
        self.options.insert(key.to_string(), Some(value.to_string()));
        Ok(())
    }

    /// The `-o` argument for the mount helper, or `None` with no options.
    pub(crate) fn option_string(&self) -> Option<String> {
        if self.options.is_empty() {
            return None;
        }
        let rendered: Vec<String> = self
            .options
            .iter()
            .map(|(key, value)| match value {
                Some(value) => format!("{}={}", key, value),
                None => key.clone(),
            })
            .collect();
        Some(rendered.join(","))
    }
}

/// Mounts a new FUSE connection on the named directory and returns the
/// connection for reading requests and writing responses.
///
/// Even on successful return the new mount is not guaranteed to be visible
/// until [`Connection::ready`] returns. Incoming requests must be served for
/// the mount to make progress.
#[cfg(feature = "libfuse")]
pub fn mount<P: AsRef<Path>>(mountpoint: P, options: &[MountOption]) -> Result<Connection, Error> {
    let mountpoint = mountpoint.as_ref().canonicalize().map_err(Error::Io)?;
    let mut config = MountConfig::default();
    for option in options {
        config.apply(option).map_err(Error::Io)?;
    }

    // The mount helper takes an argv-style option list.
    let mut args = vec![CString::new("fusewire").unwrap()];
    if let Some(opts) = config.option_string() {
        args.push(CString::new("-o").unwrap());
        args.push(CString::new(opts).map_err(|_| Error::Io(invalid("NUL in options".into())))?);
    }
    let argv: Vec<_> = args.iter().map(|arg| arg.as_ptr()).collect();
    let fuse_args = sys::fuse_args {
        argc: argv.len() as libc::c_int,
        argv: argv.as_ptr(),
        allocated: 0,
    };

    let path = CString::new(mountpoint.as_os_str().as_bytes())
        .map_err(|_| Error::Io(invalid("NUL in mount point".into())))?;
    info!("mounting {}", mountpoint.display());
    let fd = unsafe { sys::fuse_mount_compat25(path.as_ptr(), &fuse_args) };
    if fd < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }

    let (ready_tx, ready_rx) = mpsc::channel();
    let conn = Connection::new_mounting(unsafe { OwnedFd::from_raw_fd(fd) }, ready_rx);
    // The compat25 helper completes the mount before returning, so the
    // finisher has nothing left to report.
    drop(ready_tx);
    Ok(conn)
}

/// Unmounts the filesystem at the given mount point.
///
/// The kernel typically asks the filesystem to sync one last time and sends
/// the final destroy request before the device reports end-of-stream.
#[cfg(feature = "libfuse")]
pub fn unmount<P: AsRef<Path>>(mountpoint: P) -> Result<(), Error> {
    let mountpoint = mountpoint.as_ref();
    info!("unmounting {}", mountpoint.display());

    // On macOS and the BSDs a plain unmount(2) does the job.
    #[cfg(any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "dragonfly",
        target_os = "openbsd",
        target_os = "netbsd"
    ))]
    #[inline]
    fn syscall_unmount(path: &std::ffi::CStr) -> libc::c_int {
        unsafe { libc::unmount(path.as_ptr(), 0) }
    }

    // On Linux umount(2) always fails with EPERM for non-root users; fall
    // back to the setuid fusermount helper through libfuse.
    #[cfg(not(any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "dragonfly",
        target_os = "openbsd",
        target_os = "netbsd"
    )))]
    #[inline]
    fn syscall_unmount(path: &std::ffi::CStr) -> libc::c_int {
        let rc = unsafe { libc::umount(path.as_ptr()) };
        if rc < 0 && io::Error::last_os_error().kind() == io::ErrorKind::PermissionDenied {
            unsafe { sys::fuse_unmount_compat22(path.as_ptr()) };
            return 0;
        }
        rc
    }

    let path = CString::new(mountpoint.as_os_str().as_bytes())
        .map_err(|_| Error::Io(invalid("NUL in mount point".into())))?;
    if syscall_unmount(&path) < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(())
}
