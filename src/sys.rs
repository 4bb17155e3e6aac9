//! FFI declarations for the libfuse mount helpers.
//!
//! Only mounting and unmounting go through libfuse (or osxfuse). All protocol
//! traffic is spoken directly on the device descriptor these helpers return.

#![allow(non_camel_case_types)]

use libc::{c_char, c_int};

/// Argument list handed to the libfuse mount helpers, mirroring `struct
/// fuse_args` from `fuse_opt.h`.
#[repr(C)]
#[derive(Debug)]
pub struct fuse_args {
    pub argc: c_int,
    pub argv: *const *const c_char,
    pub allocated: c_int,
}

extern "C" {
    /// Mounts a FUSE filesystem at the given path and returns the device
    /// descriptor, or a negative value on failure.
    pub fn fuse_mount_compat25(mountpoint: *const c_char, args: *const fuse_args) -> c_int;

    /// Unmounts the filesystem at the given path via the setuid helper.
    pub fn fuse_unmount_compat22(mountpoint: *const c_char);
}
