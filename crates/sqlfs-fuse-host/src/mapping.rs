// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Translation between kernel-facing values and core types

use libc::{EEXIST, EINVAL, EIO, EISDIR, ENAMETOOLONG, ENOENT, ENOSYS, ENOTDIR, c_int};
use sqlfs_core::{FsError, Inode};
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;

/// Inode number the kernel uses for the mount root
pub const KERNEL_ROOT_INO: u64 = 1;

/// Maximum single path component length
pub const NAME_MAX: usize = 255;

/// Bijection between store inodes and kernel inode numbers
///
/// The root descriptor is presented as [`KERNEL_ROOT_INO`]; whichever store
/// inode already holds that number takes the root's store inode instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InodeMap {
    root: u64,
}

impl InodeMap {
    pub fn new(root: Inode) -> Self {
        Self { root: root.as_u64() }
    }

    fn swap(&self, ino: u64) -> u64 {
        if ino == self.root {
            KERNEL_ROOT_INO
        } else if ino == KERNEL_ROOT_INO {
            self.root
        } else {
            ino
        }
    }

    pub fn to_kernel(&self, inode: Inode) -> u64 {
        self.swap(inode.as_u64())
    }

    pub fn to_store(&self, ino: u64) -> Inode {
        Inode(self.swap(ino))
    }
}

pub fn errno_for(err: &FsError) -> c_int {
    match err {
        FsError::NotFound | FsError::RootNotFound(_) | FsError::PreconditionFailed(_) => ENOENT,
        FsError::AlreadyExists => EEXIST,
        FsError::NotADirectory => ENOTDIR,
        FsError::IsADirectory => EISDIR,
        FsError::InvalidName(_) => EINVAL,
        FsError::UnsupportedBackend(_) => ENOSYS,
        FsError::Io(e) => e.raw_os_error().unwrap_or(EIO),
        FsError::ContentMissing(_) | FsError::Storage(_) => EIO,
    }
}

/// Validate a single path component handed over by the kernel
pub fn component_name(name: &OsStr) -> Result<&str, c_int> {
    if name.as_bytes().len() > NAME_MAX {
        return Err(ENAMETOOLONG);
    }
    name.to_str().ok_or(EINVAL)
}
