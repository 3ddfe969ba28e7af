// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Core type definitions for SQLFS
//!
//! A [`Descriptor`] is one row of the node table. The tree is encoded through
//! the optional `parent` column; the single parent-less row named
//! [`ROOT_NAME`] is the root directory.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Name of the unique root descriptor, matched literally during root resolution
pub const ROOT_NAME: &str = "/";

/// File type constants for the mode field
pub mod mode {
    pub const S_IFMT: u32 = 0o170000; // File type mask
    pub const S_IFREG: u32 = 0o100000; // Regular file
    pub const S_IFDIR: u32 = 0o040000; // Directory

    /// Permission bits carried by a descriptor
    pub const PERMISSION_MASK: u32 = 0o777;
}

/// Server-assigned descriptor identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Inode(pub u64);

impl Inode {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Inode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of a descriptor row
///
/// The declaration order matters: directories sort before files, matching the
/// `ORDER BY type, name` listing order of the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DescriptorType {
    Dir,
    File,
}

impl DescriptorType {
    /// Value stored in the `type` column
    pub fn as_str(&self) -> &'static str {
        match self {
            DescriptorType::Dir => "DIR",
            DescriptorType::File => "FILE",
        }
    }

    /// Type bit of the POSIX mode
    pub fn mode_bits(&self) -> u32 {
        match self {
            DescriptorType::Dir => mode::S_IFDIR,
            DescriptorType::File => mode::S_IFREG,
        }
    }
}

impl fmt::Display for DescriptorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DescriptorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DIR" => Ok(DescriptorType::Dir),
            "FILE" => Ok(DescriptorType::File),
            other => Err(format!("unknown descriptor type: {other}")),
        }
    }
}

/// 9-bit permission mode (rwxrwxrwx)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permission(u32);

impl Permission {
    pub const fn new(bits: u32) -> Self {
        Self(bits & mode::PERMISSION_MASK)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04o}", self.0)
    }
}

/// Permission given to directories created through the adapter (rwxr-xr-x)
pub const DEFAULT_DIR_PERMISSION: Permission = Permission::new(0o755);

/// Permission given to files created through the adapter (rw-r--r--)
pub const DEFAULT_FILE_PERMISSION: Permission = Permission::new(0o644);

/// Attributes supplied when a descriptor is created
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorAttrs {
    pub size: u64,
    pub permission: Permission,
    pub uid: u32,
    pub gid: u32,
}

impl DescriptorAttrs {
    /// Defaults for a new descriptor of `kind` owned by `uid:gid`
    pub fn defaults_for(kind: DescriptorType, uid: u32, gid: u32) -> Self {
        let permission = match kind {
            DescriptorType::Dir => DEFAULT_DIR_PERMISSION,
            DescriptorType::File => DEFAULT_FILE_PERMISSION,
        };
        Self {
            size: 0,
            permission,
            uid,
            gid,
        }
    }
}

/// One node-table row
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub inode: Inode,
    pub parent: Option<Inode>,
    pub name: String,
    pub kind: DescriptorType,
    pub attrs: DescriptorAttrs,
}

impl Descriptor {
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn is_dir(&self) -> bool {
        self.kind == DescriptorType::Dir
    }

    pub fn is_file(&self) -> bool {
        self.kind == DescriptorType::File
    }

    pub fn size(&self) -> u64 {
        self.attrs.size
    }

    /// Full POSIX mode: type bit | permission
    pub fn mode(&self) -> u32 {
        self.kind.mode_bits() | self.attrs.permission.bits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirs_order_before_files() {
        assert!(DescriptorType::Dir < DescriptorType::File);
        assert!(DescriptorType::Dir.as_str() < DescriptorType::File.as_str());
    }

    #[test]
    fn descriptor_type_round_trips_through_column_value() {
        for kind in [DescriptorType::Dir, DescriptorType::File] {
            assert_eq!(kind.as_str().parse::<DescriptorType>().unwrap(), kind);
        }
        assert!("LINK".parse::<DescriptorType>().is_err());
    }

    #[test]
    fn permission_is_masked_to_nine_bits() {
        assert_eq!(Permission::new(0o4755).bits(), 0o755);
        assert_eq!(Permission::new(0o644).to_string(), "0644");
    }

    #[test]
    fn mode_combines_type_and_permission() {
        let descriptor = Descriptor {
            inode: Inode(7),
            parent: Some(Inode(1)),
            name: "notes".into(),
            kind: DescriptorType::File,
            attrs: DescriptorAttrs::defaults_for(DescriptorType::File, 1000, 1000),
        };
        assert_eq!(descriptor.mode(), mode::S_IFREG | 0o644);
        assert!(!descriptor.is_root());
        assert_eq!(descriptor.size(), 0);
    }

    #[test]
    fn creation_defaults() {
        let dir = DescriptorAttrs::defaults_for(DescriptorType::Dir, 1, 2);
        assert_eq!(dir.permission, DEFAULT_DIR_PERMISSION);
        assert_eq!((dir.size, dir.uid, dir.gid), (0, 1, 2));
        let file = DescriptorAttrs::defaults_for(DescriptorType::File, 1, 2);
        assert_eq!(file.permission.bits(), 0o644);
    }
}
