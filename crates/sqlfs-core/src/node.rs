// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Node adapter
//!
//! Turns host callbacks into descriptor and content store calls. A [`Node`]
//! carries the descriptor snapshot from the call that produced it; attribute
//! queries answer from that snapshot without going back to the store.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::content::{read_range, ContentStore};
use crate::descriptors::DescriptorStore;
use crate::error::{FsError, FsResult};
use crate::executor::Executor;
use crate::types::{Descriptor, DescriptorAttrs, DescriptorType, Inode, Permission, ROOT_NAME};

/// A resolved descriptor, tagged by kind
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Node {
    Directory(Descriptor),
    File(Descriptor),
}

impl Node {
    pub fn from_descriptor(descriptor: Descriptor) -> Self {
        match descriptor.kind {
            DescriptorType::Dir => Node::Directory(descriptor),
            DescriptorType::File => Node::File(descriptor),
        }
    }

    pub fn descriptor(&self) -> &Descriptor {
        match self {
            Node::Directory(d) | Node::File(d) => d,
        }
    }

    pub fn inode(&self) -> Inode {
        self.descriptor().inode
    }

    pub fn kind(&self) -> DescriptorType {
        self.descriptor().kind
    }

    pub fn is_root(&self) -> bool {
        matches!(self, Node::Directory(d) if d.is_root())
    }

    fn as_directory(&self) -> FsResult<&Descriptor> {
        match self {
            Node::Directory(d) => Ok(d),
            Node::File(_) => Err(FsError::NotADirectory),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeAttributes {
    pub inode: Inode,
    pub kind: DescriptorType,
    pub permission: Permission,
    /// Type bit | permission
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
}

impl From<&Descriptor> for NodeAttributes {
    fn from(d: &Descriptor) -> Self {
        Self {
            inode: d.inode,
            kind: d.kind,
            permission: d.attrs.permission,
            mode: d.mode(),
            uid: d.attrs.uid,
            gid: d.attrs.gid,
            size: d.attrs.size,
        }
    }
}

/// One listing entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: DescriptorType,
    pub inode: Inode,
}

/// An open file
///
/// Holds the descriptor snapshot taken at open time, refreshed by each write
/// through it. Handles on the same file are independent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileHandle {
    descriptor: Descriptor,
    direct_io: bool,
}

impl FileHandle {
    fn open(descriptor: Descriptor) -> Self {
        Self {
            descriptor,
            direct_io: true,
        }
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub fn inode(&self) -> Inode {
        self.descriptor.inode
    }

    /// Whether the host should bypass its page cache for this handle
    pub fn direct_io(&self) -> bool {
        self.direct_io
    }
}

/// Host capability set over the two stores
#[derive(Clone)]
pub struct NodeAdapter {
    descriptors: DescriptorStore,
    contents: ContentStore,
}

impl NodeAdapter {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            descriptors: DescriptorStore::new(Arc::clone(&executor)),
            contents: ContentStore::new(executor),
        }
    }

    pub fn descriptors(&self) -> &DescriptorStore {
        &self.descriptors
    }

    pub fn contents(&self) -> &ContentStore {
        &self.contents
    }

    /// Resolve the root directory; an unprovisioned store is an error
    pub fn root(&self) -> FsResult<Node> {
        match self.descriptors.find_root()? {
            Some(root) => {
                debug!(target: "sqlfs::node", inode = %root.inode, "root resolved");
                Ok(Node::Directory(root))
            }
            None => {
                warn!(target: "sqlfs::node", "root descriptor not found; is the schema provisioned?");
                Err(FsError::RootNotFound(ROOT_NAME))
            }
        }
    }

    pub fn attributes(&self, node: &Node) -> NodeAttributes {
        NodeAttributes::from(node.descriptor())
    }

    pub fn lookup(&self, dir: &Node, name: &str) -> FsResult<Node> {
        let parent = dir.as_directory()?;
        debug!(target: "sqlfs::node", parent = %parent.inode, name, "lookup");
        self.descriptors
            .find_by_name(parent.inode, name)?
            .map(Node::from_descriptor)
            .ok_or(FsError::NotFound)
    }

    pub fn list_children(&self, dir: &Node) -> FsResult<Vec<DirEntry>> {
        let parent = dir.as_directory()?;
        debug!(target: "sqlfs::node", parent = %parent.inode, "list children");
        Ok(self
            .descriptors
            .find_children(parent.inode)?
            .into_iter()
            .map(|d| DirEntry {
                name: d.name,
                kind: d.kind,
                inode: d.inode,
            })
            .collect())
    }

    pub fn make_directory(&self, dir: &Node, name: &str, uid: u32, gid: u32) -> FsResult<Node> {
        let descriptor = self.create_entry(dir, name, DescriptorType::Dir, uid, gid)?;
        Ok(Node::Directory(descriptor))
    }

    /// Create an empty file and open it
    pub fn make_file(&self, dir: &Node, name: &str, uid: u32, gid: u32) -> FsResult<(Node, FileHandle)> {
        let descriptor = self.create_entry(dir, name, DescriptorType::File, uid, gid)?;
        let handle = FileHandle::open(descriptor.clone());
        Ok((Node::File(descriptor), handle))
    }

    fn create_entry(
        &self,
        dir: &Node,
        name: &str,
        kind: DescriptorType,
        uid: u32,
        gid: u32,
    ) -> FsResult<Descriptor> {
        let parent = dir.as_directory()?;
        validate_name(name)?;
        debug!(target: "sqlfs::node", parent = %parent.inode, name, kind = %kind, uid, gid, "create");

        // Fast path only; the insert itself settles races
        if self.descriptors.exists(parent.inode, name)? {
            return Err(FsError::AlreadyExists);
        }
        self.descriptors
            .create(parent.inode, name, kind, DescriptorAttrs::defaults_for(kind, uid, gid))
    }

    pub fn remove(&self, dir: &Node, name: &str) -> FsResult<()> {
        let parent = dir.as_directory()?;
        debug!(target: "sqlfs::node", parent = %parent.inode, name, "remove");
        self.descriptors.remove(parent.inode, name)
    }

    pub fn open(&self, node: &Node) -> FsResult<FileHandle> {
        match node {
            Node::File(descriptor) => {
                debug!(target: "sqlfs::node", inode = %descriptor.inode, "open");
                Ok(FileHandle::open(descriptor.clone()))
            }
            Node::Directory(_) => Err(FsError::IsADirectory),
        }
    }

    /// Up to `size` bytes from `offset`; empty at or past the end
    pub fn read(&self, handle: &FileHandle, offset: u64, size: usize) -> FsResult<Vec<u8>> {
        let content = self.contents.read_content(&handle.descriptor)?;
        let bytes = read_range(&content, offset, size).to_vec();
        debug!(target: "sqlfs::node", inode = %handle.inode(), offset, size, read = bytes.len(), "read");
        Ok(bytes)
    }

    /// Write `payload` at `offset`; always reports `payload.len()` bytes written
    pub fn write(&self, handle: &mut FileHandle, offset: u64, payload: &[u8]) -> FsResult<usize> {
        let updated = self.contents.write_at(&handle.descriptor, offset, payload)?;
        debug!(
            target: "sqlfs::node",
            inode = %updated.inode,
            offset,
            written = payload.len(),
            size = updated.size(),
            "write"
        );
        handle.descriptor = updated;
        Ok(payload.len())
    }

    /// Drop the handle; the store is not touched
    pub fn release(&self, handle: FileHandle) {
        debug!(target: "sqlfs::node", inode = %handle.inode(), "release");
    }
}

fn validate_name(name: &str) -> FsResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0') {
        return Err(FsError::InvalidName(name.to_string()));
    }
    Ok(())
}
