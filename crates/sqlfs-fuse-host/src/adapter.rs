// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! SQLFS FUSE adapter implementation
//!
//! Maps FUSE operations to Node Adapter calls.

#[cfg(not(all(feature = "fuse", target_os = "linux")))]
compile_error!("This module requires the 'fuse' feature on Linux");

use crate::dispatch::{WriteDispatcher, write_worker_count};
use crate::mapping::{InodeMap, KERNEL_ROOT_INO, component_name, errno_for};
use fuser::consts::FOPEN_DIRECT_IO;
use fuser::{
    FUSE_ROOT_ID, FileAttr, FileType, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use libc::{EBADF, EINVAL, ENOENT, c_int};
use sqlfs_core::{
    DescriptorType, Executor, FileHandle, FsConfig, FsResult, Inode, Node, NodeAdapter,
    NodeAttributes,
};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Attributes and entries are never cached by the kernel
const TTL: Duration = Duration::ZERO;

/// Environment override for the negotiated max_write
pub const MAX_WRITE_ENV: &str = "SQLFS_FUSE_MAX_WRITE";

const MAX_SUPPORTED_WRITE_BYTES: u32 = 16 * 1024 * 1024;

type NodeTable = Arc<Mutex<HashMap<u64, Node>>>;
type HandleTable = Arc<Mutex<HashMap<u64, FileHandle>>>;

fn locked<T>(table: &Mutex<T>) -> MutexGuard<'_, T> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// SQLFS FUSE filesystem adapter
pub struct SqlFsFuse {
    adapter: Arc<NodeAdapter>,
    inodes: InodeMap,
    /// Kernel inode -> last fetched node
    nodes: NodeTable,
    /// Open file handles by fh
    handles: HandleTable,
    next_fh: u64,
    max_write_bytes: u32,
    write_dispatcher: WriteDispatcher,
}

impl SqlFsFuse {
    /// Resolve the root and build the adapter; a missing root is fatal
    pub fn new(executor: Arc<dyn Executor>, config: &FsConfig) -> FsResult<Self> {
        let adapter = Arc::new(NodeAdapter::new(executor));
        let root = adapter.root()?;
        let inodes = InodeMap::new(root.inode());

        let mut nodes = HashMap::new();
        nodes.insert(KERNEL_ROOT_INO, root);

        Ok(Self {
            adapter,
            inodes,
            nodes: Arc::new(Mutex::new(nodes)),
            handles: Arc::new(Mutex::new(HashMap::new())),
            next_fh: 1,
            max_write_bytes: desired_max_write_bytes(config.max_write_bytes),
            write_dispatcher: WriteDispatcher::new(write_worker_count(config.write_threads)),
        })
    }

    /// Snapshot for `ino`, fetched from the store when the kernel asks for one we dropped
    fn resolve(&self, ino: u64) -> Result<Node, c_int> {
        if let Some(node) = locked(&self.nodes).get(&ino) {
            return Ok(node.clone());
        }
        match self.adapter.descriptors().find_by_inode(self.inodes.to_store(ino)) {
            Ok(Some(descriptor)) => {
                let node = Node::from_descriptor(descriptor);
                locked(&self.nodes).insert(ino, node.clone());
                Ok(node)
            }
            Ok(None) => Err(ENOENT),
            Err(err) => Err(errno_for(&err)),
        }
    }

    fn resolve_dir(&self, ino: u64) -> Result<Node, c_int> {
        let node = self.resolve(ino)?;
        match node {
            Node::Directory(_) => Ok(node),
            Node::File(_) => Err(libc::ENOTDIR),
        }
    }

    /// Record `node` and return its kernel attributes
    fn remember(&self, node: Node) -> FileAttr {
        let attr = self.kernel_attr(&self.adapter.attributes(&node));
        locked(&self.nodes).insert(attr.ino, node);
        attr
    }

    fn kernel_attr(&self, attrs: &NodeAttributes) -> FileAttr {
        let kind = match attrs.kind {
            DescriptorType::Dir => FileType::Directory,
            DescriptorType::File => FileType::RegularFile,
        };
        FileAttr {
            ino: self.inodes.to_kernel(attrs.inode),
            size: attrs.size,
            blocks: attrs.size.div_ceil(512),
            atime: SystemTime::UNIX_EPOCH,
            mtime: SystemTime::UNIX_EPOCH,
            ctime: SystemTime::UNIX_EPOCH,
            crtime: SystemTime::UNIX_EPOCH,
            kind,
            perm: attrs.permission.bits() as u16,
            nlink: match attrs.kind {
                DescriptorType::Dir => 2,
                DescriptorType::File => 1,
            },
            uid: attrs.uid,
            gid: attrs.gid,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }

    fn track_handle(&mut self, handle: FileHandle) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;
        locked(&self.handles).insert(fh, handle);
        fh
    }

    fn open_flags(handle: &FileHandle) -> u32 {
        if handle.direct_io() {
            FOPEN_DIRECT_IO
        } else {
            0
        }
    }

    fn remove_entry(&self, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match component_name(name) {
            Ok(name) => name,
            Err(errno) => return reply.error(errno),
        };
        let dir = match self.resolve_dir(parent) {
            Ok(dir) => dir,
            Err(errno) => return reply.error(errno),
        };
        match self.adapter.remove(&dir, name) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno_for(&err)),
        }
    }
}

/// Reload the snapshot of `ino` from the store after a write
///
/// Writes finish on several workers in any order. Reading the descriptor
/// while holding the table lock means the last refresh sees every write
/// committed before it.
fn refresh_snapshot(
    adapter: &NodeAdapter,
    nodes: &Mutex<HashMap<u64, Node>>,
    ino: u64,
    inode: Inode,
) -> FsResult<()> {
    let mut nodes = locked(nodes);
    if !nodes.contains_key(&ino) {
        return Ok(());
    }
    match adapter.descriptors().find_by_inode(inode)? {
        Some(descriptor) => {
            nodes.insert(ino, Node::from_descriptor(descriptor));
        }
        None => {
            nodes.remove(&ino);
        }
    }
    Ok(())
}

/// Configured max_write, overridden by the environment and capped
fn desired_max_write_bytes(configured: u32) -> u32 {
    std::env::var(MAX_WRITE_ENV)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(configured)
        .clamp(1, MAX_SUPPORTED_WRITE_BYTES)
}

fn configure_max_write(config: &mut fuser::KernelConfig, desired: u32) -> (u32, bool) {
    match config.set_max_write(desired) {
        Ok(_) => (desired, false),
        Err(limit) => {
            let _ = config.set_max_write(limit);
            (limit, true)
        }
    }
}

impl fuser::Filesystem for SqlFsFuse {
    fn init(&mut self, _req: &Request, config: &mut fuser::KernelConfig) -> Result<(), c_int> {
        let (max_write, clamped) = configure_max_write(config, self.max_write_bytes);
        if clamped {
            warn!(
                "Kernel limited max_write to {} bytes (desired {}).",
                max_write, self.max_write_bytes
            );
        } else {
            info!("Configured FUSE max_write={} bytes", max_write);
        }
        info!(
            "SQLFS FUSE adapter initialized (write_threads={})",
            self.write_dispatcher.worker_count()
        );
        Ok(())
    }

    fn destroy(&mut self) {
        info!("SQLFS FUSE adapter destroyed");
    }

    fn forget(&mut self, _req: &Request, ino: u64, _nlookup: u64) {
        if ino != FUSE_ROOT_ID {
            locked(&self.nodes).remove(&ino);
        }
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = match component_name(name) {
            Ok(name) => name,
            Err(errno) => return reply.error(errno),
        };
        let dir = match self.resolve_dir(parent) {
            Ok(dir) => dir,
            Err(errno) => return reply.error(errno),
        };
        match self.adapter.lookup(&dir, name) {
            Ok(node) => {
                let attr = self.remember(node);
                reply.entry(&TTL, &attr, 0);
            }
            Err(err) => reply.error(errno_for(&err)),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.resolve(ino) {
            Ok(node) => reply.attr(&TTL, &self.kernel_attr(&self.adapter.attributes(&node))),
            Err(errno) => reply.error(errno),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        // Attribute changes are not stored; report the current snapshot
        debug!(target: "sqlfs::fuse", ino, ?size, "setattr ignored");
        match self.resolve(ino) {
            Ok(node) => reply.attr(&TTL, &self.kernel_attr(&self.adapter.attributes(&node))),
            Err(errno) => reply.error(errno),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let dir = match self.resolve_dir(ino) {
            Ok(dir) => dir,
            Err(errno) => return reply.error(errno),
        };
        match self.adapter.list_children(&dir) {
            Ok(entries) => {
                for (i, entry) in entries.iter().enumerate().skip(offset.max(0) as usize) {
                    let kind = match entry.kind {
                        DescriptorType::Dir => FileType::Directory,
                        DescriptorType::File => FileType::RegularFile,
                    };
                    let entry_ino = self.inodes.to_kernel(entry.inode);
                    if reply.add(entry_ino, (i + 1) as i64, kind, &entry.name) {
                        break;
                    }
                }
                reply.ok();
            }
            Err(err) => reply.error(errno_for(&err)),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let name = match component_name(name) {
            Ok(name) => name,
            Err(errno) => return reply.error(errno),
        };
        let dir = match self.resolve_dir(parent) {
            Ok(dir) => dir,
            Err(errno) => return reply.error(errno),
        };
        match self.adapter.make_directory(&dir, name, req.uid(), req.gid()) {
            Ok(node) => {
                let attr = self.remember(node);
                reply.entry(&TTL, &attr, 0);
            }
            Err(err) => reply.error(errno_for(&err)),
        }
    }

    fn create(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let name = match component_name(name) {
            Ok(name) => name,
            Err(errno) => return reply.error(errno),
        };
        let dir = match self.resolve_dir(parent) {
            Ok(dir) => dir,
            Err(errno) => return reply.error(errno),
        };
        match self.adapter.make_file(&dir, name, req.uid(), req.gid()) {
            Ok((node, handle)) => {
                let attr = self.remember(node);
                let flags = Self::open_flags(&handle);
                let fh = self.track_handle(handle);
                reply.created(&TTL, &attr, 0, fh, flags);
            }
            Err(err) => reply.error(errno_for(&err)),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.remove_entry(parent, name, reply);
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.remove_entry(parent, name, reply);
    }

    fn open(&mut self, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
        let node = match self.resolve(ino) {
            Ok(node) => node,
            Err(errno) => return reply.error(errno),
        };
        match self.adapter.open(&node) {
            Ok(handle) => {
                let flags = Self::open_flags(&handle);
                let fh = self.track_handle(handle);
                reply.opened(fh, flags);
            }
            Err(err) => reply.error(errno_for(&err)),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            return reply.error(EINVAL);
        }
        let Some(handle) = locked(&self.handles).get(&fh).cloned() else {
            return reply.error(EBADF);
        };
        match self.adapter.read(&handle, offset as u64, size as usize) {
            Ok(bytes) => reply.data(&bytes),
            Err(err) => reply.error(errno_for(&err)),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if offset < 0 {
            return reply.error(EINVAL);
        }

        let adapter = Arc::clone(&self.adapter);
        let nodes = Arc::clone(&self.nodes);
        let handles = Arc::clone(&self.handles);
        let payload = data.to_vec();
        let offset = offset as u64;

        self.write_dispatcher.submit(move || {
            let Some(mut handle) = locked(&handles).get(&fh).cloned() else {
                return reply.error(EBADF);
            };
            match adapter.write(&mut handle, offset, &payload) {
                Ok(written) => {
                    if let Err(err) = refresh_snapshot(&adapter, &nodes, ino, handle.inode()) {
                        warn!(target: "sqlfs::write", ino, %err, "snapshot refresh failed");
                    }
                    if let Some(open) = locked(&handles).get_mut(&fh) {
                        *open = handle;
                    }
                    reply.written(written as u32);
                }
                Err(err) => reply.error(errno_for(&err)),
            }
        });
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        if let Some(handle) = locked(&self.handles).remove(&fh) {
            self.adapter.release(handle);
        }
        reply.ok();
    }
}
