// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! File content blobs and the write law applied to them

use std::sync::Arc;

use tracing::debug;

use crate::error::{DbError, FsError, FsResult};
use crate::executor::{Executor, Statement};
use crate::types::Descriptor;

/// Content produced by writing `payload` at `offset` into `current`
///
/// The offset is clamped to the current length, so no gap is ever filled.
/// Everything after the written range is dropped: a write is seek, truncate,
/// then append.
pub fn apply_write(current: &[u8], offset: u64, payload: &[u8]) -> Vec<u8> {
    let start = clamp(offset, current.len());
    let mut next = Vec::with_capacity(start + payload.len());
    next.extend_from_slice(&current[..start]);
    next.extend_from_slice(payload);
    next
}

/// `content[offset..offset + size]`, clipped to the content length
pub fn read_range(content: &[u8], offset: u64, size: usize) -> &[u8] {
    let start = clamp(offset, content.len());
    let end = start.saturating_add(size).min(content.len());
    &content[start..end]
}

fn clamp(offset: u64, len: usize) -> usize {
    usize::try_from(offset).map_or(len, |o| o.min(len))
}

/// Read and replace access to file content
#[derive(Clone)]
pub struct ContentStore {
    executor: Arc<dyn Executor>,
}

impl ContentStore {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }

    /// Current bytes of `descriptor`'s content
    ///
    /// A missing content row is [`FsError::ContentMissing`], distinct from an
    /// empty file.
    pub fn read_content(&self, descriptor: &Descriptor) -> FsResult<Vec<u8>> {
        let row = self.executor.query_row(
            "SELECT data FROM {%t_prefix%}contents WHERE inode = ?",
            &[descriptor.inode.as_u64().into()],
        )?;
        match row {
            Some(row) => Ok(row.get_blob(0)?),
            None => Err(FsError::ContentMissing(descriptor.inode)),
        }
    }

    /// Overwrite content and size in one transaction, returning the updated descriptor
    pub fn replace_content(&self, descriptor: &Descriptor, data: &[u8]) -> FsResult<Descriptor> {
        let inode = descriptor.inode.as_u64();
        let size = data.len() as u64;
        let batch = [
            Statement::new("UPDATE {%t_prefix%}contents SET data = ? WHERE inode = ?")
                .bind(data)
                .bind(inode)
                .expect_rows(1),
            Statement::new("UPDATE {%t_prefix%}descriptors SET size = ? WHERE inode = ?")
                .bind(size)
                .bind(inode)
                .expect_rows(1),
        ];

        self.executor.exec_atomic(&batch).map_err(|err| match err {
            DbError::UnexpectedRowCount { .. } => FsError::ContentMissing(descriptor.inode),
            other => FsError::Storage(other),
        })?;

        debug!(target: "sqlfs::content", inode, size, "content replaced");
        let mut updated = descriptor.clone();
        updated.attrs.size = size;
        Ok(updated)
    }

    /// Read, apply [`apply_write`], replace; returns the updated descriptor
    pub fn write_at(&self, descriptor: &Descriptor, offset: u64, payload: &[u8]) -> FsResult<Descriptor> {
        let current = self.read_content(descriptor)?;
        let next = apply_write(&current, offset, payload);
        self.replace_content(descriptor, &next)
    }
}
