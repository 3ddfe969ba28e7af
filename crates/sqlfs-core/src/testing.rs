// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Test utilities for SQLFS Core
//!
//! [`provisioned_in_memory`] is public so integration tests and the host
//! crate can build a ready store without touching disk.

use std::sync::Arc;

use crate::error::FsResult;
use crate::executor::Executor;
use crate::schema::Migrator;
use crate::sqlite::SqliteExecutor;

#[cfg(test)]
pub mod mock_executor;

/// A private in-memory SQLite store with every migration applied
pub fn provisioned_in_memory() -> FsResult<Arc<dyn Executor>> {
    let executor: Arc<dyn Executor> = Arc::new(SqliteExecutor::in_memory()?);
    Migrator::new(Arc::clone(&executor)).up()?;
    Ok(executor)
}
