// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Executor construction from a DSN

use std::sync::Arc;

use tracing::info;

use crate::config::{Dsn, StoreConfig};
use crate::error::{FsError, FsResult};
use crate::executor::Executor;
use crate::sqlite::SqliteExecutor;

/// Open an executor for `dsn`
///
/// Only `sqlite` is implemented; any other scheme fails with
/// [`FsError::UnsupportedBackend`].
pub fn connect(dsn: &Dsn, config: &StoreConfig) -> FsResult<Arc<dyn Executor>> {
    match dsn.scheme() {
        "sqlite" => {
            let executor = SqliteExecutor::connect(dsn.clone(), config)?;
            info!(
                target: "sqlfs::backend",
                driver = executor.driver_name(),
                database = dsn.database(),
                "store connected"
            );
            Ok(Arc::new(executor))
        }
        other => Err(FsError::UnsupportedBackend(other.to_string())),
    }
}
