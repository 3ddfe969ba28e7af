// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! SQLFS Core: a directory tree stored in relational tables
//!
//! Directories and files are rows of a descriptor table; file bytes live in
//! a content table keyed by inode. The [`NodeAdapter`] maps host filesystem
//! callbacks onto the two stores.

pub mod backend;
pub mod config;
pub mod content;
pub mod descriptors;
pub mod error;
pub mod executor;
pub mod node;
pub mod schema;
pub mod sqlite;
pub mod testing;
pub mod types;

// Re-export key types
pub use backend::connect;
pub use config::{Dsn, FsConfig, StoreConfig};
pub use content::{ContentStore, apply_write, read_range};
pub use descriptors::DescriptorStore;
pub use error::{DbError, DbResult, FsError, FsResult};
pub use executor::{ExecResult, Executor, Row, Statement, Value};
pub use node::{DirEntry, FileHandle, Node, NodeAdapter, NodeAttributes};
pub use schema::{Direction, Migrator};
pub use sqlite::SqliteExecutor;
pub use types::{
    DEFAULT_DIR_PERMISSION, DEFAULT_FILE_PERMISSION, Descriptor, DescriptorAttrs, DescriptorType,
    Inode, Permission, ROOT_NAME,
};
