// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for SQLFS Core

use std::io;

use crate::types::Inode;

/// Failures raised by a statement executor and its backing store
#[derive(thiserror::Error, Debug)]
pub enum DbError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("invalid dsn: {0}")]
    InvalidDsn(String),
    #[error("column {index}: expected {expected}")]
    Column { index: usize, expected: &'static str },
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),
    #[error("foreign key constraint violated: {0}")]
    ForeignKeyViolation(String),
    #[error("statement #{index} affected {actual} rows, expected {expected}")]
    UnexpectedRowCount {
        index: usize,
        expected: u64,
        actual: u64,
    },
    #[error("migration error: {0}")]
    Migration(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Core filesystem error type
#[derive(thiserror::Error, Debug)]
pub enum FsError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("root descriptor {0:?} not found")]
    RootNotFound(&'static str),
    #[error("content row missing for inode {0}")]
    ContentMissing(Inode),
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("name not allowed: {0:?}")]
    InvalidName(String),
    #[error("unsupported backend: {0}")]
    UnsupportedBackend(String),
    #[error("storage error: {0}")]
    Storage(#[from] DbError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type FsResult<T> = Result<T, FsError>;
